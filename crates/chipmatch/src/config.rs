//! Query configuration: one section per pipeline stage.
//!
//! Every section deserializes with `#[serde(default)]`, so a JSON config only
//! needs the fields it overrides. [`QueryConfig::uid`] renders the settings
//! that influence results into a stable string used for cache keys and logs.

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::scoring::ScoreMethod;
use crate::weights::NormalizerRule;

/// Nearest-neighbor assignment parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NnConfig {
    /// Number of neighbors per query descriptor that may vote.
    pub k: usize,
    /// Extra neighbors past `k` used only as normalizers.
    pub k_norm: usize,
    /// Leaf points examined per query descriptor (0 = exact search).
    pub checks: usize,
}

impl Default for NnConfig {
    fn default() -> Self {
        Self {
            k: 4,
            k_norm: 1,
            checks: 1024,
        }
    }
}

impl NnConfig {
    /// Total neighbors requested per descriptor.
    #[inline]
    pub fn k_total(&self) -> usize {
        self.k + self.k_norm
    }

    pub fn uid(&self) -> String {
        format!("_NN(K{},Kn{},cks{})", self.k, self.k_norm, self.checks)
    }
}

/// Randomized kd-forest build parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexParams {
    /// Number of randomized trees in the forest.
    pub trees: usize,
    /// Maximum number of rows stored in one leaf.
    pub leaf_max_size: usize,
    /// Base seed; tree `t` uses `seed + t`.
    pub seed: u64,
    /// Ignore cached indices (memory and disk) and rebuild.
    pub force_recompute: bool,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            trees: 4,
            leaf_max_size: 10,
            seed: 42,
            force_recompute: false,
        }
    }
}

impl IndexParams {
    /// Build-parameter fragment of the index cache key.
    pub fn uid(&self) -> String {
        format!(
            "kdtree_trees{}_leaf{}_seed{}",
            self.trees, self.leaf_max_size, self.seed
        )
    }
}

/// How one named weight array contributes to validity and score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Registered weighter name (`ratio`, `lnbnn`, `lnrat`, `roidist`, `recip`, ...).
    pub name: String,
    /// `+1`: smaller weights are better; `-1`: larger weights are better.
    #[serde(default = "default_sign")]
    pub sign: f32,
    /// A neighbor stays valid only if `sign * w <= sign * threshold`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    /// Linear contribution: `score += weight * w`.
    #[serde(default)]
    pub weight: f32,
}

fn default_sign() -> f32 {
    1.0
}

impl FilterSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sign: 1.0,
            threshold: None,
            weight: 0.0,
        }
    }

    pub fn with_threshold(mut self, sign: f32, threshold: f32) -> Self {
        self.sign = sign;
        self.threshold = Some(threshold);
        self
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    /// A filter participates only if it can invalidate or re-score.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.threshold.is_some() || self.weight != 0.0
    }

    fn uid(&self) -> String {
        let thresh = self
            .threshold
            .map(|t| format!("{}{}", if self.sign < 0.0 { ">" } else { "<" }, t))
            .unwrap_or_default();
        format!("{}{}_{}", self.name, thresh, self.weight)
    }
}

/// Neighbor weighting and filtering parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Compute weights at all. When off every neighbor scores 1.
    pub enabled: bool,
    /// Normalizer column selection for distance-ratio style weights.
    pub normalizer_rule: NormalizerRule,
    pub filters: Vec<FilterSpec>,
    /// Allow votes for chips cropped from the query chip's image.
    pub can_match_sameimg: bool,
    /// Allow votes for chips sharing the query chip's identity label.
    pub can_match_samename: bool,
    /// Allow votes for the query chip itself.
    pub can_match_self: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            normalizer_rule: NormalizerRule::First,
            filters: vec![FilterSpec::new("lnbnn").with_weight(1.0)],
            can_match_sameimg: false,
            can_match_samename: true,
            can_match_self: true,
        }
    }
}

impl FilterConfig {
    /// Filters that can change validity or score, in config order.
    pub fn active_filters(&self) -> impl Iterator<Item = &FilterSpec> + '_ {
        self.filters.iter().filter(|f| f.is_active())
    }

    pub fn uid(&self) -> String {
        // Impossible-vote exclusion applies even when weighting is off.
        let weighting = if self.enabled {
            let filters: Vec<String> = self.active_filters().map(FilterSpec::uid).collect();
            format!("{},{}", self.normalizer_rule.as_str(), filters.join(","))
        } else {
            "off".to_string()
        };
        format!(
            "_FILT({},img{},name{},self{})",
            weighting,
            u8::from(self.can_match_sameimg),
            u8::from(self.can_match_samename),
            u8::from(self.can_match_self),
        )
    }
}

/// Spatial verification parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialVerifyConfig {
    pub enabled: bool,
    /// Maximum squared reprojection error as a fraction of the squared
    /// matching-region diagonal. `None` disables verification.
    pub xy_thresh: Option<f64>,
    /// Lower bound on the per-correspondence scale change relative to the
    /// hypothesis scale.
    pub scale_thresh_low: f64,
    /// Upper bound on the per-correspondence scale change relative to the
    /// hypothesis scale.
    pub scale_thresh_high: f64,
    /// Number of top pre-scored candidates that are verified.
    pub n_shortlist: usize,
    /// Minimum inlier count for a candidate to survive.
    pub min_n_inliers: usize,
    /// Stop after the affine stage instead of fitting a homography.
    pub just_affine: bool,
    /// Normalize thresholds by the full chip extent instead of the extent of
    /// the matched keypoints.
    pub use_chip_extent: bool,
    /// Scoring rule used to rank candidates before verification.
    pub prescore_method: ScoreMethod,
    /// Cap on affine hypotheses per candidate; a seeded random subset is
    /// tried when a candidate has more correspondences.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_hypotheses: Option<usize>,
    pub seed: u64,
}

impl Default for SpatialVerifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            xy_thresh: Some(0.002),
            scale_thresh_low: 0.5,
            scale_thresh_high: 2.0,
            n_shortlist: 50,
            min_n_inliers: 4,
            just_affine: false,
            use_chip_extent: false,
            prescore_method: ScoreMethod::Csum,
            max_hypotheses: None,
            seed: 0,
        }
    }
}

impl SpatialVerifyConfig {
    /// True when verification actually runs.
    #[inline]
    pub fn is_on(&self) -> bool {
        self.enabled && self.xy_thresh.is_some()
    }

    pub fn uid(&self) -> String {
        let Some(xy_thresh) = self.xy_thresh.filter(|_| self.is_on()) else {
            return "_SV(off)".to_string();
        };
        let hypotheses = self
            .max_hypotheses
            .map(|n| format!(",hyp{}@{}", n, self.seed))
            .unwrap_or_default();
        format!(
            "_SV({},{},{},{},{},{}{}{}{})",
            self.n_shortlist,
            xy_thresh,
            self.scale_thresh_low,
            self.scale_thresh_high,
            self.min_n_inliers,
            self.prescore_method,
            if self.just_affine { ",affine" } else { "" },
            if self.use_chip_extent { ",cdl" } else { "" },
            hypotheses,
        )
    }
}

/// How feature matches are grouped into chip matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    /// One query chip against the whole database index.
    #[default]
    VsMany,
    /// A single query chip indexed on its own, probed by each database chip.
    VsOne,
}

impl QueryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VsMany => "vsmany",
            Self::VsOne => "vsone",
        }
    }
}

/// Aggregation and final scoring parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    pub score_method: ScoreMethod,
    pub query_type: QueryType,
}

impl AggregateConfig {
    pub fn uid(&self) -> String {
        format!("_AGG({},{})", self.score_method, self.query_type.as_str())
    }
}

/// Top-level query configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub nn: NnConfig,
    pub index: IndexParams,
    pub filter: FilterConfig,
    pub sv: SpatialVerifyConfig,
    pub agg: AggregateConfig,
    /// Fail on chips without descriptors instead of treating them as empty.
    pub strict: bool,
}

impl QueryConfig {
    /// Load a (partial) config from JSON; missing fields keep their defaults.
    pub fn from_json_str(data: &str) -> Result<Self, QueryError> {
        let config: Self = serde_json::from_str(data).map_err(|e| {
            // Score methods are validated while parsing; keep that error kind.
            let msg = e.to_string();
            match msg.strip_prefix("unknown score method '") {
                Some(rest) => QueryError::UnknownScoreMethod(
                    rest.split('\'').next().unwrap_or_default().to_string(),
                ),
                None => QueryError::InvalidConfig(msg),
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check numeric ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.nn.k == 0 {
            return Err(QueryError::InvalidConfig("nn.k must be >= 1".into()));
        }
        if self.nn.k > u16::MAX as usize {
            return Err(QueryError::InvalidConfig(format!(
                "nn.k must be <= {}",
                u16::MAX
            )));
        }
        if self.index.trees == 0 {
            return Err(QueryError::InvalidConfig("index.trees must be >= 1".into()));
        }
        if self.index.leaf_max_size == 0 {
            return Err(QueryError::InvalidConfig(
                "index.leaf_max_size must be >= 1".into(),
            ));
        }
        for spec in &self.filter.filters {
            if !spec.sign.is_finite() || spec.sign == 0.0 {
                return Err(QueryError::InvalidConfig(format!(
                    "filter '{}': sign must be finite and non-zero",
                    spec.name
                )));
            }
        }
        if let Some(xy) = self.sv.xy_thresh {
            if !xy.is_finite() || xy <= 0.0 {
                return Err(QueryError::InvalidConfig(
                    "sv.xy_thresh must be finite and > 0".into(),
                ));
            }
        }
        if !(self.sv.scale_thresh_low > 0.0 && self.sv.scale_thresh_low < self.sv.scale_thresh_high)
        {
            return Err(QueryError::InvalidConfig(
                "sv.scale_thresh_low must be > 0 and < sv.scale_thresh_high".into(),
            ));
        }
        Ok(())
    }

    /// Stable identifier of every result-affecting setting.
    pub fn uid(&self) -> String {
        format!(
            "{}_INDEX({}){}{}{}{}",
            self.nn.uid(),
            self.index.uid(),
            self.filter.uid(),
            self.sv.uid(),
            self.agg.uid(),
            if self.strict { "_strict" } else { "" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = QueryConfig::from_json_str(r#"{"nn":{"k":1},"sv":{"enabled":false}}"#)
            .expect("valid config");
        assert_eq!(cfg.nn.k, 1);
        assert_eq!(cfg.nn.k_norm, 1);
        assert!(!cfg.sv.is_on());
        assert_eq!(cfg.agg.score_method, ScoreMethod::Csum);
    }

    #[test]
    fn unknown_score_method_fails_at_parse_time() {
        let err = QueryConfig::from_json_str(r#"{"agg":{"score_method":"median"}}"#)
            .expect_err("unknown method");
        assert_eq!(err, QueryError::UnknownScoreMethod("median".into()));
    }

    #[test]
    fn validate_rejects_inverted_scale_bounds() {
        let mut cfg = QueryConfig::default();
        cfg.sv.scale_thresh_low = 3.0;
        assert!(matches!(cfg.validate(), Err(QueryError::InvalidConfig(_))));
    }

    #[test]
    fn uid_changes_with_result_affecting_settings() {
        let base = QueryConfig::default();
        let mut other = base.clone();
        other.filter.can_match_sameimg = true;
        assert_ne!(base.uid(), other.uid());

        let mut forced = base.clone();
        forced.index.force_recompute = true;
        assert_eq!(base.uid(), forced.uid());
    }

    #[test]
    fn uid_keeps_exclusion_rules_when_weighting_is_off() {
        let mut off = QueryConfig::default();
        off.filter.enabled = false;
        let mut sameimg = off.clone();
        sameimg.filter.can_match_sameimg = true;
        assert_ne!(off.uid(), sameimg.uid());
        assert!(off.uid().contains("_FILT(off,img0,name1,self1)"));
    }

    #[test]
    fn uid_tracks_hypothesis_sampling() {
        let base = QueryConfig::default();
        let mut capped = base.clone();
        capped.sv.max_hypotheses = Some(1);
        capped.sv.seed = 7;
        assert_ne!(base.uid(), capped.uid());

        let mut reseeded = capped.clone();
        reseeded.sv.seed = 8;
        assert_ne!(capped.uid(), reseeded.uid());
    }

    #[test]
    fn inactive_filters_are_skipped() {
        let mut cfg = FilterConfig::default();
        cfg.filters.push(FilterSpec::new("ratio"));
        cfg.filters
            .push(FilterSpec::new("roidist").with_threshold(1.0, 0.5));
        let names: Vec<&str> = cfg.active_filters().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["lnbnn", "roidist"]);
    }
}
