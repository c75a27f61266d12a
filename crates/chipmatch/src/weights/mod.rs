//! Per-neighbor weight functions.
//!
//! A [`NeighborWeighter`] turns a probe chip's [`Neighbors`] into one weight
//! per top-K neighbor. Weighters are looked up by name in a
//! [`FilterRegistry`]; the filter config decides which ones run and how
//! their weights affect validity and score.

mod normalized;
mod reciprocal;
mod spatial;

use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::config::{FilterConfig, NnConfig};
use crate::error::QueryError;
use crate::index::DescriptorIndex;
use crate::neighbors::{Assignment, Neighbors};
use crate::store::FeatureStore;
use crate::types::ChipId;

pub use normalized::{DistanceRatioWeighter, RatioKind};
pub use reciprocal::ReciprocityWeighter;
pub use spatial::RoiDistanceWeighter;

/// Which normalizer column a distance-ratio weight divides by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizerRule {
    /// Column `K`, the first neighbor past the voting ones.
    #[default]
    First,
    /// Column `K + Knorm - 1`.
    Last,
    /// First normalizer whose identity differs from all top-K identities.
    Name,
    /// First normalizer whose source image differs from all top-K images.
    Image,
}

impl NormalizerRule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Last => "last",
            Self::Name => "name",
            Self::Image => "image",
        }
    }
}

/// Everything a weighter may consult besides the neighbors themselves.
#[derive(Clone, Copy)]
pub struct WeightContext<'a> {
    pub store: &'a dyn FeatureStore,
    pub index: &'a DescriptorIndex,
    pub nn: &'a NnConfig,
}

/// Output of one weighter for one probe chip.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightArrays {
    /// `n_features x K`.
    pub weights: DMatrix<f32>,
    /// Index row used as normalizer per feature, for weighters that have one.
    pub normalizers: Option<Vec<usize>>,
}

/// A named per-neighbor weight function.
pub trait NeighborWeighter: Send + Sync {
    fn name(&self) -> &str;

    fn weigh(
        &self,
        ctx: &WeightContext<'_>,
        probe: ChipId,
        neighbors: &Neighbors,
    ) -> Result<WeightArrays, QueryError>;
}

/// `filter name -> probe chip -> weights`.
pub type FilterWeights = BTreeMap<String, BTreeMap<ChipId, WeightArrays>>;

/// Name-to-weighter lookup.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    weighters: BTreeMap<String, Arc<dyn NeighborWeighter>>,
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.weighters.keys()).finish()
    }
}

impl FilterRegistry {
    /// Registry holding `ratio`, `lnbnn`, `lnrat`, `roidist` and `recip`.
    pub fn with_builtins(rule: NormalizerRule) -> Self {
        let mut reg = Self::default();
        for kind in [RatioKind::Ratio, RatioKind::Lnbnn, RatioKind::Lnrat] {
            reg.register(Arc::new(DistanceRatioWeighter::new(kind, rule)));
        }
        reg.register(Arc::new(RoiDistanceWeighter));
        reg.register(Arc::new(ReciprocityWeighter));
        reg
    }

    /// Add or replace a weighter under its own name.
    pub fn register(&mut self, weighter: Arc<dyn NeighborWeighter>) {
        self.weighters.insert(weighter.name().to_string(), weighter);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn NeighborWeighter>> {
        self.weighters.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.weighters.keys().map(String::as_str)
    }

    /// Every active filter in `cfg` must name a registered weighter.
    pub fn check(&self, cfg: &FilterConfig) -> Result<(), QueryError> {
        match cfg.active_filters().find(|f| !self.weighters.contains_key(&f.name)) {
            Some(spec) => Err(QueryError::InvalidConfig(format!(
                "unknown filter '{}' (registered: {})",
                spec.name,
                self.names().collect::<Vec<_>>().join(", ")
            ))),
            None => Ok(()),
        }
    }
}

/// Run every active weighter over every assigned probe chip.
///
/// Returns an empty mapping when weighting is disabled.
pub fn weight_neighbors(
    ctx: &WeightContext<'_>,
    registry: &FilterRegistry,
    assignment: &Assignment,
    cfg: &FilterConfig,
) -> Result<FilterWeights, QueryError> {
    let mut out = FilterWeights::new();
    if !cfg.enabled {
        return Ok(out);
    }
    for spec in cfg.active_filters() {
        if out.contains_key(&spec.name) {
            continue;
        }
        let weighter = registry.get(&spec.name).ok_or_else(|| {
            QueryError::InvalidConfig(format!("unknown filter '{}'", spec.name))
        })?;
        let mut per_chip = BTreeMap::new();
        for (&chip, neighbors) in &assignment.neighbors {
            per_chip.insert(chip, weighter.weigh(ctx, chip, neighbors)?);
        }
        tracing::debug!(filter = %spec.name, n_chips = per_chip.len(), "computed neighbor weights");
        out.insert(spec.name.clone(), per_chip);
    }
    Ok(out)
}
