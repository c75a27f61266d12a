//! Chip-match scoring.
//!
//! [`ScoreMethod`] is parsed once, when the config is read; unknown names
//! never reach the pipeline.

mod coverage;
mod positional;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::chipmatch::ChipMatch;
use crate::error::QueryError;
use crate::store::FeatureStore;
use crate::types::ChipId;

/// How candidate chips are scored from their correspondences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScoreMethod {
    /// Sum of correspondence scores.
    #[default]
    Csum,
    /// Rank-centrality (Plackett-Luce style) aggregation of per-feature rankings.
    Pl,
    /// Borda count over per-feature rankings.
    Borda,
    /// One vote per ranked alternative.
    Topk,
    /// Query-chip coverage.
    Coverage0,
    /// Candidate-chip coverage.
    Coverage1,
    /// Geometric mean of both coverages.
    Coverage2,
}

impl ScoreMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csum => "csum",
            Self::Pl => "pl",
            Self::Borda => "borda",
            Self::Topk => "topk",
            Self::Coverage0 => "coverage0",
            Self::Coverage1 => "coverage1",
            Self::Coverage2 => "coverage2",
        }
    }
}

impl FromStr for ScoreMethod {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        // A trailing `w` is accepted as an alias of the base method.
        let base = match name.strip_suffix('w') {
            Some(b) if !b.is_empty() => b,
            _ => name.as_str(),
        };
        match base {
            "csum" => Ok(Self::Csum),
            "pl" => Ok(Self::Pl),
            "borda" => Ok(Self::Borda),
            "topk" => Ok(Self::Topk),
            "coverage" | "coverage0" => Ok(Self::Coverage0),
            "coverage1" => Ok(Self::Coverage1),
            "coverage2" => Ok(Self::Coverage2),
            _ => Err(QueryError::UnknownScoreMethod(s.to_string())),
        }
    }
}

impl TryFrom<String> for ScoreMethod {
    type Error = QueryError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ScoreMethod> for String {
    fn from(m: ScoreMethod) -> Self {
        m.as_str().to_string()
    }
}

impl fmt::Display for ScoreMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lookups and parameters scoring may need.
#[derive(Clone, Copy)]
pub struct ScoreContext<'a> {
    pub store: &'a dyn FeatureStore,
    /// Voting neighbors per feature (the `K` of the assignment).
    pub k: usize,
}

/// Score every candidate of `cm`. The map holds exactly the candidate chips.
pub fn score_chipmatch(
    ctx: &ScoreContext<'_>,
    method: ScoreMethod,
    query: ChipId,
    cm: &ChipMatch,
) -> Result<BTreeMap<ChipId, f64>, QueryError> {
    let scores = match method {
        ScoreMethod::Csum => cm
            .candidates()
            .iter()
            .map(|c| (c.chip, c.score_sum()))
            .collect(),
        ScoreMethod::Pl | ScoreMethod::Borda | ScoreMethod::Topk => {
            positional::score(ctx, method, cm)?
        }
        ScoreMethod::Coverage0 | ScoreMethod::Coverage1 | ScoreMethod::Coverage2 => {
            coverage::score(ctx, method, query, cm)?
        }
    };
    tracing::debug!(query, method = %method, n_scored = scores.len(), "scored chip match");
    Ok(scores)
}
