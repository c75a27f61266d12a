use std::collections::BTreeMap;

use serde::Serialize;

use crate::chipmatch::ChipMatch;
use crate::types::ChipId;

/// Why a chip produced no result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The chip has no descriptors and the query ran in strict mode.
    NoDescriptors,
}

/// Outcome of matching one query chip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub query: ChipId,
    /// Uid of the configuration that produced this result.
    pub uid: String,
    /// Final score per surviving candidate chip.
    pub scores: BTreeMap<ChipId, f64>,
    /// Correspondences backing `scores` (verified when verification is on).
    pub chipmatch: ChipMatch,
    /// `filter -> probe chip -> normalizer row per feature`, for the
    /// filters that select normalizers.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub filter_meta: BTreeMap<String, BTreeMap<ChipId, Vec<usize>>>,
}

impl QueryResult {
    /// Result with no candidates.
    pub fn empty(query: ChipId, uid: String) -> Self {
        Self {
            query,
            uid,
            scores: BTreeMap::new(),
            chipmatch: ChipMatch::default(),
            filter_meta: BTreeMap::new(),
        }
    }

    /// Candidates by descending score; ties by ascending chip id.
    pub fn ranked(&self) -> Vec<(ChipId, f64)> {
        let mut out: Vec<(ChipId, f64)> = self.scores.iter().map(|(&c, &s)| (c, s)).collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        out
    }
}

/// Results of one `run_query` call.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct QueryResults {
    pub results: BTreeMap<ChipId, QueryResult>,
    /// Chips skipped under strict mode; the rest of the batch still ran.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub failures: BTreeMap<ChipId, FailureReason>,
}

impl QueryResults {
    pub fn get(&self, query: ChipId) -> Option<&QueryResult> {
        self.results.get(&query)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranked_breaks_ties_by_chip_id() {
        let mut r = QueryResult::empty(1, "uid".into());
        r.scores.insert(9, 2.0);
        r.scores.insert(4, 5.0);
        r.scores.insert(3, 2.0);
        assert_eq!(r.ranked(), vec![(4, 5.0), (3, 2.0), (9, 2.0)]);
    }

    #[test]
    fn failures_serialize_in_snake_case() {
        let mut out = QueryResults::default();
        out.failures.insert(7, FailureReason::NoDescriptors);
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["failures"]["7"], "no_descriptors");
    }
}
