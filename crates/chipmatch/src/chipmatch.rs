//! Aggregation of valid neighbor votes into per-candidate correspondences.
//!
//! [`ChipMatchBuilder`] accumulates votes in first-seen candidate order;
//! [`ChipMatchBuilder::freeze`] turns them into an immutable [`ChipMatch`]
//! whose candidates all have co-indexed arrays of at least
//! [`MIN_CORRESPONDENCES`] entries.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::Serialize;

use crate::error::QueryError;
use crate::filter::FilterResult;
use crate::index::DescriptorIndex;
use crate::neighbors::Neighbors;
use crate::types::ChipId;

/// Candidates with fewer correspondences are dropped at freeze time.
pub const MIN_CORRESPONDENCES: usize = 4;

/// All correspondences between the query chip and one candidate chip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateMatch {
    pub chip: ChipId,
    /// `(query feature, candidate feature)` pairs.
    pub fm: Vec<[u32; 2]>,
    /// Per-correspondence score.
    pub fs: Vec<f32>,
    /// Neighbor rank that produced the correspondence.
    pub fk: Vec<u16>,
}

impl CandidateMatch {
    fn new(chip: ChipId) -> Self {
        Self {
            chip,
            fm: Vec::new(),
            fs: Vec::new(),
            fk: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fm.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fm.is_empty()
    }

    /// Sum of correspondence scores.
    pub fn score_sum(&self) -> f64 {
        self.fs.iter().map(|&s| s as f64).sum()
    }

    /// Correspondences at `keep` (in the given order).
    pub fn subset(&self, keep: &[usize]) -> Self {
        Self {
            chip: self.chip,
            fm: keep.iter().map(|&i| self.fm[i]).collect(),
            fs: keep.iter().map(|&i| self.fs[i]).collect(),
            fk: keep.iter().map(|&i| self.fk[i]).collect(),
        }
    }
}

/// Frozen per-query aggregation: candidates in first-seen order.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct ChipMatch {
    candidates: Vec<CandidateMatch>,
}

impl ChipMatch {
    pub fn candidates(&self) -> &[CandidateMatch] {
        &self.candidates
    }

    pub fn get(&self, chip: ChipId) -> Option<&CandidateMatch> {
        self.candidates.iter().find(|c| c.chip == chip)
    }

    pub fn chip_ids(&self) -> impl Iterator<Item = ChipId> + '_ {
        self.candidates.iter().map(|c| c.chip)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Total correspondences over all candidates.
    pub fn n_correspondences(&self) -> usize {
        self.candidates.iter().map(CandidateMatch::len).sum()
    }
}

/// Growable accumulator for one query chip.
#[derive(Debug, Default)]
pub struct ChipMatchBuilder {
    candidates: Vec<CandidateMatch>,
    slot: HashMap<ChipId, usize>,
}

impl ChipMatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one correspondence to `chip`'s arrays.
    pub fn push(&mut self, chip: ChipId, qfx: u32, fx: u32, fs: f32, fk: u16) {
        let cand = self.candidate_mut(chip);
        cand.fm.push([qfx, fx]);
        cand.fs.push(fs);
        cand.fk.push(fk);
    }

    /// Append a whole (e.g. verified) candidate.
    pub fn push_candidate(&mut self, other: CandidateMatch) {
        let cand = self.candidate_mut(other.chip);
        cand.fm.extend(other.fm);
        cand.fs.extend(other.fs);
        cand.fk.extend(other.fk);
    }

    fn candidate_mut(&mut self, chip: ChipId) -> &mut CandidateMatch {
        let idx = *self.slot.entry(chip).or_insert_with(|| {
            self.candidates.push(CandidateMatch::new(chip));
            self.candidates.len() - 1
        });
        &mut self.candidates[idx]
    }

    /// Drop candidates below [`MIN_CORRESPONDENCES`] and freeze the rest.
    pub fn freeze(self) -> ChipMatch {
        let before = self.candidates.len();
        let candidates: Vec<CandidateMatch> = self
            .candidates
            .into_iter()
            .filter(|c| c.len() >= MIN_CORRESPONDENCES)
            .collect();
        tracing::trace!(before, after = candidates.len(), "froze chip match");
        ChipMatch { candidates }
    }
}

/// One query chip against many database chips: group the probe's valid
/// votes by the database chip that owns each neighbor.
pub fn aggregate_vsmany(
    index: &DescriptorIndex,
    neighbors: &Neighbors,
    filtered: &FilterResult,
) -> ChipMatch {
    let mut builder = ChipMatchBuilder::new();
    let (n, k) = filtered.valid.shape();
    for qfx in 0..n {
        for rank in 0..k {
            if !filtered.valid[(qfx, rank)] {
                continue;
            }
            let (chip, fx) = index.resolve(neighbors.idx[(qfx, rank)]);
            builder.push(
                chip,
                qfx as u32,
                fx as u32,
                filtered.scores[(qfx, rank)],
                rank as u16,
            );
        }
    }
    builder.freeze()
}

/// One query chip indexed on its own, probed by each database chip.
///
/// Every probe's valid votes land on the query chip; they are grouped under
/// the probe chip id with pairs oriented `(query feature, probe feature)`.
pub fn aggregate_vsone(
    index: &DescriptorIndex,
    query: ChipId,
    probes: &BTreeMap<ChipId, (&Neighbors, &FilterResult)>,
) -> Result<ChipMatch, QueryError> {
    let mut builder = ChipMatchBuilder::new();
    for (&probe, &(neighbors, filtered)) in probes {
        let (n, k) = filtered.valid.shape();
        for pfx in 0..n {
            for rank in 0..k {
                if !filtered.valid[(pfx, rank)] {
                    continue;
                }
                let (owner, qfx) = index.resolve(neighbors.idx[(pfx, rank)]);
                if owner != query {
                    return Err(QueryError::InvalidConfig(format!(
                        "one-vs-one index holds chip {owner}, expected query chip {query}"
                    )));
                }
                builder.push(
                    probe,
                    qfx as u32,
                    pfx as u32,
                    filtered.scores[(pfx, rank)],
                    rank as u16,
                );
            }
        }
    }
    Ok(builder.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_drops_small_candidates_and_keeps_first_seen_order() {
        let mut b = ChipMatchBuilder::new();
        for i in 0..5 {
            b.push(30, i, i, 1.0, 0);
        }
        for i in 0..3 {
            b.push(10, i, i, 1.0, 0);
        }
        for i in 0..4 {
            b.push(20, i, i + 1, 0.5, 1);
        }
        let cm = b.freeze();
        assert_eq!(cm.chip_ids().collect::<Vec<_>>(), vec![30, 20]);
        for cand in cm.candidates() {
            assert!(cand.len() >= MIN_CORRESPONDENCES);
            assert_eq!(cand.fm.len(), cand.fs.len());
            assert_eq!(cand.fs.len(), cand.fk.len());
        }
        assert_eq!(cm.get(20).unwrap().fm[2], [2, 3]);
        assert_eq!(cm.n_correspondences(), 9);
    }

    #[test]
    fn push_candidate_appends_to_existing_slot() {
        let mut b = ChipMatchBuilder::new();
        b.push(1, 0, 0, 1.0, 0);
        let mut extra = CandidateMatch::new(1);
        for i in 1..4 {
            extra.fm.push([i, i]);
            extra.fs.push(2.0);
            extra.fk.push(0);
        }
        b.push_candidate(extra);
        let cm = b.freeze();
        assert_eq!(cm.len(), 1);
        assert_eq!(cm.candidates()[0].score_sum(), 7.0);
    }

    #[test]
    fn subset_keeps_arrays_co_indexed() {
        let mut c = CandidateMatch::new(5);
        for i in 0..6u32 {
            c.fm.push([i, 10 + i]);
            c.fs.push(i as f32);
            c.fk.push(i as u16);
        }
        let s = c.subset(&[4, 1]);
        assert_eq!(s.fm, vec![[4, 14], [1, 11]]);
        assert_eq!(s.fs, vec![4.0, 1.0]);
        assert_eq!(s.fk, vec![4, 1]);
    }
}
