//! Nearest-neighbor assignment of probe-chip descriptors.

use std::collections::BTreeMap;

use nalgebra::DMatrix;

use crate::config::NnConfig;
use crate::error::QueryError;
use crate::index::DescriptorIndex;
use crate::pipeline::FailureReason;
use crate::store::FeatureStore;
use crate::types::ChipId;

/// Neighbor rows and squared distances, one matrix row per probe feature.
///
/// Both matrices are `n_features x (K + Knorm)`; within a row the columns
/// are ascending by distance. A chip without descriptors has zero rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbors {
    pub idx: DMatrix<usize>,
    pub dist: DMatrix<f32>,
}

impl Neighbors {
    /// Zero-row result with `k_total` columns.
    pub fn empty(k_total: usize) -> Self {
        Self {
            idx: DMatrix::from_element(0, k_total, 0),
            dist: DMatrix::from_element(0, k_total, 0.0),
        }
    }

    pub(crate) fn from_row_major(n: usize, k: usize, idx: Vec<usize>, dist: Vec<f32>) -> Self {
        Self {
            idx: DMatrix::from_row_slice(n, k, &idx),
            dist: DMatrix::from_row_slice(n, k, &dist),
        }
    }

    #[inline]
    pub fn n_features(&self) -> usize {
        self.idx.nrows()
    }

    #[inline]
    pub fn k_total(&self) -> usize {
        self.idx.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.n_features() == 0
    }
}

/// Per-chip neighbors plus the chips that could not be assigned.
#[derive(Debug, Clone, Default)]
pub struct Assignment {
    pub neighbors: BTreeMap<ChipId, Neighbors>,
    pub failures: BTreeMap<ChipId, FailureReason>,
}

/// Find `K + Knorm` neighbors for every descriptor of every probe chip.
///
/// A probe without descriptors maps to an explicit empty result, or under
/// `strict` to a [`FailureReason::NoDescriptors`] entry; other probes are
/// unaffected either way.
pub fn assign_neighbors(
    index: &DescriptorIndex,
    store: &dyn FeatureStore,
    probes: &[ChipId],
    nn: &NnConfig,
    strict: bool,
) -> Result<Assignment, QueryError> {
    let k_total = nn.k_total();
    let mut out = Assignment::default();
    let mut n_desc = 0usize;

    for &chip in probes {
        if out.neighbors.contains_key(&chip) || out.failures.contains_key(&chip) {
            continue;
        }
        let desc = store.chip_descriptors(chip)?;
        if desc.is_empty() {
            if strict {
                tracing::warn!(chip, "probe chip has no descriptors");
                out.failures.insert(chip, FailureReason::NoDescriptors);
            } else {
                out.neighbors.insert(chip, Neighbors::empty(k_total));
            }
            continue;
        }
        n_desc += desc.len();
        out.neighbors
            .insert(chip, index.query(&desc, k_total, nn.checks)?);
    }

    tracing::info!(
        n_chips = out.neighbors.len(),
        n_desc,
        n_neighbors = n_desc * k_total,
        n_failed = out.failures.len(),
        "assigned nearest neighbors"
    );
    Ok(out)
}
