//! Reciprocity weight (`recip`).

use std::collections::HashMap;

use nalgebra::DMatrix;

use super::{NeighborWeighter, WeightArrays, WeightContext};
use crate::descriptor::Descriptors;
use crate::error::QueryError;
use crate::neighbors::Neighbors;
use crate::types::ChipId;

/// `nn_dist - d_r`, where `d_r` is the distance from the matched database
/// descriptor to its own `Knorm`-th nearest database neighbor.
///
/// Positive values mean the probe feature lies farther from the match than
/// the match's own neighborhood, i.e. the pair is not mutually nearest.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReciprocityWeighter;

impl NeighborWeighter for ReciprocityWeighter {
    fn name(&self) -> &str {
        "recip"
    }

    fn weigh(
        &self,
        ctx: &WeightContext<'_>,
        _probe: ChipId,
        neighbors: &Neighbors,
    ) -> Result<WeightArrays, QueryError> {
        let k = ctx.nn.k;
        let k_norm = ctx.nn.k_norm;
        if k_norm == 0 {
            return Err(QueryError::InvalidConfig(
                "filter 'recip' needs nn.k_norm >= 1".into(),
            ));
        }
        let n = neighbors.n_features();

        // Unique matched rows, in first-seen order.
        let mut slot: HashMap<usize, usize> = HashMap::new();
        let mut rows = Vec::new();
        for i in 0..n {
            for c in 0..k {
                let row = neighbors.idx[(i, c)];
                slot.entry(row).or_insert_with(|| {
                    rows.push(row);
                    rows.len() - 1
                });
            }
        }

        let radius = if rows.is_empty() {
            Vec::new()
        } else {
            let matched: Vec<&[u8]> = rows.iter().map(|&r| ctx.index.descriptor(r)).collect();
            let matched = Descriptors::from_rows(&matched).ok_or_else(|| {
                QueryError::Store("indexed descriptors have inconsistent dimensions".into())
            })?;
            // Column 0 is the row itself (distance 0).
            let own = ctx.index.query(&matched, k_norm + 1, ctx.nn.checks)?;
            (0..rows.len()).map(|r| own.dist[(r, k_norm)]).collect()
        };

        let mut weights = DMatrix::zeros(n, k);
        for i in 0..n {
            for c in 0..k {
                let r = slot[&neighbors.idx[(i, c)]];
                weights[(i, c)] = neighbors.dist[(i, c)] - radius[r];
            }
        }
        Ok(WeightArrays {
            weights,
            normalizers: None,
        })
    }
}
