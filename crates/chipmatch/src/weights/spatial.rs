//! Keypoint locality weight (`roidist`).

use std::collections::HashMap;

use nalgebra::DMatrix;

use super::{NeighborWeighter, WeightArrays, WeightContext};
use crate::error::QueryError;
use crate::neighbors::Neighbors;
use crate::store::FeatureStore;
use crate::types::{ChipId, Keypoint};

/// Distance between where a feature sits in the probe chip and where its
/// neighbor sits in its own chip, both in chip-normalized `[0, 1]` units.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoiDistanceWeighter;

impl NeighborWeighter for RoiDistanceWeighter {
    fn name(&self) -> &str {
        "roidist"
    }

    fn weigh(
        &self,
        ctx: &WeightContext<'_>,
        probe: ChipId,
        neighbors: &Neighbors,
    ) -> Result<WeightArrays, QueryError> {
        let k = ctx.nn.k;
        let n = neighbors.n_features();
        let mut weights = DMatrix::zeros(n, k);
        if n == 0 {
            return Ok(WeightArrays {
                weights,
                normalizers: None,
            });
        }

        let probe_pts = normalized_positions(ctx.store, probe)?;
        if probe_pts.len() != n {
            return Err(QueryError::Store(format!(
                "chip {probe}: {} keypoints for {n} neighbor rows",
                probe_pts.len()
            )));
        }

        let mut db_pts: HashMap<ChipId, Vec<[f32; 2]>> = HashMap::new();
        for i in 0..n {
            let [qx, qy] = probe_pts[i];
            for c in 0..k {
                let (chip, fx) = ctx.index.resolve(neighbors.idx[(i, c)]);
                if !db_pts.contains_key(&chip) {
                    db_pts.insert(chip, normalized_positions(ctx.store, chip)?);
                }
                let [dx, dy] = db_pts[&chip][fx];
                weights[(i, c)] = ((qx - dx).powi(2) + (qy - dy).powi(2)).sqrt();
            }
        }

        Ok(WeightArrays {
            weights,
            normalizers: None,
        })
    }
}

fn normalized_positions(store: &dyn FeatureStore, chip: ChipId) -> Result<Vec<[f32; 2]>, QueryError> {
    let [w, h] = store.chip_size(chip)?;
    let (w, h) = (w.max(1) as f32, h.max(1) as f32);
    Ok(store
        .chip_keypoints(chip)?
        .iter()
        .map(|kp: &Keypoint| [kp.x / w, kp.y / h])
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexParams, NnConfig};
    use crate::index::DescriptorIndex;
    use crate::test_utils::{chip_from_rows, store_from};
    use approx::assert_relative_eq;

    #[test]
    fn distance_uses_chip_normalized_positions() {
        let mut db = chip_from_rows(1, &[[0u8, 0]]);
        db.size = [100, 50];
        db.keypoints[0] = Keypoint::circular(50.0, 25.0, 2.0);
        let mut probe = chip_from_rows(2, &[[0u8, 1]]);
        probe.size = [200, 200];
        probe.keypoints[0] = Keypoint::circular(20.0, 20.0, 2.0);
        let store = store_from(vec![(1, db), (2, probe)]);

        let index =
            DescriptorIndex::build(&[1], &store, &IndexParams::default(), false, None).unwrap();
        let nn = NnConfig {
            k: 1,
            k_norm: 0,
            checks: 0,
        };
        let neighbors = index
            .query(&store.chip_descriptors(2).unwrap(), 1, 0)
            .unwrap();
        let ctx = WeightContext {
            store: &store,
            index: &index,
            nn: &nn,
        };
        let w = RoiDistanceWeighter.weigh(&ctx, 2, &neighbors).unwrap();
        // (0.1, 0.1) vs (0.5, 0.5)
        assert_relative_eq!(w.weights[(0, 0)], 0.32f32.sqrt(), epsilon = 1e-6);
        assert!(w.normalizers.is_none());
    }
}
