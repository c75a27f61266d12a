//! Neighbor filtering: thresholds, linear re-scoring and impossible votes.

use std::collections::HashMap;

use nalgebra::DMatrix;

use crate::config::FilterConfig;
use crate::error::QueryError;
use crate::neighbors::Neighbors;
use crate::types::{ChipId, ImageId, NameId};
use crate::weights::{FilterWeights, WeightContext};

/// Score and validity of every top-K neighbor of one probe chip.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterResult {
    /// `n_features x K`; invalid entries keep their computed score.
    pub scores: DMatrix<f32>,
    pub valid: DMatrix<bool>,
}

impl FilterResult {
    pub fn n_valid(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }
}

/// Combine the probe's filter weights into per-neighbor scores and validity.
///
/// Scores start at 1. Each active filter may invalidate a neighbor through
/// its threshold and adds `weight * w` to its score. Votes the config rules
/// out (same image, same name, the probe itself) are invalidated last.
pub fn filter_neighbors(
    ctx: &WeightContext<'_>,
    probe: ChipId,
    neighbors: &Neighbors,
    weights: &FilterWeights,
    cfg: &FilterConfig,
) -> Result<FilterResult, QueryError> {
    let k = ctx.nn.k;
    let n = neighbors.n_features();
    let mut scores = DMatrix::from_element(n, k, 1.0f32);
    let mut valid = DMatrix::from_element(n, k, true);

    if cfg.enabled {
        for spec in cfg.active_filters() {
            let w = weights
                .get(&spec.name)
                .and_then(|per_chip| per_chip.get(&probe))
                .ok_or_else(|| {
                    QueryError::InvalidConfig(format!(
                        "no '{}' weights for chip {probe}",
                        spec.name
                    ))
                })?;
            let mut n_invalidated = 0usize;
            for i in 0..n {
                for c in 0..k {
                    let value = w.weights[(i, c)];
                    if let Some(thresh) = spec.threshold {
                        // NaN weights never pass a threshold.
                        if !(spec.sign * value <= spec.sign * thresh) && valid[(i, c)] {
                            valid[(i, c)] = false;
                            n_invalidated += 1;
                        }
                    }
                    if spec.weight != 0.0 {
                        scores[(i, c)] += spec.weight * value;
                    }
                }
            }
            tracing::debug!(probe, filter = %spec.name, n_invalidated, "applied filter");
        }
    }

    exclude_impossible_votes(ctx, probe, neighbors, cfg, &mut valid)?;

    Ok(FilterResult { scores, valid })
}

fn exclude_impossible_votes(
    ctx: &WeightContext<'_>,
    probe: ChipId,
    neighbors: &Neighbors,
    cfg: &FilterConfig,
    valid: &mut DMatrix<bool>,
) -> Result<(), QueryError> {
    if cfg.can_match_sameimg && cfg.can_match_samename && cfg.can_match_self {
        return Ok(());
    }
    let probe_image = ctx.store.chip_image(probe)?;
    let probe_name = ctx.store.chip_name(probe)?;
    let mut meta: HashMap<ChipId, (ImageId, Option<NameId>)> = HashMap::new();
    let (mut n_self, mut n_img, mut n_name) = (0usize, 0usize, 0usize);

    for i in 0..neighbors.n_features() {
        for c in 0..ctx.nn.k {
            if !valid[(i, c)] {
                continue;
            }
            let (chip, _) = ctx.index.resolve(neighbors.idx[(i, c)]);
            if !cfg.can_match_self && chip == probe {
                valid[(i, c)] = false;
                n_self += 1;
                continue;
            }
            let (image, name) = match meta.get(&chip) {
                Some(&m) => m,
                None => {
                    let m = (ctx.store.chip_image(chip)?, ctx.store.chip_name(chip)?);
                    meta.insert(chip, m);
                    m
                }
            };
            if !cfg.can_match_sameimg && image == probe_image {
                valid[(i, c)] = false;
                n_img += 1;
            } else if !cfg.can_match_samename && name.is_some() && name == probe_name {
                valid[(i, c)] = false;
                n_name += 1;
            }
        }
    }

    tracing::debug!(probe, n_self, n_img, n_name, "excluded impossible votes");
    Ok(())
}
