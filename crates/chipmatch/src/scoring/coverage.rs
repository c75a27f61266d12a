//! Coverage scoring: how much of a chip the matched keypoints explain.

use std::collections::BTreeMap;

use super::{ScoreContext, ScoreMethod};
use crate::chipmatch::{CandidateMatch, ChipMatch};
use crate::error::QueryError;
use crate::types::{ChipId, ChipSize, Keypoint};

/// Cells per chip side.
const GRID: usize = 64;

pub(super) fn score(
    ctx: &ScoreContext<'_>,
    method: ScoreMethod,
    query: ChipId,
    cm: &ChipMatch,
) -> Result<BTreeMap<ChipId, f64>, QueryError> {
    let need_query = matches!(method, ScoreMethod::Coverage0 | ScoreMethod::Coverage2);
    let query_side = if need_query {
        Some((ctx.store.chip_size(query)?, ctx.store.chip_keypoints(query)?))
    } else {
        None
    };

    let mut out = BTreeMap::new();
    for cand in cm.candidates() {
        let query_cov = match &query_side {
            Some((size, kpts)) => Some(coverage(*size, kpts, cand, 0)?),
            None => None,
        };
        let cand_cov = if matches!(method, ScoreMethod::Coverage1 | ScoreMethod::Coverage2) {
            let size = ctx.store.chip_size(cand.chip)?;
            let kpts = ctx.store.chip_keypoints(cand.chip)?;
            Some(coverage(size, &kpts, cand, 1)?)
        } else {
            None
        };
        let s = match (query_cov, cand_cov) {
            (Some(q), Some(c)) => (q * c).max(0.0).sqrt(),
            (Some(q), None) => q,
            (None, Some(c)) => c,
            (None, None) => 0.0,
        };
        out.insert(cand.chip, s);
    }
    Ok(out)
}

/// Mean over a `GRID x GRID` raster of the chip where every cell holds the
/// highest correspondence score whose keypoint disc covers the cell center.
/// `side` selects which feature of each pair is stamped (0 query, 1 candidate).
fn coverage(size: ChipSize, kpts: &[Keypoint], cand: &CandidateMatch, side: usize) -> Result<f64, QueryError> {
    let (w, h) = (size[0].max(1) as f64, size[1].max(1) as f64);
    let (cell_w, cell_h) = (w / GRID as f64, h / GRID as f64);
    let mut grid = vec![0.0f32; GRID * GRID];

    for (pair, &fs) in cand.fm.iter().zip(&cand.fs) {
        let fx = pair[side] as usize;
        let kp = kpts.get(fx).ok_or_else(|| {
            QueryError::Store(format!("coverage: feature {fx} has no keypoint"))
        })?;
        let [x, y] = kp.xy();
        let r = kp.scale();

        let cell_range = |c: f64, cell: f64| {
            let lo = ((c - r) / cell).floor().max(0.0) as usize;
            let hi = (((c + r) / cell).floor().max(0.0) as usize).min(GRID - 1);
            lo.min(GRID - 1)..=hi
        };
        let mut stamped = false;
        for gy in cell_range(y, cell_h) {
            let cy = (gy as f64 + 0.5) * cell_h;
            for gx in cell_range(x, cell_w) {
                let cx = (gx as f64 + 0.5) * cell_w;
                if (cx - x).powi(2) + (cy - y).powi(2) <= r * r {
                    let cell = &mut grid[gy * GRID + gx];
                    *cell = cell.max(fs);
                    stamped = true;
                }
            }
        }
        if !stamped {
            // Disc smaller than a cell: credit the cell holding the center.
            let gx = ((x / cell_w).max(0.0) as usize).min(GRID - 1);
            let gy = ((y / cell_h).max(0.0) as usize).min(GRID - 1);
            let cell = &mut grid[gy * GRID + gx];
            *cell = cell.max(fs);
        }
    }

    Ok(grid.iter().map(|&v| v as f64).sum::<f64>() / (GRID * GRID) as f64)
}
