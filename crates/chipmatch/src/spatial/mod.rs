//! Spatial verification of chip matches.
//!
//! Candidates are ranked by a pre-score, the best `n_shortlist` are checked
//! for geometric consistency (best single-correspondence affine hypothesis,
//! then a homography fitted on its inliers) and pruned to their inliers.
//! Verification only ever removes correspondences and candidates.

mod affine;
mod homography;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::chipmatch::{CandidateMatch, ChipMatch, ChipMatchBuilder};
use crate::config::SpatialVerifyConfig;
use crate::error::QueryError;
use crate::scoring::{score_chipmatch, ScoreContext};
use crate::types::{diag_len_sqrd, ChipId, Keypoint};

pub use homography::{estimate_homography_dlt, project, transfer_error_sqrd, HomographyError};

use affine::best_affine_inliers;

/// Verify the shortlisted candidates of `cm` and return the pruned match.
///
/// When verification is off the input is returned unchanged.
pub fn spatially_verify(
    ctx: &ScoreContext<'_>,
    query: ChipId,
    cm: &ChipMatch,
    cfg: &SpatialVerifyConfig,
) -> Result<ChipMatch, QueryError> {
    let Some(xy_thresh) = cfg.xy_thresh.filter(|_| cfg.is_on()) else {
        return Ok(cm.clone());
    };
    if cm.is_empty() {
        return Ok(ChipMatch::default());
    }

    let prescores = score_chipmatch(ctx, cfg.prescore_method, query, cm)?;
    let prescore = |c: &CandidateMatch| prescores.get(&c.chip).copied().unwrap_or(f64::NEG_INFINITY);
    let mut order: Vec<&CandidateMatch> = cm.candidates().iter().collect();
    // Stable: equal pre-scores keep first-seen order.
    order.sort_by(|a, b| prescore(b).total_cmp(&prescore(a)));
    order.truncate(cfg.n_shortlist);

    let query_kpts = ctx.store.chip_keypoints(query)?;
    let mut builder = ChipMatchBuilder::new();
    let mut n_dropped = 0usize;
    for cand in order {
        match verify_candidate(ctx, &query_kpts, cand, cfg, xy_thresh)? {
            Some(inliers) => builder.push_candidate(cand.subset(&inliers)),
            None => n_dropped += 1,
        }
    }
    let verified = builder.freeze();

    tracing::info!(
        query,
        n_candidates = cm.len(),
        n_shortlist = cfg.n_shortlist.min(cm.len()),
        n_verified = verified.len(),
        n_dropped,
        "spatial verification"
    );
    Ok(verified)
}

/// Inlier indices of one candidate, or `None` when it fails verification.
fn verify_candidate(
    ctx: &ScoreContext<'_>,
    query_kpts: &[Keypoint],
    cand: &CandidateMatch,
    cfg: &SpatialVerifyConfig,
    xy_thresh: f64,
) -> Result<Option<Vec<usize>>, QueryError> {
    let cand_kpts = ctx.store.chip_keypoints(cand.chip)?;
    let mut kp1 = Vec::with_capacity(cand.len());
    let mut kp2 = Vec::with_capacity(cand.len());
    for &[qfx, fx] in &cand.fm {
        let (Some(&a), Some(&b)) = (query_kpts.get(qfx as usize), cand_kpts.get(fx as usize)) else {
            return Err(QueryError::Store(format!(
                "chip {}: correspondence ({qfx}, {fx}) has no keypoint",
                cand.chip
            )));
        };
        kp1.push(a);
        kp2.push(b);
    }

    let dlen_sqrd = if cfg.use_chip_extent {
        let [w, h] = ctx.store.chip_size(cand.chip)?;
        diag_len_sqrd(w as f64, h as f64)
    } else {
        keypoint_extent_sqrd(&kp2)
    };
    if !(dlen_sqrd > 0.0) {
        return Ok(None);
    }
    let xy_thresh_sqrd = dlen_sqrd * xy_thresh;
    let scale_bounds = (cfg.scale_thresh_low, cfg.scale_thresh_high);

    let hypotheses = hypothesis_indices(cand, cfg);
    let affine = best_affine_inliers(&kp1, &kp2, &hypotheses, xy_thresh_sqrd, scale_bounds);
    if affine.len() < cfg.min_n_inliers {
        return Ok(None);
    }
    if cfg.just_affine {
        return Ok(Some(affine));
    }

    let src: Vec<[f64; 2]> = affine.iter().map(|&i| kp1[i].xy()).collect();
    let dst: Vec<[f64; 2]> = affine.iter().map(|&i| kp2[i].xy()).collect();
    let h = match estimate_homography_dlt(&src, &dst) {
        Ok(h) => h,
        Err(e) => {
            tracing::trace!(chip = cand.chip, error = %e, "homography fit failed");
            return Ok(None);
        }
    };
    let inliers: Vec<usize> = (0..kp1.len())
        .filter(|&i| transfer_error_sqrd(&h, kp1[i].xy(), kp2[i].xy()) < xy_thresh_sqrd)
        .collect();
    Ok((inliers.len() >= cfg.min_n_inliers).then_some(inliers))
}

/// Correspondences that seed an affine hypothesis: all of them, or a seeded
/// subset (ascending) when `max_hypotheses` caps the count.
fn hypothesis_indices(cand: &CandidateMatch, cfg: &SpatialVerifyConfig) -> Vec<usize> {
    let n = cand.len();
    match cfg.max_hypotheses {
        Some(m) if m < n => {
            let mut rng = StdRng::seed_from_u64(cfg.seed ^ u64::from(cand.chip));
            let mut picked = rand::seq::index::sample(&mut rng, n, m).into_vec();
            picked.sort_unstable();
            picked
        }
        _ => (0..n).collect(),
    }
}

/// Squared diagonal of the bounding box of the keypoint centers.
fn keypoint_extent_sqrd(kpts: &[Keypoint]) -> f64 {
    let mut min = [f64::INFINITY; 2];
    let mut max = [f64::NEG_INFINITY; 2];
    for kp in kpts {
        let p = kp.xy();
        for d in 0..2 {
            min[d] = min[d].min(p[d]);
            max[d] = max[d].max(p[d]);
        }
    }
    if kpts.is_empty() {
        return 0.0;
    }
    diag_len_sqrd(max[0] - min[0], max[1] - min[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chipmatch::MIN_CORRESPONDENCES;
    use crate::scoring::ScoreMethod;
    use crate::store::InMemoryStore;
    use crate::test_utils::{chip_with_keypoints, store_from};
    use rand::Rng;

    /// Query chip 1 with a 4x4 keypoint grid; candidates are built from it.
    fn query_grid() -> Vec<Keypoint> {
        (0..16)
            .map(|i| Keypoint::circular(20.0 + 40.0 * (i % 4) as f32, 20.0 + 40.0 * (i / 4) as f32, 3.0))
            .collect()
    }

    fn shifted(kpts: &[Keypoint], dx: f32, dy: f32) -> Vec<Keypoint> {
        kpts.iter()
            .map(|k| Keypoint::circular(k.x + dx, k.y + dy, k.a))
            .collect()
    }

    fn cfg() -> SpatialVerifyConfig {
        SpatialVerifyConfig {
            prescore_method: ScoreMethod::Csum,
            ..SpatialVerifyConfig::default()
        }
    }

    fn verify(store: &InMemoryStore, cm: &ChipMatch, cfg: &SpatialVerifyConfig) -> ChipMatch {
        let ctx = ScoreContext { store, k: 1 };
        spatially_verify(&ctx, 1, cm, cfg).expect("verify")
    }

    #[test]
    fn consistent_candidate_keeps_inliers_and_drops_outliers() {
        let q = query_grid();
        let mut c = shifted(&q, 7.0, -4.0);
        c[5] = Keypoint::circular(190.0, 5.0, 3.0);
        c[11] = Keypoint::circular(3.0, 170.0, 3.0);
        let store = store_from(vec![(1, chip_with_keypoints(1, q)), (2, chip_with_keypoints(2, c))]);

        let mut b = ChipMatchBuilder::new();
        for i in 0..16 {
            b.push(2, i, i, 1.0, 0);
        }
        let out = verify(&store, &b.freeze(), &cfg());
        let cand = out.get(2).expect("verified");
        assert_eq!(cand.len(), 14);
        assert!(cand.fm.iter().all(|&[q, _]| q != 5 && q != 11));

        let affine_only = verify(
            &store,
            &{
                let mut b = ChipMatchBuilder::new();
                (0..16).for_each(|i| b.push(2, i, i, 1.0, 0));
                b.freeze()
            },
            &SpatialVerifyConfig {
                just_affine: true,
                ..cfg()
            },
        );
        assert_eq!(affine_only.get(2).map(CandidateMatch::len), Some(14));
    }

    #[test]
    fn three_consistent_plus_noise_is_rejected() {
        let q = query_grid();
        let c: Vec<Keypoint> = q
            .iter()
            .enumerate()
            .map(|(i, k)| match i {
                0..=2 => Keypoint::circular(k.x + 10.0, k.y + 10.0, 3.0),
                // Scattered so no two agree on a translation.
                _ => Keypoint::circular(((i * 37) % 150) as f32, ((i * i * 11) % 160) as f32, 3.0),
            })
            .collect();
        let store = store_from(vec![(1, chip_with_keypoints(1, q)), (2, chip_with_keypoints(2, c))]);
        let mut b = ChipMatchBuilder::new();
        for i in 0..8 {
            b.push(2, i, i, 1.0, 0);
        }
        let cm = b.freeze();
        assert_eq!(cm.len(), 1);

        let out = verify(&store, &cm, &SpatialVerifyConfig { min_n_inliers: 4, ..cfg() });
        assert!(out.get(2).is_none());
    }

    #[test]
    fn verification_only_prunes() {
        let mut rng = StdRng::seed_from_u64(5);
        let q = query_grid();
        let mut chips = vec![(1, chip_with_keypoints(1, q.clone()))];
        let mut b = ChipMatchBuilder::new();
        for chip in 2..8u32 {
            let kpts: Vec<Keypoint> = q
                .iter()
                .map(|k| {
                    if rng.gen_bool(0.6) {
                        Keypoint::circular(k.x + 3.0, k.y + 1.0, 3.0)
                    } else {
                        Keypoint::circular(rng.gen_range(0.0..200.0), rng.gen_range(0.0..200.0), 3.0)
                    }
                })
                .collect();
            chips.push((chip, chip_with_keypoints(chip, kpts)));
            for i in 0..16 {
                b.push(chip, i, i, rng.gen_range(0.5..2.0), 0);
            }
        }
        let store = store_from(chips);
        let cm = b.freeze();
        let cfg = SpatialVerifyConfig {
            n_shortlist: 4,
            min_n_inliers: 5,
            ..cfg()
        };
        let out = verify(&store, &cm, &cfg);

        assert!(out.len() <= 4);
        for cand in out.candidates() {
            let before = cm.get(cand.chip).expect("verified candidates come from the input");
            assert!(cand.len() <= before.len());
            assert!(cand.len() >= cfg.min_n_inliers.max(MIN_CORRESPONDENCES));
            for (j, pair) in cand.fm.iter().enumerate() {
                let src = before.fm.iter().position(|p| p == pair).expect("subset");
                assert_eq!(before.fs[src], cand.fs[j]);
            }
        }
    }

    #[test]
    fn disabled_verification_is_identity() {
        let store = store_from(vec![(1, chip_with_keypoints(1, query_grid()))]);
        let mut b = ChipMatchBuilder::new();
        (0..5).for_each(|i| b.push(9, i, i, 1.0, 0));
        let cm = b.freeze();
        let off = SpatialVerifyConfig {
            xy_thresh: None,
            ..cfg()
        };
        assert_eq!(verify(&store, &cm, &off), cm);

        let disabled = SpatialVerifyConfig {
            enabled: false,
            ..cfg()
        };
        assert!(disabled.xy_thresh.is_some() && !disabled.is_on());
        assert_eq!(verify(&store, &cm, &disabled), cm);
        assert_eq!(disabled.uid(), "_SV(off)");
        assert_eq!(off.uid(), disabled.uid());
    }

    #[test]
    fn capped_hypotheses_are_sorted_and_reproducible() {
        let mut b = ChipMatchBuilder::new();
        (0..20).for_each(|i| b.push(3, i, i, 1.0, 0));
        let cm = b.freeze();
        let cfg = SpatialVerifyConfig {
            max_hypotheses: Some(5),
            ..cfg()
        };
        let a = hypothesis_indices(&cm.candidates()[0], &cfg);
        assert_eq!(a.len(), 5);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(a, hypothesis_indices(&cm.candidates()[0], &cfg));
    }
}
