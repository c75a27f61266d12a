//! Single-correspondence affine hypotheses.
//!
//! Each correspondence's keypoint shapes fully determine a local affine map
//! from the query chip to the candidate chip: `A = S₂·S₁⁻¹`, with the
//! translation pinning the two keypoint centers together. The hypothesis
//! agreeing with the most other correspondences wins.

use nalgebra::{Matrix2, Vector2};

use crate::types::Keypoint;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct AffineHypothesis {
    a: Matrix2<f64>,
    t: Vector2<f64>,
    /// Linear scale of `a`, `sqrt(|det A|)`.
    scale: f64,
}

impl AffineHypothesis {
    /// Affine map taking `kp1`'s ellipse onto `kp2`'s; `None` when either
    /// shape is singular.
    pub(crate) fn from_correspondence(kp1: &Keypoint, kp2: &Keypoint) -> Option<Self> {
        let s1_inv = kp1.shape().try_inverse()?;
        let a = kp2.shape() * s1_inv;
        let det = a.determinant();
        if !det.is_finite() || det.abs() < 1e-12 {
            return None;
        }
        let [x1, y1] = kp1.xy();
        let [x2, y2] = kp2.xy();
        let t = Vector2::new(x2, y2) - a * Vector2::new(x1, y1);
        Some(Self {
            a,
            t,
            scale: det.abs().sqrt(),
        })
    }

    #[inline]
    pub(crate) fn apply(&self, p: [f64; 2]) -> [f64; 2] {
        let q = self.a * Vector2::new(p[0], p[1]) + self.t;
        [q[0], q[1]]
    }

    /// Correspondences consistent with this hypothesis in position and scale.
    pub(crate) fn inliers(
        &self,
        kp1: &[Keypoint],
        kp2: &[Keypoint],
        xy_thresh_sqrd: f64,
        scale_bounds: (f64, f64),
    ) -> Vec<usize> {
        let (low, high) = scale_bounds;
        (0..kp1.len())
            .filter(|&j| {
                let [px, py] = self.apply(kp1[j].xy());
                let [x2, y2] = kp2[j].xy();
                let err_sqrd = (px - x2).powi(2) + (py - y2).powi(2);
                if !(err_sqrd < xy_thresh_sqrd) {
                    return false;
                }
                let s1 = kp1[j].scale();
                if s1 <= 0.0 {
                    return false;
                }
                let change = kp2[j].scale() / s1 / self.scale;
                change > low && change < high
            })
            .collect()
    }
}

/// Inliers of the best hypothesis among `hypotheses` (indices into the
/// correspondence arrays). Earlier hypotheses win ties.
pub(crate) fn best_affine_inliers(
    kp1: &[Keypoint],
    kp2: &[Keypoint],
    hypotheses: &[usize],
    xy_thresh_sqrd: f64,
    scale_bounds: (f64, f64),
) -> Vec<usize> {
    let mut best = Vec::new();
    for &h in hypotheses {
        let Some(hyp) = AffineHypothesis::from_correspondence(&kp1[h], &kp2[h]) else {
            continue;
        };
        let inliers = hyp.inliers(kp1, kp2, xy_thresh_sqrd, scale_bounds);
        if inliers.len() > best.len() {
            best = inliers;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn hypothesis_maps_keypoint_center_and_shape() {
        let kp1 = Keypoint::circular(10.0, 20.0, 2.0);
        let kp2 = Keypoint::circular(30.0, 25.0, 4.0);
        let hyp = AffineHypothesis::from_correspondence(&kp1, &kp2).expect("regular");
        let p = hyp.apply([10.0, 20.0]);
        assert_relative_eq!(p[0], 30.0, epsilon = 1e-9);
        assert_relative_eq!(p[1], 25.0, epsilon = 1e-9);
        // Doubling scale: one unit away in chip 1 is two units away in chip 2.
        let q = hyp.apply([11.0, 20.0]);
        assert_relative_eq!(q[0], 32.0, epsilon = 1e-9);
        assert_relative_eq!(hyp.scale, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn singular_shape_yields_no_hypothesis() {
        let flat = Keypoint {
            x: 0.0,
            y: 0.0,
            a: 0.0,
            c: 0.0,
            d: 1.0,
        };
        let ok = Keypoint::circular(0.0, 0.0, 1.0);
        assert!(AffineHypothesis::from_correspondence(&flat, &ok).is_none());
    }

    #[test]
    fn best_hypothesis_counts_consistent_translations() {
        // Five correspondences shifted by (+5, 0), one outlier.
        let kp1: Vec<Keypoint> = (0..6)
            .map(|i| Keypoint::circular(10.0 * i as f32, 3.0, 1.5))
            .collect();
        let mut kp2: Vec<Keypoint> = kp1
            .iter()
            .map(|k| Keypoint::circular(k.x + 5.0, k.y, 1.5))
            .collect();
        kp2[3] = Keypoint::circular(90.0, 90.0, 1.5);

        let all: Vec<usize> = (0..6).collect();
        let inliers = best_affine_inliers(&kp1, &kp2, &all, 1.0, (0.5, 2.0));
        assert_eq!(inliers, vec![0, 1, 2, 4, 5]);

        // Scale change outside the bounds rejects otherwise aligned pairs.
        let big: Vec<Keypoint> = kp2
            .iter()
            .map(|k| Keypoint::circular(k.x, k.y, 1.5 * if k.x > 30.0 { 3.0 } else { 1.0 }))
            .collect();
        let inliers = best_affine_inliers(&kp1, &big, &all[..1], 1.0, (0.5, 2.0));
        assert_eq!(inliers, vec![0, 1, 2]);
    }
}
