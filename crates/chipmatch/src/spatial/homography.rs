//! Chip-to-chip homography via normalized DLT.

use nalgebra::{DMatrix, Matrix3, Vector3};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HomographyError {
    #[error("too few points: need {needed}, got {got}")]
    TooFewPoints { needed: usize, got: usize },
    #[error("numerical failure: {0}")]
    NumericalFailure(String),
}

/// Map `[x, y]` through `h`; NaN when the point lands on the line at infinity.
pub fn project(h: &Matrix3<f64>, p: [f64; 2]) -> [f64; 2] {
    let q = h * Vector3::new(p[0], p[1], 1.0);
    if q[2].abs() < 1e-15 {
        return [f64::NAN, f64::NAN];
    }
    [q[0] / q[2], q[1] / q[2]]
}

/// Squared distance between `project(h, src)` and `dst`.
#[inline]
pub fn transfer_error_sqrd(h: &Matrix3<f64>, src: [f64; 2], dst: [f64; 2]) -> f64 {
    let p = project(h, src);
    (p[0] - dst[0]).powi(2) + (p[1] - dst[1]).powi(2)
}

/// Hartley normalization: translate the centroid to the origin and scale the
/// mean distance to √2.
fn normalize_points(pts: &[[f64; 2]]) -> (Matrix3<f64>, Vec<[f64; 2]>) {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p[1]).sum::<f64>() / n;
    let mean_dist = pts
        .iter()
        .map(|p| ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts
        .iter()
        .map(|p| [s * (p[0] - cx), s * (p[1] - cy)])
        .collect();
    (t, normalized)
}

/// Least-squares homography with `dst ≈ project(H, src)` from ≥4 pairs.
///
/// Hartley-normalized DLT: both point sets are normalized, the 2n×9 linear
/// system is solved through the smallest eigenvector of `AᵀA` and the result
/// is denormalized and scaled to `H[2,2] = 1` when that entry is nonzero.
pub fn estimate_homography_dlt(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
) -> Result<Matrix3<f64>, HomographyError> {
    let n = src.len().min(dst.len());
    if n < 4 {
        return Err(HomographyError::TooFewPoints { needed: 4, got: n });
    }
    if src.len() != dst.len() {
        return Err(HomographyError::NumericalFailure(
            "src and dst must have the same length".into(),
        ));
    }

    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    let mut a = DMatrix::zeros(2 * n, 9);
    for i in 0..n {
        let [sx, sy] = src_n[i];
        let [dx, dy] = dst_n[i];

        a[(2 * i, 3)] = -sx;
        a[(2 * i, 4)] = -sy;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = dy * sx;
        a[(2 * i, 7)] = dy * sy;
        a[(2 * i, 8)] = dy;

        a[(2 * i + 1, 0)] = sx;
        a[(2 * i + 1, 1)] = sy;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -dx * sx;
        a[(2 * i + 1, 7)] = -dx * sy;
        a[(2 * i + 1, 8)] = -dx;
    }

    // Null vector of A = eigenvector of AᵀA with the smallest eigenvalue.
    let eig = nalgebra::SymmetricEigen::new(a.transpose() * &a);
    let min_idx = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|x, y| x.1.abs().total_cmp(&y.1.abs()))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let h = eig.eigenvectors.column(min_idx);
    let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| HomographyError::NumericalFailure("T_dst not invertible".into()))?;
    let h = t_dst_inv * h_norm * t_src;
    if h.iter().any(|v| !v.is_finite()) {
        return Err(HomographyError::NumericalFailure("non-finite homography".into()));
    }
    if h.determinant().abs() < 1e-12 {
        return Err(HomographyError::NumericalFailure("singular homography".into()));
    }

    let scale = h[(2, 2)];
    if scale.abs() < 1e-15 {
        Ok(h)
    } else {
        Ok(h / scale)
    }
}
