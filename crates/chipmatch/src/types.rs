//! Identifiers and keypoint geometry shared across pipeline stages.

use serde::{Deserialize, Serialize};

/// Identifier of a chip (one cropped, normalized subject instance).
pub type ChipId = u32;
/// Identifier of the source image a chip was cropped from.
pub type ImageId = u32;
/// Identifier of an identity label (a named individual).
pub type NameId = u32;

/// Chip extent in pixels, `[width, height]`.
pub type ChipSize = [u32; 2];

/// An affine-shaped keypoint in chip coordinates.
///
/// The shape is the lower-triangular matrix `[[a, 0], [c, d]]` that maps the
/// unit circle onto the keypoint ellipse. Serialized as `[x, y, a, c, d]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 5]", into = "[f32; 5]")]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub a: f32,
    pub c: f32,
    pub d: f32,
}

impl Keypoint {
    /// Isotropic keypoint of radius `scale` centered at `(x, y)`.
    pub fn circular(x: f32, y: f32, scale: f32) -> Self {
        Self {
            x,
            y,
            a: scale,
            c: 0.0,
            d: scale,
        }
    }

    /// Position as `[x, y]` in `f64`.
    #[inline]
    pub fn xy(&self) -> [f64; 2] {
        [self.x as f64, self.y as f64]
    }

    /// Determinant of the shape matrix (ellipse area over π).
    #[inline]
    pub fn det(&self) -> f64 {
        self.a as f64 * self.d as f64
    }

    /// Geometric-mean radius of the keypoint ellipse.
    #[inline]
    pub fn scale(&self) -> f64 {
        self.det().abs().sqrt()
    }

    /// Shape matrix as `nalgebra::Matrix2`.
    pub fn shape(&self) -> nalgebra::Matrix2<f64> {
        nalgebra::Matrix2::new(self.a as f64, 0.0, self.c as f64, self.d as f64)
    }
}

impl From<[f32; 5]> for Keypoint {
    fn from(v: [f32; 5]) -> Self {
        Self {
            x: v[0],
            y: v[1],
            a: v[2],
            c: v[3],
            d: v[4],
        }
    }
}

impl From<Keypoint> for [f32; 5] {
    fn from(k: Keypoint) -> Self {
        [k.x, k.y, k.a, k.c, k.d]
    }
}

/// Who a chip shows: its identity label when known, otherwise the chip
/// itself (an unlabeled chip is only ever the same individual as itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    Name(NameId),
    Chip(ChipId),
}

impl Identity {
    pub fn of(chip: ChipId, name: Option<NameId>) -> Self {
        name.map_or(Self::Chip(chip), Self::Name)
    }
}

/// Squared diagonal length of an axis-aligned extent.
#[inline]
pub(crate) fn diag_len_sqrd(width: f64, height: f64) -> f64 {
    width * width + height * height
}
