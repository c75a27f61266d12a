//! Row-major descriptor matrices.

use serde::{Deserialize, Serialize};

/// A stack of fixed-length `u8` feature descriptors, one row per feature.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawDescriptors", into = "RawDescriptors")]
pub struct Descriptors {
    dim: usize,
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct RawDescriptors {
    dim: usize,
    data: Vec<u8>,
}

impl TryFrom<RawDescriptors> for Descriptors {
    type Error = String;

    fn try_from(raw: RawDescriptors) -> Result<Self, Self::Error> {
        let n = raw.data.len();
        Self::from_flat(raw.dim, raw.data)
            .ok_or_else(|| format!("{n} descriptor bytes do not form rows of dim {}", raw.dim))
    }
}

impl From<Descriptors> for RawDescriptors {
    fn from(d: Descriptors) -> Self {
        Self {
            dim: d.dim,
            data: d.data,
        }
    }
}

impl Descriptors {
    /// Wrap a flat row-major buffer. Returns `None` when `data.len()` is not
    /// a multiple of `dim` (or `dim == 0` with non-empty data).
    pub fn from_flat(dim: usize, data: Vec<u8>) -> Option<Self> {
        if dim == 0 {
            return data.is_empty().then_some(Self { dim, data });
        }
        (data.len() % dim == 0).then_some(Self { dim, data })
    }

    /// Build from individual rows. All rows must share one length.
    pub fn from_rows<R: AsRef<[u8]>>(rows: &[R]) -> Option<Self> {
        let Some(first) = rows.first() else {
            return Some(Self::default());
        };
        let dim = first.as_ref().len();
        let mut data = Vec::with_capacity(dim * rows.len());
        for row in rows {
            let row = row.as_ref();
            if row.len() != dim {
                return None;
            }
            data.extend_from_slice(row);
        }
        Some(Self { dim, data })
    }

    /// Empty descriptor set of dimensionality `dim`.
    pub fn empty(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
        }
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[u8] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u8]> + '_ {
        // `chunks_exact(0)` panics, and a zero-dim set has no rows anyway.
        self.data.chunks_exact(self.dim.max(1)).take(self.len())
    }

    /// Raw row-major bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Append all rows of `other`. Dimensions must agree unless `self` is empty.
    pub(crate) fn extend_from(&mut self, other: &Descriptors) {
        if self.data.is_empty() {
            self.dim = other.dim;
        }
        debug_assert!(other.is_empty() || other.dim == self.dim);
        self.data.extend_from_slice(&other.data);
    }
}

/// Squared Euclidean distance between two descriptor rows.
#[inline]
pub fn squared_l2(a: &[u8], b: &[u8]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as i32 - y as i32;
            (d * d) as u32
        })
        .sum::<u32>() as f32
}
