//! On-disk kd-forest cache.
//!
//! One file per (chip set, feature config, build params, descriptor content).
//! The file is a bincode-encoded [`CacheHeader`] followed by the forest. The
//! header pins the descriptor matrix the forest was built over; a file that
//! does not match is treated exactly like a missing one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::kdforest::KdForest;

const MAGIC: [u8; 8] = *b"CHIPKDF\0";
const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub(crate) enum CacheError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode: {0}")]
    Codec(#[from] bincode::Error),
    #[error("stale or foreign cache file: {0}")]
    Mismatch(String),
}

impl CacheError {
    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Identity of the descriptor matrix a cached forest belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CacheHeader {
    magic: [u8; 8],
    version: u32,
    data_hash: u64,
    n_rows: u64,
    dim: u64,
}

impl CacheHeader {
    pub(crate) fn new(data_hash: u64, n_rows: usize, dim: usize) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            data_hash,
            n_rows: n_rows as u64,
            dim: dim as u64,
        }
    }
}

#[derive(Serialize)]
struct CacheFileRef<'a> {
    header: CacheHeader,
    forest: &'a KdForest,
}

#[derive(Deserialize)]
struct CacheFile {
    header: CacheHeader,
    forest: KdForest,
}

/// `flann_index_{uid}_{params}_{hash}.kdf` inside `dir`.
pub(crate) fn cache_path(dir: &Path, uid: &str, params_uid: &str, data_hash: u64) -> PathBuf {
    let name = format!(
        "flann_index_{}_{}_{data_hash:016x}.kdf",
        sanitize(uid),
        sanitize(params_uid)
    );
    dir.join(name)
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Read and validate a cached forest.
pub(crate) fn load(path: &Path, expected: &CacheHeader) -> Result<KdForest, CacheError> {
    let bytes = std::fs::read(path)?;
    let file: CacheFile = bincode::deserialize(&bytes)?;
    if file.header.magic != MAGIC || file.header.version != FORMAT_VERSION {
        return Err(CacheError::Mismatch(format!(
            "unsupported header (version {})",
            file.header.version
        )));
    }
    if file.header != *expected {
        return Err(CacheError::Mismatch(format!(
            "built for {} rows x {} dims (hash {:016x}), expected {} x {} ({:016x})",
            file.header.n_rows,
            file.header.dim,
            file.header.data_hash,
            expected.n_rows,
            expected.dim,
            expected.data_hash
        )));
    }
    file.forest
        .validate(expected.n_rows as usize, expected.dim as usize)
        .map_err(CacheError::Mismatch)?;
    Ok(file.forest)
}

/// Write a forest next to its final path, then rename into place.
pub(crate) fn save(path: &Path, header: &CacheHeader, forest: &KdForest) -> Result<(), CacheError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let bytes = bincode::serialize(&CacheFileRef {
        header: *header,
        forest,
    })?;
    let tmp = path.with_extension("kdf.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
