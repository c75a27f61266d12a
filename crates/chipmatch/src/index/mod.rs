//! Descriptor index over a set of database chips.
//!
//! Stacks the descriptors of every database chip into one matrix, keeps the
//! inverted map `row -> (chip, feature)` and searches it with a randomized
//! kd-forest. The forest can be loaded from / saved to a cache directory.

mod disk_cache;
mod kdforest;

use std::path::Path;

use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use crate::config::IndexParams;
use crate::descriptor::Descriptors;
use crate::error::{BuildError, QueryError};
use crate::neighbors::Neighbors;
use crate::store::FeatureStore;
use crate::types::ChipId;

use disk_cache::CacheHeader;
use kdforest::{KdForest, SearchScratch};

/// Immutable nearest-neighbor index over stacked database descriptors.
#[derive(Debug, Clone)]
pub struct DescriptorIndex {
    chips: Vec<ChipId>,
    data: Descriptors,
    row_chip: Vec<ChipId>,
    row_fx: Vec<u32>,
    forest: KdForest,
    data_hash: u64,
    uid: String,
}

impl DescriptorIndex {
    /// Fetch, stack and index the descriptors of `chip_ids` (in order).
    ///
    /// With a `cache_dir`, a previously saved forest for the same descriptor
    /// content is reused unless `params.force_recompute` is set; any problem
    /// reading it falls back to a fresh build.
    pub fn build(
        chip_ids: &[ChipId],
        store: &dyn FeatureStore,
        params: &IndexParams,
        strict: bool,
        cache_dir: Option<&Path>,
    ) -> Result<Self, QueryError> {
        let mut data = Descriptors::default();
        let mut row_chip = Vec::new();
        let mut row_fx = Vec::new();

        for &chip in chip_ids {
            let desc = store.chip_descriptors(chip)?;
            if desc.is_empty() {
                if strict {
                    return Err(BuildError::NoDescriptors { chip }.into());
                }
                tracing::debug!(chip, "database chip has no descriptors; skipped");
                continue;
            }
            if !data.is_empty() && desc.dim() != data.dim() {
                return Err(BuildError::DimensionMismatch {
                    chip,
                    expected: data.dim(),
                    got: desc.dim(),
                }
                .into());
            }
            row_chip.extend(std::iter::repeat(chip).take(desc.len()));
            row_fx.extend(0..desc.len() as u32);
            data.extend_from(&desc);
        }

        if data.is_empty() {
            return Err(BuildError::EmptyDatabase.into());
        }

        let uid = format!("{:016x}_{}", chip_set_hash(chip_ids), store.feature_uid());
        let data_hash = content_hash(&data);
        let forest = match cache_dir {
            Some(dir) => load_or_build(dir, &uid, &data, data_hash, params),
            None => KdForest::build(&data, params.trees, params.leaf_max_size, params.seed),
        };

        tracing::info!(
            n_chips = chip_ids.len(),
            n_rows = data.len(),
            dim = data.dim(),
            trees = forest.n_trees(),
            "descriptor index ready"
        );

        Ok(Self {
            chips: chip_ids.to_vec(),
            data,
            row_chip,
            row_fx,
            forest,
            data_hash,
            uid,
        })
    }

    /// Number of indexed descriptor rows.
    #[inline]
    pub fn n_rows(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.data.dim()
    }

    /// Database chips the index was built from, in build order.
    pub fn chip_ids(&self) -> &[ChipId] {
        &self.chips
    }

    /// Chip-set hash plus feature uid.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// xxh3 hash of the stacked descriptor matrix.
    pub fn data_hash(&self) -> u64 {
        self.data_hash
    }

    /// Owning chip and local feature index of a row.
    #[inline]
    pub fn resolve(&self, row: usize) -> (ChipId, usize) {
        (self.row_chip[row], self.row_fx[row] as usize)
    }

    #[inline]
    pub fn descriptor(&self, row: usize) -> &[u8] {
        self.data.row(row)
    }

    /// `k` nearest indexed rows for each row of `queries`.
    ///
    /// Rows of the result are ascending by `(distance, row index)`. An empty
    /// `queries` yields a `0 x k` result.
    pub fn query(&self, queries: &Descriptors, k: usize, checks: usize) -> Result<Neighbors, QueryError> {
        if k > self.n_rows() {
            return Err(QueryError::NotEnoughNeighbors {
                requested: k,
                available: self.n_rows(),
            });
        }
        if !queries.is_empty() && queries.dim() != self.dim() {
            return Err(QueryError::InvalidConfig(format!(
                "query descriptors have dim {}, index has dim {}",
                queries.dim(),
                self.dim()
            )));
        }

        let n = queries.len();
        let mut idx = Vec::with_capacity(n * k);
        let mut dist = Vec::with_capacity(n * k);
        let mut scratch = SearchScratch::default();
        for q in queries.rows() {
            for (d, row) in self.forest.knn(&self.data, q, k, checks, &mut scratch) {
                idx.push(row);
                dist.push(d);
            }
        }
        Ok(Neighbors::from_row_major(n, k, idx, dist))
    }
}

/// Order-sensitive hash of a chip id list.
pub(crate) fn chip_set_hash(chips: &[ChipId]) -> u64 {
    let bytes: Vec<u8> = chips.iter().flat_map(|c| c.to_le_bytes()).collect();
    xxh3_64(&bytes)
}

fn content_hash(data: &Descriptors) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(&(data.dim() as u64).to_le_bytes());
    hasher.update(data.as_bytes());
    hasher.digest()
}

fn load_or_build(
    dir: &Path,
    uid: &str,
    data: &Descriptors,
    data_hash: u64,
    params: &IndexParams,
) -> KdForest {
    let path = disk_cache::cache_path(dir, uid, &params.uid(), data_hash);
    let header = CacheHeader::new(data_hash, data.len(), data.dim());

    if !params.force_recompute {
        match disk_cache::load(&path, &header) {
            Ok(forest) => {
                tracing::info!(path = %path.display(), "loaded cached kd-forest");
                return forest;
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(path = %path.display(), "no cached kd-forest");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "discarding cached kd-forest");
            }
        }
    }

    let forest = KdForest::build(data, params.trees, params.leaf_max_size, params.seed);
    let saved = disk_cache::save(&path, &header, &forest)
        .or_else(|_| disk_cache::save(&path, &header, &forest));
    match saved {
        Ok(()) => tracing::debug!(path = %path.display(), "saved kd-forest"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not save kd-forest"),
    }
    forest
}
