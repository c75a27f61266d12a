//! Lookup interface to the external metadata/feature store.
//!
//! The pipeline never talks to the relational store directly; everything it
//! needs is expressed by [`FeatureStore`]. [`InMemoryStore`] is a complete
//! implementation backed by a JSON dataset, used by the CLI and the tests.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::descriptor::Descriptors;
use crate::error::QueryError;
use crate::types::{ChipId, ChipSize, Identity, ImageId, Keypoint, NameId};

const DATASET_SCHEMA: &str = "chipmatch.dataset.v1";
const DEFAULT_FEATURE_UID: &str = "FEAT(default)";

/// Per-chip lookups the pipeline needs from its collaborator.
///
/// Implementations are expected to be side-effect free from the pipeline's
/// point of view. Unknown chip ids must yield [`QueryError::UnknownChip`].
pub trait FeatureStore {
    /// Stacked descriptors of the chip's features (one row per feature).
    fn chip_descriptors(&self, chip: ChipId) -> Result<Descriptors, QueryError>;
    /// Keypoints of the chip's features, co-indexed with its descriptors.
    fn chip_keypoints(&self, chip: ChipId) -> Result<Vec<Keypoint>, QueryError>;
    /// Chip extent `[width, height]` in pixels.
    fn chip_size(&self, chip: ChipId) -> Result<ChipSize, QueryError>;
    /// Source image the chip was cropped from.
    fn chip_image(&self, chip: ChipId) -> Result<ImageId, QueryError>;
    /// Identity label of the chip, `None` when unknown.
    fn chip_name(&self, chip: ChipId) -> Result<Option<NameId>, QueryError>;

    /// Identifier of the feature-extraction configuration; part of every
    /// descriptor-index cache key.
    fn feature_uid(&self) -> String {
        DEFAULT_FEATURE_UID.to_string()
    }

    /// Identity of the chip for same-individual comparisons.
    fn chip_identity(&self, chip: ChipId) -> Result<Identity, QueryError> {
        Ok(Identity::of(chip, self.chip_name(chip)?))
    }
}

/// Everything the store knows about one chip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChipRecord {
    pub image: ImageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<NameId>,
    pub size: ChipSize,
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Descriptors,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DatasetSpecV1 {
    schema: String,
    #[serde(default = "default_feature_uid")]
    feature_uid: String,
    chips: Vec<DatasetChip>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatasetChip {
    id: ChipId,
    #[serde(flatten)]
    record: ChipRecord,
}

fn default_feature_uid() -> String {
    DEFAULT_FEATURE_UID.to_string()
}

/// In-memory [`FeatureStore`].
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    chips: BTreeMap<ChipId, ChipRecord>,
    feature_uid: String,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            chips: BTreeMap::new(),
            feature_uid: default_feature_uid(),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the feature configuration uid reported to the index cache.
    pub fn with_feature_uid(mut self, uid: impl Into<String>) -> Self {
        self.feature_uid = uid.into();
        self
    }

    /// Insert or replace a chip after validating its record.
    pub fn insert(&mut self, chip: ChipId, record: ChipRecord) -> Result<(), QueryError> {
        validate_record(chip, &record)?;
        self.chips.insert(chip, record);
        Ok(())
    }

    /// All chip ids in ascending order.
    pub fn chip_ids(&self) -> Vec<ChipId> {
        self.chips.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.chips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chips.is_empty()
    }

    pub fn record(&self, chip: ChipId) -> Option<&ChipRecord> {
        self.chips.get(&chip)
    }

    /// Load a dataset from a JSON file (`chipmatch.dataset.v1`).
    pub fn from_json_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn from_json_str(data: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let spec: DatasetSpecV1 = serde_json::from_str(data)?;
        Self::from_dataset_spec(spec).map_err(Into::into)
    }

    /// Serialize the store as a `chipmatch.dataset.v1` JSON document.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        let spec = DatasetSpecV1 {
            schema: DATASET_SCHEMA.to_string(),
            feature_uid: self.feature_uid.clone(),
            chips: self
                .chips
                .iter()
                .map(|(&id, record)| DatasetChip {
                    id,
                    record: record.clone(),
                })
                .collect(),
        };
        serde_json::to_string_pretty(&spec)
    }

    fn from_dataset_spec(spec: DatasetSpecV1) -> Result<Self, QueryError> {
        if spec.schema != DATASET_SCHEMA {
            return Err(QueryError::Store(format!(
                "unsupported dataset schema '{}' (expected '{}')",
                spec.schema, DATASET_SCHEMA
            )));
        }
        let mut store = Self::new().with_feature_uid(spec.feature_uid);
        for chip in spec.chips {
            if store.chips.contains_key(&chip.id) {
                return Err(QueryError::Store(format!("duplicate chip id {}", chip.id)));
            }
            store.insert(chip.id, chip.record)?;
        }
        Ok(store)
    }

    fn get(&self, chip: ChipId) -> Result<&ChipRecord, QueryError> {
        self.chips.get(&chip).ok_or(QueryError::UnknownChip(chip))
    }
}

fn validate_record(chip: ChipId, record: &ChipRecord) -> Result<(), QueryError> {
    let n_desc = record.descriptors.len();
    if record.keypoints.len() != n_desc {
        return Err(QueryError::Store(format!(
            "chip {chip}: {} keypoints but {n_desc} descriptors",
            record.keypoints.len()
        )));
    }
    if record.size[0] == 0 || record.size[1] == 0 {
        return Err(QueryError::Store(format!("chip {chip}: zero-sized extent")));
    }
    Ok(())
}

impl FeatureStore for InMemoryStore {
    fn chip_descriptors(&self, chip: ChipId) -> Result<Descriptors, QueryError> {
        Ok(self.get(chip)?.descriptors.clone())
    }

    fn chip_keypoints(&self, chip: ChipId) -> Result<Vec<Keypoint>, QueryError> {
        Ok(self.get(chip)?.keypoints.clone())
    }

    fn chip_size(&self, chip: ChipId) -> Result<ChipSize, QueryError> {
        Ok(self.get(chip)?.size)
    }

    fn chip_image(&self, chip: ChipId) -> Result<ImageId, QueryError> {
        Ok(self.get(chip)?.image)
    }

    fn chip_name(&self, chip: ChipId) -> Result<Option<NameId>, QueryError> {
        Ok(self.get(chip)?.name)
    }

    fn feature_uid(&self) -> String {
        self.feature_uid.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize) -> ChipRecord {
        ChipRecord {
            image: 7,
            name: Some(3),
            size: [64, 48],
            keypoints: (0..n)
                .map(|i| Keypoint::circular(i as f32, i as f32, 2.0))
                .collect(),
            descriptors: Descriptors::from_flat(4, vec![1; 4 * n]).expect("flat"),
        }
    }

    #[test]
    fn lookups_return_record_fields() {
        let mut store = InMemoryStore::new();
        store.insert(11, record(3)).expect("valid record");
        assert_eq!(store.chip_descriptors(11).unwrap().len(), 3);
        assert_eq!(store.chip_keypoints(11).unwrap().len(), 3);
        assert_eq!(store.chip_size(11).unwrap(), [64, 48]);
        assert_eq!(store.chip_image(11).unwrap(), 7);
        assert_eq!(store.chip_name(11).unwrap(), Some(3));
        assert_eq!(store.chip_image(12), Err(QueryError::UnknownChip(12)));
    }

    #[test]
    fn insert_rejects_keypoint_descriptor_mismatch() {
        let mut rec = record(3);
        rec.keypoints.pop();
        let err = InMemoryStore::new().insert(1, rec).expect_err("mismatch");
        assert!(err.to_string().contains("2 keypoints but 3 descriptors"));
    }

    #[test]
    fn json_round_trip_keeps_chips() {
        let mut store = InMemoryStore::new().with_feature_uid("FEAT(sift)");
        store.insert(2, record(2)).unwrap();
        store.insert(5, record(0)).unwrap();
        let json = store.to_json_string().expect("serialize");
        let back = InMemoryStore::from_json_str(&json).expect("parse");
        assert_eq!(back.chip_ids(), vec![2, 5]);
        assert_eq!(back.feature_uid(), "FEAT(sift)");
        assert!(back.chip_descriptors(5).unwrap().is_empty());
    }

    #[test]
    fn json_requires_v1_schema() {
        let raw = r#"{"schema":"chipmatch.dataset.v0","chips":[]}"#;
        let err = InMemoryStore::from_json_str(raw).expect_err("schema");
        assert!(err.to_string().contains("unsupported dataset schema"));
    }
}
