//! chipmatch — query-matching pipeline for chip-based animal identification.
//!
//! A query chip's local features are matched against a database of chips
//! and every candidate chip receives a score. The pipeline stages are:
//!
//! 1. **Index** – randomized kd-forest over the stacked database descriptors.
//! 2. **Assign** – `K + Knorm` nearest neighbors per query descriptor.
//! 3. **Weight** – pluggable per-neighbor weights (ratio test, LNBNN,
//!    locality, reciprocity).
//! 4. **Filter** – thresholds, linear re-scoring, impossible-vote exclusion.
//! 5. **Aggregate** – valid votes grouped into per-candidate correspondences.
//! 6. **Verify** – affine hypotheses plus homography refit prune
//!    geometrically inconsistent correspondences.
//! 7. **Score** – csum, positional (pl, borda, topk) or coverage scores.
//!
//! # Public API
//! - [`Matcher`] and [`run_query`] as entry points
//! - [`QueryConfig`] for tuning, [`QueryCache`] for injected caching
//! - [`FeatureStore`] as the seam to the metadata/feature collaborator
//! - stage functions for callers that drive the pipeline themselves

mod api;
mod cache;
mod chipmatch;
mod config;
mod descriptor;
mod error;
mod filter;
mod index;
mod neighbors;
mod pipeline;
mod scoring;
mod spatial;
mod store;
mod types;
mod weights;

#[cfg(test)]
mod test_utils;

pub use api::Matcher;
pub use cache::{CacheStats, IndexKey, QueryCache};
pub use chipmatch::{
    aggregate_vsmany, aggregate_vsone, CandidateMatch, ChipMatch, ChipMatchBuilder,
    MIN_CORRESPONDENCES,
};
pub use config::{
    AggregateConfig, FilterConfig, FilterSpec, IndexParams, NnConfig, QueryConfig, QueryType,
    SpatialVerifyConfig,
};
pub use descriptor::{squared_l2, Descriptors};
pub use error::{BuildError, QueryError};
pub use filter::{filter_neighbors, FilterResult};
pub use index::DescriptorIndex;
pub use neighbors::{assign_neighbors, Assignment, Neighbors};
pub use pipeline::{run_query, FailureReason, QueryResult, QueryResults};
pub use scoring::{score_chipmatch, ScoreContext, ScoreMethod};
pub use spatial::{
    estimate_homography_dlt, project, spatially_verify, transfer_error_sqrd, HomographyError,
};
pub use store::{ChipRecord, FeatureStore, InMemoryStore};
pub use types::{ChipId, ChipSize, Identity, ImageId, Keypoint, NameId};
pub use weights::{
    weight_neighbors, DistanceRatioWeighter, FilterRegistry, FilterWeights, NeighborWeighter,
    NormalizerRule, RatioKind, ReciprocityWeighter, RoiDistanceWeighter, WeightArrays,
    WeightContext,
};
