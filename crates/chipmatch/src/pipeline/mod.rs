//! Query pipeline.
//!
//! This module is the glue layer that wires the stages together:
//! descriptor index -> neighbor assignment -> weighting -> filtering ->
//! aggregation -> spatial verification -> scoring.
//!
//! The algorithms live in their own modules (`index`, `neighbors`, `weights`,
//! `filter`, `chipmatch`, `spatial`, `scoring`). The pipeline layer owns
//! call order, cache lookups and per-chip failure bookkeeping.

mod result;
mod run;

pub use result::{FailureReason, QueryResult, QueryResults};
pub use run::run_query;

pub(crate) use run::{execute, obtain_index, QueryEnv};
