//! High-level query API.
//!
//! [`Matcher`] is the primary entry point. It wraps a validated
//! [`QueryConfig`], the filter registry derived from it and an injected
//! [`QueryCache`]. Create once, query many times.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::QueryCache;
use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::index::DescriptorIndex;
use crate::pipeline::{self, QueryEnv, QueryResults};
use crate::store::FeatureStore;
use crate::types::ChipId;
use crate::weights::{FilterRegistry, NeighborWeighter};

/// Primary query interface.
///
/// # Examples
///
/// ```no_run
/// use chipmatch::{InMemoryStore, Matcher, QueryConfig};
/// use std::path::Path;
///
/// let store = InMemoryStore::from_json_file(Path::new("demos/dataset.json")).unwrap();
/// let matcher = Matcher::new(QueryConfig::default()).unwrap();
/// let db = store.chip_ids();
/// let results = matcher.run_query(&store, &db[..1], &db).unwrap();
/// for (chip, score) in results.get(db[0]).unwrap().ranked() {
///     println!("{chip}: {score:.3}");
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Matcher {
    config: QueryConfig,
    registry: FilterRegistry,
    cache: Arc<QueryCache>,
    index_dir: Option<PathBuf>,
}

impl Matcher {
    /// Validate `config` and build its filter registry.
    ///
    /// Fails on out-of-range settings and on filters that no registered
    /// weighter implements.
    pub fn new(config: QueryConfig) -> Result<Self, QueryError> {
        let registry = FilterRegistry::with_builtins(config.filter.normalizer_rule);
        Self::with_registry(config, registry)
    }

    /// Create with a caller-assembled filter registry.
    pub fn with_registry(config: QueryConfig, registry: FilterRegistry) -> Result<Self, QueryError> {
        config.validate()?;
        registry.check(&config.filter)?;
        Ok(Self {
            config,
            registry,
            cache: Arc::new(QueryCache::default()),
            index_dir: None,
        })
    }

    /// Load a JSON config and create a matcher in one step.
    pub fn from_config_json_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let data = std::fs::read_to_string(path)?;
        Ok(Self::new(QueryConfig::from_json_str(&data)?)?)
    }

    /// Register an extra weighter. Filters naming it become valid.
    pub fn register_weighter(&mut self, weighter: Arc<dyn NeighborWeighter>) {
        self.registry.register(weighter);
    }

    /// Share `cache` with other matchers.
    pub fn with_cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Persist built kd-forests under `dir` and reuse them across runs.
    pub fn with_index_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.index_dir = Some(dir.into());
        self
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Match `query_chips` against `database_chips`.
    pub fn run_query(
        &self,
        store: &dyn FeatureStore,
        query_chips: &[ChipId],
        database_chips: &[ChipId],
    ) -> Result<Arc<QueryResults>, QueryError> {
        pipeline::execute(&self.env(store), query_chips, database_chips)
    }

    /// Build (or fetch from cache) the descriptor index over `chips`.
    pub fn build_index(&self, store: &dyn FeatureStore, chips: &[ChipId]) -> Result<Arc<DescriptorIndex>, QueryError> {
        pipeline::obtain_index(&self.env(store), chips)
    }

    fn env<'a>(&'a self, store: &'a dyn FeatureStore) -> QueryEnv<'a> {
        QueryEnv {
            store,
            config: &self.config,
            registry: &self.registry,
            cache: &self.cache,
            index_dir: self.index_dir.as_deref(),
        }
    }
}
