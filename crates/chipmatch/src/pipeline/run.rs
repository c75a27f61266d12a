//! Top-level query orchestrator: index → assign → weight → filter →
//! aggregate → verify → score.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use super::result::{FailureReason, QueryResult, QueryResults};
use crate::cache::{self, IndexKey, QueryCache};
use crate::chipmatch::{aggregate_vsmany, aggregate_vsone, ChipMatch};
use crate::config::{QueryConfig, QueryType};
use crate::error::QueryError;
use crate::filter::{filter_neighbors, FilterResult};
use crate::index::{chip_set_hash, DescriptorIndex};
use crate::neighbors::{assign_neighbors, Neighbors};
use crate::scoring::{score_chipmatch, ScoreContext};
use crate::spatial::spatially_verify;
use crate::store::FeatureStore;
use crate::types::ChipId;
use crate::weights::{weight_neighbors, FilterRegistry, FilterWeights, WeightContext};

/// Everything a query needs besides its chip lists.
pub(crate) struct QueryEnv<'a> {
    pub store: &'a dyn FeatureStore,
    pub config: &'a QueryConfig,
    pub registry: &'a FilterRegistry,
    pub cache: &'a QueryCache,
    pub index_dir: Option<&'a Path>,
}

/// Match every query chip against the database chips with the built-in
/// filters, caching indices and results in `cache`.
///
/// Chips without descriptors do not abort the batch: they yield an empty
/// result, or in strict mode an entry in [`QueryResults::failures`].
pub fn run_query(
    store: &dyn FeatureStore,
    query_chips: &[ChipId],
    database_chips: &[ChipId],
    config: &QueryConfig,
    cache: &QueryCache,
) -> Result<Arc<QueryResults>, QueryError> {
    let registry = FilterRegistry::with_builtins(config.filter.normalizer_rule);
    let env = QueryEnv {
        store,
        config,
        registry: &registry,
        cache,
        index_dir: None,
    };
    execute(&env, query_chips, database_chips)
}

pub(crate) fn execute(
    env: &QueryEnv<'_>,
    query_chips: &[ChipId],
    database_chips: &[ChipId],
) -> Result<Arc<QueryResults>, QueryError> {
    let config = env.config;
    config.validate()?;
    env.registry.check(&config.filter)?;

    let uid = config.uid();
    let key = cache::result_key(query_chips, database_chips, &uid, &env.store.feature_uid());
    if !config.index.force_recompute {
        if let Some(hit) = env.cache.get_result(key) {
            tracing::debug!(n_queries = query_chips.len(), "query result cache hit");
            return Ok(hit);
        }
    }

    tracing::info!(
        n_queries = query_chips.len(),
        n_database = database_chips.len(),
        query_type = config.agg.query_type.as_str(),
        config = %uid,
        "running query"
    );
    let results = match config.agg.query_type {
        QueryType::VsMany => run_vsmany(env, &uid, query_chips, database_chips)?,
        QueryType::VsOne => run_vsone(env, &uid, query_chips, database_chips)?,
    };
    tracing::info!(
        n_results = results.results.len(),
        n_failed = results.failures.len(),
        "query finished"
    );

    let results = Arc::new(results);
    env.cache.insert_result(key, Arc::clone(&results));
    Ok(results)
}

/// Cached descriptor index over `chips`.
pub(crate) fn obtain_index(env: &QueryEnv<'_>, chips: &[ChipId]) -> Result<Arc<DescriptorIndex>, QueryError> {
    let config = env.config;
    let key: IndexKey = (
        chip_set_hash(chips),
        env.store.feature_uid(),
        format!("{}{}", config.index.uid(), if config.strict { "_strict" } else { "" }),
    );
    if !config.index.force_recompute {
        if let Some(index) = env.cache.get_index(&key) {
            tracing::debug!(uid = index.uid(), "descriptor index cache hit");
            return Ok(index);
        }
    }
    let index = Arc::new(DescriptorIndex::build(
        chips,
        env.store,
        &config.index,
        config.strict,
        env.index_dir,
    )?);
    env.cache.insert_index(key, Arc::clone(&index));
    Ok(index)
}

fn run_vsmany(
    env: &QueryEnv<'_>,
    uid: &str,
    query_chips: &[ChipId],
    database_chips: &[ChipId],
) -> Result<QueryResults, QueryError> {
    let config = env.config;
    let index = obtain_index(env, database_chips)?;
    let assignment = assign_neighbors(&index, env.store, query_chips, &config.nn, config.strict)?;
    let ctx = WeightContext {
        store: env.store,
        index: &index,
        nn: &config.nn,
    };
    let weights = weight_neighbors(&ctx, env.registry, &assignment, &config.filter)?;

    let mut out = QueryResults {
        results: BTreeMap::new(),
        failures: assignment.failures.clone(),
    };
    for (&query, neighbors) in &assignment.neighbors {
        let filtered = filter_neighbors(&ctx, query, neighbors, &weights, &config.filter)?;
        let cm = aggregate_vsmany(&index, neighbors, &filtered);
        let meta = normalizer_meta(&weights, &[query]);
        out.results.insert(query, finish(env, uid, query, &cm, meta)?);
    }
    Ok(out)
}

fn run_vsone(
    env: &QueryEnv<'_>,
    uid: &str,
    query_chips: &[ChipId],
    database_chips: &[ChipId],
) -> Result<QueryResults, QueryError> {
    let &[query] = query_chips else {
        return Err(QueryError::InvalidConfig(format!(
            "one-vs-one queries take exactly one query chip, got {}",
            query_chips.len()
        )));
    };
    let config = env.config;
    let mut out = QueryResults::default();

    if env.store.chip_descriptors(query)?.is_empty() {
        if config.strict {
            tracing::warn!(query, "query chip has no descriptors");
            out.failures.insert(query, FailureReason::NoDescriptors);
        } else {
            out.results.insert(query, QueryResult::empty(query, uid.to_string()));
        }
        return Ok(out);
    }

    let index = obtain_index(env, &[query])?;
    let assignment = assign_neighbors(&index, env.store, database_chips, &config.nn, config.strict)?;
    let ctx = WeightContext {
        store: env.store,
        index: &index,
        nn: &config.nn,
    };
    let weights = weight_neighbors(&ctx, env.registry, &assignment, &config.filter)?;

    let mut filtered: BTreeMap<ChipId, FilterResult> = BTreeMap::new();
    for (&probe, neighbors) in &assignment.neighbors {
        filtered.insert(probe, filter_neighbors(&ctx, probe, neighbors, &weights, &config.filter)?);
    }
    let probes: BTreeMap<ChipId, (&Neighbors, &FilterResult)> = assignment
        .neighbors
        .iter()
        .filter_map(|(chip, nb)| filtered.get(chip).map(|f| (*chip, (nb, f))))
        .collect();
    let cm = aggregate_vsone(&index, query, &probes)?;

    let probe_ids: Vec<ChipId> = assignment.neighbors.keys().copied().collect();
    let meta = normalizer_meta(&weights, &probe_ids);
    out.results.insert(query, finish(env, uid, query, &cm, meta)?);
    out.failures = assignment.failures;
    Ok(out)
}

/// Verify and score one query chip's aggregated match.
fn finish(
    env: &QueryEnv<'_>,
    uid: &str,
    query: ChipId,
    cm: &ChipMatch,
    filter_meta: BTreeMap<String, BTreeMap<ChipId, Vec<usize>>>,
) -> Result<QueryResult, QueryError> {
    let ctx = ScoreContext {
        store: env.store,
        k: env.config.nn.k,
    };
    let verified = spatially_verify(&ctx, query, cm, &env.config.sv)?;
    let scores = score_chipmatch(&ctx, env.config.agg.score_method, query, &verified)?;
    tracing::debug!(
        query,
        n_candidates = cm.len(),
        n_correspondences = cm.n_correspondences(),
        n_scored = scores.len(),
        "query chip done"
    );
    Ok(QueryResult {
        query,
        uid: uid.to_string(),
        scores,
        chipmatch: verified,
        filter_meta,
    })
}

fn normalizer_meta(weights: &FilterWeights, chips: &[ChipId]) -> BTreeMap<String, BTreeMap<ChipId, Vec<usize>>> {
    let mut meta = BTreeMap::new();
    for (name, per_chip) in weights {
        let rows: BTreeMap<ChipId, Vec<usize>> = chips
            .iter()
            .filter_map(|chip| {
                let norms = per_chip.get(chip)?.normalizers.as_ref()?;
                Some((*chip, norms.clone()))
            })
            .collect();
        if !rows.is_empty() {
            meta.insert(name.clone(), rows);
        }
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterSpec;
    use crate::error::BuildError;
    use crate::scoring::ScoreMethod;
    use crate::store::{ChipRecord, InMemoryStore};
    use crate::test_utils::{random_chip, store_from};
    use crate::types::Keypoint;

    fn knn1_no_sv() -> QueryConfig {
        let mut cfg = QueryConfig::default();
        cfg.nn.k = 1;
        cfg.sv.enabled = false;
        cfg.agg.score_method = ScoreMethod::Csum;
        cfg
    }

    /// Same descriptors, keypoints translated, different image.
    fn duplicate_of(rec: &ChipRecord, image: u32, dx: f32, dy: f32) -> ChipRecord {
        let mut dup = rec.clone();
        dup.image = image;
        dup.keypoints = rec
            .keypoints
            .iter()
            .map(|k| Keypoint::circular(k.x + dx, k.y + dy, k.a))
            .collect();
        dup
    }

    #[test]
    fn single_database_chip_collects_one_vote_per_query_feature() {
        let store = store_from(vec![(1, random_chip(1, 50, 11)), (2, random_chip(2, 10, 12))]);
        let cfg = knn1_no_sv();
        let out = run_query(&store, &[2], &[1], &cfg, &QueryCache::default()).unwrap();

        let res = out.get(2).expect("query result");
        assert_eq!(res.scores.len(), 1);
        let score = res.scores[&1];
        assert!(score.is_finite() && score > 0.0);
        assert_eq!(res.chipmatch.len(), 1);
        assert_eq!(res.chipmatch.n_correspondences(), 10);
        assert_eq!(res.uid, cfg.uid());
        assert_eq!(res.filter_meta["lnbnn"][&2].len(), 10);
    }

    #[test]
    fn empty_query_chip_yields_empty_result_or_failure() {
        let store = store_from(vec![
            (1, random_chip(1, 40, 1)),
            (2, random_chip(2, 0, 2)),
            (3, random_chip(3, 12, 3)),
        ]);
        let cfg = knn1_no_sv();
        let out = run_query(&store, &[2, 3], &[1], &cfg, &QueryCache::default()).unwrap();
        let empty = out.get(2).expect("key present");
        assert!(empty.chipmatch.is_empty());
        assert!(empty.scores.is_empty());
        assert!(!out.get(3).unwrap().scores.is_empty());

        let strict = QueryConfig {
            strict: true,
            ..cfg
        };
        let out = run_query(&store, &[2, 3], &[1], &strict, &QueryCache::default()).unwrap();
        assert!(out.get(2).is_none());
        assert_eq!(out.failures[&2], FailureReason::NoDescriptors);
        assert!(out.get(3).is_some());
    }

    #[test]
    fn strict_mode_fails_on_empty_database_chip() {
        let store = store_from(vec![(1, random_chip(1, 20, 1)), (2, random_chip(2, 0, 2)), (3, random_chip(3, 5, 3))]);
        let cfg = QueryConfig {
            strict: true,
            ..knn1_no_sv()
        };
        let err = run_query(&store, &[3], &[1, 2], &cfg, &QueryCache::default()).expect_err("strict");
        assert_eq!(err, QueryError::Build(BuildError::NoDescriptors { chip: 2 }));
    }

    #[test]
    fn repeated_queries_are_identical_and_cached() {
        let store = store_from(vec![
            (1, random_chip(1, 60, 21)),
            (2, random_chip(2, 60, 22)),
            (3, random_chip(3, 25, 23)),
        ]);
        let mut cfg = QueryConfig::default();
        cfg.agg.score_method = ScoreMethod::Borda;

        let a = run_query(&store, &[3], &[1, 2], &cfg, &QueryCache::default()).unwrap();
        let b = run_query(&store, &[3], &[1, 2], &cfg, &QueryCache::default()).unwrap();
        assert_eq!(a, b);

        let cache = QueryCache::default();
        let first = run_query(&store, &[3], &[1, 2], &cfg, &cache).unwrap();
        let second = run_query(&store, &[3], &[1, 2], &cfg, &cache).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats().result_hits(), 1);

        // A different query over the same database reuses the index.
        run_query(&store, &[1], &[1, 2], &cfg, &cache).unwrap();
        assert_eq!(cache.stats().index_hits(), 1);

        let forced = QueryConfig {
            index: crate::config::IndexParams {
                force_recompute: true,
                ..cfg.index.clone()
            },
            ..cfg
        };
        let third = run_query(&store, &[3], &[1, 2], &forced, &cache).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(first.results, third.results);
    }

    #[test]
    fn same_image_candidate_never_appears() {
        let query = random_chip(5, 20, 31);
        let db = duplicate_of(&query, 5, 0.0, 0.0);
        let store = store_from(vec![(1, db), (2, query)]);
        let out = run_query(&store, &[2], &[1], &knn1_no_sv(), &QueryCache::default()).unwrap();
        assert!(out.get(2).unwrap().chipmatch.is_empty());
    }

    #[test]
    fn same_image_exclusion_holds_across_a_shared_cache_without_weighting() {
        let query = random_chip(5, 20, 33);
        let db = duplicate_of(&query, 5, 0.0, 0.0);
        let store = store_from(vec![(1, db), (2, query)]);
        let cache = QueryCache::default();

        let mut allowed = knn1_no_sv();
        allowed.filter.enabled = false;
        allowed.filter.can_match_sameimg = true;
        let mut excluded = allowed.clone();
        excluded.filter.can_match_sameimg = false;

        let a = run_query(&store, &[2], &[1], &allowed, &cache).unwrap();
        assert_eq!(a.get(2).unwrap().chipmatch.len(), 1);
        let b = run_query(&store, &[2], &[1], &excluded, &cache).unwrap();
        assert!(b.get(2).unwrap().chipmatch.is_empty());
        assert_eq!(cache.stats().result_hits(), 0);
    }

    #[test]
    fn verified_duplicate_keeps_every_correspondence() {
        let query = random_chip(1, 30, 41);
        let dup = duplicate_of(&query, 2, 5.0, 3.0);
        let store = store_from(vec![(1, query), (2, dup), (3, random_chip(3, 30, 42))]);
        let mut cfg = QueryConfig::default();
        cfg.nn.k = 1;

        let out = run_query(&store, &[1], &[2, 3], &cfg, &QueryCache::default()).unwrap();
        let res = out.get(1).unwrap();
        let cand = res.chipmatch.get(2).expect("duplicate verified");
        assert_eq!(cand.len(), 30);
        assert!(cand.fm.iter().all(|&[q, d]| q == d));
        assert_eq!(res.ranked()[0].0, 2);
    }

    #[test]
    fn one_vs_one_orients_pairs_query_first() {
        let query = random_chip(1, 20, 51);
        let dup = duplicate_of(&query, 2, 0.0, 0.0);
        let store = store_from(vec![(1, query), (2, dup), (3, random_chip(3, 20, 52))]);
        let mut cfg = knn1_no_sv();
        cfg.agg.query_type = QueryType::VsOne;

        let out = run_query(&store, &[1], &[2, 3], &cfg, &QueryCache::default()).unwrap();
        let res = out.get(1).unwrap();
        let cand = res.chipmatch.get(2).expect("probe 2 matched");
        assert_eq!(cand.len(), 20);
        assert!(cand.fm.iter().all(|&[q, p]| q == p));
        assert_eq!(res.ranked()[0].0, 2);
        assert!(res.filter_meta["lnbnn"].contains_key(&3));

        let err = run_query(&store, &[1, 2], &[3], &cfg, &QueryCache::default()).expect_err("two queries");
        assert!(matches!(err, QueryError::InvalidConfig(_)));
    }

    #[test]
    fn one_vs_one_empty_query_chip() {
        let store = store_from(vec![(1, random_chip(1, 0, 1)), (2, random_chip(2, 10, 2))]);
        let mut cfg = knn1_no_sv();
        cfg.agg.query_type = QueryType::VsOne;
        let out = run_query(&store, &[1], &[2], &cfg, &QueryCache::default()).unwrap();
        assert!(out.get(1).unwrap().chipmatch.is_empty());

        cfg.strict = true;
        let out = run_query(&store, &[1], &[2], &cfg, &QueryCache::default()).unwrap();
        assert_eq!(out.failures[&1], FailureReason::NoDescriptors);
    }

    #[test]
    fn threshold_filter_can_empty_the_match() {
        let store: InMemoryStore = store_from(vec![(1, random_chip(1, 30, 61)), (2, random_chip(2, 10, 62))]);
        let mut cfg = knn1_no_sv();
        // Ratios are positive, so a negative threshold rejects every vote.
        cfg.filter.filters = vec![FilterSpec::new("ratio").with_threshold(1.0, -1.0)];
        let out = run_query(&store, &[2], &[1], &cfg, &QueryCache::default()).unwrap();
        assert!(out.get(2).unwrap().scores.is_empty());
    }
}
