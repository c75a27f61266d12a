//! chipmatch CLI — run chip queries over a JSON dataset.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use chipmatch::{ChipId, InMemoryStore, Matcher, QueryConfig, QueryType, ScoreMethod};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "chipmatch")]
#[command(about = "Match query chips against a chip database (kd-forest search, spatial verification, scoring)")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score database chips for each query chip.
    Query(CliQueryArgs),

    /// Build the descriptor index for a database and save it to the index directory.
    BuildIndex(CliBuildIndexArgs),

    /// Print the default query configuration (JSON).
    DefaultConfig {
        /// Write to this file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Args)]
struct CliDatasetArgs {
    /// Dataset JSON (`chipmatch.dataset.v1`).
    #[arg(long)]
    dataset: PathBuf,

    /// Query configuration JSON. Missing fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database chip ids (comma separated). Defaults to every chip.
    #[arg(long, value_delimiter = ',')]
    database: Vec<ChipId>,

    /// Directory for cached kd-forest files.
    #[arg(long)]
    index_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct CliQueryArgs {
    #[command(flatten)]
    data: CliDatasetArgs,

    /// Query chip ids (comma separated). Defaults to every chip.
    #[arg(long, value_delimiter = ',')]
    query: Vec<ChipId>,

    /// Path to write query results (JSON). Prints to stdout when omitted.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Voting neighbors per query feature.
    #[arg(long)]
    k: Option<usize>,

    /// Normalizer neighbors per query feature.
    #[arg(long)]
    k_norm: Option<usize>,

    /// Scoring method (csum, pl, borda, topk, coverage0/1/2).
    #[arg(long)]
    score_method: Option<String>,

    #[arg(long, value_enum)]
    query_type: Option<QueryTypeArg>,

    /// Disable spatial verification.
    #[arg(long)]
    no_sv: bool,

    /// Fail on chips without descriptors instead of treating them as empty.
    #[arg(long)]
    strict: bool,

    /// Rebuild indices even when a cached one exists.
    #[arg(long)]
    force_recompute: bool,

    /// Candidates per query chip to log.
    #[arg(long, default_value = "5")]
    top: usize,
}

#[derive(Debug, Clone, Args)]
struct CliBuildIndexArgs {
    #[command(flatten)]
    data: CliDatasetArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum QueryTypeArg {
    VsMany,
    VsOne,
}

impl QueryTypeArg {
    fn to_core(self) -> QueryType {
        match self {
            Self::VsMany => QueryType::VsMany,
            Self::VsOne => QueryType::VsOne,
        }
    }
}

impl CliQueryArgs {
    fn apply_overrides(&self, config: &mut QueryConfig) -> CliResult<()> {
        if let Some(k) = self.k {
            config.nn.k = k;
        }
        if let Some(k_norm) = self.k_norm {
            config.nn.k_norm = k_norm;
        }
        if let Some(method) = &self.score_method {
            config.agg.score_method = method.parse::<ScoreMethod>()?;
        }
        if let Some(qt) = self.query_type {
            config.agg.query_type = qt.to_core();
        }
        if self.no_sv {
            config.sv.enabled = false;
        }
        if self.strict {
            config.strict = true;
        }
        if self.force_recompute {
            config.index.force_recompute = true;
        }
        Ok(())
    }
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Query(args) => run_query(&args),
        Commands::BuildIndex(args) => run_build_index(&args),
        Commands::DefaultConfig { out } => run_default_config(out.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> CliResult<QueryConfig> {
    match path {
        Some(path) => {
            tracing::info!("Loading config: {}", path.display());
            Ok(QueryConfig::from_json_str(&std::fs::read_to_string(path)?)?)
        }
        None => Ok(QueryConfig::default()),
    }
}

fn load_store(path: &Path) -> CliResult<InMemoryStore> {
    tracing::info!("Loading dataset: {}", path.display());
    let store = InMemoryStore::from_json_file(path)?;
    tracing::info!("{} chips loaded", store.len());
    Ok(store)
}

fn chip_list(requested: &[ChipId], store: &InMemoryStore) -> Vec<ChipId> {
    if requested.is_empty() {
        store.chip_ids()
    } else {
        requested.to_vec()
    }
}

fn build_matcher(config: QueryConfig, index_dir: Option<&Path>) -> CliResult<Matcher> {
    let matcher = Matcher::new(config)?;
    Ok(match index_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            matcher.with_index_dir(dir)
        }
        None => matcher,
    })
}

// ── query ──────────────────────────────────────────────────────────────

fn run_query(args: &CliQueryArgs) -> CliResult<()> {
    let store = load_store(&args.data.dataset)?;
    let mut config = load_config(args.data.config.as_deref())?;
    args.apply_overrides(&mut config)?;
    let matcher = build_matcher(config, args.data.index_dir.as_deref())?;

    let queries = chip_list(&args.query, &store);
    let database = chip_list(&args.data.database, &store);
    let results = matcher.run_query(&store, &queries, &database)?;

    for (query, res) in &results.results {
        let top: Vec<String> = res
            .ranked()
            .into_iter()
            .take(args.top)
            .map(|(chip, score)| format!("{chip}:{score:.3}"))
            .collect();
        tracing::info!(
            "query {}: {} candidates, top [{}]",
            query,
            res.scores.len(),
            top.join(", ")
        );
    }
    for (chip, reason) in &results.failures {
        tracing::warn!("chip {} failed: {:?}", chip, reason);
    }

    let json = serde_json::to_string_pretty(&*results)?;
    match &args.out {
        Some(out) => {
            std::fs::write(out, &json)?;
            tracing::info!("Results written to {}", out.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

// ── build-index ────────────────────────────────────────────────────────

fn run_build_index(args: &CliBuildIndexArgs) -> CliResult<()> {
    let Some(index_dir) = args.data.index_dir.as_deref() else {
        return Err("build-index needs --index-dir".into());
    };
    let store = load_store(&args.data.dataset)?;
    let config = load_config(args.data.config.as_deref())?;
    let matcher = build_matcher(config, Some(index_dir))?;

    let database = chip_list(&args.data.database, &store);
    let index = matcher.build_index(&store, &database)?;
    println!("index uid:    {}", index.uid());
    println!("chips:        {}", index.chip_ids().len());
    println!("descriptors:  {} x {}", index.n_rows(), index.dim());
    println!("content hash: {:016x}", index.data_hash());
    println!("directory:    {}", index_dir.display());
    Ok(())
}

// ── default-config ─────────────────────────────────────────────────────

fn run_default_config(out: Option<&Path>) -> CliResult<()> {
    let json = serde_json::to_string_pretty(&QueryConfig::default())?;
    match out {
        Some(path) => {
            std::fs::write(path, &json)?;
            tracing::info!("Default config written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
