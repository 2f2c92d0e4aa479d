//! Causeway CLI - causal knowledge graphs from literature predications

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use causeway_core::config::Config;
use causeway_core::consolidation::{FixedJudge, LlmSimilarityJudge, SimilarityJudge};
use causeway_core::llm::LlmClient;
use causeway_core::persistence::{GraphCache, cache_key, load_graph, source_id};
use causeway_core::pipeline::{Pipeline, RunOutput};
use causeway_core::query::{InMemoryPredicationStore, PgPredicationStore, PredicationStore};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "causeway")]
#[command(author, version, about = "Causal knowledge graph builder", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to $CAUSEWAY_CONFIG or ./causeway.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand, consolidate and write the causal graph
    Build {
        /// Read predications from a JSON fixture instead of the database
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Judge equivalence from a JSON list of name/identifier groups instead of the LLM
        #[arg(long)]
        equivalences: Option<PathBuf>,
        /// Skip the cache lookup and do not store the result
        #[arg(long)]
        no_cache: bool,
        /// Disable consolidation for this run
        #[arg(long)]
        no_consolidate: bool,
        /// Override the output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print statistics of a .dag or .bin artifact
    Inspect {
        /// Artifact path
        path: PathBuf,
    },

    /// Print the cache key for the current configuration
    CacheKey {
        /// Key the entry of a build against this fixture instead of the database
        #[arg(long)]
        fixture: Option<PathBuf>,
    },

    /// Manage the graph cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Check configuration and credentials
    Doctor,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show the cache directory
    Path,
    /// Remove the entry for the current configuration
    Remove {
        /// Remove the entry of a build against this fixture instead of the database
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Remove every cached graph
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `--format json` output stays parseable
    let default_level = if cli.quiet { "causeway=warn" } else { "causeway=info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.parse()?),
        )
        .init();

    let config_path = cli.config.clone().unwrap_or_else(Config::config_path);

    let result = match cli.command {
        Commands::Build {
            fixture,
            equivalences,
            no_cache,
            no_consolidate,
            output,
        } => {
            let options = BuildOptions {
                fixture,
                equivalences,
                no_cache,
                no_consolidate,
                output,
            };
            cmd_build(&config_path, options, cli.format, cli.quiet).await
        }
        Commands::Inspect { path } => cmd_inspect(&path, cli.format),
        Commands::CacheKey { fixture } => cmd_cache_key(&config_path, fixture.as_deref()),
        Commands::Cache { action } => cmd_cache(&config_path, action, cli.quiet).await,
        Commands::Config { action } => cmd_config(&config_path, action, cli.quiet),
        Commands::Doctor => cmd_doctor(&config_path, cli.quiet),
    };

    if let Err(e) = &result {
        if let Some(hint) = e
            .downcast_ref::<causeway_core::Error>()
            .and_then(causeway_core::Error::suggestion)
        {
            eprintln!("hint: {}", hint);
        }
    }
    result
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        Ok(Config::load_from(path)?)
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        Ok(Config::default())
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

struct BuildOptions {
    fixture: Option<PathBuf>,
    equivalences: Option<PathBuf>,
    no_cache: bool,
    no_consolidate: bool,
    output: Option<PathBuf>,
}

async fn cmd_build(
    config_path: &Path,
    options: BuildOptions,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if options.no_consolidate {
        config.consolidation.enabled = false;
    }
    if let Some(dir) = options.output {
        config.output.directory = dir;
    }
    // Fail on configuration before connecting to anything
    config.validate()?;

    let store: Arc<dyn PredicationStore> = match &options.fixture {
        Some(path) => {
            info!(fixture = %path.display(), "Using predication fixture");
            Arc::new(
                InMemoryPredicationStore::from_json_file(path)?
                    .with_max_connections(config.database.max_connections as usize),
            )
        }
        None => Arc::new(PgPredicationStore::connect(&config.database).await?),
    };

    let judge: Option<Arc<dyn SimilarityJudge>> = if !config.consolidation.enabled {
        None
    } else if let Some(path) = &options.equivalences {
        let contents = std::fs::read_to_string(path)?;
        let groups: Vec<Vec<String>> = serde_json::from_str(&contents).map_err(|e| {
            anyhow::anyhow!("Invalid equivalence file {}: {}", path.display(), e)
        })?;
        Some(Arc::new(FixedJudge::new(groups)))
    } else {
        let client = LlmClient::from_config(&config.llm)?;
        Some(Arc::new(LlmSimilarityJudge::new(Arc::new(client))))
    };

    let mut pipeline = Pipeline::new(config, store)?;
    if let Some(judge) = judge {
        pipeline = pipeline.with_judge(judge);
    }
    if options.no_cache {
        pipeline = pipeline.without_cache();
    }

    let output = pipeline.run().await?;
    print_run(&output, format, quiet)
}

fn print_run(output: &RunOutput, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let metrics = &output.metrics;
    if format == OutputFormat::Json {
        let summary = serde_json::json!({
            "cache_key": metrics.cache_key,
            "cache": metrics.cache,
            "termination": metrics.termination,
            "graph": metrics.graph,
            "rows": metrics.total_rows(),
            "clusters": output.clusters,
            "degraded": metrics.degraded,
            "artifacts": output.artifacts,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    if quiet {
        return Ok(());
    }

    println!("Causal graph built");
    println!("  Nodes: {}", metrics.graph.nodes);
    println!(
        "    exposures: {}, outcomes: {}, mediators: {}",
        metrics.graph.exposures, metrics.graph.outcomes, metrics.graph.mediators
    );
    println!("  Edges: {}", metrics.graph.edges);
    println!("  Cache: {:?} ({})", metrics.cache, metrics.cache_key);
    if let Some(termination) = metrics.termination {
        println!("  Hops: {} (stopped: {})", metrics.hops.len(), termination);
    }
    if let Some(consolidation) = &metrics.consolidation {
        println!(
            "  Consolidation: {} clusters merged, {} concepts removed",
            consolidation.clusters_merged, consolidation.concepts_removed
        );
    }
    if metrics.is_degraded() {
        println!("  [!!] Degraded: {} scopes skipped, re-run to complete", metrics.degraded.len());
    }
    println!();
    println!("  DAG:     {}", output.artifacts.dag.display());
    println!("  JSON:    {}", output.artifacts.json.display());
    println!("  Metrics: {}", output.artifacts.metrics.display());
    Ok(())
}

fn cmd_inspect(path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let graph = load_graph(path)?;
    let stats = graph.stats();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Text => {
            println!("{}", path.display());
            println!("  Nodes: {}", stats.nodes);
            println!("    exposures:    {}", stats.exposures);
            println!("    outcomes:     {}", stats.outcomes);
            println!("    mediators:    {}", stats.mediators);
            println!("    unclassified: {}", stats.unclassified);
            println!("  Edges: {}", stats.edges);
            println!("  Max depth: {}", stats.max_depth);
        }
    }
    Ok(())
}

/// Source identity a build with the same options would key its entry by
fn source_for(config: &Config, fixture: Option<&Path>) -> anyhow::Result<String> {
    let store = match fixture {
        Some(path) => InMemoryPredicationStore::from_json_file(path)?.source(),
        None => PgPredicationStore::source_for(&config.database),
    };
    Ok(source_id(&store, &config.database))
}

fn cmd_cache_key(config_path: &Path, fixture: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let settings = config.validate()?;
    let source = source_for(&config, fixture)?;
    println!("{}", cache_key(&settings, config.consolidation.enabled, &source));
    Ok(())
}

async fn cmd_cache(config_path: &Path, action: CacheAction, quiet: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let cache = GraphCache::new(config.output.resolved_cache_dir());

    match action {
        CacheAction::Path => println!("{}", cache.dir().display()),
        CacheAction::Remove { fixture } => {
            let settings = config.validate()?;
            let source = source_for(&config, fixture.as_deref())?;
            let key = cache_key(&settings, config.consolidation.enabled, &source);
            let removed = cache.remove(&key).await?;
            if !quiet {
                if removed {
                    println!("Removed cache entry {}", key);
                } else {
                    println!("No cache entry for {}", key);
                }
            }
        }
        CacheAction::Clear => {
            let removed = cache.clear().await?;
            if !quiet {
                println!("Removed {} cache entries", removed);
            }
        }
    }
    Ok(())
}

fn cmd_config(config_path: &Path, action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = load_config(config_path)?;
            println!("{}", config.get(&key)?);
        }
        ConfigAction::Set { key, value } => {
            let mut config = load_config(config_path)?;
            config.set(&key, &value)?;
            config.save(config_path)?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = load_config(config_path)?;
            for key in Config::keys() {
                match config.get(key) {
                    Ok(value) => println!("{} = {}", key, value),
                    Err(e) => println!("{} = <error: {}>", key, e),
                }
            }
        }
        ConfigAction::Path => println!("{}", config_path.display()),
    }
    Ok(())
}

fn cmd_doctor(config_path: &Path, quiet: bool) -> anyhow::Result<()> {
    let mut all_ok = true;
    let mut report = |ok: bool, line: String| {
        all_ok &= ok;
        if !quiet {
            println!("{} {}", if ok { "[OK]" } else { "[!!]" }, line);
        }
    };

    if !quiet {
        println!("Causeway Health Check");
        println!("=====================");
        println!();
    }

    match load_config(config_path) {
        Ok(config) => {
            match config.validate() {
                Ok(settings) => report(
                    true,
                    format!(
                        "Configuration: {} seeds, max {} hops, threshold {}",
                        settings.seeds().count(),
                        settings.max_hops,
                        settings.degree_threshold
                    ),
                ),
                Err(e) => report(false, format!("Configuration: {}", e)),
            }

            match config.database.resolved_password() {
                Ok(Some(_)) => report(true, "Database password: set".to_string()),
                Ok(None) => report(
                    false,
                    "Database password: not set (CAUSEWAY_DB_PASSWORD)".to_string(),
                ),
                Err(e) => report(false, format!("Database password: {}", e)),
            }

            if config.consolidation.enabled {
                match config.llm.resolved_api_key() {
                    Ok(Some(_)) => report(true, format!("LLM: {}", config.llm.model)),
                    Ok(None) => report(
                        false,
                        "LLM API key: not set (CAUSEWAY_API_KEY or OPENROUTER_API_KEY)".to_string(),
                    ),
                    Err(e) => report(false, format!("LLM API key: {}", e)),
                }
            }

            report(
                true,
                format!("Cache: {}", config.output.resolved_cache_dir().display()),
            );
        }
        Err(e) => report(false, format!("Configuration: {}", e)),
    }

    if !all_ok {
        anyhow::bail!("health check found problems");
    }
    Ok(())
}
