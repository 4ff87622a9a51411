//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use markwise_core::{
    CancellationToken, ContentFetcher, LlmClient, MetadataGenerator, OpenAiClient, Pipeline,
    PipelineOutcome, ProgressReporter, RecordOutcome, ResilientCache, RetryPolicy,
    TaxonomyBuilder, export_metadata, export_summary, export_tree, organize,
};
use markwise_shared::{
    AppConfig, MarkwiseError, PipelineSettings, init_config, load_config, load_config_from,
    validate_api_key,
};
use markwise_storage::{CacheStore, MemoryCache, Storage};

use crate::records::load_records;
use crate::render::{RenderOptions, render_tree};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Markwise: enrich bookmarks with generated names and descriptions, then
/// organize them into folders.
#[derive(Parser)]
#[command(
    name = "markwise",
    version,
    about = "Enrich bookmarks with LLM-generated metadata and organize them into folders.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.markwise/markwise.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Enrich a bookmark feed and organize it into a folder tree.
    Organize(OrganizeArgs),

    /// Inspect or maintain the cache database.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
pub(crate) struct OrganizeArgs {
    /// Bookmark feed: a JSON array or one JSON object per line.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Process at most this many records.
    #[arg(long)]
    pub max: Option<usize>,

    /// Records processed concurrently.
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Resolve from cache only; records without cached metadata are skipped.
    #[arg(long, conflicts_with = "force_refresh")]
    pub no_scrape: bool,

    /// Ignore cached entries (fresh results are still written).
    #[arg(long)]
    pub force_refresh: bool,

    /// Use an in-memory cache for this run only.
    #[arg(long)]
    pub no_cache: bool,

    /// Stop after enrichment; do not build a folder tree.
    #[arg(long)]
    pub no_tree: bool,

    /// Override the configured LLM model.
    #[arg(long)]
    pub model: Option<String>,

    /// Write the folder tree as JSON.
    #[arg(long)]
    pub json_out: Option<PathBuf>,

    /// Write the generated metadata list as JSON.
    #[arg(long)]
    pub metadata_out: Option<PathBuf>,

    /// Write per-record outcomes and run totals as JSON.
    #[arg(long)]
    pub summary_out: Option<PathBuf>,

    /// Show URLs under each bookmark in the printed tree.
    #[arg(long)]
    pub show_urls: bool,

    /// Show descriptions under each bookmark in the printed tree.
    #[arg(long)]
    pub show_descriptions: bool,

    /// Token for the Browserless render service.
    #[arg(long, env = "BROWSERLESS_TOKEN", hide_env_values = true)]
    pub browserless_token: Option<String>,
}

/// Cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Show entry counts and cached token spend.
    Stats,
    /// Delete every cached entry.
    Clear,
    /// Delete expired entries.
    Purge,
    /// Delete both cached stages for one URL.
    Invalidate {
        url: String,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so stdout
/// carries only command output.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "markwise=info",
        1 => "markwise=debug",
        _ => "markwise=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    match cli.command {
        Command::Organize(args) => cmd_organize(config, args).await,
        Command::Cache { action } => match action {
            CacheAction::Stats => cmd_cache_stats(&config).await,
            CacheAction::Clear => cmd_cache_clear(&config).await,
            CacheAction::Purge => cmd_cache_purge(&config).await,
            CacheAction::Invalidate { url } => cmd_cache_invalidate(&config, &url).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&config).await,
        },
    }
}

// ---------------------------------------------------------------------------
// organize
// ---------------------------------------------------------------------------

async fn cmd_organize(mut config: AppConfig, args: OrganizeArgs) -> Result<()> {
    if let Some(concurrency) = args.concurrency {
        config.defaults.concurrency = concurrency;
    }
    if let Some(max) = args.max {
        config.defaults.max_records = max;
    }
    if let Some(model) = &args.model {
        config.llm.model = model.clone();
    }

    let mut settings = PipelineSettings::from(&config);
    settings.cache_only = args.no_scrape;
    settings.force_refresh = args.force_refresh;

    // Cache-only runs without a tree never reach the provider.
    let needs_llm = !settings.cache_only || !args.no_tree;
    let api_key = if needs_llm {
        validate_api_key(&config)?
    } else {
        String::new()
    };

    let records = load_records(&args.input)?;
    info!(
        input = %args.input.display(),
        records = records.len(),
        concurrency = settings.concurrency,
        cache_only = settings.cache_only,
        "loaded bookmark feed"
    );

    let store = open_store(&config, args.no_cache).await?;
    let retry = RetryPolicy::from(&config.retry);
    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(api_key, &config.llm)?);
    let fetcher = ContentFetcher::from_config(&config, args.browserless_token.clone())?;

    let pipeline = Pipeline::new(
        Arc::new(fetcher),
        Arc::new(MetadataGenerator::new(Arc::clone(&llm), retry.clone())),
        Arc::new(ResilientCache::new(store)),
        settings,
    );
    let builder = (!args.no_tree)
        .then(|| TaxonomyBuilder::new(Arc::clone(&llm), retry, config.taxonomy.clone()));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, letting in-flight records finish");
            interrupt.cancel();
        }
    });

    let progress = CliProgress::new();
    let result = organize(&pipeline, builder.as_ref(), records, &cancel, &progress).await;
    progress.finish();
    let result = result?;

    let summary = &result.summary;
    if let Some(path) = &args.metadata_out {
        export_metadata(path, &summary.metadata())?;
    }
    if let Some(path) = &args.summary_out {
        export_summary(path, summary)?;
    }

    if let Some(taxonomy) = &result.taxonomy {
        if let Some(path) = &args.json_out {
            export_tree(path, taxonomy)?;
        }

        println!();
        print!(
            "{}",
            render_tree(
                &taxonomy.root,
                RenderOptions {
                    show_urls: args.show_urls,
                    show_descriptions: args.show_descriptions,
                },
            )
        );
        if taxonomy.fallback {
            println!("  (the model did not return a usable tree; everything is uncategorized)");
        }
    }

    println!();
    println!("  Records:    {}", summary.total());
    println!("  Succeeded:  {} ({} from cache)", summary.succeeded, summary.cache_hits);
    println!("  Skipped:    {}", summary.skipped);
    println!("  Failed:     {}", summary.failed);
    if let Some(taxonomy) = &result.taxonomy {
        println!(
            "  Tree:       {} folders, {} bookmarks",
            taxonomy.root.folder_count(),
            taxonomy.root.bookmark_count()
        );
    }
    if let Some(error) = &result.tree_error {
        println!("  Tree:       not built ({error})");
    }
    let tree_tokens = result.taxonomy.as_ref().map_or(0, |t| t.tokens_used);
    println!("  Tokens:     {}", summary.tokens_used + tree_tokens);
    if summary.cache_degraded > 0 {
        println!("  Cache:      {} degraded operations", summary.cache_degraded);
    }
    println!("  Time:       {:.1}s", summary.elapsed.as_secs_f64());
    for (record, error) in summary.failures().filter(|(_, e)| !e.is_cancelled()).take(10) {
        println!("    ✗ {}: {error}", record.url);
    }
    println!();

    if cancel.is_cancelled() {
        return Err(eyre!("run interrupted"));
    }
    Ok(())
}

async fn open_store(config: &AppConfig, no_cache: bool) -> Result<Arc<dyn CacheStore>> {
    if no_cache || !config.cache.enabled {
        info!("using in-memory cache for this run");
        return Ok(Arc::new(MemoryCache::new()));
    }
    let path = config.cache.resolve_path()?;
    Ok(Arc::new(Storage::open(&path).await?))
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner that becomes a bar once
/// the record count is known.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .expect("valid progress template")
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn started(&self, total: usize) {
        self.bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .expect("valid progress template")
                .progress_chars("=> "),
        );
        self.bar.set_length(total as u64);
        self.bar.set_position(0);
    }

    fn record_finished(&self, outcome: &RecordOutcome, done: usize, _total: usize) {
        self.bar.set_position(done as u64);
        let mark = match &outcome.outcome {
            PipelineOutcome::Success { from_cache: true, .. } => "cached",
            PipelineOutcome::Success { .. } => "done",
            PipelineOutcome::Skipped { .. } => "skipped",
            PipelineOutcome::Failed { .. } => "failed",
        };
        self.bar.set_message(format!("{mark}: {}", outcome.record.url));
    }
}

// ---------------------------------------------------------------------------
// cache
// ---------------------------------------------------------------------------

fn cache_path(config: &AppConfig) -> Result<PathBuf> {
    Ok(config.cache.resolve_path()?)
}

async fn cmd_cache_stats(config: &AppConfig) -> Result<()> {
    let path = cache_path(config)?;
    let storage = match Storage::open_readonly(&path).await {
        Ok(storage) => storage,
        Err(MarkwiseError::Storage(_)) if !path.exists() => {
            println!("No cache at {}", path.display());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let stats = storage.stats().await?;
    println!();
    println!("  Cache:      {}", path.display());
    println!("  Scrapes:    {}", stats.scrape_entries);
    println!("  Metadata:   {}", stats.metadata_entries);
    println!("  Expired:    {}", stats.expired_entries);
    println!("  Tokens:     {}", stats.total_tokens);
    println!();
    Ok(())
}

async fn open_writable(path: &Path) -> Result<Storage> {
    Ok(Storage::open(path).await?)
}

async fn cmd_cache_clear(config: &AppConfig) -> Result<()> {
    let storage = open_writable(&cache_path(config)?).await?;
    let removed = storage.clear().await?;
    println!("Removed {removed} cache entries.");
    Ok(())
}

async fn cmd_cache_purge(config: &AppConfig) -> Result<()> {
    let storage = open_writable(&cache_path(config)?).await?;
    let removed = storage.purge_expired().await?;
    println!("Purged {removed} expired cache entries.");
    Ok(())
}

async fn cmd_cache_invalidate(config: &AppConfig, url: &str) -> Result<()> {
    let storage = open_writable(&cache_path(config)?).await?;
    let removed = storage.invalidate(url.trim()).await?;
    println!("Removed {removed} cache entries for {}.", url.trim());
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}
