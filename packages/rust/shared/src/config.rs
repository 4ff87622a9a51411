//! Application configuration for Markwise.
//!
//! User config lives at `~/.markwise/markwise.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MarkwiseError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "markwise.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".markwise";

/// Default cache database file name inside the config directory.
const CACHE_FILE_NAME: &str = "cache.db";

// ---------------------------------------------------------------------------
// Config structs (matching markwise.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub scraping: ScrapingConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub taxonomy: TaxonomyConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Maximum records processed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Cap on records taken from the feed. `0` means unlimited.
    #[serde(default)]
    pub max_records: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_records: 0,
        }
    }
}

fn default_concurrency() -> usize {
    4
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of an OpenAI-compatible API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Per-call timeout.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o".into()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_llm_timeout() -> u64 {
    30
}

/// Which render engine to use for a fetch stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Plain HTTP GET.
    Http,
    /// Full page render through a Browserless-compatible service.
    Browserless,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
            Self::Browserless => f.write_str("browserless"),
        }
    }
}

/// `[scraping]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapingConfig {
    #[serde(default = "default_scrape_timeout")]
    pub timeout_secs: u64,

    /// Upper bound on extracted text, in characters.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_primary_engine")]
    pub primary_engine: EngineKind,

    /// Engine tried after the primary gives up. Ignored when equal to the primary.
    #[serde(default = "default_fallback_engine")]
    pub fallback_engine: Option<EngineKind>,

    /// Browserless endpoint, e.g. `http://localhost:3000`.
    #[serde(default)]
    pub browserless_url: Option<String>,

    /// Allow fetching loopback and private-network hosts.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_scrape_timeout(),
            max_content_length: default_max_content_length(),
            user_agent: default_user_agent(),
            primary_engine: default_primary_engine(),
            fallback_engine: default_fallback_engine(),
            browserless_url: None,
            allow_private_hosts: false,
        }
    }
}

fn default_scrape_timeout() -> u64 {
    10
}
fn default_max_content_length() -> usize {
    10_000
}
fn default_user_agent() -> String {
    format!("markwise/{}", env!("CARGO_PKG_VERSION"))
}
fn default_primary_engine() -> EngineKind {
    EngineKind::Http
}
fn default_fallback_engine() -> Option<EngineKind> {
    Some(EngineKind::Browserless)
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_rate_limit_min_ms")]
    pub rate_limit_min_ms: u64,

    #[serde(default = "default_rate_limit_max_ms")]
    pub rate_limit_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            rate_limit_min_ms: default_rate_limit_min_ms(),
            rate_limit_max_ms: default_rate_limit_max_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    2_000
}
fn default_rate_limit_min_ms() -> u64 {
    5_000
}
fn default_rate_limit_max_ms() -> u64 {
    15_000
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_ttl_days")]
    pub ttl_days: u64,

    /// Database file. Defaults to `~/.markwise/cache.db`.
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_days: default_ttl_days(),
            path: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_days * 24 * 60 * 60)
    }

    /// Resolve the database path, falling back to the default location.
    pub fn resolve_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(p) => Ok(PathBuf::from(p)),
            None => default_cache_path(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_ttl_days() -> u64 {
    30
}

/// `[taxonomy]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyConfig {
    /// Deepest allowed folder level below the root.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    #[serde(default = "default_root_name")]
    pub root_name: String,

    /// Folder that receives bookmarks the model left out.
    #[serde(default = "default_uncategorized_name")]
    pub uncategorized_name: String,
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            root_name: default_root_name(),
            uncategorized_name: default_uncategorized_name(),
        }
    }
}

fn default_max_depth() -> usize {
    3
}
fn default_root_name() -> String {
    "Bookmarks".into()
}
fn default_uncategorized_name() -> String {
    "Uncategorized".into()
}

// ---------------------------------------------------------------------------
// Pipeline settings (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline settings, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Admission limit for concurrently processed records.
    pub concurrency: usize,
    /// Truncate the feed to this many records before scheduling.
    pub max_records: Option<usize>,
    /// Resolve from cache only; records without a hit are skipped.
    pub cache_only: bool,
    /// Ignore cache reads (writes still happen).
    pub force_refresh: bool,
    /// TTL applied to new cache entries.
    pub cache_ttl: Duration,
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            concurrency: config.defaults.concurrency.max(1),
            max_records: match config.defaults.max_records {
                0 => None,
                n => Some(n),
            },
            cache_only: false,
            force_refresh: false,
            cache_ttl: config.cache.ttl(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.markwise/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| MarkwiseError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.markwise/markwise.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Default location of the cache database (`~/.markwise/cache.db`).
pub fn default_cache_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CACHE_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| MarkwiseError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| MarkwiseError::config(format!("failed to parse {}: {e}", path.display())))?;

    if config.retry.rate_limit_min_ms > config.retry.rate_limit_max_ms {
        return Err(MarkwiseError::config(
            "retry.rate_limit_min_ms must not exceed retry.rate_limit_max_ms",
        ));
    }

    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| MarkwiseError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| MarkwiseError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| MarkwiseError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the LLM API key env var is set and non-empty, returning its value.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.llm.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(MarkwiseError::config(format!(
            "LLM API key not found. Set the {var_name} environment variable."
        ))),
    }
}
