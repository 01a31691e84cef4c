//! Configuration layer: typed settings with layered precedence (file, then env, then CLI).

use std::{
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueEnum, builder::BoolishValueParser};
use config::{Config, Environment, File};
use freshcache_types::{ContentType, Priority, RequesterRole};
use serde::Deserialize;
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{CacheConfig, MAX_TTL_SECS, TtlPolicy};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "freshcache";
const ENV_PREFIX: &str = "FRESHCACHE";
const DEFAULT_EDGE_KV_API_BASE: &str = "https://api.cloudflare.com/client/v4/";
const DEFAULT_EDGE_KV_REQUEST_TIMEOUT_MS: u64 = 2_000;

/// Command-line arguments for the freshcache binary.
#[derive(Debug, Parser)]
#[command(
    name = "freshcache",
    version,
    about = "Inspect and operate the freshcache content cache"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FRESHCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Evaluate the TTL and bypass decision for a content descriptor.
    Policy(PolicyArgs),
    /// Purge cached entries by key pattern or by tag.
    Purge(PurgeArgs),
    /// Print the metadata of one cached entry.
    Inspect(InspectArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the cache backend.
    #[arg(long = "backend", value_enum, value_name = "KIND", global = true)]
    pub backend: Option<BackendKind>,
}

#[derive(Debug, Args, Clone)]
pub struct PolicyArgs {
    /// Content type of the result.
    #[arg(long = "type", value_name = "TYPE")]
    pub content_type: ContentType,

    /// Mark the result as breaking news.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub breaking: bool,

    /// Publication time (RFC 3339).
    #[arg(long = "published-at", value_name = "TIMESTAMP", value_parser = parse_timestamp)]
    pub published_at: Option<OffsetDateTime>,

    #[arg(long, value_name = "PRIORITY", default_value = "normal")]
    pub priority: Priority,

    /// Role of the requester.
    #[arg(long, value_name = "ROLE", default_value = "anonymous")]
    pub role: RequesterRole,

    /// Evaluate as an explicit `no-cache` request.
    #[arg(long = "no-cache", action = clap::ArgAction::SetTrue)]
    pub no_cache: bool,
}

#[derive(Debug, Args, Clone)]
pub struct PurgeArgs {
    /// Key pattern: `*`, `prefix*` or an exact key.
    #[arg(
        value_name = "PATTERN",
        required_unless_present = "tags",
        conflicts_with = "tags"
    )]
    pub pattern: Option<String>,

    /// Purge every entry carrying this tag; repeatable.
    #[arg(long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,

    /// Reason recorded in the invalidation log.
    #[arg(long, value_name = "TEXT", default_value = "manual")]
    pub reason: String,
}

#[derive(Debug, Args, Clone)]
pub struct InspectArgs {
    /// Exact cache key.
    #[arg(value_name = "KEY")]
    pub key: String,
}

fn parse_timestamp(value: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|err| format!("invalid RFC 3339 timestamp: {err}"))
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub policy: PolicySettings,
    pub backend: BackendKind,
    /// Present whenever `backend` is `edge_kv`.
    pub edge_kv: Option<EdgeKvSettings>,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Memory,
    EdgeKv,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub memory_capacity: NonZeroUsize,
    pub stale_capacity: NonZeroUsize,
    pub stale_window: Duration,
    pub fetch_timeout: Duration,
    pub retry_delay: Duration,
    pub auto_consume_interval: Duration,
    pub consume_batch_limit: NonZeroUsize,
    pub max_event_queue_len: NonZeroUsize,
    pub aggregate_prefixes: Vec<String>,
}

/// TTL tiers in seconds. Every tier is positive.
#[derive(Debug, Clone)]
pub struct PolicySettings {
    pub breaking_seconds: NonZeroU64,
    pub recent_seconds: NonZeroU64,
    pub recent_window_seconds: NonZeroU64,
    pub popular_seconds: NonZeroU64,
    pub category_seconds: NonZeroU64,
    pub tag_seconds: NonZeroU64,
    pub author_seconds: NonZeroU64,
    pub page_seconds: NonZeroU64,
    pub default_seconds: NonZeroU64,
}

#[derive(Clone)]
pub struct EdgeKvSettings {
    pub api_base: Url,
    pub account_id: String,
    pub namespace_id: String,
    pub api_token: String,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for EdgeKvSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeKvSettings")
            .field("api_base", &self.api_base.as_str())
            .field("account_id", &self.account_id)
            .field("namespace_id", &self.namespace_id)
            .field("api_token", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file, environment, CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_global_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Parse the process arguments and resolve configuration, returning both.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    policy: RawPolicySettings,
    backend: Option<BackendKind>,
    edge_kv: RawEdgeKvSettings,
}

impl RawSettings {
    fn apply_global_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(backend) = overrides.backend {
            self.backend = Some(backend);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            policy,
            backend,
            edge_kv,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let policy = build_policy_settings(policy)?;
        let backend = backend.unwrap_or_default();
        let edge_kv = match backend {
            BackendKind::EdgeKv => Some(build_edge_kv_settings(edge_kv)?),
            BackendKind::Memory => None,
        };

        Ok(Self {
            logging,
            cache,
            policy,
            backend,
            edge_kv,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();

    let memory_capacity = non_zero_usize(
        cache.memory_capacity.unwrap_or(defaults.memory_capacity),
        "cache.memory_capacity",
    )?;
    let stale_capacity = non_zero_usize(
        cache.stale_capacity.unwrap_or(defaults.stale_capacity),
        "cache.stale_capacity",
    )?;
    let consume_batch_limit = non_zero_usize(
        cache
            .consume_batch_limit
            .unwrap_or(defaults.consume_batch_limit),
        "cache.consume_batch_limit",
    )?;
    let max_event_queue_len = non_zero_usize(
        cache
            .max_event_queue_len
            .unwrap_or(defaults.max_event_queue_len),
        "cache.max_event_queue_len",
    )?;

    let fetch_timeout_ms = cache.fetch_timeout_ms.unwrap_or(defaults.fetch_timeout_ms);
    if fetch_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.fetch_timeout_ms",
            "must be greater than zero",
        ));
    }

    let stale_window_seconds = cache
        .stale_window_seconds
        .unwrap_or(defaults.stale_window_seconds);
    if stale_window_seconds > MAX_TTL_SECS {
        return Err(LoadError::invalid(
            "cache.stale_window_seconds",
            format!("must not exceed {MAX_TTL_SECS} seconds"),
        ));
    }

    let auto_consume_interval_ms = cache
        .auto_consume_interval_ms
        .unwrap_or(defaults.auto_consume_interval_ms);
    if auto_consume_interval_ms == 0 {
        return Err(LoadError::invalid(
            "cache.auto_consume_interval_ms",
            "must be greater than zero",
        ));
    }

    let aggregate_prefixes = match cache.aggregate_prefixes {
        Some(prefixes) => {
            let prefixes: Vec<String> = prefixes
                .into_iter()
                .map(|prefix| prefix.trim().trim_end_matches([':', '*']).to_string())
                .collect();
            if prefixes.iter().any(String::is_empty) {
                return Err(LoadError::invalid(
                    "cache.aggregate_prefixes",
                    "prefixes must not be empty",
                ));
            }
            prefixes
        }
        None => defaults.aggregate_prefixes,
    };

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(defaults.enabled),
        memory_capacity,
        stale_capacity,
        stale_window: Duration::from_secs(stale_window_seconds),
        fetch_timeout: Duration::from_millis(fetch_timeout_ms),
        retry_delay: Duration::from_millis(cache.retry_delay_ms.unwrap_or(defaults.retry_delay_ms)),
        auto_consume_interval: Duration::from_millis(auto_consume_interval_ms),
        consume_batch_limit,
        max_event_queue_len,
        aggregate_prefixes,
    })
}

fn build_policy_settings(policy: RawPolicySettings) -> Result<PolicySettings, LoadError> {
    let defaults = TtlPolicy::default();

    Ok(PolicySettings {
        breaking_seconds: ttl_seconds(
            policy.breaking_seconds.unwrap_or(defaults.breaking),
            "policy.breaking_seconds",
        )?,
        recent_seconds: ttl_seconds(
            policy.recent_seconds.unwrap_or(defaults.recent),
            "policy.recent_seconds",
        )?,
        recent_window_seconds: ttl_seconds(
            policy.recent_window_seconds.unwrap_or(defaults.recent_window),
            "policy.recent_window_seconds",
        )?,
        popular_seconds: ttl_seconds(
            policy.popular_seconds.unwrap_or(defaults.popular),
            "policy.popular_seconds",
        )?,
        category_seconds: ttl_seconds(
            policy.category_seconds.unwrap_or(defaults.category),
            "policy.category_seconds",
        )?,
        tag_seconds: ttl_seconds(
            policy.tag_seconds.unwrap_or(defaults.tag),
            "policy.tag_seconds",
        )?,
        author_seconds: ttl_seconds(
            policy.author_seconds.unwrap_or(defaults.author),
            "policy.author_seconds",
        )?,
        page_seconds: ttl_seconds(
            policy.page_seconds.unwrap_or(defaults.page),
            "policy.page_seconds",
        )?,
        default_seconds: ttl_seconds(
            policy.default_seconds.unwrap_or(defaults.default),
            "policy.default_seconds",
        )?,
    })
}

fn build_edge_kv_settings(edge_kv: RawEdgeKvSettings) -> Result<EdgeKvSettings, LoadError> {
    let raw_base = edge_kv
        .api_base
        .unwrap_or_else(|| DEFAULT_EDGE_KV_API_BASE.to_string());
    let api_base = Url::parse(raw_base.trim())
        .map_err(|err| LoadError::invalid("edge_kv.api_base", format!("invalid url: {err}")))?;
    if api_base.cannot_be_a_base() {
        return Err(LoadError::invalid(
            "edge_kv.api_base",
            "url cannot be used as a base",
        ));
    }

    let request_timeout_ms = edge_kv
        .request_timeout_ms
        .unwrap_or(DEFAULT_EDGE_KV_REQUEST_TIMEOUT_MS);
    if request_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "edge_kv.request_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(EdgeKvSettings {
        api_base,
        account_id: required(edge_kv.account_id, "edge_kv.account_id")?,
        namespace_id: required(edge_kv.namespace_id, "edge_kv.namespace_id")?,
        api_token: required(edge_kv.api_token, "edge_kv.api_token")?,
        request_timeout: Duration::from_millis(request_timeout_ms),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    memory_capacity: Option<usize>,
    stale_capacity: Option<usize>,
    stale_window_seconds: Option<u64>,
    fetch_timeout_ms: Option<u64>,
    retry_delay_ms: Option<u64>,
    auto_consume_interval_ms: Option<u64>,
    consume_batch_limit: Option<usize>,
    max_event_queue_len: Option<usize>,
    aggregate_prefixes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPolicySettings {
    breaking_seconds: Option<u64>,
    recent_seconds: Option<u64>,
    recent_window_seconds: Option<u64>,
    popular_seconds: Option<u64>,
    category_seconds: Option<u64>,
    tag_seconds: Option<u64>,
    author_seconds: Option<u64>,
    page_seconds: Option<u64>,
    default_seconds: Option<u64>,
}

#[derive(Clone, Deserialize, Default)]
#[serde(default)]
struct RawEdgeKvSettings {
    api_base: Option<String>,
    account_id: Option<String>,
    namespace_id: Option<String>,
    api_token: Option<String>,
    request_timeout_ms: Option<u64>,
}

impl std::fmt::Debug for RawEdgeKvSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawEdgeKvSettings")
            .field("api_base", &self.api_base)
            .field("account_id", &self.account_id)
            .field("namespace_id", &self.namespace_id)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

fn required(value: Option<String>, key: &'static str) -> Result<String, LoadError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| LoadError::invalid(key, "required when backend is `edge_kv`"))
}

fn non_zero_u64(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn ttl_seconds(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    if value > MAX_TTL_SECS {
        return Err(LoadError::invalid(
            key,
            format!("must not exceed {MAX_TTL_SECS} seconds"),
        ));
    }
    non_zero_u64(value, key)
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
