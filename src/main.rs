use std::{collections::BTreeSet, process, sync::Arc};

use freshcache::{
    cache::{
        CacheBackend, CacheConfig, CacheStore, EdgeKvBackend, EdgeKvConfig, EventQueue,
        InvalidationBus, InvalidationTarget, KeyPattern, MemoryBackend, TtlPolicy,
    },
    config::{self, BackendKind, Command, InspectArgs, PolicyArgs, PurgeArgs, Settings},
    infra::{error::InfraError, telemetry},
};
use freshcache_types::{ContentDescriptor, RequestFlags};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_error(&error);
        process::exit(1);
    }
}

fn report_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "freshcache command failed");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "freshcache command failed");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        InfraError::configuration(format!("failed to load configuration: {err}"))
    })?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Command::Policy(args) => run_policy(&settings, &args),
        Command::Purge(args) => run_purge(&settings, args).await,
        Command::Inspect(args) => run_inspect(&settings, &args).await,
    }
}

#[derive(Serialize)]
struct PolicyReport {
    descriptor: ContentDescriptor,
    flags: RequestFlags,
    ttl_seconds: u64,
    bypass: bool,
}

fn run_policy(settings: &Settings, args: &PolicyArgs) -> Result<(), InfraError> {
    let policy = TtlPolicy::from(&settings.policy);

    let mut descriptor = ContentDescriptor::new(args.content_type)
        .breaking(args.breaking)
        .priority(args.priority);
    if let Some(published_at) = args.published_at {
        descriptor = descriptor.published_at(published_at);
    }
    let flags = RequestFlags {
        no_cache: args.no_cache,
        role: args.role,
    };

    let report = PolicyReport {
        descriptor,
        flags,
        ttl_seconds: policy.ttl_for(&descriptor),
        bypass: policy.should_bypass(Some(&descriptor), &flags),
    };
    print_json(&report)
}

async fn run_purge(settings: &Settings, args: PurgeArgs) -> Result<(), InfraError> {
    if settings.backend == BackendKind::Memory {
        warn!("Purging an in-process memory backend only affects this command's own store");
    }

    let cache_config = CacheConfig::from(&settings.cache);
    let store = Arc::new(build_store(settings, &cache_config)?);
    let queue = Arc::new(EventQueue::new(cache_config.max_event_queue_len));
    let bus = InvalidationBus::new(cache_config, store, queue);

    let target = match args.pattern {
        Some(pattern) => InvalidationTarget::from(KeyPattern::parse(&pattern)),
        None => InvalidationTarget::tags(args.tags),
    };
    info!(target = ?target, reason = %args.reason, "Purging cache entries");

    let report = bus.invalidate(target, &args.reason).await;
    print_json(&report)
}

#[derive(Serialize)]
struct InspectReport<'a> {
    key: &'a str,
    backend: &'static str,
    found: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    stored_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    expires_at: Option<OffsetDateTime>,
    ttl_seconds: Option<u64>,
    tags: BTreeSet<String>,
    value_bytes: Option<usize>,
}

async fn run_inspect(settings: &Settings, args: &InspectArgs) -> Result<(), InfraError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let store = build_store(settings, &cache_config)?;

    let entry = store.get_entry::<serde_json::Value>(&args.key).await;
    let report = match entry {
        Some(entry) => InspectReport {
            key: &args.key,
            backend: store.backend_name(),
            found: true,
            stored_at: Some(entry.stored_at),
            expires_at: i64::try_from(entry.ttl_seconds)
                .ok()
                .and_then(|ttl| entry.stored_at.checked_add(time::Duration::seconds(ttl))),
            ttl_seconds: Some(entry.ttl_seconds),
            value_bytes: serde_json::to_vec(&entry.value).ok().map(|raw| raw.len()),
            tags: entry.tags,
        },
        None => InspectReport {
            key: &args.key,
            backend: store.backend_name(),
            found: false,
            stored_at: None,
            expires_at: None,
            ttl_seconds: None,
            tags: BTreeSet::new(),
            value_bytes: None,
        },
    };
    print_json(&report)
}

fn build_store(settings: &Settings, cache_config: &CacheConfig) -> Result<CacheStore, InfraError> {
    let backend: Arc<dyn CacheBackend> = match settings.backend {
        BackendKind::Memory => Arc::new(MemoryBackend::new(cache_config.memory_capacity_non_zero())),
        BackendKind::EdgeKv => {
            let edge_kv = settings.edge_kv.as_ref().ok_or_else(|| {
                InfraError::configuration("edge_kv backend selected without [edge_kv] settings")
            })?;
            Arc::new(EdgeKvBackend::new(EdgeKvConfig::from(edge_kv))?)
        }
    };
    info!(backend = backend.name(), "Cache store ready");
    Ok(CacheStore::new(backend, cache_config))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), InfraError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
