//! Poll-extract-dedupe-persist loop: configuration, one poll cycle, and the scheduler.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use otp_core::{CycleReport, CycleStage, Fingerprint, FingerprintedPayload, RawDocument};
use otp_query::{Expression, QueryError};
use otp_storage::{
    DedupStore, FetchError, FetchErrorKind, FsObjectStore, HttpClientConfig, HttpFetcher,
    ObjectStore, PersistError, PersistOutcome, StoreError, StoreOp,
};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "otp-poll";

pub const DEFAULT_EXPRESSION: &str = "@";
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5000;

/// Key/value lookups backing [`PollerConfig`].
pub trait ConfigSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// Process environment; blank values count as unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvConfig;

impl ConfigSource for EnvConfig {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    values: HashMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl ConfigSource for MapConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).filter(|v| !v.trim().is_empty()).cloned()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be set")]
    Missing { key: &'static str },
    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("no storage container: set S3_BUCKET or PROJECT_NAME, STAGE and PROVIDER_NAME")]
    MissingContainer,
    #[error("PROVIDER_JMESPATH_EXPRESSION is invalid")]
    Expression(#[source] QueryError),
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub provider_url: String,
    pub expression: Expression,
    pub refresh_interval: Duration,
    pub http_timeout: Duration,
    pub container: String,
    pub object_store_root: PathBuf,
    pub user_agent: String,
}

impl PollerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&EnvConfig)
    }

    pub fn from_source(source: &impl ConfigSource) -> Result<Self, ConfigError> {
        let provider_url = source.get("PROVIDER_API_ROOT").ok_or(ConfigError::Missing {
            key: "PROVIDER_API_ROOT",
        })?;

        let expression_text = source
            .get("PROVIDER_JMESPATH_EXPRESSION")
            .unwrap_or_else(|| DEFAULT_EXPRESSION.to_string());
        let expression = Expression::compile(&expression_text).map_err(ConfigError::Expression)?;

        Ok(Self {
            provider_url,
            expression,
            refresh_interval: millis(source, "PROVIDER_REFRESH_INTERVAL", DEFAULT_REFRESH_INTERVAL_MS)?,
            http_timeout: millis(source, "HTTP_TIMEOUT", DEFAULT_HTTP_TIMEOUT_MS)?,
            container: container_name(source)?,
            object_store_root: source
                .get("OBJECT_STORE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./objects")),
            user_agent: source
                .get("OTP_USER_AGENT")
                .unwrap_or_else(|| "otp-poller/0.1".to_string()),
        })
    }
}

fn millis(source: &impl ConfigSource, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let Some(raw) = source.get(key) else {
        return Ok(Duration::from_millis(default));
    };
    let ms = raw.trim().parse::<u64>().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.clone(),
        reason: "expected milliseconds",
    })?;
    if ms == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "must be greater than zero",
        });
    }
    Ok(Duration::from_millis(ms))
}

/// `S3_BUCKET` wins; otherwise `[BUCKET_NAMESPACE.]PROJECT_NAME.STAGE.PROVIDER_NAME`.
fn container_name(source: &impl ConfigSource) -> Result<String, ConfigError> {
    if let Some(bucket) = source.get("S3_BUCKET") {
        return Ok(bucket.trim().to_string());
    }
    let parts = ["PROJECT_NAME", "STAGE", "PROVIDER_NAME"]
        .iter()
        .map(|key| source.get(key).map(|v| v.trim().to_string()))
        .collect::<Option<Vec<_>>>()
        .ok_or(ConfigError::MissingContainer)?;
    let derived = parts.join(".");
    Ok(match source.get("BUCKET_NAMESPACE") {
        Some(namespace) => format!("{}.{derived}", namespace.trim()),
        None => derived,
    })
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetching provider document")]
    Fetch(#[from] FetchError),
    #[error("persisting object {key}")]
    Store {
        key: Fingerprint,
        op: StoreOp,
        #[source]
        source: StoreError,
    },
}

impl CycleError {
    pub fn stage(&self) -> CycleStage {
        match self {
            CycleError::Fetch(_) => CycleStage::Fetching,
            CycleError::Store { op: StoreOp::Put, .. } => CycleStage::Writing,
            CycleError::Store { op: StoreOp::Exists, .. } => CycleStage::CheckingExistence,
        }
    }

    pub fn key(&self) -> Option<&Fingerprint> {
        match self {
            CycleError::Fetch(_) => None,
            CycleError::Store { key, .. } => Some(key),
        }
    }
}

/// Running totals across poll cycles.
#[derive(Debug, Default)]
pub struct PollStats {
    cycles: AtomicU64,
    written: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollStatsSnapshot {
    pub cycles: u64,
    pub written: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl PollStats {
    pub fn record(&self, result: &Result<CycleReport, CycleError>) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            Ok(report) if report.written => &self.written,
            Ok(_) => &self.skipped,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PollStatsSnapshot {
        PollStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Owns the collaborators of one poll cycle: fetch, project, fingerprint, persist.
pub struct Poller {
    provider_url: String,
    expression: Expression,
    http: HttpFetcher,
    dedup: DedupStore,
    stats: PollStats,
}

impl Poller {
    pub fn new(config: &PollerConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self::from_parts(
            config.provider_url.clone(),
            config.expression.clone(),
            http,
            DedupStore::new(store),
        ))
    }

    pub fn from_parts(
        provider_url: impl Into<String>,
        expression: Expression,
        http: HttpFetcher,
        dedup: DedupStore,
    ) -> Self {
        Self {
            provider_url: provider_url.into(),
            expression,
            http,
            dedup,
            stats: PollStats::default(),
        }
    }

    pub fn stats(&self) -> PollStatsSnapshot {
        self.stats.snapshot()
    }

    /// Create the storage container up front so the first cycle never has to.
    pub async fn provision(&self) -> Result<(), StoreError> {
        self.dedup.provision().await?;
        info!(container = self.dedup.container(), "storage container ready");
        Ok(())
    }

    /// One pass through FETCHING -> PROJECTING -> FINGERPRINTING ->
    /// CHECKING_EXISTENCE -> {WRITING | SKIPPED} -> DONE.
    pub async fn run_cycle(&self, scheduled_at: DateTime<Utc>) -> Result<CycleReport, CycleError> {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("poll_cycle", %cycle_id);

        async move {
            debug!(stage = %CycleStage::Fetching, url = %self.provider_url);
            let document: RawDocument = self.http.fetch_json(&self.provider_url).await?;

            debug!(stage = %CycleStage::Projecting, expression = %self.expression);
            let projection = self.expression.search(&document);
            if projection.is_null() {
                debug!("expression matched nothing; storing null projection");
            }

            let payload = FingerprintedPayload::from_projection(&projection);
            debug!(stage = %CycleStage::Fingerprinting, key = %payload.key, bytes = payload.bytes.len());

            let outcome = self
                .dedup
                .persist_if_new(&payload.key, &payload.bytes)
                .await
                .map_err(|PersistError { op, source }| CycleError::Store {
                    key: payload.key.clone(),
                    op,
                    source,
                })?;
            let stage = match outcome {
                PersistOutcome::Written => CycleStage::Writing,
                PersistOutcome::Skipped => CycleStage::Skipped,
            };
            debug!(%stage, key = %payload.key, "cycle done");

            Ok::<_, CycleError>(CycleReport {
                cycle_id,
                scheduled_at,
                started_at,
                finished_at: Utc::now(),
                key: payload.key,
                bytes: payload.bytes.len(),
                written: outcome.written(),
            })
        }
        .instrument(span)
        .await
    }

    /// Run a cycle, log its outcome by error kind, and fold it into the stats.
    pub async fn poll_once(&self, scheduled_at: DateTime<Utc>) -> Result<CycleReport, CycleError> {
        let result = self.run_cycle(scheduled_at).await;
        self.stats.record(&result);
        if let Err(err) = &result {
            log_cycle_error(err);
        }
        let stats = self.stats.snapshot();
        debug!(
            cycles = stats.cycles,
            written = stats.written,
            skipped = stats.skipped,
            failed = stats.failed,
            "poll stats"
        );
        result
    }

    /// Poll on `scheduler`'s cadence until the process is stopped.
    pub async fn run(&self, scheduler: &Scheduler) {
        scheduler
            .run(move |now| async move {
                let _ = self.poll_once(now).await;
            })
            .await
    }

    pub async fn run_cycles(&self, scheduler: &Scheduler, cycles: u64) -> PollStatsSnapshot {
        scheduler
            .run_cycles(cycles, move |now| async move {
                let _ = self.poll_once(now).await;
            })
            .await;
        self.stats()
    }
}

fn log_cycle_error(err: &CycleError) {
    let stage = err.stage();
    match err {
        CycleError::Fetch(fetch) => match fetch.kind() {
            FetchErrorKind::Transport => warn!(
                %stage,
                timeout = fetch.is_timeout(),
                error = %error_chain(fetch),
                "transport error; cycle failed"
            ),
            FetchErrorKind::Decode => warn!(%stage, error = %error_chain(fetch), "decode error; cycle failed"),
        },
        CycleError::Store { key, source, .. } => {
            let kind = match source {
                StoreError::ContainerMissing { .. } | StoreError::Access { .. } => "store access error",
                StoreError::Provision { .. } => "store provisioning error",
                StoreError::Write { .. } => "store write error",
                StoreError::InvalidKey { .. } => "store error",
            };
            error!(%stage, %key, error = %error_chain(source), "{kind}; cycle failed");
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Fixed-interval driver that never overlaps cycles.
///
/// Each cycle is awaited before the next tick is taken. A cycle that outlasts
/// the interval delays the next one instead of running it concurrently or
/// dropping it.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    interval: Duration,
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn run<F, Fut>(&self, cycle: F)
    where
        F: FnMut(DateTime<Utc>) -> Fut,
        Fut: Future<Output = ()>,
    {
        self.drive(None, cycle).await
    }

    pub async fn run_cycles<F, Fut>(&self, cycles: u64, cycle: F)
    where
        F: FnMut(DateTime<Utc>) -> Fut,
        Fut: Future<Output = ()>,
    {
        self.drive(Some(cycles), cycle).await
    }

    async fn drive<F, Fut>(&self, limit: Option<u64>, mut cycle: F)
    where
        F: FnMut(DateTime<Utc>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut completed = 0u64;
        while limit.map_or(true, |limit| completed < limit) {
            ticker.tick().await;
            cycle(Utc::now()).await;
            completed += 1;
        }
    }
}

/// Load [`PollerConfig`] from the environment and wire a filesystem-backed poller.
pub fn poller_from_env() -> Result<(PollerConfig, Poller)> {
    let config = PollerConfig::from_env().context("loading poller configuration")?;
    let store = FsObjectStore::new(config.object_store_root.clone(), config.container.clone());
    let poller = Poller::new(&config, Arc::new(store)).context("building poller")?;
    Ok((config, poller))
}
