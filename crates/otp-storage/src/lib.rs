//! Content-addressed object storage + HTTP fetch utilities for the poller.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use otp_core::{Fingerprint, RawDocument};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "otp-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("container {container} does not exist")]
    ContainerMissing { container: String },
    #[error("invalid object key {key:?}")]
    InvalidKey { key: String },
    #[error("checking object {key} in {container}")]
    Access {
        container: String,
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("writing object {key} to {container}")]
    Write {
        container: String,
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("provisioning container {container}")]
    Provision {
        container: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    /// Missing container is the provisioning trigger; a missing key is not an error at all.
    pub fn is_container_missing(&self) -> bool {
        matches!(self, StoreError::ContainerMissing { .. })
    }
}

/// Minimal object-store surface the dedup layer needs.
///
/// `exists` returns `Ok(false)` when the key is absent and
/// `Err(StoreError::ContainerMissing)` when the container itself is absent.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn container(&self) -> &str;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Idempotent; an already existing container is success.
    async fn ensure_container_exists(&self) -> Result<(), StoreError>;
}

/// Directory-backed store: `root/<container>/<key>`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    container: String,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            container: container.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container_dir(&self) -> PathBuf {
        self.root.join(&self.container)
    }

    pub fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.container_dir().join(key))
    }

    async fn require_container(&self, key: &str) -> Result<PathBuf, StoreError> {
        let dir = self.container_dir();
        let present = fs::try_exists(&dir).await.map_err(|source| StoreError::Access {
            container: self.container.clone(),
            key: key.to_string(),
            source,
        })?;
        if present {
            Ok(dir)
        } else {
            Err(StoreError::ContainerMissing {
                container: self.container.clone(),
            })
        }
    }

    fn write_error(&self, key: &str, source: io::Error) -> StoreError {
        if source.kind() == io::ErrorKind::NotFound {
            StoreError::ContainerMissing {
                container: self.container.clone(),
            }
        } else {
            StoreError::Write {
                container: self.container.clone(),
                key: key.to_string(),
                source,
            }
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn container(&self) -> &str {
        &self.container
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.object_path(key)?;
        self.require_container(key).await?;
        fs::try_exists(&path).await.map_err(|source| StoreError::Access {
            container: self.container.clone(),
            key: key.to_string(),
            source,
        })
    }

    /// Temp file + rename; readers never observe a partial object.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let absolute_path = self.object_path(key)?;
        let dir = self.require_container(key).await?;

        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<(), io::Error>(())
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.write_error(key, err));
        }

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(self.write_error(key, err))
            }
        }
    }

    async fn ensure_container_exists(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.container_dir())
            .await
            .map_err(|source| StoreError::Provision {
                container: self.container.clone(),
                source,
            })
    }
}

/// In-process store that records how it was called.
#[derive(Debug)]
pub struct MemoryObjectStore {
    container: String,
    yield_after_exists: bool,
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    container_present: bool,
    objects: BTreeMap<String, Vec<u8>>,
    exists_calls: usize,
    put_calls: usize,
    failing_puts: usize,
    failing_exists: usize,
    provisioning_fails: bool,
}

impl MemoryObjectStore {
    pub fn new(container: impl Into<String>) -> Self {
        Self::build(container.into(), true)
    }

    /// Starts without a container; `exists`/`put` report `ContainerMissing`
    /// until `ensure_container_exists` runs.
    pub fn without_container(container: impl Into<String>) -> Self {
        Self::build(container.into(), false)
    }

    fn build(container: String, container_present: bool) -> Self {
        Self {
            container,
            yield_after_exists: false,
            state: Mutex::new(MemoryState {
                container_present,
                ..Default::default()
            }),
        }
    }

    /// Yield to the runtime between answering `exists` and returning, so
    /// concurrent callers both observe a missing key before either writes.
    pub fn with_interleaved_exists(mut self) -> Self {
        self.yield_after_exists = true;
        self
    }

    /// The next `count` puts fail with a write error.
    pub async fn fail_next_puts(&self, count: usize) {
        self.state.lock().await.failing_puts = count;
    }

    /// The next `count` existence checks fail with an access error.
    pub async fn fail_next_exists(&self, count: usize) {
        self.state.lock().await.failing_exists = count;
    }

    /// Every later `ensure_container_exists` fails with a provisioning error.
    pub async fn fail_provisioning(&self) {
        self.state.lock().await.provisioning_fails = true;
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().await.objects.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn put_calls(&self) -> usize {
        self.state.lock().await.put_calls
    }

    pub async fn exists_calls(&self) -> usize {
        self.state.lock().await.exists_calls
    }

    pub async fn drop_container(&self) {
        let mut state = self.state.lock().await;
        state.container_present = false;
        state.objects.clear();
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn container(&self) -> &str {
        &self.container
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let found = {
            let mut state = self.state.lock().await;
            state.exists_calls += 1;
            if !state.container_present {
                return Err(StoreError::ContainerMissing {
                    container: self.container.clone(),
                });
            }
            if state.failing_exists > 0 {
                state.failing_exists -= 1;
                return Err(StoreError::Access {
                    container: self.container.clone(),
                    key: key.to_string(),
                    source: io::Error::other("injected read failure"),
                });
            }
            state.objects.contains_key(key)
        };
        if self.yield_after_exists {
            tokio::task::yield_now().await;
        }
        Ok(found)
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.put_calls += 1;
        if !state.container_present {
            return Err(StoreError::ContainerMissing {
                container: self.container.clone(),
            });
        }
        if state.failing_puts > 0 {
            state.failing_puts -= 1;
            return Err(StoreError::Write {
                container: self.container.clone(),
                key: key.to_string(),
                source: io::Error::other("injected write failure"),
            });
        }
        state.objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn ensure_container_exists(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.provisioning_fails {
            return Err(StoreError::Provision {
                container: self.container.clone(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "injected provisioning failure"),
            });
        }
        state.container_present = true;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Written,
    Skipped,
}

impl PersistOutcome {
    pub fn written(self) -> bool {
        matches!(self, PersistOutcome::Written)
    }
}

/// Which object-store call a [`PersistError`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Exists,
    Put,
}

impl StoreOp {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreOp::Exists => "exists",
            StoreOp::Put => "put",
        }
    }
}

#[derive(Debug, Error)]
#[error("object store {} call failed", .op.as_str())]
pub struct PersistError {
    pub op: StoreOp,
    #[source]
    pub source: StoreError,
}

impl PersistError {
    fn exists(source: StoreError) -> Self {
        Self { op: StoreOp::Exists, source }
    }

    fn put(source: StoreError) -> Self {
        Self { op: StoreOp::Put, source }
    }
}

/// Write-if-missing over an [`ObjectStore`], keyed by content fingerprint.
///
/// The existence check and the write are not atomic. Two pollers sharing a
/// container may both miss and both write; the payload for a key is always
/// the same canonical bytes, so the second write is redundant, not harmful.
#[derive(Clone)]
pub struct DedupStore {
    store: Arc<dyn ObjectStore>,
}

impl DedupStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn container(&self) -> &str {
        self.store.container()
    }

    pub async fn provision(&self) -> Result<(), StoreError> {
        self.store.ensure_container_exists().await
    }

    pub async fn persist_if_new(
        &self,
        key: &Fingerprint,
        payload: &[u8],
    ) -> Result<PersistOutcome, PersistError> {
        let found = match self.exists_provisioning(key).await {
            Ok(found) => found,
            Err(err @ StoreError::Access { .. }) => {
                warn!(
                    container = self.container(),
                    %key,
                    error = %err,
                    "existence check failed; treating object as missing"
                );
                false
            }
            Err(err) => return Err(PersistError::exists(err)),
        };

        if found {
            info!(container = self.container(), %key, "skip, already stored");
            return Ok(PersistOutcome::Skipped);
        }

        match self.store.put(key.as_str(), payload).await {
            Ok(()) => {}
            Err(err) if err.is_container_missing() => {
                self.reprovision(&err).await.map_err(PersistError::put)?;
                self.store
                    .put(key.as_str(), payload)
                    .await
                    .map_err(PersistError::put)?;
            }
            Err(err) => return Err(PersistError::put(err)),
        }

        info!(
            container = self.container(),
            %key,
            bytes = payload.len(),
            "wrote new object"
        );
        Ok(PersistOutcome::Written)
    }

    async fn exists_provisioning(&self, key: &Fingerprint) -> Result<bool, StoreError> {
        match self.store.exists(key.as_str()).await {
            Err(err) if err.is_container_missing() => {
                self.reprovision(&err).await?;
                self.store.exists(key.as_str()).await
            }
            other => other,
        }
    }

    async fn reprovision(&self, cause: &StoreError) -> Result<(), StoreError> {
        warn!(container = self.container(), error = %cause, "container missing; provisioning");
        self.store.ensure_container_exists().await
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Transport,
    Decode,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// Non-2xx responses are grouped with transport failures.
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Transport { .. } | FetchError::HttpStatus { .. } => FetchErrorKind::Transport,
            FetchError::Decode { .. } => FetchErrorKind::Decode,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Transport { source, .. } if source.is_timeout())
    }
}

/// Single-attempt JSON GET client. Retry policy, if any, lives with the caller.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_json(&self, url: &str) -> Result<RawDocument, FetchError> {
        let span = info_span!("http_fetch", url);
        async move {
            let transport = |source: reqwest::Error| FetchError::Transport {
                url: url.to_string(),
                source,
            };

            let resp = self.client.get(url).send().await.map_err(transport)?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let body = resp.bytes().await.map_err(transport)?;
            debug!(status = status.as_u16(), bytes = body.len(), "fetched provider document");
            serde_json::from_slice::<RawDocument>(&body).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn key(payload: &[u8]) -> Fingerprint {
        Fingerprint::of_bytes(payload)
    }

    #[tokio::test]
    async fn fs_store_reports_missing_container_then_missing_key() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path(), "otp.test.cta");
        let k = key(b"1");

        let err = store.exists(k.as_str()).await.unwrap_err();
        assert!(err.is_container_missing());

        store.ensure_container_exists().await.expect("provision");
        store.ensure_container_exists().await.expect("provision is idempotent");
        assert!(!store.exists(k.as_str()).await.expect("exists"));
    }

    #[tokio::test]
    async fn fs_store_put_is_atomic_and_overwrite_tolerant() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path(), "otp.test.cta");
        store.ensure_container_exists().await.expect("provision");
        let k = key(b"[\"A\",\"B\"]");

        store.put(k.as_str(), b"[\"A\",\"B\"]").await.expect("first put");
        store.put(k.as_str(), b"[\"A\",\"B\"]").await.expect("second put");

        assert!(store.exists(k.as_str()).await.expect("exists"));
        let on_disk = std::fs::read(store.object_path(k.as_str()).unwrap()).unwrap();
        assert_eq!(on_disk, b"[\"A\",\"B\"]");
        let entries = std::fs::read_dir(store.container_dir()).unwrap().count();
        assert_eq!(entries, 1, "temp files must not be left behind");
    }

    #[tokio::test]
    async fn fs_store_rejects_path_like_keys() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path(), "bucket");
        store.ensure_container_exists().await.expect("provision");
        for bad in ["", "../escape", "a/b", ".hidden"] {
            let err = store.put(bad, b"x").await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey { .. }), "{bad}");
        }
    }

    #[tokio::test]
    async fn fs_store_put_without_container_is_container_missing() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path(), "absent");
        let err = store.put(key(b"1").as_str(), b"1").await.unwrap_err();
        assert!(err.is_container_missing());
    }

    #[tokio::test]
    async fn persist_if_new_writes_once() {
        let memory = Arc::new(MemoryObjectStore::new("bucket"));
        let dedup = DedupStore::new(memory.clone());
        let k = key(b"1");

        let first = dedup.persist_if_new(&k, b"1").await.expect("first");
        let second = dedup.persist_if_new(&k, b"1").await.expect("second");

        assert_eq!(first, PersistOutcome::Written);
        assert_eq!(second, PersistOutcome::Skipped);
        assert!(first.written());
        assert!(!second.written());
        assert_eq!(memory.put_calls().await, 1);
        assert_eq!(memory.len().await, 1);
        assert_eq!(memory.get(k.as_str()).await.as_deref(), Some(&b"1"[..]));
    }

    #[tokio::test]
    async fn distinct_payloads_are_written_independently() {
        let memory = Arc::new(MemoryObjectStore::new("bucket"));
        let dedup = DedupStore::new(memory.clone());

        let a = dedup.persist_if_new(&key(b"1"), b"1").await.unwrap();
        let b = dedup.persist_if_new(&key(b"3"), b"3").await.unwrap();

        assert!(a.written() && b.written());
        assert_eq!(memory.put_calls().await, 2);
        assert_eq!(memory.len().await, 2);
    }

    #[tokio::test]
    async fn missing_container_is_provisioned_and_retried_once() {
        let memory = Arc::new(MemoryObjectStore::without_container("bucket"));
        let dedup = DedupStore::new(memory.clone());
        let k = key(b"{}");

        let outcome = dedup.persist_if_new(&k, b"{}").await.expect("persist");

        assert_eq!(outcome, PersistOutcome::Written);
        assert_eq!(memory.exists_calls().await, 2);
        assert_eq!(memory.put_calls().await, 1);
        assert!(memory.get(k.as_str()).await.is_some());
    }

    #[tokio::test]
    async fn unreadable_existence_check_falls_through_to_write() {
        let memory = Arc::new(MemoryObjectStore::new("bucket"));
        let dedup = DedupStore::new(memory.clone());
        let k = key(b"1");
        dedup.persist_if_new(&k, b"1").await.unwrap();
        memory.fail_next_exists(1).await;

        let outcome = dedup.persist_if_new(&k, b"1").await.expect("persist");

        assert_eq!(outcome, PersistOutcome::Written);
        assert_eq!(memory.put_calls().await, 2);
        assert_eq!(memory.len().await, 1);
    }

    #[tokio::test]
    async fn provisioning_failure_fails_without_writing() {
        let memory = Arc::new(MemoryObjectStore::without_container("bucket"));
        memory.fail_provisioning().await;
        let dedup = DedupStore::new(memory.clone());

        let err = dedup.persist_if_new(&key(b"1"), b"1").await.unwrap_err();

        assert_eq!(err.op, StoreOp::Exists);
        assert!(matches!(err.source, StoreError::Provision { .. }));
        assert!(dedup.provision().await.is_err());
        assert_eq!(memory.exists_calls().await, 1);
        assert_eq!(memory.put_calls().await, 0);
        assert!(memory.is_empty().await);
    }

    #[tokio::test]
    async fn container_dropped_between_cycles_is_recovered() {
        let memory = Arc::new(MemoryObjectStore::new("bucket"));
        let dedup = DedupStore::new(memory.clone());
        let k = key(b"1");
        dedup.persist_if_new(&k, b"1").await.unwrap();

        memory.drop_container().await;
        let outcome = dedup.persist_if_new(&k, b"1").await.unwrap();

        assert_eq!(outcome, PersistOutcome::Written);
        assert_eq!(memory.len().await, 1);
    }

    #[tokio::test]
    async fn failed_write_leaves_key_absent_for_the_next_attempt() {
        let memory = Arc::new(MemoryObjectStore::new("bucket"));
        let dedup = DedupStore::new(memory.clone());
        let k = key(b"2");
        memory.fail_next_puts(1).await;

        let err = dedup.persist_if_new(&k, b"2").await.unwrap_err();
        assert_eq!(err.op, StoreOp::Put);
        assert!(matches!(err.source, StoreError::Write { .. }));
        assert!(memory.is_empty().await);

        let retry = dedup.persist_if_new(&k, b"2").await.expect("retry");
        assert_eq!(retry, PersistOutcome::Written);
        assert_eq!(memory.put_calls().await, 2);
    }

    #[tokio::test]
    async fn concurrent_identical_writes_are_tolerated() {
        let memory = Arc::new(MemoryObjectStore::new("bucket").with_interleaved_exists());
        let a = DedupStore::new(memory.clone());
        let b = DedupStore::new(memory.clone());
        let k = key(b"[1,2]");

        let (ra, rb) = tokio::join!(a.persist_if_new(&k, b"[1,2]"), b.persist_if_new(&k, b"[1,2]"));

        assert!(ra.is_ok() && rb.is_ok());
        assert_eq!(memory.put_calls().await, 2, "both racers observed a miss");
        assert_eq!(memory.len().await, 1);
        assert_eq!(memory.get(k.as_str()).await.as_deref(), Some(&b"[1,2]"[..]));
    }

    fn fetcher(timeout: Duration) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some("otp-test".to_string()),
        })
        .expect("fetcher")
    }

    #[tokio::test]
    async fn fetch_decodes_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ttarrivals"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"a": 1, "b": 2})))
            .expect(1)
            .mount(&server)
            .await;

        let doc = fetcher(Duration::from_secs(2))
            .fetch_json(&format!("{}/ttarrivals", server.uri()))
            .await
            .expect("fetch");
        assert_eq!(doc, json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn empty_and_malformed_bodies_are_decode_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"a\": "))
            .mount(&server)
            .await;

        let http = fetcher(Duration::from_secs(2));
        for route in ["empty", "broken"] {
            let err = http
                .fetch_json(&format!("{}/{route}", server.uri()))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), FetchErrorKind::Decode, "{route}: {err}");
        }
    }

    #[tokio::test]
    async fn slow_provider_is_a_transport_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({}))
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&server)
            .await;

        let err = fetcher(Duration::from_millis(100))
            .fetch_json(&server.uri())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::Transport);
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let err = fetcher(Duration::from_secs(1))
            .fetch_json(&format!("http://{addr}/"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::Transport);
    }

    #[tokio::test]
    async fn error_status_is_reported_with_status_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = fetcher(Duration::from_secs(1))
            .fetch_json(&server.uri())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(err.kind(), FetchErrorKind::Transport);
    }
}
