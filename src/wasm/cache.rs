// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::fmt::Write;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::metrics::IncrementRecorder;
use crate::strng::Strng;
use crate::wasm::fetcher::{self, Fetcher};
use crate::wasm::metrics::{CacheLookup, FetchResult, Metrics};

/// Every Wasm binary starts with this magic number.
const WASM_MAGIC_NUMBER: &[u8] = b"\0asm";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid module uri: {0}")]
    InvalidUri(#[from] url::ParseError),
    #[error("unsupported module uri scheme {0}")]
    UnsupportedScheme(String),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("download failed: {0}")]
    Download(#[from] fetcher::Error),
    #[error("module checksum mismatch: want {want}, got {got}")]
    ChecksumMismatch { want: String, got: String },
    #[error("fetched module is not a valid Wasm binary")]
    InvalidModule,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("module path {0} is not a valid file path")]
    InvalidPath(String),
}

/// Image pull policy for a module, as set by the control plane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PullPolicy {
    #[default]
    Unspecified,
    IfNotPresent,
    Always,
}

impl PullPolicy {
    pub fn from_str_name(value: &str) -> Option<Self> {
        match value {
            "UNSPECIFIED_POLICY" => Some(Self::Unspecified),
            "IfNotPresent" => Some(Self::IfNotPresent),
            "Always" => Some(Self::Always),
            _ => None,
        }
    }
}

/// Arguments to a module cache lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetOptions {
    pub uri: String,
    /// Expected SHA-256 of the module, hex encoded. Empty if unknown.
    pub checksum: String,
    pub resource_name: Strng,
    pub resource_version: String,
    /// Deadline for the fetch; honoring it is up to the cache.
    pub timeout: Duration,
    pub pull_secret: Option<Bytes>,
    pub pull_policy: PullPolicy,
}

/// ModuleCache resolves a module URI into a path on the local filesystem.
#[async_trait::async_trait]
pub trait ModuleCache: Send + Sync {
    async fn get(&self, opts: GetOptions) -> Result<String, Error>;
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct ModuleKey {
    uri: String,
    checksum: String,
}

#[derive(Clone, Debug)]
struct CacheEntry {
    path: PathBuf,
    last_used: Instant,
}

#[derive(Default, Debug)]
struct CacheState {
    modules: HashMap<ModuleKey, CacheEntry>,
    // Last resource version seen for each plugin, used by the Always pull policy.
    resource_versions: HashMap<Strng, String>,
}

/// LocalFileCache stores fetched modules in a directory, named by their SHA-256.
pub struct LocalFileCache {
    dir: PathBuf,
    module_expiry: Duration,
    purge_interval: Duration,
    fetcher: Arc<dyn Fetcher>,
    metrics: Arc<Metrics>,
    state: Mutex<CacheState>,
    // Held while files in `dir` are written or removed. Modules with the same content share a
    // file, so deciding a file is unreferenced and removing it must not interleave with a
    // store of the same file.
    files: tokio::sync::Mutex<()>,
}

impl LocalFileCache {
    pub fn new(config: &Config, fetcher: Arc<dyn Fetcher>, metrics: Arc<Metrics>) -> Self {
        info!(dir=%config.cache_dir.display(), "creating wasm module cache");
        LocalFileCache {
            dir: config.cache_dir.clone(),
            module_expiry: config.module_expiry,
            purge_interval: config.purge_interval,
            fetcher,
            metrics,
            state: Mutex::new(CacheState::default()),
            files: tokio::sync::Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &ModuleKey, opts: &GetOptions) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        if opts.pull_policy == PullPolicy::Always
            && state.resource_versions.get(&opts.resource_name) != Some(&opts.resource_version)
        {
            debug!(name=%opts.resource_name, "pull policy is Always and resource version changed, ignoring cache");
            return None;
        }
        let entry = state.modules.get_mut(key)?;
        entry.last_used = Instant::now();
        Some(entry.path.to_string_lossy().into_owned())
    }

    async fn fetch_module(&self, url: &Url) -> Result<Bytes, Error> {
        match url.scheme() {
            "http" | "https" => Ok(self.fetcher.fetch(url).await?),
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| Error::InvalidPath(url.to_string()))?;
                Ok(Bytes::from(tokio::fs::read(path).await?))
            }
            other => Err(Error::UnsupportedScheme(other.to_string())),
        }
    }

    async fn download(&self, url: &Url, timeout: Duration) -> Result<Bytes, Error> {
        match tokio::time::timeout(timeout, self.fetch_module(url)).await {
            Ok(res) => res,
            Err(_) => {
                self.metrics.increment(&FetchResult::FetchTimeout);
                Err(Error::Timeout(timeout))
            }
        }
    }

    fn verify(&self, module: &[u8], want: &str) -> Result<String, Error> {
        if !module.starts_with(WASM_MAGIC_NUMBER) {
            self.metrics.increment(&FetchResult::InvalidModule);
            return Err(Error::InvalidModule);
        }
        let got = sha256_hex(module);
        if !want.is_empty() && !want.eq_ignore_ascii_case(&got) {
            self.metrics.increment(&FetchResult::ChecksumMismatched);
            return Err(Error::ChecksumMismatch {
                want: want.to_string(),
                got,
            });
        }
        Ok(got)
    }

    async fn store(&self, checksum: &str, module: &[u8]) -> Result<PathBuf, Error> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{checksum}.wasm"));
        // Write then rename, so a reader never observes a partially written module.
        static TMP_ID: AtomicUsize = AtomicUsize::new(0);
        let id = TMP_ID.fetch_add(1, Ordering::SeqCst);
        let tmp = self.dir.join(format!(".{checksum}.wasm.{id}.tmp"));
        tokio::fs::write(&tmp, module).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    /// Removes modules that have not been used within the expiry window.
    pub async fn purge(&self) {
        let _files = self.files.lock().await;
        let expired: Vec<PathBuf> = {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            let mut removed = Vec::new();
            state.modules.retain(|key, entry| {
                let keep = now.duration_since(entry.last_used) < self.module_expiry;
                if !keep {
                    debug!(uri=%key.uri, "purging expired module");
                    removed.push(entry.path.clone());
                }
                keep
            });
            // The same file can be shared by several keys; only delete unreferenced ones.
            removed.retain(|p| !state.modules.values().any(|e| &e.path == p));
            removed.dedup();
            self.metrics.cache_entries.set(state.modules.len() as i64);
            removed
        };
        for path in expired {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path=%path.display(), "failed to remove expired module: {e}");
            }
        }
    }

    /// Purges expired modules every purge interval until `shutdown` completes.
    pub async fn run_purge(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.purge_interval);
        // The first tick completes immediately.
        ticker.tick().await;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.purge().await,
                _ = &mut shutdown => {
                    debug!("stopping wasm module purge");
                    return;
                }
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait::async_trait]
impl ModuleCache for LocalFileCache {
    async fn get(&self, opts: GetOptions) -> Result<String, Error> {
        let url = Url::parse(&opts.uri)?;
        let key = ModuleKey {
            uri: opts.uri.clone(),
            checksum: opts.checksum.clone(),
        };
        if let Some(path) = self.lookup(&key, &opts) {
            self.metrics.increment(&CacheLookup::Hit);
            return Ok(path);
        }
        self.metrics.increment(&CacheLookup::Miss);

        let module = self.download(&url, opts.timeout).await.inspect_err(|e| {
            if !matches!(e, Error::Timeout(_)) {
                self.metrics.increment(&FetchResult::DownloadFailure);
            }
        })?;
        let checksum = self.verify(&module, &opts.checksum)?;
        let _files = self.files.lock().await;
        let path = self.store(&checksum, &module).await?;
        self.metrics.increment(&FetchResult::Success);
        info!(uri=%opts.uri, path=%path.display(), "fetched wasm module");

        let mut state = self.state.lock().unwrap();
        state.modules.insert(
            key,
            CacheEntry {
                path: path.clone(),
                last_used: Instant::now(),
            },
        );
        state
            .resource_versions
            .insert(opts.resource_name, opts.resource_version);
        self.metrics.cache_entries.set(state.modules.len() as i64);
        Ok(path.to_string_lossy().into_owned())
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, data);
    digest
        .as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{self, MockFetcher, WASM_MODULE};

    fn cache(dir: &Path, fetcher: Arc<MockFetcher>) -> LocalFileCache {
        let cfg = Config {
            cache_dir: dir.to_path_buf(),
            module_expiry: Duration::from_secs(60),
            purge_interval: Duration::from_secs(30),
            ..Config::default()
        };
        LocalFileCache::new(&cfg, fetcher, test_helpers::wasm_metrics())
    }

    fn opts(uri: &str) -> GetOptions {
        GetOptions {
            uri: uri.to_string(),
            checksum: String::new(),
            resource_name: "ns.plugin".into(),
            resource_version: "1".to_string(),
            timeout: Duration::from_secs(5),
            pull_secret: None,
            pull_policy: PullPolicy::Unspecified,
        }
    }

    #[test]
    fn sha256_is_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn pull_policy_names() {
        assert_eq!(PullPolicy::from_str_name("Always"), Some(PullPolicy::Always));
        assert_eq!(
            PullPolicy::from_str_name("IfNotPresent"),
            Some(PullPolicy::IfNotPresent)
        );
        assert_eq!(
            PullPolicy::from_str_name("UNSPECIFIED_POLICY"),
            Some(PullPolicy::Unspecified)
        );
        assert_eq!(PullPolicy::from_str_name("always"), None);
    }

    #[tokio::test]
    async fn fetches_once_then_hits() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.insert("http://example.com/a.wasm", WASM_MODULE);
        let cache = cache(dir.path(), fetcher.clone());

        let first = cache.get(opts("http://example.com/a.wasm")).await.unwrap();
        let second = cache.get(opts("http://example.com/a.wasm")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(std::fs::read(&first).unwrap(), WASM_MODULE);
        assert!(first.ends_with(&format!("{}.wasm", sha256_hex(WASM_MODULE))));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn checksum_is_verified() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.insert("http://example.com/a.wasm", WASM_MODULE);
        let cache = cache(dir.path(), fetcher);

        let mut o = opts("http://example.com/a.wasm");
        o.checksum = "0000".to_string();
        let err = cache.get(o.clone()).await.unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }), "{err}");
        assert!(cache.is_empty());

        o.checksum = sha256_hex(WASM_MODULE).to_uppercase();
        cache.get(o).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_non_wasm() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.insert("http://example.com/a.wasm", b"<html>not found</html>");
        let cache = cache(dir.path(), fetcher);
        let err = cache
            .get(opts("http://example.com/a.wasm"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidModule), "{err}");
    }

    #[tokio::test]
    async fn unknown_scheme_and_missing_module() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), Arc::new(MockFetcher::default()));
        let err = cache
            .get(opts("oci://gcr.io/foo/bar:latest"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedScheme(s) if s == "oci"));

        let err = cache
            .get(opts("http://example.com/missing.wasm"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Download(_)), "{err}");
    }

    #[tokio::test]
    async fn reads_file_uri() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("local.wasm");
        std::fs::write(&src, WASM_MODULE).unwrap();
        let cache = cache(&dir.path().join("cache"), Arc::new(MockFetcher::default()));
        let uri = Url::from_file_path(&src).unwrap().to_string();
        let path = cache.get(opts(&uri)).await.unwrap();
        assert!(path.starts_with(dir.path().join("cache").to_str().unwrap()));
    }

    #[tokio::test]
    async fn pull_always_refetches_on_new_version() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.insert("http://example.com/a.wasm", WASM_MODULE);
        let cache = cache(dir.path(), fetcher.clone());

        let mut o = opts("http://example.com/a.wasm");
        o.pull_policy = PullPolicy::Always;
        cache.get(o.clone()).await.unwrap();
        // Same version: served from the cache.
        cache.get(o.clone()).await.unwrap();
        assert_eq!(fetcher.calls(), 1);

        o.resource_version = "2".to_string();
        cache.get(o.clone()).await.unwrap();
        assert_eq!(fetcher.calls(), 2);

        // IfNotPresent never refetches a cached module.
        o.pull_policy = PullPolicy::IfNotPresent;
        o.resource_version = "3".to_string();
        cache.get(o).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_keeps_files_shared_with_live_entries() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.insert("http://example.com/a.wasm", WASM_MODULE);
        fetcher.insert("http://example.com/b.wasm", WASM_MODULE);
        let cache = cache(dir.path(), fetcher);

        let a = cache.get(opts("http://example.com/a.wasm")).await.unwrap();
        tokio::time::advance(Duration::from_secs(40)).await;
        let b = cache.get(opts("http://example.com/b.wasm")).await.unwrap();
        assert_eq!(a, b);

        tokio::time::advance(Duration::from_secs(30)).await;
        cache.purge().await;
        assert_eq!(cache.len(), 1);
        assert!(Path::new(&b).exists());
    }

    #[tokio::test]
    async fn store_waits_for_file_lock() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.insert("http://example.com/a.wasm", WASM_MODULE);
        let cache = Arc::new(cache(dir.path(), fetcher));

        // Stands in for a purge that is removing files.
        let files = cache.files.lock().await;
        let get = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get(opts("http://example.com/a.wasm")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!get.is_finished());
        assert!(cache.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        drop(files);
        let path = get.await.unwrap().unwrap();
        assert!(Path::new(&path).exists());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_expired_modules() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.insert("http://example.com/a.wasm", WASM_MODULE);
        let cache = cache(dir.path(), fetcher);

        let path = cache.get(opts("http://example.com/a.wasm")).await.unwrap();
        cache.purge().await;
        assert_eq!(cache.len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.purge().await;
        assert!(cache.is_empty());
        assert!(!Path::new(&path).exists());
    }
}
