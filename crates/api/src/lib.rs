//! Thin facade over `engine`: assigns stable ids to downloads, keeps a
//! concurrent registry of them, and persists/restores state through
//! `storage` (SPEC_FULL.md §6, "Registry").

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use engine::{transport_for_url, Download, DownloadError, DownloadMeter, Manager, Source};
use storage::{save_snapshot, StorageError};
use thiserror::Error;

pub type DownloadId = u64;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("no download registered with id {0}")]
    NotFound(DownloadId),
}

/// A source as supplied by a caller requesting a new download, before
/// it has been wrapped in the engine's runtime `Source` type.
pub struct SourceSpec {
    pub url: String,
    pub max_redirects: i64,
    pub max_retries: i64,
    pub wait_time: std::time::Duration,
    pub cookie_string: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
}

impl SourceSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_redirects: 10,
            max_retries: 5,
            wait_time: std::time::Duration::from_secs(2),
            cookie_string: None,
            user_agent: None,
            referrer: None,
        }
    }
}

fn build_source(spec: SourceSpec) -> Source {
    let source = Source::new(spec.url, spec.max_redirects, spec.max_retries, spec.wait_time);
    if let Some(cookie_string) = spec.cookie_string {
        source.set_cookie_string(cookie_string);
    }
    source
}

/// The concurrent registry of every download the process knows about,
/// keyed by an id assigned at registration time. Wraps an
/// `engine::Manager` for admission control so callers never juggle
/// download threads directly.
pub struct Registry {
    manager: Arc<Manager>,
    meter: Arc<DownloadMeter>,
    downloads: DashMap<DownloadId, Arc<Download>>,
    next_id: AtomicU64,
    snapshot_dir: PathBuf,
}

impl Registry {
    pub fn new(snapshot_dir: impl Into<PathBuf>, max_parallel_downloads: u32) -> Self {
        let manager = Manager::new(max_parallel_downloads);
        let meter = DownloadMeter::new(manager.clone());
        meter.start();
        Self {
            manager,
            meter,
            downloads: DashMap::new(),
            next_id: AtomicU64::new(1),
            snapshot_dir: snapshot_dir.into(),
        }
    }

    /// Aggregate bytes/second across every download currently loading
    /// (SPEC_FULL.md §4.7).
    pub fn aggregate_bytes_per_second(&self) -> u64 {
        self.meter.aggregate_bytes_per_second()
    }

    /// Registers a new download for `sources` (tried in order) into
    /// `target_folder`, picking the transport from the first source's
    /// URL scheme, and hands it to the manager for admission.
    pub fn create(
        &self,
        target_folder: PathBuf,
        filename: String,
        sources: Vec<SourceSpec>,
        chunk_size: u64,
        max_slot: u32,
    ) -> Result<DownloadId, ApiError> {
        let first_url = sources
            .first()
            .map(|s| s.url.clone())
            .ok_or_else(|| ApiError::Download(DownloadError::UnsupportedScheme("no sources given".to_string())))?;
        let transport = transport_for_url(&first_url)?;

        let sources: Vec<Arc<Source>> = sources.into_iter().map(|s| Arc::new(build_source(s))).collect();
        let download = Download::new(target_folder, filename, None, sources, transport, chunk_size, max_slot);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.downloads.insert(id, download.clone());
        self.manager.add(download);
        Ok(id)
    }

    pub fn get(&self, id: DownloadId) -> Option<Arc<Download>> {
        self.downloads.get(&id).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<(DownloadId, Arc<Download>)> {
        self.downloads.iter().map(|entry| (*entry.key(), entry.value().clone())).collect()
    }

    pub fn pause(&self, id: DownloadId) -> Result<(), ApiError> {
        self.get(id).ok_or(ApiError::NotFound(id))?.pause();
        Ok(())
    }

    pub fn cancel(&self, id: DownloadId) -> Result<(), ApiError> {
        let download = self.get(id).ok_or(ApiError::NotFound(id))?;
        download.cancel();
        self.downloads.remove(&id);
        self.manager.remove(&download);
        Ok(())
    }

    /// Resumes a paused download directly, per the manager's admission
    /// design note: resuming is a deliberate user action, not one the
    /// cap should gate the way fresh `ready` admission is gated.
    pub fn resume(&self, id: DownloadId) -> Result<(), ApiError> {
        self.get(id).ok_or(ApiError::NotFound(id))?.start();
        Ok(())
    }

    fn snapshot_path(&self, id: DownloadId) -> PathBuf {
        self.snapshot_dir.join(format!("{id}.json"))
    }

    /// Writes every registered download's snapshot to
    /// `<snapshot_dir>/<id>.json`.
    pub fn save_all(&self) -> Result<(), ApiError> {
        std::fs::create_dir_all(&self.snapshot_dir).map_err(storage::StorageError::from)?;
        for entry in self.downloads.iter() {
            if let Some(snapshot) = entry.value().snapshot() {
                save_snapshot(&self.snapshot_path(*entry.key()), &snapshot)?;
            }
        }
        Ok(())
    }

    /// Restores every `<id>.json` snapshot found in `dir` into a fresh
    /// registry, re-deriving each download's transport from its first
    /// source's URL.
    pub fn load_all(dir: &Path, max_parallel_downloads: u32) -> Result<Self, ApiError> {
        let registry = Self::new(dir, max_parallel_downloads);
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Ok(registry);
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse::<DownloadId>().ok()) else {
                continue;
            };
            let snapshot = storage::load_snapshot(&path)?;
            let first_url = snapshot.sources.first().map(|s| s.url.clone()).unwrap_or_default();
            let transport = transport_for_url(&first_url)?;
            let download = Download::from_snapshot(snapshot, transport)?;
            registry.downloads.insert(id, download.clone());
            registry.manager.add(download);
            registry.next_id.fetch_max(id + 1, Ordering::SeqCst);
        }

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Port 0 is never a valid connection target, so `HttpTransport`
    /// fails the first request instantly and the background threads
    /// `Registry::create` spins up never touch the real network.
    fn unreachable_source(path: &str) -> SourceSpec {
        let mut spec = SourceSpec::new(format!("http://127.0.0.1:0/{path}"));
        spec.max_retries = 0;
        spec
    }

    #[test]
    fn create_assigns_increasing_ids() {
        let dir = std::env::temp_dir().join(format!("api-registry-test-{}", std::process::id()));
        let registry = Registry::new(dir, 2);

        let a = registry
            .create(std::env::temp_dir(), "a.bin".to_string(), vec![unreachable_source("a.bin")], 1024, 3)
            .unwrap();
        let b = registry
            .create(std::env::temp_dir(), "b.bin".to_string(), vec![unreachable_source("b.bin")], 1024, 3)
            .unwrap();

        assert!(b > a);
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn create_rejects_an_unsupported_scheme() {
        let dir = std::env::temp_dir().join(format!("api-registry-test-scheme-{}", std::process::id()));
        let registry = Registry::new(dir, 2);
        let err = registry.create(
            std::env::temp_dir(),
            "a.bin".to_string(),
            vec![SourceSpec::new("magnet:?xt=urn:btih:abc")],
            1024,
            3,
        );
        assert!(err.is_err());
    }

    #[test]
    fn cancel_removes_from_the_registry() {
        let dir = std::env::temp_dir().join(format!("api-registry-test-cancel-{}", std::process::id()));
        let registry = Registry::new(dir, 2);
        let id = registry
            .create(std::env::temp_dir(), "a.bin".to_string(), vec![unreachable_source("a.bin")], 1024, 3)
            .unwrap();

        registry.cancel(id).unwrap();
        assert!(registry.get(id).is_none());
    }
}
