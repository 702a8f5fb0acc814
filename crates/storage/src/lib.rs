//! Persisted download state: serde DTOs mirroring the live engine
//! types plus atomic JSON (de)serialization (SPEC_FULL.md §6).
//!
//! The live `engine` types carry runtime state (mutexes, condvars, open
//! file handles, thread handles) that cannot derive `Serialize`
//! directly, so this crate holds a separate, plain-data mirror of each
//! one. Conversion between the two lives in `engine` (`From`/`TryFrom`
//! impls on `Download`/`Source`/`Chunk`), not here, since this crate
//! has no notion of a running download.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("could not read or write snapshot file: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot file is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Mirrors `Chunk`'s recursive byte-range tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSnapshot {
    pub offset: u64,
    pub original_length: Option<u64>,
    pub length: Option<u64>,
    pub loaded: u64,
    pub children: Vec<ChunkSnapshot>,
}

/// A single cookie as tracked by the reference cookie jar format
/// (SPEC_FULL.md §6). Most fields are optional metadata carried
/// through unchanged even though this engine only acts on
/// name/value/domain/path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieSnapshot {
    pub version: i32,
    pub name: String,
    pub value: String,
    pub port: Option<String>,
    pub port_specified: bool,
    pub domain: String,
    pub domain_specified: bool,
    pub domain_initial_dot: bool,
    pub path: String,
    pub path_specified: bool,
    pub secure: bool,
    pub expires: Option<i64>,
    pub discard: bool,
    pub comment: Option<String>,
    pub comment_url: Option<String>,
    pub rfc2109: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub original_url: String,
    pub url: String,
    pub max_redirects: i64,
    pub max_retries: i64,
    pub wait_time_secs: u64,
    pub filename: String,
    pub filesize: Option<u64>,
    pub retries: u32,
    pub timeout_secs: u64,
    pub user_agent: String,
    pub referrer: String,
    pub valid: bool,
    pub max_active_slots: u32,
    pub max_slots_determined: bool,
    pub cookie_string: String,
    pub cookies: Vec<CookieSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStateSnapshot {
    Ready,
    FetchingInfo,
    Loading,
    Paused,
    Cancelled,
    Failed,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub chunk_size: u64,
    pub max_slot: u32,
    pub filesize: Option<u64>,
    pub infos_fetched: bool,
    pub slots_supported: bool,
    pub last_used_source: usize,
    pub target_folder: String,
    pub filename: String,
    pub original_filename: String,
    pub state: DownloadStateSnapshot,
    pub sources: Vec<SourceSnapshot>,
    pub root_chunk: Option<ChunkSnapshot>,
}

/// Writes `snapshot` to `path` as pretty JSON, atomically: the
/// document is written to a sibling `.tmp` file first and then
/// renamed over `path`, so a crash mid-write cannot corrupt a
/// previously-good snapshot (SPEC_FULL.md §6, `[ADDED] Persistence
/// format`).
pub fn save_snapshot(path: &Path, snapshot: &DownloadSnapshot) -> Result<(), StorageError> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp_path = sibling_tmp_path(path);
    fs::write(&tmp_path, &json)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<DownloadSnapshot, StorageError> {
    let json = fs::read(path)?;
    Ok(serde_json::from_slice(&json)?)
}

fn sibling_tmp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DownloadSnapshot {
        DownloadSnapshot {
            chunk_size: 2 * 1024 * 1024,
            max_slot: 3,
            filesize: Some(6 * 1024 * 1024),
            infos_fetched: true,
            slots_supported: true,
            last_used_source: 0,
            target_folder: "/tmp/downloads".to_string(),
            filename: "archive.zip".to_string(),
            original_filename: "archive.zip".to_string(),
            state: DownloadStateSnapshot::Paused,
            sources: vec![SourceSnapshot {
                original_url: "https://a.example.com/archive.zip".to_string(),
                url: "https://a.example.com/archive.zip".to_string(),
                max_redirects: 5,
                max_retries: 3,
                wait_time_secs: 2,
                filename: "archive.zip".to_string(),
                filesize: Some(6 * 1024 * 1024),
                retries: 0,
                timeout_secs: 10,
                user_agent: String::new(),
                referrer: String::new(),
                valid: true,
                max_active_slots: 2,
                max_slots_determined: false,
                cookie_string: String::new(),
                cookies: Vec::new(),
            }],
            root_chunk: Some(ChunkSnapshot {
                offset: 0,
                original_length: Some(6 * 1024 * 1024),
                length: Some(6 * 1024 * 1024),
                loaded: 2_500_000,
                children: vec![ChunkSnapshot {
                    offset: 3 * 1024 * 1024,
                    original_length: Some(3 * 1024 * 1024),
                    length: Some(3 * 1024 * 1024),
                    loaded: 0,
                    children: Vec::new(),
                }],
            }),
        }
    }

    #[test]
    fn round_trips_through_json() {
        let snapshot = sample();
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: DownloadSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.filename, snapshot.filename);
        assert_eq!(back.sources.len(), 1);
        assert_eq!(back.root_chunk.unwrap().children.len(), 1);
    }

    #[test]
    fn save_then_load_round_trips_and_leaves_no_tmp_file() {
        let dir = std::env::temp_dir().join(format!("storage-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("download.json");

        save_snapshot(&path, &sample()).unwrap();
        assert!(path.exists());
        assert!(!sibling_tmp_path(&path).exists());

        let loaded = load_snapshot(&path).unwrap();
        assert_eq!(loaded.max_slot, 3);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_missing_file_errors() {
        let path = Path::new("/nonexistent/does-not-exist.json");
        assert!(load_snapshot(path).is_err());
    }
}
