//! Core download engine: multi-source segmented fetching over a fixed
//! thread pool, with pause/resume/cancel and on-disk persistence.
//!
//! See `download::Download` for the per-file state machine and
//! `manager::Manager` for admission control across many downloads.

pub mod chunk;
pub mod connection;
pub mod download;
pub mod error;
pub mod event;
pub mod ftp_transport;
pub mod http_transport;
pub mod log;
pub mod manager;
pub mod meter;
pub mod slot;
pub mod source;
pub mod targetfile;
pub mod transport;

pub use chunk::{Chunk, ChunkId};
pub use download::{Download, DownloadState, DEFAULT_CHUNK_SIZE};
pub use error::DownloadError;
pub use event::EventListener;
pub use ftp_transport::FtpTransport;
pub use http_transport::HttpTransport;
pub use log::{Log, LogEntry, MessageType};
pub use manager::Manager;
pub use meter::DownloadMeter;
pub use source::{CookiePair, RetryDecision, Source};
pub use transport::{FetchDataResult, FetchInfoResult, Transport};

/// Builds the right `Transport` for a URL's scheme.
pub fn transport_for_url(url: &str) -> Result<std::sync::Arc<dyn Transport>, DownloadError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(std::sync::Arc::new(HttpTransport::new()?))
    } else if url.starts_with("ftp://") {
        Ok(std::sync::Arc::new(FtpTransport::new()))
    } else {
        Err(DownloadError::UnsupportedScheme(url.to_string()))
    }
}
