//! Typed error surface for the transport contract (SPEC_FULL.md §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(String),

    #[error("http error: {0}")]
    Http(u16),

    #[error("the server does not support partial/resume downloads")]
    NotRangeCapable,

    /// `critical` distinguishes a connection that closed early while
    /// bytes were still expected (a real failure) from a chunk left
    /// unfinished because the download stopped loading (not a
    /// failure, no retry penalty).
    #[error("chunk not finished: {reason}")]
    ChunkNotFinished { critical: bool, reason: String },

    #[error("target file io error: {0}")]
    TargetFileIo(#[source] std::io::Error),

    #[error("no valid source found; reached max retries on all sources")]
    AllSourcesExhausted,

    #[error("the temp file \"{0}\" does not exist anymore")]
    MissingTempFile(String),

    #[error("the protocol of \"{0}\" is not supported")]
    UnsupportedScheme(String),
}

impl DownloadError {
    /// True for errors that should be charged against a source's
    /// retry budget via `Source::add_fail`.
    pub fn counts_as_source_failure(&self) -> bool {
        !matches!(
            self,
            DownloadError::ChunkNotFinished { critical: false, .. }
                | DownloadError::TargetFileIo(_)
        )
    }

    /// True for errors that are fatal to the whole download rather
    /// than just to the current chunk/source attempt.
    pub fn is_fatal_io(&self) -> bool {
        matches!(self, DownloadError::TargetFileIo(_))
    }
}
