//! The `Transport` seam: everything a `Connection` needs from the
//! network, abstracted so tests can swap in an in-memory fake
//! (SPEC_FULL.md §4.3, §8).

use std::io::Read;

use crate::error::DownloadError;
use crate::source::Source;

/// What an info-request (`fetch_infos`) can learn about a source.
#[derive(Debug, Clone, Default)]
pub struct FetchInfoResult {
    pub real_url: String,
    pub filename: Option<String>,
    pub filesize: Option<u64>,
}

/// A response to a data-request (`fetch_data`).
pub struct FetchDataResult {
    /// `true` if the server confirmed a partial-content response
    /// (HTTP `Content-Range`, or an FTP `REST` honoured); required
    /// whenever the request asked for a non-zero offset.
    pub partial_content_confirmed: bool,
    pub reader: Box<dyn Read + Send>,
}

/// Fetches information or data for a single `Source`. Implemented by
/// `HttpTransport` and `FtpTransport` for real use, and by
/// `FakeTransport` (test-only) for deterministic integration tests.
pub trait Transport: Send + Sync {
    /// Fetch filename/filesize/real-url metadata. Redirects are
    /// followed up to `source.max_redirects`.
    fn fetch_infos(&self, source: &Source) -> Result<FetchInfoResult, DownloadError>;

    /// Fetch a byte stream for `source` starting at `offset`. No
    /// redirects are followed for data requests.
    fn fetch_data(&self, source: &Source, offset: u64) -> Result<FetchDataResult, DownloadError>;
}
