//! Drives a single `Transport` request through to completion,
//! reproducing the read-loop semantics of a chunked HTTP/FTP fetch
//! (SPEC_FULL.md §4.3).

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::DownloadError;
use crate::event::EventListener;
use crate::source::Source;
use crate::transport::Transport;

/// What a `Connection` needs to know about the chunk it is filling,
/// without depending on `Download`'s lock layout directly.
pub trait ChunkCursor {
    fn offset(&self) -> u64;
    fn loaded(&self) -> u64;
    fn bytes_left(&self, slots_supported: bool) -> Option<u64>;
    fn is_finished(&self, slots_supported: bool) -> bool;
    fn write(&mut self, file_offset: u64, data: &[u8]) -> Result<(), DownloadError>;
}

/// What a `Connection` needs to know about the owning download's
/// run state.
pub trait LoadingContext {
    fn is_loading(&self) -> bool;
    fn slots_supported(&self) -> bool;
}

pub struct Connection {
    transport: Arc<dyn Transport>,
    source: Arc<Source>,
    /// Time to sleep after closing the underlying response, giving
    /// the OS socket time to actually release before a sibling slot
    /// opens a new connection to a source with a limited connection
    /// budget. Zeroed in tests.
    pub drain_delay: Duration,
    pub data_received_event: EventListener<()>,
    signaled_data_received: AtomicBool,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, source: Arc<Source>) -> Self {
        Self {
            transport,
            source,
            drain_delay: Duration::from_secs(1),
            data_received_event: EventListener::new(),
            signaled_data_received: AtomicBool::new(false),
        }
    }

    fn signal_data_received(&self) {
        if self
            .signaled_data_received
            .swap(true, Ordering::SeqCst)
        {
            return;
        }
        self.data_received_event.signal(());
    }

    /// Fetch filename/filesize/real-url metadata. Falls back to
    /// deriving a filename from the resolved URL's path when the
    /// transport didn't supply one (e.g. no `Content-Disposition`).
    pub fn fetch_infos(&self) -> Result<(String, Option<String>, Option<u64>), DownloadError> {
        let info = self.transport.fetch_infos(&self.source)?;
        let filename = info.filename.or_else(|| {
            let path = info.real_url.split(['?', '#']).next().unwrap_or(&info.real_url);
            let candidate = path.rsplit('/').next().unwrap_or("").trim();
            if candidate.is_empty() {
                None
            } else {
                Some(candidate.to_string())
            }
        });
        Ok((info.real_url, filename, info.filesize))
    }

    /// Fetch data for `cursor` until it is finished or loading stops.
    /// Always sleeps `drain_delay` after the response closes,
    /// regardless of outcome, mirroring the original's `finally`.
    pub fn fetch_data(
        &self,
        cursor: &mut dyn ChunkCursor,
        ctx: &dyn LoadingContext,
    ) -> Result<(), DownloadError> {
        let offset = cursor.offset() + cursor.loaded();
        let fetch = self.transport.fetch_data(&self.source, offset);

        let result = match fetch {
            Ok(result) => result,
            Err(err) => return Err(err),
        };

        if !result.partial_content_confirmed && offset != 0 {
            return Err(DownloadError::NotRangeCapable);
        }

        let outcome = self.drain_loop(result.reader, cursor, ctx);
        std::thread::sleep(self.drain_delay);
        outcome
    }

    fn drain_loop(
        &self,
        mut reader: Box<dyn Read + Send>,
        cursor: &mut dyn ChunkCursor,
        ctx: &dyn LoadingContext,
    ) -> Result<(), DownloadError> {
        let mut buf = [0u8; 4096];

        while ctx.is_loading() && !cursor.is_finished(ctx.slots_supported()) {
            let to_read = match cursor.bytes_left(ctx.slots_supported()) {
                Some(0) => break,
                Some(left) => left.min(4096) as usize,
                None => 4096,
            };

            let n = reader
                .read(&mut buf[..to_read])
                .map_err(|e| DownloadError::Network(e.to_string()))?;
            if n == 0 {
                break;
            }

            self.signal_data_received();
            let file_offset = cursor.offset() + cursor.loaded();
            cursor.write(file_offset, &buf[..n])?;
        }

        if !ctx.is_loading() && !cursor.is_finished(ctx.slots_supported()) {
            return Err(DownloadError::ChunkNotFinished {
                critical: false,
                reason: "download was stopped".to_string(),
            });
        }

        if ctx.is_loading()
            && !cursor.is_finished(ctx.slots_supported())
            && cursor.bytes_left(ctx.slots_supported()).is_some()
        {
            return Err(DownloadError::ChunkNotFinished {
                critical: true,
                reason: "connection closed before the chunk finished".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FetchDataResult, FetchInfoResult};
    use std::io::Cursor as IoCursor;
    use std::sync::Mutex;

    struct StubTransport {
        body: Vec<u8>,
        confirm_partial: bool,
    }

    impl Transport for StubTransport {
        fn fetch_infos(&self, _source: &Source) -> Result<FetchInfoResult, DownloadError> {
            Ok(FetchInfoResult {
                real_url: "https://example.com/a/file.bin".to_string(),
                filename: None,
                filesize: Some(self.body.len() as u64),
            })
        }

        fn fetch_data(&self, _source: &Source, offset: u64) -> Result<FetchDataResult, DownloadError> {
            let slice = self.body[offset as usize..].to_vec();
            Ok(FetchDataResult {
                partial_content_confirmed: self.confirm_partial,
                reader: Box::new(IoCursor::new(slice)),
            })
        }
    }

    struct TestCursor {
        offset: u64,
        loaded: u64,
        length: Option<u64>,
        written: Mutex<Vec<u8>>,
    }

    impl ChunkCursor for TestCursor {
        fn offset(&self) -> u64 {
            self.offset
        }
        fn loaded(&self) -> u64 {
            self.loaded
        }
        fn bytes_left(&self, _slots_supported: bool) -> Option<u64> {
            self.length.map(|l| l.saturating_sub(self.loaded))
        }
        fn is_finished(&self, _slots_supported: bool) -> bool {
            self.length.is_some_and(|l| self.loaded >= l)
        }
        fn write(&mut self, _file_offset: u64, data: &[u8]) -> Result<(), DownloadError> {
            self.written.lock().unwrap().extend_from_slice(data);
            self.loaded += data.len() as u64;
            Ok(())
        }
    }

    struct AlwaysLoading;
    impl LoadingContext for AlwaysLoading {
        fn is_loading(&self) -> bool {
            true
        }
        fn slots_supported(&self) -> bool {
            true
        }
    }

    fn derives_filename_when_transport_omits_it() -> Result<(), DownloadError> {
        let transport: Arc<dyn Transport> = Arc::new(StubTransport {
            body: b"hello world".to_vec(),
            confirm_partial: true,
        });
        let source = Arc::new(Source::new(
            "https://example.com/a/file.bin",
            -1,
            -1,
            Duration::from_secs(1),
        ));
        let conn = Connection::new(transport, source);
        let (_, filename, filesize) = conn.fetch_infos()?;
        assert_eq!(filename.as_deref(), Some("file.bin"));
        assert_eq!(filesize, Some(11));
        Ok(())
    }

    #[test]
    fn filename_derivation_test() {
        derives_filename_when_transport_omits_it().unwrap();
    }

    #[test]
    fn fills_cursor_from_offset_zero() {
        let transport: Arc<dyn Transport> = Arc::new(StubTransport {
            body: b"0123456789".to_vec(),
            confirm_partial: true,
        });
        let source = Arc::new(Source::new("https://example.com/f", -1, -1, Duration::from_secs(1)));
        let mut conn = Connection::new(transport, source);
        conn.drain_delay = Duration::ZERO;
        let mut cursor = TestCursor {
            offset: 0,
            loaded: 0,
            length: Some(10),
            written: Mutex::new(Vec::new()),
        };
        conn.fetch_data(&mut cursor, &AlwaysLoading).unwrap();
        assert_eq!(cursor.written.into_inner().unwrap(), b"0123456789");
    }

    #[test]
    fn rejects_non_partial_response_for_nonzero_offset() {
        let transport: Arc<dyn Transport> = Arc::new(StubTransport {
            body: b"0123456789".to_vec(),
            confirm_partial: false,
        });
        let source = Arc::new(Source::new("https://example.com/f", -1, -1, Duration::from_secs(1)));
        let mut conn = Connection::new(transport, source);
        conn.drain_delay = Duration::ZERO;
        let mut cursor = TestCursor {
            offset: 5,
            loaded: 0,
            length: Some(5),
            written: Mutex::new(Vec::new()),
        };
        let err = conn.fetch_data(&mut cursor, &AlwaysLoading).unwrap_err();
        assert!(matches!(err, DownloadError::NotRangeCapable));
    }

    #[test]
    fn connection_closing_early_is_a_critical_error() {
        let transport: Arc<dyn Transport> = Arc::new(StubTransport {
            body: b"short".to_vec(),
            confirm_partial: true,
        });
        let source = Arc::new(Source::new("https://example.com/f", -1, -1, Duration::from_secs(1)));
        let mut conn = Connection::new(transport, source);
        conn.drain_delay = Duration::ZERO;
        let mut cursor = TestCursor {
            offset: 0,
            loaded: 0,
            length: Some(100),
            written: Mutex::new(Vec::new()),
        };
        let err = conn.fetch_data(&mut cursor, &AlwaysLoading).unwrap_err();
        assert!(matches!(
            err,
            DownloadError::ChunkNotFinished { critical: true, .. }
        ));
    }
}
