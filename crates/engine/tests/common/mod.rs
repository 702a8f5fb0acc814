//! Shared test doubles for the end-to-end scenario tests: an
//! in-memory `Transport` plus polling helpers, since the engine's
//! worker threads make timing non-deterministic by nature.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use engine::error::DownloadError;
use engine::source::Source;
use engine::transport::{FetchDataResult, FetchInfoResult, Transport};

#[derive(Clone)]
pub struct FakeSourceConfig {
    pub body: Vec<u8>,
    pub range_supported: bool,
    /// Every `fetch_infos`/`fetch_data` call fails with a 500 until
    /// the internal attempt counter reaches this many failures.
    pub fail_first_n_attempts: u32,
    /// Slows reads to a crawl so a test can pause/cancel mid-stream.
    pub read_delay: Duration,
}

impl FakeSourceConfig {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            range_supported: true,
            fail_first_n_attempts: 0,
            read_delay: Duration::ZERO,
        }
    }

    pub fn refusing_ranges(mut self) -> Self {
        self.range_supported = false;
        self
    }

    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first_n_attempts = n;
        self
    }

    pub fn slow(mut self, per_read: Duration) -> Self {
        self.read_delay = per_read;
        self
    }
}

pub struct FakeTransport {
    sources: HashMap<String, FakeSourceConfig>,
    attempts: Mutex<HashMap<String, AtomicU32>>,
}

impl FakeTransport {
    pub fn new(sources: Vec<(&str, FakeSourceConfig)>) -> Self {
        let mut map = HashMap::new();
        let mut attempts = HashMap::new();
        for (url, cfg) in sources {
            map.insert(url.to_string(), cfg);
            attempts.insert(url.to_string(), AtomicU32::new(0));
        }
        Self {
            sources: map,
            attempts: Mutex::new(attempts),
        }
    }

    fn bump_attempt(&self, url: &str) -> u32 {
        let attempts = self.attempts.lock().unwrap();
        attempts[url].fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Transport for FakeTransport {
    fn fetch_infos(&self, source: &Source) -> Result<FetchInfoResult, DownloadError> {
        let url = source.url();
        let cfg = self.sources.get(&url).expect("unconfigured fake source");
        let attempt = self.bump_attempt(&url);
        if attempt <= cfg.fail_first_n_attempts {
            return Err(DownloadError::Http(500));
        }
        Ok(FetchInfoResult {
            real_url: url,
            filename: None,
            filesize: Some(cfg.body.len() as u64),
        })
    }

    fn fetch_data(&self, source: &Source, offset: u64) -> Result<FetchDataResult, DownloadError> {
        let url = source.url();
        let cfg = self.sources.get(&url).expect("unconfigured fake source");
        let attempt = self.bump_attempt(&url);
        if attempt <= cfg.fail_first_n_attempts {
            return Err(DownloadError::Http(500));
        }

        let offset = offset as usize;
        if offset > cfg.body.len() {
            return Err(DownloadError::Http(416));
        }
        let partial_content_confirmed = cfg.range_supported || offset == 0;
        let reader: Box<dyn Read + Send> = if cfg.read_delay.is_zero() {
            Box::new(std::io::Cursor::new(cfg.body[offset..].to_vec()))
        } else {
            Box::new(ThrottledReader {
                remaining: cfg.body[offset..].to_vec(),
                pos: 0,
                delay: cfg.read_delay,
            })
        };

        Ok(FetchDataResult {
            partial_content_confirmed,
            reader,
        })
    }
}

/// Returns at most 256 bytes per `read`, sleeping first, so a slow
/// download can be observed and interrupted mid-stream.
struct ThrottledReader {
    remaining: Vec<u8>,
    pos: usize,
    delay: Duration,
}

impl Read for ThrottledReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.remaining.len() {
            return Ok(0);
        }
        std::thread::sleep(self.delay);
        let chunk = (buf.len()).min(256).min(self.remaining.len() - self.pos);
        buf[..chunk].copy_from_slice(&self.remaining[self.pos..self.pos + chunk]);
        self.pos += chunk;
        Ok(chunk)
    }
}

/// Polls `condition` every 10ms until it returns true or `timeout`
/// elapses, then asserts it held -- the only reliable way to assert
/// on a thread-pool-driven state machine without a toolchain to tune
/// exact timings against.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        if Instant::now() >= deadline {
            assert!(condition(), "condition did not become true within {timeout:?}");
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
