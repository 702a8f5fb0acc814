//! Periodic throughput sampler: turns each loading download's
//! monotonically increasing `bytes_loaded()` counter into a
//! bytes/second rate, publishing both the raw byte count and the rate
//! whenever they change, plus an aggregate rate across every download
//! currently loading (SPEC_FULL.md §4.7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::download::{Download, DownloadState};
use crate::event::EventListener;
use crate::manager::Manager;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

struct Sample {
    bytes: u64,
    rate: u64,
}

/// One background thread sampling every download in `manager` once a
/// second. Downloads that leave `loading` have their memo entry
/// purged (SPEC_FULL.md §4.7 "Downloads not in loading... purged").
pub struct DownloadMeter {
    manager: Arc<Manager>,
    samples: Mutex<HashMap<usize, Sample>>,
    aggregate_rate: AtomicU64,
    running: AtomicBool,
    last_tick: Mutex<Instant>,
    /// Fires with `(download, bytes_per_second)` whenever a loading
    /// download's published rate changes.
    pub download_rate_changed_event: EventListener<(Arc<Download>, u64)>,
    /// Fires with `(download, bytes_loaded)` whenever a loading
    /// download's published byte count changes.
    pub download_bytes_changed_event: EventListener<(Arc<Download>, u64)>,
    /// Fires with the summed rate across every currently-loading
    /// download, whenever that sum changes.
    pub aggregate_rate_changed_event: EventListener<u64>,
}

impl DownloadMeter {
    pub fn new(manager: Arc<Manager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            samples: Mutex::new(HashMap::new()),
            aggregate_rate: AtomicU64::new(0),
            running: AtomicBool::new(false),
            last_tick: Mutex::new(Instant::now()),
            download_rate_changed_event: EventListener::new(),
            download_bytes_changed_event: EventListener::new(),
            aggregate_rate_changed_event: EventListener::new(),
        })
    }

    pub fn aggregate_bytes_per_second(&self) -> u64 {
        self.aggregate_rate.load(Ordering::SeqCst)
    }

    /// Spawns the sampling thread. A no-op if already running.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        *self.last_tick.lock().unwrap() = Instant::now();

        let meter = self.clone();
        Some(std::thread::spawn(move || loop {
            std::thread::sleep(SAMPLE_INTERVAL);
            if !meter.running.load(Ordering::SeqCst) {
                return;
            }
            meter.tick();
        }))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Runs one sampling pass. Public so tests can drive it
    /// deterministically instead of sleeping a full second.
    pub fn tick(&self) {
        let now = Instant::now();
        let elapsed = {
            let mut last = self.last_tick.lock().unwrap();
            let elapsed = now.duration_since(*last);
            *last = now;
            elapsed
        };

        let downloads = self.manager.downloads();
        let mut samples = self.samples.lock().unwrap();
        let live_keys: std::collections::HashSet<usize> = downloads.iter().map(|d| key_of(d)).collect();
        samples.retain(|k, _| live_keys.contains(k));

        let mut aggregate = 0u64;
        for download in &downloads {
            if download.state() != DownloadState::Loading {
                samples.remove(&key_of(download));
                continue;
            }

            let bytes = download.bytes_loaded();
            let key = key_of(download);
            let rate = if elapsed.as_secs_f64() > 0.0 {
                let previous = samples.get(&key).map(|s| s.bytes).unwrap_or(bytes);
                ((bytes.saturating_sub(previous)) as f64 / elapsed.as_secs_f64()) as u64
            } else {
                0
            };
            aggregate += rate;

            let previous = samples.get(&key);
            let rate_changed = previous.map_or(true, |s| s.rate != rate);
            let bytes_changed = previous.map_or(true, |s| s.bytes != bytes);
            samples.insert(key, Sample { bytes, rate });
            if rate_changed {
                self.download_rate_changed_event.signal((download.clone(), rate));
            }
            if bytes_changed {
                self.download_bytes_changed_event.signal((download.clone(), bytes));
            }
        }
        drop(samples);

        let previous_aggregate = self.aggregate_rate.swap(aggregate, Ordering::SeqCst);
        if previous_aggregate != aggregate {
            self.aggregate_rate_changed_event.signal(aggregate);
        }
    }
}

fn key_of(download: &Arc<Download>) -> usize {
    Arc::as_ptr(download) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_transport::HttpTransport;
    use crate::source::Source;
    use std::path::PathBuf;

    fn make_download(filesize: Option<u64>) -> Arc<Download> {
        Download::new(
            PathBuf::from(std::env::temp_dir()),
            format!("meter-test-{:p}", &filesize),
            filesize,
            vec![Arc::new(Source::new("https://example.com/f", -1, -1, Duration::from_secs(1)))],
            Arc::new(HttpTransport::new().unwrap()),
            1024,
            1,
        )
    }

    #[test]
    fn starting_twice_is_a_no_op() {
        let manager = Manager::new(0);
        let meter = DownloadMeter::new(manager);
        assert!(meter.start().is_some());
        assert!(meter.start().is_none());
        meter.stop();
    }

    #[test]
    fn tick_purges_entries_for_downloads_that_left_loading() {
        let manager = Manager::new(0);
        let meter = DownloadMeter::new(manager.clone());

        let download = make_download(Some(1000));
        download.test_set_state(DownloadState::Loading);
        manager.add(download.clone());

        meter.tick();
        assert_eq!(meter.samples.lock().unwrap().len(), 1);

        download.test_set_state(DownloadState::Paused);
        meter.tick();
        assert_eq!(meter.samples.lock().unwrap().len(), 0);
    }

    #[test]
    fn aggregate_rate_sums_every_loading_download() {
        let manager = Manager::new(0);
        let meter = DownloadMeter::new(manager.clone());

        let a = make_download(Some(10_000_000));
        a.test_set_state(DownloadState::Loading);
        manager.add(a.clone());
        let b = make_download(Some(10_000_000));
        b.test_set_state(DownloadState::Loading);
        manager.add(b.clone());

        meter.tick();
        a.test_add_loaded(1_000_000);
        b.test_add_loaded(2_000_000);
        meter.tick();

        assert!(meter.aggregate_bytes_per_second() > 0);
    }

    #[test]
    fn publishes_bytes_changed_even_when_rate_is_unchanged() {
        let manager = Manager::new(0);
        let meter = DownloadMeter::new(manager.clone());

        let download = make_download(Some(10_000_000));
        download.test_set_state(DownloadState::Loading);
        manager.add(download.clone());

        let bytes_seen = Arc::new(Mutex::new(Vec::new()));
        let seen = bytes_seen.clone();
        meter.download_bytes_changed_event.add_listener(move |(_, bytes)| {
            seen.lock().unwrap().push(bytes);
        });

        meter.tick();
        download.test_add_loaded(1_000_000);
        meter.tick();
        download.test_add_loaded(1_000_000);
        meter.tick();

        let seen = bytes_seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1], 1_000_000);
        assert_eq!(seen[2], 2_000_000);
    }
}
