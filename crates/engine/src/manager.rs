//! Admission control across every tracked download: caps how many may
//! be actively loading at once and fairly promotes queued ones as
//! slots free up (SPEC_FULL.md §4.8).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::download::{Download, DownloadState};

pub struct Manager {
    downloads: Mutex<Vec<Arc<Download>>>,
    max_parallel_downloads: AtomicU32,
}

impl Manager {
    /// `max_parallel_downloads == 0` means unbounded, per SPEC_FULL.md §4.8.
    pub fn new(max_parallel_downloads: u32) -> Arc<Self> {
        Arc::new(Self {
            downloads: Mutex::new(Vec::new()),
            max_parallel_downloads: AtomicU32::new(max_parallel_downloads),
        })
    }

    pub fn max_parallel_downloads(&self) -> u32 {
        self.max_parallel_downloads.load(Ordering::SeqCst)
    }

    pub fn set_max_parallel_downloads(&self, n: u32) {
        self.max_parallel_downloads.store(n, Ordering::SeqCst);
        self.admit_next();
    }

    pub fn downloads(&self) -> Vec<Arc<Download>> {
        self.downloads.lock().unwrap().clone()
    }

    fn active_count(&self) -> u32 {
        self.downloads
            .lock()
            .unwrap()
            .iter()
            .filter(|d| matches!(d.state(), DownloadState::FetchingInfo | DownloadState::Loading))
            .count() as u32
    }

    /// Registers a download in submission order. If there is room
    /// under the parallelism cap, it is admitted immediately;
    /// otherwise it waits in the `Ready` state until a running
    /// download finishes, pauses, or fails.
    pub fn add(self: &Arc<Self>, download: Arc<Download>) {
        self.downloads.lock().unwrap().push(download.clone());
        let manager = self.clone();
        download.status_changed_event.add_listener(move |_state| {
            manager.admit_next();
        });
        self.admit_next();
    }

    /// Starts queued downloads, in submission order, until the
    /// parallelism cap is reached.
    pub fn admit_next(&self) {
        let downloads = self.downloads.lock().unwrap();
        let mut running = downloads
            .iter()
            .filter(|d| matches!(d.state(), DownloadState::FetchingInfo | DownloadState::Loading))
            .count() as u32;
        let cap = self.max_parallel_downloads();
        let unbounded = cap == 0;

        for download in downloads.iter() {
            if !unbounded && running >= cap {
                break;
            }
            if download.state() == DownloadState::Ready {
                download.start();
                running += 1;
            }
        }
    }

    pub fn remove(&self, download: &Arc<Download>) {
        self.downloads.lock().unwrap().retain(|d| !Arc::ptr_eq(d, download));
        self.admit_next();
    }

    /// Pauses every non-quiescent download and waits for each to leave
    /// `loading`/`fetching_info`/`stopping`, per SPEC_FULL.md §4.8 --
    /// used on process shutdown so no worker thread outlives the
    /// manager.
    pub fn quit(&self) {
        let downloads = self.downloads.lock().unwrap().clone();
        for download in &downloads {
            if matches!(download.state(), DownloadState::Loading | DownloadState::FetchingInfo) {
                download.pause();
            }
        }
        for download in &downloads {
            while matches!(
                download.state(),
                DownloadState::Loading | DownloadState::FetchingInfo | DownloadState::Stopping
            ) {
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
        }
    }
}
