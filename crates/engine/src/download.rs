//! The per-file download state machine: chunk arena, source list,
//! slot pool, and the lifecycle transitions that tie them together
//! (SPEC_FULL.md §3, §4.6).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use storage::{ChunkSnapshot, CookieSnapshot, DownloadSnapshot, DownloadStateSnapshot, SourceSnapshot};

use crate::chunk::{Chunk, ChunkId};
use crate::connection::{ChunkCursor, LoadingContext};
use crate::error::DownloadError;
use crate::event::EventListener;
use crate::log::{Log, MessageType};
use crate::slot::{spawn_data_slot, spawn_info_slot};
use crate::source::{RetryDecision, Source};
use crate::targetfile::TargetFile;
use crate::transport::Transport;

pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// The `ready | fetching_info | loading | paused | cancelled | failed
/// | finished | stopping` state machine of SPEC_FULL.md §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Ready,
    FetchingInfo,
    Loading,
    Paused,
    Cancelled,
    Failed,
    Finished,
    Stopping,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Finished)
    }

    /// Whether a user-initiated request to move to `target` is valid
    /// from this state, per the transition table of SPEC_FULL.md
    /// §4.6 (paused may only be cancelled, not re-paused or failed
    /// directly; every other live state accepts all three requests).
    fn allows_request(self, target: DownloadState) -> bool {
        use DownloadState::*;
        matches!(
            (self, target),
            (Ready | FetchingInfo | Loading, Paused | Cancelled | Failed) | (Paused, Cancelled)
        )
    }
}

/// A `ChunkCursor` bound to one chunk of one download, handed to a
/// `DataSlot` for the duration of a single fetch attempt.
pub struct ChunkHandle {
    download: Arc<Download>,
    pub id: ChunkId,
}

impl ChunkCursor for ChunkHandle {
    fn offset(&self) -> u64 {
        self.download.chunk_offset(self.id)
    }

    fn loaded(&self) -> u64 {
        self.download.chunk_loaded(self.id)
    }

    fn bytes_left(&self, slots_supported: bool) -> Option<u64> {
        self.download.chunk_bytes_left(self.id, slots_supported)
    }

    fn is_finished(&self, slots_supported: bool) -> bool {
        self.download.chunk_is_finished(self.id, slots_supported)
    }

    fn write(&mut self, file_offset: u64, data: &[u8]) -> Result<(), DownloadError> {
        self.download.chunk_write(self.id, file_offset, data)
    }
}

impl LoadingContext for Download {
    fn is_loading(&self) -> bool {
        matches!(*self.state.lock().unwrap(), DownloadState::Loading)
    }

    fn slots_supported(&self) -> bool {
        self.slots_supported.load(Ordering::SeqCst)
    }
}

pub struct Download {
    pub target_folder: PathBuf,
    filename: Mutex<String>,
    pub original_filename: String,
    filesize: Mutex<Option<u64>>,
    slots_supported: AtomicBool,
    /// Frozen once a split's probe chunk proves the server does not
    /// honor range requests (see the `DESIGN.md` note on speculative
    /// splitting). Distinct from `slots_supported`, which is sticky
    /// true and never needs to go the other way.
    range_capable: AtomicBool,
    max_slot: AtomicU32,
    chunk_size: u64,

    chunks: Mutex<Vec<Chunk>>,
    root_id: ChunkId,

    pending_tx: Mutex<std::sync::mpsc::Sender<ChunkId>>,
    pending_rx: Mutex<std::sync::mpsc::Receiver<ChunkId>>,

    sources: Mutex<Vec<Arc<Source>>>,
    last_used_source: AtomicUsize,
    source_cv: Condvar,
    /// Paired logically with `sources`, but parked on separately so a
    /// waiting slot never has to hold the source list lock.
    source_wait_lock: Mutex<()>,

    active_slots: AtomicU32,

    pub log: Log,
    pub transport: Arc<dyn Transport>,
    pub target_file: Arc<TargetFile>,

    state: Mutex<DownloadState>,
    pending_target: Mutex<Option<DownloadState>>,
    infos_fetched: AtomicBool,
    /// Flips to `true` the first time `resume` runs. A fresh download
    /// streams its root chunk in non-slot mode (`original_length`
    /// semantics) until the first child starts; a download resumed
    /// after a pause (or restored from disk) already has a chunk tree
    /// from a prior run and must force `slots_supported` so its
    /// `is_finished`/`bytes_left` checks use the up-to-date `length`
    /// fields rather than the original undivided range.
    has_loaded_before: AtomicBool,

    info_thread: Mutex<Option<JoinHandle<()>>>,
    data_threads: Mutex<Vec<JoinHandle<()>>>,

    pub status_changed_event: EventListener<DownloadState>,
    pub chunk_started_event: EventListener<ChunkId>,
}

impl Download {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target_folder: PathBuf,
        filename: String,
        filesize: Option<u64>,
        sources: Vec<Arc<Source>>,
        transport: Arc<dyn Transport>,
        chunk_size: u64,
        max_slot: u32,
    ) -> Arc<Self> {
        let root = Chunk::root(filesize);
        let (tx, rx) = std::sync::mpsc::channel();
        let target_file = Arc::new(TargetFile::new(target_folder.join(format!("{filename}.dl"))));

        Arc::new(Self {
            target_folder,
            original_filename: filename.clone(),
            filename: Mutex::new(filename),
            filesize: Mutex::new(filesize),
            slots_supported: AtomicBool::new(false),
            range_capable: AtomicBool::new(true),
            max_slot: AtomicU32::new(max_slot.max(1)),
            chunk_size: chunk_size.max(1),
            chunks: Mutex::new(vec![root]),
            root_id: 0,
            pending_tx: Mutex::new(tx),
            pending_rx: Mutex::new(rx),
            sources: Mutex::new(sources),
            last_used_source: AtomicUsize::new(0),
            source_cv: Condvar::new(),
            source_wait_lock: Mutex::new(()),
            active_slots: AtomicU32::new(0),
            log: Log::new(),
            transport,
            target_file,
            state: Mutex::new(DownloadState::Ready),
            pending_target: Mutex::new(None),
            infos_fetched: AtomicBool::new(filesize.is_some()),
            has_loaded_before: AtomicBool::new(false),
            info_thread: Mutex::new(None),
            data_threads: Mutex::new(Vec::new()),
            status_changed_event: EventListener::new(),
            chunk_started_event: EventListener::new(),
        })
    }

    // -- accessors --------------------------------------------------

    pub fn state(&self) -> DownloadState {
        *self.state.lock().unwrap()
    }

    pub fn filename(&self) -> String {
        self.filename.lock().unwrap().clone()
    }

    pub fn filesize(&self) -> Option<u64> {
        *self.filesize.lock().unwrap()
    }

    pub fn max_slot(&self) -> u32 {
        self.max_slot.load(Ordering::SeqCst)
    }

    pub fn set_max_slot(&self, n: u32) {
        self.max_slot.store(n.max(1), Ordering::SeqCst);
    }

    pub fn active_slot_count(&self) -> u32 {
        self.active_slots.load(Ordering::SeqCst)
    }

    pub fn bytes_loaded(&self) -> u64 {
        let chunks = self.chunks.lock().unwrap();
        let slots_supported = self.slots_supported.load(Ordering::SeqCst);
        chunks.iter().map(|c| c.bytes_loaded(slots_supported)).sum()
    }

    pub fn sources(&self) -> Vec<Arc<Source>> {
        self.sources.lock().unwrap().clone()
    }

    // -- chunk-arena helpers (used by ChunkHandle / slots) ----------

    fn chunk_offset(&self, id: ChunkId) -> u64 {
        self.chunks.lock().unwrap()[id].offset
    }

    fn chunk_loaded(&self, id: ChunkId) -> u64 {
        self.chunks.lock().unwrap()[id].loaded
    }

    fn chunk_bytes_left(&self, id: ChunkId, slots_supported: bool) -> Option<u64> {
        self.chunks.lock().unwrap()[id].bytes_left(slots_supported)
    }

    fn chunk_is_finished(&self, id: ChunkId, slots_supported: bool) -> bool {
        self.chunks.lock().unwrap()[id].is_finished(slots_supported)
    }

    fn chunk_write(&self, id: ChunkId, file_offset: u64, data: &[u8]) -> Result<(), DownloadError> {
        self.target_file.write(file_offset, data)?;
        self.chunks.lock().unwrap()[id].loaded += data.len() as u64;
        Ok(())
    }

    fn unfinished_chunks_count(&self) -> usize {
        let chunks = self.chunks.lock().unwrap();
        let slots_supported = self.slots_supported.load(Ordering::SeqCst);
        chunks.iter().filter(|c| !c.is_finished(slots_supported)).count()
    }

    fn all_chunks_finished(&self) -> bool {
        let chunks = self.chunks.lock().unwrap();
        let slots_supported = self.slots_supported.load(Ordering::SeqCst);
        chunks.iter().all(|c| c.is_finished(slots_supported))
    }

    /// Handle to chunk `id`, for a slot that is about to fetch it.
    pub fn chunk_handle(self: &Arc<Self>, id: ChunkId) -> ChunkHandle {
        ChunkHandle {
            download: self.clone(),
            id,
        }
    }

    // -- chunk lifecycle notifications (§4.5, §4.6) ------------------

    /// First received byte of a fetch: promotes `slots_supported` for
    /// non-root chunks, bumps the active-slot counter on both the
    /// download and the serving source, and tries to manufacture more
    /// work for any other idle slots.
    pub fn chunk_started(self: &Arc<Self>, id: ChunkId, source: &Arc<Source>) {
        if id != self.root_id {
            self.slots_supported.store(true, Ordering::SeqCst);
        }
        self.active_slots.fetch_add(1, Ordering::SeqCst);
        source.inc_active_slots();
        self.chunk_started_event.signal(id);
        self.try_split_for_idle_slot();
    }

    pub fn on_chunk_finished(self: &Arc<Self>, _id: ChunkId, source: Option<Arc<Source>>, data_received: bool) {
        if data_received {
            self.active_slots.fetch_sub(1, Ordering::SeqCst);
        }
        if let Some(source) = source {
            source.dec_running_slots();
            if data_received {
                source.dec_active_slots();
            }
        }
        self.source_cv.notify_all();

        if self.filesize().is_none() || self.all_chunks_finished() {
            self.finish();
        } else {
            self.try_split_for_idle_slot();
        }
    }

    pub fn on_chunk_failed(self: &Arc<Self>, id: ChunkId, source: Option<Arc<Source>>, data_received: bool, ioerror: bool) {
        if data_received {
            self.active_slots.fetch_sub(1, Ordering::SeqCst);
        }
        if let Some(source) = &source {
            source.dec_running_slots();
            if data_received {
                source.dec_active_slots();
            }
        }
        if ioerror {
            self.log.add_log_entry(MessageType::Error, "Download", "Target file IO error; failing download");
            self.request_state(DownloadState::Failed);
        } else {
            let _ = self.pending_tx.lock().unwrap().send(id);
        }
        self.source_cv.notify_all();
    }

    /// Reaction to `DownloadError::NotRangeCapable`: the speculative
    /// child chunk that proved the server ignores `Range` is merged
    /// back into its parent and no further splits are attempted (see
    /// DESIGN.md, "speculative splitting").
    pub fn demote_chunk_to_non_range(&self, id: ChunkId) {
        self.range_capable.store(false, Ordering::SeqCst);
        let mut chunks = self.chunks.lock().unwrap();
        let parent = chunks[id].parent;
        let (offset, original_length) = (chunks[id].offset, chunks[id].original_length);
        if let Some(parent_id) = parent {
            chunks[parent_id].children.retain(|&c| c != id);
            if let Some(len) = original_length {
                let absorbed_end = offset + len;
                let parent_len = chunks[parent_id].length;
                chunks[parent_id].length = Some(parent_len.map_or(absorbed_end, |l| l.max(absorbed_end)));
                let parent_orig = chunks[parent_id].original_length;
                chunks[parent_id].original_length = Some(parent_orig.map_or(absorbed_end, |l| l.max(absorbed_end)));
            }
        }
        chunks[id].length = Some(0);
        chunks[id].original_length = Some(0);
        drop(chunks);
        self.log.add_log_entry(
            MessageType::Warning,
            "Download",
            "Server did not honor a range request; falling back to a single stream",
        );
    }

    // -- source selection (§4.6) -------------------------------------

    /// Round-robins over the source list, skipping invalid and
    /// concurrency-ceilinged sources. Returns `(None, None)` either
    /// because no source can serve right now (caller should wait on
    /// the source condition) or because every source is exhausted, in
    /// which case the download has already been failed.
    pub fn get_next_source(&self) -> (Option<Arc<Source>>, Option<Duration>) {
        let sources = self.sources.lock().unwrap();
        if sources.is_empty() {
            drop(sources);
            self.request_state(DownloadState::Failed);
            return (None, None);
        }

        let start = (self.last_used_source.load(Ordering::SeqCst) + 1) % sources.len();
        let mut exhausted_count = 0usize;
        let mut invalid_count = 0usize;

        for offset in 0..sources.len() {
            let idx = (start + offset) % sources.len();
            let source = &sources[idx];

            if !source.valid.load(Ordering::SeqCst) {
                invalid_count += 1;
                continue;
            }
            if let Some(filesize) = self.filesize() {
                if let Some(source_size) = source.filesize() {
                    if source_size != filesize {
                        source.valid.store(false, Ordering::SeqCst);
                        self.log.add_log_entry(
                            MessageType::Warning,
                            "Download",
                            format!("Source {} disagrees on filesize; marking invalid", source.url()),
                        );
                        invalid_count += 1;
                        continue;
                    }
                }
            }
            if source.max_slots_determined() && source.running_slots() >= source.max_active_slots() {
                continue;
            }

            match source.is_retry_allowed() {
                RetryDecision::Denied => {
                    exhausted_count += 1;
                    continue;
                }
                RetryDecision::Allowed => {
                    self.last_used_source.store(idx, Ordering::SeqCst);
                    source.inc_running_slots();
                    return (Some(source.clone()), None);
                }
                RetryDecision::WaitThen(wait) => {
                    self.last_used_source.store(idx, Ordering::SeqCst);
                    source.inc_running_slots();
                    return (Some(source.clone()), Some(wait));
                }
            }
        }

        if invalid_count + exhausted_count == sources.len() {
            drop(sources);
            self.log.add_log_entry(MessageType::Error, "Download", "No valid source found");
            self.request_state(DownloadState::Failed);
        }
        (None, None)
    }

    pub fn wait_for_source(&self, timeout: Duration) {
        let guard = self.source_wait_lock.lock().unwrap();
        let _ = self.source_cv.wait_timeout(guard, timeout);
    }

    /// Pops a chunk id off the pending queue, or `None` if nothing
    /// arrived within `timeout` (the 200ms poll of SPEC_FULL.md §4.5).
    pub fn next_pending_chunk(&self, timeout: Duration) -> Option<ChunkId> {
        self.pending_rx.lock().unwrap().recv_timeout(timeout).ok()
    }

    pub fn requeue_chunk(&self, id: ChunkId) {
        let _ = self.pending_tx.lock().unwrap().send(id);
    }

    // -- fix_chunk (§4.6) --------------------------------------------

    /// Resolves overlap between `id` and the root chunk's (possibly
    /// overshot) stream. Returns `true` if the chunk was fully
    /// absorbed and should be treated as already finished.
    pub fn fix_chunk(&self, id: ChunkId) -> bool {
        if id == self.root_id {
            return false;
        }
        let mut chunks = self.chunks.lock().unwrap();
        if chunks[id].parent != Some(self.root_id) {
            return false;
        }

        let root_loaded = chunks[self.root_id].loaded;
        let offset = chunks[id].offset;
        let length = match chunks[id].length {
            Some(l) => l,
            None => return false,
        };

        let overlap = root_loaded.saturating_sub(offset).min(length);
        if overlap == 0 {
            return false;
        }

        let new_root_min = offset + overlap;
        let root_len = chunks[self.root_id].length;
        chunks[self.root_id].length = Some(root_len.map_or(new_root_min, |l| l.max(new_root_min)));

        chunks[id].offset += overlap;
        let remaining = length - overlap;
        chunks[id].length = Some(remaining);

        if remaining == 0 {
            chunks[id].original_length = Some(0);
            true
        } else {
            false
        }
    }

    // -- adaptive splitting (§4.6) ------------------------------------

    /// Sum of `max_active_slots` for valid sources with a determined
    /// ceiling, or `None` (unbounded) if none has been determined yet.
    fn max_slots_server(&self) -> Option<u32> {
        let sources = self.sources.lock().unwrap();
        let determined: Vec<&Arc<Source>> = sources
            .iter()
            .filter(|s| s.valid.load(Ordering::SeqCst) && s.max_slots_determined())
            .collect();
        if determined.is_empty() {
            None
        } else {
            Some(determined.iter().map(|s| s.max_active_slots()).sum())
        }
    }

    /// Finds the unfinished chunk with the largest remaining work and
    /// splits it in half, enqueuing the new child for an idle slot.
    /// A no-op once `demote_chunk_to_non_range` has frozen the
    /// download into single-stream mode, or when the split budget
    /// (`max_slot`, or the server's known concurrency ceiling) is
    /// already met.
    pub fn try_split_for_idle_slot(&self) -> Option<ChunkId> {
        if !self.range_capable.load(Ordering::SeqCst) {
            return None;
        }
        self.filesize()?;

        let unfinished = self.unfinished_chunks_count() as u32;
        if unfinished >= self.max_slot() {
            return None;
        }
        if let Some(server_cap) = self.max_slots_server() {
            if unfinished >= server_cap {
                return None;
            }
        }

        let slots_supported = self.slots_supported.load(Ordering::SeqCst);
        let mut chunks = self.chunks.lock().unwrap();
        let candidate = chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_finished(slots_supported))
            .filter_map(|(i, c)| c.bytes_left(slots_supported).map(|left| (i, left)))
            .filter(|(_, left)| *left >= self.chunk_size)
            .max_by_key(|(_, left)| *left);

        let (parent_id, bytes_left) = candidate?;
        let half = bytes_left / 2;
        if half == 0 {
            return None;
        }

        let new_offset = {
            let parent = &mut chunks[parent_id];
            let parent_length = parent.length.unwrap();
            parent.length = Some(parent_length - half);
            parent.offset + parent_length - half
        };

        let child = Chunk::child(parent_id, new_offset, half);
        let new_id = chunks.len();
        chunks.push(child);
        chunks[parent_id].children.push(new_id);
        drop(chunks);

        let _ = self.pending_tx.lock().unwrap().send(new_id);
        Some(new_id)
    }

    // -- lifecycle (§4.6) ---------------------------------------------

    /// Admits the download: runs an `InfoSlot` first unless the
    /// filesize/URL are already known (the resume path), in which
    /// case it goes straight to `_resume`.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if *state == DownloadState::Paused {
            *state = DownloadState::Ready;
        } else if *state != DownloadState::Ready {
            return;
        }
        if self.infos_fetched.load(Ordering::SeqCst) {
            *state = DownloadState::Loading;
            drop(state);
            self.status_changed_event.signal(DownloadState::Loading);
            self.resume();
        } else {
            *state = DownloadState::FetchingInfo;
            drop(state);
            self.status_changed_event.signal(DownloadState::FetchingInfo);
            let sources = self.sources.lock().unwrap();
            let Some(first_source) = sources.first().cloned() else {
                drop(sources);
                self.request_state(DownloadState::Failed);
                return;
            };
            drop(sources);

            let download = self.clone();
            let handle = spawn_info_slot(download, first_source);
            *self.info_thread.lock().unwrap() = Some(handle);
        }
    }

    /// Called by the `InfoSlot` on success: records the discovered
    /// filename/filesize and moves into `loading`.
    pub fn on_info_fetched(self: &Arc<Self>, filename: Option<String>, filesize: Option<u64>) {
        if let Some(filesize) = filesize {
            *self.filesize.lock().unwrap() = Some(filesize);
            self.chunks.lock().unwrap()[self.root_id].original_length = Some(filesize);
            self.chunks.lock().unwrap()[self.root_id].length = Some(filesize);
        }
        if let Some(filename) = filename {
            let resolved = platform::disambiguate_filename(&self.target_folder, &filename);
            *self.filename.lock().unwrap() = resolved;
        }
        self.infos_fetched.store(true, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        if *state != DownloadState::FetchingInfo {
            return;
        }
        *state = DownloadState::Loading;
        drop(state);
        self.status_changed_event.signal(DownloadState::Loading);
        self.resume();
    }

    /// Called by the `InfoSlot` when every source is exhausted.
    pub fn on_info_failed(self: &Arc<Self>) {
        self.log.add_log_entry(MessageType::Error, "Download", "No valid source found");
        self.request_state(DownloadState::Failed);
    }

    /// Opens the temp file and spawns the `DataSlot` pool
    /// (SPEC_FULL.md §4.6 "Resume").
    fn resume(self: &Arc<Self>) {
        if let Err(err) = self.target_file.open() {
            self.log.add_log_entry(MessageType::Error, "Download", format!("Could not open temp file: {err}"));
            self.request_state(DownloadState::Failed);
            return;
        }

        if self.has_loaded_before.swap(true, Ordering::SeqCst) {
            self.slots_supported.store(true, Ordering::SeqCst);
        }

        if self.filesize() == Some(0) {
            self.finish();
            return;
        }

        let slots_supported = self.slots_supported.load(Ordering::SeqCst);
        let unfinished: Vec<ChunkId> = {
            let chunks = self.chunks.lock().unwrap();
            chunks
                .iter()
                .enumerate()
                .filter(|(_, c)| !c.is_finished(slots_supported))
                .map(|(i, _)| i)
                .collect()
        };
        for id in &unfinished {
            let _ = self.pending_tx.lock().unwrap().send(*id);
        }

        let slot_count = if self.filesize().is_some() { self.max_slot() } else { 1 };
        let mut handles = self.data_threads.lock().unwrap();
        for _ in 0..slot_count {
            handles.push(spawn_data_slot(self.clone()));
        }
    }

    fn finish(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if state.is_terminal() {
            return;
        }
        *state = DownloadState::Stopping;
        drop(state);
        self.source_cv.notify_all();
        self.spawn_cleanup(DownloadState::Finished);
    }

    // -- external requests (§4.6, §5 cancellation) --------------------

    pub fn pause(self: &Arc<Self>) {
        self.request_state(DownloadState::Paused);
    }

    pub fn cancel(self: &Arc<Self>) {
        self.request_state(DownloadState::Cancelled);
    }

    pub fn fail(self: &Arc<Self>) {
        self.request_state(DownloadState::Failed);
    }

    /// Non-blocking try-acquire of the state lock: a request that
    /// arrives while another transition is already in flight is
    /// silently dropped, per SPEC_FULL.md §5 "State-change
    /// try-acquire".
    fn request_state(self: &Arc<Self>, target: DownloadState) {
        let mut guard = match self.state.try_lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if !guard.allows_request(target) {
            return;
        }
        *guard = DownloadState::Stopping;
        drop(guard);

        *self.pending_target.lock().unwrap() = Some(target);
        self.source_cv.notify_all();
        self.spawn_cleanup(target);
    }

    /// Joins the `InfoSlot`/`DataSlot` threads, closes the temp file,
    /// drains the pending queue, and (cancellation only) clears the
    /// chunk table and deletes the temp file, before recording the
    /// terminal state.
    fn spawn_cleanup(self: &Arc<Self>, target: DownloadState) {
        let download = self.clone();
        std::thread::spawn(move || {
            if let Some(handle) = download.info_thread.lock().unwrap().take() {
                let _ = handle.join();
            }
            let handles: Vec<_> = std::mem::take(&mut *download.data_threads.lock().unwrap());
            for handle in handles {
                let _ = handle.join();
            }

            let _ = download.target_file.close();

            {
                let rx = download.pending_rx.lock().unwrap();
                while rx.try_recv().is_ok() {}
            }

            if target == DownloadState::Cancelled {
                download.chunks.lock().unwrap().clear();
                let _ = std::fs::remove_file(download.target_file.path());
            }

            if target == DownloadState::Finished {
                let resolved = platform::finalize_filename(&download.target_folder, &download.filename());
                let final_path = download.target_folder.join(&resolved);
                if let Err(err) = platform::atomic_rename(download.target_file.path(), &final_path) {
                    download.log.add_log_entry(
                        MessageType::Warning,
                        "Download",
                        format!("Could not rename temp file to final name: {err}"),
                    );
                } else {
                    *download.filename.lock().unwrap() = resolved;
                }
            }

            *download.pending_target.lock().unwrap() = None;
            *download.state.lock().unwrap() = target;
            download.status_changed_event.signal(target);
        });
    }

    // -- persistence (§6, `[ADDED]`) ----------------------------------

    pub fn snapshot(&self) -> Option<DownloadSnapshot> {
        let state = self.state();
        if state == DownloadState::Stopping {
            return None;
        }
        let chunks = self.chunks.lock().unwrap();
        let root_chunk = Some(chunk_to_snapshot(&chunks, self.root_id));
        let sources = self.sources.lock().unwrap();

        Some(DownloadSnapshot {
            chunk_size: self.chunk_size,
            max_slot: self.max_slot(),
            filesize: self.filesize(),
            infos_fetched: self.infos_fetched.load(Ordering::SeqCst),
            slots_supported: self.slots_supported.load(Ordering::SeqCst),
            last_used_source: self.last_used_source.load(Ordering::SeqCst),
            target_folder: self.target_folder.display().to_string(),
            filename: self.filename(),
            original_filename: self.original_filename.clone(),
            state: state_to_snapshot(state),
            sources: sources.iter().map(|s| source_to_snapshot(s)).collect(),
            root_chunk,
        })
    }

    pub fn from_snapshot(
        snapshot: DownloadSnapshot,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, DownloadError> {
        let sources: Vec<Arc<Source>> = snapshot.sources.iter().map(source_from_snapshot).collect();
        let download = Self::new(
            PathBuf::from(&snapshot.target_folder),
            snapshot.filename.clone(),
            snapshot.filesize,
            sources,
            transport,
            snapshot.chunk_size,
            snapshot.max_slot,
        );

        download.infos_fetched.store(snapshot.infos_fetched, Ordering::SeqCst);
        download.slots_supported.store(snapshot.slots_supported, Ordering::SeqCst);
        download.last_used_source.store(snapshot.last_used_source, Ordering::SeqCst);

        if let Some(root) = &snapshot.root_chunk {
            let mut chunks = download.chunks.lock().unwrap();
            chunks.clear();
            chunk_from_snapshot(root, None, &mut chunks);
        }

        *download.state.lock().unwrap() = state_from_snapshot(snapshot.state);

        if snapshot.state == DownloadStateSnapshot::Loading && !download.target_file.path().exists() {
            return Err(DownloadError::MissingTempFile(download.target_file.path().display().to_string()));
        }

        Ok(download)
    }
}

fn chunk_to_snapshot(chunks: &[Chunk], id: ChunkId) -> ChunkSnapshot {
    let chunk = &chunks[id];
    ChunkSnapshot {
        offset: chunk.offset,
        original_length: chunk.original_length,
        length: chunk.length,
        loaded: chunk.loaded,
        children: chunk.children.iter().map(|&c| chunk_to_snapshot(chunks, c)).collect(),
    }
}

fn chunk_from_snapshot(snapshot: &ChunkSnapshot, parent: Option<ChunkId>, chunks: &mut Vec<Chunk>) -> ChunkId {
    let id = chunks.len();
    chunks.push(Chunk {
        parent,
        children: Vec::new(),
        offset: snapshot.offset,
        original_length: snapshot.original_length,
        length: snapshot.length,
        loaded: snapshot.loaded,
    });
    let child_ids: Vec<ChunkId> = snapshot
        .children
        .iter()
        .map(|c| chunk_from_snapshot(c, Some(id), chunks))
        .collect();
    chunks[id].children = child_ids;
    id
}

fn source_to_snapshot(source: &Source) -> SourceSnapshot {
    SourceSnapshot {
        original_url: source.original_url.clone(),
        url: source.url(),
        max_redirects: source.max_redirects,
        max_retries: source.max_retries(),
        wait_time_secs: source.wait_time.as_secs(),
        filename: source.filename(),
        filesize: source.filesize(),
        retries: source.retries(),
        timeout_secs: source.timeout.as_secs(),
        user_agent: source.user_agent.clone(),
        referrer: source.referrer.clone(),
        valid: source.valid.load(Ordering::SeqCst),
        max_active_slots: source.max_active_slots(),
        max_slots_determined: source.max_slots_determined(),
        cookie_string: source.cookie_string(),
        cookies: source
            .cookies()
            .into_iter()
            .map(|c| CookieSnapshot {
                name: c.name,
                value: c.value,
                ..Default::default()
            })
            .collect(),
    }
}

fn source_from_snapshot(snapshot: &SourceSnapshot) -> Arc<Source> {
    let source = Source::new(
        snapshot.original_url.clone(),
        snapshot.max_redirects,
        snapshot.max_retries,
        Duration::from_secs(snapshot.wait_time_secs),
    );
    source.set_url(snapshot.url.clone());
    source.set_filename(snapshot.filename.clone());
    source.set_filesize(snapshot.filesize);
    source.valid.store(snapshot.valid, Ordering::SeqCst);
    source.set_cookie_string(snapshot.cookie_string.clone());
    if !snapshot.cookies.is_empty() {
        let pairs: Vec<(String, String)> = snapshot.cookies.iter().map(|c| (c.name.clone(), c.value.clone())).collect();
        source.observe_response_cookies(&pairs);
    }
    Arc::new(source)
}

fn state_to_snapshot(state: DownloadState) -> DownloadStateSnapshot {
    match state {
        DownloadState::Ready => DownloadStateSnapshot::Ready,
        DownloadState::FetchingInfo => DownloadStateSnapshot::FetchingInfo,
        DownloadState::Loading => DownloadStateSnapshot::Loading,
        DownloadState::Paused => DownloadStateSnapshot::Paused,
        DownloadState::Cancelled => DownloadStateSnapshot::Cancelled,
        DownloadState::Failed => DownloadStateSnapshot::Failed,
        DownloadState::Finished => DownloadStateSnapshot::Finished,
        DownloadState::Stopping => unreachable!("snapshot() refuses to run while stopping"),
    }
}

fn state_from_snapshot(state: DownloadStateSnapshot) -> DownloadState {
    match state {
        DownloadStateSnapshot::Ready => DownloadState::Ready,
        DownloadStateSnapshot::FetchingInfo => DownloadState::FetchingInfo,
        DownloadStateSnapshot::Loading => DownloadState::Ready, // resumed loads are re-admitted via start()
        DownloadStateSnapshot::Paused => DownloadState::Ready,
        DownloadStateSnapshot::Cancelled => DownloadState::Cancelled,
        DownloadStateSnapshot::Failed => DownloadState::Failed,
        DownloadStateSnapshot::Finished => DownloadState::Finished,
    }
}

/// Last-used timestamp helper shared by slots waiting out a source's
/// retry cooldown (SPEC_FULL.md §4.5 step 3).
pub fn sleep_in_increments(total: Duration, increment: Duration, mut should_stop: impl FnMut() -> bool) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if should_stop() {
            return;
        }
        std::thread::sleep(increment.min(deadline.saturating_duration_since(Instant::now())));
    }
}

/// Test-only seams for exercising state transitions and load progress
/// without driving a real network fetch through the slot machinery
/// (used by `meter`'s sampler tests, which live in a sibling module).
#[cfg(test)]
impl Download {
    pub(crate) fn test_set_state(&self, state: DownloadState) {
        *self.state.lock().unwrap() = state;
    }

    pub(crate) fn test_add_loaded(&self, n: u64) {
        self.chunks.lock().unwrap()[self.root_id].loaded += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_transport::HttpTransport;

    fn make_download(filesize: Option<u64>) -> Arc<Download> {
        let dir = std::env::temp_dir().join(format!("download-test-{}-{:p}", std::process::id(), &filesize));
        let _ = std::fs::create_dir_all(&dir);
        let source = Arc::new(Source::new("https://example.com/f", -1, -1, Duration::from_millis(1)));
        Download::new(
            dir,
            "f".to_string(),
            filesize,
            vec![source],
            Arc::new(HttpTransport::new().unwrap()),
            1024,
            3,
        )
    }

    #[test]
    fn fresh_download_starts_ready_with_a_single_root_chunk() {
        let download = make_download(Some(1000));
        assert_eq!(download.state(), DownloadState::Ready);
        assert_eq!(download.chunks.lock().unwrap().len(), 1);
    }

    #[test]
    fn get_next_source_round_robins_and_increments_running_slots() {
        let download = make_download(Some(1000));
        let s2 = Arc::new(Source::new("https://mirror.example.com/f", -1, -1, Duration::from_millis(1)));
        download.sources.lock().unwrap().push(s2);

        let (first, _) = download.get_next_source();
        assert!(first.is_some());
        assert_eq!(first.unwrap().running_slots(), 1);
    }

    #[test]
    fn get_next_source_fails_download_when_all_sources_invalid() {
        let download = make_download(Some(1000));
        download.sources.lock().unwrap()[0].valid.store(false, Ordering::SeqCst);
        let (source, _) = download.get_next_source();
        assert!(source.is_none());
        assert_eq!(download.state(), DownloadState::Stopping);
    }

    #[test]
    fn fix_chunk_absorbs_a_fully_overlapped_child() {
        let download = make_download(Some(1000));
        {
            let mut chunks = download.chunks.lock().unwrap();
            chunks[download.root_id].loaded = 1000;
            chunks.push(Chunk::child(download.root_id, 500, 200));
            chunks[download.root_id].children.push(1);
        }
        let absorbed = download.fix_chunk(1);
        assert!(absorbed);
    }

    #[test]
    fn fix_chunk_shrinks_a_partially_overlapped_child() {
        let download = make_download(Some(1000));
        {
            let mut chunks = download.chunks.lock().unwrap();
            chunks[download.root_id].loaded = 550;
            chunks.push(Chunk::child(download.root_id, 500, 200));
            chunks[download.root_id].children.push(1);
        }
        let absorbed = download.fix_chunk(1);
        assert!(!absorbed);
        let chunks = download.chunks.lock().unwrap();
        assert_eq!(chunks[1].offset, 550);
        assert_eq!(chunks[1].length, Some(150));
    }

    #[test]
    fn try_split_halves_the_largest_unfinished_chunk() {
        let download = make_download(Some(6 * 1024 * 1024));
        let new_id = download.try_split_for_idle_slot();
        assert!(new_id.is_some());
        let chunks = download.chunks.lock().unwrap();
        assert_eq!(chunks[download.root_id].length, Some(3 * 1024 * 1024));
        assert_eq!(chunks[new_id.unwrap()].length, Some(3 * 1024 * 1024));
    }

    #[test]
    fn try_split_does_nothing_past_max_slot() {
        let download = make_download(Some(6 * 1024 * 1024));
        download.set_max_slot(1);
        assert!(download.try_split_for_idle_slot().is_none());
    }

    #[test]
    fn try_split_does_nothing_when_chunk_size_exceeds_remaining_bytes() {
        let download = make_download(Some(500));
        assert!(download.try_split_for_idle_slot().is_none());
    }

    #[test]
    fn demote_to_non_range_merges_child_back_into_root() {
        let download = make_download(Some(6 * 1024 * 1024));
        let new_id = download.try_split_for_idle_slot().unwrap();
        download.demote_chunk_to_non_range(new_id);

        let chunks = download.chunks.lock().unwrap();
        assert_eq!(chunks[download.root_id].length, Some(6 * 1024 * 1024));
        assert_eq!(chunks[new_id].length, Some(0));
        assert!(!download.range_capable.load(Ordering::SeqCst));
    }

    #[test]
    fn set_max_slot_is_idempotent() {
        let download = make_download(Some(1000));
        download.set_max_slot(5);
        download.set_max_slot(5);
        assert_eq!(download.max_slot(), 5);
    }

    #[test]
    fn snapshot_round_trips_chunk_tree_and_sources() {
        let download = make_download(Some(1000));
        let snapshot = download.snapshot().expect("not stopping");
        assert_eq!(snapshot.filesize, Some(1000));
        assert_eq!(snapshot.sources.len(), 1);
        assert!(snapshot.root_chunk.is_some());

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: DownloadSnapshot = serde_json::from_str(&json).unwrap();
        let restored = Download::from_snapshot(back, Arc::new(HttpTransport::new().unwrap())).unwrap();
        assert_eq!(restored.filesize(), Some(1000));
        assert_eq!(restored.sources().len(), 1);
    }
}
