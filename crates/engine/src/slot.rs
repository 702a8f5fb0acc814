//! Worker threads that drive a `Download` forward: one `InfoSlot` that
//! resolves filename/filesize before loading starts, and a pool of
//! `DataSlot`s that pull chunks off the pending queue and stream them
//! (SPEC_FULL.md §4.4, §4.5). Grounded on the polling/retry style of
//! a reference blocking downloader's worker loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::connection::Connection;
use crate::download::{sleep_in_increments, Download, DownloadState};
use crate::error::DownloadError;
use crate::log::MessageType;
use crate::source::{RetryDecision, Source};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Resolves the download's filename/filesize by trying each source in
/// turn, honoring per-source retry cooldowns, until one answers or
/// all are exhausted.
pub fn spawn_info_slot(download: Arc<Download>, first_source: Arc<Source>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut current = Some(first_source);

        loop {
            if download.state() != DownloadState::FetchingInfo {
                return;
            }

            let source = match current.take() {
                Some(source) => source,
                None => match next_source_for_info(&download) {
                    Some(source) => source,
                    None => {
                        download.on_info_failed();
                        return;
                    }
                },
            };

            let connection = Connection::new(download.transport.clone(), source.clone());
            match connection.fetch_infos() {
                Ok((real_url, filename, filesize)) => {
                    source.set_url(real_url);
                    if let Some(filename) = &filename {
                        source.set_filename(filename.clone());
                    }
                    source.set_filesize(filesize);
                    download.on_info_fetched(filename, filesize);
                    return;
                }
                Err(err) => {
                    download.log.add_log_entry(
                        MessageType::Warning,
                        "InfoSlot",
                        format!("info request failed for {}: {err}", source.url()),
                    );
                    if err.counts_as_source_failure() {
                        source.add_fail(false);
                    }
                }
            }
        }
    })
}

/// Picks the next source worth trying for an info request, sleeping
/// out its retry cooldown first if it has one. `None` once every
/// source has hit its retry ceiling.
fn next_source_for_info(download: &Arc<Download>) -> Option<Arc<Source>> {
    let sources = download.sources();

    for source in &sources {
        if !source.valid.load(Ordering::SeqCst) {
            continue;
        }
        match source.is_retry_allowed() {
            RetryDecision::Allowed => return Some(source.clone()),
            RetryDecision::WaitThen(wait) => {
                sleep_in_increments(wait, POLL_INTERVAL, || download.state() != DownloadState::FetchingInfo);
                if download.state() != DownloadState::FetchingInfo {
                    return None;
                }
                return Some(source.clone());
            }
            RetryDecision::Denied => continue,
        }
    }

    None
}

/// Pulls chunk ids off the pending queue and streams each one from
/// whichever source `Download::get_next_source` hands back, until the
/// download stops loading.
pub fn spawn_data_slot(download: Arc<Download>) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        if !download.is_loading() {
            return;
        }

        let id = match download.next_pending_chunk(POLL_INTERVAL) {
            Some(id) => id,
            None => continue,
        };

        if download.fix_chunk(id) {
            download.on_chunk_finished(id, None, false);
            continue;
        }

        let (source, wait) = download.get_next_source();
        let Some(source) = source else {
            if !download.is_loading() {
                return;
            }
            download.requeue_chunk(id);
            download.wait_for_source(POLL_INTERVAL);
            continue;
        };

        if let Some(wait) = wait {
            sleep_in_increments(wait, POLL_INTERVAL, || !download.is_loading());
        }
        if !download.is_loading() {
            source.dec_running_slots();
            download.requeue_chunk(id);
            return;
        }

        run_chunk_fetch(&download, id, source);
    })
}

fn run_chunk_fetch(download: &Arc<Download>, id: crate::chunk::ChunkId, source: Arc<Source>) {
    let connection = Connection::new(download.transport.clone(), source.clone());

    let started = Arc::new(AtomicBool::new(false));
    let started_clone = started.clone();
    let download_clone = download.clone();
    let source_clone = source.clone();
    connection.data_received_event.add_listener(move |()| {
        started_clone.store(true, Ordering::SeqCst);
        download_clone.chunk_started(id, &source_clone);
    });

    let mut cursor = download.chunk_handle(id);
    let outcome = connection.fetch_data(&mut cursor, download.as_ref());
    let data_received = started.load(Ordering::SeqCst);

    match outcome {
        Ok(()) => {
            download.on_chunk_finished(id, Some(source), data_received);
        }
        Err(DownloadError::NotRangeCapable) => {
            // Not charged against the source's retry budget: a range
            // refusal is recovered locally by falling back to a
            // single stream, not a transient fetch failure.
            download.demote_chunk_to_non_range(id);
            download.on_chunk_failed(id, Some(source), data_received, false);
        }
        Err(err) => {
            download.log.add_log_entry(
                MessageType::Warning,
                "DataSlot",
                format!("chunk fetch failed from {}: {err}", source.url()),
            );
            if err.counts_as_source_failure() {
                source.add_fail(data_received);
            }
            let ioerror = err.is_fatal_io();
            download.on_chunk_failed(id, Some(source), data_received, ioerror);
        }
    }
}
