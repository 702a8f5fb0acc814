//! A download source: a URL plus the retry/slot bookkeeping needed to
//! decide whether it may still be used (SPEC_FULL.md §3, §4.2).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::event::EventListener;

/// Outcome of `Source::is_retry_allowed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// No prior failure; the source may be used right away.
    Allowed,
    /// A prior failure is still cooling down; wait this long first.
    WaitThen(Duration),
    /// `max_retries` has been reached; do not use this source again.
    Denied,
}

#[derive(Debug, Clone)]
pub struct CookiePair {
    pub name: String,
    pub value: String,
}

pub struct Source {
    pub original_url: String,
    url: Mutex<String>,
    pub max_redirects: i64,
    max_retries: AtomicI64,
    pub wait_time: Duration,
    filename: Mutex<String>,
    filesize: Mutex<Option<u64>>,
    retries: AtomicU32,
    pub timeout: Duration,
    pub user_agent: String,
    pub referrer: String,
    cookie_string: Mutex<String>,
    cookies: Mutex<Vec<CookiePair>>,
    pub valid: AtomicBool,

    /// Timestamps (as an offset from an arbitrary epoch) at which a
    /// past failure's retry cooldown ends, oldest first.
    failed: Mutex<Vec<Instant>>,

    running_slots: AtomicU32,
    active_slots: AtomicU32,
    max_active_slots: AtomicU32,
    max_slots_determined: AtomicBool,

    pub url_changed_event: EventListener<String>,
    pub retries_changed_event: EventListener<u32>,
}

impl Source {
    /// `^[^;=]+=[^;=]+(;[^;=]+=[^;=]+)*$`, matching the original
    /// validator -- neither the name nor the value may itself contain
    /// an `=`.
    pub fn is_cookie_string_valid(cookie_string: &str) -> bool {
        if cookie_string.is_empty() {
            return false;
        }
        cookie_string.split(';').all(|pair| {
            let mut parts = pair.split('=');
            let name = parts.next().unwrap_or("");
            let value = parts.next();
            let no_more_parts = parts.next().is_none();
            !name.is_empty() && value.is_some_and(|v| !v.is_empty()) && no_more_parts
        })
    }

    pub fn new(url: impl Into<String>, max_redirects: i64, max_retries: i64, wait_time: Duration) -> Self {
        let url = url.into();
        let filename = derive_filename(&url);
        Self {
            original_url: url.clone(),
            url: Mutex::new(url),
            max_redirects,
            max_retries: AtomicI64::new(max_retries),
            wait_time,
            filename: Mutex::new(filename),
            filesize: Mutex::new(None),
            retries: AtomicU32::new(0),
            timeout: Duration::from_secs(5),
            user_agent: String::new(),
            referrer: String::new(),
            cookie_string: Mutex::new(String::new()),
            cookies: Mutex::new(Vec::new()),
            valid: AtomicBool::new(true),
            failed: Mutex::new(Vec::new()),
            running_slots: AtomicU32::new(0),
            active_slots: AtomicU32::new(0),
            max_active_slots: AtomicU32::new(0),
            max_slots_determined: AtomicBool::new(false),
            url_changed_event: EventListener::new(),
            retries_changed_event: EventListener::new(),
        }
    }

    pub fn url(&self) -> String {
        self.url.lock().unwrap().clone()
    }

    pub fn set_url(&self, url: impl Into<String>) {
        let url = url.into();
        *self.url.lock().unwrap() = url.clone();
        self.url_changed_event.signal(url);
    }

    pub fn filename(&self) -> String {
        self.filename.lock().unwrap().clone()
    }

    pub fn set_filename(&self, filename: impl Into<String>) {
        *self.filename.lock().unwrap() = filename.into();
    }

    pub fn filesize(&self) -> Option<u64> {
        *self.filesize.lock().unwrap()
    }

    pub fn set_filesize(&self, filesize: Option<u64>) {
        *self.filesize.lock().unwrap() = filesize;
    }

    pub fn max_retries(&self) -> i64 {
        self.max_retries.load(Ordering::SeqCst)
    }

    pub fn set_max_retries(&self, max_retries: i64) {
        self.max_retries.store(max_retries, Ordering::SeqCst);
        self.retries_changed_event.signal(self.retries.load(Ordering::SeqCst));
    }

    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    pub fn set_cookie_string(&self, cookie_string: impl Into<String>) {
        let cookie_string = cookie_string.into();
        if !Self::is_cookie_string_valid(&cookie_string) {
            return;
        }
        let cookies = cookie_string
            .split(';')
            .filter_map(|pair| {
                let mut parts = pair.splitn(2, '=');
                let name = parts.next()?.to_string();
                let value = parts.next()?.to_string();
                Some(CookiePair { name, value })
            })
            .collect();
        *self.cookies.lock().unwrap() = cookies;
        *self.cookie_string.lock().unwrap() = cookie_string;
    }

    pub fn cookie_string(&self) -> String {
        self.cookie_string.lock().unwrap().clone()
    }

    pub fn cookies(&self) -> Vec<CookiePair> {
        self.cookies.lock().unwrap().clone()
    }

    /// Folds cookies observed on a response (`Set-Cookie`) back into
    /// the jar so later requests on this source -- including from
    /// other slots -- carry them, mirroring the reference
    /// implementation's "save cookie objects for later use" behavior.
    /// Existing cookies with the same name are overwritten.
    pub fn observe_response_cookies(&self, observed: &[(String, String)]) {
        if observed.is_empty() {
            return;
        }
        let mut cookies = self.cookies.lock().unwrap();
        for (name, value) in observed {
            if let Some(existing) = cookies.iter_mut().find(|c| &c.name == name) {
                existing.value = value.clone();
            } else {
                cookies.push(CookiePair {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
        }
    }

    pub fn running_slots(&self) -> u32 {
        self.running_slots.load(Ordering::SeqCst)
    }

    pub fn active_slots(&self) -> u32 {
        self.active_slots.load(Ordering::SeqCst)
    }

    pub fn max_active_slots(&self) -> u32 {
        self.max_active_slots.load(Ordering::SeqCst)
    }

    pub fn max_slots_determined(&self) -> bool {
        self.max_slots_determined.load(Ordering::SeqCst)
    }

    pub fn inc_running_slots(&self) {
        self.running_slots.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_running_slots(&self) {
        self.running_slots.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn inc_active_slots(&self) {
        let active = self.active_slots.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_slots.fetch_max(active, Ordering::SeqCst);
    }

    pub fn dec_active_slots(&self) {
        self.active_slots.fetch_sub(1, Ordering::SeqCst);
    }

    /// Record a failed attempt. If a slot had already been loading
    /// from this source and the new failure happened before any data
    /// was received, the currently observed `max_active_slots` is
    /// taken as a hard ceiling: this source cannot sustain more
    /// parallel slots than that.
    pub fn add_fail(&self, data_received: bool) {
        if self.max_active_slots() > 0 && !data_received {
            self.max_slots_determined.store(true, Ordering::SeqCst);
        }
        self.failed
            .lock()
            .unwrap()
            .push(Instant::now() + self.wait_time);
    }

    /// Whether this source may be used right now, and if not, how
    /// long the caller should wait before trying (or that it must
    /// never be retried again).
    pub fn is_retry_allowed(&self) -> RetryDecision {
        let mut failed = self.failed.lock().unwrap();
        if failed.is_empty() {
            return RetryDecision::Allowed;
        }

        let max_retries = self.max_retries();
        let retries = self.retries.load(Ordering::SeqCst);
        if max_retries < 0 || (retries as i64) < max_retries {
            let ready_at = failed.remove(0);
            drop(failed);
            let new_retries = self.retries.fetch_add(1, Ordering::SeqCst) + 1;
            self.retries_changed_event.signal(new_retries);
            let now = Instant::now();
            if ready_at <= now {
                RetryDecision::Allowed
            } else {
                RetryDecision::WaitThen(ready_at - now)
            }
        } else {
            RetryDecision::Denied
        }
    }
}

fn derive_filename(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let name = without_query.rsplit('/').next().unwrap_or("").trim();
    if name.is_empty() {
        "UnknownFileName".to_string()
    } else {
        name.to_string()
    }
}
