//! Per-download structured log.
//!
//! Every error path in the engine appends exactly one entry here
//! (SPEC_FULL.md §7). Entries are also forwarded to the process-wide
//! `tracing` subscriber at a matching level, so the same call site
//! produces both a UI-consumable log and ordinary diagnostics.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::event::EventListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub message: String,
}

pub struct Log {
    messages: Mutex<Vec<LogEntry>>,
    pub message_added_event: EventListener<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            message_added_event: EventListener::new(),
        }
    }

    pub fn add_log_entry(
        &self,
        message_type: MessageType,
        component: impl Into<String>,
        message: impl Into<String>,
    ) {
        let component = component.into();
        let message = message.into();

        match message_type {
            MessageType::Info => tracing::info!(component = %component, "{}", message),
            MessageType::Warning => tracing::warn!(component = %component, "{}", message),
            MessageType::Error => tracing::error!(component = %component, "{}", message),
        }

        let entry = LogEntry {
            message_type,
            timestamp: Utc::now(),
            component,
            message,
        };

        self.messages.lock().unwrap().push(entry.clone());
        self.message_added_event.signal(entry);
    }

    pub fn get_copy_of_messages(&self) -> Vec<LogEntry> {
        self.messages.lock().unwrap().clone()
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}
