//! A minimal synchronous pub/sub primitive used at every collaboration
//! seam in the engine (source URL changes, download status changes,
//! slot chunk lifecycle, ...).
//!
//! Delivery happens on the signalling thread. Listeners must not block
//! indefinitely -- see SPEC_FULL.md §9.

use std::sync::Mutex;

/// A typed event that subscribers can listen to.
///
/// `Args` is cloned once per registered listener on every `signal`
/// call, so it should be cheap to clone (an id, a small struct, or an
/// `Arc`).
pub struct EventListener<Args: Clone> {
    listeners: Mutex<Vec<Box<dyn Fn(Args) + Send + Sync>>>,
}

impl<Args: Clone> EventListener<Args> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(Args) + Send + Sync + 'static,
    {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    /// Synchronously calls every registered listener with a clone of
    /// `args`.
    pub fn signal(&self, args: Args) {
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            listener(args.clone());
        }
    }
}

impl<Args: Clone> Default for EventListener<Args> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn signals_all_listeners_in_order() {
        let event: EventListener<u32> = EventListener::new();
        let sum = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let sum = sum.clone();
            event.add_listener(move |n| {
                sum.fetch_add(n, Ordering::SeqCst);
            });
        }

        event.signal(5);
        assert_eq!(sum.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn signal_with_no_listeners_is_a_no_op() {
        let event: EventListener<()> = EventListener::new();
        event.signal(());
    }
}
