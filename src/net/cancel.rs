//! Cooperative cancellation tokens.
//!
//! A token is observed two ways: polled via `is_cancelled`, or selected on
//! via `observer`. The observer channel is never sent on; it disconnects
//! when the token fires, which wakes every selecting thread at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender, bounded};

#[derive(Clone)]
pub struct CancelToken {
    fired: Arc<AtomicBool>,
    armed: Arc<Mutex<Option<Sender<()>>>>,
    observer: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            fired: Arc::new(AtomicBool::new(false)),
            armed: Arc::new(Mutex::new(Some(tx))),
            observer: rx,
        }
    }

    pub fn cancel(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.armed.lock().expect("cancel token lock poisoned").take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Receiver that disconnects when the token fires; for `select!`.
    pub fn observer(&self) -> &Receiver<()> {
        &self.observer
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
