//! Single-slot, latest-wins relay between the capture worker and the display
//! consumer.
//!
//! The producer never waits: a push replaces whatever is still unread.
//! Memory stays bounded to one item however far the consumer falls behind.

use std::sync::{Arc, Mutex, PoisonError};

/// Clone-safe handle to a one-item mailbox.
pub struct DisplayRelay<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> DisplayRelay<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Store `item`, discarding any unconsumed previous one.
    ///
    /// Returns `true` if an unread item was dropped.
    pub fn push(&self, item: T) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(item)
            .is_some()
    }

    /// Take the latest item, if any. Never blocks on the producer beyond the
    /// slot lock.
    pub fn pop(&self) -> Option<T> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Drop any unread item.
    pub fn clear(&self) {
        self.pop();
    }

    pub fn is_empty(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl<T> Clone for DisplayRelay<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for DisplayRelay<T> {
    fn default() -> Self {
        Self::new()
    }
}
