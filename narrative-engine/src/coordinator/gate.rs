//! Per-session critical section with a bounded wait queue.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{EngineError, Result};

type Slots = Arc<DashMap<String, Arc<Slot>>>;

struct Slot {
    lock: Arc<Mutex<()>>,
    /// Callers queued behind the current holder
    waiting: Arc<AtomicUsize>,
}

/// Counted reference to a session's slot.
///
/// The map owns one reference; when the last caller lets go, the slot is
/// removed so idle sessions leave nothing behind.
struct SlotRef {
    slots: Slots,
    session_id: String,
    lock: Arc<Mutex<()>>,
    waiting: Arc<AtomicUsize>,
    token: Option<Arc<Slot>>,
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        drop(self.token.take());
        self.slots
            .remove_if(&self.session_id, |_, slot| Arc::strong_count(slot) == 1);
    }
}

/// Decrements the wait count when the waiter leaves, including on cancellation.
struct WaitTicket<'a>(&'a AtomicUsize);

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Proof of exclusive access to one session.
pub struct SessionPermit {
    // Field order matters: the lock is released before the slot reference.
    _guard: OwnedMutexGuard<()>,
    slot: SlotRef,
}

impl SessionPermit {
    pub fn session_id(&self) -> &str {
        &self.slot.session_id
    }
}

/// Serializes work per session; sessions never contend with each other.
///
/// When a session is held, up to `max_waiting` callers queue in FIFO order
/// (tokio's mutex is fair). Further callers are rejected with `SessionBusy`.
pub struct SessionGate {
    slots: Slots,
    max_waiting: usize,
}

impl SessionGate {
    pub fn new(max_waiting: usize) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            max_waiting,
        }
    }

    fn slot(&self, session_id: &str) -> SlotRef {
        let slot = Arc::clone(
            self.slots
                .entry(session_id.to_string())
                .or_insert_with(|| {
                    Arc::new(Slot {
                        lock: Arc::new(Mutex::new(())),
                        waiting: Arc::new(AtomicUsize::new(0)),
                    })
                })
                .value(),
        );
        SlotRef {
            slots: Arc::clone(&self.slots),
            session_id: session_id.to_string(),
            lock: Arc::clone(&slot.lock),
            waiting: Arc::clone(&slot.waiting),
            token: Some(slot),
        }
    }

    /// Enter the session's critical section, waiting if allowed.
    pub async fn acquire(&self, session_id: &str) -> Result<SessionPermit> {
        let slot = self.slot(session_id);

        if let Ok(guard) = Arc::clone(&slot.lock).try_lock_owned() {
            return Ok(SessionPermit {
                _guard: guard,
                slot,
            });
        }

        let guard = {
            let waiting = &*slot.waiting;
            let queued = waiting.fetch_add(1, Ordering::SeqCst);
            let _ticket = WaitTicket(waiting);
            if queued >= self.max_waiting {
                debug!(session_id = %session_id, queued, "Session busy; rejecting");
                return Err(EngineError::SessionBusy(session_id.to_string()));
            }
            Arc::clone(&slot.lock).lock_owned().await
        };
        Ok(SessionPermit {
            _guard: guard,
            slot,
        })
    }

    /// Number of callers waiting on a session.
    pub fn waiting(&self, session_id: &str) -> usize {
        self.slots
            .get(session_id)
            .map(|s| s.waiting.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Sessions with a holder or waiters.
    pub fn active_sessions(&self) -> usize {
        self.slots.len()
    }
}
