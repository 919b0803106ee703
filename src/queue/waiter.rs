//! Reusable wake-up signal for readers blocked on an empty log.
//!
//! Built on a `watch` channel carrying a generation counter. A reader takes a
//! [`WaitHandle`] *before* inspecting log state, so a signal raised between
//! the inspection and the wait is never lost.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default)]
struct WaiterState {
    generation: u64,
    closed: bool,
}

/// Broadcast-style waiter: every signal wakes all current waiters.
#[derive(Debug)]
pub struct AsyncWaiter {
    tx: watch::Sender<WaiterState>,
}

impl AsyncWaiter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(WaiterState::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> WaitHandle {
        WaitHandle {
            rx: self.tx.subscribe(),
        }
    }

    /// Wake every waiter. The waiter stays reusable.
    pub fn signal(&self) {
        self.tx.send_modify(|state| state.generation = state.generation.wrapping_add(1));
    }

    /// Wake every waiter permanently; subsequent waits return immediately.
    pub fn close(&self) {
        self.tx.send_modify(|state| state.closed = true);
    }

    /// Make a closed waiter usable again.
    pub fn reopen(&self) {
        self.tx.send_if_modified(|state| std::mem::replace(&mut state.closed, false));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().closed
    }
}

impl Default for AsyncWaiter {
    fn default() -> Self {
        Self::new()
    }
}

/// A reader's subscription to an [`AsyncWaiter`].
#[derive(Debug)]
pub struct WaitHandle {
    rx: watch::Receiver<WaiterState>,
}

impl WaitHandle {
    /// Wait for the next signal. Returns `false` once the waiter is closed.
    pub async fn wait(&mut self) -> bool {
        if self.rx.borrow().closed {
            return false;
        }
        match self.rx.changed().await {
            Ok(()) => !self.rx.borrow_and_update().closed,
            Err(_) => false,
        }
    }
}
