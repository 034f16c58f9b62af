//! Per-call flow control for streamed updates.
//!
//! Every call a session serves owns an [`UpdateWindow`]: emitting an update
//! takes one slot, and the consumer's ACK (sent when it drains the update)
//! gives it back. With the default window of one, at most one update per call
//! is in flight unacknowledged, so a slow consumer bounds memory on every hop
//! instead of growing queues.
//!
//! Cancellation closes the window, which wakes a blocked emitter immediately.

use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::{CallbusError, Result};

/// Default number of unacknowledged updates per call.
pub const DEFAULT_UPDATE_WINDOW: usize = 1;

/// Default time an emitter waits for the consumer to drain an update.
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Credit window for the updates of one call.
#[derive(Debug)]
pub struct UpdateWindow {
    slots: Semaphore,
    timeout: Duration,
}

impl UpdateWindow {
    /// Create a window with `size` slots.
    pub fn new(size: usize, timeout: Duration) -> Self {
        Self {
            slots: Semaphore::new(size.max(1)),
            timeout,
        }
    }

    /// Take a slot, waiting for an ACK if the window is full.
    ///
    /// Fails with [`CallbusError::CallDone`] if the window is closed, or
    /// closes it and fails the same way if no ACK arrives in time.
    pub async fn reserve(&self) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(())
            }
            Ok(Err(_)) => Err(CallbusError::CallDone),
            Err(_) => {
                tracing::warn!(
                    "Consumer did not drain updates within {:?}, giving up on the call",
                    self.timeout
                );
                self.close();
                Err(CallbusError::CallDone)
            }
        }
    }

    /// Give back one slot (an ACK arrived).
    #[inline]
    pub fn release(&self) {
        self.slots.add_permits(1);
    }

    /// Close the window; pending and future reservations fail.
    #[inline]
    pub fn close(&self) {
        self.slots.close();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    /// Slots currently free.
    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

impl Default for UpdateWindow {
    fn default() -> Self {
        Self::new(DEFAULT_UPDATE_WINDOW, DEFAULT_UPDATE_TIMEOUT)
    }
}
