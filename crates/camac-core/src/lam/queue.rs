//! Bounded LAM event queue.
//!
//! The producer side is handed to backends at branch init and is called from
//! their interrupt path, so [`LamPoster::post`] never blocks: when the queue is
//! full the event is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const DROP_LOG_INTERVAL: u64 = 1000;

/// One LAM notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LamEvent {
    /// Branch that raised the demand
    pub branch: u8,
    /// Crate that raised the demand
    pub crate_num: u8,
    /// Slot of the source, or `None` to scan the crate's LAM pattern
    pub slot: Option<u8>,
}

/// Non-blocking producer for LAM events.
#[derive(Debug, Clone)]
pub struct LamPoster {
    tx: mpsc::Sender<LamEvent>,
    dropped: Arc<AtomicU64>,
}

impl LamPoster {
    /// Queue an event without blocking. Returns `false` if it was dropped.
    pub fn post(&self, branch: u8, crate_num: u8, slot: Option<u8>) -> bool {
        let event = LamEvent {
            branch,
            crate_num,
            slot,
        };
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % DROP_LOG_INTERVAL == 0 {
                    warn!(branch, crate_num, ?slot, dropped, "LAM queue full, event dropped");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(branch, crate_num, ?slot, "LAM dispatcher gone, event dropped");
                false
            }
        }
    }

    /// Number of events dropped because the queue was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create a queue holding at most `depth` events.
pub(crate) fn lam_queue(depth: usize) -> (LamPoster, mpsc::Receiver<LamEvent>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (
        LamPoster {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}
