//! Read-after-write sideband channel (§4.1 step 6, sideband-socket mode).
//!
//! The writer and its paired RAW reader are always worker threads of the
//! same [`crate::plan::PlanCoordinator`], so the socket the original engine
//! opened between two processes is replaced here by an in-process channel:
//! same notification protocol, no loopback connection to manage.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

/// One writer-side notice: `length` bytes were just committed at `location`.
#[derive(Debug, Clone, Copy)]
pub struct RawMessage {
    pub sequence: u64,
    pub location: u64,
    pub length: u64,
}

/// Shared between a writer target and its RAW reader; the writer clones
/// `sender()` once per worker, the reader(s) pull from the single receiver
/// under a mutex.
pub struct RawSideband {
    sender: Sender<RawMessage>,
    receiver: Mutex<Receiver<RawMessage>>,
}

impl RawSideband {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        RawSideband {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    pub fn sender(&self) -> Sender<RawMessage> {
        self.sender.clone()
    }

    /// Blocks until a message arrives, or returns `None` once every sender
    /// has dropped (the writer target tore down without a clean EOF).
    pub fn recv(&self) -> Option<RawMessage> {
        self.receiver.lock().expect("raw sideband receiver poisoned").recv().ok()
    }
}

impl Default for RawSideband {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_arrive_in_order() {
        let sideband = RawSideband::new();
        let tx = sideband.sender();
        tx.send(RawMessage { sequence: 0, location: 0, length: 4096 }).unwrap();
        tx.send(RawMessage { sequence: 1, location: 4096, length: 4096 }).unwrap();

        let first = sideband.recv().unwrap();
        assert_eq!(first.sequence, 0);
        let second = sideband.recv().unwrap();
        assert_eq!(second.location, 4096);
    }

    #[test]
    fn recv_returns_none_once_all_senders_dropped() {
        let sideband = RawSideband::new();
        {
            let _tx = sideband.sender();
        }
        assert!(sideband.recv().is_none());
    }
}
