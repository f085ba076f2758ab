//! Per-bucket in-memory broker
//!
//! Sits between the producers (many, latency-sensitive) and the bucket's
//! disk writer (one, I/O-bound). Appends go through the lock-free
//! [`FlippingContainer`]; the mutex/condvar pair here only carries the
//! writer's sleep/wake signalling and the flush/shutdown flags, never the
//! data itself.

mod flip;

pub use flip::{BucketBuffer, FillLevel};
pub(crate) use flip::FlippingContainer;

use std::sync::mpsc;

use parking_lot::{Condvar, Mutex};

use crate::entry::InMemoryEntry;

/// What a writer gets back from [`Broker::take_all`]
pub(crate) struct Drained {
    /// The displaced snapshot; may be empty on a forced or shutdown drain
    pub buffer: BucketBuffer,
    /// Acknowledgement channels for flush requests serviced by this drain
    pub flush_acks: Vec<mpsc::Sender<()>>,
    /// The broker has been shut down; this is the final drain
    pub shutdown: bool,
}

#[derive(Default)]
struct Signal {
    flush_acks: Vec<mpsc::Sender<()>>,
    shutdown: bool,
    /// The writer has exited; flush requests can never be serviced
    writer_gone: bool,
}

/// One bucket's accumulation point
pub(crate) struct Broker {
    container: FlippingContainer,
    signal: Mutex<Signal>,
    available: Condvar,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            container: FlippingContainer::new(),
            signal: Mutex::new(Signal::default()),
            available: Condvar::new(),
        }
    }

    /// Lock-free enqueue; wakes the writer
    ///
    /// Returns the fill level of the published snapshot.
    pub fn append(&self, entry: InMemoryEntry) -> FillLevel {
        let fill = self.container.append(entry);
        // Taking the signal lock before notifying closes the window where
        // the writer has checked the container but not yet parked.
        let _guard = self.signal.lock();
        self.available.notify_one();
        fill
    }

    /// Block until data, a flush request or shutdown, then flip
    pub fn take_all(&self) -> Drained {
        let mut signal = self.signal.lock();
        loop {
            if !signal.flush_acks.is_empty() || signal.shutdown || !self.container.is_empty() {
                let flush_acks = std::mem::take(&mut signal.flush_acks);
                let shutdown = signal.shutdown;
                drop(signal);
                return Drained {
                    buffer: self.container.flip(),
                    flush_acks,
                    shutdown,
                };
            }
            self.available.wait(&mut signal);
        }
    }

    /// Request an immediate (possibly empty) drain
    ///
    /// The writer sends on `ack` once the drained entries have reached the
    /// bucket files. If the writer has already exited, `ack` is dropped
    /// unsent so the requester observes the disconnect instead of hanging.
    pub fn flush(&self, ack: mpsc::Sender<()>) {
        let mut signal = self.signal.lock();
        if signal.writer_gone {
            return;
        }
        signal.flush_acks.push(ack);
        self.available.notify_one();
    }

    /// Wake the writer for its final drain
    pub fn shutdown(&self) {
        let mut signal = self.signal.lock();
        signal.shutdown = true;
        self.available.notify_one();
    }

    /// Called by the writer on its way out; unserviceable flush requests
    /// are dropped so their requesters unblock.
    pub fn writer_exited(&self) {
        let mut signal = self.signal.lock();
        signal.writer_gone = true;
        signal.flush_acks.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::entry::{InMemoryEntry, Operation};

    fn update(key: u64) -> InMemoryEntry {
        InMemoryEntry::new(Operation::Update, key, Some(vec![0xAB]), None)
    }

    #[test]
    fn test_take_all_returns_appended_entries() {
        let broker = Broker::new();
        broker.append(update(1));
        broker.append(update(2));
        let drained = broker.take_all();
        assert_eq!(drained.buffer.len(), 2);
        assert!(!drained.shutdown);
        assert!(drained.flush_acks.is_empty());
    }

    #[test]
    fn test_take_all_blocks_until_data() {
        let broker = Arc::new(Broker::new());
        let taker = {
            let broker = Arc::clone(&broker);
            thread::spawn(move || broker.take_all())
        };
        thread::sleep(Duration::from_millis(50));
        broker.append(update(7));
        let drained = taker.join().unwrap();
        assert_eq!(drained.buffer.len(), 1);
    }

    #[test]
    fn test_flush_wakes_with_empty_buffer() {
        let broker = Arc::new(Broker::new());
        let taker = {
            let broker = Arc::clone(&broker);
            thread::spawn(move || broker.take_all())
        };
        thread::sleep(Duration::from_millis(50));
        let (tx, _rx) = mpsc::channel();
        broker.flush(tx);
        let drained = taker.join().unwrap();
        assert!(drained.buffer.is_empty());
        assert_eq!(drained.flush_acks.len(), 1);
    }

    #[test]
    fn test_flush_after_writer_exit_disconnects() {
        let broker = Broker::new();
        broker.writer_exited();
        let (tx, rx) = mpsc::channel();
        broker.flush(tx);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_shutdown_drains_remaining() {
        let broker = Broker::new();
        broker.append(update(3));
        broker.shutdown();
        let drained = broker.take_all();
        assert!(drained.shutdown);
        assert_eq!(drained.buffer.len(), 1);
    }
}
