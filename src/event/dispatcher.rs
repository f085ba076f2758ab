//! Bounded event queue and dispatcher thread
//!
//! The queue carries two classes of items with different overflow rules:
//! state updates may be dropped (oldest droppable first) when the queue is
//! full, result records are never dropped and instead apply backpressure
//! to their producer (only the merger publishes results, so producers of
//! plain operations never block here).

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::codec::ByteCodec;
use crate::event::{
    Dispatcher, EventListener, MergerState, OperationResult, ResultKind, ResultRecord, StateEvent,
    WriterState,
};

/// Queue depth before the overflow policy kicks in
pub(crate) const EVENT_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug)]
pub(crate) enum QueueItem {
    State(StateEvent),
    Result(ResultRecord),
    Shutdown,
}

struct Inner {
    queue: VecDeque<QueueItem>,
}

/// Bounded dual-class MPSC queue feeding the dispatcher thread
pub(crate) struct EventQueue {
    inner: Mutex<Inner>,
    items: Condvar,
    space: Condvar,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
            }),
            items: Condvar::new(),
            space: Condvar::new(),
            capacity,
        }
    }

    /// Publish a state event; never blocks
    ///
    /// On overflow the oldest queued state event is evicted; if the queue
    /// is full of results, the incoming event is dropped instead.
    pub fn push_state(&self, event: StateEvent) {
        let mut inner = self.inner.lock();
        if inner.queue.len() >= self.capacity {
            match inner
                .queue
                .iter()
                .position(|item| matches!(item, QueueItem::State(_)))
            {
                Some(idx) => {
                    inner.queue.remove(idx);
                }
                None => return,
            }
        }
        inner.queue.push_back(QueueItem::State(event));
        self.items.notify_one();
    }

    /// Publish a result record; blocks while the queue is full
    pub fn push_result(&self, record: ResultRecord) {
        let mut inner = self.inner.lock();
        while inner.queue.len() >= self.capacity {
            self.space.wait(&mut inner);
        }
        inner.queue.push_back(QueueItem::Result(record));
        self.items.notify_one();
    }

    /// Enqueue the shutdown sentinel behind everything already queued
    pub fn push_shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.queue.push_back(QueueItem::Shutdown);
        self.items.notify_one();
    }

    fn pop(&self) -> QueueItem {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.queue.pop_front() {
                self.space.notify_one();
                return item;
            }
            self.items.wait(&mut inner);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Take everything currently queued without blocking
    #[cfg(test)]
    pub(crate) fn drain(&self) -> Vec<QueueItem> {
        let mut inner = self.inner.lock();
        let items = inner.queue.drain(..).collect();
        self.space.notify_one();
        items
    }
}

/// Dispatcher thread main loop
///
/// Decodes result records with the codecs, coalesces repeated identical
/// state updates from the same source, and hands everything to the
/// subscriber objects. Runs until the shutdown sentinel is reached.
pub(crate) fn run_dispatcher<V, A>(
    queue: Arc<EventQueue>,
    dispatcher: Box<dyn Dispatcher<V, A>>,
    listener: Box<dyn EventListener>,
    value_codec: Arc<dyn ByteCodec<Item = V>>,
    aux_codec: Arc<dyn ByteCodec<Item = A>>,
) {
    let mut last_writer_state: Vec<Option<WriterState>> = Vec::new();
    let mut last_merger_state: Option<MergerState> = None;

    loop {
        match queue.pop() {
            QueueItem::Shutdown => break,
            QueueItem::State(event) => {
                match &event {
                    StateEvent::WriterState { bucket, state } => {
                        if last_writer_state.len() <= *bucket {
                            last_writer_state.resize(*bucket + 1, None);
                        }
                        if last_writer_state[*bucket] == Some(*state) {
                            continue;
                        }
                        last_writer_state[*bucket] = Some(*state);
                    }
                    StateEvent::MergerState { state } => {
                        if last_merger_state == Some(*state) {
                            continue;
                        }
                        last_merger_state = Some(*state);
                    }
                    _ => {}
                }
                listener.on_state_update(event);
            }
            QueueItem::Result(record) => match decode(&record, &*value_codec, &*aux_codec) {
                Ok(result) => dispatcher.on_result(result),
                Err(reason) => {
                    warn!(bucket = record.bucket, key = record.key, %reason, "result skipped");
                    listener.on_state_update(StateEvent::RecordSkipped {
                        bucket: record.bucket,
                        reason,
                    });
                }
            },
        }
    }
}

fn decode<V, A>(
    record: &ResultRecord,
    value_codec: &dyn ByteCodec<Item = V>,
    aux_codec: &dyn ByteCodec<Item = A>,
) -> Result<OperationResult<V, A>, String> {
    let aux = match &record.aux {
        Some(bytes) => Some(
            aux_codec
                .from_bytes(bytes)
                .map_err(|e| format!("aux decode failed: {e}"))?,
        ),
        None => None,
    };
    let key = record.key;
    match record.kind {
        ResultKind::UniqueKeyCheck => Ok(OperationResult::UniqueKeyCheck { key, aux }),
        ResultKind::DuplicateKeyCheck => Ok(OperationResult::DuplicateKeyCheck { key, aux }),
        ResultKind::UniqueKeyUpdate | ResultKind::DuplicateKeyUpdate => {
            let bytes = record
                .value
                .as_ref()
                .ok_or_else(|| "update result without a value".to_string())?;
            let value = value_codec
                .from_bytes(bytes)
                .map_err(|e| format!("value decode failed: {e}"))?;
            if record.kind == ResultKind::UniqueKeyUpdate {
                Ok(OperationResult::UniqueKeyUpdate { key, value, aux })
            } else {
                Ok(OperationResult::DuplicateKeyUpdate { key, value, aux })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use parking_lot::Mutex;

    use super::*;
    use crate::codec::StringCodec;

    #[derive(Default)]
    struct Collector {
        results: Mutex<Vec<OperationResult<String, String>>>,
        states: Mutex<Vec<StateEvent>>,
    }

    impl Dispatcher<String, String> for Arc<Collector> {
        fn on_result(&self, result: OperationResult<String, String>) {
            self.results.lock().push(result);
        }
    }

    impl EventListener for Arc<Collector> {
        fn on_state_update(&self, event: StateEvent) {
            self.states.lock().push(event);
        }
    }

    fn run_until_shutdown(queue: Arc<EventQueue>) -> Arc<Collector> {
        let collector = Arc::new(Collector::default());
        let handle = {
            let queue = Arc::clone(&queue);
            let collector = Arc::clone(&collector);
            thread::spawn(move || {
                run_dispatcher(
                    queue,
                    Box::new(Arc::clone(&collector)),
                    Box::new(collector),
                    Arc::new(StringCodec),
                    Arc::new(StringCodec),
                )
            })
        };
        handle.join().unwrap();
        collector
    }

    #[test]
    fn test_results_decoded_and_delivered_in_order() {
        let queue = Arc::new(EventQueue::new(16));
        queue.push_result(ResultRecord {
            kind: ResultKind::UniqueKeyUpdate,
            bucket: 0,
            key: 7,
            value: Some(b"a".to_vec()),
            aux: None,
        });
        queue.push_result(ResultRecord {
            kind: ResultKind::DuplicateKeyCheck,
            bucket: 0,
            key: 7,
            value: None,
            aux: Some(b"tag".to_vec()),
        });
        queue.push_shutdown();
        let collector = run_until_shutdown(queue);
        let results = collector.results.lock();
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0],
            OperationResult::UniqueKeyUpdate {
                key: 7,
                value: "a".to_string(),
                aux: None
            }
        );
        assert_eq!(
            results[1],
            OperationResult::DuplicateKeyCheck {
                key: 7,
                aux: Some("tag".to_string())
            }
        );
    }

    #[test]
    fn test_consecutive_identical_states_coalesced() {
        let queue = Arc::new(EventQueue::new(16));
        for _ in 0..3 {
            queue.push_state(StateEvent::WriterState {
                bucket: 1,
                state: WriterState::WaitingOnMerge,
            });
        }
        queue.push_state(StateEvent::WriterState {
            bucket: 2,
            state: WriterState::WaitingOnMerge,
        });
        queue.push_shutdown();
        let collector = run_until_shutdown(queue);
        let states = collector.states.lock();
        assert_eq!(states.len(), 2);
    }

    #[test]
    fn test_overflow_drops_oldest_state_keeps_results() {
        let queue = EventQueue::new(2);
        queue.push_state(StateEvent::MergerState {
            state: MergerState::Merging,
        });
        queue.push_result(ResultRecord {
            kind: ResultKind::UniqueKeyCheck,
            bucket: 0,
            key: 1,
            value: None,
            aux: None,
        });
        // Full: this evicts the state event, not the result.
        queue.push_state(StateEvent::MergerState {
            state: MergerState::Finished,
        });
        assert_eq!(queue.len(), 2);
        let first = queue.pop();
        assert!(matches!(first, QueueItem::Result(_)));
    }

    #[test]
    fn test_decode_failure_skips_and_reports() {
        let queue = Arc::new(EventQueue::new(16));
        queue.push_result(ResultRecord {
            kind: ResultKind::UniqueKeyUpdate,
            bucket: 3,
            key: 9,
            value: Some(vec![0xFF, 0xFE]),
            aux: None,
        });
        queue.push_shutdown();
        let collector = run_until_shutdown(queue);
        assert!(collector.results.lock().is_empty());
        let states = collector.states.lock();
        assert!(matches!(
            states[0],
            StateEvent::RecordSkipped { bucket: 3, .. }
        ));
    }
}
