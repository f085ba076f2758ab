//! Singleton merger
//!
//! Reconciles every bucket's file contents with the backing sorted store
//! in one bounded pass and hands the classified results to the dispatcher.
//! Exactly one merge runs at a time: writers and `synchronize` translate
//! into a request plus a wait on the completion signal, and the dedicated
//! merger thread performs the work.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::bucket::{BucketContents, BucketFile};
use crate::entry::{Classification, Operation};
use crate::error::{DrumError, DrumResult};
use crate::event::{EventQueue, MergerState, ResultKind, ResultRecord, StateEvent, WriterState};
use crate::store::{MergeOutcome, MergeResolver, SortedStore};

/// Byte-level append merge hook derived from the user's append codec
pub(crate) type AppendMergeFn = Arc<dyn Fn(&[u8], &[u8]) -> DrumResult<Vec<u8>> + Send + Sync>;

#[derive(Default)]
struct Signal {
    request_seq: u64,
    completed_seq: u64,
    requested: bool,
    shutdown: bool,
}

struct Shared {
    signal: Mutex<Signal>,
    /// Wakes the merger thread
    request: Condvar,
    /// Wakes `do_merge` waiters
    complete: Condvar,
}

/// Cloneable handle for requesting merges
#[derive(Clone)]
pub(crate) struct MergeHandle {
    shared: Arc<Shared>,
    events: Arc<EventQueue>,
}

impl MergeHandle {
    pub fn new(events: Arc<EventQueue>) -> Self {
        Self {
            shared: Arc::new(Shared {
                signal: Mutex::new(Signal::default()),
                request: Condvar::new(),
                complete: Condvar::new(),
            }),
            events,
        }
    }

    /// Non-blocking merge request
    pub fn request_merge(&self) {
        let mut signal = self.shared.signal.lock();
        signal.request_seq += 1;
        signal.requested = true;
        self.shared.request.notify_one();
        drop(signal);
        self.events.push_state(StateEvent::MergerState {
            state: MergerState::MergeRequested,
        });
    }

    /// Request a merge and block until a pass that started after this
    /// request has completed
    ///
    /// A failed pass still completes the wait; pass failures surface as
    /// `FinishedWithError` events, never as errors on the calling thread.
    pub fn do_merge(&self) -> DrumResult<()> {
        let mut signal = self.shared.signal.lock();
        if signal.shutdown {
            return Err(DrumError::ShuttingDown);
        }
        signal.request_seq += 1;
        signal.requested = true;
        let ticket = signal.request_seq;
        self.shared.request.notify_one();
        self.events.push_state(StateEvent::MergerState {
            state: MergerState::MergeRequested,
        });
        while signal.completed_seq < ticket && !signal.shutdown {
            self.shared.complete.wait(&mut signal);
        }
        if signal.completed_seq >= ticket {
            Ok(())
        } else {
            Err(DrumError::ShuttingDown)
        }
    }

    /// Stop the merger thread and release all waiters
    pub fn shutdown(&self) {
        let mut signal = self.shared.signal.lock();
        signal.shutdown = true;
        self.shared.request.notify_one();
        self.shared.complete.notify_all();
    }
}

/// The merger worker; owns the backing store
pub(crate) struct Merger {
    name: String,
    store: Box<dyn SortedStore>,
    files: Vec<Arc<Mutex<BucketFile>>>,
    append_merge: Option<AppendMergeFn>,
    events: Arc<EventQueue>,
    handle: MergeHandle,
}

impl Merger {
    pub fn new(
        name: String,
        store: Box<dyn SortedStore>,
        files: Vec<Arc<Mutex<BucketFile>>>,
        append_merge: Option<AppendMergeFn>,
        events: Arc<EventQueue>,
        handle: MergeHandle,
    ) -> Self {
        Self {
            name,
            store,
            files,
            append_merge,
            events,
            handle,
        }
    }

    /// Merger thread main loop
    pub fn run(mut self) {
        loop {
            self.events.push_state(StateEvent::MergerState {
                state: MergerState::WaitingOnMergeRequest,
            });
            let serving = {
                let mut signal = self.handle.shared.signal.lock();
                while !signal.requested && !signal.shutdown {
                    self.handle.shared.request.wait(&mut signal);
                }
                if !signal.requested {
                    break;
                }
                signal.requested = false;
                signal.request_seq
            };

            self.events.push_state(StateEvent::MergerState {
                state: MergerState::Merging,
            });
            match self.merge_pass() {
                Ok(dispatched) => {
                    info!(drum = %self.name, dispatched, "merge pass complete");
                    self.events.push_state(StateEvent::MergerState {
                        state: MergerState::Finished,
                    });
                }
                Err(err) => {
                    error!(drum = %self.name, %err, "merge pass failed; will retry on next trigger");
                    self.events.push_state(StateEvent::MergerState {
                        state: MergerState::FinishedWithError,
                    });
                }
            }

            let mut signal = self.handle.shared.signal.lock();
            signal.completed_seq = serving;
            self.handle.shared.complete.notify_all();
        }
        debug!(drum = %self.name, "merger stopped");
    }

    fn merge_pass(&mut self) -> DrumResult<usize> {
        let mut dispatched = 0;

        for bucket in 0..self.files.len() {
            let results = {
                let file = Arc::clone(&self.files[bucket]);
                let mut file = file.lock();
                if file.kv_bytes_written() == 0 {
                    continue;
                }
                let contents = file.read_back()?;
                debug!(drum = %self.name, bucket, records = contents.records.len(), "merging bucket");
                let results = self.reconcile(bucket, contents)?;
                // Only a fully merged bucket is rewound; a failure above leaves
                // the pair in place for the retry.
                file.reset()?;
                self.events.push_state(StateEvent::WriterBytes {
                    bucket,
                    kv_bytes: 0,
                    aux_bytes: 0,
                });
                self.events.push_state(StateEvent::WriterState {
                    bucket,
                    state: WriterState::Empty,
                });
                results
            };
            // Dispatch obligations this bucket now owes are settled before
            // the next bucket is touched; a later bucket's failure aborts
            // only its own batch, never an already-merged one.
            for record in results {
                self.events.push_result(record);
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Sort one bucket's records, walk them against the store's ascending
    /// cursor, and produce the dispatch obligations in file order
    fn reconcile(&mut self, bucket: usize, contents: BucketContents) -> DrumResult<Vec<ResultRecord>> {
        let mut entries: Vec<PassEntry> = contents
            .records
            .iter()
            .enumerate()
            .map(|(position, rec)| PassEntry {
                op: rec.op,
                key: rec.key,
                position: position as u32,
                value_offset: rec.value_offset,
                value_len: rec.value_len,
                classification: Classification::Unknown,
                dispatch_value: None,
                skipped: None,
            })
            .collect();

        let mut sorted: Vec<usize> = (0..entries.len()).collect();
        sorted.sort_unstable_by_key(|&i| (entries[i].key, entries[i].position));

        let mut keys: Vec<u64> = Vec::new();
        for &i in &sorted {
            if keys.last() != Some(&entries[i].key) {
                keys.push(entries[i].key);
            }
        }

        let mut resolver = PassResolver {
            entries: &mut entries,
            kv_slab: &contents.kv_slab,
            sorted: &sorted,
            cursor: 0,
            append_merge: self.append_merge.clone(),
        };
        self.store
            .merge(&keys, &mut resolver)
            .map_err(|e| match e {
                DrumError::Io(err) => DrumError::Io(err),
                DrumError::Store(msg) => DrumError::Store(msg),
                other => DrumError::Store(other.to_string()),
            })?;

        let mut results = Vec::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            if let Some(reason) = &entry.skipped {
                warn!(drum = %self.name, bucket, key = entry.key, %reason, "record skipped");
                self.events.push_state(StateEvent::RecordSkipped {
                    bucket,
                    reason: reason.clone(),
                });
                continue;
            }
            let kind = match (entry.op, entry.classification) {
                (Operation::Check, Classification::Unique) => ResultKind::UniqueKeyCheck,
                (Operation::Check, Classification::Duplicate) => ResultKind::DuplicateKeyCheck,
                (_, Classification::Unique) => ResultKind::UniqueKeyUpdate,
                (_, Classification::Duplicate) => ResultKind::DuplicateKeyUpdate,
                (_, Classification::Unknown) => {
                    warn!(drum = %self.name, bucket, key = entry.key, "store merge never resolved key");
                    self.events.push_state(StateEvent::RecordSkipped {
                        bucket,
                        reason: "store merge never resolved key".to_string(),
                    });
                    continue;
                }
            };
            let aux_rec = contents.aux_records[idx];
            let aux = if aux_rec.len == 0 {
                None
            } else {
                Some(contents.aux_slab[aux_rec.offset..][..aux_rec.len].to_vec())
            };
            results.push(ResultRecord {
                kind,
                bucket,
                key: entry.key,
                value: entry.dispatch_value.clone(),
                aux,
            });
        }
        Ok(results)
    }
}

struct PassEntry {
    op: Operation,
    key: u64,
    position: u32,
    value_offset: usize,
    value_len: usize,
    classification: Classification,
    dispatch_value: Option<Vec<u8>>,
    skipped: Option<String>,
}

/// Folds each run of equal keys, in position order, against the stored
/// value the store's cursor presents
struct PassResolver<'a> {
    entries: &'a mut [PassEntry],
    kv_slab: &'a [u8],
    sorted: &'a [usize],
    cursor: usize,
    append_merge: Option<AppendMergeFn>,
}

impl MergeResolver for PassResolver<'_> {
    fn resolve(&mut self, key: u64, existing: Option<&[u8]>) -> MergeOutcome {
        let mut exists = existing.is_some();
        let mut current: Option<Vec<u8>> = existing.map(|v| v.to_vec());
        let mut wrote = false;

        while self.cursor < self.sorted.len() {
            let idx = self.sorted[self.cursor];
            if self.entries[idx].key != key {
                break;
            }
            self.cursor += 1;

            let (op, value_offset, value_len) = {
                let e = &self.entries[idx];
                (e.op, e.value_offset, e.value_len)
            };
            let classification = if exists {
                Classification::Duplicate
            } else {
                Classification::Unique
            };
            let mut dispatch_value = None;
            let mut skipped = None;

            match op {
                Operation::Check => {}
                Operation::Update | Operation::CheckUpdate => {
                    let value = self.kv_slab[value_offset..][..value_len].to_vec();
                    current = Some(value.clone());
                    dispatch_value = Some(value);
                    exists = true;
                    wrote = true;
                }
                Operation::AppendUpdate => {
                    let incoming = self.kv_slab[value_offset..][..value_len].to_vec();
                    match &current {
                        // No stored value yet: append degrades to update.
                        None => {
                            current = Some(incoming.clone());
                            dispatch_value = Some(incoming);
                            exists = true;
                            wrote = true;
                        }
                        Some(old) => match &self.append_merge {
                            Some(merge) => match merge(old, &incoming) {
                                Ok(merged) => {
                                    current = Some(merged.clone());
                                    dispatch_value = Some(merged);
                                    wrote = true;
                                }
                                Err(err) => {
                                    skipped = Some(format!("append merge failed: {err}"));
                                }
                            },
                            None => {
                                skipped =
                                    Some("append_update submitted without an append codec".into());
                            }
                        },
                    }
                }
            }

            let e = &mut self.entries[idx];
            e.classification = classification;
            e.dispatch_value = dispatch_value;
            e.skipped = skipped;
        }

        match (wrote, current) {
            (true, Some(value)) => MergeOutcome::Put(value),
            _ => MergeOutcome::Keep,
        }
    }
}
