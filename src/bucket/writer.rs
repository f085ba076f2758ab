//! Disk bucket writer worker
//!
//! One dedicated thread per bucket: drains its broker, serialises the
//! batch to the bucket's file pair under the disk-file lock, and invokes
//! the merger synchronously once the cumulative byte counters cross the
//! threshold. Forced (flush-requested) batches are acknowledged instead;
//! the synchronizing caller runs the merge once for all buckets.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::broker::Broker;
use crate::bucket::BucketFile;
use crate::entry::InMemoryEntry;
use crate::error::DrumResult;
use crate::event::{EventQueue, StateEvent, WriterState};
use crate::merge::MergeHandle;

pub(crate) struct WriterContext {
    pub name: String,
    pub bucket: usize,
    pub threshold: u64,
    pub broker: Arc<Broker>,
    pub file: Arc<Mutex<BucketFile>>,
    pub merge: MergeHandle,
    pub events: Arc<EventQueue>,
}

/// Writer thread entry point
pub(crate) fn run_writer(ctx: WriterContext) {
    let broker = Arc::clone(&ctx.broker);
    Writer {
        ctx,
        last_state: None,
    }
    .run();
    broker.writer_exited();
}

struct Writer {
    ctx: WriterContext,
    /// Suppresses repeated emissions of the same state
    last_state: Option<WriterState>,
}

impl Writer {
    fn run(mut self) {
        loop {
            self.set_state(WriterState::WaitingOnData);
            let drained = self.ctx.broker.take_all();
            let forced = !drained.flush_acks.is_empty();
            let mut merge_required = false;

            if !drained.buffer.is_empty() {
                self.set_state(WriterState::DataReceived);
                debug!(
                    drum = %self.ctx.name,
                    bucket = self.ctx.bucket,
                    entries = drained.buffer.len(),
                    "received batch"
                );
                match self.feed(&drained.buffer.entries, forced) {
                    Ok(required) => merge_required = required,
                    Err(err) => {
                        error!(
                            drum = %self.ctx.name,
                            bucket = self.ctx.bucket,
                            %err,
                            "bucket writer failed"
                        );
                        self.set_state(WriterState::FinishedWithError);
                        // Dropping unserviced flush acks makes synchronize
                        // report the dead writer instead of hanging.
                        return;
                    }
                }
            }

            for ack in drained.flush_acks {
                let _ = ack.send(());
            }

            if drained.shutdown {
                break;
            }

            if merge_required {
                self.set_state(WriterState::WaitingOnMerge);
                let _ = self.ctx.merge.do_merge();
            }
        }

        // The shutdown take_all already included the final drain; push any
        // leftover file bytes through one last merge.
        let leftovers = {
            let file = Arc::clone(&self.ctx.file);
            let file = file.lock();
            file.kv_bytes_written()
        };
        if leftovers > 0 {
            self.set_state(WriterState::WaitingOnMerge);
            let _ = self.ctx.merge.do_merge();
        }
        self.set_state(WriterState::Finished);
        trace!(drum = %self.ctx.name, bucket = self.ctx.bucket, "writer stopped");
    }

    /// Write one batch under the disk-file lock
    ///
    /// Returns whether a merge is now required. The lock is released on
    /// every exit path by the guard.
    fn feed(&mut self, entries: &[InMemoryEntry], forced: bool) -> DrumResult<bool> {
        self.set_state(WriterState::WaitingOnLock);
        let file = Arc::clone(&self.ctx.file);
        let mut file = file.lock();
        self.set_state(WriterState::Writing);

        file.append_batch(entries)?;
        self.ctx.events.push_state(StateEvent::WriterBytes {
            bucket: self.ctx.bucket,
            kv_bytes: file.kv_bytes_written(),
            aux_bytes: file.aux_bytes_written(),
        });

        Ok(!forced && file.exceeds(self.ctx.threshold))
    }

    fn set_state(&mut self, state: WriterState) {
        if self.last_state == Some(state) {
            return;
        }
        self.last_state = Some(state);
        self.ctx.events.push_state(StateEvent::WriterState {
            bucket: self.ctx.bucket,
            state,
        });
    }
}
