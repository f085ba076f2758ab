//! DRUM: Disk Repository with Update Management
//!
//! A batching key/value update engine for workloads that produce far more
//! updates than the backing store can absorb as random I/O (canonically
//! the URL-seen test of a large-scale crawler):
//! - operations accumulate lock-free in per-bucket in-memory buffers
//! - dedicated writer threads spill each bucket to append-only file pairs
//! - a singleton merger reconciles all buckets with the backing sorted
//!   store in one ascending pass once any bucket crosses its threshold
//! - classifications and merged values return to the caller out-of-band
//!   through a dispatcher thread
//!
//! The backing store, value/aux codecs and result sinks are plugins; see
//! [`engine::DrumParts`].

pub mod broker;
pub mod bucket;
pub mod codec;
pub mod engine;
pub mod entry;
pub mod error;
pub mod event;
pub mod store;

mod merge;

pub use crate::codec::{AppendCodec, ByteCodec, BytesCodec, StringCodec, U64SetCodec};
pub use crate::engine::{Drum, DrumConfig, DrumParts, StoreFactory};
pub use crate::entry::{Classification, Operation};
pub use crate::error::{DrumError, DrumResult};
pub use crate::event::{
    Dispatcher, EventListener, MergerState, NullDispatcher, NullListener, OperationResult,
    ResultKind, StateEvent, WriterState,
};
pub use crate::store::{FlatFileStore, MemoryStore, MergeOutcome, MergeResolver, SortedStore};
