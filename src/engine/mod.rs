//! Engine facade
//!
//! Wires the router, brokers, writer threads, merger and dispatcher into
//! one [`Drum`] instance. Producers call the four operations from any
//! thread; results come back out-of-band through the dispatcher plugin.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::broker::Broker;
use crate::bucket::{run_writer, BucketFile, WriterContext};
use crate::codec::{AppendCodec, ByteCodec};
use crate::entry::{InMemoryEntry, Operation};
use crate::error::{DrumError, DrumResult};
use crate::event::{
    run_dispatcher, Dispatcher, EventListener, EventQueue, NullDispatcher, NullListener,
    StateEvent, EVENT_QUEUE_CAPACITY,
};
use crate::merge::{AppendMergeFn, MergeHandle, Merger};
use crate::store::{FlatFileStore, SortedStore};

/// Construction-time configuration
#[derive(Debug, Clone)]
pub struct DrumConfig {
    /// Instance name; becomes the cache subdirectory
    pub name: String,
    /// Partitioning fan-out; must be a power of two
    pub num_buckets: usize,
    /// Per-bucket file byte threshold triggering a merge; power of two
    pub buffer_size: u64,
    /// Base directory for `cache/<name>/`
    pub base_dir: PathBuf,
}

impl Default for DrumConfig {
    fn default() -> Self {
        Self {
            name: "drum".to_string(),
            num_buckets: 512,
            buffer_size: 64 * 1024,
            base_dir: PathBuf::from("."),
        }
    }
}

impl DrumConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn validate(&self) -> DrumResult<()> {
        if self.name.is_empty() {
            return Err(DrumError::Config("name must not be empty".to_string()));
        }
        if self.name.contains('/') || self.name.contains('\\') || self.name == ".." {
            return Err(DrumError::Config(format!(
                "name {:?} is not a valid directory name",
                self.name
            )));
        }
        if !self.num_buckets.is_power_of_two() {
            return Err(DrumError::Config(format!(
                "num_buckets must be a power of two, got {}",
                self.num_buckets
            )));
        }
        if !self.buffer_size.is_power_of_two() {
            return Err(DrumError::Config(format!(
                "buffer_size must be a power of two, got {}",
                self.buffer_size
            )));
        }
        Ok(())
    }
}

/// Factory producing the backing sorted store for a drum directory
pub type StoreFactory = Box<dyn FnOnce(&Path) -> DrumResult<Box<dyn SortedStore>>>;

/// The pluggable parts of an engine instance
pub struct DrumParts<V, A> {
    value_codec: Arc<dyn ByteCodec<Item = V>>,
    aux_codec: Arc<dyn ByteCodec<Item = A>>,
    append_merge: Option<AppendMergeFn>,
    store_factory: StoreFactory,
    dispatcher: Box<dyn Dispatcher<V, A>>,
    listener: Box<dyn EventListener>,
}

impl<V: 'static, A: 'static> DrumParts<V, A> {
    /// Plain codecs, default flat-file store, no-op subscribers
    pub fn new(
        value_codec: Arc<dyn ByteCodec<Item = V>>,
        aux_codec: Arc<dyn ByteCodec<Item = A>>,
    ) -> Self {
        Self {
            value_codec,
            aux_codec,
            append_merge: None,
            store_factory: Box::new(|dir: &Path| {
                Ok(Box::new(FlatFileStore::open(dir.join("cache.db"))?) as Box<dyn SortedStore>)
            }),
            dispatcher: Box::new(NullDispatcher),
            listener: Box::new(NullListener),
        }
    }

    /// Like [`DrumParts::new`], with the value codec also providing the
    /// merge hook `append_update` needs
    pub fn with_append_codec<C>(value_codec: Arc<C>, aux_codec: Arc<dyn ByteCodec<Item = A>>) -> Self
    where
        C: AppendCodec<Item = V> + 'static,
    {
        let merge_codec = Arc::clone(&value_codec);
        let mut parts = Self::new(value_codec, aux_codec);
        parts.append_merge = Some(Arc::new(move |old, new| {
            let existing = merge_codec.from_bytes(old)?;
            let incoming = merge_codec.from_bytes(new)?;
            merge_codec.to_bytes(&merge_codec.merge(existing, incoming)?)
        }));
        parts
    }

    pub fn with_store_factory(mut self, factory: StoreFactory) -> Self {
        self.store_factory = factory;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Box<dyn Dispatcher<V, A>>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_listener(mut self, listener: Box<dyn EventListener>) -> Self {
        self.listener = listener;
        self
    }
}

struct Workers {
    writers: Vec<JoinHandle<()>>,
    merger: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// A DRUM engine instance
///
/// Cheap operations enqueue into a per-bucket lock-free buffer and return;
/// classifications and merged values arrive later through the configured
/// dispatcher. Dropping an instance performs a best-effort [`Drum::dispose`].
pub struct Drum<V, A> {
    name: String,
    num_buckets: usize,
    value_codec: Arc<dyn ByteCodec<Item = V>>,
    aux_codec: Arc<dyn ByteCodec<Item = A>>,
    append_enabled: bool,
    brokers: Vec<Arc<Broker>>,
    events: Arc<EventQueue>,
    merge: MergeHandle,
    closed: AtomicBool,
    workers: Mutex<Option<Workers>>,
}

impl<V: 'static, A: 'static> Drum<V, A> {
    /// Create the cache directory, open the bucket files, start all
    /// worker threads
    pub fn open(config: DrumConfig, parts: DrumParts<V, A>) -> DrumResult<Self> {
        config.validate()?;
        let dir = config.base_dir.join("cache").join(&config.name);
        fs::create_dir_all(&dir)?;
        info!(
            drum = %config.name,
            buckets = config.num_buckets,
            buffer_size = config.buffer_size,
            dir = %dir.display(),
            "opening drum"
        );

        let events = Arc::new(EventQueue::new(EVENT_QUEUE_CAPACITY));
        let store = (parts.store_factory)(&dir)?;
        let merge = MergeHandle::new(Arc::clone(&events));

        let brokers: Vec<Arc<Broker>> = (0..config.num_buckets)
            .map(|_| Arc::new(Broker::new()))
            .collect();
        let files = (0..config.num_buckets)
            .map(|bucket| Ok(Arc::new(Mutex::new(BucketFile::create(&dir, bucket)?))))
            .collect::<DrumResult<Vec<_>>>()?;

        let merger = Merger::new(
            config.name.clone(),
            store,
            files.clone(),
            parts.append_merge.clone(),
            Arc::clone(&events),
            merge.clone(),
        );
        let merger_handle = thread::Builder::new()
            .name(format!("{}-merger", config.name))
            .spawn(move || merger.run())?;

        let mut writers = Vec::with_capacity(config.num_buckets);
        for (bucket, (broker, file)) in brokers.iter().zip(&files).enumerate() {
            let ctx = WriterContext {
                name: config.name.clone(),
                bucket,
                threshold: config.buffer_size,
                broker: Arc::clone(broker),
                file: Arc::clone(file),
                merge: merge.clone(),
                events: Arc::clone(&events),
            };
            writers.push(
                thread::Builder::new()
                    .name(format!("{}-writer-{bucket}", config.name))
                    .spawn(move || run_writer(ctx))?,
            );
        }

        let dispatcher_handle = {
            let queue = Arc::clone(&events);
            let value_codec = Arc::clone(&parts.value_codec);
            let aux_codec = Arc::clone(&parts.aux_codec);
            let dispatcher = parts.dispatcher;
            let listener = parts.listener;
            thread::Builder::new()
                .name(format!("{}-dispatcher", config.name))
                .spawn(move || run_dispatcher(queue, dispatcher, listener, value_codec, aux_codec))?
        };

        Ok(Self {
            name: config.name,
            num_buckets: config.num_buckets,
            value_codec: parts.value_codec,
            aux_codec: parts.aux_codec,
            append_enabled: parts.append_merge.is_some(),
            brokers,
            events,
            merge,
            closed: AtomicBool::new(false),
            workers: Mutex::new(Some(Workers {
                writers,
                merger: merger_handle,
                dispatcher: dispatcher_handle,
            })),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Classify `key` as unique or duplicate against the store
    pub fn check(&self, key: u64, aux: Option<&A>) -> DrumResult<()> {
        self.enqueue(Operation::Check, key, None, aux)
    }

    /// Overwrite the stored value for `key`
    pub fn update(&self, key: u64, value: &V, aux: Option<&A>) -> DrumResult<()> {
        self.enqueue(Operation::Update, key, Some(value), aux)
    }

    /// Classify and overwrite in one operation, one callback
    pub fn check_update(&self, key: u64, value: &V, aux: Option<&A>) -> DrumResult<()> {
        self.enqueue(Operation::CheckUpdate, key, Some(value), aux)
    }

    /// Merge `value` into the stored one via the append codec
    pub fn append_update(&self, key: u64, value: &V, aux: Option<&A>) -> DrumResult<()> {
        if !self.append_enabled {
            return Err(DrumError::Codec(
                "append_update requires constructing the engine with an append codec".to_string(),
            ));
        }
        self.enqueue(Operation::AppendUpdate, key, Some(value), aux)
    }

    /// Force a drain and merge of all buckets; returns when the merge
    /// pass has completed
    pub fn synchronize(&self) -> DrumResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DrumError::ShuttingDown);
        }
        debug!(drum = %self.name, "synchronize requested");
        let mut acks = Vec::with_capacity(self.brokers.len());
        for (bucket, broker) in self.brokers.iter().enumerate() {
            let (tx, rx) = mpsc::channel();
            broker.flush(tx);
            acks.push((bucket, rx));
        }
        for (bucket, rx) in acks {
            rx.recv()
                .map_err(|_| DrumError::WriterTerminated { bucket })?;
        }
        self.merge.do_merge()
    }

    /// Ordered shutdown; idempotent
    ///
    /// Every operation accepted before this call is either dispatched or
    /// discarded with a failure event; operations submitted afterwards are
    /// refused with [`DrumError::ShuttingDown`].
    pub fn dispose(&self) -> DrumResult<()> {
        self.shutdown_inner()
    }

    fn enqueue(
        &self,
        op: Operation,
        key: u64,
        value: Option<&V>,
        aux: Option<&A>,
    ) -> DrumResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DrumError::ShuttingDown);
        }
        let value = value.map(|v| self.value_codec.to_bytes(v)).transpose()?;
        let aux = aux.map(|a| self.aux_codec.to_bytes(a)).transpose()?;
        let bucket = self.bucket_of(key);
        let fill = self.brokers[bucket].append(InMemoryEntry::new(op, key, value, aux));
        self.events.push_state(StateEvent::BufferFill {
            bucket,
            key_bytes: fill.key_bytes,
            val_bytes: fill.val_bytes,
            aux_bytes: fill.aux_bytes,
        });
        Ok(())
    }

    /// Buckets partition the key space by the top bits, so bucket 0..N in
    /// order cover ascending, contiguous key ranges.
    fn bucket_of(&self, key: u64) -> usize {
        if self.num_buckets == 1 {
            0
        } else {
            let bits = self.num_buckets.trailing_zeros();
            (key >> (64 - bits)) as usize
        }
    }

}

impl<V, A> Drum<V, A> {
    fn shutdown_inner(&self) -> DrumResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(drum = %self.name, "disposing");
        for broker in &self.brokers {
            broker.shutdown();
        }
        let workers = self.workers.lock().take();
        if let Some(workers) = workers {
            for handle in workers.writers {
                let _ = handle.join();
            }
            self.merge.shutdown();
            let _ = workers.merger.join();
            self.events.push_shutdown();
            let _ = workers.dispatcher.join();
        }
        info!(drum = %self.name, "disposed");
        Ok(())
    }
}

impl<V, A> Drop for Drum<V, A> {
    fn drop(&mut self) {
        let _ = self.shutdown_inner();
    }
}
