//!
//! Coalesces admitted updates per key and publishes them with a bounded
//! worker pool, never writing the same key twice at once.
//!

use std::{
    collections::{HashMap, HashSet},
    num::NonZeroUsize,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    key::RecordKey,
    publisher::{Publisher, PublisherSettings},
    store::RecordStore,
};

/// Default number of concurrent publishes.
pub const DEFAULT_CONCURRENCY: usize = 5;
/// Default wait before re-checking a key that was already being published.
pub const DEFAULT_COLLISION_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub(crate) concurrency: NonZeroUsize,
    pub(crate) collision_backoff: Duration,
    pub publisher: PublisherSettings,
}

impl CoordinatorSettings {
    pub fn new() -> Self {
        Self {
            concurrency: NonZeroUsize::new(DEFAULT_CONCURRENCY).unwrap_or(NonZeroUsize::MIN),
            collision_backoff: DEFAULT_COLLISION_BACKOFF,
            publisher: PublisherSettings::new(),
        }
    }

    /// Maximum number of publishes running at the same time.
    pub fn concurrency(&mut self, concurrency: NonZeroUsize) -> &mut Self {
        self.concurrency = concurrency;
        self
    }

    /// How long a job waits when its key is already being published.
    pub fn collision_backoff(&mut self, backoff: Duration) -> &mut Self {
        self.collision_backoff = backoff;
        self
    }

    pub fn publisher(&mut self, settings: PublisherSettings) -> &mut Self {
        self.publisher = settings;
        self
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// What [Coordinator::enqueue] did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new pending slot was created and a job submitted to the pool.
    Queued,
    /// The update replaced the payload of an already pending slot.
    Coalesced,
}

#[derive(Debug, Clone)]
struct PendingTask {
    value: String,
    record: Bytes,
}

#[derive(Debug)]
struct Slot {
    id: u64,
    task: PendingTask,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    /// At most one pending slot per key.
    pending: HashMap<RecordKey, Slot>,
    /// Keys with a publish in flight.
    running: HashSet<RecordKey>,
    next_slot_id: u64,
}

/// A pool submission. Every job owns exactly one pending slot.
#[derive(Debug)]
struct Job {
    key: RecordKey,
    slot_id: u64,
    requeues: u32,
}

/// Lifecycle of a job.
///
/// | from    | condition                     | to      |
/// |---------|-------------------------------|---------|
/// | Idle    | key is running                | Backoff |
/// | Idle    | own slot is pending           | Running |
/// | Idle    | own slot is gone              | Done    |
/// | Running | publish returned              | Done    |
/// | Backoff | own slot is still pending     | Idle    |
/// | Backoff | own slot is gone              | Done    |
///
/// A job in `Backoff` does not hold a pool slot. `Idle` means queued in the pool.
#[derive(Debug)]
enum WorkerState {
    Idle,
    Running(PendingTask),
    Backoff,
    Done,
}

struct Shared {
    state: Mutex<CoordinatorState>,
    publisher: Publisher,
    collision_backoff: Duration,
    jobs: flume::Sender<Job>,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn submit(&self, job: Job) {
        if let Err(e) = self.jobs.send(job) {
            tracing::warn!(
                "Worker pool is gone, dropping the job for {}.",
                e.into_inner().key.short()
            );
        }
    }

    /// Transition out of `Idle`. Claims the key and takes the payload when
    /// the job may run.
    fn dispatch(&self, job: &Job) -> WorkerState {
        let mut state = self.lock();
        if state.running.contains(&job.key) {
            return WorkerState::Backoff;
        }
        match state.pending.get(&job.key) {
            Some(slot) if slot.id == job.slot_id => {}
            _ => return WorkerState::Done,
        }
        let Some(slot) = state.pending.remove(&job.key) else {
            return WorkerState::Done;
        };
        state.running.insert(job.key.clone());
        WorkerState::Running(slot.task)
    }

    /// Transition out of `Backoff`.
    fn after_backoff(&self, job: &Job) -> WorkerState {
        let state = self.lock();
        match state.pending.get(&job.key) {
            Some(slot) if slot.id == job.slot_id => WorkerState::Idle,
            _ => WorkerState::Done,
        }
    }

    async fn run(self: &Arc<Self>, job: Job) {
        match self.dispatch(&job) {
            WorkerState::Running(task) => {
                let _running = RunningGuard {
                    shared: self,
                    key: &job.key,
                };
                match self
                    .publisher
                    .publish(&job.key, &task.value, task.record)
                    .await
                {
                    Ok(info) => tracing::debug!(
                        "Released {} after {} query events.",
                        job.key.short(),
                        info.event_count
                    ),
                    // Not retried, the next update of the key is the retry.
                    Err(e) => tracing::debug!(
                        "Released {} without publishing. timeout={} {e}",
                        job.key.short(),
                        e.is_timeout()
                    ),
                }
            }
            WorkerState::Backoff => self.backoff(job),
            WorkerState::Idle | WorkerState::Done => {
                tracing::debug!("Nothing to publish for {}.", job.key.short());
            }
        }
    }

    fn backoff(self: &Arc<Self>, job: Job) {
        tracing::debug!(
            "{} is already being published. Check again in {:?}.",
            job.key.short(),
            self.collision_backoff
        );
        let shared = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                _ = tokio::time::sleep(shared.collision_backoff) => {}
            }
            match shared.after_backoff(&job) {
                WorkerState::Idle => {
                    tracing::debug!(
                        "Requeue {} after a collision. requeues={}",
                        job.key.short(),
                        job.requeues + 1
                    );
                    shared.submit(Job {
                        requeues: job.requeues + 1,
                        ..job
                    });
                }
                _ => tracing::debug!("{} was taken over by another job.", job.key.short()),
            }
        });
    }
}

/// Releases the key once the publish returns or the task is aborted.
struct RunningGuard<'a> {
    shared: &'a Shared,
    key: &'a RecordKey,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock().running.remove(self.key);
    }
}

/// Worker tasks of a coordinator. Stopped when the last handle is dropped.
struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for worker in self.workers.iter() {
            worker.abort();
        }
    }
}

/// Publish queue.
///
/// Every key has at most one pending payload. Updates arriving while a payload
/// is pending replace it. Up to `concurrency` keys are published at once and a
/// key is never published by two workers at the same time.
///
/// Cloning is cheap, all clones share the same queue.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
    _pool: Arc<WorkerPool>,
}

impl Coordinator {
    /// Creates a coordinator with default settings. Must be called within a tokio runtime.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::new_with_settings(store, CoordinatorSettings::new())
    }

    pub fn new_with_settings(store: Arc<dyn RecordStore>, settings: CoordinatorSettings) -> Self {
        let (sender, receiver) = flume::unbounded::<Job>();
        let shutdown = CancellationToken::new();
        let shared = Arc::new(Shared {
            state: Mutex::new(CoordinatorState::default()),
            publisher: Publisher::new_with_settings(store, settings.publisher),
            collision_backoff: settings.collision_backoff,
            jobs: sender,
            shutdown: shutdown.clone(),
        });

        let workers = (0..settings.concurrency.get())
            .map(|_| {
                let shared = shared.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    while let Ok(job) = receiver.recv_async().await {
                        shared.run(job).await;
                    }
                })
            })
            .collect();
        tracing::debug!("Started {} publish workers.", settings.concurrency);

        Self {
            shared,
            _pool: Arc::new(WorkerPool { workers, shutdown }),
        }
    }

    /// Stages the update for publishing. Never waits on the network.
    pub fn enqueue(&self, key: RecordKey, value: String, record: Bytes) -> EnqueueOutcome {
        let task = PendingTask { value, record };
        let mut state = self.shared.lock();
        if let Some(slot) = state.pending.get_mut(&key) {
            slot.task = task;
            tracing::debug!("Coalesced pending update of {}.", key.short());
            return EnqueueOutcome::Coalesced;
        }

        let slot_id = state.next_slot_id;
        state.next_slot_id += 1;
        state.pending.insert(key.clone(), Slot { id: slot_id, task });
        drop(state);

        self.shared.submit(Job {
            key,
            slot_id,
            requeues: 0,
        });
        EnqueueOutcome::Queued
    }

    /// The store records are published to.
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        self.shared.publisher.store()
    }

    /// Number of keys with a payload waiting to be published.
    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Number of keys currently being published.
    pub fn running_len(&self) -> usize {
        self.shared.lock().running.len()
    }

    /// Whether nothing is pending or being published.
    pub fn is_idle(&self) -> bool {
        let state = self.shared.lock();
        state.pending.is_empty() && state.running.is_empty()
    }
}
