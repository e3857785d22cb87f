//! Raid worker pool
//!
//! Erasure encode and decode are the only CPU-heavy jobs in the crate, and
//! they also touch fragment files, so they run on blocking threads instead
//! of the engine loop. The pool keeps a FIFO backlog, a bounded running
//! set, and a small lifecycle: it wakes on the first task, goes `Ready`
//! when drained, and releases its thread budget back to `Off` after
//! sitting idle.
//!
//! Results travel through one mpsc channel back to the engine loop, which
//! settles each task id with the pool before acting on the payload. A task
//! canceled while running is allowed to finish; settling it then reports
//! the result as discarded. Every submitted task produces exactly one
//! delivered or discarded result, including across shutdown.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ecc::{codec, EccMap};
use crate::error::{Error, Result};
use crate::fragment::{BackupId, BlockIndex, FragmentId, SupplierSlot};
use crate::matrix::BlockPresence;
use crate::storage::FragmentStore;

pub type TaskId = u64;

/// Pool tunables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Blocking threads used for raid tasks. `None` detects from the CPU
    /// count, keeping half the cores for everything else.
    pub parallelism: Option<usize>,
    /// How long the pool may sit in `Ready` before releasing its threads.
    pub idle_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            parallelism: None,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No thread budget allocated; the next task wakes the pool.
    Off,
    /// Budget allocated, nothing queued or running.
    Ready,
    /// At least one task queued or running.
    Work,
    /// Shut down, refuses all further tasks.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Make,
    Read,
    Rebuild,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Make => write!(f, "make"),
            TaskKind::Read => write!(f, "read"),
            TaskKind::Rebuild => write!(f, "rebuild"),
        }
    }
}

/// Inputs for one rebuild attempt: which fragments the suppliers are
/// missing and which ones we hold locally to rebuild from.
#[derive(Debug, Clone)]
pub struct RebuildSpec {
    pub backup: BackupId,
    pub block: BlockIndex,
    pub map: EccMap,
    /// Active-supplier bitmap; only these slots count as rebuild goals.
    pub active: Vec<bool>,
    pub presence: BlockPresence,
}

/// One unit of raid work.
#[derive(Debug, Clone)]
pub enum RaidTask {
    /// Frame one plaintext block and write all its fragments to disk.
    Make {
        backup: BackupId,
        block: BlockIndex,
        map: EccMap,
        payload: Bytes,
        last_block: bool,
    },
    /// Reassemble one block payload from the fragments on disk.
    Read {
        backup: BackupId,
        block: BlockIndex,
        map: EccMap,
    },
    /// Recover missing fragments for one block from those on hand.
    Rebuild(RebuildSpec),
}

impl RaidTask {
    pub fn kind(&self) -> TaskKind {
        match self {
            RaidTask::Make { .. } => TaskKind::Make,
            RaidTask::Read { .. } => TaskKind::Read,
            RaidTask::Rebuild(_) => TaskKind::Rebuild,
        }
    }

    pub fn backup(&self) -> &BackupId {
        match self {
            RaidTask::Make { backup, .. } => backup,
            RaidTask::Read { backup, .. } => backup,
            RaidTask::Rebuild(spec) => &spec.backup,
        }
    }

    pub fn block(&self) -> BlockIndex {
        match self {
            RaidTask::Make { block, .. } => *block,
            RaidTask::Read { block, .. } => *block,
            RaidTask::Rebuild(spec) => spec.block,
        }
    }
}

/// What a finished task produced.
#[derive(Debug)]
pub enum TaskOutput {
    /// Fragments written by a make task, with on-disk sizes.
    Made { fragments: Vec<(FragmentId, u64)> },
    /// Payload reassembled by a read task.
    BlockRead { payload: Bytes, last_block: bool },
    /// Slots recovered by a rebuild task. `new_data` is set when at least
    /// one recovered fragment is missing on an active supplier, which is
    /// what makes a follow-up send sweep worthwhile.
    Rebuilt {
        rebuilt_data: Vec<SupplierSlot>,
        rebuilt_parity: Vec<SupplierSlot>,
        fragments: Vec<(FragmentId, u64)>,
        new_data: bool,
    },
}

/// Exactly one of these reaches the engine per submitted task.
#[derive(Debug)]
pub struct TaskResult {
    pub id: TaskId,
    pub backup: BackupId,
    pub block: BlockIndex,
    pub kind: TaskKind,
    pub output: Result<TaskOutput>,
}

#[derive(Debug)]
struct RunningTask {
    backup: BackupId,
    block: BlockIndex,
    kind: TaskKind,
    canceled: bool,
}

/// FIFO pool of raid tasks over the tokio blocking thread pool.
pub struct RaidWorkerPool {
    config: WorkerConfig,
    store: FragmentStore,
    results: mpsc::UnboundedSender<TaskResult>,
    state: WorkerState,
    parallelism: usize,
    next_id: TaskId,
    backlog: VecDeque<(TaskId, RaidTask)>,
    running: HashMap<TaskId, RunningTask>,
    idle_since: Option<Instant>,
}

impl RaidWorkerPool {
    pub fn new(
        store: FragmentStore,
        config: WorkerConfig,
        results: mpsc::UnboundedSender<TaskResult>,
    ) -> Self {
        Self {
            config,
            store,
            results,
            state: WorkerState::Off,
            parallelism: 0,
            next_id: 0,
            backlog: VecDeque::new(),
            running: HashMap::new(),
            idle_since: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// Queue one task. Wakes the pool if it was off. Must run inside the
    /// engine's runtime because started tasks are spawned from here.
    pub fn submit(&mut self, task: RaidTask) -> Result<TaskId> {
        if self.state == WorkerState::Closed {
            return Err(Error::WorkerClosed);
        }
        if self.state == WorkerState::Off {
            self.parallelism = self
                .config
                .parallelism
                .unwrap_or_else(detect_parallelism);
            info!("raid worker pool waking with {} threads", self.parallelism);
        }
        let id = self.next_id;
        self.next_id += 1;
        debug!(
            "raid task {} queued: {} {} block {}",
            id,
            task.kind(),
            task.backup(),
            task.block()
        );
        self.backlog.push_back((id, task));
        self.state = WorkerState::Work;
        self.idle_since = None;
        self.start_tasks();
        Ok(id)
    }

    /// Book-keep one result received from the channel. Returns whether the
    /// result should be delivered; canceled and shut-down tasks report
    /// `false` so their late output is discarded.
    pub fn settle(&mut self, id: TaskId, now: Instant) -> bool {
        let Some(meta) = self.running.remove(&id) else {
            warn!("raid task {} settled twice, ignoring", id);
            return false;
        };
        self.start_tasks();
        if self.state == WorkerState::Work && self.running.is_empty() && self.backlog.is_empty() {
            debug!("raid worker pool drained");
            self.state = WorkerState::Ready;
            self.idle_since = Some(now);
        }
        if meta.canceled {
            debug!("raid task {} for {} finished after cancel, discarding", id, meta.backup);
        }
        !meta.canceled
    }

    /// Drop queued tasks for one backup and mark its running ones so their
    /// results are discarded. Returns one canceled result per dropped task.
    pub fn cancel_backup(&mut self, backup: &BackupId) -> Vec<TaskResult> {
        let mut canceled = Vec::new();
        let mut kept = VecDeque::with_capacity(self.backlog.len());
        for (id, task) in self.backlog.drain(..) {
            if task.backup() == backup {
                canceled.push(TaskResult {
                    id,
                    backup: task.backup().clone(),
                    block: task.block(),
                    kind: task.kind(),
                    output: Err(Error::TaskCanceled(backup.to_string())),
                });
            } else {
                kept.push_back((id, task));
            }
        }
        self.backlog = kept;
        let mut still_running = 0;
        for meta in self.running.values_mut() {
            if meta.backup == *backup {
                meta.canceled = true;
                still_running += 1;
            }
        }
        if !canceled.is_empty() || still_running > 0 {
            debug!(
                "canceled {} queued raid tasks for {}, {} running to be discarded",
                canceled.len(),
                backup,
                still_running
            );
        }
        canceled
    }

    /// Refuse all further work and fail out everything pending. Running
    /// tasks finish on their threads but settle as discarded.
    pub fn shutdown(&mut self) -> Vec<TaskResult> {
        if self.state == WorkerState::Closed {
            return Vec::new();
        }
        self.state = WorkerState::Closed;
        let mut failed = Vec::new();
        for (id, task) in self.backlog.drain(..) {
            failed.push(TaskResult {
                id,
                backup: task.backup().clone(),
                block: task.block(),
                kind: task.kind(),
                output: Err(Error::WorkerClosed),
            });
        }
        for (id, meta) in self.running.iter_mut() {
            meta.canceled = true;
            failed.push(TaskResult {
                id: *id,
                backup: meta.backup.clone(),
                block: meta.block,
                kind: meta.kind,
                output: Err(Error::WorkerClosed),
            });
        }
        info!("raid worker pool closed, {} tasks failed out", failed.len());
        failed
    }

    /// Release the thread budget after sitting idle long enough.
    pub fn maybe_park(&mut self, now: Instant) -> bool {
        if self.state != WorkerState::Ready {
            return false;
        }
        let idle = self
            .idle_since
            .map(|since| now.duration_since(since))
            .unwrap_or_default();
        if idle < self.config.idle_timeout {
            return false;
        }
        info!("raid worker pool idle for {:?}, releasing threads", idle);
        self.state = WorkerState::Off;
        self.parallelism = 0;
        self.idle_since = None;
        true
    }

    fn start_tasks(&mut self) {
        while self.running.len() < self.parallelism {
            let Some((id, task)) = self.backlog.pop_front() else {
                break;
            };
            debug!(
                "raid task {} starting, {} running of {} threads",
                id,
                self.running.len() + 1,
                self.parallelism
            );
            self.running.insert(
                id,
                RunningTask {
                    backup: task.backup().clone(),
                    block: task.block(),
                    kind: task.kind(),
                    canceled: false,
                },
            );
            let store = self.store.clone();
            let results = self.results.clone();
            tokio::spawn(async move {
                let backup = task.backup().clone();
                let block = task.block();
                let kind = task.kind();
                let output =
                    match tokio::task::spawn_blocking(move || run_task(&store, task)).await {
                        Ok(output) => output,
                        Err(e) => Err(Error::Internal(format!("raid task panicked: {}", e))),
                    };
                let _ = results.send(TaskResult {
                    id,
                    backup,
                    block,
                    kind,
                    output,
                });
            });
        }
    }
}

fn detect_parallelism() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    // keep half the cores for the rest of the node
    (cores / 2).max(1)
}

/// Blocking body of one task. Runs on the tokio blocking pool.
fn run_task(store: &FragmentStore, task: RaidTask) -> Result<TaskOutput> {
    match task {
        RaidTask::Make {
            backup,
            block,
            map,
            payload,
            last_block,
        } => run_make(store, &backup, block, &map, &payload, last_block),
        RaidTask::Read { backup, block, map } => run_read(store, &backup, block, &map),
        RaidTask::Rebuild(spec) => run_rebuild(store, spec),
    }
}

fn run_make(
    store: &FragmentStore,
    backup: &BackupId,
    block: BlockIndex,
    map: &EccMap,
    payload: &[u8],
    last_block: bool,
) -> Result<TaskOutput> {
    let encoded = codec::encode_block(map, payload, last_block)?;
    let mut fragments = Vec::with_capacity(map.suppliers() * 2);
    for (slot, segment) in encoded.data.iter().enumerate() {
        let id = FragmentId::data(block, slot);
        let size = store.write_fragment(backup, &id, segment)?;
        fragments.push((id, size));
    }
    for (slot, segment) in encoded.parity.iter().enumerate() {
        let id = FragmentId::parity(block, slot);
        let size = store.write_fragment(backup, &id, segment)?;
        fragments.push((id, size));
    }
    Ok(TaskOutput::Made { fragments })
}

fn run_read(
    store: &FragmentStore,
    backup: &BackupId,
    block: BlockIndex,
    map: &EccMap,
) -> Result<TaskOutput> {
    let mut data = Vec::with_capacity(map.suppliers());
    let mut parity = Vec::with_capacity(map.suppliers());
    for slot in 0..map.suppliers() {
        data.push(load_optional(store, backup, &FragmentId::data(block, slot))?);
        parity.push(load_optional(store, backup, &FragmentId::parity(block, slot))?);
    }
    let decoded = codec::decode_block(map, &mut data, &mut parity)?;
    Ok(TaskOutput::BlockRead {
        payload: decoded.payload,
        last_block: decoded.last_block,
    })
}

fn run_rebuild(store: &FragmentStore, spec: RebuildSpec) -> Result<TaskOutput> {
    let RebuildSpec {
        backup,
        block,
        map,
        active,
        presence,
    } = spec;

    let mut data = Vec::with_capacity(map.suppliers());
    let mut parity = Vec::with_capacity(map.suppliers());
    for slot in 0..map.suppliers() {
        let held = presence.local_data.get(slot).copied().unwrap_or(false);
        data.push(if held {
            load_optional(store, &backup, &FragmentId::data(block, slot))?
        } else {
            None
        });
        let held = presence.local_parity.get(slot).copied().unwrap_or(false);
        parity.push(if held {
            load_optional(store, &backup, &FragmentId::parity(block, slot))?
        } else {
            None
        });
    }

    let outcome = codec::rebuild_block(&map, &mut data, &mut parity)?;

    let mut fragments = Vec::new();
    let mut new_data = false;
    for &slot in &outcome.rebuilt_data {
        if let Some(segment) = data[slot].as_ref() {
            let id = FragmentId::data(block, slot);
            let size = store.write_fragment(&backup, &id, segment)?;
            fragments.push((id, size));
        }
        let wanted = active.get(slot).copied().unwrap_or(false)
            && !presence.remote_data.get(slot).copied().unwrap_or(false);
        new_data = new_data || wanted;
    }
    for &slot in &outcome.rebuilt_parity {
        if let Some(segment) = parity[slot].as_ref() {
            let id = FragmentId::parity(block, slot);
            let size = store.write_fragment(&backup, &id, segment)?;
            fragments.push((id, size));
        }
        let wanted = active.get(slot).copied().unwrap_or(false)
            && !presence.remote_parity.get(slot).copied().unwrap_or(false);
        new_data = new_data || wanted;
    }

    Ok(TaskOutput::Rebuilt {
        rebuilt_data: outcome.rebuilt_data,
        rebuilt_parity: outcome.rebuilt_parity,
        fragments,
        new_data,
    })
}

/// Read a fragment, treating a missing file as absence rather than failure.
fn load_optional(
    store: &FragmentStore,
    backup: &BackupId,
    id: &FragmentId,
) -> Result<Option<Bytes>> {
    match store.read_fragment(backup, id) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(Error::FragmentNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
