//! Engine: top-level owner and event loop
//!
//! Every piece of mutable availability state lives here: the matrices,
//! the transfer queues, the rebuild orchestrator, restore sessions and
//! the raid worker pool. One tokio task runs [`Engine::run`] and all of
//! that state is touched only from inside it, so none of it needs locks.
//! The supplier directory is the single exception, shared behind its own
//! lock because the embedding application flips online status from
//! outside.
//!
//! Everything else reaches the engine through [`EngineHandle`], a cloneable
//! command channel. Network dispatches leave the loop as spawned transport
//! futures and come back as settled outcomes on an internal channel; raid
//! results come back on the worker pool's channel. The loop wakes on the
//! earliest of: a command, a settled outcome, a raid result, or the next
//! queue/heartbeat deadline.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::FragmendConfig;
use crate::ecc::EccMap;
use crate::error::{Error, Result};
use crate::fragment::{BackupId, BlockIndex, FragmentAddress, FragmentId};
use crate::matrix::listing::ListingArchive;
use crate::matrix::{AvailabilityMatrix, IngestReport, LocalStats, RemoteStats};
use crate::rebuild::{RebuildDeps, RebuildOrchestrator, RebuildOutput, RebuildState};
use crate::restore::{RestoreDeps, RestoreOutcome, RestoreSession};
use crate::storage::FragmentStore;
use crate::suppliers::SupplierDirectory;
use crate::transfer::{
    Dispatch, FailReason, FetchOutcome, TransferEvent, TransferOutcome, TransferQueues, Transport,
};
use crate::worker::{RaidTask, RaidWorkerPool, TaskId, TaskKind, TaskOutput, TaskResult};

/// One queued restore with the channel that reports how it ended.
struct RestoreEntry {
    session: RestoreSession,
    done: Option<oneshot::Sender<RestoreOutcome>>,
}

/// A transport future settled; identity plus the three-way outcome.
enum NetEvent {
    SendSettled {
        slot: usize,
        address: FragmentAddress,
        outcome: TransferOutcome,
    },
    FetchSettled {
        slot: usize,
        address: FragmentAddress,
        outcome: FetchOutcome,
    },
    /// The fragment file could not be read when the send was picked up;
    /// the entry goes back to the queue and the next tick settles it.
    SendUndeliverable {
        slot: usize,
        address: FragmentAddress,
    },
}

enum Command {
    IngestListing {
        slot: usize,
        raw: String,
        is_index_in_sync: bool,
        reply: oneshot::Sender<IngestReport>,
    },
    StoreBlock {
        backup: BackupId,
        block: BlockIndex,
        payload: Bytes,
        last_block: bool,
        reply: oneshot::Sender<Result<Vec<(FragmentId, u64)>>>,
    },
    StartRestore {
        backup: BackupId,
        sink: Box<dyn Write + Send>,
        keep_local_copies: bool,
        requester: String,
        done: oneshot::Sender<RestoreOutcome>,
    },
    AbortRestore {
        backup: BackupId,
        reply: oneshot::Sender<()>,
    },
    ScheduleRebuild {
        backups: Vec<BackupId>,
        reply: oneshot::Sender<usize>,
    },
    StopRebuild,
    SendSweep,
    Compact {
        backup: BackupId,
        reply: oneshot::Sender<usize>,
    },
    EraseBackup {
        backup: BackupId,
        reply: oneshot::Sender<()>,
    },
    RescanLocal {
        reply: oneshot::Sender<usize>,
    },
    BackupStats {
        backup: BackupId,
        reply: oneshot::Sender<(Option<RemoteStats>, LocalStats)>,
    },
    KnownBackups {
        reply: oneshot::Sender<Vec<BackupId>>,
    },
    TakeDirty {
        reply: oneshot::Sender<HashSet<BackupId>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// What woke the event loop.
enum Wake {
    Task(TaskResult),
    Net(NetEvent),
    Cmd(Command),
    Tick,
    Closed,
}

/// Cloneable front door to a running engine.
///
/// Every method turns into one command on the loop; `Err(EngineStopped)`
/// means the engine task is gone.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    /// Feed one supplier's raw listing into the matrix.
    pub async fn ingest_listing(
        &self,
        slot: usize,
        raw: String,
        is_index_in_sync: bool,
    ) -> Result<IngestReport> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::IngestListing {
            slot,
            raw,
            is_index_in_sync,
            reply,
        })?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    /// Encode one plaintext block into fragments on disk and queue them
    /// for upload. Resolves once the raid task settles.
    pub async fn store_block(
        &self,
        backup: BackupId,
        block: BlockIndex,
        payload: Bytes,
        last_block: bool,
    ) -> Result<Vec<(FragmentId, u64)>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StoreBlock {
            backup,
            block,
            payload,
            last_block,
            reply,
        })?;
        rx.await.map_err(|_| Error::EngineStopped)?
    }

    /// Restore one backup version into `sink`, resolving when the session
    /// ends. Abort from another handle clone via [`Self::abort_restore`].
    pub async fn restore(
        &self,
        backup: BackupId,
        sink: Box<dyn Write + Send>,
        keep_local_copies: bool,
        requester: impl Into<String>,
    ) -> Result<RestoreOutcome> {
        let (done, rx) = oneshot::channel();
        self.send(Command::StartRestore {
            backup,
            sink,
            keep_local_copies,
            requester: requester.into(),
            done,
        })?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    pub async fn abort_restore(&self, backup: BackupId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AbortRestore { backup, reply })?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    /// Queue backups for background repair and start a cycle. Returns how
    /// many were newly queued.
    pub async fn schedule_rebuild(&self, backups: Vec<BackupId>) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ScheduleRebuild { backups, reply })?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    pub fn stop_rebuild(&self) -> Result<()> {
        self.send(Command::StopRebuild)
    }

    /// Push local fragments that suppliers are missing.
    pub fn send_sweep(&self) -> Result<()> {
        self.send(Command::SendSweep)
    }

    /// Delete local fragments every supplier confirmed holding. Returns
    /// how many files were removed.
    pub async fn compact(&self, backup: BackupId) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Compact { backup, reply })?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    /// Drop every trace of a backup: matrices, queued transfers, raid
    /// tasks, restore sessions and local fragment files.
    pub async fn erase_backup(&self, backup: BackupId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::EraseBackup { backup, reply })?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    /// Re-walk the fragment store and refresh the local matrix. Returns
    /// how many fragment files were found.
    pub async fn rescan_local(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RescanLocal { reply })?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    pub async fn backup_stats(
        &self,
        backup: BackupId,
    ) -> Result<(Option<RemoteStats>, LocalStats)> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::BackupStats { backup, reply })?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    pub async fn known_backups(&self) -> Result<Vec<BackupId>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::KnownBackups { reply })?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    /// Backups whose availability picture changed since the last call.
    pub async fn take_dirty(&self) -> Result<HashSet<BackupId>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::TakeDirty { reply })?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    /// Wind the engine down: fail out queued transfers and raid tasks,
    /// abort restores, then stop the loop.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply })?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::EngineStopped)
    }
}

/// Owner of all availability state for one customer.
pub struct Engine {
    customer: String,
    map: EccMap,
    keep_local_copies: bool,
    tick_interval: Duration,

    matrix: AvailabilityMatrix,
    suppliers: Arc<SupplierDirectory>,
    queues: TransferQueues,
    pool: RaidWorkerPool,
    rebuilder: RebuildOrchestrator,
    restores: Vec<RestoreEntry>,
    store: FragmentStore,
    archive: ListingArchive,
    catalog: Box<dyn Catalog>,
    transport: Arc<dyn Transport>,

    commands: mpsc::UnboundedReceiver<Command>,
    net_tx: mpsc::UnboundedSender<NetEvent>,
    net_rx: mpsc::UnboundedReceiver<NetEvent>,
    results: mpsc::UnboundedReceiver<TaskResult>,
    /// Completions for `store_block`, keyed by raid task id.
    make_waiters: HashMap<TaskId, oneshot::Sender<Result<Vec<(FragmentId, u64)>>>>,
}

impl Engine {
    /// Build an engine and its handle from a validated config. The
    /// supplier directory must be as wide as the configured map.
    pub fn new(
        config: &FragmendConfig,
        suppliers: Arc<SupplierDirectory>,
        catalog: Box<dyn Catalog>,
        transport: Arc<dyn Transport>,
    ) -> Result<(Engine, EngineHandle)> {
        let map = EccMap::new(config.customer.suppliers)?;
        if suppliers.count() != map.suppliers() {
            return Err(Error::InvalidConfig(format!(
                "supplier directory has {} slots, map needs {}",
                suppliers.count(),
                map.suppliers()
            )));
        }
        let store = FragmentStore::new(config.fragments_dir());
        let archive = ListingArchive::new(config.listings_dir());
        let queues = TransferQueues::new(map.suppliers(), store.clone(), config.transfer_config());
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let pool = RaidWorkerPool::new(store.clone(), config.worker_config(), results_tx);
        let rebuilder = RebuildOrchestrator::new(map.clone());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let engine = Engine {
            customer: config.customer.id.clone(),
            map,
            keep_local_copies: config.restore.keep_local_copies,
            tick_interval: config.tick_interval(),
            matrix: AvailabilityMatrix::new(config.customer.suppliers),
            suppliers,
            queues,
            pool,
            rebuilder,
            restores: Vec::new(),
            store,
            archive,
            catalog,
            transport,
            commands: commands_rx,
            net_tx,
            net_rx,
            results: results_rx,
            make_waiters: HashMap::new(),
        };
        let handle = EngineHandle {
            commands: commands_tx,
        };
        Ok((engine, handle))
    }

    /// Run the event loop until shutdown or until every handle is gone.
    pub async fn run(mut self) {
        self.startup();
        loop {
            let now = Instant::now();
            let deadline = self.next_deadline(now);
            let wake = tokio::select! {
                biased;
                result = self.results.recv() => result.map(Wake::Task).unwrap_or(Wake::Closed),
                event = self.net_rx.recv() => event.map(Wake::Net).unwrap_or(Wake::Closed),
                command = self.commands.recv() => command.map(Wake::Cmd).unwrap_or(Wake::Closed),
                _ = tokio::time::sleep_until(deadline.into()) => Wake::Tick,
            };
            match wake {
                Wake::Task(result) => self.on_task_result(result),
                Wake::Net(event) => self.on_net_event(event),
                Wake::Cmd(command) => {
                    if self.handle_command(command) {
                        break;
                    }
                }
                Wake::Tick => self.on_tick(Instant::now()),
                Wake::Closed => {
                    info!("all engine handles dropped, stopping");
                    self.wind_down();
                    break;
                }
            }
        }
        info!("engine loop finished");
    }

    /// Rehydrate state from disk: local fragments, then the archived
    /// supplier listings. Archived listings are stale by definition, so
    /// they ingest with the index treated as out of sync and never trigger
    /// cleanup decisions.
    fn startup(&mut self) {
        match self.store.scan_customer(&self.customer) {
            Ok(found) => {
                let count = found.len();
                for fragment in found {
                    self.matrix
                        .record_local_fragment(&fragment.backup, &fragment.id, true, fragment.size);
                }
                info!("local scan found {} fragments", count);
            }
            Err(err) => warn!("local fragment scan failed: {}", err),
        }
        let listings = self.archive.load_all(&self.customer);
        for (slot, raw) in listings {
            self.matrix.ingest_supplier_report(
                slot,
                &raw,
                &self.customer,
                false,
                self.catalog.as_mut(),
            );
        }
        info!(
            "engine up for {}, {} suppliers, map {}",
            self.customer,
            self.map.suppliers(),
            self.map
        );
    }

    fn next_deadline(&self, now: Instant) -> Instant {
        let tick = now + self.tick_interval;
        match self.queues.next_due(now) {
            Some(due) => tick.min(due),
            None => tick,
        }
    }

    /// Heartbeat: run due queue sides, nudge the state machines, park the
    /// pool when it has been idle long enough.
    fn on_tick(&mut self, now: Instant) {
        let output = self.queues.tick(now);
        for event in output.events {
            self.on_transfer_event(event);
        }
        for dispatch in output.dispatches {
            self.dispatch(dispatch);
        }
        let rebuild_output = {
            let (rebuilder, mut deps) = self.rebuild_parts();
            rebuilder.on_timer(&mut deps)
        };
        self.apply_rebuild_output(rebuild_output);
        if self.rebuilder.state() == RebuildState::Done {
            for backup in self.rebuilder.take_rebuilt() {
                debug!("{} repaired this cycle", backup);
            }
        }
        self.restore_timers();
        self.pool.maybe_park(now);
    }

    /// Returns true when the loop should stop.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::IngestListing {
                slot,
                raw,
                is_index_in_sync,
                reply,
            } => {
                let report = self.matrix.ingest_supplier_report(
                    slot,
                    &raw,
                    &self.customer,
                    is_index_in_sync,
                    self.catalog.as_mut(),
                );
                if report.changed {
                    if let Err(err) = self.archive.store(&self.customer, slot, &raw) {
                        warn!("cannot archive listing for slot {}: {}", slot, err);
                    }
                }
                let _ = reply.send(report);
            }
            Command::StoreBlock {
                backup,
                block,
                payload,
                last_block,
                reply,
            } => {
                let task = RaidTask::Make {
                    backup,
                    block,
                    map: self.map.clone(),
                    payload,
                    last_block,
                };
                match self.pool.submit(task) {
                    Ok(id) => {
                        self.make_waiters.insert(id, reply);
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::StartRestore {
                backup,
                sink,
                keep_local_copies,
                requester,
                done,
            } => self.start_restore(backup, sink, keep_local_copies, requester, done),
            Command::AbortRestore { backup, reply } => {
                let rebuilding = self.rebuilding_backup();
                let (sessions, mut deps) = self.restore_parts();
                for entry in sessions.iter_mut() {
                    if entry.session.backup() != &backup {
                        continue;
                    }
                    deps.rebuilding_now = rebuilding.as_ref() == Some(&backup);
                    let output = entry.session.abort(&mut deps);
                    Self::resolve_restore(entry, output.finished);
                }
                self.reap_restores();
                let _ = reply.send(());
            }
            Command::ScheduleRebuild { backups, reply } => {
                let added = self.rebuilder.add_backups(backups);
                let output = {
                    let (rebuilder, mut deps) = self.rebuild_parts();
                    rebuilder.start(&mut deps)
                };
                self.apply_rebuild_output(output);
                let _ = reply.send(added);
            }
            Command::StopRebuild => self.rebuilder.request_stop(),
            Command::SendSweep => self.send_sweep(),
            Command::Compact { backup, reply } => {
                let _ = reply.send(self.compact(&backup));
            }
            Command::EraseBackup { backup, reply } => {
                self.erase_backup(&backup);
                let _ = reply.send(());
            }
            Command::RescanLocal { reply } => {
                let mut count = 0;
                match self.store.scan_customer(&self.customer) {
                    Ok(found) => {
                        count = found.len();
                        for fragment in found {
                            self.matrix.record_local_fragment(
                                &fragment.backup,
                                &fragment.id,
                                true,
                                fragment.size,
                            );
                        }
                    }
                    Err(err) => warn!("local rescan failed: {}", err),
                }
                let _ = reply.send(count);
            }
            Command::BackupStats { backup, reply } => {
                let remote = self.matrix.remote_stats(&backup, self.suppliers.as_ref());
                let local = self.matrix.local_stats(&backup);
                let _ = reply.send((remote, local));
            }
            Command::KnownBackups { reply } => {
                let _ = reply.send(self.matrix.known_backups());
            }
            Command::TakeDirty { reply } => {
                let _ = reply.send(self.matrix.take_dirty());
            }
            Command::Shutdown { reply } => {
                self.wind_down();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    /// Fail everything out so every caller still waiting gets its one
    /// terminal answer.
    fn wind_down(&mut self) {
        info!("engine shutting down");
        self.rebuilder.request_stop();
        let events = self.queues.shutdown();
        for event in events {
            self.on_transfer_event(event);
        }
        {
            let (sessions, mut deps) = self.restore_parts();
            for entry in sessions.iter_mut() {
                let output = entry.session.abort(&mut deps);
                Self::resolve_restore(entry, output.finished);
            }
        }
        self.restores.clear();
        for result in self.pool.shutdown() {
            if let Some(waiter) = self.make_waiters.remove(&result.id) {
                let _ = waiter.send(Err(Error::WorkerClosed));
            }
        }
        for (_, waiter) in self.make_waiters.drain() {
            let _ = waiter.send(Err(Error::WorkerClosed));
        }
    }

    fn start_restore(
        &mut self,
        backup: BackupId,
        sink: Box<dyn Write + Send>,
        keep_local_copies: bool,
        requester: String,
        done: oneshot::Sender<RestoreOutcome>,
    ) {
        if self
            .restores
            .iter()
            .any(|entry| entry.session.backup() == &backup)
        {
            warn!("restore of {} already running", backup);
            let _ = done.send(RestoreOutcome::Failed {
                reason: "restore already running".to_string(),
            });
            return;
        }
        let keep = keep_local_copies || self.keep_local_copies;
        let session = RestoreSession::new(backup, self.map.clone(), sink, keep, requester);
        let mut entry = RestoreEntry {
            session,
            done: Some(done),
        };
        let rebuilding = self.rebuilding_backup();
        {
            let mut deps = RestoreDeps {
                matrix: &mut self.matrix,
                suppliers: self.suppliers.as_ref(),
                queues: &mut self.queues,
                pool: &mut self.pool,
                store: &self.store,
                rebuilding_now: rebuilding.as_ref() == Some(entry.session.backup()),
            };
            let output = entry.session.start(&mut deps);
            Self::resolve_restore(&mut entry, output.finished);
        }
        if !entry.session.state().is_terminal() {
            self.restores.push(entry);
        }
    }

    /// Route one settled raid task to whoever was waiting on it.
    fn on_task_result(&mut self, result: TaskResult) {
        let delivered = self.pool.settle(result.id, Instant::now());
        if !delivered {
            if let Some(waiter) = self.make_waiters.remove(&result.id) {
                let _ = waiter.send(Err(Error::TaskCanceled(result.backup.to_string())));
            }
            return;
        }
        match result.kind {
            TaskKind::Make => self.on_make_result(result),
            TaskKind::Read => self.on_read_result(result),
            TaskKind::Rebuild => self.on_rebuild_result(result),
        }
    }

    fn on_make_result(&mut self, result: TaskResult) {
        let waiter = self.make_waiters.remove(&result.id);
        match result.output {
            Ok(TaskOutput::Made { fragments }) => {
                for (id, size) in &fragments {
                    self.matrix
                        .record_local_fragment(&result.backup, id, true, *size);
                }
                self.send_sweep();
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(fragments));
                }
            }
            Ok(other) => {
                warn!("make task {} returned {:?}", result.id, other);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(Error::Internal("mismatched task output".to_string())));
                }
            }
            Err(err) => {
                warn!("make task {} for {} failed: {}", result.id, result.backup, err);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(err));
                }
            }
        }
    }

    fn on_read_result(&mut self, result: TaskResult) {
        let decoded = match result.output {
            Ok(TaskOutput::BlockRead { payload, last_block }) => Ok((payload, last_block)),
            Ok(other) => {
                warn!("read task {} returned {:?}", result.id, other);
                Err(Error::Internal("mismatched task output".to_string()))
            }
            Err(err) => Err(err),
        };
        let Some(index) = self
            .restores
            .iter()
            .position(|entry| entry.session.pending_task() == Some(result.id))
        else {
            debug!("read task {} has no waiting restore, discarding", result.id);
            return;
        };
        let rebuilding = self.rebuilding_backup();
        {
            let (sessions, mut deps) = self.restore_parts();
            let entry = &mut sessions[index];
            deps.rebuilding_now = rebuilding.as_ref() == Some(entry.session.backup());
            let output = entry.session.on_raid_result(&mut deps, result.id, decoded);
            Self::resolve_restore(entry, output.finished);
        }
        self.reap_restores();
    }

    fn on_rebuild_result(&mut self, result: TaskResult) {
        let (ok, progressed) = match &result.output {
            Ok(TaskOutput::Rebuilt { fragments, .. }) => {
                for (id, size) in fragments {
                    self.matrix
                        .record_local_fragment(&result.backup, id, true, *size);
                }
                (true, !fragments.is_empty())
            }
            Ok(other) => {
                warn!("rebuild task {} returned {:?}", result.id, other);
                (false, false)
            }
            Err(err) => {
                warn!(
                    "rebuild task {} for {} block {} failed: {}",
                    result.id, result.backup, result.block, err
                );
                (false, false)
            }
        };
        let output = {
            let (rebuilder, mut deps) = self.rebuild_parts();
            rebuilder.on_task_result(&mut deps, result.id, result.block, ok, progressed)
        };
        self.apply_rebuild_output(output);
    }

    /// Hand one queue dispatch to the transport as an owned spawned
    /// future. A send to a supplier that went offline after enqueue fails
    /// right here; an unreadable fragment file recycles the entry as a
    /// wire-level delivery failure so the next tick settles it.
    fn dispatch(&mut self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Send {
                slot,
                address,
                file,
                timeout,
            } => {
                let peer = match self.suppliers.peer(slot) {
                    Some(peer) if self.suppliers.is_active(slot) => peer,
                    _ => {
                        debug!("supplier {} offline, send of {} dropped", slot, address);
                        if let Some(event) = self.queues.on_send_supplier_offline(slot, &address) {
                            self.on_transfer_event(event);
                        }
                        return;
                    }
                };
                let transport = Arc::clone(&self.transport);
                let events = self.net_tx.clone();
                tokio::spawn(async move {
                    let payload = match tokio::fs::read(&file).await {
                        Ok(bytes) => Bytes::from(bytes),
                        Err(err) => {
                            warn!("cannot read {} for sending: {}", file.display(), err);
                            let _ = events.send(NetEvent::SendUndeliverable { slot, address });
                            return;
                        }
                    };
                    let outcome = transport
                        .send_fragment(&peer, &address, payload, timeout)
                        .await;
                    let _ = events.send(NetEvent::SendSettled {
                        slot,
                        address,
                        outcome,
                    });
                });
            }
            Dispatch::Request {
                slot,
                address,
                timeout,
            } => {
                if !self.suppliers.is_active(slot) {
                    debug!(
                        "supplier {} unreachable, request of {} recycled",
                        slot, address
                    );
                    self.queues.on_request_delivery_report(slot, &address, false);
                    return;
                }
                let Some(peer) = self.suppliers.peer(slot) else {
                    self.queues.on_request_delivery_report(slot, &address, false);
                    return;
                };
                let transport = Arc::clone(&self.transport);
                let events = self.net_tx.clone();
                tokio::spawn(async move {
                    let outcome = transport.request_fragment(&peer, &address, timeout).await;
                    let _ = events.send(NetEvent::FetchSettled {
                        slot,
                        address,
                        outcome,
                    });
                });
            }
        }
    }

    fn on_net_event(&mut self, event: NetEvent) {
        let settled = match event {
            NetEvent::SendSettled {
                slot,
                address,
                outcome,
            } => self.queues.on_send_outcome(slot, &address, outcome),
            NetEvent::FetchSettled {
                slot,
                address,
                outcome,
            } => self.queues.on_fetch_outcome(slot, &address, outcome),
            NetEvent::SendUndeliverable { slot, address } => {
                self.queues.on_send_delivery_report(slot, &address, false);
                None
            }
        };
        if let Some(event) = settled {
            self.on_transfer_event(event);
        }
    }

    /// Apply one terminal transfer event to the matrices and wake whoever
    /// cares about the fragment.
    fn on_transfer_event(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::SendAcked { address, .. } => {
                self.matrix.record_remote_fragment(
                    &address.backup,
                    &address.id,
                    crate::fragment::FragmentState::Present,
                );
            }
            TransferEvent::SendFailed {
                address, reason, ..
            } => match reason {
                FailReason::Timeout | FailReason::Rejected(_) | FailReason::Undelivered => {
                    self.matrix.record_remote_fragment(
                        &address.backup,
                        &address.id,
                        crate::fragment::FragmentState::Missing,
                    );
                }
                FailReason::FileGone => {
                    self.matrix
                        .record_local_fragment(&address.backup, &address.id, false, 0);
                }
                // offline says nothing about the remote copy; the send
                // sweep re-queues once the supplier is back
                FailReason::Offline | FailReason::Canceled | FailReason::Shutdown => {}
            },
            TransferEvent::RequestReceived {
                address, payload, ..
            } => match self
                .store
                .write_fragment(&address.backup, &address.id, &payload)
            {
                Ok(size) => {
                    self.matrix
                        .record_local_fragment(&address.backup, &address.id, true, size);
                    self.matrix.record_remote_fragment(
                        &address.backup,
                        &address.id,
                        crate::fragment::FragmentState::Present,
                    );
                    self.notify_fragment_received(&address);
                }
                Err(err) => {
                    // a fragment we cannot store is a fragment we do not have
                    warn!("cannot store received {}: {}", address, err);
                    self.notify_request_failed(&address);
                }
            },
            TransferEvent::RequestExists { address, .. } => {
                if let Some(size) = self.store.fragment_size(&address.backup, &address.id) {
                    self.matrix
                        .record_local_fragment(&address.backup, &address.id, true, size);
                }
                self.notify_fragment_received(&address);
            }
            TransferEvent::RequestFailed {
                address, reason, ..
            } => {
                if reason == FailReason::Timeout {
                    self.matrix.record_remote_fragment(
                        &address.backup,
                        &address.id,
                        crate::fragment::FragmentState::Missing,
                    );
                }
                match reason {
                    FailReason::Canceled | FailReason::Shutdown => {}
                    _ => self.notify_request_failed(&address),
                }
            }
        }
    }

    fn notify_fragment_received(&mut self, address: &FragmentAddress) {
        let rebuilding = self.rebuilding_backup();
        {
            let (sessions, mut deps) = self.restore_parts();
            for entry in sessions.iter_mut() {
                if entry.session.backup() != &address.backup {
                    continue;
                }
                deps.rebuilding_now = rebuilding.as_ref() == Some(&address.backup);
                let output = entry.session.on_fragment_received(&mut deps, &address.id);
                Self::resolve_restore(entry, output.finished);
            }
        }
        self.reap_restores();
        let output = {
            let (rebuilder, mut deps) = self.rebuild_parts();
            rebuilder.on_fragment_received(&mut deps)
        };
        self.apply_rebuild_output(output);
    }

    fn notify_request_failed(&mut self, address: &FragmentAddress) {
        let rebuilding = self.rebuilding_backup();
        {
            let (sessions, mut deps) = self.restore_parts();
            for entry in sessions.iter_mut() {
                if entry.session.backup() != &address.backup {
                    continue;
                }
                deps.rebuilding_now = rebuilding.as_ref() == Some(&address.backup);
                let output = entry.session.on_request_failed(&mut deps, &address.id);
                Self::resolve_restore(entry, output.finished);
            }
        }
        self.reap_restores();
        let output = {
            let (rebuilder, mut deps) = self.rebuild_parts();
            rebuilder.on_timer(&mut deps)
        };
        self.apply_rebuild_output(output);
    }

    fn restore_timers(&mut self) {
        let rebuilding = self.rebuilding_backup();
        {
            let (sessions, mut deps) = self.restore_parts();
            for entry in sessions.iter_mut() {
                deps.rebuilding_now = rebuilding.as_ref() == Some(entry.session.backup());
                let output = entry.session.on_timer(&mut deps);
                Self::resolve_restore(entry, output.finished);
            }
        }
        self.reap_restores();
    }

    fn apply_rebuild_output(&mut self, output: RebuildOutput) {
        if output.send_sweep {
            self.send_sweep();
        }
    }

    /// Queue uploads for every local fragment some active supplier has
    /// not confirmed, bounded by each supplier's send window.
    fn send_sweep(&mut self) {
        if self.queues.is_shut_down() || !self.suppliers.all_assigned() {
            return;
        }
        let mut queued = 0;
        for backup in self.matrix.known_backups() {
            let by_slot = self
                .matrix
                .scan_blocks_to_send(&backup, self.suppliers.as_ref());
            for (slot, ids) in by_slot {
                for id in ids {
                    if !self.queues.ok_to_send(slot) {
                        break;
                    }
                    let address = FragmentAddress::new(backup.clone(), id);
                    let online = self.suppliers.is_active(slot);
                    match self.queues.queue_send(slot, address, online) {
                        Ok(crate::transfer::Enqueued::Accepted) => queued += 1,
                        Ok(_) => {}
                        Err(err) => {
                            warn!("send sweep stopped: {}", err);
                            return;
                        }
                    }
                }
            }
        }
        if queued > 0 {
            debug!("send sweep queued {} uploads", queued);
        }
    }

    /// Remove local fragments whose blocks every supplier confirmed, the
    /// conservative compaction pass. Nothing is removed while uploads for
    /// this backup are still queued.
    fn compact(&mut self, backup: &BackupId) -> usize {
        if self.queues.is_sending_backup(backup) {
            debug!("compaction of {} deferred, uploads still queued", backup);
            return 0;
        }
        let removable = self
            .matrix
            .scan_blocks_to_remove(backup, self.suppliers.as_ref());
        let mut removed = 0;
        for id in removable {
            let size = self.store.fragment_size(backup, &id).unwrap_or(0);
            match self.store.delete_fragment(backup, &id) {
                Ok(true) => {
                    self.matrix.record_local_fragment(backup, &id, false, size);
                    removed += 1;
                }
                Ok(false) => {}
                Err(err) => warn!("cannot remove {}: {}", id, err),
            }
        }
        if removed > 0 {
            info!("compaction removed {} local fragments of {}", removed, backup);
        }
        removed
    }

    fn erase_backup(&mut self, backup: &BackupId) {
        info!("erasing {}", backup);
        // raid tasks first so canceled make waiters resolve before the
        // rebuilder re-submits anything
        for result in self.pool.cancel_backup(backup) {
            if let Some(waiter) = self.make_waiters.remove(&result.id) {
                let _ = waiter.send(Err(Error::TaskCanceled(backup.to_string())));
            }
        }
        {
            let (sessions, mut deps) = self.restore_parts();
            for entry in sessions.iter_mut() {
                if entry.session.backup() != backup {
                    continue;
                }
                let output = entry.session.abort(&mut deps);
                Self::resolve_restore(entry, output.finished);
            }
        }
        self.reap_restores();
        let output = {
            let (rebuilder, mut deps) = self.rebuild_parts();
            rebuilder.cancel_backup(&mut deps, backup)
        };
        self.apply_rebuild_output(output);
        for event in self.queues.cancel_backup_sends(Some(backup)) {
            self.on_transfer_event(event);
        }
        self.queues.cancel_backup_requests(Some(backup));
        self.matrix.erase_backup(backup);
        if let Err(err) = self.store.delete_version(backup) {
            warn!("cannot delete fragment files of {}: {}", backup, err);
        }
    }

    fn rebuilding_backup(&self) -> Option<BackupId> {
        if self.rebuilder.state() == RebuildState::Rebuilding {
            self.rebuilder.current_backup().cloned()
        } else {
            None
        }
    }

    fn rebuild_parts(&mut self) -> (&mut RebuildOrchestrator, RebuildDeps<'_>) {
        (
            &mut self.rebuilder,
            RebuildDeps {
                matrix: &mut self.matrix,
                suppliers: self.suppliers.as_ref(),
                queues: &mut self.queues,
                pool: &mut self.pool,
                store: &self.store,
            },
        )
    }

    fn restore_parts(&mut self) -> (&mut Vec<RestoreEntry>, RestoreDeps<'_>) {
        (
            &mut self.restores,
            RestoreDeps {
                matrix: &mut self.matrix,
                suppliers: self.suppliers.as_ref(),
                queues: &mut self.queues,
                pool: &mut self.pool,
                store: &self.store,
                rebuilding_now: false,
            },
        )
    }

    fn resolve_restore(entry: &mut RestoreEntry, finished: Option<RestoreOutcome>) {
        if let Some(outcome) = finished {
            if let Some(done) = entry.done.take() {
                let _ = done.send(outcome);
            }
        }
    }

    fn reap_restores(&mut self) {
        self.restores
            .retain(|entry| !entry.session.state().is_terminal());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::config::CustomerConfig;
    use crate::ecc::codec;
    use crate::fragment::{FragmentKind, FragmentState};
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use std::collections::HashMap as StdHashMap;

    fn test_backup() -> BackupId {
        BackupId::new("alice@node-a", "0/0/1", "F20260101010101AM")
    }

    /// In-memory supplier cloud: every peer holds a map of fragment
    /// payloads and acks whatever it is sent.
    #[derive(Default)]
    struct FakeCloud {
        holdings: Mutex<StdHashMap<(String, String), Bytes>>,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl FakeCloud {
        fn preload(&self, peer: &str, address: &FragmentAddress, payload: Bytes) {
            self.holdings
                .lock()
                .insert((peer.to_string(), address.to_string()), payload);
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    impl Transport for FakeCloud {
        fn send_fragment(
            &self,
            peer: &str,
            address: &FragmentAddress,
            payload: Bytes,
            _timeout: Duration,
        ) -> BoxFuture<'static, TransferOutcome> {
            self.holdings
                .lock()
                .insert((peer.to_string(), address.to_string()), payload);
            self.sent.lock().push((peer.to_string(), address.to_string()));
            Box::pin(async { TransferOutcome::Delivered })
        }

        fn request_fragment(
            &self,
            peer: &str,
            address: &FragmentAddress,
            _timeout: Duration,
        ) -> BoxFuture<'static, FetchOutcome> {
            let held = self
                .holdings
                .lock()
                .get(&(peer.to_string(), address.to_string()))
                .cloned();
            Box::pin(async move {
                match held {
                    Some(payload) => FetchOutcome::Received(payload),
                    None => FetchOutcome::Failed("not stored".to_string()),
                }
            })
        }
    }

    struct Rig {
        handle: EngineHandle,
        cloud: Arc<FakeCloud>,
        suppliers: Arc<SupplierDirectory>,
        store: FragmentStore,
        map: EccMap,
        _dir: tempfile::TempDir,
    }

    fn spawn_engine(peers: &[&str]) -> Rig {
        spawn_engine_with(peers, MemoryCatalog::new())
    }

    fn spawn_engine_with(peers: &[&str], catalog: MemoryCatalog) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FragmendConfig {
            customer: CustomerConfig {
                id: "alice@node-a".to_string(),
                suppliers: peers.len(),
                block_size: 64 * 1024,
                peers: peers.iter().map(|p| p.to_string()).collect(),
            },
            data_dir: dir.path().to_path_buf(),
            ..FragmendConfig::default()
        };
        // fast heartbeat so tests settle quickly
        config.rebuild.tick_interval_ms = 20;
        config.ensure_directories().unwrap();
        let suppliers = Arc::new(SupplierDirectory::with_peers(peers));
        let cloud = Arc::new(FakeCloud::default());
        let (engine, handle) = Engine::new(
            &config,
            Arc::clone(&suppliers),
            Box::new(catalog),
            cloud.clone(),
        )
        .unwrap();
        let store = FragmentStore::new(config.fragments_dir());
        let map = EccMap::new(peers.len()).unwrap();
        tokio::spawn(engine.run());
        Rig {
            handle,
            cloud,
            suppliers,
            store,
            map,
            _dir: dir,
        }
    }

    /// Shared growable sink for restore output.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_store_block_encodes_and_uploads() {
        let rig = spawn_engine(&["bob@1", "carol@2"]);
        let backup = test_backup();
        let fragments = rig
            .handle
            .store_block(backup.clone(), 0, Bytes::from_static(b"hello engine"), true)
            .await
            .unwrap();
        assert_eq!(fragments.len(), 4);
        for (id, _) in &fragments {
            assert!(rig.store.has_fragment(&backup, id));
        }
        // the send sweep pushes all four fragments out and the fake cloud
        // acks them, flipping the remote matrix to Present
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let (remote, _) = rig.handle.backup_stats(backup.clone()).await.unwrap();
            if remote.map_or(false, |stats| stats.percent >= 100.0) {
                break;
            }
            assert!(Instant::now() < deadline, "uploads never completed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(rig.cloud.sent_count(), 4);
    }

    #[tokio::test]
    async fn test_restore_from_local_fragments() {
        let rig = spawn_engine(&["bob@1", "carol@2"]);
        let backup = test_backup();
        let payloads: Vec<&[u8]> = vec![b"block zero", b"block one", b"final block"];
        for (block, payload) in payloads.iter().enumerate() {
            let last = block == payloads.len() - 1;
            rig.handle
                .store_block(backup.clone(), block, Bytes::copy_from_slice(payload), last)
                .await
                .unwrap();
        }
        let sink = SharedSink::default();
        let outcome = rig
            .handle
            .restore(backup.clone(), Box::new(sink.clone()), true, "test")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RestoreOutcome::Done {
                bytes_written: payloads.iter().map(|p| p.len() as u64).sum()
            }
        );
        assert_eq!(*sink.0.lock(), b"block zeroblock onefinal block".to_vec());
    }

    #[tokio::test]
    async fn test_restore_fetches_missing_fragments_from_suppliers() {
        let rig = spawn_engine(&["bob@1", "carol@2"]);
        let backup = test_backup();
        let encoded = codec::encode_block(&rig.map, b"remote only payload", true).unwrap();
        // nothing on disk locally; every fragment lives in the fake cloud
        for slot in 0..2 {
            let peer = rig.suppliers.peer(slot).unwrap();
            rig.cloud.preload(
                &peer,
                &FragmentAddress::new(backup.clone(), FragmentId::data(0, slot)),
                encoded.data[slot].clone(),
            );
            rig.cloud.preload(
                &peer,
                &FragmentAddress::new(backup.clone(), FragmentId::parity(0, slot)),
                encoded.parity[slot].clone(),
            );
        }
        let sink = SharedSink::default();
        let outcome = rig
            .handle
            .restore(backup, Box::new(sink.clone()), false, "test")
            .await
            .unwrap();
        assert_eq!(outcome, RestoreOutcome::Done { bytes_written: 19 });
        assert_eq!(*sink.0.lock(), b"remote only payload".to_vec());
    }

    #[tokio::test]
    async fn test_restore_survives_one_lost_fragment_per_block() {
        // Scenario: the map tolerates one loss per block; one parity never
        // arrives anywhere, the restore must still finish.
        let rig = spawn_engine(&["bob@1", "carol@2"]);
        let backup = test_backup();
        for block in 0..3 {
            let payload = format!("payload of block {}", block);
            let last = block == 2;
            let encoded = codec::encode_block(&rig.map, payload.as_bytes(), last).unwrap();
            for slot in 0..2 {
                let peer = rig.suppliers.peer(slot).unwrap();
                rig.cloud.preload(
                    &peer,
                    &FragmentAddress::new(backup.clone(), FragmentId::data(block, slot)),
                    encoded.data[slot].clone(),
                );
                // parity 0 of block 1 is lost everywhere
                if block == 1 && slot == 0 {
                    continue;
                }
                rig.cloud.preload(
                    &peer,
                    &FragmentAddress::new(backup.clone(), FragmentId::parity(block, slot)),
                    encoded.parity[slot].clone(),
                );
            }
        }
        let sink = SharedSink::default();
        let outcome = rig
            .handle
            .restore(backup, Box::new(sink.clone()), false, "test")
            .await
            .unwrap();
        match outcome {
            RestoreOutcome::Done { bytes_written } => assert!(bytes_written > 0),
            other => panic!("restore ended {:?}", other),
        }
        let written = sink.0.lock().clone();
        assert_eq!(
            written,
            b"payload of block 0payload of block 1payload of block 2".to_vec()
        );
    }

    #[tokio::test]
    async fn test_ingest_listing_updates_matrix() {
        let mut catalog = MemoryCatalog::new();
        catalog.add_version(&test_backup(), crate::catalog::VersionInfo::default());
        let rig = spawn_engine_with(&["bob@1", "carol@2"], catalog);
        let raw = "V0/0/1/F20260101010101AM 0 0-1 171\n";
        let report = rig
            .handle
            .ingest_listing(0, raw.to_string(), true)
            .await
            .unwrap();
        assert!(report.changed);
        assert!(report.backups_to_remove.is_empty());
        let backups = rig.handle.known_backups().await.unwrap();
        assert_eq!(backups, vec![test_backup()]);
        let dirty = rig.handle.take_dirty().await.unwrap();
        assert!(dirty.contains(&test_backup()));
    }

    #[tokio::test]
    async fn test_erase_backup_clears_everything() {
        let rig = spawn_engine(&["bob@1", "carol@2"]);
        let backup = test_backup();
        rig.handle
            .store_block(backup.clone(), 0, Bytes::from_static(b"doomed"), true)
            .await
            .unwrap();
        assert!(rig.store.has_fragment(&backup, &FragmentId::data(0, 0)));
        rig.handle.erase_backup(backup.clone()).await.unwrap();
        assert!(rig.handle.known_backups().await.unwrap().is_empty());
        assert!(!rig.store.has_fragment(&backup, &FragmentId::data(0, 0)));
    }

    #[tokio::test]
    async fn test_compact_requires_full_confirmation() {
        let rig = spawn_engine(&["bob@1", "carol@2"]);
        let backup = test_backup();
        rig.handle
            .store_block(backup.clone(), 0, Bytes::from_static(b"compact me"), true)
            .await
            .unwrap();
        // wait for the uploads to be acked
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let (remote, _) = rig.handle.backup_stats(backup.clone()).await.unwrap();
            if remote.map_or(false, |stats| stats.percent >= 100.0) {
                break;
            }
            assert!(Instant::now() < deadline, "uploads never completed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // one supplier going dark blocks compaction entirely
        rig.suppliers.set_online(1, false);
        assert_eq!(rig.handle.compact(backup.clone()).await.unwrap(), 0);
        rig.suppliers.set_online(1, true);
        let removed = rig.handle.compact(backup.clone()).await.unwrap();
        assert_eq!(removed, 4);
        assert!(!rig.store.has_fragment(&backup, &FragmentId::data(0, 0)));
    }

    #[tokio::test]
    async fn test_rescan_local_repopulates_matrix() {
        let rig = spawn_engine(&["bob@1", "carol@2"]);
        let backup = test_backup();
        let encoded = codec::encode_block(&rig.map, b"scanned", true).unwrap();
        rig.store
            .write_fragment(&backup, &FragmentId::data(0, 0), &encoded.data[0])
            .unwrap();
        let found = rig.handle.rescan_local().await.unwrap();
        assert_eq!(found, 1);
        let (_, local) = rig.handle.backup_stats(backup).await.unwrap();
        assert_eq!(local.files, 1);
    }

    #[tokio::test]
    async fn test_shutdown_resolves_pending_work() {
        let rig = spawn_engine(&["bob@1", "carol@2"]);
        rig.handle.shutdown().await.unwrap();
        // the loop is gone; further commands fail cleanly
        let err = rig.handle.known_backups().await.unwrap_err();
        assert!(matches!(err, Error::EngineStopped));
    }
}
