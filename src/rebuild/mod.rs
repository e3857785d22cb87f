//! Self-healing rebuild orchestration
//!
//! Walks a FIFO queue of backups and repairs one at a time: rescan which
//! blocks have gaps on the supplier side, pull back any fragments that
//! still exist remotely but not here, then hand every locally repairable
//! block to the raid worker pool, newest block first. Rebuilt fragments
//! go out again through the regular send sweep.
//!
//! The orchestrator never blocks. It is a state machine the engine loop
//! advances with events: a periodic timer while requests are in flight, a
//! received fragment, a settled raid task. Instant transitions cascade
//! inside one call, so after any entry point the state is either terminal
//! (`Stopped`, `Done`) or genuinely waiting (`Request`, `Rebuilding`).
//! Stop is cooperative and engages between blocks, never mid-task.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::ecc::EccMap;
use crate::fragment::{BackupId, BlockIndex, FragmentAddress, FragmentId, FragmentKind};
use crate::matrix::AvailabilityMatrix;
use crate::storage::FragmentStore;
use crate::suppliers::SupplierDirectory;
use crate::transfer::{Enqueued, TransferQueues};
use crate::worker::{RaidTask, RaidWorkerPool, RebuildSpec, TaskId};

/// Per-supplier ceiling on fragment requests queued in one pass. Also the
/// request queue depth at which a supplier is left alone until it drains.
const MAX_SUPPLIER_REQUESTS: usize = 16;

/// Where the orchestrator currently is. `NextBackup` and `Prepare` are
/// transient, they always cascade further within the same call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildState {
    /// Not running; `start` begins a new cycle.
    Stopped,
    /// Picking the next backup off the work queue.
    NextBackup,
    /// Rescanning the current backup for broken blocks.
    Prepare,
    /// Requests outstanding; waiting on fragments or the timer.
    Request,
    /// A raid task is running for the current block.
    Rebuilding,
    /// Work queue drained; waiting for the next `start`.
    Done,
}

impl RebuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebuildState::Stopped => "stopped",
            RebuildState::NextBackup => "next-backup",
            RebuildState::Prepare => "prepare",
            RebuildState::Request => "request",
            RebuildState::Rebuilding => "rebuilding",
            RebuildState::Done => "done",
        }
    }
}

/// Everything the orchestrator touches, borrowed from the engine for the
/// duration of one event. All five views must share the same supplier
/// count.
pub struct RebuildDeps<'a> {
    pub matrix: &'a mut AvailabilityMatrix,
    pub suppliers: &'a SupplierDirectory,
    pub queues: &'a mut TransferQueues,
    pub pool: &'a mut RaidWorkerPool,
    pub store: &'a FragmentStore,
}

/// Side effects of one event for the engine to act on.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebuildOutput {
    /// Local fragments exist that some active supplier is missing; worth
    /// running a send sweep now.
    pub send_sweep: bool,
    /// Fragment requests queued during this event.
    pub requested: usize,
}

/// Outcome of one request pass over the working blocks.
enum RequestOutcome {
    /// This many fragment requests were queued.
    Sent(usize),
    /// Nothing requestable, but fragments are gone on both sides.
    FoundMissing,
    /// Nothing to ask for at all.
    NoRequests,
}

#[derive(Debug)]
struct CurrentBackup {
    backup: BackupId,
    /// Broken blocks, ascending; processed from the back so the newest
    /// data is repaired first.
    working_blocks: Vec<BlockIndex>,
    /// Index into `working_blocks` of the block being rebuilt.
    block_cursor: Option<usize>,
    /// Blocks repaired during the current rebuild pass.
    succeeded: Vec<BlockIndex>,
    /// Fragments absent both locally and on every supplier, counted by
    /// the last request pass.
    missing_fragments: usize,
    pending_task: Option<TaskId>,
}

impl CurrentBackup {
    fn new(backup: BackupId) -> Self {
        Self {
            backup,
            working_blocks: Vec::new(),
            block_cursor: None,
            succeeded: Vec::new(),
            missing_fragments: 0,
            pending_task: None,
        }
    }
}

/// Background repair driver. One per engine.
pub struct RebuildOrchestrator {
    map: EccMap,
    state: RebuildState,
    stop_requested: bool,
    backlog: VecDeque<BackupId>,
    current: Option<CurrentBackup>,
    /// Backups that had at least one block repaired this cycle.
    rebuilt: Vec<BackupId>,
}

impl RebuildOrchestrator {
    pub fn new(map: EccMap) -> Self {
        Self {
            map,
            state: RebuildState::Stopped,
            stop_requested: false,
            backlog: VecDeque::new(),
            current: None,
            rebuilt: Vec::new(),
        }
    }

    pub fn state(&self) -> RebuildState {
        self.state
    }

    pub fn current_backup(&self) -> Option<&BackupId> {
        self.current.as_ref().map(|cur| &cur.backup)
    }

    /// True when this backup is queued or being worked on right now.
    pub fn is_queued(&self, backup: &BackupId) -> bool {
        self.backlog.contains(backup) || self.current_backup() == Some(backup)
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Appends a backup to the work queue. Duplicates are dropped.
    pub fn add_backup(&mut self, backup: BackupId) -> bool {
        if self.is_queued(&backup) {
            debug!("{} already queued for rebuild", backup);
            return false;
        }
        self.backlog.push_back(backup);
        true
    }

    pub fn add_backups(&mut self, backups: impl IntoIterator<Item = BackupId>) -> usize {
        backups
            .into_iter()
            .filter(|backup| self.add_backup(backup.clone()))
            .count()
    }

    pub fn clear_backlog(&mut self) {
        self.backlog.clear();
    }

    /// Backups repaired since the last call. The engine drains this after
    /// a cycle finishes to refresh stats and notify listeners.
    pub fn take_rebuilt(&mut self) -> Vec<BackupId> {
        std::mem::take(&mut self.rebuilt)
    }

    /// Begins a repair cycle over the queued backups. Ignored while a
    /// cycle is already running.
    pub fn start(&mut self, deps: &mut RebuildDeps<'_>) -> RebuildOutput {
        let mut output = RebuildOutput::default();
        if !matches!(self.state, RebuildState::Stopped | RebuildState::Done) {
            debug!("Rebuild start ignored, already {}", self.state.as_str());
            return output;
        }
        self.stop_requested = false;
        self.rebuilt.clear();
        info!("Rebuild cycle starting, {} backups queued", self.backlog.len());
        self.state = RebuildState::NextBackup;
        self.step(deps, &mut output);
        output
    }

    /// Asks the cycle to wind down. Takes effect at the next event, after
    /// any running raid task settles.
    pub fn request_stop(&mut self) {
        if !self.stop_requested {
            debug!("Rebuild stop requested while {}", self.state.as_str());
            self.stop_requested = true;
        }
    }

    /// Periodic nudge while requests are outstanding. Re-evaluates whether
    /// the current backup can move into rebuilding or should be left for a
    /// future pass.
    pub fn on_timer(&mut self, deps: &mut RebuildDeps<'_>) -> RebuildOutput {
        self.reconsider(deps)
    }

    /// A requested fragment arrived and was recorded in the matrix.
    pub fn on_fragment_received(&mut self, deps: &mut RebuildDeps<'_>) -> RebuildOutput {
        self.reconsider(deps)
    }

    /// A raid rebuild task settled. `ok` is whether the task itself
    /// succeeded, `progressed` whether it reconstructed anything.
    pub fn on_task_result(
        &mut self,
        deps: &mut RebuildDeps<'_>,
        id: TaskId,
        block: BlockIndex,
        ok: bool,
        progressed: bool,
    ) -> RebuildOutput {
        let mut output = RebuildOutput::default();
        if self.state != RebuildState::Rebuilding {
            debug!("Raid result {} ignored while {}", id, self.state.as_str());
            return output;
        }
        let matched = match self.current.as_mut() {
            Some(cur) if cur.pending_task == Some(id) => {
                cur.pending_task = None;
                if ok && progressed {
                    cur.succeeded.push(block);
                }
                cur.block_cursor = cur.block_cursor.and_then(|cursor| cursor.checked_sub(1));
                true
            }
            _ => false,
        };
        if !matched {
            debug!("Stale raid result {} ignored", id);
            return output;
        }
        if !ok {
            // A block that cannot be reassembled from what we have will
            // not improve until new fragments arrive. Leave this backup
            // for a future cycle and move on.
            warn!("Rebuild of block {} failed, leaving this backup for later", block);
            self.finish_pass_bookkeeping(&mut output);
            self.close_current(deps);
            self.state = RebuildState::NextBackup;
            self.step(deps, &mut output);
            return output;
        }
        if self.stop_requested {
            self.close_current(deps);
            self.state = RebuildState::Stopped;
            info!("Rebuild stopped between blocks");
            return output;
        }
        self.submit_or_finish(deps, &mut output);
        output
    }

    /// Drops a backup from the work queue, aborting it mid-repair if it is
    /// the one being worked on. Used when a backup is erased.
    pub fn cancel_backup(&mut self, deps: &mut RebuildDeps<'_>, backup: &BackupId) -> RebuildOutput {
        let mut output = RebuildOutput::default();
        self.backlog.retain(|queued| queued != backup);
        if self.current_backup() != Some(backup) {
            return output;
        }
        let dropped = deps.pool.cancel_backup(backup);
        if !dropped.is_empty() {
            debug!("Dropped {} queued raid tasks for {}", dropped.len(), backup);
        }
        debug!("Abandoning rebuild of {}", backup);
        self.close_current(deps);
        self.state = RebuildState::NextBackup;
        self.step(deps, &mut output);
        output
    }

    /// Common re-evaluation for timer ticks and arriving fragments.
    fn reconsider(&mut self, deps: &mut RebuildDeps<'_>) -> RebuildOutput {
        let mut output = RebuildOutput::default();
        if self.state != RebuildState::Request {
            return output;
        }
        if self.stop_requested {
            self.close_current(deps);
            self.state = RebuildState::Stopped;
            info!("Rebuild stopped while requesting");
            return output;
        }
        if self.chance_to_rebuild(deps) {
            self.enter_rebuilding(deps, &mut output);
        } else if !self.is_requesting_current(deps) {
            // Every request has settled and nothing became repairable.
            // Anything still missing is out of reach until suppliers or
            // listings change, so hand the slot to the next backup.
            let missing = self
                .current
                .as_ref()
                .map(|cur| cur.missing_fragments)
                .unwrap_or(0);
            if missing > 0 {
                info!("{} fragments unreachable for now, moving on", missing);
            }
            self.close_current(deps);
            self.state = RebuildState::NextBackup;
            self.step(deps, &mut output);
        }
        output
    }

    /// Runs the instant transitions until the machine is waiting or done.
    fn step(&mut self, deps: &mut RebuildDeps<'_>, output: &mut RebuildOutput) {
        loop {
            if self.stop_requested && self.state != RebuildState::Stopped {
                self.close_current(deps);
                self.state = RebuildState::Stopped;
                info!("Rebuild stopped");
                return;
            }
            match self.state {
                RebuildState::Stopped
                | RebuildState::Done
                | RebuildState::Request
                | RebuildState::Rebuilding => return,
                RebuildState::NextBackup => {
                    let Some(backup) = self.backlog.pop_front() else {
                        info!(
                            "Rebuild cycle complete, {} backups repaired",
                            self.rebuilt.len()
                        );
                        self.state = RebuildState::Done;
                        return;
                    };
                    debug!("Rebuilding {}, {} more queued", backup, self.backlog.len());
                    self.current = Some(CurrentBackup::new(backup));
                    self.state = RebuildState::Prepare;
                }
                RebuildState::Prepare => {
                    let Some(cur) = self.current.as_mut() else {
                        self.state = RebuildState::NextBackup;
                        continue;
                    };
                    cur.working_blocks = deps.matrix.scan_missing_blocks(&cur.backup, deps.suppliers);
                    cur.missing_fragments = 0;
                    let backup = cur.backup.clone();
                    let broken = cur.working_blocks.len();
                    // Requests from an earlier pass are stale against the fresh scan.
                    deps.queues.cancel_backup_requests(Some(&backup));
                    debug!("{} has {} broken blocks", backup, broken);
                    if broken == 0 {
                        self.close_current(deps);
                        self.state = RebuildState::NextBackup;
                        continue;
                    }
                    self.state = RebuildState::Request;
                    self.run_request_pass(deps, output);
                    if !matches!(
                        self.state,
                        RebuildState::NextBackup | RebuildState::Prepare
                    ) {
                        return;
                    }
                }
            }
        }
    }

    /// One pass over the working blocks asking suppliers for whatever they
    /// still hold that we lost, then decides where to go next.
    fn run_request_pass(&mut self, deps: &mut RebuildDeps<'_>, output: &mut RebuildOutput) {
        let outcome = match self.current.as_mut() {
            Some(cur) => scan_requests(cur, deps, output),
            None => {
                self.state = RebuildState::NextBackup;
                return;
            }
        };
        match outcome {
            RequestOutcome::Sent(count) => {
                output.requested += count;
                debug!("{} fragment requests queued", count);
                if self.chance_to_rebuild(deps) {
                    self.enter_rebuilding(deps, output);
                }
                // otherwise stay in Request and wait for fragments
            }
            RequestOutcome::FoundMissing => {
                if self.chance_to_rebuild(deps) {
                    self.enter_rebuilding(deps, output);
                } else {
                    self.close_current(deps);
                    self.state = RebuildState::NextBackup;
                }
            }
            RequestOutcome::NoRequests => {
                self.close_current(deps);
                self.state = RebuildState::NextBackup;
            }
        }
    }

    /// A rebuild is worth attempting when any working block can gain at
    /// least one fragment from what is on disk right now.
    fn chance_to_rebuild(&self, deps: &RebuildDeps<'_>) -> bool {
        let Some(cur) = self.current.as_ref() else {
            return false;
        };
        cur.working_blocks.iter().rev().any(|&block| {
            let presence = deps.matrix.block_presence(&cur.backup, block);
            self.map
                .can_make_progress(&presence.local_data, &presence.local_parity)
        })
    }

    fn is_requesting_current(&self, deps: &RebuildDeps<'_>) -> bool {
        self.current
            .as_ref()
            .map(|cur| deps.queues.is_requesting_backup(&cur.backup))
            .unwrap_or(false)
    }

    /// Starts a rebuild pass: newest working block first, one raid task at
    /// a time.
    fn enter_rebuilding(&mut self, deps: &mut RebuildDeps<'_>, output: &mut RebuildOutput) {
        self.state = RebuildState::Rebuilding;
        if let Some(cur) = self.current.as_mut() {
            cur.succeeded.clear();
            cur.block_cursor = cur.working_blocks.len().checked_sub(1);
        }
        self.submit_or_finish(deps, output);
    }

    /// Submits the raid task for the block under the cursor, or wraps up
    /// the pass when the cursor ran out.
    fn submit_or_finish(&mut self, deps: &mut RebuildDeps<'_>, output: &mut RebuildOutput) {
        enum Next {
            Submitted,
            Exhausted,
            PoolGone,
        }
        let next = match self.current.as_mut() {
            Some(cur) => match cur.block_cursor {
                Some(cursor) => {
                    let block = cur.working_blocks[cursor];
                    let presence = deps.matrix.block_presence(&cur.backup, block);
                    let task = RaidTask::Rebuild(RebuildSpec {
                        backup: cur.backup.clone(),
                        block,
                        map: self.map.clone(),
                        active: deps.suppliers.active_bitmap(),
                        presence,
                    });
                    match deps.pool.submit(task) {
                        Ok(id) => {
                            debug!("Raid task {} rebuilding block {}", id, block);
                            cur.pending_task = Some(id);
                            Next::Submitted
                        }
                        Err(err) => {
                            warn!("Cannot submit rebuild of block {}: {}", block, err);
                            Next::PoolGone
                        }
                    }
                }
                None => Next::Exhausted,
            },
            None => Next::PoolGone,
        };
        match next {
            Next::Submitted => {}
            Next::Exhausted => self.finish_rebuilding(deps, output),
            Next::PoolGone => {
                self.finish_pass_bookkeeping(output);
                self.close_current(deps);
                self.state = RebuildState::NextBackup;
                self.step(deps, output);
            }
        }
    }

    /// End of a rebuild pass: drop repaired blocks from the working queue,
    /// then either keep requesting for the remainder or rescan the backup.
    fn finish_rebuilding(&mut self, deps: &mut RebuildDeps<'_>, output: &mut RebuildOutput) {
        let remaining = self.finish_pass_bookkeeping(output);
        if remaining > 0 {
            self.state = RebuildState::Request;
            self.run_request_pass(deps, output);
            if matches!(self.state, RebuildState::NextBackup | RebuildState::Prepare) {
                self.step(deps, output);
            }
        } else {
            self.state = RebuildState::Prepare;
            self.step(deps, output);
        }
    }

    /// Removes repaired blocks from the working queue and records whether
    /// this backup gained anything. Returns how many blocks remain broken.
    fn finish_pass_bookkeeping(&mut self, output: &mut RebuildOutput) -> usize {
        let Some(cur) = self.current.as_mut() else {
            return 0;
        };
        let succeeded = std::mem::take(&mut cur.succeeded);
        cur.working_blocks.retain(|block| !succeeded.contains(block));
        cur.block_cursor = None;
        let remaining = cur.working_blocks.len();
        if !succeeded.is_empty() {
            info!(
                "Repaired {} blocks of {}, {} still broken",
                succeeded.len(),
                cur.backup,
                remaining
            );
            let backup = cur.backup.clone();
            if !self.rebuilt.contains(&backup) {
                self.rebuilt.push(backup);
            }
            // Freshly rebuilt fragments belong on their suppliers.
            output.send_sweep = true;
        }
        remaining
    }

    /// Forgets the current backup and cancels whatever it still has queued.
    fn close_current(&mut self, deps: &mut RebuildDeps<'_>) {
        if let Some(cur) = self.current.take() {
            let canceled = deps.queues.cancel_backup_requests(Some(&cur.backup));
            if canceled > 0 {
                debug!("Canceled {} leftover requests for {}", canceled, cur.backup);
            }
        }
    }
}

/// Queues requests for fragments we lost but some active supplier still
/// holds. Counts fragments gone from both sides along the way and flags
/// local fragments the suppliers are missing for the send sweep.
fn scan_requests(
    cur: &mut CurrentBackup,
    deps: &mut RebuildDeps<'_>,
    output: &mut RebuildOutput,
) -> RequestOutcome {
    cur.missing_fragments = 0;
    if !deps.suppliers.all_assigned() {
        debug!("Request pass skipped, supplier roster has empty slots");
        return RequestOutcome::NoRequests;
    }
    let mut total = 0;
    for slot in 0..deps.suppliers.count() {
        let mut requested = 0;
        for &block in cur.working_blocks.iter().rev() {
            if deps.queues.request_queue_len(slot) >= MAX_SUPPLIER_REQUESTS
                || requested >= MAX_SUPPLIER_REQUESTS
            {
                break;
            }
            let presence = deps.matrix.block_presence(&cur.backup, block);
            for kind in [FragmentKind::Data, FragmentKind::Parity] {
                let (local, remote) = match kind {
                    FragmentKind::Data => {
                        (presence.local_data[slot], presence.remote_data[slot])
                    }
                    FragmentKind::Parity => {
                        (presence.local_parity[slot], presence.remote_parity[slot])
                    }
                };
                if local {
                    if !remote {
                        // we hold it, the supplier does not: upload, not repair
                        output.send_sweep = true;
                    }
                    continue;
                }
                if !remote {
                    cur.missing_fragments += 1;
                    continue;
                }
                if !deps.suppliers.is_active(slot) {
                    continue;
                }
                let id = FragmentId::new(block, slot, kind);
                let address = FragmentAddress::new(cur.backup.clone(), id.clone());
                if deps.queues.has_request(slot, &address) {
                    continue;
                }
                if let Some(size) = deps.store.fragment_size(&cur.backup, &id) {
                    // the matrix lost track of a fragment we already have
                    warn!("{} already on disk, fixing local matrix", address);
                    deps.matrix.record_local_fragment(&cur.backup, &id, true, size);
                    continue;
                }
                match deps.queues.queue_request(slot, address) {
                    Ok(Enqueued::Accepted) => requested += 1,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("Request pass aborted: {}", err);
                        return RequestOutcome::NoRequests;
                    }
                }
            }
        }
        total += requested;
    }
    if total > 0 {
        RequestOutcome::Sent(total)
    } else if cur.missing_fragments > 0 {
        debug!(
            "Nothing requestable, {} fragments gone on both sides",
            cur.missing_fragments
        );
        RequestOutcome::FoundMissing
    } else {
        RequestOutcome::NoRequests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecc::codec;
    use crate::fragment::FragmentState;
    use crate::transfer::TransferConfig;
    use crate::worker::{TaskOutput, TaskResult, WorkerConfig};
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn test_backup() -> BackupId {
        BackupId::new("alice@node-a", "0/0/1", "F20260101010101AM")
    }

    fn other_backup() -> BackupId {
        BackupId::new("alice@node-a", "0/0/2", "F20260202020202PM")
    }

    struct Rig {
        matrix: AvailabilityMatrix,
        suppliers: SupplierDirectory,
        queues: TransferQueues,
        pool: RaidWorkerPool,
        store: FragmentStore,
        results: mpsc::UnboundedReceiver<TaskResult>,
        _dir: tempfile::TempDir,
    }

    impl Rig {
        fn new(peers: &[&str]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = FragmentStore::new(dir.path());
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                matrix: AvailabilityMatrix::new(peers.len()),
                suppliers: SupplierDirectory::with_peers(peers),
                queues: TransferQueues::new(
                    peers.len(),
                    store.clone(),
                    TransferConfig::default(),
                ),
                pool: RaidWorkerPool::new(store.clone(), WorkerConfig::default(), tx),
                store,
                results: rx,
                _dir: dir,
            }
        }

        fn deps(&mut self) -> RebuildDeps<'_> {
            RebuildDeps {
                matrix: &mut self.matrix,
                suppliers: &self.suppliers,
                queues: &mut self.queues,
                pool: &mut self.pool,
                store: &self.store,
            }
        }

        /// Writes real encoded fragments to disk and marks them local.
        fn encode_local(
            &mut self,
            backup: &BackupId,
            map: &EccMap,
            payload: &[u8],
            keep: &[FragmentId],
        ) {
            let encoded = codec::encode_block(map, payload, false).unwrap();
            for id in keep {
                let bytes = match id.kind {
                    FragmentKind::Data => &encoded.data[id.slot],
                    FragmentKind::Parity => &encoded.parity[id.slot],
                };
                let size = self.store.write_fragment(backup, id, bytes).unwrap();
                self.matrix.record_local_fragment(backup, id, true, size);
            }
        }

        fn mark_remote(
            &mut self,
            backup: &BackupId,
            block: BlockIndex,
            cells: &[((usize, FragmentKind), FragmentState)],
        ) {
            for &((slot, kind), state) in cells {
                self.matrix.record_remote_fragment(
                    backup,
                    &FragmentId::new(block, slot, kind),
                    state,
                );
            }
        }
    }

    #[test]
    fn test_start_with_empty_queue_finishes() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        let mut orchestrator = RebuildOrchestrator::new(EccMap::new(2).unwrap());
        let output = orchestrator.start(&mut rig.deps());
        assert_eq!(orchestrator.state(), RebuildState::Done);
        assert_eq!(output, RebuildOutput::default());
        assert!(orchestrator.take_rebuilt().is_empty());
    }

    #[test]
    fn test_add_backup_dedups() {
        let mut orchestrator = RebuildOrchestrator::new(EccMap::new(2).unwrap());
        assert!(orchestrator.add_backup(test_backup()));
        assert!(!orchestrator.add_backup(test_backup()));
        assert!(orchestrator.is_queued(&test_backup()));
        assert_eq!(orchestrator.backlog_len(), 1);
        assert_eq!(orchestrator.add_backups(vec![test_backup(), other_backup()]), 1);
    }

    #[test]
    fn test_incomplete_roster_skips_backup() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        rig.suppliers.clear_slot(1);
        let backup = test_backup();
        rig.matrix.record_remote_fragment(
            &backup,
            &FragmentId::data(0, 0),
            FragmentState::Missing,
        );

        let mut orchestrator = RebuildOrchestrator::new(EccMap::new(2).unwrap());
        orchestrator.add_backup(backup.clone());
        let output = orchestrator.start(&mut rig.deps());

        assert_eq!(orchestrator.state(), RebuildState::Done);
        assert_eq!(output.requested, 0);
        assert!(!rig.queues.is_requesting_backup(&backup));
    }

    #[test]
    fn test_request_pass_queues_remote_survivors() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        let backup = test_backup();
        // supplier 0 still holds our data fragment; its parity twin is gone
        rig.mark_remote(
            &backup,
            0,
            &[
                ((0, FragmentKind::Data), FragmentState::Present),
                ((0, FragmentKind::Parity), FragmentState::Missing),
            ],
        );

        let mut orchestrator = RebuildOrchestrator::new(EccMap::new(2).unwrap());
        orchestrator.add_backup(backup.clone());
        let output = orchestrator.start(&mut rig.deps());

        assert_eq!(orchestrator.state(), RebuildState::Request);
        assert_eq!(output.requested, 1);
        let wanted = FragmentAddress::new(backup.clone(), FragmentId::data(0, 0));
        assert!(rig.queues.has_request(0, &wanted));
        assert!(rig.queues.is_requesting_backup(&backup));
        assert_eq!(orchestrator.current_backup(), Some(&backup));
    }

    #[test]
    fn test_nothing_reachable_moves_to_next_backup() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        let backup = test_backup();
        rig.mark_remote(
            &backup,
            0,
            &[((0, FragmentKind::Data), FragmentState::Missing)],
        );

        let mut orchestrator = RebuildOrchestrator::new(EccMap::new(2).unwrap());
        orchestrator.add_backup(backup.clone());
        let output = orchestrator.start(&mut rig.deps());

        // everything is gone on both sides and nothing is on disk
        assert_eq!(orchestrator.state(), RebuildState::Done);
        assert_eq!(output.requested, 0);
        assert!(!output.send_sweep);
        assert!(orchestrator.take_rebuilt().is_empty());
    }

    #[test]
    fn test_request_pass_fixes_forgotten_local_file() {
        let mut rig = Rig::new(&["a@1", "b@2", "c@3", "d@4"]);
        let map = EccMap::new(4).unwrap();
        let backup = test_backup();
        // d0 sits on disk but the local matrix does not know
        let encoded = codec::encode_block(&map, b"forgotten fragment", false).unwrap();
        let d0 = FragmentId::data(0, 0);
        rig.store.write_fragment(&backup, &d0, &encoded.data[0]).unwrap();
        let mut remote = Vec::new();
        for slot in 0..4 {
            remote.push(((slot, FragmentKind::Data), FragmentState::Present));
        }
        for slot in 0..3 {
            remote.push(((slot, FragmentKind::Parity), FragmentState::Present));
        }
        // parity 3 stays unknown so the block counts as broken
        rig.mark_remote(&backup, 0, &remote);

        let mut orchestrator = RebuildOrchestrator::new(map);
        orchestrator.add_backup(backup.clone());
        let output = orchestrator.start(&mut rig.deps());

        assert!(rig.matrix.local_present(&backup, &d0));
        assert!(!rig.queues.has_request(0, &FragmentAddress::new(backup.clone(), d0)));
        // a single data fragment cannot seed a 4x4 rebuild
        assert_eq!(orchestrator.state(), RebuildState::Request);
        assert_eq!(output.requested, 6);
    }

    #[tokio::test]
    async fn test_full_cycle_rebuilds_and_sweeps() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        let map = EccMap::new(2).unwrap();
        let backup = test_backup();
        rig.encode_local(
            &backup,
            &map,
            b"block zero payload",
            &[FragmentId::data(0, 0), FragmentId::data(0, 1)],
        );
        rig.mark_remote(
            &backup,
            0,
            &[
                ((0, FragmentKind::Data), FragmentState::Present),
                ((1, FragmentKind::Data), FragmentState::Present),
                ((0, FragmentKind::Parity), FragmentState::Present),
                ((1, FragmentKind::Parity), FragmentState::Missing),
            ],
        );

        let mut orchestrator = RebuildOrchestrator::new(map);
        orchestrator.add_backup(backup.clone());
        let output = orchestrator.start(&mut rig.deps());
        // both data fragments are local, so the pass goes straight to a
        // rebuild with the parity request still in flight
        assert_eq!(orchestrator.state(), RebuildState::Rebuilding);
        assert_eq!(output.requested, 1);

        let result = rig.results.recv().await.unwrap();
        assert!(rig.pool.settle(result.id, Instant::now()));
        let (ok, progressed) = match &result.output {
            Ok(TaskOutput::Rebuilt {
                rebuilt_parity,
                fragments,
                ..
            }) => {
                assert_eq!(rebuilt_parity, &vec![0, 1]);
                for (id, size) in fragments {
                    rig.matrix.record_local_fragment(&backup, id, true, *size);
                }
                (true, !fragments.is_empty())
            }
            other => panic!("unexpected rebuild output {:?}", other),
        };
        let output =
            orchestrator.on_task_result(&mut rig.deps(), result.id, result.block, ok, progressed);

        assert_eq!(orchestrator.state(), RebuildState::Done);
        assert!(output.send_sweep);
        assert_eq!(orchestrator.take_rebuilt(), vec![backup.clone()]);
        assert!(rig.store.has_fragment(&backup, &FragmentId::parity(0, 1)));
        assert!(rig.matrix.local_present(&backup, &FragmentId::parity(0, 1)));
        // the leftover parity request was canceled when the backup closed
        assert!(!rig.queues.is_requesting_backup(&backup));
    }

    #[tokio::test]
    async fn test_newest_block_first_and_cooperative_stop() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        let map = EccMap::new(2).unwrap();
        let backup = test_backup();
        for block in 0..2 {
            rig.encode_local(
                &backup,
                &map,
                format!("payload {}", block).as_bytes(),
                &[FragmentId::data(block, 0), FragmentId::data(block, 1)],
            );
            rig.mark_remote(
                &backup,
                block,
                &[((0, FragmentKind::Parity), FragmentState::Missing)],
            );
        }

        let mut orchestrator = RebuildOrchestrator::new(map);
        orchestrator.add_backup(backup.clone());
        orchestrator.start(&mut rig.deps());
        assert_eq!(orchestrator.state(), RebuildState::Rebuilding);

        let result = rig.results.recv().await.unwrap();
        assert_eq!(result.block, 1, "newest block goes first");
        assert!(rig.pool.settle(result.id, Instant::now()));

        orchestrator.request_stop();
        orchestrator.on_task_result(&mut rig.deps(), result.id, result.block, true, true);

        assert_eq!(orchestrator.state(), RebuildState::Stopped);
        assert_eq!(orchestrator.current_backup(), None);
        assert_eq!(rig.pool.backlog_len(), 0);
        assert_eq!(rig.pool.running_len(), 0);
    }

    #[tokio::test]
    async fn test_failed_block_abandons_backup_for_this_cycle() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        let map = EccMap::new(2).unwrap();
        let first = test_backup();
        let second = other_backup();
        rig.encode_local(&first, &map, b"first backup", &[FragmentId::data(0, 0)]);
        rig.mark_remote(
            &first,
            0,
            &[((1, FragmentKind::Data), FragmentState::Missing)],
        );
        // the second backup has a fragment to request, nothing local
        rig.mark_remote(
            &second,
            0,
            &[
                ((0, FragmentKind::Data), FragmentState::Present),
                ((1, FragmentKind::Data), FragmentState::Missing),
            ],
        );

        let mut orchestrator = RebuildOrchestrator::new(map);
        orchestrator.add_backups(vec![first.clone(), second.clone()]);
        orchestrator.start(&mut rig.deps());
        assert_eq!(orchestrator.current_backup(), Some(&first));
        assert_eq!(orchestrator.state(), RebuildState::Rebuilding);

        let result = rig.results.recv().await.unwrap();
        assert!(rig.pool.settle(result.id, Instant::now()));
        // the engine saw the task fail
        orchestrator.on_task_result(&mut rig.deps(), result.id, result.block, false, false);

        assert_eq!(orchestrator.current_backup(), Some(&second));
        assert_eq!(orchestrator.state(), RebuildState::Request);
        assert!(rig.queues.is_requesting_backup(&second));
        assert!(!rig.queues.is_requesting_backup(&first));
        assert!(orchestrator.take_rebuilt().is_empty());
    }

    #[test]
    fn test_cancel_current_backup_moves_on() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        let backup = test_backup();
        rig.mark_remote(
            &backup,
            0,
            &[
                ((0, FragmentKind::Data), FragmentState::Present),
                ((1, FragmentKind::Data), FragmentState::Missing),
            ],
        );

        let mut orchestrator = RebuildOrchestrator::new(EccMap::new(2).unwrap());
        orchestrator.add_backup(backup.clone());
        orchestrator.start(&mut rig.deps());
        assert_eq!(orchestrator.state(), RebuildState::Request);

        orchestrator.cancel_backup(&mut rig.deps(), &backup);
        assert_eq!(orchestrator.state(), RebuildState::Done);
        assert_eq!(orchestrator.current_backup(), None);
        assert!(!rig.queues.is_requesting_backup(&backup));
        assert!(!orchestrator.is_queued(&backup));
    }

    #[test]
    fn test_stale_task_result_is_ignored() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        let mut orchestrator = RebuildOrchestrator::new(EccMap::new(2).unwrap());
        let output = orchestrator.on_task_result(&mut rig.deps(), 42, 0, true, true);
        assert_eq!(output, RebuildOutput::default());
        assert_eq!(orchestrator.state(), RebuildState::Stopped);
    }

    #[test]
    fn test_stop_while_requesting() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        let backup = test_backup();
        rig.mark_remote(
            &backup,
            0,
            &[
                ((0, FragmentKind::Data), FragmentState::Present),
                ((1, FragmentKind::Data), FragmentState::Missing),
            ],
        );

        let mut orchestrator = RebuildOrchestrator::new(EccMap::new(2).unwrap());
        orchestrator.add_backup(backup.clone());
        orchestrator.start(&mut rig.deps());
        assert_eq!(orchestrator.state(), RebuildState::Request);

        orchestrator.request_stop();
        orchestrator.on_timer(&mut rig.deps());
        assert_eq!(orchestrator.state(), RebuildState::Stopped);
        assert!(!rig.queues.is_requesting_backup(&backup));
    }
}
