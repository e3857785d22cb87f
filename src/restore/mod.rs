//! Block-by-block backup retrieval
//!
//! A restore session works one block at a time: rescan the local fragment
//! store, ask online suppliers for whatever is missing, and as soon as the
//! erasure map says the block is fixable hand it to the raid pool for
//! decoding. The decoded payload goes to the output sink in block order,
//! and the in-band last-block flag ends the session.
//!
//! Reading parity costs the same bandwidth as reading data, so parity is
//! only requested alongside data and only used when data fragments are
//! missing. A session survives a bounded amount of request trouble per
//! block: up to three request rounds, and no more failed fragments than
//! the erasure map can correct. Past either limit it fails permanently.
//!
//! Like the rebuild orchestrator this is a state machine advanced by the
//! engine loop; every entry point leaves it either waiting on requests, on
//! a raid task, or finished.

use std::io::Write;

use tracing::{debug, info, warn};

use bytes::Bytes;

use crate::ecc::EccMap;
use crate::error::Result;
use crate::fragment::{BackupId, BlockIndex, FragmentAddress, FragmentId, FragmentKind};
use crate::matrix::AvailabilityMatrix;
use crate::storage::FragmentStore;
use crate::suppliers::SupplierDirectory;
use crate::transfer::{Enqueued, TransferQueues};
use crate::worker::{RaidTask, RaidWorkerPool, TaskId};

/// Request rounds allowed per block before the session gives up.
const MAX_REQUEST_ROUNDS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    /// Created, not started.
    Run,
    /// Requests queued, nothing received for this block yet.
    Request,
    /// Fragments are arriving for the current block.
    Receiving,
    /// The raid pool is decoding the current block.
    Raid,
    /// Decoded payload is being written out.
    Block,
    Done,
    Failed,
    Aborted,
}

impl RestoreState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreState::Run => "run",
            RestoreState::Request => "request",
            RestoreState::Receiving => "receiving",
            RestoreState::Raid => "raid",
            RestoreState::Block => "block",
            RestoreState::Done => "done",
            RestoreState::Failed => "failed",
            RestoreState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RestoreState::Done | RestoreState::Failed | RestoreState::Aborted
        )
    }
}

/// How a session ended, echoed to whoever asked for the restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Done { bytes_written: u64 },
    Failed { reason: String },
    Aborted,
}

/// Engine-owned collaborators, borrowed for the duration of one event.
pub struct RestoreDeps<'a> {
    pub matrix: &'a mut AvailabilityMatrix,
    pub suppliers: &'a SupplierDirectory,
    pub queues: &'a mut TransferQueues,
    pub pool: &'a mut RaidWorkerPool,
    pub store: &'a FragmentStore,
    /// True while the rebuilder is mid-repair on the same backup; block
    /// cleanup must not pull fragments out from under it.
    pub rebuilding_now: bool,
}

/// Side effects of one event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreOutput {
    /// Fragment requests queued during this event.
    pub requested: usize,
    /// Set exactly once, when the session reaches a terminal state.
    pub finished: Option<RestoreOutcome>,
}

/// One restore of one backup version to one output sink.
pub struct RestoreSession {
    backup: BackupId,
    map: EccMap,
    sink: Box<dyn Write + Send>,
    keep_local_copies: bool,
    /// Opaque tag of whoever asked, echoed in the completion event.
    requester: String,
    state: RestoreState,
    block: BlockIndex,
    on_hand_data: Vec<bool>,
    on_hand_parity: Vec<bool>,
    /// Fragments whose requests failed for the current block.
    request_fails: Vec<FragmentId>,
    /// Request rounds used for the current block, first round included.
    attempts: u32,
    bytes_written: u64,
    pending_task: Option<TaskId>,
}

impl RestoreSession {
    pub fn new(
        backup: BackupId,
        map: EccMap,
        sink: Box<dyn Write + Send>,
        keep_local_copies: bool,
        requester: impl Into<String>,
    ) -> Self {
        let suppliers = map.suppliers();
        Self {
            backup,
            map,
            sink,
            keep_local_copies,
            requester: requester.into(),
            state: RestoreState::Run,
            block: 0,
            on_hand_data: vec![false; suppliers],
            on_hand_parity: vec![false; suppliers],
            request_fails: Vec::new(),
            attempts: 0,
            bytes_written: 0,
            pending_task: None,
        }
    }

    pub fn backup(&self) -> &BackupId {
        &self.backup
    }

    pub fn state(&self) -> RestoreState {
        self.state
    }

    pub fn block(&self) -> BlockIndex {
        self.block
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn requester(&self) -> &str {
        &self.requester
    }

    pub fn pending_task(&self) -> Option<TaskId> {
        self.pending_task
    }

    /// Begins work on block zero. Ignored if already started.
    pub fn start(&mut self, deps: &mut RestoreDeps<'_>) -> RestoreOutput {
        let mut output = RestoreOutput::default();
        if self.state != RestoreState::Run {
            debug!("Restore of {} already started", self.backup);
            return output;
        }
        info!("Restore of {} starting", self.backup);
        self.begin_block(deps, &mut output);
        output
    }

    /// A fragment for this backup landed in the store, either freshly
    /// received or found to already exist. Out-of-block stragglers are
    /// ignored.
    pub fn on_fragment_received(
        &mut self,
        deps: &mut RestoreDeps<'_>,
        id: &FragmentId,
    ) -> RestoreOutput {
        let mut output = RestoreOutput::default();
        if !matches!(self.state, RestoreState::Request | RestoreState::Receiving) {
            return output;
        }
        if id.block != self.block {
            debug!("Ignoring fragment {} while on block {}", id, self.block);
            return output;
        }
        if id.slot >= self.map.suppliers() {
            warn!("Fragment {} slot out of range", id);
            return output;
        }
        match id.kind {
            FragmentKind::Data => self.on_hand_data[id.slot] = true,
            FragmentKind::Parity => self.on_hand_parity[id.slot] = true,
        }
        self.state = RestoreState::Receiving;
        if self.map.fixable(&self.on_hand_data, &self.on_hand_parity) {
            self.enter_raid(deps, &mut output);
        }
        output
    }

    /// A fragment request for this backup failed or timed out.
    pub fn on_request_failed(
        &mut self,
        deps: &mut RestoreDeps<'_>,
        id: &FragmentId,
    ) -> RestoreOutput {
        let mut output = RestoreOutput::default();
        if !matches!(self.state, RestoreState::Request | RestoreState::Receiving) {
            return output;
        }
        if id.block == self.block {
            self.request_fails.push(id.clone());
        }
        if !self.still_correctable() {
            self.fail(deps, &mut output, "too many fragments unavailable");
            return output;
        }
        match self.state {
            RestoreState::Request => {
                if self.attempts >= MAX_REQUEST_ROUNDS {
                    self.fail(deps, &mut output, "request rounds exhausted");
                } else {
                    self.retry_block(deps, &mut output);
                }
            }
            RestoreState::Receiving => {
                // still correctable; only re-request once the queue drained
                if !deps.queues.is_requesting_backup(&self.backup) {
                    self.state = RestoreState::Request;
                    self.retry_block(deps, &mut output);
                }
            }
            _ => {}
        }
        output
    }

    /// Periodic nudge. Recovers a block whose requests all settled without
    /// resolving it one way or the other.
    pub fn on_timer(&mut self, deps: &mut RestoreDeps<'_>) -> RestoreOutput {
        let mut output = RestoreOutput::default();
        if !matches!(self.state, RestoreState::Request | RestoreState::Receiving) {
            return output;
        }
        if self.map.fixable(&self.on_hand_data, &self.on_hand_parity) {
            self.enter_raid(deps, &mut output);
            return output;
        }
        if deps.queues.is_requesting_backup(&self.backup) {
            return output;
        }
        if self.attempts >= MAX_REQUEST_ROUNDS {
            self.fail(deps, &mut output, "request rounds exhausted");
        } else {
            self.state = RestoreState::Request;
            self.retry_block(deps, &mut output);
        }
        output
    }

    /// The raid pool finished decoding the current block.
    pub fn on_raid_result(
        &mut self,
        deps: &mut RestoreDeps<'_>,
        id: TaskId,
        decoded: Result<(Bytes, bool)>,
    ) -> RestoreOutput {
        let mut output = RestoreOutput::default();
        if self.state != RestoreState::Raid || self.pending_task != Some(id) {
            debug!("Stale raid result {} ignored", id);
            return output;
        }
        self.pending_task = None;
        let (payload, last_block) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("Block {} of {} failed to decode: {}", self.block, self.backup, err);
                self.fail(deps, &mut output, "block decode failed");
                return output;
            }
        };
        self.state = RestoreState::Block;
        if let Err(err) = self.sink.write_all(&payload) {
            warn!("Cannot write restored block {}: {}", self.block, err);
            self.fail(deps, &mut output, "output sink error");
            return output;
        }
        self.bytes_written += payload.len() as u64;
        debug!(
            "Block {} of {} restored, {} bytes so far",
            self.block, self.backup, self.bytes_written
        );
        self.cleanup_block(deps);
        if last_block {
            self.finish_done(deps, &mut output);
        } else {
            self.block += 1;
            self.begin_block(deps, &mut output);
        }
        output
    }

    /// Cancels outstanding requests and ends the session as aborted.
    pub fn abort(&mut self, deps: &mut RestoreDeps<'_>) -> RestoreOutput {
        let mut output = RestoreOutput::default();
        if self.state.is_terminal() {
            return output;
        }
        info!("Restore of {} aborted at block {}", self.backup, self.block);
        deps.queues.cancel_backup_requests(Some(&self.backup));
        self.state = RestoreState::Aborted;
        output.finished = Some(RestoreOutcome::Aborted);
        output
    }

    /// Sets up the on-hand arrays for the current block, then either goes
    /// straight to decoding or starts asking suppliers.
    fn begin_block(&mut self, deps: &mut RestoreDeps<'_>, output: &mut RestoreOutput) {
        self.on_hand_data = vec![false; self.map.suppliers()];
        self.on_hand_parity = vec![false; self.map.suppliers()];
        self.request_fails.clear();
        self.attempts = 1;
        self.scan_existing(deps);
        debug!("Starting block {} of {}", self.block, self.backup);
        if self.map.fixable(&self.on_hand_data, &self.on_hand_parity) {
            self.enter_raid(deps, output);
        } else {
            self.state = RestoreState::Request;
            self.request_round(deps, output);
        }
    }

    /// Re-scan and re-request after trouble, burning one request round.
    fn retry_block(&mut self, deps: &mut RestoreDeps<'_>, output: &mut RestoreOutput) {
        self.attempts += 1;
        self.scan_existing(deps);
        if self.map.fixable(&self.on_hand_data, &self.on_hand_parity) {
            self.enter_raid(deps, output);
        } else {
            self.request_round(deps, output);
        }
    }

    /// Marks every fragment of the current block that is already on disk.
    fn scan_existing(&mut self, deps: &RestoreDeps<'_>) {
        for slot in 0..self.map.suppliers() {
            self.on_hand_data[slot] = deps
                .store
                .has_fragment(&self.backup, &FragmentId::data(self.block, slot));
            self.on_hand_parity[slot] = deps
                .store
                .has_fragment(&self.backup, &FragmentId::parity(self.block, slot));
        }
    }

    /// Asks every online supplier for the fragments we do not hold. When
    /// nothing can be asked at all the round counts as failed, which burns
    /// a retry or ends the session.
    fn request_round(&mut self, deps: &mut RestoreDeps<'_>, output: &mut RestoreOutput) {
        let mut wanted = Vec::new();
        for kind in [FragmentKind::Data, FragmentKind::Parity] {
            for slot in 0..self.map.suppliers() {
                let on_hand = match kind {
                    FragmentKind::Data => self.on_hand_data[slot],
                    FragmentKind::Parity => self.on_hand_parity[slot],
                };
                if on_hand {
                    continue;
                }
                if !deps.suppliers.is_assigned(slot) {
                    warn!("No supplier at position {}", slot);
                    continue;
                }
                if !deps.suppliers.is_online(slot) {
                    warn!("Supplier {} is offline", slot);
                    continue;
                }
                wanted.push(FragmentId::new(self.block, slot, kind));
            }
        }
        let mut made = 0;
        let mut already = 0;
        for id in wanted {
            let slot = id.slot;
            let address = FragmentAddress::new(self.backup.clone(), id.clone());
            if deps.queues.has_request(slot, &address) {
                already += 1;
                continue;
            }
            match deps.queues.queue_request(slot, address) {
                Ok(Enqueued::Accepted) => made += 1,
                Ok(Enqueued::AlreadyLocal) => match id.kind {
                    FragmentKind::Data => self.on_hand_data[slot] = true,
                    FragmentKind::Parity => self.on_hand_parity[slot] = true,
                },
                // queue_request never reports Offline; only queue_send does.
                Ok(Enqueued::Offline) => {}
                Ok(Enqueued::Duplicate) => already += 1,
                Err(err) => warn!("Request for {} refused: {}", id, err),
            }
        }
        output.requested += made;
        if made > 0 || already > 0 {
            debug!(
                "Block {}: {} requests queued, {} already pending",
                self.block, made, already
            );
            return;
        }
        // Nobody to ask: every missing fragment sits with an unassigned or
        // offline supplier.
        warn!("No requests possible for block {} of {}", self.block, self.backup);
        if self.attempts >= MAX_REQUEST_ROUNDS {
            self.fail(deps, output, "no suppliers reachable");
        } else {
            self.retry_block(deps, output);
        }
    }

    /// More failed fragments than the erasure map can correct is fatal.
    fn still_correctable(&self) -> bool {
        self.request_fails.len() <= self.map.correctable_errors()
    }

    /// Hands the current block to the raid pool for decoding.
    fn enter_raid(&mut self, deps: &mut RestoreDeps<'_>, output: &mut RestoreOutput) {
        let task = RaidTask::Read {
            backup: self.backup.clone(),
            block: self.block,
            map: self.map.clone(),
        };
        match deps.pool.submit(task) {
            Ok(id) => {
                self.state = RestoreState::Raid;
                self.pending_task = Some(id);
                debug!("Raid task {} decoding block {}", id, self.block);
            }
            Err(err) => {
                warn!("Cannot submit decode of block {}: {}", self.block, err);
                self.fail(deps, output, "worker pool unavailable");
            }
        }
    }

    /// Deletes the block's temporary fragments, or keeps and reports them
    /// when local copies are wanted. Either way the local matrix ends up
    /// telling the truth.
    fn cleanup_block(&mut self, deps: &mut RestoreDeps<'_>) {
        if !self.keep_local_copies && deps.rebuilding_now {
            debug!("Keeping block {} fragments, rebuild in progress", self.block);
            return;
        }
        let mut removed = 0;
        for slot in 0..self.map.suppliers() {
            for kind in [FragmentKind::Data, FragmentKind::Parity] {
                let id = FragmentId::new(self.block, slot, kind);
                let Some(size) = deps.store.fragment_size(&self.backup, &id) else {
                    continue;
                };
                if self.keep_local_copies {
                    deps.matrix.record_local_fragment(&self.backup, &id, true, size);
                    continue;
                }
                match deps.store.delete_fragment(&self.backup, &id) {
                    Ok(true) => {
                        deps.matrix.record_local_fragment(&self.backup, &id, false, size);
                        removed += 1;
                    }
                    Ok(false) => {}
                    Err(err) => warn!("Cannot remove fragment {}: {}", id, err),
                }
            }
        }
        if removed > 0 {
            debug!("Removed {} temporary fragments of block {}", removed, self.block);
        }
    }

    fn finish_done(&mut self, deps: &mut RestoreDeps<'_>, output: &mut RestoreOutput) {
        deps.queues.cancel_backup_requests(Some(&self.backup));
        self.state = RestoreState::Done;
        info!(
            "Restore of {} done, {} blocks, {} bytes",
            self.backup,
            self.block + 1,
            self.bytes_written
        );
        output.finished = Some(RestoreOutcome::Done {
            bytes_written: self.bytes_written,
        });
    }

    fn fail(&mut self, deps: &mut RestoreDeps<'_>, output: &mut RestoreOutput, reason: &str) {
        deps.queues.cancel_backup_requests(Some(&self.backup));
        self.state = RestoreState::Failed;
        warn!(
            "Restore of {} failed at block {}: {}",
            self.backup, self.block, reason
        );
        output.finished = Some(RestoreOutcome::Failed {
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecc::codec;
    use crate::transfer::TransferConfig;
    use crate::worker::{TaskOutput, TaskResult, WorkerConfig};
    use std::fs;
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn test_backup() -> BackupId {
        BackupId::new("alice@node-a", "0/0/1", "F20260101010101AM")
    }

    struct Rig {
        matrix: AvailabilityMatrix,
        suppliers: SupplierDirectory,
        queues: TransferQueues,
        pool: RaidWorkerPool,
        store: FragmentStore,
        results: mpsc::UnboundedReceiver<TaskResult>,
        dir: tempfile::TempDir,
    }

    impl Rig {
        fn new(peers: &[&str]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = FragmentStore::new(dir.path().join("fragments"));
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
                dir,
            }
        }

        fn deps(&mut self) -> RestoreDeps<'_> {
            RestoreDeps {
                matrix: &mut self.matrix,
                suppliers: &self.suppliers,
                queues: &mut self.queues,
                pool: &mut self.pool,
                store: &self.store,
                rebuilding_now: false,
            }
        }

        /// Encodes a block and writes the chosen fragments to the store.
        fn write_block(
            &self,
            backup: &BackupId,
            block: BlockIndex,
            map: &EccMap,
            payload: &[u8],
            last: bool,
            keep: &[FragmentId],
        ) {
            let encoded = codec::encode_block(map, payload, last).unwrap();
            for id in keep {
                assert_eq!(id.block, block);
                let bytes = match id.kind {
                    FragmentKind::Data => &encoded.data[id.slot],
                    FragmentKind::Parity => &encoded.parity[id.slot],
                };
                self.store.write_fragment(backup, id, bytes).unwrap();
            }
        }

        fn all_fragments(block: BlockIndex, suppliers: usize) -> Vec<FragmentId> {
            let mut ids = Vec::new();
            for slot in 0..suppliers {
                ids.push(FragmentId::data(block, slot));
                ids.push(FragmentId::parity(block, slot));
            }
            ids
        }
    }

    fn session_to_file(
        rig: &Rig,
        map: &EccMap,
        keep_local_copies: bool,
    ) -> (RestoreSession, std::path::PathBuf) {
        let path = rig.dir.path().join("restored.bin");
        let file = fs::File::create(&path).unwrap();
        let session = RestoreSession::new(
            test_backup(),
            map.clone(),
            Box::new(file),
            keep_local_copies,
            "test-client",
        );
        (session, path)
    }

    /// Drives the pool until the session settles out of the Raid state.
    async fn pump_raid(rig: &mut Rig, session: &mut RestoreSession) -> RestoreOutput {
        let mut last = RestoreOutput::default();
        while session.state() == RestoreState::Raid {
            let result = rig.results.recv().await.unwrap();
            assert!(rig.pool.settle(result.id, Instant::now()));
            let decoded = result.output.map(|output| match output {
                TaskOutput::BlockRead {
                    payload,
                    last_block,
                } => (payload, last_block),
                other => panic!("unexpected raid output {:?}", other),
            });
            last = session.on_raid_result(&mut rig.deps(), result.id, decoded);
        }
        last
    }

    #[tokio::test]
    async fn test_local_blocks_restore_in_order() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        let map = EccMap::new(2).unwrap();
        let backup = test_backup();
        rig.write_block(&backup, 0, &map, b"first block ", false, &Rig::all_fragments(0, 2));
        rig.write_block(&backup, 1, &map, b"second block", true, &Rig::all_fragments(1, 2));

        let (mut session, path) = session_to_file(&rig, &map, false);
        assert_eq!(session.state(), RestoreState::Run);
        let output = session.start(&mut rig.deps());
        assert_eq!(output.requested, 0);
        assert_eq!(session.state(), RestoreState::Raid);

        let output = pump_raid(&mut rig, &mut session).await;
        assert_eq!(session.state(), RestoreState::Done);
        assert_eq!(
            output.finished,
            Some(RestoreOutcome::Done { bytes_written: 24 })
        );
        assert_eq!(fs::read(&path).unwrap(), b"first block second block");
        // temporary fragments were cleaned up behind the restore
        assert!(!rig.store.has_fragment(&backup, &FragmentId::data(0, 0)));
        assert!(!rig.store.has_fragment(&backup, &FragmentId::data(1, 1)));
    }

    #[test]
    fn test_missing_fragments_are_requested() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        let map = EccMap::new(2).unwrap();
        let backup = test_backup();
        rig.write_block(&backup, 0, &map, b"partial", true, &[FragmentId::data(0, 0)]);

        let (mut session, _path) = session_to_file(&rig, &map, false);
        let output = session.start(&mut rig.deps());

        assert_eq!(session.state(), RestoreState::Request);
        assert_eq!(output.requested, 3);
        for id in [
            FragmentId::data(0, 1),
            FragmentId::parity(0, 0),
            FragmentId::parity(0, 1),
        ] {
            let address = FragmentAddress::new(backup.clone(), id.clone());
            assert!(rig.queues.has_request(id.slot, &address), "missing {}", id);
        }
    }

    #[tokio::test]
    async fn test_arriving_fragment_completes_block() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        let map = EccMap::new(2).unwrap();
        let backup = test_backup();
        let encoded = codec::encode_block(&map, b"needs one more", true).unwrap();
        rig.store
            .write_fragment(&backup, &FragmentId::data(0, 0), &encoded.data[0])
            .unwrap();

        let (mut session, path) = session_to_file(&rig, &map, false);
        session.start(&mut rig.deps());
        assert_eq!(session.state(), RestoreState::Request);

        // the other data fragment arrives, engine wrote it already
        rig.store
            .write_fragment(&backup, &FragmentId::data(0, 1), &encoded.data[1])
            .unwrap();
        let output = session.on_fragment_received(&mut rig.deps(), &FragmentId::data(0, 1));
        assert_eq!(output, RestoreOutput::default());
        assert_eq!(session.state(), RestoreState::Raid);

        let output = pump_raid(&mut rig, &mut session).await;
        assert_eq!(session.state(), RestoreState::Done);
        assert!(matches!(
            output.finished,
            Some(RestoreOutcome::Done { bytes_written: 14 })
        ));
        assert_eq!(fs::read(&path).unwrap(), b"needs one more");
    }

    #[test]
    fn test_fragment_for_other_block_ignored() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        let map = EccMap::new(2).unwrap();
        let (mut session, _path) = session_to_file(&rig, &map, false);
        session.start(&mut rig.deps());
        assert_eq!(session.state(), RestoreState::Request);

        session.on_fragment_received(&mut rig.deps(), &FragmentId::data(7, 0));
        assert_eq!(session.state(), RestoreState::Request);
    }

    #[test]
    fn test_too_many_failures_is_fatal() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        let map = EccMap::new(2).unwrap();
        let backup = test_backup();
        let (mut session, _path) = session_to_file(&rig, &map, false);
        session.start(&mut rig.deps());
        assert_eq!(session.state(), RestoreState::Request);

        // one failed fragment is still correctable with two suppliers
        let output = session.on_request_failed(&mut rig.deps(), &FragmentId::data(0, 0));
        assert!(output.finished.is_none());
        assert_eq!(session.state(), RestoreState::Request);

        let output = session.on_request_failed(&mut rig.deps(), &FragmentId::data(0, 1));
        assert_eq!(session.state(), RestoreState::Failed);
        assert!(matches!(
            output.finished,
            Some(RestoreOutcome::Failed { .. })
        ));
        assert!(!rig.queues.is_requesting_backup(&backup));
    }

    #[test]
    fn test_request_rounds_exhaust() {
        // seven suppliers tolerate three failed fragments, so the round
        // cap trips before the error budget does
        let peers: Vec<String> = (0..7).map(|n| format!("s{}@host", n)).collect();
        let refs: Vec<&str> = peers.iter().map(String::as_str).collect();
        let mut rig = Rig::new(&refs);
        let map = EccMap::new(7).unwrap();
        let (mut session, _path) = session_to_file(&rig, &map, false);
        session.start(&mut rig.deps());

        session.on_request_failed(&mut rig.deps(), &FragmentId::data(0, 0));
        assert_eq!(session.state(), RestoreState::Request);
        session.on_request_failed(&mut rig.deps(), &FragmentId::data(0, 1));
        assert_eq!(session.state(), RestoreState::Request);
        let output = session.on_request_failed(&mut rig.deps(), &FragmentId::data(0, 2));
        assert_eq!(session.state(), RestoreState::Failed);
        assert!(matches!(
            output.finished,
            Some(RestoreOutcome::Failed { .. })
        ));
    }

    #[test]
    fn test_offline_suppliers_leave_nothing_to_ask() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        rig.suppliers.set_online(0, false);
        rig.suppliers.set_online(1, false);
        let map = EccMap::new(2).unwrap();
        let (mut session, _path) = session_to_file(&rig, &map, false);

        let output = session.start(&mut rig.deps());
        // three rounds of nothing-to-ask end the session
        assert_eq!(session.state(), RestoreState::Failed);
        assert_eq!(output.requested, 0);
        assert!(matches!(
            output.finished,
            Some(RestoreOutcome::Failed { .. })
        ));
    }

    #[test]
    fn test_abort_cancels_requests() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        let map = EccMap::new(2).unwrap();
        let backup = test_backup();
        let (mut session, _path) = session_to_file(&rig, &map, false);
        session.start(&mut rig.deps());
        assert!(rig.queues.is_requesting_backup(&backup));

        let output = session.abort(&mut rig.deps());
        assert_eq!(session.state(), RestoreState::Aborted);
        assert_eq!(output.finished, Some(RestoreOutcome::Aborted));
        assert!(!rig.queues.is_requesting_backup(&backup));

        // terminal states stay put
        let output = session.abort(&mut rig.deps());
        assert!(output.finished.is_none());
    }

    #[tokio::test]
    async fn test_keep_local_copies_feeds_the_matrix() {
        let mut rig = Rig::new(&["a@1", "b@2"]);
        let map = EccMap::new(2).unwrap();
        let backup = test_backup();
        let ids = Rig::all_fragments(0, 2);
        rig.write_block(&backup, 0, &map, b"kept around", true, &ids);

        let (mut session, _path) = session_to_file(&rig, &map, true);
        session.start(&mut rig.deps());
        pump_raid(&mut rig, &mut session).await;

        assert_eq!(session.state(), RestoreState::Done);
        for id in &ids {
            assert!(rig.store.has_fragment(&backup, id));
            assert!(rig.matrix.local_present(&backup, id));
        }
        assert!(rig.matrix.local_size(&backup) > 0);
    }
}
