//! Fragment availability matrices.
//!
//! Two views of every backup are tracked side by side. The remote matrix
//! records, per backup, block, kind and supplier slot, whether a fragment
//! is confirmed on that supplier (`Present`), reported absent (`Missing`),
//! or simply unreported (`Unknown`). The local matrix records which
//! fragments sit on our own disk. Comparing the two drives every repair
//! decision: what to request, what to send, and what is safe to delete.
//!
//! All mutation happens on the engine's event loop thread, so the matrix
//! itself carries no locks.

pub mod listing;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::mem;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, VersionInfo};
use crate::fragment::{
    BackupId, BlockIndex, FragmentId, FragmentKind, FragmentState, SupplierSlot,
};
use crate::suppliers::SupplierDirectory;

use self::listing::{
    customer_for_alias, parse_listing, ListingLine, INDEX_FILE_NAME, MASTER_KEY_ALIAS,
};

/// Remote knowledge about one block: one state cell per slot and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BlockStates {
    data: Vec<FragmentState>,
    parity: Vec<FragmentState>,
}

impl BlockStates {
    fn new(suppliers: usize) -> Self {
        Self {
            data: vec![FragmentState::Unknown; suppliers],
            parity: vec![FragmentState::Unknown; suppliers],
        }
    }

    fn of(&self, kind: FragmentKind) -> &[FragmentState] {
        match kind {
            FragmentKind::Data => &self.data,
            FragmentKind::Parity => &self.parity,
        }
    }

    fn of_mut(&mut self, kind: FragmentKind) -> &mut [FragmentState] {
        match kind {
            FragmentKind::Data => &mut self.data,
            FragmentKind::Parity => &mut self.parity,
        }
    }
}

/// Which of one block's fragments sit on our own disk.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LocalBlock {
    data: Vec<bool>,
    parity: Vec<bool>,
}

impl LocalBlock {
    fn new(suppliers: usize) -> Self {
        Self {
            data: vec![false; suppliers],
            parity: vec![false; suppliers],
        }
    }

    fn of(&self, kind: FragmentKind) -> &[bool] {
        match kind {
            FragmentKind::Data => &self.data,
            FragmentKind::Parity => &self.parity,
        }
    }

    fn of_mut(&mut self, kind: FragmentKind) -> &mut [bool] {
        match kind {
            FragmentKind::Data => &mut self.data,
            FragmentKind::Parity => &mut self.parity,
        }
    }
}

/// Collapsed presence view of one block, the form every erasure-code
/// decision consumes. Remote tri-state cells collapse to booleans here:
/// only `Present` counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPresence {
    pub remote_data: Vec<bool>,
    pub remote_parity: Vec<bool>,
    pub local_data: Vec<bool>,
    pub local_parity: Vec<bool>,
}

/// Outcome of ingesting one supplier listing.
#[derive(Debug, Default, Clone)]
pub struct IngestReport {
    /// Whether the matrix or the catalog actually changed.
    pub changed: bool,
    /// Fragments the listing confirmed as present.
    pub new_fragments: usize,
    /// Backups the supplier holds but should not: stale slot number or no
    /// longer in the catalog.
    pub backups_to_remove: BTreeSet<BackupId>,
    /// Remote paths (as `"customer:path"`) with no catalog entry left.
    pub paths_to_remove: BTreeSet<String>,
    /// Backups already tracked before this report that the listing did not
    /// fully cover. Candidates for a follow-up request.
    pub missed_backups: BTreeSet<BackupId>,
}

/// Remote health summary for one backup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RemoteStats {
    /// Block count, the highest known block number plus one.
    pub blocks: usize,
    /// Share of expected fragments confirmed on active suppliers.
    pub percent: f64,
    /// Block held by the fewest suppliers, `None` when every block is
    /// fully covered.
    pub weak_block: Option<BlockIndex>,
    /// Coverage of the weakest block. Losing one block loses the whole
    /// backup, so overall health is bounded by this number.
    pub weak_block_percent: f64,
}

/// Summary of what we hold on disk for one backup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LocalStats {
    pub files: usize,
    pub size: u64,
    pub percent: f64,
    pub max_block: Option<BlockIndex>,
}

/// Process-wide availability bookkeeping: the remote and local matrices
/// plus per-backup accumulators derived from them.
#[derive(Debug)]
pub struct AvailabilityMatrix {
    suppliers: usize,
    remote: HashMap<BackupId, BTreeMap<BlockIndex, BlockStates>>,
    local: HashMap<BackupId, BTreeMap<BlockIndex, LocalBlock>>,
    remote_max_block: HashMap<BackupId, BlockIndex>,
    local_max_block: HashMap<BackupId, BlockIndex>,
    local_size: HashMap<BackupId, u64>,
    dirty: HashSet<BackupId>,
}

impl AvailabilityMatrix {
    pub fn new(suppliers: usize) -> Self {
        Self {
            suppliers,
            remote: HashMap::new(),
            local: HashMap::new(),
            remote_max_block: HashMap::new(),
            local_max_block: HashMap::new(),
            local_size: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    /// Width of every presence row.
    pub fn suppliers(&self) -> usize {
        self.suppliers
    }

    /// Records one remote cell, creating the backup entry lazily. The max
    /// block number only ever grows.
    pub fn record_remote_fragment(
        &mut self,
        backup: &BackupId,
        id: &FragmentId,
        state: FragmentState,
    ) {
        if id.slot >= self.suppliers {
            warn!("Ignoring remote report {}/{}: slot out of range", backup, id);
            return;
        }
        let suppliers = self.suppliers;
        let states = self
            .remote
            .entry(backup.clone())
            .or_default()
            .entry(id.block)
            .or_insert_with(|| BlockStates::new(suppliers));
        states.of_mut(id.kind)[id.slot] = state;
        let max = self.remote_max_block.entry(backup.clone()).or_insert(id.block);
        *max = (*max).max(id.block);
        self.dirty.insert(backup.clone());
    }

    /// Records one local cell and keeps the per-backup size accumulator in
    /// step: `size` is added when a fragment appears and subtracted when
    /// it goes away.
    pub fn record_local_fragment(
        &mut self,
        backup: &BackupId,
        id: &FragmentId,
        present: bool,
        size: u64,
    ) {
        if id.slot >= self.suppliers {
            warn!("Ignoring local report {}/{}: slot out of range", backup, id);
            return;
        }
        let suppliers = self.suppliers;
        let held = self
            .local
            .entry(backup.clone())
            .or_default()
            .entry(id.block)
            .or_insert_with(|| LocalBlock::new(suppliers));
        let cell = &mut held.of_mut(id.kind)[id.slot];
        let was = *cell;
        *cell = present;
        let total = self.local_size.entry(backup.clone()).or_insert(0);
        if present && !was {
            *total += size;
        } else if !present && was {
            *total = total.saturating_sub(size);
        }
        if present {
            let max = self.local_max_block.entry(backup.clone()).or_insert(id.block);
            *max = (*max).max(id.block);
        }
        self.dirty.insert(backup.clone());
    }

    pub fn remote_state(&self, backup: &BackupId, id: &FragmentId) -> FragmentState {
        self.remote
            .get(backup)
            .and_then(|blocks| blocks.get(&id.block))
            .and_then(|states| states.of(id.kind).get(id.slot).copied())
            .unwrap_or_default()
    }

    pub fn local_present(&self, backup: &BackupId, id: &FragmentId) -> bool {
        self.local
            .get(backup)
            .and_then(|blocks| blocks.get(&id.block))
            .and_then(|held| held.of(id.kind).get(id.slot).copied())
            .unwrap_or(false)
    }

    /// Highest block number seen for this backup on either side.
    pub fn known_max_block(&self, backup: &BackupId) -> Option<BlockIndex> {
        self.remote_max_block
            .get(backup)
            .copied()
            .max(self.local_max_block.get(backup).copied())
    }

    /// Bytes of fragments currently held locally for this backup.
    pub fn local_size(&self, backup: &BackupId) -> u64 {
        self.local_size.get(backup).copied().unwrap_or(0)
    }

    /// Every backup either matrix currently tracks.
    pub fn backups(&self) -> BTreeSet<BackupId> {
        self.remote
            .keys()
            .chain(self.local.keys())
            .cloned()
            .collect()
    }

    /// Collapsed presence vectors for one block.
    pub fn block_presence(&self, backup: &BackupId, block: BlockIndex) -> BlockPresence {
        let width = self.suppliers;
        let mut presence = BlockPresence {
            remote_data: vec![false; width],
            remote_parity: vec![false; width],
            local_data: vec![false; width],
            local_parity: vec![false; width],
        };
        if let Some(states) = self.remote.get(backup).and_then(|blocks| blocks.get(&block)) {
            for slot in 0..width {
                presence.remote_data[slot] = states.data[slot].is_present();
                presence.remote_parity[slot] = states.parity[slot].is_present();
            }
        }
        if let Some(held) = self.local.get(backup).and_then(|blocks| blocks.get(&block)) {
            presence.local_data.copy_from_slice(&held.data);
            presence.local_parity.copy_from_slice(&held.parity);
        }
        presence
    }

    /// Parses a supplier's listing and reconciles it against the matrix and
    /// the catalog.
    ///
    /// The supplier's whole column is cleared first (`Present` back to
    /// `Unknown`; explicit `Missing` reports are kept) and re-populated
    /// from the version lines, so anything the supplier stopped mentioning
    /// naturally fades to `Unknown`. Entries missing from the catalog are
    /// queued for deletion only when `is_index_in_sync` is true; a stale
    /// local catalog must never trigger remote cleanup, the supplier's
    /// copy may be the only recovery source left. A version line whose
    /// embedded slot number disagrees with `slot` is dropped and queued
    /// for removal: it is a leftover from an older supplier arrangement.
    pub fn ingest_supplier_report(
        &mut self,
        slot: SupplierSlot,
        raw: &str,
        customer: &str,
        is_index_in_sync: bool,
        catalog: &mut dyn Catalog,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        if slot >= self.suppliers {
            warn!("Ignoring listing for {}: slot {} out of range", customer, slot);
            return report;
        }
        let before = self.column_snapshot(slot, customer);
        report.missed_backups = self
            .remote
            .keys()
            .filter(|backup| backup.belongs_to(customer))
            .cloned()
            .collect();
        let cleared = self.clear_supplier_column(slot, customer);
        let mut catalog_changed = false;
        let mut alias = MASTER_KEY_ALIAS.to_string();
        for line in parse_listing(raw) {
            match line {
                ListingLine::KeyAlias(name) => alias = name,
                ListingLine::File { path, .. } => {
                    if path.trim_matches('/') == INDEX_FILE_NAME {
                        // every supplier keeps a copy of the catalog index
                        continue;
                    }
                    let owner = customer_for_alias(&alias, customer);
                    if catalog.has_path(&owner, &path) {
                        continue;
                    }
                    if is_index_in_sync {
                        report.paths_to_remove.insert(format!("{}:{}", owner, path));
                    } else {
                        debug!(
                            "Keeping unknown file {} from slot {}, catalog not in sync",
                            path, slot
                        );
                    }
                }
                ListingLine::Dir { path } => {
                    let owner = customer_for_alias(&alias, customer);
                    if catalog.has_path(&owner, &path) {
                        continue;
                    }
                    if is_index_in_sync {
                        report.paths_to_remove.insert(format!("{}:{}", owner, path));
                    }
                }
                ListingLine::Version(entry) => {
                    let owner = customer_for_alias(&alias, customer);
                    let backup =
                        BackupId::new(owner.clone(), entry.path_id.clone(), entry.version.clone());
                    if entry.claimed_slot != slot {
                        // stale data from an older supplier arrangement
                        report.backups_to_remove.insert(backup);
                        continue;
                    }
                    if !catalog.has_path(&owner, &entry.path_id) {
                        if is_index_in_sync {
                            report
                                .paths_to_remove
                                .insert(format!("{}:{}", owner, entry.path_id));
                            report.backups_to_remove.insert(backup);
                        }
                        continue;
                    }
                    if !catalog.has_version(&backup) {
                        if is_index_in_sync {
                            report.backups_to_remove.insert(backup);
                        }
                        continue;
                    }
                    for block in 0..=entry.max_block {
                        for kind in FragmentKind::BOTH {
                            let missing = match kind {
                                FragmentKind::Data => entry.missing_data.contains(&block),
                                FragmentKind::Parity => entry.missing_parity.contains(&block),
                            };
                            let state = if missing {
                                FragmentState::Missing
                            } else {
                                report.new_fragments += 1;
                                FragmentState::Present
                            };
                            self.record_remote_fragment(
                                &backup,
                                &FragmentId::new(block, slot, kind),
                                state,
                            );
                        }
                    }
                    if entry.missing_data.is_empty() && entry.missing_parity.is_empty() {
                        report.missed_backups.remove(&backup);
                    }
                    let known = catalog.version_info(&backup);
                    if known.map(|info| (info.max_block, info.size))
                        != Some((Some(entry.max_block), entry.size))
                    {
                        info!(
                            "Updating version info for {}: {} blocks, {} bytes",
                            backup,
                            entry.max_block + 1,
                            entry.size
                        );
                        catalog.set_version_info(
                            &backup,
                            VersionInfo::new(Some(entry.max_block), entry.size),
                        );
                        catalog_changed = true;
                    }
                }
            }
        }
        let after = self.column_snapshot(slot, customer);
        report.changed = catalog_changed || before != after;
        debug!(
            "Ingested listing for {} slot {}: cleared {}, confirmed {}, changed {}",
            customer, slot, cleared, report.new_fragments, report.changed
        );
        report
    }

    /// Resets every `Present` cell in one supplier's column back to
    /// `Unknown` across all backups owned by `customer`. Explicit
    /// `Missing` reports are kept. Returns how many cells were cleared.
    pub fn clear_supplier_column(&mut self, slot: SupplierSlot, customer: &str) -> usize {
        if slot >= self.suppliers {
            return 0;
        }
        let mut cleared = 0;
        for (backup, blocks) in self.remote.iter_mut() {
            if !backup.belongs_to(customer) {
                continue;
            }
            for states in blocks.values_mut() {
                for kind in FragmentKind::BOTH {
                    let cell = &mut states.of_mut(kind)[slot];
                    if cell.is_present() {
                        *cell = FragmentState::Unknown;
                        cleared += 1;
                    }
                }
            }
        }
        cleared
    }

    /// Every backup either matrix currently tracks, in stable order.
    pub fn known_backups(&self) -> Vec<BackupId> {
        let mut all: BTreeSet<BackupId> = self.remote.keys().cloned().collect();
        all.extend(self.local.keys().cloned());
        all.into_iter().collect()
    }

    /// Drops every trace of a backup from both matrices. The engine
    /// separately cancels queued transfers for it.
    pub fn erase_backup(&mut self, backup: &BackupId) {
        self.remote.remove(backup);
        self.local.remove(backup);
        self.remote_max_block.remove(backup);
        self.local_max_block.remove(backup);
        self.local_size.remove(backup);
        self.dirty.insert(backup.clone());
    }

    /// Blocks that still need repair work for this backup. A block counts
    /// as missing when any active supplier's remote cell for it is not
    /// `Present`, for either kind. Offline and unassigned slots are
    /// skipped, there is nobody to ask. With no remote information at all,
    /// every block we hold locally is reported so it gets pushed out.
    pub fn scan_missing_blocks(
        &self,
        backup: &BackupId,
        suppliers: &SupplierDirectory,
    ) -> Vec<BlockIndex> {
        let mut missing = BTreeSet::new();
        match self.remote.get(backup) {
            None => {
                let Some(blocks) = self.local.get(backup) else {
                    return Vec::new();
                };
                let Some(local_max) = self.local_max_block.get(backup).copied() else {
                    return Vec::new();
                };
                for block in 0..=local_max {
                    let Some(held) = blocks.get(&block) else {
                        continue;
                    };
                    for slot in 0..self.suppliers {
                        if !suppliers.is_active(slot) {
                            continue;
                        }
                        if held.data[slot] || held.parity[slot] {
                            missing.insert(block);
                        }
                    }
                }
            }
            Some(blocks) => {
                let Some(max) = self.known_max_block(backup) else {
                    return Vec::new();
                };
                for block in 0..=max {
                    let Some(states) = blocks.get(&block) else {
                        missing.insert(block);
                        continue;
                    };
                    for slot in 0..self.suppliers {
                        if !suppliers.is_active(slot) {
                            continue;
                        }
                        if !states.data[slot].is_present() || !states.parity[slot].is_present() {
                            missing.insert(block);
                        }
                    }
                }
            }
        }
        missing.into_iter().collect()
    }

    /// Fragments held locally but not confirmed on the supplier they
    /// belong to, grouped by slot. Returns an empty map when any slot is
    /// unassigned: with an incomplete supplier list fragment routing is
    /// ambiguous and sending would misplace data.
    pub fn scan_blocks_to_send(
        &self,
        backup: &BackupId,
        suppliers: &SupplierDirectory,
    ) -> HashMap<SupplierSlot, BTreeSet<FragmentId>> {
        let mut by_slot: HashMap<SupplierSlot, BTreeSet<FragmentId>> = HashMap::new();
        if !suppliers.all_assigned() {
            warn!("Found empty supplier slots, skipping send scan for {}", backup);
            return by_slot;
        }
        for slot in 0..self.suppliers {
            by_slot.insert(slot, BTreeSet::new());
        }
        let Some(local_blocks) = self.local.get(backup) else {
            return by_slot;
        };
        let Some(local_max) = self.local_max_block.get(backup).copied() else {
            return by_slot;
        };
        let remote_blocks = self.remote.get(backup);
        for block in 0..=local_max {
            let Some(held) = local_blocks.get(&block) else {
                continue;
            };
            for slot in 0..self.suppliers {
                if !suppliers.is_active(slot) {
                    continue;
                }
                for kind in FragmentKind::BOTH {
                    if !held.of(kind)[slot] {
                        continue;
                    }
                    let confirmed = remote_blocks
                        .and_then(|blocks| blocks.get(&block))
                        .map_or(false, |states| states.of(kind)[slot].is_present());
                    if !confirmed {
                        by_slot
                            .entry(slot)
                            .or_default()
                            .insert(FragmentId::new(block, slot, kind));
                    }
                }
            }
        }
        by_slot
    }

    /// Local fragments that are safe to delete: every supplier slot is
    /// active and every remote cell of their block, both kinds across all
    /// slots, is confirmed `Present`. One uncertain cell anywhere keeps
    /// the whole block's local copies, they may be the only safety net.
    pub fn scan_blocks_to_remove(
        &self,
        backup: &BackupId,
        suppliers: &SupplierDirectory,
    ) -> Vec<FragmentId> {
        let mut removable = Vec::new();
        let (Some(remote_blocks), Some(local_blocks)) =
            (self.remote.get(backup), self.local.get(backup))
        else {
            return removable;
        };
        let Some(local_max) = self.local_max_block.get(backup).copied() else {
            return removable;
        };
        if (0..self.suppliers).any(|slot| !suppliers.is_active(slot)) {
            return removable;
        }
        for block in 0..=local_max {
            let Some(held) = local_blocks.get(&block) else {
                continue;
            };
            let Some(states) = remote_blocks.get(&block) else {
                continue;
            };
            let fully_confirmed = FragmentKind::BOTH
                .iter()
                .all(|kind| states.of(*kind).iter().all(|state| state.is_present()));
            if !fully_confirmed {
                continue;
            }
            for slot in 0..self.suppliers {
                for kind in FragmentKind::BOTH {
                    if held.of(kind)[slot] {
                        removable.push(FragmentId::new(block, slot, kind));
                    }
                }
            }
        }
        removable
    }

    /// Health of one backup as seen by its suppliers. `None` when nothing
    /// is known remotely yet.
    pub fn remote_stats(
        &self,
        backup: &BackupId,
        suppliers: &SupplierDirectory,
    ) -> Option<RemoteStats> {
        let blocks = self.remote.get(backup)?;
        let max = self.known_max_block(backup)?;
        let width = self.suppliers;
        let mut files = 0usize;
        let mut weak_block = None;
        let mut least_suppliers = width;
        for block in 0..=max {
            let Some(states) = blocks.get(&block) else {
                // a block nobody reported bounds the backup at zero
                least_suppliers = 0;
                weak_block = Some(block);
                continue;
            };
            let mut good = width;
            for slot in 0..width {
                if !suppliers.is_active(slot) {
                    good -= 1;
                    continue;
                }
                let data = states.data[slot].is_present();
                let parity = states.parity[slot].is_present();
                if !(data && parity) {
                    good -= 1;
                }
                files += usize::from(data) + usize::from(parity);
            }
            if good < least_suppliers {
                least_suppliers = good;
                weak_block = Some(block);
            }
        }
        let expected = ((max + 1) * width) as f64;
        Some(RemoteStats {
            blocks: max + 1,
            percent: 100.0 * 0.5 * files as f64 / expected,
            weak_block,
            weak_block_percent: 100.0 * least_suppliers as f64 / width as f64,
        })
    }

    /// Summary of the local fragment holdings for one backup.
    pub fn local_stats(&self, backup: &BackupId) -> LocalStats {
        let max_block = self.known_max_block(backup);
        let size = self.local_size(backup);
        let (Some(blocks), Some(max)) = (self.local.get(backup), max_block) else {
            return LocalStats {
                files: 0,
                size,
                percent: 0.0,
                max_block,
            };
        };
        let mut files = 0usize;
        for block in 0..=max {
            let Some(held) = blocks.get(&block) else {
                continue;
            };
            files += held.data.iter().filter(|present| **present).count();
            files += held.parity.iter().filter(|present| **present).count();
        }
        let expected = ((max + 1) * self.suppliers) as f64;
        LocalStats {
            files,
            size,
            percent: 100.0 * 0.5 * files as f64 / expected,
            max_block,
        }
    }

    /// Backups whose availability picture changed since the last call.
    /// Drains the set; the engine turns these into repaint events.
    pub fn take_dirty(&mut self) -> HashSet<BackupId> {
        mem::take(&mut self.dirty)
    }

    fn column_snapshot(
        &self,
        slot: SupplierSlot,
        customer: &str,
    ) -> HashMap<(BackupId, BlockIndex), [FragmentState; 2]> {
        let mut cells = HashMap::new();
        for (backup, blocks) in &self.remote {
            if !backup.belongs_to(customer) {
                continue;
            }
            for (block, states) in blocks {
                cells.insert(
                    (backup.clone(), *block),
                    [states.data[slot], states.parity[slot]],
                );
            }
        }
        cells
    }
}
