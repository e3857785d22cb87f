//! Per-supplier transfer queues
//!
//! Every supplier slot gets a send queue and a request queue. Entries wait
//! in arrival order; periodic ticks dispatch as many as the configured
//! windows allow and turn finished entries into [`TransferEvent`]s. Every
//! accepted entry produces exactly one terminal event, including on
//! shutdown and backup erasure.
//!
//! The queues own no sockets and spawn nothing. [`TransferQueues::tick`]
//! returns dispatch instructions; the engine resolves peers, drives the
//! [`Transport`] and feeds settled outcomes back through
//! [`TransferQueues::on_send_outcome`] and
//! [`TransferQueues::on_fetch_outcome`]. Keeping the queues synchronous
//! makes the dispatch rules testable with nothing but an `Instant`.
//!
//! Tick pacing is adaptive: a productive tick snaps the per-slot interval
//! to its floor, an idle one doubles it toward the ceiling.

pub mod transport;

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fragment::{BackupId, FragmentAddress, SupplierSlot};
use crate::storage::FragmentStore;

pub use transport::{FetchOutcome, TransferOutcome, Transport};

/// Tunables for the queue pair of every supplier slot.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// How many sends may be in flight per supplier at once.
    pub send_window: usize,
    /// How many requests may be in flight per supplier at once.
    pub request_window: usize,
    /// Sends larger than this wait for a free window slot. Smaller ones
    /// dispatch immediately so bulk uploads cannot starve them.
    pub big_file_threshold: u64,
    /// Assumed upload rate for send timeouts, bytes per second.
    pub send_speed: u64,
    /// Assumed download rate for request timeouts, bytes per second.
    pub request_speed: u64,
    /// Expected fragment size, sizes the request timeout.
    pub block_size_hint: u64,
    /// Upper bound for a single send attempt.
    pub max_send_timeout: Duration,
    /// Wire-level delivery failures tolerated per entry before it is
    /// dropped as undeliverable.
    pub retry_budget: u32,
    /// Send tick interval bounds.
    pub min_send_delay: Duration,
    pub max_send_delay: Duration,
    /// Request tick interval bounds.
    pub min_request_delay: Duration,
    pub max_request_delay: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            send_window: 4,
            request_window: 2,
            big_file_threshold: 10 * 1024,
            send_speed: 3 * 1024,
            request_speed: 3 * 1024,
            block_size_hint: 4 * 1024 * 1024,
            max_send_timeout: Duration::from_secs(3600),
            retry_budget: 2,
            min_send_delay: Duration::from_millis(10),
            max_send_delay: Duration::from_secs(4),
            min_request_delay: Duration::from_millis(50),
            max_request_delay: Duration::from_secs(4),
        }
    }
}

/// Why a queued transfer ended without success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// The supplier answered with an explicit rejection.
    Rejected(String),
    /// No answer within the timeout window.
    Timeout,
    /// Wire-level delivery failures exhausted the retry budget.
    Undelivered,
    /// The supplier is offline. Not counted against any retry budget;
    /// the next send sweep re-queues the fragment once it is back.
    Offline,
    /// The local fragment file disappeared before dispatch.
    FileGone,
    /// The backup was erased while the transfer was queued.
    Canceled,
    /// The queues were shut down.
    Shutdown,
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::Rejected(reason) => write!(f, "rejected: {}", reason),
            FailReason::Timeout => write!(f, "timeout"),
            FailReason::Undelivered => write!(f, "undelivered"),
            FailReason::Offline => write!(f, "supplier offline"),
            FailReason::FileGone => write!(f, "file gone"),
            FailReason::Canceled => write!(f, "canceled"),
            FailReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Terminal notification for one queued transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// The supplier confirmed it holds the fragment.
    SendAcked {
        slot: SupplierSlot,
        address: FragmentAddress,
    },
    SendFailed {
        slot: SupplierSlot,
        address: FragmentAddress,
        reason: FailReason,
    },
    /// A requested fragment arrived. The payload has not been written to
    /// disk yet; that is the caller's job.
    RequestReceived {
        slot: SupplierSlot,
        address: FragmentAddress,
        payload: Bytes,
    },
    /// A queued request found its fragment already on disk at dispatch
    /// time, so nothing was sent.
    RequestExists {
        slot: SupplierSlot,
        address: FragmentAddress,
    },
    RequestFailed {
        slot: SupplierSlot,
        address: FragmentAddress,
        reason: FailReason,
    },
}

/// One transfer the engine must now hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Send {
        slot: SupplierSlot,
        address: FragmentAddress,
        file: PathBuf,
        timeout: Duration,
    },
    Request {
        slot: SupplierSlot,
        address: FragmentAddress,
        timeout: Duration,
    },
}

/// What `queue_send` / `queue_request` did with a new entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Accepted; it will be dispatched when a window slot frees up.
    Accepted,
    /// The same fragment is already queued for this supplier.
    Duplicate,
    /// Requests only: the fragment is already on disk, nothing to do.
    AlreadyLocal,
    /// Sends only: the supplier is offline, so the entry was refused
    /// instead of queued.
    Offline,
}

/// Everything one tick produced.
#[derive(Debug, Default)]
pub struct TickOutput {
    pub dispatches: Vec<Dispatch>,
    pub events: Vec<TransferEvent>,
}

#[derive(Debug)]
struct SendEntry {
    address: FragmentAddress,
    file: PathBuf,
    size: u64,
    timeout: Duration,
    dispatched_at: Option<Instant>,
    delivery_failed: bool,
    attempts: u32,
}

#[derive(Debug)]
struct RequestEntry {
    address: FragmentAddress,
    timeout: Duration,
    dispatched_at: Option<Instant>,
    delivery_failed: bool,
    attempts: u32,
}

#[derive(Debug)]
struct SupplierQueue {
    send: Vec<SendEntry>,
    request: Vec<RequestEntry>,
    send_delay: Duration,
    request_delay: Duration,
    /// `None` means the side should run on the next poll.
    send_due: Option<Instant>,
    request_due: Option<Instant>,
}

impl SupplierQueue {
    fn new(config: &TransferConfig) -> Self {
        Self {
            send: Vec::new(),
            request: Vec::new(),
            send_delay: config.min_send_delay,
            request_delay: config.min_request_delay,
            send_due: None,
            request_due: None,
        }
    }
}

enum Settled {
    Exists,
    Failed(FailReason),
}

/// Send and request queues for every supplier slot of one customer.
pub struct TransferQueues {
    config: TransferConfig,
    store: FragmentStore,
    slots: Vec<SupplierQueue>,
    shutdown: bool,
}

impl TransferQueues {
    pub fn new(suppliers: usize, store: FragmentStore, config: TransferConfig) -> Self {
        let slots = (0..suppliers).map(|_| SupplierQueue::new(&config)).collect();
        Self {
            config,
            store,
            slots,
            shutdown: false,
        }
    }

    pub fn supplier_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown
    }

    /// Queue one fragment for upload to `slot`. The file must already sit
    /// in the local store; if it vanishes before dispatch the entry fails
    /// with [`FailReason::FileGone`]. An offline supplier is refused at
    /// enqueue time with [`Enqueued::Offline`]; nothing waits for it.
    pub fn queue_send(
        &mut self,
        slot: SupplierSlot,
        address: FragmentAddress,
        online: bool,
    ) -> Result<Enqueued> {
        if self.shutdown {
            return Err(Error::TransferShutdown);
        }
        if !online {
            debug!("supplier {} offline, refusing send of {}", slot, address);
            return Ok(Enqueued::Offline);
        }
        let file = self.store.fragment_path(&address.backup, &address.id);
        let size = self
            .store
            .fragment_size(&address.backup, &address.id)
            .unwrap_or(0);
        let timeout = send_timeout(size, &self.config);
        let Some(queue) = self.slots.get_mut(slot) else {
            return Err(Error::Internal(format!("no supplier slot {}", slot)));
        };
        if queue.send.iter().any(|entry| entry.address == address) {
            return Ok(Enqueued::Duplicate);
        }
        debug!("queue send {} to supplier {}, {} bytes", address, slot, size);
        queue.send.push(SendEntry {
            address,
            file,
            size,
            timeout,
            dispatched_at: None,
            delivery_failed: false,
            attempts: 0,
        });
        self.poke_send(slot);
        Ok(Enqueued::Accepted)
    }

    /// Queue one fragment for download from `slot`. Short-circuits with
    /// [`Enqueued::AlreadyLocal`] when the fragment is already on disk.
    pub fn queue_request(
        &mut self,
        slot: SupplierSlot,
        address: FragmentAddress,
    ) -> Result<Enqueued> {
        if self.shutdown {
            return Err(Error::TransferShutdown);
        }
        if self.store.has_fragment(&address.backup, &address.id) {
            return Ok(Enqueued::AlreadyLocal);
        }
        let timeout = request_timeout(&self.config);
        let Some(queue) = self.slots.get_mut(slot) else {
            return Err(Error::Internal(format!("no supplier slot {}", slot)));
        };
        if queue.request.iter().any(|entry| entry.address == address) {
            return Ok(Enqueued::Duplicate);
        }
        debug!("queue request {} from supplier {}", address, slot);
        queue.request.push(RequestEntry {
            address,
            timeout,
            dispatched_at: None,
            delivery_failed: false,
            attempts: 0,
        });
        self.poke_request(slot);
        Ok(Enqueued::Accepted)
    }

    /// Producers call this before queueing more sends; it bounds the queue
    /// length, not the in-flight count.
    pub fn ok_to_send(&self, slot: SupplierSlot) -> bool {
        self.slots
            .get(slot)
            .map(|queue| queue.send.len() < self.config.send_window)
            .unwrap_or(false)
    }

    pub fn ok_to_request(&self, slot: SupplierSlot) -> bool {
        self.slots
            .get(slot)
            .map(|queue| queue.request.len() < self.config.request_window)
            .unwrap_or(false)
    }

    pub fn send_queue_len(&self, slot: SupplierSlot) -> usize {
        self.slots.get(slot).map(|queue| queue.send.len()).unwrap_or(0)
    }

    pub fn request_queue_len(&self, slot: SupplierSlot) -> usize {
        self.slots
            .get(slot)
            .map(|queue| queue.request.len())
            .unwrap_or(0)
    }

    pub fn has_send(&self, slot: SupplierSlot, address: &FragmentAddress) -> bool {
        self.slots
            .get(slot)
            .map(|queue| queue.send.iter().any(|entry| entry.address == *address))
            .unwrap_or(false)
    }

    pub fn has_request(&self, slot: SupplierSlot, address: &FragmentAddress) -> bool {
        self.slots
            .get(slot)
            .map(|queue| queue.request.iter().any(|entry| entry.address == *address))
            .unwrap_or(false)
    }

    /// True while any slot still has a queued send for this backup. The
    /// compaction sweep refuses to delete local fragments it has not
    /// finished uploading.
    pub fn is_sending_backup(&self, backup: &BackupId) -> bool {
        self.slots.iter().any(|queue| {
            queue
                .send
                .iter()
                .any(|entry| entry.address.backup == *backup)
        })
    }

    /// True while any slot still has a queued request for this backup. The
    /// rebuilder waits on this before deciding a request pass went nowhere.
    pub fn is_requesting_backup(&self, backup: &BackupId) -> bool {
        self.slots.iter().any(|queue| {
            queue
                .request
                .iter()
                .any(|entry| entry.address.backup == *backup)
        })
    }

    /// Earliest instant any non-empty queue side wants its next tick.
    /// `None` means every queue is empty and no wakeup is needed.
    pub fn next_due(&self, now: Instant) -> Option<Instant> {
        if self.shutdown {
            return None;
        }
        let mut earliest: Option<Instant> = None;
        for queue in &self.slots {
            if !queue.send.is_empty() {
                let due = queue.send_due.unwrap_or(now).max(now);
                earliest = Some(earliest.map_or(due, |e| e.min(due)));
            }
            if !queue.request.is_empty() {
                let due = queue.request_due.unwrap_or(now).max(now);
                earliest = Some(earliest.map_or(due, |e| e.min(due)));
            }
        }
        earliest
    }

    /// Run every queue side that is due. Returns the dispatches the engine
    /// must hand to the transport plus terminal events for entries that
    /// settled without dispatch.
    pub fn tick(&mut self, now: Instant) -> TickOutput {
        let mut output = TickOutput::default();
        if self.shutdown {
            return output;
        }
        for slot in 0..self.slots.len() {
            let send_due = {
                let queue = &self.slots[slot];
                !queue.send.is_empty() && queue.send_due.map_or(true, |due| due <= now)
            };
            if send_due {
                let productive = Self::run_send(
                    &mut self.slots[slot],
                    slot,
                    &self.store,
                    &self.config,
                    now,
                    &mut output,
                );
                let queue = &mut self.slots[slot];
                queue.send_delay = loop_attenuation(
                    queue.send_delay,
                    productive,
                    self.config.min_send_delay,
                    self.config.max_send_delay,
                );
                queue.send_due = Some(now + queue.send_delay);
            }
            let request_due = {
                let queue = &self.slots[slot];
                !queue.request.is_empty() && queue.request_due.map_or(true, |due| due <= now)
            };
            if request_due {
                let productive = Self::run_request(
                    &mut self.slots[slot],
                    slot,
                    &self.store,
                    &self.config,
                    now,
                    &mut output,
                );
                let queue = &mut self.slots[slot];
                queue.request_delay = loop_attenuation(
                    queue.request_delay,
                    productive,
                    self.config.min_request_delay,
                    self.config.max_request_delay,
                );
                queue.request_due = Some(now + queue.request_delay);
            }
        }
        output
    }

    /// One pass over a send queue: retry or drop entries the wire could
    /// not deliver, time out stale dispatches, drop entries whose file is
    /// gone, then dispatch whatever the window allows.
    fn run_send(
        queue: &mut SupplierQueue,
        slot: SupplierSlot,
        store: &FragmentStore,
        config: &TransferConfig,
        now: Instant,
        output: &mut TickOutput,
    ) -> bool {
        let mut failed: Vec<(usize, FailReason)> = Vec::new();
        let mut in_flight = 0usize;
        let mut sent = 0usize;

        for (index, entry) in queue.send.iter_mut().enumerate() {
            if entry.delivery_failed {
                entry.delivery_failed = false;
                if entry.attempts > config.retry_budget {
                    failed.push((index, FailReason::Undelivered));
                    continue;
                }
                debug!(
                    "redispatching undelivered {} to supplier {}, attempt {}",
                    entry.address,
                    slot,
                    entry.attempts + 1
                );
                entry.dispatched_at = None;
            }
            if let Some(at) = entry.dispatched_at {
                if now.duration_since(at) > entry.timeout {
                    failed.push((index, FailReason::Timeout));
                } else {
                    in_flight += 1;
                }
                continue;
            }
            if !store.has_fragment(&entry.address.backup, &entry.address.id) {
                failed.push((index, FailReason::FileGone));
                continue;
            }
            if in_flight >= config.send_window && entry.size > config.big_file_threshold {
                // big files wait for a free window slot, small ones go through
                continue;
            }
            entry.dispatched_at = Some(now);
            entry.attempts += 1;
            in_flight += 1;
            sent += 1;
            output.dispatches.push(Dispatch::Send {
                slot,
                address: entry.address.clone(),
                file: entry.file.clone(),
                timeout: entry.timeout,
            });
        }

        let removed = failed.len();
        for (index, reason) in failed.into_iter().rev() {
            let entry = queue.send.remove(index);
            warn!("send of {} to supplier {} failed: {}", entry.address, slot, reason);
            output.events.push(TransferEvent::SendFailed {
                slot,
                address: entry.address,
                reason,
            });
        }
        sent.max(removed) > 0
    }

    /// One pass over a request queue. Only the first `request_window`
    /// entries are looked at; the rest wait their turn entirely.
    fn run_request(
        queue: &mut SupplierQueue,
        slot: SupplierSlot,
        store: &FragmentStore,
        config: &TransferConfig,
        now: Instant,
        output: &mut TickOutput,
    ) -> bool {
        let mut done: Vec<(usize, Settled)> = Vec::new();
        let mut requested = 0usize;

        let window = config.request_window.min(queue.request.len());
        for (index, entry) in queue.request.iter_mut().take(window).enumerate() {
            if entry.delivery_failed {
                entry.delivery_failed = false;
                if entry.attempts > config.retry_budget {
                    done.push((index, Settled::Failed(FailReason::Undelivered)));
                    continue;
                }
                entry.dispatched_at = None;
            }
            if let Some(at) = entry.dispatched_at {
                if now.duration_since(at) > entry.timeout {
                    done.push((index, Settled::Failed(FailReason::Timeout)));
                }
                continue;
            }
            if store.has_fragment(&entry.address.backup, &entry.address.id) {
                done.push((index, Settled::Exists));
                continue;
            }
            entry.dispatched_at = Some(now);
            entry.attempts += 1;
            requested += 1;
            output.dispatches.push(Dispatch::Request {
                slot,
                address: entry.address.clone(),
                timeout: entry.timeout,
            });
        }

        let removed = done.len();
        for (index, settled) in done.into_iter().rev() {
            let entry = queue.request.remove(index);
            match settled {
                Settled::Exists => {
                    debug!("request {} already satisfied on disk", entry.address);
                    output.events.push(TransferEvent::RequestExists {
                        slot,
                        address: entry.address,
                    });
                }
                Settled::Failed(reason) => {
                    warn!(
                        "request of {} from supplier {} failed: {}",
                        entry.address, slot, reason
                    );
                    output.events.push(TransferEvent::RequestFailed {
                        slot,
                        address: entry.address,
                        reason,
                    });
                }
            }
        }
        requested.max(removed) > 0
    }

    /// Settle one send with the transport's answer. Returns the terminal
    /// event, or `None` when the entry is no longer queued (already timed
    /// out, canceled or shut down) so late answers cannot double-report.
    pub fn on_send_outcome(
        &mut self,
        slot: SupplierSlot,
        address: &FragmentAddress,
        outcome: TransferOutcome,
    ) -> Option<TransferEvent> {
        let queue = self.slots.get_mut(slot)?;
        let index = queue
            .send
            .iter()
            .position(|entry| entry.address == *address)?;
        let entry = queue.send.remove(index);
        let event = match outcome {
            TransferOutcome::Delivered => {
                debug!("supplier {} acked {}", slot, entry.address);
                TransferEvent::SendAcked {
                    slot,
                    address: entry.address,
                }
            }
            TransferOutcome::Failed(reason) => {
                warn!("supplier {} rejected {}: {}", slot, entry.address, reason);
                TransferEvent::SendFailed {
                    slot,
                    address: entry.address,
                    reason: FailReason::Rejected(reason),
                }
            }
            TransferOutcome::Timeout => {
                warn!("send of {} to supplier {} timed out", entry.address, slot);
                TransferEvent::SendFailed {
                    slot,
                    address: entry.address,
                    reason: FailReason::Timeout,
                }
            }
        };
        self.poke_send(slot);
        Some(event)
    }

    /// Settle one request with the transport's answer.
    pub fn on_fetch_outcome(
        &mut self,
        slot: SupplierSlot,
        address: &FragmentAddress,
        outcome: FetchOutcome,
    ) -> Option<TransferEvent> {
        let queue = self.slots.get_mut(slot)?;
        let index = queue
            .request
            .iter()
            .position(|entry| entry.address == *address)?;
        let entry = queue.request.remove(index);
        let event = match outcome {
            FetchOutcome::Received(payload) => {
                debug!(
                    "supplier {} returned {}, {} bytes",
                    slot,
                    entry.address,
                    payload.len()
                );
                TransferEvent::RequestReceived {
                    slot,
                    address: entry.address,
                    payload,
                }
            }
            FetchOutcome::Failed(reason) => {
                warn!("supplier {} refused {}: {}", slot, entry.address, reason);
                TransferEvent::RequestFailed {
                    slot,
                    address: entry.address,
                    reason: FailReason::Rejected(reason),
                }
            }
            FetchOutcome::Timeout => {
                warn!(
                    "request of {} from supplier {} timed out",
                    entry.address, slot
                );
                TransferEvent::RequestFailed {
                    slot,
                    address: entry.address,
                    reason: FailReason::Timeout,
                }
            }
        };
        self.poke_request(slot);
        Some(event)
    }

    /// Drop one queued send whose supplier turned out to be offline at
    /// dispatch time, failing it with [`FailReason::Offline`]. Returns
    /// the terminal event, or `None` when the entry already settled.
    pub fn on_send_supplier_offline(
        &mut self,
        slot: SupplierSlot,
        address: &FragmentAddress,
    ) -> Option<TransferEvent> {
        let queue = self.slots.get_mut(slot)?;
        let index = queue
            .send
            .iter()
            .position(|entry| entry.address == *address)?;
        let entry = queue.send.remove(index);
        warn!("supplier {} offline, dropping send of {}", slot, entry.address);
        Some(TransferEvent::SendFailed {
            slot,
            address: entry.address,
            reason: FailReason::Offline,
        })
    }

    /// Wire-level report that a send packet left (or failed to leave) this
    /// node. Failures mark the entry for redispatch on the next tick.
    pub fn on_send_delivery_report(
        &mut self,
        slot: SupplierSlot,
        address: &FragmentAddress,
        delivered: bool,
    ) {
        if delivered {
            return;
        }
        let Some(queue) = self.slots.get_mut(slot) else {
            return;
        };
        let marked = match queue
            .send
            .iter_mut()
            .find(|entry| entry.address == *address)
        {
            Some(entry) => {
                entry.delivery_failed = true;
                true
            }
            None => false,
        };
        if marked {
            debug!("delivery of {} to supplier {} failed on the wire", address, slot);
            self.poke_send(slot);
        }
    }

    /// Same as [`Self::on_send_delivery_report`] for outgoing requests.
    pub fn on_request_delivery_report(
        &mut self,
        slot: SupplierSlot,
        address: &FragmentAddress,
        delivered: bool,
    ) {
        if delivered {
            return;
        }
        let Some(queue) = self.slots.get_mut(slot) else {
            return;
        };
        let marked = match queue
            .request
            .iter_mut()
            .find(|entry| entry.address == *address)
        {
            Some(entry) => {
                entry.delivery_failed = true;
                true
            }
            None => false,
        };
        if marked {
            debug!(
                "delivery of request {} to supplier {} failed on the wire",
                address, slot
            );
            self.poke_request(slot);
        }
    }

    /// Drop queued sends, failing each with [`FailReason::Canceled`].
    /// `None` cancels everything.
    pub fn cancel_backup_sends(&mut self, backup: Option<&BackupId>) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        for (slot, queue) in self.slots.iter_mut().enumerate() {
            let mut index = 0;
            while index < queue.send.len() {
                if backup.map_or(true, |b| queue.send[index].address.backup == *b) {
                    let entry = queue.send.remove(index);
                    events.push(TransferEvent::SendFailed {
                        slot,
                        address: entry.address,
                        reason: FailReason::Canceled,
                    });
                } else {
                    index += 1;
                }
            }
        }
        if !events.is_empty() {
            debug!("canceled {} queued sends", events.len());
        }
        events
    }

    /// Drop queued requests silently; only the canceling caller cares.
    /// `None` cancels everything. Returns how many entries were dropped.
    pub fn cancel_backup_requests(&mut self, backup: Option<&BackupId>) -> usize {
        let mut dropped = 0;
        for queue in self.slots.iter_mut() {
            let before = queue.request.len();
            queue
                .request
                .retain(|entry| backup.is_some_and(|b| entry.address.backup != *b));
            dropped += before - queue.request.len();
        }
        if dropped > 0 {
            debug!("canceled {} queued requests", dropped);
        }
        dropped
    }

    /// Fail every queued entry out with [`FailReason::Shutdown`] and
    /// refuse all further work. Idempotent.
    pub fn shutdown(&mut self) -> Vec<TransferEvent> {
        if self.shutdown {
            return Vec::new();
        }
        self.shutdown = true;
        let mut events = Vec::new();
        for (slot, queue) in self.slots.iter_mut().enumerate() {
            for entry in queue.send.drain(..) {
                events.push(TransferEvent::SendFailed {
                    slot,
                    address: entry.address,
                    reason: FailReason::Shutdown,
                });
            }
            for entry in queue.request.drain(..) {
                events.push(TransferEvent::RequestFailed {
                    slot,
                    address: entry.address,
                    reason: FailReason::Shutdown,
                });
            }
        }
        info!("transfer queues shut down, {} entries failed out", events.len());
        events
    }

    /// Ask for an early next tick when the current interval has grown
    /// long. Short intervals are left to fire naturally.
    fn poke_send(&mut self, slot: SupplierSlot) {
        if let Some(queue) = self.slots.get_mut(slot) {
            if queue.send_delay > Duration::from_secs(1) {
                queue.send_due = None;
            }
        }
    }

    fn poke_request(&mut self, slot: SupplierSlot) {
        if let Some(queue) = self.slots.get_mut(slot) {
            if queue.request_delay > Duration::from_secs(1) {
                queue.request_due = None;
            }
        }
    }
}

/// Adaptive poll interval: snap to the floor after a productive pass,
/// double toward the ceiling while idle.
pub fn loop_attenuation(
    current: Duration,
    productive: bool,
    floor: Duration,
    ceiling: Duration,
) -> Duration {
    if productive {
        floor
    } else if current < ceiling {
        (current * 2).min(ceiling)
    } else {
        current
    }
}

/// Window a supplier gets to ack one uploaded fragment: generous multiple
/// of the expected transfer time at the configured rate, floored for tiny
/// files and capped for huge ones.
fn send_timeout(size: u64, config: &TransferConfig) -> Duration {
    let transfer_secs = (size / config.send_speed.max(1)).max(5);
    Duration::from_secs(20 * (transfer_secs + 5)).min(config.max_send_timeout)
}

/// Window a supplier gets to return one requested fragment.
fn request_timeout(config: &TransferConfig) -> Duration {
    let transfer_secs = 2 * config.block_size_hint / config.request_speed.max(1);
    Duration::from_secs(transfer_secs.max(30))
}
