//! Transport seam for fragment transfers
//!
//! The engine never touches the network directly. A tick of the transfer
//! queues produces dispatch instructions; the engine resolves each slot to
//! a peer and drives a [`Transport`], which settles every attempt into a
//! single three-way outcome: delivered, failed with a reason, or timed out.
//! Outcomes flow back into the queues, so callers waiting on a transfer
//! get exactly one answer per attempt.

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::fragment::FragmentAddress;

/// Settled result of pushing one fragment to a supplier.
///
/// `Failed` means the supplier explicitly rejected the fragment. Wire-level
/// delivery trouble is reported separately through
/// [`TransferQueues::on_send_delivery_report`] so the queue can retry it.
///
/// [`TransferQueues::on_send_delivery_report`]: crate::transfer::TransferQueues::on_send_delivery_report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The supplier acknowledged the fragment.
    Delivered,
    /// The supplier rejected the fragment.
    Failed(String),
    /// No answer arrived within the allowed window.
    Timeout,
}

/// Settled result of asking a supplier for one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The supplier returned the fragment payload.
    Received(Bytes),
    /// The supplier rejected the request.
    Failed(String),
    /// No answer arrived within the allowed window.
    Timeout,
}

/// Wire side of fragment transfers.
///
/// Implementations own connections, retries below the packet level and the
/// actual timeout clock; the returned future must always resolve. The
/// engine passes the per-dispatch timeout computed by the queue so the
/// transport knows how long the caller is prepared to wait.
pub trait Transport: Send + Sync {
    /// Push `payload` to `peer` under the given fragment address.
    fn send_fragment(
        &self,
        peer: &str,
        address: &FragmentAddress,
        payload: Bytes,
        timeout: std::time::Duration,
    ) -> BoxFuture<'static, TransferOutcome>;

    /// Ask `peer` for the fragment stored under `address`.
    fn request_fragment(
        &self,
        peer: &str,
        address: &FragmentAddress,
        timeout: std::time::Duration,
    ) -> BoxFuture<'static, FetchOutcome>;
}
