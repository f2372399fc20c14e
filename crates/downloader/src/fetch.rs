//! The shared retrieval loop behind skeleton filling, body fetching, and
//! receipt fetching: one driver, parameterised by a [`FetchKind`] rather
//! than copied per data kind.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use emberd_log::{log_debug, log_error, log_trace, log_warn};
use emberd_primitives::{BlockHeader, Receipt, Transaction};

use crate::error::SyncError;
use crate::peer::PeerConnection;
use crate::queue::FetchRequest;
use crate::{flagged, Downloader};

/// Edge-triggered nudge from the header processor to the content
/// fetchers; `NoMore` is the termination sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Wake {
    Data,
    NoMore,
}

pub(crate) struct HeaderPack {
    pub peer_id: String,
    pub headers: Vec<BlockHeader>,
}

pub(crate) struct BodyPack {
    pub peer_id: String,
    pub transactions: Vec<Vec<Transaction>>,
    pub uncles: Vec<Vec<BlockHeader>>,
}

pub(crate) struct ReceiptPack {
    pub peer_id: String,
    pub receipts: Vec<Vec<Receipt>>,
}

pub(crate) struct StatePack {
    pub peer_id: String,
    pub data: Vec<Vec<u8>>,
}

/// Static dispatch table binding one retrieval kind to its queue entry
/// points, peer lanes, and counters.
pub(crate) trait FetchKind {
    const LABEL: &'static str;
    type Pack: Send + 'static;
    /// Extra context a kind needs at delivery time (the header run
    /// channel for skeleton fills).
    type Ctx: Sync;

    fn pack_peer(pack: &Self::Pack) -> &str;
    fn pack_items(pack: &Self::Pack) -> usize;
    fn deliver(dl: &Downloader, pack: Self::Pack, ctx: &Self::Ctx) -> Result<usize, SyncError>;
    fn expire(dl: &Downloader, ttl: Duration) -> HashMap<String, usize>;
    fn pending(dl: &Downloader) -> usize;
    fn in_flight(dl: &Downloader) -> bool;
    fn reserve(
        dl: &Downloader,
        peer: &PeerConnection,
        count: usize,
    ) -> (Option<FetchRequest>, bool, bool);
    fn cancel(dl: &Downloader, request: FetchRequest);
    fn fetch(peer: &PeerConnection, request: &FetchRequest) -> Result<(), String>;
    fn capacity(dl: &Downloader, peer: &PeerConnection) -> usize;
    fn idle_peers(dl: &Downloader) -> (Vec<Arc<PeerConnection>>, usize);
    fn set_idle(peer: &PeerConnection, accepted: usize);
    /// (delivered, dropped, timed out) counters for this kind.
    fn meters(dl: &Downloader) -> (&AtomicU64, &AtomicU64, &AtomicU64);

    /// Kind-specific completion independent of the wake channel; the
    /// skeleton fill ends when every slot has been assembled.
    fn fill_complete(_dl: &Downloader) -> bool {
        false
    }
}

pub(crate) struct HeadersKind;

impl FetchKind for HeadersKind {
    const LABEL: &'static str = "headers";
    type Pack = HeaderPack;
    type Ctx = mpsc::Sender<Vec<BlockHeader>>;

    fn pack_peer(pack: &Self::Pack) -> &str {
        &pack.peer_id
    }

    fn pack_items(pack: &Self::Pack) -> usize {
        pack.headers.len()
    }

    fn deliver(dl: &Downloader, pack: Self::Pack, ctx: &Self::Ctx) -> Result<usize, SyncError> {
        dl.queue.deliver_headers(&pack.peer_id, pack.headers, ctx)
    }

    fn expire(dl: &Downloader, ttl: Duration) -> HashMap<String, usize> {
        dl.queue.expire_headers(ttl)
    }

    fn pending(dl: &Downloader) -> usize {
        dl.queue.pending_headers()
    }

    fn in_flight(dl: &Downloader) -> bool {
        dl.queue.in_flight_headers()
    }

    fn reserve(
        dl: &Downloader,
        peer: &PeerConnection,
        _count: usize,
    ) -> (Option<FetchRequest>, bool, bool) {
        (dl.queue.reserve_headers(&peer.id), false, false)
    }

    fn cancel(dl: &Downloader, request: FetchRequest) {
        dl.queue.cancel_headers(request);
    }

    fn fetch(peer: &PeerConnection, request: &FetchRequest) -> Result<(), String> {
        peer.fetch_headers(request.from, crate::MAX_HEADER_FETCH)
    }

    fn capacity(dl: &Downloader, peer: &PeerConnection) -> usize {
        peer.header_capacity(dl.request_rtt())
    }

    fn idle_peers(dl: &Downloader) -> (Vec<Arc<PeerConnection>>, usize) {
        dl.peers.header_idle_peers()
    }

    fn set_idle(peer: &PeerConnection, accepted: usize) {
        peer.set_headers_idle(accepted);
    }

    fn meters(dl: &Downloader) -> (&AtomicU64, &AtomicU64, &AtomicU64) {
        (
            &dl.metrics.header_in,
            &dl.metrics.header_drop,
            &dl.metrics.header_timeout,
        )
    }

    fn fill_complete(dl: &Downloader) -> bool {
        dl.queue.header_fill_complete()
    }
}

pub(crate) struct BodiesKind;

impl FetchKind for BodiesKind {
    const LABEL: &'static str = "bodies";
    type Pack = BodyPack;
    type Ctx = ();

    fn pack_peer(pack: &Self::Pack) -> &str {
        &pack.peer_id
    }

    fn pack_items(pack: &Self::Pack) -> usize {
        pack.transactions.len()
    }

    fn deliver(dl: &Downloader, pack: Self::Pack, _ctx: &Self::Ctx) -> Result<usize, SyncError> {
        dl.queue
            .deliver_bodies(&pack.peer_id, pack.transactions, pack.uncles)
    }

    fn expire(dl: &Downloader, ttl: Duration) -> HashMap<String, usize> {
        dl.queue.expire_bodies(ttl)
    }

    fn pending(dl: &Downloader) -> usize {
        dl.queue.pending_blocks()
    }

    fn in_flight(dl: &Downloader) -> bool {
        dl.queue.in_flight_blocks()
    }

    fn reserve(
        dl: &Downloader,
        peer: &PeerConnection,
        count: usize,
    ) -> (Option<FetchRequest>, bool, bool) {
        dl.queue.reserve_bodies(&peer.id, count)
    }

    fn cancel(dl: &Downloader, request: FetchRequest) {
        dl.queue.cancel_bodies(request);
    }

    fn fetch(peer: &PeerConnection, request: &FetchRequest) -> Result<(), String> {
        let hashes = request.headers.iter().map(BlockHeader::hash).collect();
        peer.fetch_bodies(hashes)
    }

    fn capacity(dl: &Downloader, peer: &PeerConnection) -> usize {
        peer.block_capacity(dl.request_rtt())
    }

    fn idle_peers(dl: &Downloader) -> (Vec<Arc<PeerConnection>>, usize) {
        dl.peers.body_idle_peers()
    }

    fn set_idle(peer: &PeerConnection, accepted: usize) {
        peer.set_bodies_idle(accepted);
    }

    fn meters(dl: &Downloader) -> (&AtomicU64, &AtomicU64, &AtomicU64) {
        (
            &dl.metrics.body_in,
            &dl.metrics.body_drop,
            &dl.metrics.body_timeout,
        )
    }
}

pub(crate) struct ReceiptsKind;

impl FetchKind for ReceiptsKind {
    const LABEL: &'static str = "receipts";
    type Pack = ReceiptPack;
    type Ctx = ();

    fn pack_peer(pack: &Self::Pack) -> &str {
        &pack.peer_id
    }

    fn pack_items(pack: &Self::Pack) -> usize {
        pack.receipts.len()
    }

    fn deliver(dl: &Downloader, pack: Self::Pack, _ctx: &Self::Ctx) -> Result<usize, SyncError> {
        dl.queue.deliver_receipts(&pack.peer_id, pack.receipts)
    }

    fn expire(dl: &Downloader, ttl: Duration) -> HashMap<String, usize> {
        dl.queue.expire_receipts(ttl)
    }

    fn pending(dl: &Downloader) -> usize {
        dl.queue.pending_receipts()
    }

    fn in_flight(dl: &Downloader) -> bool {
        dl.queue.in_flight_receipts()
    }

    fn reserve(
        dl: &Downloader,
        peer: &PeerConnection,
        count: usize,
    ) -> (Option<FetchRequest>, bool, bool) {
        dl.queue.reserve_receipts(&peer.id, count)
    }

    fn cancel(dl: &Downloader, request: FetchRequest) {
        dl.queue.cancel_receipts(request);
    }

    fn fetch(peer: &PeerConnection, request: &FetchRequest) -> Result<(), String> {
        let hashes = request.headers.iter().map(BlockHeader::hash).collect();
        peer.fetch_receipts(hashes)
    }

    fn capacity(dl: &Downloader, peer: &PeerConnection) -> usize {
        peer.receipt_capacity(dl.request_rtt())
    }

    fn idle_peers(dl: &Downloader) -> (Vec<Arc<PeerConnection>>, usize) {
        dl.peers.receipt_idle_peers()
    }

    fn set_idle(peer: &PeerConnection, accepted: usize) {
        peer.set_receipts_idle(accepted);
    }

    fn meters(dl: &Downloader) -> (&AtomicU64, &AtomicU64, &AtomicU64) {
        (
            &dl.metrics.receipt_in,
            &dl.metrics.receipt_drop,
            &dl.metrics.receipt_timeout,
        )
    }
}

impl Downloader {
    /// Retrieval loop shared by every data kind: on each delivery, wake,
    /// or 100 ms tick it expires stale reservations, applies the stall
    /// policy, and assigns fresh work to idle peers up to their adaptive
    /// capacity.
    pub(crate) async fn fetch_parts<K: FetchKind>(
        &self,
        delivery_rx: &mut mpsc::Receiver<K::Pack>,
        wake_rx: &mut mpsc::Receiver<Wake>,
        ctx: &K::Ctx,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut finished = false;

        loop {
            tokio::select! {
                _ = flagged(cancel_rx) => return Err(SyncError::Canceled),

                maybe_pack = delivery_rx.recv() => {
                    let Some(pack) = maybe_pack else {
                        return Err(SyncError::Canceled);
                    };
                    let (meter_in, meter_drop, _) = K::meters(self);
                    let items = K::pack_items(&pack);
                    crate::metrics::SyncMetrics::record_in(meter_in, items);
                    if let Some(peer) = self.peers.peer(K::pack_peer(&pack)) {
                        match K::deliver(self, pack, ctx) {
                            Ok(accepted) => {
                                K::set_idle(&peer, accepted);
                                if items == 0 {
                                    log_trace!("requested {} not delivered by {}", K::LABEL, peer.id);
                                } else {
                                    log_trace!("delivered {items} {} from {}", K::LABEL, peer.id);
                                }
                            }
                            Err(SyncError::InvalidChain(reason)) => {
                                return Err(SyncError::InvalidChain(reason));
                            }
                            Err(err @ (SyncError::InvalidBody | SyncError::InvalidReceipt)) => {
                                // The peer answered exactly what was asked
                                // with data failing its own header roots.
                                crate::metrics::SyncMetrics::record_in(meter_drop, items);
                                log_warn!("{} delivery from {} failed root check", K::LABEL, peer.id);
                                self.drop_peer_by_id(&peer.id);
                                return Err(SyncError::InvalidChain(err.to_string()));
                            }
                            Err(SyncError::StaleDelivery) => {
                                // Arrived after its request was expired or
                                // revoked; no capacity accounting.
                                crate::metrics::SyncMetrics::record_in(meter_drop, items);
                                log_trace!("stale {} delivery from {}", K::LABEL, peer.id);
                            }
                            Err(err) => {
                                crate::metrics::SyncMetrics::record_in(meter_drop, items);
                                K::set_idle(&peer, 0);
                                log_debug!("failed to deliver {} from {}: {err}", K::LABEL, peer.id);
                            }
                        }
                    }
                }

                maybe_wake = wake_rx.recv() => {
                    match maybe_wake {
                        Some(Wake::Data) => {}
                        Some(Wake::NoMore) | None => finished = true,
                    }
                }

                _ = ticker.tick() => {}
            }

            // Work assignment pass, shared by every select arm.
            if self.peers.len() == 0 {
                return Err(SyncError::NoPeers);
            }
            let ttl = self.request_ttl();
            for (pid, fails) in K::expire(self, ttl) {
                let Some(peer) = self.peers.peer(&pid) else {
                    continue;
                };
                let (_, _, meter_timeout) = K::meters(self);
                crate::metrics::SyncMetrics::record_in(meter_timeout, 1);
                // A big multi-item request timing out may just mean a slow
                // link; demote the peer to minimal requests first. A
                // single-item miss is a real stall.
                if fails > 2 {
                    log_trace!("{} delivery of {pid} timed out", K::LABEL);
                    K::set_idle(&peer, 0);
                } else if self.has_drop_peer() {
                    log_debug!("{} delivery of {pid} stalling, dropping", K::LABEL);
                    self.drop_peer_by_id(&pid);
                    if self.is_master_peer(&pid) {
                        self.cancel();
                        return Err(SyncError::Timeout);
                    }
                } else {
                    log_warn!("stalling peer {pid} not dropped: no drop callback set");
                }
            }

            if K::pending(self) == 0 {
                if !K::in_flight(self) && (finished || K::fill_complete(self)) {
                    log_debug!("{} fetching completed", K::LABEL);
                    return Ok(());
                }
                continue;
            }

            let (idles, total) = K::idle_peers(self);
            let mut progressed = false;
            let mut throttled = false;
            let mut running = K::in_flight(self);
            let mut pend_count = K::pending(self);
            for peer in &idles {
                if throttled {
                    break;
                }
                pend_count = K::pending(self);
                if pend_count == 0 {
                    break;
                }
                let (request, progress, throttle) = K::reserve(self, peer, K::capacity(self, peer));
                if progress {
                    progressed = true;
                }
                if throttle {
                    throttled = true;
                    crate::metrics::SyncMetrics::record_in(&self.metrics.throttles, 1);
                }
                let Some(request) = request else {
                    continue;
                };
                if request.from > 0 {
                    log_trace!("requesting {} from {} at {}", K::LABEL, peer.id, request.from);
                } else {
                    log_trace!(
                        "requesting {} {} from {}",
                        request.headers.len(),
                        K::LABEL,
                        peer.id
                    );
                }
                if let Err(err) = K::fetch(peer, &request) {
                    log_error!("{} fetch assignment to {} failed: {err}", K::LABEL, peer.id);
                    K::cancel(self, request);
                    continue;
                }
                running = true;
            }

            // Nothing moved and every peer was tried: the remaining work
            // is unserveable by the current peer set.
            if !progressed && !throttled && !running && idles.len() == total && pend_count > 0 {
                return Err(SyncError::PeersUnavailable);
            }
        }
    }
}
