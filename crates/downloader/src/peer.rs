//! Peer capability traits and the per-peer throughput bookkeeping that
//! drives adaptive request sizing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use emberd_log::log_debug;
use emberd_primitives::{Hash256, U256};

use crate::error::SyncError;
use crate::{MAX_BLOCK_FETCH, MAX_HEADER_FETCH, MAX_RECEIPT_FETCH, MAX_STATE_FETCH};

/// Weight of a fresh delivery measurement against the running throughput.
const MEASUREMENT_IMPACT: f64 = 0.1;

/// Outbound request surface of a fully capable peer. Requests are
/// fire-and-forget; responses come back through the engine's deliver
/// entry points, attributed by peer id.
pub trait Peer: Send + Sync {
    /// Advertised head hash and total difficulty.
    fn head(&self) -> (Hash256, U256);

    fn request_headers_by_hash(
        &self,
        origin: Hash256,
        amount: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<(), String>;

    fn request_headers_by_number(
        &self,
        origin: u64,
        amount: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<(), String>;

    fn request_bodies(&self, hashes: Vec<Hash256>) -> Result<(), String>;

    fn request_receipts(&self, hashes: Vec<Hash256>) -> Result<(), String>;

    fn request_node_data(&self, hashes: Vec<Hash256>) -> Result<(), String>;
}

/// Header-and-state-only peer, as exposed by the light protocol.
pub trait LightPeer: Send + Sync {
    fn head(&self) -> (Hash256, U256);

    fn request_headers_by_hash(
        &self,
        origin: Hash256,
        amount: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<(), String>;

    fn request_headers_by_number(
        &self,
        origin: u64,
        amount: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<(), String>;

    fn request_node_data(&self, hashes: Vec<Hash256>) -> Result<(), String>;
}

/// Presents a light peer through the uniform interface. The scheduler
/// never reserves body or receipt work in light mode, so those entry
/// points only guard against misuse.
pub struct LightPeerWrapper(pub Arc<dyn LightPeer>);

impl Peer for LightPeerWrapper {
    fn head(&self) -> (Hash256, U256) {
        self.0.head()
    }

    fn request_headers_by_hash(
        &self,
        origin: Hash256,
        amount: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<(), String> {
        self.0.request_headers_by_hash(origin, amount, skip, reverse)
    }

    fn request_headers_by_number(
        &self,
        origin: u64,
        amount: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<(), String> {
        self.0.request_headers_by_number(origin, amount, skip, reverse)
    }

    fn request_bodies(&self, _hashes: Vec<Hash256>) -> Result<(), String> {
        Err("light peer cannot serve block bodies".to_string())
    }

    fn request_receipts(&self, _hashes: Vec<Hash256>) -> Result<(), String> {
        Err("light peer cannot serve receipts".to_string())
    }

    fn request_node_data(&self, hashes: Vec<Hash256>) -> Result<(), String> {
        self.0.request_node_data(hashes)
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Rates {
    header_throughput: f64,
    block_throughput: f64,
    receipt_throughput: f64,
    state_throughput: f64,
    header_started: Option<Instant>,
    block_started: Option<Instant>,
    receipt_started: Option<Instant>,
    state_started: Option<Instant>,
    rtt: Duration,
}

/// A registered peer with its independent per-kind throughput estimates
/// and in-flight flags.
pub(crate) struct PeerConnection {
    pub id: String,
    pub version: u32,
    peer: Arc<dyn Peer>,
    header_busy: AtomicBool,
    block_busy: AtomicBool,
    receipt_busy: AtomicBool,
    state_busy: AtomicBool,
    rates: Mutex<Rates>,
}

impl PeerConnection {
    pub fn new(id: String, version: u32, peer: Arc<dyn Peer>) -> Self {
        Self {
            id,
            version,
            peer,
            header_busy: AtomicBool::new(false),
            block_busy: AtomicBool::new(false),
            receipt_busy: AtomicBool::new(false),
            state_busy: AtomicBool::new(false),
            rates: Mutex::new(Rates::default()),
        }
    }

    /// Clears the in-flight markers for a fresh sync; throughput history
    /// survives so capacity planning keeps its signal.
    pub fn reset(&self) {
        self.header_busy.store(false, Ordering::Release);
        self.block_busy.store(false, Ordering::Release);
        self.receipt_busy.store(false, Ordering::Release);
        self.state_busy.store(false, Ordering::Release);
    }

    pub fn head(&self) -> (Hash256, U256) {
        self.peer.head()
    }

    pub fn request_headers_by_hash(
        &self,
        origin: Hash256,
        amount: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<(), String> {
        self.peer.request_headers_by_hash(origin, amount, skip, reverse)
    }

    pub fn request_headers_by_number(
        &self,
        origin: u64,
        amount: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<(), String> {
        self.peer.request_headers_by_number(origin, amount, skip, reverse)
    }

    fn claim(&self, flag: &AtomicBool, mark: impl FnOnce(&mut Rates)) -> Result<(), String> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| "already fetching from peer".to_string())?;
        if let Ok(mut rates) = self.rates.lock() {
            mark(&mut rates);
        }
        Ok(())
    }

    fn release_on_error(flag: &AtomicBool, sent: Result<(), String>) -> Result<(), String> {
        if sent.is_err() {
            // The request never went out; free the lane again.
            flag.store(false, Ordering::Release);
        }
        sent
    }

    /// Reserve the header lane and fire a contiguous fetch.
    pub fn fetch_headers(&self, from: u64, count: usize) -> Result<(), String> {
        self.claim(&self.header_busy, |r| r.header_started = Some(Instant::now()))?;
        let sent = self.peer.request_headers_by_number(from, count, 0, false);
        Self::release_on_error(&self.header_busy, sent)
    }

    pub fn fetch_bodies(&self, hashes: Vec<Hash256>) -> Result<(), String> {
        self.claim(&self.block_busy, |r| r.block_started = Some(Instant::now()))?;
        let sent = self.peer.request_bodies(hashes);
        Self::release_on_error(&self.block_busy, sent)
    }

    pub fn fetch_receipts(&self, hashes: Vec<Hash256>) -> Result<(), String> {
        self.claim(&self.receipt_busy, |r| r.receipt_started = Some(Instant::now()))?;
        let sent = self.peer.request_receipts(hashes);
        Self::release_on_error(&self.receipt_busy, sent)
    }

    pub fn fetch_node_data(&self, hashes: Vec<Hash256>) -> Result<(), String> {
        self.claim(&self.state_busy, |r| r.state_started = Some(Instant::now()))?;
        let sent = self.peer.request_node_data(hashes);
        Self::release_on_error(&self.state_busy, sent)
    }

    fn update_rate(
        throughput: &mut f64,
        rtt: &mut Duration,
        started: &mut Option<Instant>,
        delivered: usize,
    ) {
        let elapsed = started.take().map(|at| at.elapsed()).unwrap_or_default();
        if delivered == 0 {
            // Nothing came back inside the window; trust is gone.
            *throughput = 0.0;
            return;
        }
        let measured = delivered as f64 / elapsed.as_secs_f64().max(1e-3);
        *throughput = (1.0 - MEASUREMENT_IMPACT) * *throughput + MEASUREMENT_IMPACT * measured;
        let blended = (1.0 - MEASUREMENT_IMPACT) * rtt.as_secs_f64()
            + MEASUREMENT_IMPACT * elapsed.as_secs_f64();
        *rtt = Duration::from_secs_f64(blended);
    }

    pub fn set_headers_idle(&self, delivered: usize) {
        if let Ok(mut rates) = self.rates.lock() {
            let Rates {
                header_throughput,
                header_started,
                rtt,
                ..
            } = &mut *rates;
            Self::update_rate(header_throughput, rtt, header_started, delivered);
        }
        self.header_busy.store(false, Ordering::Release);
    }

    pub fn set_bodies_idle(&self, delivered: usize) {
        if let Ok(mut rates) = self.rates.lock() {
            let Rates {
                block_throughput,
                block_started,
                rtt,
                ..
            } = &mut *rates;
            Self::update_rate(block_throughput, rtt, block_started, delivered);
        }
        self.block_busy.store(false, Ordering::Release);
    }

    pub fn set_receipts_idle(&self, delivered: usize) {
        if let Ok(mut rates) = self.rates.lock() {
            let Rates {
                receipt_throughput,
                receipt_started,
                rtt,
                ..
            } = &mut *rates;
            Self::update_rate(receipt_throughput, rtt, receipt_started, delivered);
        }
        self.receipt_busy.store(false, Ordering::Release);
    }

    pub fn set_node_data_idle(&self, delivered: usize) {
        if let Ok(mut rates) = self.rates.lock() {
            let Rates {
                state_throughput,
                state_started,
                rtt,
                ..
            } = &mut *rates;
            Self::update_rate(state_throughput, rtt, state_started, delivered);
        }
        self.state_busy.store(false, Ordering::Release);
    }

    fn capacity(throughput: f64, target_rtt: Duration, ceiling: usize) -> usize {
        let units = (throughput * target_rtt.as_secs_f64()).max(1.0);
        (units as usize).min(ceiling)
    }

    /// How many headers this peer can be asked for such that the answer
    /// is expected within `target_rtt`.
    pub fn header_capacity(&self, target_rtt: Duration) -> usize {
        let throughput = self.rates.lock().map(|r| r.header_throughput).unwrap_or(0.0);
        Self::capacity(throughput, target_rtt, MAX_HEADER_FETCH)
    }

    pub fn block_capacity(&self, target_rtt: Duration) -> usize {
        let throughput = self.rates.lock().map(|r| r.block_throughput).unwrap_or(0.0);
        Self::capacity(throughput, target_rtt, MAX_BLOCK_FETCH)
    }

    pub fn receipt_capacity(&self, target_rtt: Duration) -> usize {
        let throughput = self.rates.lock().map(|r| r.receipt_throughput).unwrap_or(0.0);
        Self::capacity(throughput, target_rtt, MAX_RECEIPT_FETCH)
    }

    pub fn state_capacity(&self, target_rtt: Duration) -> usize {
        let throughput = self.rates.lock().map(|r| r.state_throughput).unwrap_or(0.0);
        Self::capacity(throughput, target_rtt, MAX_STATE_FETCH)
    }

    pub fn is_header_idle(&self) -> bool {
        !self.header_busy.load(Ordering::Acquire)
    }

    pub fn is_block_idle(&self) -> bool {
        !self.block_busy.load(Ordering::Acquire)
    }

    pub fn is_receipt_idle(&self) -> bool {
        !self.receipt_busy.load(Ordering::Acquire)
    }

    pub fn is_state_idle(&self) -> bool {
        !self.state_busy.load(Ordering::Acquire)
    }

    pub fn measured_rtt(&self) -> Option<Duration> {
        let rates = self.rates.lock().ok()?;
        if rates.rtt.is_zero() {
            None
        } else {
            Some(rates.rtt)
        }
    }

    fn throughputs(&self) -> Rates {
        self.rates.lock().map(|r| *r).unwrap_or_default()
    }

    fn seed_throughputs(&self, seed: Rates) {
        if let Ok(mut rates) = self.rates.lock() {
            *rates = seed;
        }
    }
}

/// Registry of connected peers. Enumerations return snapshots so callers
/// never hold the registry lock across awaits.
#[derive(Default)]
pub(crate) struct PeerSet {
    peers: Mutex<HashMap<String, Arc<PeerConnection>>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer, seeding its throughput with the mean of the
    /// current set so a newcomer is neither starved nor flooded.
    pub fn register(&self, conn: PeerConnection) -> Result<(), SyncError> {
        let Ok(mut peers) = self.peers.lock() else {
            return Err(SyncError::NoPeers);
        };
        if peers.contains_key(&conn.id) {
            return Err(SyncError::AlreadyRegistered);
        }
        if !peers.is_empty() {
            let mut seed = Rates::default();
            for peer in peers.values() {
                let rates = peer.throughputs();
                seed.header_throughput += rates.header_throughput;
                seed.block_throughput += rates.block_throughput;
                seed.receipt_throughput += rates.receipt_throughput;
                seed.state_throughput += rates.state_throughput;
            }
            let n = peers.len() as f64;
            seed.header_throughput /= n;
            seed.block_throughput /= n;
            seed.receipt_throughput /= n;
            seed.state_throughput /= n;
            conn.seed_throughputs(seed);
        }
        log_debug!("Registering sync peer {}", conn.id);
        peers.insert(conn.id.clone(), Arc::new(conn));
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> Result<Arc<PeerConnection>, SyncError> {
        let Ok(mut peers) = self.peers.lock() else {
            return Err(SyncError::UnknownPeer);
        };
        peers.remove(id).ok_or(SyncError::UnknownPeer)
    }

    pub fn peer(&self, id: &str) -> Option<Arc<PeerConnection>> {
        self.peers.lock().ok()?.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn all(&self) -> Vec<Arc<PeerConnection>> {
        self.peers
            .lock()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn reset(&self) {
        for peer in self.all() {
            peer.reset();
        }
    }

    /// Median of the measured per-peer round-trips; `fallback` when no
    /// peer has a measurement yet.
    pub fn median_rtt(&self, fallback: Duration) -> Duration {
        let mut rtts: Vec<Duration> = self
            .all()
            .iter()
            .filter_map(|p| p.measured_rtt())
            .collect();
        if rtts.is_empty() {
            return fallback;
        }
        rtts.sort();
        rtts[rtts.len() / 2]
    }

    fn idle_sorted(
        &self,
        idle: impl Fn(&PeerConnection) -> bool,
        throughput: impl Fn(&Rates) -> f64,
    ) -> (Vec<Arc<PeerConnection>>, usize) {
        let all = self.all();
        let total = all.len();
        let mut idles: Vec<(f64, Arc<PeerConnection>)> = all
            .into_iter()
            .filter(|p| idle(p))
            .map(|p| (throughput(&p.throughputs()), p))
            .collect();
        idles.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        (idles.into_iter().map(|(_, p)| p).collect(), total)
    }

    pub fn header_idle_peers(&self) -> (Vec<Arc<PeerConnection>>, usize) {
        self.idle_sorted(PeerConnection::is_header_idle, |r| r.header_throughput)
    }

    pub fn body_idle_peers(&self) -> (Vec<Arc<PeerConnection>>, usize) {
        self.idle_sorted(PeerConnection::is_block_idle, |r| r.block_throughput)
    }

    pub fn receipt_idle_peers(&self) -> (Vec<Arc<PeerConnection>>, usize) {
        self.idle_sorted(PeerConnection::is_receipt_idle, |r| r.receipt_throughput)
    }

    pub fn state_idle_peers(&self) -> (Vec<Arc<PeerConnection>>, usize) {
        self.idle_sorted(PeerConnection::is_state_idle, |r| r.state_throughput)
    }
}
