//! Chain synchronisation engine for emberd: drives the local chain to a
//! chosen remote head using header, body, receipt, and state-trie data
//! retrieved from registered peers, in full, fast, or light mode.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;

use emberd_log::{log_debug, log_error, log_info, log_trace, log_warn};
use emberd_primitives::{
    hash256_to_hex, Block, BlockBody, BlockHeader, Hash256, Receipt, Transaction, U256,
};
use emberd_storage::KeyValueStore;

pub mod bloom;
pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod mode;
pub mod rawdata;
pub mod statesync;

mod fetch;
mod peer;
mod qos;
mod queue;

pub use bloom::SyncBloom;
pub use chain::{BlockChain, ChainInsertError, LightChain};
pub use config::DownloaderConfig;
pub use error::SyncError;
pub use metrics::{MetricsSnapshot, SyncMetrics};
pub use mode::SyncMode;
pub use peer::{LightPeer, LightPeerWrapper, Peer};
pub use statesync::{StateScheduler, StateSchedulerFactory, StateSync};

use fetch::{BodiesKind, BodyPack, HeaderPack, HeadersKind, ReceiptPack, ReceiptsKind, StatePack, Wake};
use peer::{PeerConnection, PeerSet};
use qos::QosEstimator;
use queue::{FetchResult, Queue};
use serde::Serialize;
use statesync::StateSyncRun;

/// Amount of hashes to be fetched per retrieval request.
pub const MAX_HASH_FETCH: usize = 512;
/// Amount of blocks to be fetched per retrieval request.
pub const MAX_BLOCK_FETCH: usize = 128;
/// Amount of headers to be fetched per retrieval request.
pub const MAX_HEADER_FETCH: usize = 192;
/// Number of header fetches needed for a skeleton assembly.
pub const MAX_SKELETON_SIZE: usize = 128;
/// Amount of transaction receipts to allow fetching per request.
pub const MAX_RECEIPT_FETCH: usize = 256;
/// Amount of node state values to allow fetching per request.
pub const MAX_STATE_FETCH: usize = 384;

/// Maximum number of headers queued for import at any time.
pub(crate) const MAX_QUEUED_HEADERS: usize = 32 * 1024;
/// Number of headers to import at once into the chain.
pub(crate) const MAX_HEADERS_PROCESS: usize = 2048;
/// Number of content download results to import at once into the chain.
pub(crate) const MAX_RESULTS_PROCESS: usize = 2048;

/// Headers newer than this are assumed reorg-able and never frozen.
pub const FULL_IMMUTABILITY_THRESHOLD: u64 = 90_000;
pub const LIGHT_IMMUTABILITY_THRESHOLD: u64 = 30_000;

/// Threshold (in blocks) for a chain-tip reshuffle to count as a reorg.
pub(crate) const REORG_PROT_THRESHOLD: u64 = 48;
/// Number of headers delayed at the tip while reorg protection holds.
pub(crate) const REORG_PROT_HEADER_DELAY: usize = 2;

/// Verification frequency for headers far from the fast-sync pivot.
pub(crate) const FS_HEADER_CHECK_FREQUENCY: usize = 100;
/// Number of headers discarded as a rollback cushion on a failed insert.
pub(crate) const FS_HEADER_SAFETY_NET: u64 = 2048;
/// Distance from the pivot inside which every header is fully verified.
pub(crate) const FS_HEADER_FORCE_VERIFY: u64 = 24;
/// Number of blocks executed fully at the head of a fast sync.
pub(crate) const FS_MIN_FULL_BLOCKS: u64 = 64;

pub(crate) const MIN_PROTOCOL_VERSION: u32 = 63;

/// Sync lifecycle notifications, published per `synchronise` call.
#[derive(Clone, Debug)]
pub enum SyncEvent {
    Started,
    Done { head: u64 },
    Failed { error: SyncError },
}

/// Externally visible synchronisation status.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncProgress {
    pub starting_block: u64,
    pub current_block: u64,
    pub highest_block: u64,
    pub pulled_states: u64,
    pub known_states: u64,
}

pub type DropPeerFn = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct ChainStats {
    origin: u64,
    height: u64,
}

/// Per-sync plumbing: where deliveries are routed and how the sync is
/// torn down. Replaced wholesale on every `synchronise` call.
struct ActiveSync {
    peer_id: String,
    cancel_tx: watch::Sender<bool>,
    header_tx: mpsc::Sender<HeaderPack>,
    body_tx: mpsc::Sender<BodyPack>,
    receipt_tx: mpsc::Sender<ReceiptPack>,
}

/// Waits until the watched flag flips true. A dropped sender counts as
/// flagged so orphaned tasks shut down rather than hang.
pub(crate) async fn flagged(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

pub struct Downloader {
    config: DownloaderConfig,
    checkpoint: u64,
    mode: AtomicU32,
    genesis: AtomicU64,

    pub(crate) qos: QosEstimator,
    pub(crate) queue: Queue,
    pub(crate) peers: PeerSet,
    pub(crate) metrics: SyncMetrics,
    pub(crate) state_db: Arc<dyn KeyValueStore>,
    state_bloom: Option<Arc<SyncBloom>>,

    lightchain: Arc<dyn LightChain>,
    blockchain: Option<Arc<dyn BlockChain>>,
    scheduler_factory: Arc<dyn StateSchedulerFactory>,
    drop_peer: Option<DropPeerFn>,

    synchronising: AtomicBool,
    notified: AtomicBool,
    committed: AtomicBool,
    ancient_limit: AtomicU64,

    sync_stats: RwLock<ChainStats>,
    state_processed: AtomicU64,
    state_pending: AtomicU64,

    pivot: RwLock<Option<BlockHeader>>,

    active: Mutex<Option<ActiveSync>>,
    events: broadcast::Sender<SyncEvent>,

    quit_tx: watch::Sender<bool>,
    state_start_tx: mpsc::Sender<StateSyncRun>,
    state_tx: mpsc::Sender<StatePack>,
}

impl Downloader {
    /// Creates the engine and spawns its process-lifetime tasks (QoS
    /// tuner and state fetcher); must be called within a tokio runtime.
    /// `chain` is None for a light client; `lightchain` is consulted for
    /// header operations in every mode.
    pub fn new(
        config: DownloaderConfig,
        state_db: Arc<dyn KeyValueStore>,
        state_bloom: Option<Arc<SyncBloom>>,
        chain: Option<Arc<dyn BlockChain>>,
        lightchain: Arc<dyn LightChain>,
        scheduler_factory: Arc<dyn StateSchedulerFactory>,
        drop_peer: Option<DropPeerFn>,
    ) -> Arc<Self> {
        let (quit_tx, _) = watch::channel(false);
        let (state_start_tx, state_start_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = mpsc::channel(1);
        let (events, _) = broadcast::channel(16);
        let processed = rawdata::read_fast_trie_progress(&*state_db);

        let dl = Arc::new(Self {
            checkpoint: config.checkpoint,
            qos: QosEstimator::new(config.rtt_min(), config.rtt_max(), config.ttl_limit()),
            queue: Queue::new(config.block_cache_items),
            peers: PeerSet::new(),
            metrics: SyncMetrics::default(),
            state_db,
            state_bloom,
            lightchain,
            blockchain: chain,
            scheduler_factory,
            drop_peer,
            mode: AtomicU32::new(SyncMode::Full.as_u32()),
            genesis: AtomicU64::new(0),
            synchronising: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            committed: AtomicBool::new(false),
            ancient_limit: AtomicU64::new(0),
            sync_stats: RwLock::new(ChainStats::default()),
            state_processed: AtomicU64::new(processed),
            state_pending: AtomicU64::new(0),
            pivot: RwLock::new(None),
            active: Mutex::new(None),
            events,
            quit_tx,
            state_start_tx,
            state_tx,
            config,
        });
        tokio::spawn(Arc::clone(&dl).qos_tuner());
        tokio::spawn(Arc::clone(&dl).state_fetcher(state_start_rx, state_rx));
        dl
    }

    // ---- public surface -------------------------------------------------

    pub fn register_peer(&self, id: &str, version: u32, peer: Arc<dyn Peer>) -> Result<(), SyncError> {
        log_trace!("Registering sync peer {id}");
        self.peers
            .register(PeerConnection::new(id.to_string(), version, peer))?;
        self.qos.reduce_confidence(self.peers.len());
        Ok(())
    }

    pub fn register_light_peer(
        &self,
        id: &str,
        version: u32,
        peer: Arc<dyn LightPeer>,
    ) -> Result<(), SyncError> {
        self.register_peer(id, version, Arc::new(LightPeerWrapper(peer)))
    }

    /// Removes the peer and returns its in-flight work to the schedulers.
    pub fn unregister_peer(&self, id: &str) -> Result<(), SyncError> {
        log_trace!("Unregistering sync peer {id}");
        self.peers.unregister(id)?;
        self.queue.revoke(id);
        Ok(())
    }

    pub fn is_synchronising(&self) -> bool {
        self.synchronising.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> SyncProgress {
        let (origin, height) = {
            let stats = self.sync_stats.read().expect("sync stats lock");
            (stats.origin, stats.height)
        };
        let mode = self.current_mode();
        let current = match (&self.blockchain, mode) {
            (Some(chain), SyncMode::Full) => chain.current_block().number(),
            (Some(chain), SyncMode::Fast) => chain.current_fast_block().number(),
            _ => self.lightchain.current_header().number,
        };
        let processed = self.state_processed.load(Ordering::Relaxed);
        let pending = self.state_pending.load(Ordering::Relaxed);
        SyncProgress {
            starting_block: origin,
            current_block: current,
            highest_block: height,
            pulled_states: processed,
            known_states: processed + pending,
        }
    }

    /// Forwarded to the state bloom; without one, everything may exist.
    pub fn sync_bloom_contains(&self, hash: &Hash256) -> bool {
        match &self.state_bloom {
            Some(bloom) => bloom.contains(hash),
            None => true,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Request deadline derived from the QoS estimator.
    pub fn request_ttl(&self) -> Duration {
        self.qos.request_ttl()
    }

    /// Target round-trip used for capacity budgeting.
    pub fn request_rtt(&self) -> Duration {
        self.qos.request_rtt()
    }

    /// Interrupts the sync in flight, if any.
    pub fn cancel(&self) {
        if let Some(active) = &*self.active.lock().expect("active sync lock") {
            let _ = active.cancel_tx.send(true);
        }
    }

    /// Shuts the engine down for good: stops the process-lifetime tasks
    /// and interrupts any sync in flight.
    pub fn terminate(&self) {
        let _ = self.quit_tx.send(true);
        if let Some(bloom) = &self.state_bloom {
            bloom.close();
        }
        self.cancel();
    }

    /// Tries to sync up with the peer's advertised head. Maps the error
    /// taxonomy onto peer outcomes: protocol faults drop the offending
    /// peer before propagating.
    pub async fn synchronise(
        self: &Arc<Self>,
        id: &str,
        head: Hash256,
        td: U256,
        mode: SyncMode,
    ) -> Result<(), SyncError> {
        let result = self.synchronise_inner(id, head, td, mode).await;
        match &result {
            Ok(()) | Err(SyncError::Busy) | Err(SyncError::Canceled) => result,
            Err(err) if err.is_peer_fault() => {
                log_warn!("Synchronisation failed, dropping peer {id}: {err}");
                self.drop_peer_by_id(id);
                result
            }
            Err(err) => {
                log_warn!("Synchronisation failed, retrying: {err}");
                result
            }
        }
    }

    // ---- delivery entry points ------------------------------------------

    pub async fn deliver_headers(
        &self,
        id: &str,
        headers: Vec<BlockHeader>,
    ) -> Result<(), SyncError> {
        let (tx, mut cancel_rx) = self.delivery_route(|active| active.header_tx.clone())?;
        let pack = HeaderPack {
            peer_id: id.to_string(),
            headers,
        };
        tokio::select! {
            sent = tx.send(pack) => sent.map_err(|_| SyncError::NoSyncActive),
            _ = flagged(&mut cancel_rx) => Err(SyncError::NoSyncActive),
        }
    }

    pub async fn deliver_bodies(
        &self,
        id: &str,
        transactions: Vec<Vec<Transaction>>,
        uncles: Vec<Vec<BlockHeader>>,
    ) -> Result<(), SyncError> {
        let (tx, mut cancel_rx) = self.delivery_route(|active| active.body_tx.clone())?;
        let pack = BodyPack {
            peer_id: id.to_string(),
            transactions,
            uncles,
        };
        tokio::select! {
            sent = tx.send(pack) => sent.map_err(|_| SyncError::NoSyncActive),
            _ = flagged(&mut cancel_rx) => Err(SyncError::NoSyncActive),
        }
    }

    pub async fn deliver_receipts(
        &self,
        id: &str,
        receipts: Vec<Vec<Receipt>>,
    ) -> Result<(), SyncError> {
        let (tx, mut cancel_rx) = self.delivery_route(|active| active.receipt_tx.clone())?;
        let pack = ReceiptPack {
            peer_id: id.to_string(),
            receipts,
        };
        tokio::select! {
            sent = tx.send(pack) => sent.map_err(|_| SyncError::NoSyncActive),
            _ = flagged(&mut cancel_rx) => Err(SyncError::NoSyncActive),
        }
    }

    pub async fn deliver_node_data(&self, id: &str, data: Vec<Vec<u8>>) -> Result<(), SyncError> {
        let mut cancel_rx = self.delivery_route(|_| ())?.1;
        let pack = StatePack {
            peer_id: id.to_string(),
            data,
        };
        tokio::select! {
            sent = self.state_tx.send(pack) => sent.map_err(|_| SyncError::NoSyncActive),
            _ = flagged(&mut cancel_rx) => Err(SyncError::NoSyncActive),
        }
    }

    fn delivery_route<T>(
        &self,
        pick: impl FnOnce(&ActiveSync) -> T,
    ) -> Result<(T, watch::Receiver<bool>), SyncError> {
        let guard = self.active.lock().expect("active sync lock");
        match &*guard {
            Some(active) => Ok((pick(active), active.cancel_tx.subscribe())),
            None => Err(SyncError::NoSyncActive),
        }
    }

    // ---- sync orchestration ----------------------------------------------

    async fn synchronise_inner(
        self: &Arc<Self>,
        id: &str,
        head: Hash256,
        td: U256,
        mode: SyncMode,
    ) -> Result<(), SyncError> {
        if self
            .synchronising
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::Busy);
        }
        let result = self.run_sync(id, head, td, mode).await;
        self.cancel();
        *self.active.lock().expect("active sync lock") = None;
        self.synchronising.store(false, Ordering::Release);
        result
    }

    async fn run_sync(
        self: &Arc<Self>,
        id: &str,
        head: Hash256,
        td: U256,
        mode: SyncMode,
    ) -> Result<(), SyncError> {
        if self
            .notified
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log_info!("Block synchronisation started");
        }
        if mode != SyncMode::Light && self.blockchain.is_none() {
            return Err(SyncError::InvalidChain(
                "no block store configured for this mode".to_string(),
            ));
        }
        // Full sync has no use for the state presence filter; release it.
        if mode == SyncMode::Full {
            if let Some(bloom) = &self.state_bloom {
                bloom.close();
            }
        }
        self.queue.reset(self.config.block_cache_items);
        self.peers.reset();

        let (header_tx, header_rx) = mpsc::channel(1);
        let (body_tx, body_rx) = mpsc::channel(1);
        let (receipt_tx, receipt_rx) = mpsc::channel(1);
        let (cancel_tx, _) = watch::channel(false);
        *self.active.lock().expect("active sync lock") = Some(ActiveSync {
            peer_id: id.to_string(),
            cancel_tx,
            header_tx,
            body_tx,
            receipt_tx,
        });
        self.mode.store(mode.as_u32(), Ordering::Release);

        let Some(peer) = self.peers.peer(id) else {
            return Err(SyncError::UnknownPeer);
        };

        let _ = self.events.send(SyncEvent::Started);
        let result = self
            .sync_with_peer(peer, head, td, mode, header_rx, body_rx, receipt_rx)
            .await;
        match &result {
            Ok(()) => {
                let head = self.lightchain.current_header();
                let _ = self.events.send(SyncEvent::Done { head: head.number });
            }
            Err(err) => {
                let _ = self.events.send(SyncEvent::Failed { error: err.clone() });
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_with_peer(
        self: &Arc<Self>,
        peer: Arc<PeerConnection>,
        head: Hash256,
        td: U256,
        mode: SyncMode,
        mut header_rx: mpsc::Receiver<HeaderPack>,
        body_rx: mpsc::Receiver<BodyPack>,
        receipt_rx: mpsc::Receiver<ReceiptPack>,
    ) -> Result<(), SyncError> {
        if peer.version < MIN_PROTOCOL_VERSION {
            return Err(SyncError::TooOld);
        }
        log_debug!(
            "Synchronising with peer {} (head {} td {td} mode {mode})",
            peer.id,
            hash256_to_hex(&head)
        );
        let mut cancel_rx = self.cancel_watch()?;

        // Look up the sync boundaries: the common ancestor and the target.
        let (latest, mut pivot) = self.fetch_head(&peer, mode, &mut header_rx, &mut cancel_rx).await?;
        if mode == SyncMode::Fast && pivot.is_none() {
            // The remote is too short for a pivot; keep full-sync shaped
            // processing anchored at the current block.
            pivot = Some(self.blockchain()?.current_block().header);
        }
        let height = latest.number;

        let mut origin = self
            .find_ancestor(&peer, &latest, mode, &mut header_rx, &mut cancel_rx)
            .await?;
        {
            let mut stats = self.sync_stats.write().expect("sync stats lock");
            if stats.height <= origin || stats.origin > origin {
                stats.origin = origin;
            }
            stats.height = height;
        }

        let mut pivot_number = 0;
        if mode == SyncMode::Fast {
            if height <= FS_MIN_FULL_BLOCKS {
                origin = 0;
            } else {
                pivot_number = pivot.as_ref().map(|p| p.number).unwrap_or(0);
                if pivot_number <= origin {
                    origin = pivot_number - 1;
                }
                // Write out the pivot so restarts resume at it instead of
                // re-picking a spot below the frozen region.
                rawdata::write_last_pivot_number(&*self.state_db, pivot_number);
            }
        }
        self.committed.store(true, Ordering::Release);
        if mode == SyncMode::Fast && pivot_number != 0 {
            self.committed.store(false, Ordering::Release);
        }
        if mode == SyncMode::Fast {
            let limit = derive_ancient_limit(self.checkpoint, height);
            self.ancient_limit.store(limit, Ordering::Release);
            let frozen = self.blockchain()?.ancients();
            // Writing below an already-frozen frontier would hole the
            // ancient store.
            if origin >= frozen && frozen != 0 {
                self.ancient_limit.store(0, Ordering::Release);
                log_info!("Disabling direct-ancient mode: origin {origin} ancient {}", frozen - 1);
            } else if limit > 0 {
                log_debug!("Enabling direct-ancient mode up to {limit}");
            }
            if origin + 1 < frozen {
                if let Err(err) = self.lightchain.set_head(origin + 1) {
                    return Err(SyncError::InvalidChain(err));
                }
            }
        }

        self.queue.prepare(origin + 1, mode);
        *self.pivot.write().expect("pivot lock") = if mode == SyncMode::Fast {
            pivot
        } else {
            None
        };

        log_debug!("Starting sync cycle from {origin} to {height}");
        let (proc_tx, proc_rx) = mpsc::channel::<Vec<BlockHeader>>(1);
        let (body_wake_tx, body_wake_rx) = mpsc::channel::<Wake>(1);
        let (receipt_wake_tx, receipt_wake_rx) = mpsc::channel::<Wake>(1);

        let mut tasks: JoinSet<Result<(), SyncError>> = JoinSet::new();
        {
            let dl = Arc::clone(self);
            let peer = Arc::clone(&peer);
            let body_wake = body_wake_tx.clone();
            let receipt_wake = receipt_wake_tx.clone();
            let cancel = self.cancel_watch()?;
            tasks.spawn(async move {
                dl.fetch_headers(peer, origin + 1, mode, header_rx, proc_tx, body_wake, receipt_wake, cancel)
                    .await
            });
        }
        {
            let dl = Arc::clone(self);
            let mut cancel = self.cancel_watch()?;
            let mut body_rx = body_rx;
            let mut body_wake_rx = body_wake_rx;
            tasks.spawn(async move {
                log_debug!("Downloading block bodies from {}", origin + 1);
                let result = dl
                    .fetch_parts::<BodiesKind>(&mut body_rx, &mut body_wake_rx, &(), &mut cancel)
                    .await;
                log_debug!("Block body download terminated: {result:?}");
                result
            });
        }
        {
            let dl = Arc::clone(self);
            let mut cancel = self.cancel_watch()?;
            let mut receipt_rx = receipt_rx;
            let mut receipt_wake_rx = receipt_wake_rx;
            tasks.spawn(async move {
                log_debug!("Downloading receipts from {}", origin + 1);
                let result = dl
                    .fetch_parts::<ReceiptsKind>(&mut receipt_rx, &mut receipt_wake_rx, &(), &mut cancel)
                    .await;
                log_debug!("Receipt download terminated: {result:?}");
                result
            });
        }
        {
            let dl = Arc::clone(self);
            let cancel = self.cancel_watch()?;
            tasks.spawn(async move {
                dl.process_headers(origin + 1, td, mode, proc_rx, body_wake_tx, receipt_wake_tx, cancel)
                    .await
            });
        }
        match mode {
            SyncMode::Full => {
                let dl = Arc::clone(self);
                tasks.spawn(async move { dl.process_full_sync_content().await });
            }
            SyncMode::Fast => {
                let dl = Arc::clone(self);
                let cancel = self.cancel_watch()?;
                tasks.spawn(async move { dl.process_fast_sync_content(cancel).await });
            }
            SyncMode::Light => {}
        }
        self.spawn_sync(tasks).await
    }

    /// Joins the per-sync tasks: the queue closes once only the content
    /// processor can still be blocked, and the first hard failure cancels
    /// the rest.
    async fn spawn_sync(&self, mut tasks: JoinSet<Result<(), SyncError>>) -> Result<(), SyncError> {
        let total = tasks.len();
        let mut finished = 0;
        let mut outcome: Result<(), SyncError> = Ok(());
        let mut aborted = false;
        while let Some(joined) = tasks.join_next().await {
            finished += 1;
            if finished == total - 1 {
                // Everyone else is done; unblock the last task's Results
                // call so it can drain and exit.
                self.queue.close();
            }
            let result = match joined {
                Ok(result) => result,
                Err(err) => {
                    log_error!("sync task failed to join: {err}");
                    Err(SyncError::Canceled)
                }
            };
            if !aborted {
                outcome = result;
                if let Err(err) = &outcome {
                    if *err != SyncError::Canceled {
                        aborted = true;
                        self.queue.close();
                        self.cancel();
                    }
                }
            }
        }
        self.queue.close();
        self.cancel();
        outcome
    }

    // ---- head & ancestor lookup ------------------------------------------

    /// Retrieves the remote head, and in fast mode the pivot header
    /// expected 64 blocks behind it.
    async fn fetch_head(
        &self,
        peer: &PeerConnection,
        mode: SyncMode,
        header_rx: &mut mpsc::Receiver<HeaderPack>,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<(BlockHeader, Option<BlockHeader>), SyncError> {
        log_debug!("Retrieving remote chain head from {}", peer.id);
        let (latest, _) = peer.head();
        let fetch = if mode == SyncMode::Fast { 2 } else { 1 };
        if let Err(err) =
            peer.request_headers_by_hash(latest, fetch, FS_MIN_FULL_BLOCKS - 1, true)
        {
            log_debug!("head request to {} failed: {err}", peer.id);
        }

        let ttl = self.request_ttl();
        let deadline = tokio::time::Instant::now() + ttl;
        loop {
            tokio::select! {
                _ = flagged(cancel_rx) => return Err(SyncError::Canceled),

                maybe = header_rx.recv() => {
                    let Some(pack) = maybe else { return Err(SyncError::Canceled) };
                    if pack.peer_id != peer.id {
                        log_debug!("Received headers from incorrect peer {}", pack.peer_id);
                        continue;
                    }
                    let headers = pack.headers;
                    if headers.is_empty() || headers.len() > fetch {
                        return Err(SyncError::BadPeer(format!(
                            "returned headers {} != requested {fetch}",
                            headers.len()
                        )));
                    }
                    // The first header needs to be the head, validated against
                    // the checkpoint height.
                    let head = headers[0].clone();
                    if (mode == SyncMode::Fast || mode == SyncMode::Light)
                        && head.number < self.checkpoint
                    {
                        return Err(SyncError::UnsyncedPeer);
                    }
                    if headers.len() == 1 {
                        if mode == SyncMode::Fast && head.number > FS_MIN_FULL_BLOCKS {
                            return Err(SyncError::BadPeer(
                                "no pivot included along head header".to_string(),
                            ));
                        }
                        log_debug!("Remote head identified at {}, no pivot", head.number);
                        return Ok((head, None));
                    }
                    let pivot = headers[1].clone();
                    if pivot.number != head.number - FS_MIN_FULL_BLOCKS {
                        return Err(SyncError::InvalidChain(format!(
                            "remote pivot {} != requested {}",
                            pivot.number,
                            head.number - FS_MIN_FULL_BLOCKS
                        )));
                    }
                    return Ok((head, Some(pivot)));
                }

                _ = tokio::time::sleep_until(deadline) => {
                    log_debug!("Waiting for head header timed out from {}", peer.id);
                    return Err(SyncError::Timeout);
                }
            }
        }
    }

    /// Finds the last common block between the local and remote chains:
    /// a single stride probe across the plausible window, then a binary
    /// search if the chains diverged longer ago.
    async fn find_ancestor(
        &self,
        peer: &PeerConnection,
        remote_header: &BlockHeader,
        mode: SyncMode,
        header_rx: &mut mpsc::Receiver<HeaderPack>,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<u64, SyncError> {
        let remote_height = remote_header.number;
        let local_height = match mode {
            SyncMode::Full => self.blockchain()?.current_block().number(),
            SyncMode::Fast => self.blockchain()?.current_fast_block().number(),
            SyncMode::Light => self.lightchain.current_header().number,
        };
        log_debug!("Looking for common ancestor: local {local_height} remote {remote_height}");

        let max_fork_ancestry = if mode == SyncMode::Light {
            LIGHT_IMMUTABILITY_THRESHOLD
        } else {
            FULL_IMMUTABILITY_THRESHOLD
        };
        let mut floor: i64 = -1;
        if local_height >= max_fork_ancestry {
            floor = (local_height - max_fork_ancestry) as i64;
        }
        // A light chain may start from a trusted non-genesis header; never
        // probe below its actual root.
        if mode == SyncMode::Light {
            if self.genesis.load(Ordering::Relaxed) == 0 {
                let mut header = Some(self.lightchain.current_header());
                while let Some(current) = header {
                    self.genesis.store(current.number, Ordering::Relaxed);
                    if floor >= current.number as i64 - 1 {
                        break;
                    }
                    header = self.lightchain.header_by_hash(&current.parent_hash);
                }
            }
            let genesis = self.genesis.load(Ordering::Relaxed) as i64;
            if floor < genesis - 1 {
                floor = genesis - 1;
            }
        }

        let (from, count, skip, max) = calculate_request_span(remote_height, local_height);
        log_trace!("Span searching for common ancestor: count {count} from {from} skip {skip}");
        if let Err(err) = peer.request_headers_by_number(from, count, skip, false) {
            log_debug!("span probe to {} failed: {err}", peer.id);
        }

        let mut number = 0u64;
        let mut hash: Option<Hash256> = None;

        let ttl = self.request_ttl();
        let deadline = tokio::time::Instant::now() + ttl;
        'probe: loop {
            tokio::select! {
                _ = flagged(cancel_rx) => return Err(SyncError::Canceled),

                maybe = header_rx.recv() => {
                    let Some(pack) = maybe else { return Err(SyncError::Canceled) };
                    if pack.peer_id != peer.id {
                        log_debug!("Received headers from incorrect peer {}", pack.peer_id);
                        continue;
                    }
                    let headers = pack.headers;
                    if headers.is_empty() {
                        log_warn!("Empty head header set from {}", peer.id);
                        return Err(SyncError::EmptyHeaderSet);
                    }
                    for (i, header) in headers.iter().enumerate() {
                        let expected = from + (i as u64) * (skip + 1);
                        if header.number != expected {
                            log_warn!(
                                "Head headers broke chain ordering: index {i} requested {expected} received {}",
                                header.number
                            );
                            return Err(SyncError::BadPeer(
                                "head headers broke chain ordering".to_string(),
                            ));
                        }
                    }
                    for header in headers.iter().rev() {
                        if header.number < from || header.number > max {
                            continue;
                        }
                        let h = header.hash();
                        let n = header.number;
                        if self.is_known(mode, &h, n) {
                            number = n;
                            hash = Some(h);
                            break;
                        }
                    }
                    break 'probe;
                }

                _ = tokio::time::sleep_until(deadline) => {
                    log_debug!("Waiting for span headers timed out from {}", peer.id);
                    return Err(SyncError::Timeout);
                }
            }
        }

        if let Some(hash) = hash {
            if number as i64 <= floor {
                log_warn!("Ancestor {number} below allowance {floor}");
                return Err(SyncError::InvalidAncestor);
            }
            log_debug!("Found common ancestor {number} ({})", hash256_to_hex(&hash));
            return Ok(number);
        }

        // No luck in the recent window; binary search the whole span.
        let mut start = if floor > 0 { floor as u64 } else { 0 };
        let mut end = remote_height;
        log_trace!("Binary searching for common ancestor: start {start} end {end}");
        while start + 1 < end {
            let check = (start + end) / 2;
            if let Err(err) = peer.request_headers_by_number(check, 1, 0, false) {
                log_debug!("search probe to {} failed: {err}", peer.id);
            }
            let ttl = self.request_ttl();
            let deadline = tokio::time::Instant::now() + ttl;
            'search: loop {
                tokio::select! {
                    _ = flagged(cancel_rx) => return Err(SyncError::Canceled),

                    maybe = header_rx.recv() => {
                        let Some(pack) = maybe else { return Err(SyncError::Canceled) };
                        if pack.peer_id != peer.id {
                            log_debug!("Received headers from incorrect peer {}", pack.peer_id);
                            continue;
                        }
                        let headers = pack.headers;
                        if headers.len() != 1 {
                            return Err(SyncError::BadPeer(format!(
                                "multiple headers ({}) for single request",
                                headers.len()
                            )));
                        }
                        let h = headers[0].hash();
                        let n = headers[0].number;
                        if !self.is_known(mode, &h, n) {
                            end = check;
                            break 'search;
                        }
                        // The peer must answer with the height we asked for.
                        let local = self.lightchain.header_by_hash(&h);
                        match local {
                            Some(header) if header.number == check => {}
                            _ => {
                                return Err(SyncError::BadPeer(format!(
                                    "non-requested header ({n})"
                                )));
                            }
                        }
                        start = check;
                        break 'search;
                    }

                    _ = tokio::time::sleep_until(deadline) => {
                        log_debug!("Waiting for search header timed out from {}", peer.id);
                        return Err(SyncError::Timeout);
                    }
                }
            }
        }
        if start as i64 <= floor {
            log_warn!("Ancestor {start} below allowance {floor}");
            return Err(SyncError::InvalidAncestor);
        }
        log_debug!("Found common ancestor {start}");
        Ok(start)
    }

    fn is_known(&self, mode: SyncMode, hash: &Hash256, number: u64) -> bool {
        match (mode, &self.blockchain) {
            (SyncMode::Full, Some(chain)) => chain.has_block(hash, number),
            (SyncMode::Fast, Some(chain)) => chain.has_fast_block(hash, number),
            _ => self.lightchain.has_header(hash, number),
        }
    }

    // ---- header pipeline ---------------------------------------------------

    /// Keeps headers flowing from the master peer: skeleton batches while
    /// the remote has depth, then contiguous tail fetches, with pivot
    /// freshness probes woven between batches during fast sync.
    #[allow(clippy::too_many_arguments)]
    async fn fetch_headers(
        self: Arc<Self>,
        peer: Arc<PeerConnection>,
        start: u64,
        mode: SyncMode,
        mut header_rx: mpsc::Receiver<HeaderPack>,
        proc_tx: mpsc::Sender<Vec<BlockHeader>>,
        body_wake_tx: mpsc::Sender<Wake>,
        receipt_wake_tx: mpsc::Sender<Wake>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        log_debug!("Directing header downloads from {} at {start}", peer.id);
        let mut skeleton = true;
        let mut pivoting = false;
        let mut from = start;
        let ancestor = start;
        let mut deadline: Option<tokio::time::Instant> = None;

        let issue_headers = |skeleton: bool, from: u64| {
            if skeleton {
                log_trace!("Fetching skeleton headers from {from}");
                peer.request_headers_by_number(
                    from + MAX_HEADER_FETCH as u64 - 1,
                    MAX_SKELETON_SIZE,
                    MAX_HEADER_FETCH as u64 - 1,
                    false,
                )
            } else {
                log_trace!("Fetching full headers from {from}");
                peer.request_headers_by_number(from, MAX_HEADER_FETCH, 0, false)
            }
        };
        let issue_pivot_probe = |pivot: u64| {
            log_trace!("Fetching next pivot header at {}", pivot + FS_MIN_FULL_BLOCKS);
            peer.request_headers_by_number(
                pivot + FS_MIN_FULL_BLOCKS,
                2,
                FS_MIN_FULL_BLOCKS - 9,
                false,
            )
        };

        if let Err(err) = issue_headers(skeleton, from) {
            log_debug!("header request to {} failed: {err}", peer.id);
        }
        deadline = Some(tokio::time::Instant::now() + self.request_ttl());

        let result = loop {
            tokio::select! {
                _ = flagged(&mut cancel_rx) => break Err(SyncError::Canceled),

                maybe = header_rx.recv() => {
                    let Some(pack) = maybe else { break Err(SyncError::Canceled) };
                    if pack.peer_id != peer.id {
                        log_debug!("Received skeleton from incorrect peer {}", pack.peer_id);
                        continue;
                    }
                    deadline = None;
                    let pivot = self.pivot_number();

                    if pivoting {
                        pivoting = false;
                        if pack.headers.len() == 2 {
                            let have = pack.headers[0].number;
                            let want = pivot + FS_MIN_FULL_BLOCKS;
                            if have != want {
                                log_warn!("Peer sent invalid next pivot: have {have} want {want}");
                                break Err(SyncError::InvalidChain(format!(
                                    "next pivot number {have} != requested {want}"
                                )));
                            }
                            let have = pack.headers[1].number;
                            let want = pivot + 2 * FS_MIN_FULL_BLOCKS - 8;
                            if have != want {
                                log_warn!("Peer sent invalid pivot confirmer: have {have} want {want}");
                                break Err(SyncError::InvalidChain(format!(
                                    "next pivot confirmer number {have} != requested {want}"
                                )));
                            }
                            log_warn!(
                                "Pivot seemingly stale, moving: old {pivot} new {}",
                                pack.headers[0].number
                            );
                            *self.pivot.write().expect("pivot lock") = Some(pack.headers[0].clone());
                            rawdata::write_last_pivot_number(&*self.state_db, pack.headers[0].number);
                        }
                        if let Err(err) = issue_headers(skeleton, from) {
                            log_debug!("header request to {} failed: {err}", peer.id);
                        }
                        deadline = Some(tokio::time::Instant::now() + self.request_ttl());
                        continue;
                    }

                    // An empty skeleton means the remote has fewer than one
                    // stride of headers left; switch to direct fetching.
                    if skeleton && pack.headers.is_empty() {
                        skeleton = false;
                        if let Err(err) = issue_headers(skeleton, from) {
                            log_debug!("header request to {} failed: {err}", peer.id);
                        }
                        deadline = Some(tokio::time::Instant::now() + self.request_ttl());
                        continue;
                    }

                    if pack.headers.is_empty() {
                        // Headers below the pivot may legitimately dry up
                        // while the pivot commit is still outstanding.
                        if !self.is_committed() && pivot <= from {
                            log_debug!("No headers, waiting for pivot commit");
                            tokio::select! {
                                _ = tokio::time::sleep(self.config.header_cont_check()) => {
                                    if let Err(err) = issue_headers(skeleton, from) {
                                        log_debug!("header request to {} failed: {err}", peer.id);
                                    }
                                    deadline = Some(tokio::time::Instant::now() + self.request_ttl());
                                    continue;
                                }
                                _ = flagged(&mut cancel_rx) => break Err(SyncError::Canceled),
                            }
                        }
                        log_debug!("No more headers available from {}", peer.id);
                        tokio::select! {
                            sent = proc_tx.send(Vec::new()) => {
                                break match sent {
                                    Ok(()) => Ok(()),
                                    Err(_) => Err(SyncError::Canceled),
                                };
                            }
                            _ = flagged(&mut cancel_rx) => break Err(SyncError::Canceled),
                        }
                    }

                    let mut headers = pack.headers;
                    if skeleton {
                        match self
                            .fill_header_skeleton(from, headers, &mut header_rx, &proc_tx, &mut cancel_rx)
                            .await
                        {
                            Ok((filled, proced)) => {
                                headers = filled[proced..].to_vec();
                                from += proced as u64;
                            }
                            Err(err @ (SyncError::Canceled | SyncError::Timeout)) => break Err(err),
                            Err(err) => {
                                log_debug!("Skeleton chain invalid: {err}");
                                break Err(SyncError::InvalidChain(err.to_string()));
                            }
                        }
                    } else if !headers.is_empty() {
                        // If the tip is moving while the local chain lags,
                        // hold back the last couple headers so a small
                        // reshuffle near the head is absorbed without a
                        // rollback.
                        let n = headers.len();
                        let mut head = if mode == SyncMode::Light {
                            self.lightchain.current_header().number
                        } else {
                            let chain = self.blockchain()?;
                            chain
                                .current_fast_block()
                                .number()
                                .max(chain.current_block().number())
                        };
                        if head < ancestor {
                            head = ancestor;
                        }
                        if head + REORG_PROT_THRESHOLD < headers[n - 1].number {
                            let delay = REORG_PROT_HEADER_DELAY.min(n);
                            headers.truncate(n - delay);
                        }
                    }

                    if !headers.is_empty() {
                        log_trace!("Scheduling {} new headers from {from}", headers.len());
                        let sent = tokio::select! {
                            sent = proc_tx.send(headers.clone()) => sent.is_ok(),
                            _ = flagged(&mut cancel_rx) => false,
                        };
                        if !sent {
                            break Err(SyncError::Canceled);
                        }
                        from += headers.len() as u64;
                        let pivot = self.pivot_number();
                        if skeleton && pivot > 0 {
                            pivoting = true;
                            if let Err(err) = issue_pivot_probe(pivot) {
                                log_debug!("pivot probe to {} failed: {err}", peer.id);
                            }
                        } else if let Err(err) = issue_headers(skeleton, from) {
                            log_debug!("header request to {} failed: {err}", peer.id);
                        }
                        deadline = Some(tokio::time::Instant::now() + self.request_ttl());
                    } else {
                        // Everything got delayed by reorg protection; give
                        // the chain a moment to catch up and retry.
                        log_trace!("All headers delayed, waiting");
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.header_cont_check()) => {
                                if let Err(err) = issue_headers(skeleton, from) {
                                    log_debug!("header request to {} failed: {err}", peer.id);
                                }
                                deadline = Some(tokio::time::Instant::now() + self.request_ttl());
                            }
                            _ = flagged(&mut cancel_rx) => break Err(SyncError::Canceled),
                        }
                    }
                }

                _ = sleep_until_opt(deadline) => {
                    if !self.has_drop_peer() {
                        log_warn!(
                            "Downloader wants to drop peer {}, but no drop callback is set",
                            peer.id
                        );
                        deadline = None;
                        continue;
                    }
                    log_debug!("Header request to {} timed out", peer.id);
                    self.metrics.header_timeout.fetch_add(1, Ordering::Relaxed);
                    self.drop_peer_by_id(&peer.id);

                    // Flush the pipeline so the sibling tasks can exit.
                    for wake in [&body_wake_tx, &receipt_wake_tx] {
                        tokio::select! {
                            _ = wake.send(Wake::NoMore) => {}
                            _ = flagged(&mut cancel_rx) => {}
                        }
                    }
                    tokio::select! {
                        _ = proc_tx.send(Vec::new()) => {}
                        _ = flagged(&mut cancel_rx) => {}
                    }
                    break Err(SyncError::BadPeer("header request timed out".to_string()));
                }
            }
        };
        log_debug!("Header download terminated: {result:?}");
        result
    }

    /// Concurrently retrieves the fill headers of a freshly fetched
    /// skeleton batch from every idle peer.
    async fn fill_header_skeleton(
        &self,
        from: u64,
        skeleton: Vec<BlockHeader>,
        header_rx: &mut mpsc::Receiver<HeaderPack>,
        proc_tx: &mpsc::Sender<Vec<BlockHeader>>,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<(Vec<BlockHeader>, usize), SyncError> {
        log_debug!("Filling up skeleton from {from}");
        self.queue.schedule_skeleton(from, &skeleton);

        // The fill has no upstream wake source; completion is detected
        // straight off the queue. The channel exists to satisfy the
        // shared driver and stays silent.
        let (_wake_tx, mut wake_rx) = mpsc::channel::<Wake>(1);
        let result = self
            .fetch_parts::<HeadersKind>(header_rx, &mut wake_rx, proc_tx, cancel_rx)
            .await;
        log_debug!("Skeleton fill terminated: {result:?}");

        let (filled, proced) = self.queue.retrieve_headers();
        result.map(|()| (filled, proced))
    }

    /// Takes the assembled header runs, verifies and stores them, and
    /// feeds the body/receipt schedulers. On a failed insert it rolls the
    /// header chain back to a safety margin below the failure.
    #[allow(clippy::too_many_arguments)]
    async fn process_headers(
        self: Arc<Self>,
        start: u64,
        td: U256,
        mode: SyncMode,
        mut proc_rx: mpsc::Receiver<Vec<BlockHeader>>,
        body_wake_tx: mpsc::Sender<Wake>,
        receipt_wake_tx: mpsc::Sender<Wake>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        let mut rollback: u64 = 0;
        let mut rollback_reason = String::new();
        let mut got_headers = false;
        let mut origin = start;

        let result = 'processing: loop {
            let headers = tokio::select! {
                _ = flagged(&mut cancel_rx) => {
                    rollback_reason = "sync canceled".to_string();
                    break 'processing Err(SyncError::Canceled);
                }
                maybe = proc_rx.recv() => match maybe {
                    Some(headers) => headers,
                    None => break 'processing Err(SyncError::Canceled),
                },
            };

            if headers.is_empty() {
                // Header stream exhausted: notify the content fetchers.
                for wake in [&body_wake_tx, &receipt_wake_tx] {
                    tokio::select! {
                        _ = wake.send(Wake::NoMore) => {}
                        _ = flagged(&mut cancel_rx) => {}
                    }
                }
                // A peer that promised a heavier chain and moved nothing
                // past our own head was stalling all along.
                if mode != SyncMode::Light {
                    let chain = self.blockchain()?;
                    let head = chain.current_block();
                    let local_td = chain
                        .total_difficulty(&head.hash(), head.number())
                        .unwrap_or_default();
                    if !got_headers && td > local_td {
                        break 'processing Err(SyncError::StallingPeer);
                    }
                }
                if mode == SyncMode::Fast || mode == SyncMode::Light {
                    let head = self.lightchain.current_header();
                    let local_td = self
                        .lightchain
                        .total_difficulty(&head.hash(), head.number)
                        .unwrap_or_default();
                    if td > local_td {
                        break 'processing Err(SyncError::StallingPeer);
                    }
                }
                // Clean exit: disable the rollback cushion.
                rollback = 0;
                break 'processing Ok(());
            }
            got_headers = true;

            let mut rest = headers;
            while !rest.is_empty() {
                if *cancel_rx.borrow() {
                    rollback_reason = "sync canceled".to_string();
                    break 'processing Err(SyncError::Canceled);
                }
                let limit = MAX_HEADERS_PROCESS.min(rest.len());
                let chunk: Vec<BlockHeader> = rest.drain(..limit).collect();

                if mode == SyncMode::Fast || mode == SyncMode::Light {
                    let pivot = self.pivot_number();
                    let last = chunk[chunk.len() - 1].number;
                    let frequency = if last + FS_HEADER_FORCE_VERIFY > pivot {
                        1
                    } else {
                        FS_HEADER_CHECK_FREQUENCY
                    };
                    if let Err(err) = self.lightchain.insert_header_chain(&chunk, frequency) {
                        rollback_reason = err.to_string();
                        // Partial inserts leave unverified headers behind;
                        // arm the rollback at the chunk start.
                        if (mode == SyncMode::Fast || frequency > 1)
                            && err.index > 0
                            && rollback == 0
                        {
                            rollback = chunk[0].number;
                        }
                        log_warn!(
                            "Invalid header encountered at {}: {}",
                            chunk[err.index.min(chunk.len() - 1)].number,
                            err.message
                        );
                        break 'processing Err(SyncError::InvalidChain(err.message));
                    }
                    if mode == SyncMode::Fast {
                        rollback = if last > FS_HEADER_SAFETY_NET {
                            last - FS_HEADER_SAFETY_NET
                        } else {
                            1
                        };
                    }
                }

                if mode == SyncMode::Full || mode == SyncMode::Fast {
                    // Backpressure: let the content pipeline drain before
                    // scheduling yet more retrievals.
                    while self.queue.pending_blocks() >= MAX_QUEUED_HEADERS
                        || self.queue.pending_receipts() >= MAX_QUEUED_HEADERS
                    {
                        tokio::select! {
                            _ = flagged(&mut cancel_rx) => {
                                rollback_reason = "sync canceled".to_string();
                                break 'processing Err(SyncError::Canceled);
                            }
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                    let inserts = self.queue.schedule(&chunk, origin);
                    if inserts.len() != chunk.len() {
                        rollback_reason = format!(
                            "stale headers: scheduled {} of {}",
                            inserts.len(),
                            chunk.len()
                        );
                        break 'processing Err(SyncError::BadPeer("stale headers".to_string()));
                    }
                }
                origin += limit as u64;
            }

            {
                let mut stats = self.sync_stats.write().expect("sync stats lock");
                if stats.height < origin {
                    stats.height = origin - 1;
                }
            }
            for wake in [&body_wake_tx, &receipt_wake_tx] {
                let _ = wake.try_send(Wake::Data);
            }
        };

        if rollback > 0 {
            let last_header = self.lightchain.current_header().number;
            let (last_fast, last_block) = match (&self.blockchain, mode) {
                (Some(chain), m) if m != SyncMode::Light => (
                    chain.current_fast_block().number(),
                    chain.current_block().number(),
                ),
                _ => (0, 0),
            };
            if let Err(err) = self.lightchain.set_head(rollback - 1) {
                log_error!("Failed to roll back chain segment to {}: {err}", rollback - 1);
            }
            let (cur_fast, cur_block) = match (&self.blockchain, mode) {
                (Some(chain), m) if m != SyncMode::Light => (
                    chain.current_fast_block().number(),
                    chain.current_block().number(),
                ),
                _ => (0, 0),
            };
            log_warn!(
                "Rolled back chain segment: header {last_header}->{} fast {last_fast}->{cur_fast} block {last_block}->{cur_block} ({rollback_reason})",
                self.lightchain.current_header().number
            );
        }
        result
    }

    // ---- content pipeline ---------------------------------------------------

    async fn process_full_sync_content(self: Arc<Self>) -> Result<(), SyncError> {
        loop {
            let results = self.queue.results(true).await;
            if results.is_empty() {
                return Ok(());
            }
            self.import_block_results(results)?;
        }
    }

    fn import_block_results(&self, results: Vec<FetchResult>) -> Result<(), SyncError> {
        if results.is_empty() {
            return Ok(());
        }
        if self.is_quitting() {
            return Err(SyncError::CancelContentProcessing);
        }
        let first = &results[0].header;
        let last = &results[results.len() - 1].header;
        log_debug!(
            "Inserting downloaded chain: {} items from {} to {}",
            results.len(),
            first.number,
            last.number
        );
        let blocks: Vec<Block> = results
            .into_iter()
            .map(|result| {
                Block::new(
                    result.header,
                    BlockBody {
                        transactions: result.transactions,
                        uncles: result.uncles,
                    },
                )
            })
            .collect();
        if let Err(err) = self.blockchain()?.insert_chain(blocks) {
            log_debug!("Downloaded item processing failed: {err}");
            return Err(SyncError::InvalidChain(err.to_string()));
        }
        Ok(())
    }

    /// Fast-sync driver: commits pre-pivot blocks with their receipts,
    /// waits for the pivot state to finish syncing, atomically promotes
    /// the pivot, and runs everything above it through full execution.
    async fn process_fast_sync_content(
        self: Arc<Self>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        let Some(initial_pivot) = self.pivot.read().expect("pivot lock").clone() else {
            return Err(SyncError::InvalidChain("fast sync started without a pivot".to_string()));
        };
        let mut sync = self.sync_state(initial_pivot.state_root).await;
        self.spawn_close_on_err(Arc::clone(&sync));

        let mut old_pivot: Option<FetchResult> = None;
        let mut old_tail: Vec<FetchResult> = Vec::new();

        loop {
            // Only block when no pivot block is waiting on its state.
            let mut results = self.queue.results(old_pivot.is_none()).await;
            if results.is_empty() {
                if old_pivot.is_none() {
                    sync.cancel();
                    return match sync.wait().await {
                        Err(SyncError::CancelStateFetch) | Err(SyncError::Canceled) => Ok(()),
                        other => other,
                    };
                }
                if *cancel_rx.borrow() {
                    sync.cancel();
                    return Err(SyncError::Canceled);
                }
            }

            let mut pivot = match self.pivot.read().expect("pivot lock").clone() {
                Some(pivot) => pivot,
                None => {
                    sync.cancel();
                    return Err(SyncError::InvalidChain("fast sync lost its pivot".to_string()));
                }
            };
            if old_pivot.is_none() {
                // The header fetcher may have moved the pivot; re-root.
                if pivot.state_root != sync.root {
                    sync.cancel();
                    sync = self.sync_state(pivot.state_root).await;
                    self.spawn_close_on_err(Arc::clone(&sync));
                }
            } else {
                let mut merged = Vec::with_capacity(1 + old_tail.len() + results.len());
                merged.extend(old_pivot.clone());
                merged.append(&mut old_tail);
                merged.append(&mut results);
                results = merged;
            }

            if !self.is_committed() {
                if let Some(latest) = results.last().map(|r| r.header.number) {
                    if latest
                        >= pivot.number + 2 * FS_MIN_FULL_BLOCKS - REORG_PROT_HEADER_DELAY as u64
                    {
                        let needed = FS_MIN_FULL_BLOCKS as usize - REORG_PROT_HEADER_DELAY + 1;
                        if results.len() < needed {
                            sync.cancel();
                            return Err(SyncError::BadPeer(format!(
                                "pivot reselection with {} results, need {needed}",
                                results.len()
                            )));
                        }
                        let index = results.len() + REORG_PROT_HEADER_DELAY
                            - 1
                            - FS_MIN_FULL_BLOCKS as usize;
                        let new_pivot = results[index].header.clone();
                        log_warn!(
                            "Pivot became stale, moving: old {} new {}",
                            pivot.number,
                            new_pivot.number
                        );
                        pivot = new_pivot.clone();
                        *self.pivot.write().expect("pivot lock") = Some(new_pivot);
                        rawdata::write_last_pivot_number(&*self.state_db, pivot.number);
                    }
                }
            }

            let (pivot_result, before, after) = split_around_pivot(pivot.number, results);
            if let Err(err) = self.commit_fast_sync_data(before, &sync).await {
                sync.cancel();
                return Err(err);
            }
            if let Some(pivot_result) = pivot_result {
                let fresh = old_pivot
                    .as_ref()
                    .map(|old| old.header.hash() != pivot_result.header.hash())
                    .unwrap_or(true);
                if fresh {
                    sync.cancel();
                    sync = self.sync_state(pivot_result.header.state_root).await;
                    self.spawn_close_on_err(Arc::clone(&sync));
                    old_pivot = Some(pivot_result.clone());
                }
                tokio::select! {
                    _ = sync.done() => {
                        if let Some(err) = sync.error() {
                            return Err(err);
                        }
                        self.commit_pivot_block(&pivot_result)?;
                        old_pivot = None;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        old_tail = after;
                        continue;
                    }
                }
            }
            if let Err(err) = self.import_block_results(after) {
                sync.cancel();
                return Err(err);
            }
        }
    }

    async fn commit_fast_sync_data(
        &self,
        results: Vec<FetchResult>,
        sync: &StateSync,
    ) -> Result<(), SyncError> {
        if results.is_empty() {
            return Ok(());
        }
        if self.is_quitting() {
            return Err(SyncError::CancelContentProcessing);
        }
        // A dead state sync poisons the whole fast sync.
        if sync.is_done() {
            sync.wait().await?;
        }
        let first = &results[0].header;
        let last = &results[results.len() - 1].header;
        log_debug!(
            "Inserting fast-sync blocks: {} items from {} to {}",
            results.len(),
            first.number,
            last.number
        );
        let mut blocks = Vec::with_capacity(results.len());
        let mut receipts = Vec::with_capacity(results.len());
        for result in results {
            receipts.push(result.receipts);
            blocks.push(Block::new(
                result.header,
                BlockBody {
                    transactions: result.transactions,
                    uncles: result.uncles,
                },
            ));
        }
        let ancient_limit = self.ancient_limit.load(Ordering::Acquire);
        if let Err(err) = self
            .blockchain()?
            .insert_receipt_chain(blocks, receipts, ancient_limit)
        {
            log_debug!("Downloaded item processing failed: {err}");
            return Err(SyncError::InvalidChain(err.to_string()));
        }
        Ok(())
    }

    fn commit_pivot_block(&self, result: &FetchResult) -> Result<(), SyncError> {
        let block = Block::new(
            result.header.clone(),
            BlockBody {
                transactions: result.transactions.clone(),
                uncles: result.uncles.clone(),
            },
        );
        log_debug!(
            "Committing fast sync pivot as new head: {} ({})",
            block.number(),
            hash256_to_hex(&block.hash())
        );
        let ancient_limit = self.ancient_limit.load(Ordering::Acquire);
        let chain = self.blockchain()?;
        chain
            .insert_receipt_chain(vec![block.clone()], vec![result.receipts.clone()], ancient_limit)
            .map_err(|err| SyncError::InvalidChain(err.to_string()))?;
        chain
            .fast_sync_commit_head(&block.hash())
            .map_err(SyncError::InvalidChain)?;
        self.committed.store(true, Ordering::Release);
        // The pivot state is on disk now; presence filtering is over.
        if let Some(bloom) = &self.state_bloom {
            bloom.close();
        }
        Ok(())
    }

    // ---- state sync plumbing ----------------------------------------------

    /// Starts (or queues) a state-trie sync for the given root.
    async fn sync_state(&self, root: Hash256) -> Arc<StateSync> {
        let sched = self.scheduler_factory.make(root);
        let (handle, run) = statesync::new_run(root, sched);
        let mut quit_rx = self.quit_watch();
        tokio::select! {
            sent = self.state_start_tx.send(run) => match sent {
                Ok(()) => handle,
                Err(_) => statesync::dead_session(root),
            },
            _ = flagged(&mut quit_rx) => statesync::dead_session(root),
        }
    }

    /// A failed state sync must abort block commits too: close the queue
    /// so every sibling task unblocks and the sync winds down.
    fn spawn_close_on_err(self: &Arc<Self>, sync: Arc<StateSync>) {
        let dl = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = sync.wait().await {
                if !matches!(err, SyncError::CancelStateFetch | SyncError::Canceled) {
                    log_warn!("State sync failed, terminating download: {err}");
                    dl.queue.close();
                }
            }
        });
    }

    // ---- QoS tuning ----------------------------------------------------------

    async fn qos_tuner(self: Arc<Self>) {
        let mut quit_rx = self.quit_watch();
        loop {
            self.qos.tune(self.peers.median_rtt(self.config.rtt_max()));
            log_trace!(
                "Recalculated downloader QoS values: rtt {:?} confidence {:.3} ttl {:?}",
                self.qos.estimate(),
                self.qos.confidence(),
                self.request_ttl()
            );
            tokio::select! {
                _ = flagged(&mut quit_rx) => return,
                _ = tokio::time::sleep(self.qos.estimate()) => {}
            }
        }
    }

    // ---- shared helpers -------------------------------------------------------

    fn blockchain(&self) -> Result<&Arc<dyn BlockChain>, SyncError> {
        self.blockchain.as_ref().ok_or_else(|| {
            SyncError::InvalidChain("no block store configured for this mode".to_string())
        })
    }

    fn current_mode(&self) -> SyncMode {
        SyncMode::from_u32(self.mode.load(Ordering::Acquire))
    }

    fn cancel_watch(&self) -> Result<watch::Receiver<bool>, SyncError> {
        let guard = self.active.lock().expect("active sync lock");
        match &*guard {
            Some(active) => Ok(active.cancel_tx.subscribe()),
            None => Err(SyncError::NoSyncActive),
        }
    }

    pub(crate) fn quit_watch(&self) -> watch::Receiver<bool> {
        self.quit_tx.subscribe()
    }

    fn is_quitting(&self) -> bool {
        *self.quit_tx.subscribe().borrow()
    }

    fn pivot_number(&self) -> u64 {
        self.pivot
            .read()
            .expect("pivot lock")
            .as_ref()
            .map(|p| p.number)
            .unwrap_or(0)
    }

    fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    pub(crate) fn has_drop_peer(&self) -> bool {
        self.drop_peer.is_some()
    }

    pub(crate) fn is_master_peer(&self, id: &str) -> bool {
        self.active
            .lock()
            .expect("active sync lock")
            .as_ref()
            .map(|active| active.peer_id == id)
            .unwrap_or(false)
    }

    /// Asks the transport to disconnect the peer; without a callback the
    /// engine only logs and carries on.
    pub(crate) fn drop_peer_by_id(&self, id: &str) {
        match &self.drop_peer {
            Some(callback) => callback(id),
            None => log_warn!("Downloader wants to drop peer {id}, but no drop callback is set"),
        }
    }

    pub(crate) fn state_idle_peers(&self) -> (Vec<Arc<PeerConnection>>, usize) {
        self.peers.state_idle_peers()
    }

    pub(crate) fn sync_bloom(&self) -> Option<&Arc<SyncBloom>> {
        self.state_bloom.as_ref()
    }

    pub(crate) fn set_state_pending(&self, pending: u64) {
        self.state_pending.store(pending, Ordering::Relaxed);
    }

    pub(crate) fn state_processed(&self) -> u64 {
        self.state_processed.load(Ordering::Relaxed)
    }

    pub(crate) fn add_state_processed(&self, delta: u64) -> u64 {
        self.state_processed.fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub(crate) fn record_state_delivery(&self, delivered: usize, total: usize) {
        self.metrics
            .state_in
            .fetch_add(total as u64, Ordering::Relaxed);
        self.metrics
            .state_drop
            .fetch_add((total - delivered.min(total)) as u64, Ordering::Relaxed);
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Height below which fast sync may write straight into the frozen
/// store. The checkpoint wins over the head-derived bound whenever both
/// clear the immutability threshold: it is operator-trusted, while the
/// head is only peer-reported.
fn derive_ancient_limit(checkpoint: u64, height: u64) -> u64 {
    if checkpoint != 0 && checkpoint > FULL_IMMUTABILITY_THRESHOLD + 1 {
        checkpoint
    } else if height > FULL_IMMUTABILITY_THRESHOLD + 1 {
        height - FULL_IMMUTABILITY_THRESHOLD - 1
    } else {
        0
    }
}

/// Span-probe arithmetic: covers `local-1 ..= remote-1` with at most
/// `MAX_HEADER_FETCH / 16` headers at a stride between 2 and 16.
/// Returns `(from, count, skip, max)` where `skip` is stride - 1.
fn calculate_request_span(remote_height: u64, local_height: u64) -> (u64, usize, u64, u64) {
    let max_count = (MAX_HEADER_FETCH / 16) as i64;
    let request_head = (remote_height as i64 - 1).max(0);
    let request_bottom = (local_height as i64 - 1).max(0);
    let total_span = request_head - request_bottom;
    let span = (1 + total_span / max_count).clamp(2, 16);
    let count = (1 + total_span / span).clamp(2, max_count);
    let from = (request_head - (count - 1) * span).max(0);
    let max = from + (count - 1) * span;
    (from as u64, count as usize, (span - 1) as u64, max as u64)
}

fn split_around_pivot(
    pivot: u64,
    results: Vec<FetchResult>,
) -> (Option<FetchResult>, Vec<FetchResult>, Vec<FetchResult>) {
    if results.is_empty() {
        return (None, Vec::new(), Vec::new());
    }
    if results[results.len() - 1].header.number < pivot {
        // The pivot is beyond this batch; everything goes below it.
        return (None, results, Vec::new());
    }
    let mut p = None;
    let mut before = Vec::new();
    let mut after = Vec::new();
    for result in results {
        match result.header.number.cmp(&pivot) {
            std::cmp::Ordering::Less => before.push(result),
            std::cmp::Ordering::Equal => p = Some(result),
            std::cmp::Ordering::Greater => after.push(result),
        }
    }
    (p, before, after)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span_covers(remote: u64, local: u64) {
        let (from, count, skip, max) = calculate_request_span(remote, local);
        assert!(count >= 2 && count <= MAX_HEADER_FETCH / 16, "count {count}");
        assert!(skip >= 1 && skip <= 15, "skip {skip}");
        assert_eq!(max, from + (count as u64 - 1) * (skip + 1));
    }

    #[test]
    fn request_span_shapes() {
        span_covers(1500, 1000);
        span_covers(15000, 13006);
        span_covers(1200, 1150);
        span_covers(100, 0);
        span_covers(2, 0);

        // Close chains probe the last few blocks at the minimum stride.
        let (from, count, skip, max) = calculate_request_span(1200, 1196);
        assert_eq!(skip + 1, 2);
        assert_eq!(max, 1199);
        assert!(from <= 1195);
        assert!(count >= 2);
    }

    #[test]
    fn span_reaches_remote_head_minus_one() {
        for (remote, local) in [(500u64, 0u64), (1000, 999), (90_000, 42)] {
            let (_, _, _, max) = calculate_request_span(remote, local);
            assert_eq!(max, remote - 1);
        }
    }

    #[test]
    fn ancient_limit_prefers_checkpoint() {
        let threshold = FULL_IMMUTABILITY_THRESHOLD;
        // Neither bound clears the threshold.
        assert_eq!(derive_ancient_limit(0, 1_000), 0);
        assert_eq!(derive_ancient_limit(1_000, threshold), 0);
        // Only the head does.
        assert_eq!(
            derive_ancient_limit(0, threshold + 500),
            499
        );
        // Both qualify: the checkpoint wins.
        assert_eq!(
            derive_ancient_limit(threshold + 10_000, threshold + 50_000),
            threshold + 10_000
        );
    }
}
