//! Pivot-bound state-trie retrieval. The Merkle scheduling itself lives
//! behind [`StateScheduler`]; the engine owns request assignment,
//! deadlines, delivery accounting, and the session lifecycle consumed by
//! the fast-sync driver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, watch};

use emberd_log::{log_debug, log_warn};
use emberd_primitives::{hash256_to_hex, sha256d, Hash256};

use crate::error::SyncError;
use crate::fetch::StatePack;
use crate::peer::PeerConnection;
use crate::rawdata;
use crate::{flagged, Downloader, MAX_STATE_FETCH};

/// External Merkle scheduler for one state root. `missing` hands out node
/// hashes to fetch; `revert` gives back hashes whose request failed (ones
/// already processed are ignored); `process` consumes a delivered node.
pub trait StateScheduler: Send {
    fn missing(&mut self, max: usize) -> Vec<Hash256>;

    fn revert(&mut self, hashes: &[Hash256]);

    /// Returns whether the blob was wanted. `Ok(false)` marks an
    /// unrequested or duplicate node, which is ignored.
    fn process(&mut self, blob: &[u8]) -> Result<bool, String>;

    /// Nodes known about but not yet retrieved.
    fn pending(&self) -> usize;

    fn done(&self) -> bool;
}

/// Builds a scheduler per pivot root.
pub trait StateSchedulerFactory: Send + Sync {
    fn make(&self, root: Hash256) -> Box<dyn StateScheduler>;
}

/// Handle to one state-sync session, shared between the fast-sync driver
/// and the engine-lifetime state fetcher.
pub struct StateSync {
    pub root: Hash256,
    cancel_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    err: Mutex<Option<SyncError>>,
}

impl StateSync {
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Completion signal, select-friendly.
    pub async fn done(&self) {
        let mut rx = self.done_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Waits for completion and reports the session outcome. A session
    /// torn down by `cancel` reports `CancelStateFetch`.
    pub async fn wait(&self) -> Result<(), SyncError> {
        self.done().await;
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn error(&self) -> Option<SyncError> {
        self.err.lock().expect("state sync lock").clone()
    }

    fn finish(&self, done_tx: &watch::Sender<bool>, err: Option<SyncError>) {
        if self.is_done() {
            return;
        }
        *self.err.lock().expect("state sync lock") = err;
        let _ = done_tx.send(true);
    }
}

pub(crate) struct StateSyncRun {
    pub handle: Arc<StateSync>,
    done_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    sched: Box<dyn StateScheduler>,
}

pub(crate) fn new_run(root: Hash256, sched: Box<dyn StateScheduler>) -> (Arc<StateSync>, StateSyncRun) {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (done_tx, done_rx) = watch::channel(false);
    let handle = Arc::new(StateSync {
        root,
        cancel_tx,
        done_rx,
        err: Mutex::new(None),
    });
    let run = StateSyncRun {
        handle: Arc::clone(&handle),
        done_tx,
        cancel_rx,
        sched,
    };
    (handle, run)
}

/// A session that never ran: the engine is shutting down.
pub(crate) fn dead_session(root: Hash256) -> Arc<StateSync> {
    let (handle, run) = new_run(root, Box::new(NoopScheduler));
    handle.finish(&run.done_tx, Some(SyncError::CancelStateFetch));
    handle
}

struct NoopScheduler;

impl StateScheduler for NoopScheduler {
    fn missing(&mut self, _max: usize) -> Vec<Hash256> {
        Vec::new()
    }

    fn revert(&mut self, _hashes: &[Hash256]) {}

    fn process(&mut self, _blob: &[u8]) -> Result<bool, String> {
        Ok(false)
    }

    fn pending(&self) -> usize {
        0
    }

    fn done(&self) -> bool {
        true
    }
}

struct ActiveStateRequest {
    peer: Arc<PeerConnection>,
    hashes: Vec<Hash256>,
    deadline: Instant,
}

impl Downloader {
    /// Engine-lifetime dispatcher serialising state-sync sessions: only
    /// one session drives requests at any moment; a newly started session
    /// preempts the previous one.
    pub(crate) async fn state_fetcher(
        self: Arc<Self>,
        mut start_rx: mpsc::Receiver<StateSyncRun>,
        mut state_rx: mpsc::Receiver<StatePack>,
    ) {
        let mut quit_rx = self.quit_watch();
        let mut next: Option<StateSyncRun> = None;
        loop {
            let run = match next.take() {
                Some(run) => run,
                None => tokio::select! {
                    maybe = start_rx.recv() => match maybe {
                        Some(run) => run,
                        None => return,
                    },
                    _ = flagged(&mut quit_rx) => return,
                },
            };
            next = self
                .run_state_sync(run, &mut start_rx, &mut state_rx, &mut quit_rx)
                .await;
        }
    }

    async fn run_state_sync(
        &self,
        mut run: StateSyncRun,
        start_rx: &mut mpsc::Receiver<StateSyncRun>,
        state_rx: &mut mpsc::Receiver<StatePack>,
        quit_rx: &mut watch::Receiver<bool>,
    ) -> Option<StateSyncRun> {
        log_debug!("State sync starting for root {}", hash256_to_hex(&run.handle.root));
        let mut active: HashMap<String, ActiveStateRequest> = HashMap::new();
        let mut cancel_rx = run.cancel_rx.clone();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(100));

        loop {
            if run.sched.done() && active.is_empty() {
                self.set_state_pending(0);
                rawdata::write_fast_trie_progress(&*self.state_db, self.state_processed());
                run.handle.finish(&run.done_tx, None);
                log_debug!("State sync completed for root {}", hash256_to_hex(&run.handle.root));
                return None;
            }
            self.set_state_pending(run.sched.pending() as u64);

            // Hand out work to every idle state peer.
            if !run.sched.done() {
                let target_rtt = self.request_rtt();
                let ttl = self.request_ttl();
                let (idles, _) = self.state_idle_peers();
                for peer in idles {
                    if active.contains_key(&peer.id) {
                        continue;
                    }
                    let cap = peer.state_capacity(target_rtt).min(MAX_STATE_FETCH);
                    let hashes = run.sched.missing(cap);
                    if hashes.is_empty() {
                        break;
                    }
                    match peer.fetch_node_data(hashes.clone()) {
                        Ok(()) => {
                            active.insert(
                                peer.id.clone(),
                                ActiveStateRequest {
                                    peer: Arc::clone(&peer),
                                    hashes,
                                    deadline: Instant::now() + ttl,
                                },
                            );
                        }
                        Err(err) => {
                            log_debug!("state request to {} failed: {err}", peer.id);
                            run.sched.revert(&hashes);
                        }
                    }
                }
            }

            tokio::select! {
                maybe = start_rx.recv() => {
                    // The driver moved to a new root; the old session is
                    // expected to have been cancelled already.
                    for (_, req) in active.drain() {
                        run.sched.revert(&req.hashes);
                        req.peer.set_node_data_idle(0);
                    }
                    run.handle.finish(&run.done_tx, Some(SyncError::CancelStateFetch));
                    return maybe;
                }
                _ = flagged(&mut cancel_rx) => {
                    for (_, req) in active.drain() {
                        run.sched.revert(&req.hashes);
                        req.peer.set_node_data_idle(0);
                    }
                    run.handle.finish(&run.done_tx, Some(SyncError::CancelStateFetch));
                    return None;
                }
                _ = flagged(quit_rx) => {
                    run.handle.finish(&run.done_tx, Some(SyncError::CancelStateFetch));
                    return None;
                }
                maybe_pack = state_rx.recv() => {
                    let Some(pack) = maybe_pack else {
                        run.handle.finish(&run.done_tx, Some(SyncError::CancelStateFetch));
                        return None;
                    };
                    let Some(request) = active.remove(&pack.peer_id) else {
                        // Response to an already expired request.
                        log_debug!("stale state delivery from {}", pack.peer_id);
                        continue;
                    };
                    let mut delivered = 0usize;
                    let mut failure = None;
                    for blob in &pack.data {
                        match run.sched.process(blob) {
                            Ok(true) => {
                                delivered += 1;
                                if let Some(bloom) = self.sync_bloom() {
                                    bloom.add(&sha256d(blob));
                                }
                            }
                            Ok(false) => {}
                            Err(err) => {
                                failure = Some(err);
                                break;
                            }
                        }
                    }
                    run.sched.revert(&request.hashes);
                    request.peer.set_node_data_idle(delivered);
                    self.record_state_delivery(delivered, pack.data.len());
                    if delivered > 0 {
                        let processed = self.add_state_processed(delivered as u64);
                        rawdata::write_fast_trie_progress(&*self.state_db, processed);
                    }
                    if let Some(err) = failure {
                        log_warn!("state delivery from {} unprocessable: {err}", pack.peer_id);
                        self.drop_peer_by_id(&pack.peer_id);
                        run.handle.finish(&run.done_tx, Some(SyncError::InvalidState(err)));
                        return None;
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let expired: Vec<String> = active
                        .iter()
                        .filter(|(_, req)| now >= req.deadline)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in expired {
                        if let Some(request) = active.remove(&id) {
                            log_warn!("state request to {id} timed out");
                            run.sched.revert(&request.hashes);
                            request.peer.set_node_data_idle(0);
                            self.drop_peer_by_id(&id);
                        }
                    }
                }
            }
        }
    }
}
