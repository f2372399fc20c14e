//! Scheduling truth of the download pipeline: skeleton slots, body and
//! receipt task pools, per-peer reservations with deadlines, and the
//! height-ordered result cache handed to the content processors.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::Notify;

use emberd_log::{log_debug, log_error, log_warn};
use emberd_primitives::block::{
    empty_receipt_root, empty_tx_root, empty_uncle_root, receipts_root, transactions_root,
    uncles_root,
};
use emberd_primitives::{hash256_to_hex, BlockHeader, Hash256, Receipt, Transaction};

use crate::error::SyncError;
use crate::mode::SyncMode;
use crate::{MAX_HEADER_FETCH, MAX_RESULTS_PROCESS};

const PENDING_BODY: u8 = 1;
const PENDING_RECEIPT: u8 = 2;

/// One outstanding retrieval assignment against a single peer.
#[derive(Clone, Debug)]
pub(crate) struct FetchRequest {
    pub peer: String,
    /// Skeleton fill start index; unused for body/receipt requests.
    pub from: u64,
    /// Headers whose bodies or receipts are wanted.
    pub headers: Vec<BlockHeader>,
    pub sent_at: Instant,
}

/// Assembly slot for one block: the header plus whichever parts the
/// active mode still owes it.
#[derive(Clone, Debug)]
pub(crate) struct FetchResult {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub uncles: Vec<BlockHeader>,
    pub receipts: Vec<Receipt>,
    pending: u8,
}

impl FetchResult {
    fn new(header: BlockHeader, fast: bool) -> Self {
        let mut pending = 0;
        if header.tx_root != empty_tx_root() || header.uncle_root != empty_uncle_root() {
            pending |= PENDING_BODY;
        }
        if fast && header.receipt_root != empty_receipt_root() {
            pending |= PENDING_RECEIPT;
        }
        Self {
            header,
            transactions: Vec::new(),
            uncles: Vec::new(),
            receipts: Vec::new(),
            pending,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }

    fn needs(&self, part: u8) -> bool {
        self.pending & part != 0
    }
}

enum SlotState<'a> {
    /// The height was already flushed out of the pipeline.
    Stale,
    /// The height does not fit the in-flight cache budget yet.
    Throttled,
    Slot(&'a mut FetchResult),
}

/// Height-ordered assembly line, bounded by the block-cache budget.
struct ResultCache {
    offset: u64,
    limit: usize,
    items: Vec<Option<FetchResult>>,
}

impl ResultCache {
    fn new(limit: usize) -> Self {
        Self {
            offset: 0,
            limit,
            items: Vec::new(),
        }
    }

    fn reserve_slot(&mut self, header: &BlockHeader, fast: bool) -> SlotState<'_> {
        if header.number < self.offset {
            return SlotState::Stale;
        }
        let index = (header.number - self.offset) as usize;
        if index >= self.limit {
            return SlotState::Throttled;
        }
        if self.items.len() <= index {
            self.items.resize(index + 1, None);
        }
        if self.items[index].is_none() {
            self.items[index] = Some(FetchResult::new(header.clone(), fast));
        }
        match &mut self.items[index] {
            Some(result) => SlotState::Slot(result),
            None => unreachable!("slot populated above"),
        }
    }

    fn slot_mut(&mut self, number: u64) -> Option<&mut FetchResult> {
        if number < self.offset {
            return None;
        }
        let index = (number - self.offset) as usize;
        self.items.get_mut(index)?.as_mut()
    }

    fn ready_count(&self) -> usize {
        self.items
            .iter()
            .take_while(|slot| matches!(slot, Some(result) if result.is_complete()))
            .count()
    }

    fn drain(&mut self, count: usize) -> Vec<FetchResult> {
        let mut out = Vec::with_capacity(count);
        for slot in self.items.drain(..count) {
            match slot {
                Some(result) => out.push(result),
                None => unreachable!("drained an unfinished slot"),
            }
        }
        self.offset += out.len() as u64;
        out
    }
}

struct Inner {
    mode: SyncMode,
    closed: bool,

    /// Hash of the newest scheduled header, for parent-link verification.
    header_head: Option<Hash256>,

    header_task_pool: HashMap<u64, BlockHeader>,
    header_task_queue: BTreeSet<u64>,
    header_peer_miss: HashMap<String, HashSet<u64>>,
    header_pend_pool: HashMap<String, FetchRequest>,
    header_results: Vec<Option<BlockHeader>>,
    header_offset: u64,
    header_proced: usize,

    block_task_pool: HashSet<Hash256>,
    block_task_queue: BTreeMap<u64, BlockHeader>,
    block_pend_pool: HashMap<String, FetchRequest>,

    receipt_task_pool: HashSet<Hash256>,
    receipt_task_queue: BTreeMap<u64, BlockHeader>,
    receipt_pend_pool: HashMap<String, FetchRequest>,

    results: ResultCache,
}

impl Inner {
    fn new(cache_limit: usize) -> Self {
        Self {
            mode: SyncMode::Full,
            closed: false,
            header_head: None,
            header_task_pool: HashMap::new(),
            header_task_queue: BTreeSet::new(),
            header_peer_miss: HashMap::new(),
            header_pend_pool: HashMap::new(),
            header_results: Vec::new(),
            header_offset: 0,
            header_proced: 0,
            block_task_pool: HashSet::new(),
            block_task_queue: BTreeMap::new(),
            block_pend_pool: HashMap::new(),
            receipt_task_pool: HashSet::new(),
            receipt_task_queue: BTreeMap::new(),
            receipt_pend_pool: HashMap::new(),
            results: ResultCache::new(cache_limit),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PartKind {
    Body,
    Receipt,
}

pub(crate) struct Queue {
    inner: Mutex<Inner>,
    resulted: Notify,
}

impl Queue {
    pub fn new(cache_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::new(cache_limit)),
            resulted: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("queue lock")
    }

    /// Drops every scheduled and in-flight item; run before each sync.
    pub fn reset(&self, cache_limit: usize) {
        let mut inner = self.lock();
        *inner = Inner::new(cache_limit);
    }

    /// Unblocks pending `results` calls; they drain what is complete and
    /// then report done.
    pub fn close(&self) {
        self.lock().closed = true;
        self.resulted.notify_waiters();
    }

    /// Repositions the pipeline head before a new sync.
    pub fn prepare(&self, offset: u64, mode: SyncMode) {
        let mut inner = self.lock();
        if inner.results.offset < offset {
            inner.results.offset = offset;
        }
        inner.mode = mode;
    }

    pub fn pending_headers(&self) -> usize {
        self.lock().header_task_queue.len()
    }

    pub fn pending_blocks(&self) -> usize {
        self.lock().block_task_queue.len()
    }

    pub fn pending_receipts(&self) -> usize {
        self.lock().receipt_task_queue.len()
    }

    pub fn in_flight_headers(&self) -> bool {
        !self.lock().header_pend_pool.is_empty()
    }

    pub fn in_flight_blocks(&self) -> bool {
        !self.lock().block_pend_pool.is_empty()
    }

    pub fn in_flight_receipts(&self) -> bool {
        !self.lock().receipt_pend_pool.is_empty()
    }

    /// All skeleton slots have been filled and handed over.
    pub fn header_fill_complete(&self) -> bool {
        self.lock().header_task_pool.is_empty()
    }

    /// Seeds the skeleton fill: slot `i` expects the 192 headers ending
    /// in `skeleton[i]`.
    pub fn schedule_skeleton(&self, from: u64, skeleton: &[BlockHeader]) {
        let mut inner = self.lock();
        if !inner.header_task_pool.is_empty() {
            log_error!("skeleton assembly already in progress; dropping stale fill");
        }
        inner.header_task_pool.clear();
        inner.header_task_queue.clear();
        inner.header_peer_miss.clear();
        inner.header_pend_pool.clear();
        inner.header_offset = from;
        inner.header_proced = 0;
        inner.header_results = vec![None; skeleton.len() * MAX_HEADER_FETCH];
        for (i, header) in skeleton.iter().enumerate() {
            let index = from + (i * MAX_HEADER_FETCH) as u64;
            inner.header_task_pool.insert(index, header.clone());
            inner.header_task_queue.insert(index);
        }
    }

    /// Hands the peer the next unreserved skeleton slot, skipping slots
    /// this peer already failed.
    pub fn reserve_headers(&self, peer_id: &str) -> Option<FetchRequest> {
        let mut inner = self.lock();
        if inner.header_pend_pool.contains_key(peer_id) {
            return None;
        }
        let missed = inner.header_peer_miss.get(peer_id).cloned().unwrap_or_default();
        let mut skipped = Vec::new();
        let mut send = None;
        while let Some(from) = inner.header_task_queue.pop_first() {
            if missed.contains(&from) {
                skipped.push(from);
                continue;
            }
            send = Some(from);
            break;
        }
        for from in skipped {
            inner.header_task_queue.insert(from);
        }
        let from = send?;
        let request = FetchRequest {
            peer: peer_id.to_string(),
            from,
            headers: Vec::new(),
            sent_at: Instant::now(),
        };
        inner.header_pend_pool.insert(peer_id.to_string(), request.clone());
        Some(request)
    }

    /// Validates a skeleton fill and drains every contiguous completed
    /// run into `proc_tx`. A rejected fill returns the slot to pending
    /// and marks it missed for this peer; the delivery itself counts as
    /// zero accepted headers.
    pub fn deliver_headers(
        &self,
        peer_id: &str,
        headers: Vec<BlockHeader>,
        proc_tx: &mpsc::Sender<Vec<BlockHeader>>,
    ) -> Result<usize, SyncError> {
        let mut inner = self.lock();
        let Some(request) = inner.header_pend_pool.remove(peer_id) else {
            return Err(SyncError::StaleDelivery);
        };
        let from = request.from;
        let Some(target) = inner.header_task_pool.get(&from).map(BlockHeader::hash) else {
            return Err(SyncError::StaleDelivery);
        };

        let mut accepted = headers.len() == MAX_HEADER_FETCH;
        if accepted && headers[headers.len() - 1].hash() != target {
            log_debug!(
                "skeleton fill from {} has wrong tail {}",
                from,
                hash256_to_hex(&headers[headers.len() - 1].hash())
            );
            accepted = false;
        }
        if accepted {
            for (i, header) in headers.iter().enumerate() {
                if header.number != from + i as u64 {
                    accepted = false;
                    break;
                }
                if i > 0 && header.parent_hash != headers[i - 1].hash() {
                    accepted = false;
                    break;
                }
            }
        }
        if !accepted {
            log_debug!("skeleton fill from {from} not accepted from {peer_id}");
            inner
                .header_peer_miss
                .entry(peer_id.to_string())
                .or_default()
                .insert(from);
            inner.header_task_queue.insert(from);
            return Ok(0);
        }

        let start = (from - inner.header_offset) as usize;
        for (i, header) in headers.iter().enumerate() {
            inner.header_results[start + i] = Some(header.clone());
        }
        inner.header_task_pool.remove(&from);

        let proced = inner.header_proced;
        let ready = inner.header_results[proced..]
            .iter()
            .take_while(|slot| slot.is_some())
            .count();
        if ready > 0 {
            let run: Vec<BlockHeader> = inner.header_results[proced..proced + ready]
                .iter()
                .map(|slot| slot.clone().expect("counted above"))
                .collect();
            // Non-blocking: anything not handed over now is picked up by
            // retrieve_headers when the fill finishes.
            if proc_tx.try_send(run).is_ok() {
                inner.header_proced += ready;
            }
        }
        Ok(headers.len())
    }

    /// Returns the contiguously assembled headers and how many of them
    /// were already streamed to the processor.
    pub fn retrieve_headers(&self) -> (Vec<BlockHeader>, usize) {
        let mut inner = self.lock();
        let filled: Vec<BlockHeader> = inner
            .header_results
            .iter()
            .take_while(|slot| slot.is_some())
            .map(|slot| slot.clone().expect("checked above"))
            .collect();
        let proced = inner.header_proced;
        inner.header_results = Vec::new();
        inner.header_proced = 0;
        (filled, proced)
    }

    /// Registers a verified header run for body (and, in fast mode,
    /// receipt) retrieval. Returns the accepted prefix.
    pub fn schedule(&self, headers: &[BlockHeader], from: u64) -> Vec<BlockHeader> {
        let mut inner = self.lock();
        let mut inserted = Vec::with_capacity(headers.len());
        let mut expect = from;
        for header in headers {
            let hash = header.hash();
            if header.number != expect {
                log_warn!(
                    "header broke scheduling order: have {} want {expect}",
                    header.number
                );
                break;
            }
            if let Some(head) = inner.header_head {
                if head != header.parent_hash {
                    log_warn!(
                        "header {} broke parent chain ancestry",
                        hash256_to_hex(&hash)
                    );
                    break;
                }
            }
            if inner.block_task_pool.contains(&hash) {
                log_warn!("header {} already scheduled for block fetch", header.number);
            } else {
                inner.block_task_pool.insert(hash);
                inner.block_task_queue.insert(header.number, header.clone());
            }
            if inner.mode == SyncMode::Fast {
                if inner.receipt_task_pool.contains(&hash) {
                    log_warn!("header {} already scheduled for receipt fetch", header.number);
                } else {
                    inner.receipt_task_pool.insert(hash);
                    inner
                        .receipt_task_queue
                        .insert(header.number, header.clone());
                }
            }
            inner.header_head = Some(hash);
            inserted.push(header.clone());
            expect += 1;
        }
        inserted
    }

    fn reserve_parts(
        &self,
        peer_id: &str,
        count: usize,
        kind: PartKind,
    ) -> (Option<FetchRequest>, bool, bool) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let fast = inner.mode == SyncMode::Fast;
        let pending = match kind {
            PartKind::Body => &inner.block_task_queue,
            PartKind::Receipt => &inner.receipt_task_queue,
        };
        if pending.is_empty() {
            return (None, false, false);
        }
        let in_flight = match kind {
            PartKind::Body => &inner.block_pend_pool,
            PartKind::Receipt => &inner.receipt_pend_pool,
        };
        if in_flight.contains_key(peer_id) {
            return (None, false, false);
        }

        let mut progress = false;
        let mut throttled = false;
        let mut send: Vec<BlockHeader> = Vec::new();
        let part = match kind {
            PartKind::Body => PENDING_BODY,
            PartKind::Receipt => PENDING_RECEIPT,
        };
        while send.len() < count {
            let queue = match kind {
                PartKind::Body => &mut inner.block_task_queue,
                PartKind::Receipt => &mut inner.receipt_task_queue,
            };
            let Some((&number, header)) = queue.iter().next() else {
                break;
            };
            let header = header.clone();
            let hash = header.hash();
            match inner.results.reserve_slot(&header, fast) {
                SlotState::Stale => {
                    // Flushed past already; drop the task entirely.
                    match kind {
                        PartKind::Body => {
                            inner.block_task_queue.remove(&number);
                            inner.block_task_pool.remove(&hash);
                        }
                        PartKind::Receipt => {
                            inner.receipt_task_queue.remove(&number);
                            inner.receipt_task_pool.remove(&hash);
                        }
                    }
                    progress = true;
                }
                SlotState::Throttled => {
                    throttled = true;
                    break;
                }
                SlotState::Slot(result) => {
                    let wanted = result.needs(part);
                    match kind {
                        PartKind::Body => {
                            inner.block_task_queue.remove(&number);
                        }
                        PartKind::Receipt => {
                            inner.receipt_task_queue.remove(&number);
                        }
                    }
                    if wanted {
                        send.push(header);
                    } else {
                        // Short-circuited by a well-known empty root.
                        match kind {
                            PartKind::Body => inner.block_task_pool.remove(&hash),
                            PartKind::Receipt => inner.receipt_task_pool.remove(&hash),
                        };
                        progress = true;
                    }
                }
            }
        }
        if progress {
            self.resulted.notify_waiters();
        }
        if send.is_empty() {
            return (None, progress, throttled);
        }
        let request = FetchRequest {
            peer: peer_id.to_string(),
            from: 0,
            headers: send,
            sent_at: Instant::now(),
        };
        match kind {
            PartKind::Body => inner
                .block_pend_pool
                .insert(peer_id.to_string(), request.clone()),
            PartKind::Receipt => inner
                .receipt_pend_pool
                .insert(peer_id.to_string(), request.clone()),
        };
        (Some(request), progress, throttled)
    }

    /// Reserves a height-contiguous run of headers whose bodies this peer
    /// should fetch. `(None, progress, throttle)` distinguishes an empty
    /// pending set, short-circuited completions, and cache backpressure.
    pub fn reserve_bodies(
        &self,
        peer_id: &str,
        count: usize,
    ) -> (Option<FetchRequest>, bool, bool) {
        self.reserve_parts(peer_id, count, PartKind::Body)
    }

    pub fn reserve_receipts(
        &self,
        peer_id: &str,
        count: usize,
    ) -> (Option<FetchRequest>, bool, bool) {
        self.reserve_parts(peer_id, count, PartKind::Receipt)
    }

    /// Matches a body delivery to the peer's reservation in positional
    /// order, verifying the transaction and uncle roots of each entry.
    pub fn deliver_bodies(
        &self,
        peer_id: &str,
        mut transactions: Vec<Vec<Transaction>>,
        mut uncles: Vec<Vec<BlockHeader>>,
    ) -> Result<usize, SyncError> {
        if transactions.len() != uncles.len() {
            return Err(SyncError::InvalidBody);
        }
        let mut inner = self.lock();
        let Some(request) = inner.block_pend_pool.remove(peer_id) else {
            return Err(SyncError::StaleDelivery);
        };
        let delivered = transactions.len();
        let mut accepted = 0;
        let mut failure = None;
        for (i, header) in request.headers.iter().enumerate() {
            if i >= delivered {
                break;
            }
            if transactions_root(&transactions[i]) != header.tx_root
                || uncles_root(&uncles[i]) != header.uncle_root
            {
                failure = Some(SyncError::InvalidBody);
                break;
            }
            let hash = header.hash();
            if let Some(result) = inner.results.slot_mut(header.number) {
                result.transactions = std::mem::take(&mut transactions[i]);
                result.uncles = std::mem::take(&mut uncles[i]);
                result.pending &= !PENDING_BODY;
            }
            inner.block_task_pool.remove(&hash);
            accepted += 1;
        }
        for header in &request.headers[accepted..] {
            inner.block_task_queue.insert(header.number, header.clone());
        }
        if accepted > 0 {
            self.resulted.notify_waiters();
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(accepted),
        }
    }

    /// Matches a receipt delivery against the reservation, verifying each
    /// list against the header's receipt root.
    pub fn deliver_receipts(
        &self,
        peer_id: &str,
        mut receipts: Vec<Vec<Receipt>>,
    ) -> Result<usize, SyncError> {
        let mut inner = self.lock();
        let Some(request) = inner.receipt_pend_pool.remove(peer_id) else {
            return Err(SyncError::StaleDelivery);
        };
        let delivered = receipts.len();
        let mut accepted = 0;
        let mut failure = None;
        for (i, header) in request.headers.iter().enumerate() {
            if i >= delivered {
                break;
            }
            if receipts_root(&receipts[i]) != header.receipt_root {
                failure = Some(SyncError::InvalidReceipt);
                break;
            }
            let hash = header.hash();
            if let Some(result) = inner.results.slot_mut(header.number) {
                result.receipts = std::mem::take(&mut receipts[i]);
                result.pending &= !PENDING_RECEIPT;
            }
            inner.receipt_task_pool.remove(&hash);
            accepted += 1;
        }
        for header in &request.headers[accepted..] {
            inner
                .receipt_task_queue
                .insert(header.number, header.clone());
        }
        if accepted > 0 {
            self.resulted.notify_waiters();
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(accepted),
        }
    }

    fn expire(
        pend_pool: &mut HashMap<String, FetchRequest>,
        ttl: Duration,
        mut requeue: impl FnMut(FetchRequest) -> usize,
    ) -> HashMap<String, usize> {
        let now = Instant::now();
        let expired: Vec<String> = pend_pool
            .iter()
            .filter(|(_, req)| now.duration_since(req.sent_at) > ttl)
            .map(|(peer, _)| peer.clone())
            .collect();
        let mut out = HashMap::new();
        for peer in expired {
            if let Some(request) = pend_pool.remove(&peer) {
                let items = requeue(request);
                out.insert(peer, items);
            }
        }
        out
    }

    /// Cancels skeleton reservations older than `ttl`, returning the slot
    /// to pending. Expirations map to zero items so a timed-out header
    /// peer is dropped rather than demoted.
    pub fn expire_headers(&self, ttl: Duration) -> HashMap<String, usize> {
        let mut inner = self.lock();
        let mut pend_pool = std::mem::take(&mut inner.header_pend_pool);
        let out = Self::expire(&mut pend_pool, ttl, |request| {
            inner.header_task_queue.insert(request.from);
            0
        });
        inner.header_pend_pool = pend_pool;
        out
    }

    pub fn expire_bodies(&self, ttl: Duration) -> HashMap<String, usize> {
        let mut inner = self.lock();
        let mut pend_pool = std::mem::take(&mut inner.block_pend_pool);
        let out = Self::expire(&mut pend_pool, ttl, |request| {
            let items = request.headers.len();
            for header in request.headers {
                inner.block_task_queue.insert(header.number, header);
            }
            items
        });
        inner.block_pend_pool = pend_pool;
        out
    }

    pub fn expire_receipts(&self, ttl: Duration) -> HashMap<String, usize> {
        let mut inner = self.lock();
        let mut pend_pool = std::mem::take(&mut inner.receipt_pend_pool);
        let out = Self::expire(&mut pend_pool, ttl, |request| {
            let items = request.headers.len();
            for header in request.headers {
                inner.receipt_task_queue.insert(header.number, header);
            }
            items
        });
        inner.receipt_pend_pool = pend_pool;
        out
    }

    pub fn cancel_headers(&self, request: FetchRequest) {
        let mut inner = self.lock();
        inner.header_pend_pool.remove(&request.peer);
        inner.header_task_queue.insert(request.from);
    }

    pub fn cancel_bodies(&self, request: FetchRequest) {
        let mut inner = self.lock();
        inner.block_pend_pool.remove(&request.peer);
        for header in request.headers {
            inner.block_task_queue.insert(header.number, header);
        }
    }

    pub fn cancel_receipts(&self, request: FetchRequest) {
        let mut inner = self.lock();
        inner.receipt_pend_pool.remove(&request.peer);
        for header in request.headers {
            inner.receipt_task_queue.insert(header.number, header);
        }
    }

    /// Returns a departing peer's reservations to the schedulers without
    /// counting them as failures.
    pub fn revoke(&self, peer_id: &str) {
        let mut inner = self.lock();
        if let Some(request) = inner.header_pend_pool.remove(peer_id) {
            inner.header_task_queue.insert(request.from);
        }
        if let Some(request) = inner.block_pend_pool.remove(peer_id) {
            for header in request.headers {
                inner.block_task_queue.insert(header.number, header);
            }
        }
        if let Some(request) = inner.receipt_pend_pool.remove(peer_id) {
            for header in request.headers {
                inner.receipt_task_queue.insert(header.number, header);
            }
        }
    }

    /// Complete results in strict height order, contiguous from the
    /// pipeline head. With `block` set the call waits until at least one
    /// result is ready or the queue closes.
    pub async fn results(&self, block: bool) -> Vec<FetchResult> {
        loop {
            let notified = self.resulted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                let ready = inner.results.ready_count();
                if ready > 0 {
                    return inner.results.drain(ready.min(MAX_RESULTS_PROCESS));
                }
                if inner.closed || !block {
                    return Vec::new();
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_primitives::U256;

    fn header_chain(len: usize) -> Vec<BlockHeader> {
        let mut out: Vec<BlockHeader> = Vec::with_capacity(len);
        for number in 1..=len as u64 {
            let parent_hash = out
                .last()
                .map(BlockHeader::hash)
                .unwrap_or([0u8; 32]);
            out.push(BlockHeader {
                parent_hash,
                uncle_root: empty_uncle_root(),
                state_root: [1u8; 32],
                tx_root: empty_tx_root(),
                receipt_root: empty_receipt_root(),
                number,
                time: number,
                difficulty: U256::one(),
                nonce: 0,
                extra: Vec::new(),
            });
        }
        out
    }

    fn header_chain_with_bodies(len: usize) -> (Vec<BlockHeader>, Vec<Vec<Transaction>>) {
        let mut headers = Vec::with_capacity(len);
        let mut bodies = Vec::with_capacity(len);
        let mut parent_hash = [0u8; 32];
        for number in 1..=len as u64 {
            let txs = vec![Transaction {
                nonce: number,
                recipient: None,
                value: U256::from(number),
                gas_limit: 21_000,
                payload: Vec::new(),
            }];
            let header = BlockHeader {
                parent_hash,
                uncle_root: empty_uncle_root(),
                state_root: [1u8; 32],
                tx_root: transactions_root(&txs),
                receipt_root: empty_receipt_root(),
                number,
                time: number,
                difficulty: U256::one(),
                nonce: 0,
                extra: Vec::new(),
            };
            parent_hash = header.hash();
            headers.push(header);
            bodies.push(txs);
        }
        (headers, bodies)
    }

    #[tokio::test]
    async fn schedule_then_deliver_yields_ordered_results() {
        let queue = Queue::new(64);
        queue.prepare(1, SyncMode::Full);
        let (headers, bodies) = header_chain_with_bodies(4);
        let inserted = queue.schedule(&headers, 1);
        assert_eq!(inserted.len(), 4);
        assert_eq!(queue.pending_blocks(), 4);

        let (request, _, throttled) = queue.reserve_bodies("a", 16);
        let request = request.expect("reservation");
        assert!(!throttled);
        assert_eq!(request.headers.len(), 4);
        assert!(queue.in_flight_blocks());

        let uncles = vec![Vec::new(); 4];
        let accepted = queue
            .deliver_bodies("a", bodies, uncles)
            .expect("delivery");
        assert_eq!(accepted, 4);

        let results = queue.results(true).await;
        assert_eq!(results.len(), 4);
        for (i, result) in results.iter().enumerate() {
            assert!(result.is_complete());
            assert_eq!(result.header.number, 1 + i as u64);
        }
    }

    #[tokio::test]
    async fn empty_bodies_short_circuit_without_fetch() {
        let queue = Queue::new(64);
        queue.prepare(1, SyncMode::Full);
        let headers = header_chain(3);
        queue.schedule(&headers, 1);

        let (request, progress, _) = queue.reserve_bodies("a", 16);
        assert!(request.is_none());
        assert!(progress);

        let results = queue.results(true).await;
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn expire_returns_reservation_to_pending() {
        let queue = Queue::new(64);
        queue.prepare(1, SyncMode::Full);
        let (headers, _) = header_chain_with_bodies(2);
        queue.schedule(&headers, 1);

        let (request, _, _) = queue.reserve_bodies("a", 16);
        let first = request.expect("reservation").headers;
        assert_eq!(queue.pending_blocks(), 0);

        let expired = queue.expire_bodies(Duration::ZERO);
        assert_eq!(expired.get("a"), Some(&2));
        assert_eq!(queue.pending_blocks(), 2);
        assert!(!queue.in_flight_blocks());

        // Re-reservation hands the same work units back.
        let (request, _, _) = queue.reserve_bodies("a", 16);
        let second = request.expect("reservation").headers;
        assert_eq!(first, second);
    }

    #[test]
    fn reservation_is_throttled_by_cache_budget() {
        let queue = Queue::new(2);
        queue.prepare(1, SyncMode::Full);
        let (headers, _) = header_chain_with_bodies(5);
        queue.schedule(&headers, 1);

        let (request, _, throttled) = queue.reserve_bodies("a", 16);
        assert_eq!(request.expect("reservation").headers.len(), 2);
        assert!(throttled);
        assert_eq!(queue.pending_blocks(), 3);
    }

    #[test]
    fn body_root_mismatch_is_rejected() {
        let queue = Queue::new(64);
        queue.prepare(1, SyncMode::Full);
        let (headers, _) = header_chain_with_bodies(1);
        queue.schedule(&headers, 1);
        let (request, _, _) = queue.reserve_bodies("a", 16);
        assert!(request.is_some());

        let wrong = vec![vec![Transaction {
            nonce: 999,
            recipient: None,
            value: U256::zero(),
            gas_limit: 1,
            payload: Vec::new(),
        }]];
        let err = queue.deliver_bodies("a", wrong, vec![Vec::new()]);
        assert_eq!(err, Err(SyncError::InvalidBody));
        // Failed work unit is pending again.
        assert_eq!(queue.pending_blocks(), 1);
    }

    #[test]
    fn untracked_delivery_is_stale() {
        let queue = Queue::new(64);
        queue.prepare(1, SyncMode::Full);
        let err = queue.deliver_bodies("ghost", Vec::new(), Vec::new());
        assert_eq!(err, Err(SyncError::StaleDelivery));
    }

    #[test]
    fn revoke_returns_work_without_failure_accounting() {
        let queue = Queue::new(64);
        queue.prepare(1, SyncMode::Full);
        let (headers, _) = header_chain_with_bodies(3);
        queue.schedule(&headers, 1);
        let (request, _, _) = queue.reserve_bodies("a", 16);
        assert!(request.is_some());

        queue.revoke("a");
        assert_eq!(queue.pending_blocks(), 3);
        assert!(!queue.in_flight_blocks());
    }

    #[test]
    fn fast_mode_schedules_receipts_too() {
        let queue = Queue::new(64);
        queue.prepare(1, SyncMode::Fast);
        let (headers, _) = header_chain_with_bodies(3);
        queue.schedule(&headers, 1);
        assert_eq!(queue.pending_blocks(), 3);
        // Receipt roots are the empty root, so receipt fetches
        // short-circuit at reservation time.
        assert_eq!(queue.pending_receipts(), 3);
        let (request, progress, _) = queue.reserve_receipts("a", 16);
        assert!(request.is_none());
        assert!(progress);
    }

    #[tokio::test]
    async fn close_unblocks_results() {
        let queue = std::sync::Arc::new(Queue::new(64));
        let waiter = std::sync::Arc::clone(&queue);
        let handle = tokio::spawn(async move { waiter.results(true).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        let results = handle.await.expect("join");
        assert!(results.is_empty());
    }

    #[test]
    fn skeleton_fill_validates_slot_target() {
        let queue = Queue::new(64);
        queue.prepare(1, SyncMode::Full);
        let chain = header_chain(MAX_HEADER_FETCH * 2);
        let skeleton = vec![
            chain[MAX_HEADER_FETCH - 1].clone(),
            chain[2 * MAX_HEADER_FETCH - 1].clone(),
        ];
        queue.schedule_skeleton(1, &skeleton);
        assert_eq!(queue.pending_headers(), 2);

        let request = queue.reserve_headers("a").expect("slot");
        assert_eq!(request.from, 1);

        let (proc_tx, mut proc_rx) = mpsc::channel(4);
        // Wrong fill: count mismatch.
        let accepted = queue
            .deliver_headers("a", chain[..10].to_vec(), &proc_tx)
            .expect("rejected fills are not errors");
        assert_eq!(accepted, 0);
        assert_eq!(queue.pending_headers(), 2);

        // The peer now misses slot 1, so it is handed slot 193.
        let request = queue.reserve_headers("a").expect("slot");
        assert_eq!(request.from, 1 + MAX_HEADER_FETCH as u64);
        let accepted = queue
            .deliver_headers(
                "a",
                chain[MAX_HEADER_FETCH..2 * MAX_HEADER_FETCH].to_vec(),
                &proc_tx,
            )
            .expect("valid fill");
        assert_eq!(accepted, MAX_HEADER_FETCH);
        // Slot 2 filled but slot 1 missing: nothing handed over yet.
        assert!(proc_rx.try_recv().is_err());

        let request = queue.reserve_headers("b").expect("slot");
        assert_eq!(request.from, 1);
        let accepted = queue
            .deliver_headers("b", chain[..MAX_HEADER_FETCH].to_vec(), &proc_tx)
            .expect("valid fill");
        assert_eq!(accepted, MAX_HEADER_FETCH);
        assert!(queue.header_fill_complete());

        let run = proc_rx.try_recv().expect("contiguous run");
        assert_eq!(run.len(), 2 * MAX_HEADER_FETCH);
        assert_eq!(run[0].number, 1);

        let (filled, proced) = queue.retrieve_headers();
        assert_eq!(filled.len(), 2 * MAX_HEADER_FETCH);
        assert_eq!(proced, 2 * MAX_HEADER_FETCH);
    }
}
