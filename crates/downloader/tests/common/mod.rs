//! Shared harness: a deterministic block chain, an in-memory chain store,
//! peers that answer through the deliver entry points, and a counting
//! state scheduler.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use emberd_downloader::{
    BlockChain, ChainInsertError, Downloader, DownloaderConfig, LightChain, Peer, StateScheduler,
    StateSchedulerFactory, SyncBloom,
};
use emberd_primitives::block::{receipts_root, transactions_root, uncles_root};
use emberd_primitives::{
    sha256d, Block, BlockBody, BlockHeader, Hash256, Receipt, Transaction, U256,
};
use emberd_storage::memory::MemoryStore;

pub const TEST_PROTOCOL: u32 = 64;
const STATE_NODES_PER_ROOT: usize = 4;

pub fn test_config() -> DownloaderConfig {
    DownloaderConfig {
        header_cont_check_ms: 100,
        ..DownloaderConfig::default()
    }
}

/// Config with tight deadlines for timeout scenarios.
pub fn impatient_config() -> DownloaderConfig {
    DownloaderConfig {
        rtt_min_ms: 100,
        rtt_max_ms: 200,
        ttl_limit_ms: 1_000,
        header_cont_check_ms: 100,
        ..DownloaderConfig::default()
    }
}

fn state_root_for(number: u64) -> Hash256 {
    let mut raw = b"state".to_vec();
    raw.extend_from_slice(&number.to_le_bytes());
    sha256d(&raw)
}

fn make_tx(number: u64) -> Transaction {
    Transaction {
        nonce: number,
        recipient: Some([(number % 251) as u8; 20]),
        value: U256::from(number * 1_000),
        gas_limit: 21_000,
        payload: number.to_le_bytes().to_vec(),
    }
}

/// A canonical chain the mock peers serve from: headers with valid parent
/// links and commitment roots, a sprinkle of empty bodies and receipts,
/// and a few fabricated state nodes per state root.
pub struct TestChain {
    pub headers: Vec<BlockHeader>,
    pub bodies: Vec<BlockBody>,
    pub receipts: Vec<Vec<Receipt>>,
    pub tds: Vec<U256>,
    by_hash: HashMap<Hash256, usize>,
    node_blobs: HashMap<Hash256, Vec<u8>>,
    nodes_by_root: HashMap<Hash256, Vec<Hash256>>,
}

impl TestChain {
    pub fn generate(len: usize) -> Arc<Self> {
        let mut headers: Vec<BlockHeader> = Vec::with_capacity(len + 1);
        let mut bodies = Vec::with_capacity(len + 1);
        let mut receipts: Vec<Vec<Receipt>> = Vec::with_capacity(len + 1);
        let mut tds = Vec::with_capacity(len + 1);

        let genesis = BlockHeader {
            parent_hash: [0u8; 32],
            uncle_root: uncles_root(&[]),
            state_root: state_root_for(0),
            tx_root: transactions_root(&[]),
            receipt_root: receipts_root(&[]),
            number: 0,
            time: 1_600_000_000,
            difficulty: U256::from(1_024u64),
            nonce: 0,
            extra: b"ember genesis".to_vec(),
        };
        tds.push(genesis.difficulty);
        headers.push(genesis);
        bodies.push(BlockBody::default());
        receipts.push(Vec::new());

        for number in 1..=len as u64 {
            let parent = &headers[number as usize - 1];
            let txs = if number % 7 == 0 {
                Vec::new()
            } else {
                vec![make_tx(number)]
            };
            let uncles = if number % 13 == 0 {
                let mut uncle = parent.clone();
                uncle.nonce = uncle.nonce.wrapping_add(0xdead);
                vec![uncle]
            } else {
                Vec::new()
            };
            let recs = if number % 5 == 0 {
                Vec::new()
            } else {
                vec![Receipt {
                    succeeded: true,
                    cumulative_gas: number * 21_000,
                    logs: vec![number.to_le_bytes().to_vec()],
                }]
            };
            let difficulty = U256::from(1_024 + (number % 17));
            let header = BlockHeader {
                parent_hash: parent.hash(),
                uncle_root: uncles_root(&uncles),
                state_root: state_root_for(number),
                tx_root: transactions_root(&txs),
                receipt_root: receipts_root(&recs),
                number,
                time: 1_600_000_000 + number * 13,
                difficulty,
                nonce: number,
                extra: Vec::new(),
            };
            tds.push(tds[number as usize - 1] + difficulty);
            headers.push(header);
            bodies.push(BlockBody {
                transactions: txs,
                uncles,
            });
            receipts.push(recs);
        }

        let mut by_hash = HashMap::new();
        let mut node_blobs = HashMap::new();
        let mut nodes_by_root = HashMap::new();
        for (index, header) in headers.iter().enumerate() {
            by_hash.insert(header.hash(), index);
            let mut order = Vec::with_capacity(STATE_NODES_PER_ROOT);
            for i in 0..STATE_NODES_PER_ROOT {
                let mut blob = header.state_root.to_vec();
                blob.push(i as u8);
                let hash = sha256d(&blob);
                node_blobs.insert(hash, blob);
                order.push(hash);
            }
            nodes_by_root.insert(header.state_root, order);
        }

        Arc::new(Self {
            headers,
            bodies,
            receipts,
            tds,
            by_hash,
            node_blobs,
            nodes_by_root,
        })
    }

    pub fn len(&self) -> usize {
        self.headers.len() - 1
    }

    pub fn head(&self) -> &BlockHeader {
        &self.headers[self.headers.len() - 1]
    }

    pub fn genesis(&self) -> &BlockHeader {
        &self.headers[0]
    }

    pub fn td(&self, number: u64) -> U256 {
        self.tds[number as usize]
    }

    /// Advertised (hash, total difficulty) for announcing a mid-chain
    /// head.
    pub fn announce(&self, number: u64) -> (Hash256, U256) {
        (self.headers[number as usize].hash(), self.td(number))
    }

    pub fn index_of(&self, hash: &Hash256) -> Option<usize> {
        self.by_hash.get(hash).copied()
    }

    pub fn headers_by_number(
        &self,
        origin: u64,
        amount: usize,
        skip: u64,
        reverse: bool,
    ) -> Vec<BlockHeader> {
        let step = skip as i64 + 1;
        let mut out = Vec::new();
        let mut at = origin as i64;
        for _ in 0..amount {
            if at < 0 || at as usize >= self.headers.len() {
                break;
            }
            out.push(self.headers[at as usize].clone());
            at += if reverse { -step } else { step };
        }
        out
    }

    pub fn headers_by_hash(
        &self,
        origin: Hash256,
        amount: usize,
        skip: u64,
        reverse: bool,
    ) -> Vec<BlockHeader> {
        match self.index_of(&origin) {
            Some(index) => self.headers_by_number(index as u64, amount, skip, reverse),
            None => Vec::new(),
        }
    }

    pub fn bodies_for(&self, hashes: &[Hash256]) -> (Vec<Vec<Transaction>>, Vec<Vec<BlockHeader>>) {
        let mut txs = Vec::new();
        let mut uncles = Vec::new();
        for hash in hashes {
            if let Some(index) = self.index_of(hash) {
                txs.push(self.bodies[index].transactions.clone());
                uncles.push(self.bodies[index].uncles.clone());
            }
        }
        (txs, uncles)
    }

    pub fn receipts_for(&self, hashes: &[Hash256]) -> Vec<Vec<Receipt>> {
        hashes
            .iter()
            .filter_map(|hash| self.index_of(hash).map(|i| self.receipts[i].clone()))
            .collect()
    }

    pub fn node_data_for(&self, hashes: &[Hash256]) -> Vec<Vec<u8>> {
        hashes
            .iter()
            .filter_map(|hash| self.node_blobs.get(hash).cloned())
            .collect()
    }

    pub fn state_nodes_of(&self, root: &Hash256) -> Vec<Hash256> {
        self.nodes_by_root.get(root).cloned().unwrap_or_default()
    }
}

/// Everything the chain store did, in call order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
    InsertHeaders { from: u64, to: u64 },
    InsertBlocks { from: u64, to: u64 },
    InsertReceipts { from: u64, to: u64, ancient_limit: u64 },
    CommitHead { number: u64 },
    SetHead { number: u64 },
}

struct StoreInner {
    headers: HashMap<Hash256, BlockHeader>,
    canonical: HashMap<u64, Hash256>,
    tds: HashMap<Hash256, U256>,
    blocks: HashMap<Hash256, Block>,
    receipts: HashMap<Hash256, Vec<Receipt>>,
    current_header: Hash256,
    current_block: Hash256,
    current_fast: Hash256,
    ancients: u64,
    events: Vec<ChainEvent>,
    fail_header_at: Option<u64>,
}

/// In-memory chain store implementing both store traits, with linkage
/// checks so ordering violations surface as insert failures.
pub struct TestStore {
    inner: Mutex<StoreInner>,
}

impl TestStore {
    pub fn new(genesis: &BlockHeader) -> Arc<Self> {
        let hash = genesis.hash();
        let mut headers = HashMap::new();
        headers.insert(hash, genesis.clone());
        let mut canonical = HashMap::new();
        canonical.insert(0, hash);
        let mut tds = HashMap::new();
        tds.insert(hash, genesis.difficulty);
        let mut blocks = HashMap::new();
        blocks.insert(hash, Block::new(genesis.clone(), BlockBody::default()));
        let mut receipts = HashMap::new();
        receipts.insert(hash, Vec::new());
        Arc::new(Self {
            inner: Mutex::new(StoreInner {
                headers,
                canonical,
                tds,
                blocks,
                receipts,
                current_header: hash,
                current_block: hash,
                current_fast: hash,
                ancients: 0,
                events: Vec::new(),
                fail_header_at: None,
            }),
        })
    }

    /// Pre-sync the local store with the first `upto` blocks of `chain`.
    pub fn seed(&self, chain: &TestChain, upto: u64) {
        let mut inner = self.inner.lock().expect("store lock");
        for number in 1..=upto {
            let header = chain.headers[number as usize].clone();
            let hash = header.hash();
            inner.canonical.insert(number, hash);
            inner.tds.insert(hash, chain.td(number));
            inner.receipts.insert(hash, chain.receipts[number as usize].clone());
            inner.blocks.insert(
                hash,
                Block::new(header.clone(), chain.bodies[number as usize].clone()),
            );
            inner.headers.insert(hash, header);
            inner.current_header = hash;
            inner.current_block = hash;
            inner.current_fast = hash;
        }
    }

    pub fn fail_header_at(&self, number: u64) {
        self.inner.lock().expect("store lock").fail_header_at = Some(number);
    }

    pub fn events(&self) -> Vec<ChainEvent> {
        self.inner.lock().expect("store lock").events.clone()
    }

    pub fn header_height(&self) -> u64 {
        let inner = self.inner.lock().expect("store lock");
        inner.headers[&inner.current_header].number
    }

    pub fn block_height(&self) -> u64 {
        let inner = self.inner.lock().expect("store lock");
        inner.blocks[&inner.current_block].number()
    }

    pub fn fast_height(&self) -> u64 {
        let inner = self.inner.lock().expect("store lock");
        inner.blocks[&inner.current_fast].number()
    }
}

impl LightChain for TestStore {
    fn has_header(&self, hash: &Hash256, number: u64) -> bool {
        let inner = self.inner.lock().expect("store lock");
        inner.headers.get(hash).map(|h| h.number) == Some(number)
    }

    fn header_by_hash(&self, hash: &Hash256) -> Option<BlockHeader> {
        self.inner.lock().expect("store lock").headers.get(hash).cloned()
    }

    fn current_header(&self) -> BlockHeader {
        let inner = self.inner.lock().expect("store lock");
        inner.headers[&inner.current_header].clone()
    }

    fn total_difficulty(&self, hash: &Hash256, _number: u64) -> Option<U256> {
        self.inner.lock().expect("store lock").tds.get(hash).copied()
    }

    fn insert_header_chain(
        &self,
        headers: &[BlockHeader],
        _verify_frequency: usize,
    ) -> Result<(), ChainInsertError> {
        if headers.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().expect("store lock");
        let from = headers[0].number;
        let mut to = from;
        for (index, header) in headers.iter().enumerate() {
            if inner.fail_header_at == Some(header.number) {
                inner.events.push(ChainEvent::InsertHeaders { from, to });
                return Err(ChainInsertError {
                    index,
                    message: format!("injected verification failure at {}", header.number),
                });
            }
            let parent_number = inner.headers.get(&header.parent_hash).map(|p| p.number);
            let Some(parent_number) = parent_number else {
                inner.events.push(ChainEvent::InsertHeaders { from, to });
                return Err(ChainInsertError {
                    index,
                    message: format!("unknown parent for header {}", header.number),
                });
            };
            if parent_number + 1 != header.number {
                inner.events.push(ChainEvent::InsertHeaders { from, to });
                return Err(ChainInsertError {
                    index,
                    message: format!("non-contiguous header {}", header.number),
                });
            }
            let hash = header.hash();
            let parent_td = inner.tds[&header.parent_hash];
            inner.tds.insert(hash, parent_td + header.difficulty);
            inner.canonical.insert(header.number, hash);
            inner.headers.insert(hash, header.clone());
            let head_number = inner.headers[&inner.current_header].number;
            if header.number > head_number {
                inner.current_header = hash;
            }
            to = header.number;
        }
        inner.events.push(ChainEvent::InsertHeaders { from, to });
        Ok(())
    }

    fn set_head(&self, height: u64) -> Result<(), String> {
        let mut inner = self.inner.lock().expect("store lock");
        let target = *inner
            .canonical
            .get(&height)
            .ok_or_else(|| format!("no canonical header at {height}"))?;
        let numbers: Vec<u64> = inner
            .canonical
            .keys()
            .copied()
            .filter(|n| *n > height)
            .collect();
        for number in numbers {
            if let Some(hash) = inner.canonical.remove(&number) {
                inner.headers.remove(&hash);
            }
        }
        inner.current_header = target;
        let block_number = inner.blocks[&inner.current_block].number();
        if block_number > height {
            inner.current_block = target;
        }
        let fast_number = inner.blocks[&inner.current_fast].number();
        if fast_number > height {
            inner.current_fast = target;
        }
        inner.events.push(ChainEvent::SetHead { number: height });
        Ok(())
    }
}

impl BlockChain for TestStore {
    fn has_block(&self, hash: &Hash256, number: u64) -> bool {
        let inner = self.inner.lock().expect("store lock");
        inner.blocks.get(hash).map(|b| b.number()) == Some(number)
    }

    fn has_fast_block(&self, hash: &Hash256, number: u64) -> bool {
        let inner = self.inner.lock().expect("store lock");
        inner.blocks.get(hash).map(|b| b.number()) == Some(number)
            && inner.receipts.contains_key(hash)
    }

    fn block_by_hash(&self, hash: &Hash256) -> Option<Block> {
        self.inner.lock().expect("store lock").blocks.get(hash).cloned()
    }

    fn current_block(&self) -> Block {
        let inner = self.inner.lock().expect("store lock");
        inner.blocks[&inner.current_block].clone()
    }

    fn current_fast_block(&self) -> Block {
        let inner = self.inner.lock().expect("store lock");
        inner.blocks[&inner.current_fast].clone()
    }

    fn fast_sync_commit_head(&self, hash: &Hash256) -> Result<(), String> {
        let mut inner = self.inner.lock().expect("store lock");
        let number = inner
            .blocks
            .get(hash)
            .map(|b| b.number())
            .ok_or_else(|| "committing unknown block".to_string())?;
        inner.current_block = *hash;
        inner.events.push(ChainEvent::CommitHead { number });
        Ok(())
    }

    fn insert_chain(&self, blocks: Vec<Block>) -> Result<(), ChainInsertError> {
        if blocks.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().expect("store lock");
        let from = blocks[0].number();
        let mut to = from;
        for (index, block) in blocks.into_iter().enumerate() {
            let parent_number = inner.blocks.get(&block.header.parent_hash).map(|p| p.number());
            let Some(parent_number) = parent_number else {
                inner.events.push(ChainEvent::InsertBlocks { from, to });
                return Err(ChainInsertError {
                    index,
                    message: format!("unknown parent block for {}", block.number()),
                });
            };
            if parent_number + 1 != block.number() {
                inner.events.push(ChainEvent::InsertBlocks { from, to });
                return Err(ChainInsertError {
                    index,
                    message: format!("non-contiguous block {}", block.number()),
                });
            }
            let hash = block.hash();
            let parent_td = inner.tds[&block.header.parent_hash];
            inner.tds.insert(hash, parent_td + block.header.difficulty);
            inner.canonical.insert(block.number(), hash);
            inner.headers.insert(hash, block.header.clone());
            inner.receipts.entry(hash).or_default();
            to = block.number();
            let head_number = inner.headers[&inner.current_header].number;
            if block.number() > head_number {
                inner.current_header = hash;
            }
            inner.current_block = hash;
            inner.blocks.insert(hash, block);
        }
        inner.events.push(ChainEvent::InsertBlocks { from, to });
        Ok(())
    }

    fn insert_receipt_chain(
        &self,
        blocks: Vec<Block>,
        receipts: Vec<Vec<Receipt>>,
        ancient_limit: u64,
    ) -> Result<(), ChainInsertError> {
        if blocks.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().expect("store lock");
        let from = blocks[0].number();
        let mut to = from;
        for (index, (block, recs)) in blocks.into_iter().zip(receipts).enumerate() {
            let hash = block.hash();
            if !inner.headers.contains_key(&hash) {
                inner.events.push(ChainEvent::InsertReceipts { from, to, ancient_limit });
                return Err(ChainInsertError {
                    index,
                    message: format!("receipt chain block {} has no stored header", block.number()),
                });
            }
            to = block.number();
            if block.number() <= ancient_limit {
                inner.ancients = inner.ancients.max(block.number() + 1);
            }
            inner.current_fast = hash;
            inner.receipts.insert(hash, recs);
            inner.blocks.insert(hash, block);
        }
        inner.events.push(ChainEvent::InsertReceipts { from, to, ancient_limit });
        Ok(())
    }

    fn ancients(&self) -> u64 {
        self.inner.lock().expect("store lock").ancients
    }
}

/// Scheduler over the fabricated per-root node sets. A gated scheduler
/// never hands out work nor completes, emulating an unfinishable state
/// download.
pub struct TestScheduler {
    order: Vec<Hash256>,
    remaining: HashSet<Hash256>,
    handed: HashSet<Hash256>,
    gated: bool,
}

impl StateScheduler for TestScheduler {
    fn missing(&mut self, max: usize) -> Vec<Hash256> {
        if self.gated {
            return Vec::new();
        }
        let mut out = Vec::new();
        for hash in &self.order {
            if out.len() >= max {
                break;
            }
            if self.remaining.contains(hash) && !self.handed.contains(hash) {
                self.handed.insert(*hash);
                out.push(*hash);
            }
        }
        out
    }

    fn revert(&mut self, hashes: &[Hash256]) {
        for hash in hashes {
            self.handed.remove(hash);
        }
    }

    fn process(&mut self, blob: &[u8]) -> Result<bool, String> {
        let hash = sha256d(blob);
        if self.remaining.remove(&hash) {
            self.handed.remove(&hash);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn pending(&self) -> usize {
        self.remaining.len()
    }

    fn done(&self) -> bool {
        !self.gated && self.remaining.is_empty()
    }
}

pub struct TestSchedulerFactory {
    chain: Arc<TestChain>,
    stall_roots: Mutex<HashSet<Hash256>>,
    made: Mutex<Vec<Hash256>>,
}

impl TestSchedulerFactory {
    pub fn new(chain: Arc<TestChain>) -> Arc<Self> {
        Arc::new(Self {
            chain,
            stall_roots: Mutex::new(HashSet::new()),
            made: Mutex::new(Vec::new()),
        })
    }

    /// Sessions for this root never complete.
    pub fn stall_root(&self, root: Hash256) {
        self.stall_roots.lock().expect("factory lock").insert(root);
    }

    pub fn made_roots(&self) -> Vec<Hash256> {
        self.made.lock().expect("factory lock").clone()
    }
}

impl StateSchedulerFactory for TestSchedulerFactory {
    fn make(&self, root: Hash256) -> Box<dyn StateScheduler> {
        self.made.lock().expect("factory lock").push(root);
        let order = self.chain.state_nodes_of(&root);
        let gated = self.stall_roots.lock().expect("factory lock").contains(&root);
        Box::new(TestScheduler {
            remaining: order.iter().copied().collect(),
            handed: HashSet::new(),
            order,
            gated,
        })
    }
}

/// Behaviour switches for a mock peer.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerFlags {
    /// Answer span probes with wrong header heights.
    pub lie_span_numbers: bool,
    /// Never answer body requests.
    pub withhold_bodies: bool,
    /// Serve bodies whose transactions do not match the header root.
    pub corrupt_bodies: bool,
}

pub struct TestPeer {
    id: String,
    dl: Arc<Downloader>,
    chain: Arc<TestChain>,
    announced: u64,
    flags: PeerFlags,
}

impl Peer for TestPeer {
    fn head(&self) -> (Hash256, U256) {
        self.chain.announce(self.announced)
    }

    fn request_headers_by_hash(
        &self,
        origin: Hash256,
        amount: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<(), String> {
        let headers = self.chain.headers_by_hash(origin, amount, skip, reverse);
        let dl = Arc::clone(&self.dl);
        let id = self.id.clone();
        tokio::spawn(async move {
            let _ = dl.deliver_headers(&id, headers).await;
        });
        Ok(())
    }

    fn request_headers_by_number(
        &self,
        origin: u64,
        amount: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<(), String> {
        let mut headers = self.chain.headers_by_number(origin, amount, skip, reverse);
        if self.flags.lie_span_numbers && amount > 1 && skip > 0 && !headers.is_empty() {
            for header in headers.iter_mut().skip(1) {
                header.number -= 1;
            }
        }
        let dl = Arc::clone(&self.dl);
        let id = self.id.clone();
        tokio::spawn(async move {
            let _ = dl.deliver_headers(&id, headers).await;
        });
        Ok(())
    }

    fn request_bodies(&self, hashes: Vec<Hash256>) -> Result<(), String> {
        if self.flags.withhold_bodies {
            return Ok(());
        }
        let (mut txs, uncles) = self.chain.bodies_for(&hashes);
        if self.flags.corrupt_bodies {
            if let Some(first) = txs.first_mut() {
                first.push(make_tx(0));
            }
        }
        let dl = Arc::clone(&self.dl);
        let id = self.id.clone();
        tokio::spawn(async move {
            let _ = dl.deliver_bodies(&id, txs, uncles).await;
        });
        Ok(())
    }

    fn request_receipts(&self, hashes: Vec<Hash256>) -> Result<(), String> {
        let receipts = self.chain.receipts_for(&hashes);
        let dl = Arc::clone(&self.dl);
        let id = self.id.clone();
        tokio::spawn(async move {
            let _ = dl.deliver_receipts(&id, receipts).await;
        });
        Ok(())
    }

    fn request_node_data(&self, hashes: Vec<Hash256>) -> Result<(), String> {
        let data = self.chain.node_data_for(&hashes);
        let dl = Arc::clone(&self.dl);
        let id = self.id.clone();
        tokio::spawn(async move {
            let _ = dl.deliver_node_data(&id, data).await;
        });
        Ok(())
    }
}

/// Header-and-state-only peer for exercising the light protocol path.
pub struct TestLightPeer {
    inner: TestPeer,
}

impl emberd_downloader::LightPeer for TestLightPeer {
    fn head(&self) -> (Hash256, U256) {
        Peer::head(&self.inner)
    }

    fn request_headers_by_hash(
        &self,
        origin: Hash256,
        amount: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<(), String> {
        Peer::request_headers_by_hash(&self.inner, origin, amount, skip, reverse)
    }

    fn request_headers_by_number(
        &self,
        origin: u64,
        amount: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<(), String> {
        Peer::request_headers_by_number(&self.inner, origin, amount, skip, reverse)
    }

    fn request_node_data(&self, hashes: Vec<Hash256>) -> Result<(), String> {
        Peer::request_node_data(&self.inner, hashes)
    }
}

/// Engine plus its collaborators, wired the way the node would.
pub struct Tester {
    pub dl: Arc<Downloader>,
    pub chain: Arc<TestChain>,
    pub store: Arc<TestStore>,
    pub factory: Arc<TestSchedulerFactory>,
    pub state_db: Arc<MemoryStore>,
    pub drops: Arc<Mutex<Vec<String>>>,
}

impl Tester {
    pub fn new(chain_len: usize, config: DownloaderConfig) -> Self {
        Self::build(chain_len, config, true)
    }

    pub fn new_light(chain_len: usize, config: DownloaderConfig) -> Self {
        Self::build(chain_len, config, false)
    }

    fn build(chain_len: usize, config: DownloaderConfig, full: bool) -> Self {
        let chain = TestChain::generate(chain_len);
        let store = TestStore::new(chain.genesis());
        let factory = TestSchedulerFactory::new(Arc::clone(&chain));
        let state_db = Arc::new(MemoryStore::new());
        let drops: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let drop_sink = Arc::clone(&drops);
        let blockchain: Option<Arc<dyn BlockChain>> = if full {
            Some(Arc::clone(&store) as Arc<dyn BlockChain>)
        } else {
            None
        };
        let dl = Downloader::new(
            config,
            Arc::clone(&state_db) as Arc<dyn emberd_storage::KeyValueStore>,
            Some(Arc::new(SyncBloom::new(64 * 1024))),
            blockchain,
            Arc::clone(&store) as Arc<dyn LightChain>,
            Arc::clone(&factory) as Arc<dyn StateSchedulerFactory>,
            Some(Box::new(move |id: &str| {
                drop_sink.lock().expect("drop sink lock").push(id.to_string());
            })),
        );
        Self {
            dl,
            chain,
            store,
            factory,
            state_db,
            drops,
        }
    }

    pub fn connect_peer(&self, id: &str) -> Result<(), emberd_downloader::SyncError> {
        self.connect_peer_with(id, self.chain.len() as u64, PeerFlags::default())
    }

    pub fn connect_peer_with(
        &self,
        id: &str,
        announced: u64,
        flags: PeerFlags,
    ) -> Result<(), emberd_downloader::SyncError> {
        self.connect_peer_versioned(id, TEST_PROTOCOL, announced, flags)
    }

    pub fn connect_peer_versioned(
        &self,
        id: &str,
        version: u32,
        announced: u64,
        flags: PeerFlags,
    ) -> Result<(), emberd_downloader::SyncError> {
        let peer = TestPeer {
            id: id.to_string(),
            dl: Arc::clone(&self.dl),
            chain: Arc::clone(&self.chain),
            announced,
            flags,
        };
        self.dl.register_peer(id, version, Arc::new(peer))
    }

    /// Registers a peer through the light-protocol wrapper.
    pub fn connect_light_peer(&self, id: &str) -> Result<(), emberd_downloader::SyncError> {
        let peer = TestLightPeer {
            inner: TestPeer {
                id: id.to_string(),
                dl: Arc::clone(&self.dl),
                chain: Arc::clone(&self.chain),
                announced: self.chain.len() as u64,
                flags: PeerFlags::default(),
            },
        };
        self.dl.register_light_peer(id, TEST_PROTOCOL, Arc::new(peer))
    }

    pub fn dropped_peers(&self) -> Vec<String> {
        self.drops.lock().expect("drop sink lock").clone()
    }
}

/// Index of the first event matching the predicate.
pub fn event_index(events: &[ChainEvent], pred: impl Fn(&ChainEvent) -> bool) -> Option<usize> {
    events.iter().position(pred)
}
