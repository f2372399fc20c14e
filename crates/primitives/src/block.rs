//! Block header, body, and the list commitments the sync engine verifies.

use std::sync::OnceLock;

use primitive_types::U256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::{sha256d, Hash256};
use crate::receipt::Receipt;
use crate::transaction::Transaction;

/// Domain tags keep the three list commitments distinct, so the well-known
/// empty roots never collide across kinds.
const TX_ROOT_TAG: u8 = 0x01;
const UNCLE_ROOT_TAG: u8 = 0x02;
const RECEIPT_ROOT_TAG: u8 = 0x03;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_hash: Hash256,
    pub uncle_root: Hash256,
    pub state_root: Hash256,
    pub tx_root: Hash256,
    pub receipt_root: Hash256,
    pub number: u64,
    pub time: u64,
    pub difficulty: U256,
    pub nonce: u64,
    pub extra: Vec<u8>,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_hash(&self.parent_hash);
        encoder.write_hash(&self.uncle_root);
        encoder.write_hash(&self.state_root);
        encoder.write_hash(&self.tx_root);
        encoder.write_hash(&self.receipt_root);
        encoder.write_u64_le(self.number);
        encoder.write_u64_le(self.time);
        encoder.write_u256_le(&self.difficulty);
        encoder.write_u64_le(self.nonce);
        encoder.write_var_bytes(&self.extra);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::consensus_decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(header)
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            parent_hash: decoder.read_hash()?,
            uncle_root: decoder.read_hash()?,
            state_root: decoder.read_hash()?,
            tx_root: decoder.read_hash()?,
            receipt_root: decoder.read_hash()?,
            number: decoder.read_u64_le()?,
            time: decoder.read_u64_le()?,
            difficulty: decoder.read_u256_le()?,
            nonce: decoder.read_u64_le()?,
            extra: decoder.read_var_bytes()?,
        })
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }
}

/// Transactions and uncle headers belonging to one header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockBody {
    pub transactions: Vec<Transaction>,
    pub uncles: Vec<BlockHeader>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    pub fn new(header: BlockHeader, body: BlockBody) -> Self {
        Self { header, body }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }
}

fn list_root(tag: u8, hashes: impl Iterator<Item = Hash256>) -> Hash256 {
    let mut buf = vec![tag];
    for hash in hashes {
        buf.extend_from_slice(&hash);
    }
    sha256d(&buf)
}

pub fn transactions_root(transactions: &[Transaction]) -> Hash256 {
    list_root(TX_ROOT_TAG, transactions.iter().map(Transaction::hash))
}

pub fn uncles_root(uncles: &[BlockHeader]) -> Hash256 {
    list_root(UNCLE_ROOT_TAG, uncles.iter().map(BlockHeader::hash))
}

pub fn receipts_root(receipts: &[Receipt]) -> Hash256 {
    list_root(RECEIPT_ROOT_TAG, receipts.iter().map(Receipt::hash))
}

pub fn empty_tx_root() -> Hash256 {
    static ROOT: OnceLock<Hash256> = OnceLock::new();
    *ROOT.get_or_init(|| transactions_root(&[]))
}

pub fn empty_uncle_root() -> Hash256 {
    static ROOT: OnceLock<Hash256> = OnceLock::new();
    *ROOT.get_or_init(|| uncles_root(&[]))
}

pub fn empty_receipt_root() -> Hash256 {
    static ROOT: OnceLock<Hash256> = OnceLock::new();
    *ROOT.get_or_init(|| receipts_root(&[]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            parent_hash: [1u8; 32],
            uncle_root: empty_uncle_root(),
            state_root: [2u8; 32],
            tx_root: empty_tx_root(),
            receipt_root: empty_receipt_root(),
            number: 7,
            time: 1_700_000_000,
            difficulty: U256::from(131_072u64),
            nonce: 42,
            extra: b"ember".to_vec(),
        }
    }

    #[test]
    fn header_round_trip() {
        let header = sample_header();
        let decoded = BlockHeader::consensus_decode(&header.consensus_encode()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.hash(), header.hash());
    }

    #[test]
    fn empty_roots_are_distinct() {
        assert_ne!(empty_tx_root(), empty_uncle_root());
        assert_ne!(empty_tx_root(), empty_receipt_root());
        assert_ne!(empty_uncle_root(), empty_receipt_root());
    }

    #[test]
    fn list_roots_depend_on_order() {
        let tx_a = Transaction {
            nonce: 0,
            recipient: None,
            value: U256::zero(),
            gas_limit: 21_000,
            payload: vec![1],
        };
        let tx_b = Transaction {
            nonce: 1,
            recipient: Some([9u8; 20]),
            value: U256::one(),
            gas_limit: 21_000,
            payload: vec![2],
        };
        let forward = transactions_root(&[tx_a.clone(), tx_b.clone()]);
        let reverse = transactions_root(&[tx_b, tx_a]);
        assert_ne!(forward, reverse);
    }
}
