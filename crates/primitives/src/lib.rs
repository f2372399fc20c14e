//! Core block/receipt types and wire serialization for emberd.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod receipt;
pub mod transaction;

pub use block::{Block, BlockBody, BlockHeader};
pub use hash::{sha256, sha256d, Hash256};
pub use receipt::Receipt;
pub use transaction::Transaction;

pub use primitive_types::U256;

/// Hex rendering used in log lines; big-endian display of the raw digest.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
