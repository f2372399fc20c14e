use primitive_types::U256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::{sha256d, Hash256};

/// A transfer or contract call. The sync engine treats transactions as
/// opaque payload; only the hash commitment matters to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub nonce: u64,
    pub recipient: Option<[u8; 20]>,
    pub value: U256,
    pub gas_limit: u64,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u64_le(self.nonce);
        match &self.recipient {
            Some(addr) => {
                encoder.write_u8(1);
                encoder.write_bytes(addr);
            }
            None => encoder.write_u8(0),
        }
        encoder.write_u256_le(&self.value);
        encoder.write_u64_le(self.gas_limit);
        encoder.write_var_bytes(&self.payload);
        encoder.into_inner()
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let nonce = decoder.read_u64_le()?;
        let recipient = match decoder.read_u8()? {
            0 => None,
            _ => {
                let bytes = decoder.read_bytes(20)?;
                let mut addr = [0u8; 20];
                addr.copy_from_slice(&bytes);
                Some(addr)
            }
        };
        let value = decoder.read_u256_le()?;
        let gas_limit = decoder.read_u64_le()?;
        let payload = decoder.read_var_bytes()?;
        Ok(Self {
            nonce,
            recipient,
            value,
            gas_limit,
            payload,
        })
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }
}
