use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::{sha256d, Hash256};

/// Post-execution receipt for a single transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub succeeded: bool,
    pub cumulative_gas: u64,
    pub logs: Vec<Vec<u8>>,
}

impl Receipt {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(u8::from(self.succeeded));
        encoder.write_u64_le(self.cumulative_gas);
        encoder.write_varint(self.logs.len() as u64);
        for log in &self.logs {
            encoder.write_var_bytes(log);
        }
        encoder.into_inner()
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let succeeded = decoder.read_u8()? != 0;
        let cumulative_gas = decoder.read_u64_le()?;
        let count = decoder.read_varint()? as usize;
        let mut logs = Vec::with_capacity(count);
        for _ in 0..count {
            logs.push(decoder.read_var_bytes()?);
        }
        Ok(Self {
            succeeded,
            cumulative_gas,
            logs,
        })
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }
}
