//! Framed encoding for small persisted structures (schemas, fragment books)
//!
//! ```text
//! ┌───────────┬──────────────┬──────────────┬────────────────┬────────────┐
//! │ Magic (4) │ Version u16  │ Length u64   │ bincode payload│ CRC32 u32  │
//! └───────────┴──────────────┴──────────────┴────────────────┴────────────┘
//! ```
//!
//! The CRC covers the payload only. All integers are little-endian.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{AtlasError, Result};

/// Current frame format version
pub(crate) const VERSION: u16 = 1;

/// Magic (4) + Version (2) + Length (8)
const HEADER_SIZE: usize = 14;

const CRC_SIZE: usize = 4;

/// Serialize `value` and wrap it in a checksummed frame
pub(crate) fn encode_framed<T: Serialize>(magic: &[u8; 4], value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)?;
    let crc = crc32fast::hash(&payload);

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    out.extend_from_slice(magic);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Check a frame and deserialize its payload
pub(crate) fn decode_framed<T: DeserializeOwned>(magic: &[u8; 4], bytes: &[u8]) -> Result<T> {
    if bytes.len() < HEADER_SIZE + CRC_SIZE {
        return Err(AtlasError::Corruption(format!(
            "frame of {} bytes is shorter than its header",
            bytes.len()
        )));
    }
    if &bytes[0..4] != magic {
        return Err(AtlasError::Corruption(format!(
            "invalid magic: expected {:?}, got {:?}",
            magic,
            &bytes[0..4]
        )));
    }

    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(AtlasError::Corruption(format!(
            "unsupported format version: {}",
            version
        )));
    }

    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[6..HEADER_SIZE]);
    let len = u64::from_le_bytes(len) as usize;
    if bytes.len() != HEADER_SIZE + len + CRC_SIZE {
        return Err(AtlasError::Corruption(format!(
            "frame length {} disagrees with payload length {}",
            bytes.len(),
            len
        )));
    }

    let payload = &bytes[HEADER_SIZE..HEADER_SIZE + len];
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&bytes[HEADER_SIZE + len..]);
    let stored = u32::from_le_bytes(stored);
    let actual = crc32fast::hash(payload);
    if stored != actual {
        return Err(AtlasError::Corruption(format!(
            "CRC mismatch: stored {:#010x}, computed {:#010x}",
            stored, actual
        )));
    }

    Ok(bincode::deserialize(payload)?)
}
