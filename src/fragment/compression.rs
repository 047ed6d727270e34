//! Per-tile compression

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{AtlasError, Result};
use crate::schema::Compression;

pub(crate) fn compress(codec: Compression, raw: &[u8]) -> Result<Vec<u8>> {
    Ok(match codec {
        Compression::None => raw.to_vec(),
        Compression::Lz4 => lz4_flex::block::compress(raw),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(raw)
                .map_err(|e| AtlasError::Compression(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| AtlasError::Compression(e.to_string()))?
        }
    })
}

pub(crate) fn decompress(codec: Compression, stored: Vec<u8>, raw_size: usize) -> Result<Vec<u8>> {
    let raw = match codec {
        Compression::None => stored,
        Compression::Lz4 => lz4_flex::block::decompress(&stored, raw_size)
            .map_err(|e| AtlasError::Compression(e.to_string()))?,
        Compression::Gzip => {
            let mut raw = Vec::with_capacity(raw_size);
            GzDecoder::new(stored.as_slice())
                .read_to_end(&mut raw)
                .map_err(|e| AtlasError::Compression(e.to_string()))?;
            raw
        }
    };
    if raw.len() != raw_size {
        return Err(AtlasError::Corruption(format!(
            "tile decodes to {} bytes, book says {}",
            raw.len(),
            raw_size
        )));
    }
    Ok(raw)
}
