//! # Packet Codec
//!
//! Compression for `compressPacket` / `decompressPacket`. Every packet
//! starts with a one-byte codec tag so the receiving side does not need to
//! know which codec the sender picked.

use std::io::{Read, Write};

use crate::error::{VoidError, VoidResult};

/// zstd compression level used for packets
pub const ZSTD_LEVEL: i32 = 3;

/// Packet compression codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Better ratio, default
    #[default]
    Zstd,
    /// Faster, less compression
    Lz4,
}

impl Codec {
    fn tag(self) -> u8 {
        match self {
            Codec::Zstd => 1,
            Codec::Lz4 => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Codec::Zstd),
            2 => Some(Codec::Lz4),
            _ => None,
        }
    }
}

/// Compress `data` into a tagged packet
pub fn compress(data: &[u8], codec: Codec) -> VoidResult<Vec<u8>> {
    let mut packet = Vec::with_capacity(data.len() / 2 + 16);
    packet.push(codec.tag());

    match codec {
        Codec::Zstd => {
            let mut encoder = zstd::stream::Encoder::new(packet, ZSTD_LEVEL)
                .map_err(|e| VoidError::Codec(format!("failed to create encoder: {}", e)))?;
            encoder
                .write_all(data)
                .map_err(|e| VoidError::Codec(format!("failed to write data: {}", e)))?;
            encoder
                .finish()
                .map_err(|e| VoidError::Codec(format!("failed to finish compression: {}", e)))
        }
        Codec::Lz4 => {
            packet.extend_from_slice(&lz4_flex::compress_prepend_size(data));
            Ok(packet)
        }
    }
}

/// Decompress a tagged packet
pub fn decompress(packet: &[u8]) -> VoidResult<Vec<u8>> {
    let (&tag, payload) = packet
        .split_first()
        .ok_or_else(|| VoidError::Codec("empty packet".into()))?;

    match Codec::from_tag(tag) {
        Some(Codec::Zstd) => {
            let mut decoder = zstd::stream::Decoder::new(payload)
                .map_err(|e| VoidError::Codec(format!("failed to create decoder: {}", e)))?;
            let mut output = Vec::new();
            decoder
                .read_to_end(&mut output)
                .map_err(|e| VoidError::Codec(format!("failed to decompress: {}", e)))?;
            Ok(output)
        }
        Some(Codec::Lz4) => lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| VoidError::Codec(format!("lz4 decompression failed: {}", e))),
        None => Err(VoidError::Codec(format!("unknown codec tag {}", tag))),
    }
}
