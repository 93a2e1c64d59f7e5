//! Member codecs of the packed archive
//!
//! A codec is built for one [`CompressionMethod`] at one
//! [`CompressionLevel`]; the level only matters when packing.

use crate::error::{Result, VolsegError};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    None,
    /// Raw deflate stream
    Deflate,
    #[default]
    Zstd,
}

impl CompressionMethod {
    pub fn codec(self, level: CompressionLevel) -> Box<dyn Compressor> {
        match self {
            CompressionMethod::None => Box::new(StoredCodec),
            CompressionMethod::Deflate => Box::new(DeflateCompressor::new(level)),
            CompressionMethod::Zstd => Box::new(ZstdCompressor::new(level)),
        }
    }
}

/// Effort from 1 (fastest) to 9 (smallest), mapped onto each codec's scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub const FASTEST: Self = Self(1);
    pub const SMALLEST: Self = Self(9);

    pub fn new(level: u8) -> Self {
        Self(level.clamp(1, 9))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    fn deflate(self) -> flate2::Compression {
        flate2::Compression::new(u32::from(self.0))
    }

    /// 1..=9 spread over zstd's 1..=19
    fn zstd(self) -> i32 {
        1 + (i32::from(self.0) - 1) * 9 / 4
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(3)
    }
}

impl From<u8> for CompressionLevel {
    fn from(level: u8) -> Self {
        Self::new(level)
    }
}

impl From<CompressionLevel> for u8 {
    fn from(level: CompressionLevel) -> Self {
        level.0
    }
}

pub trait Compressor: Send + Sync {
    fn method(&self) -> CompressionMethod;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// `expected_size` is the exact unpacked length recorded in the index
    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>>;
}

fn expect_len(method: CompressionMethod, out: Vec<u8>, expected_size: usize) -> Result<Vec<u8>> {
    if out.len() == expected_size {
        Ok(out)
    } else {
        Err(VolsegError::Decompression(format!(
            "{:?} member unpacked to {} bytes, index says {}",
            method,
            out.len(),
            expected_size
        )))
    }
}

#[derive(Debug, Clone, Copy)]
struct StoredCodec;

impl Compressor for StoredCodec {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        expect_len(self.method(), data.to_vec(), expected_size)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeflateCompressor {
    level: flate2::Compression,
}

impl DeflateCompressor {
    pub fn new(level: CompressionLevel) -> Self {
        Self {
            level: level.deflate(),
        }
    }
}

impl Compressor for DeflateCompressor {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Deflate
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| VolsegError::Compression(format!("deflate: {}", e)))
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        // one byte past the expected size is enough to detect overlong members
        let mut out = Vec::with_capacity(expected_size);
        DeflateDecoder::new(data)
            .take(expected_size as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| VolsegError::Decompression(format!("deflate: {}", e)))?;
        expect_len(self.method(), out, expected_size)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new(level: CompressionLevel) -> Self {
        Self { level: level.zstd() }
    }
}

impl Compressor for ZstdCompressor {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(data, self.level)
            .map_err(|e| VolsegError::Compression(format!("zstd: {}", e)))
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let out = zstd::bulk::decompress(data, expected_size)
            .map_err(|e| VolsegError::Decompression(format!("zstd: {}", e)))?;
        expect_len(self.method(), out, expected_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Little-endian f32 plateaus, like a smooth density grid
    fn grid_bytes() -> Vec<u8> {
        (0..4096u32).flat_map(|i| ((i / 64) as f32).to_le_bytes()).collect()
    }

    #[test]
    fn test_each_method_restores_members() {
        let data = grid_bytes();
        for method in [CompressionMethod::None, CompressionMethod::Deflate, CompressionMethod::Zstd] {
            for level in [CompressionLevel::FASTEST, CompressionLevel::SMALLEST] {
                let codec = method.codec(level);
                assert_eq!(codec.method(), method);
                let packed = codec.compress(&data).unwrap();
                if method != CompressionMethod::None {
                    assert!(packed.len() < data.len() / 4);
                }
                assert_eq!(codec.decompress(&packed, data.len()).unwrap(), data);
            }
        }
    }

    #[test]
    fn test_wrong_expected_size() {
        for method in [CompressionMethod::None, CompressionMethod::Deflate, CompressionMethod::Zstd] {
            let codec = method.codec(CompressionLevel::default());
            let packed = codec.compress(b"abcdef").unwrap();
            assert!(matches!(codec.decompress(&packed, 5), Err(VolsegError::Decompression(_))));
            assert!(matches!(codec.decompress(&packed, 7), Err(VolsegError::Decompression(_))));
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        let codec = CompressionMethod::Zstd.codec(CompressionLevel::default());
        assert!(codec.decompress(b"definitely not zstd", 19).is_err());
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(CompressionLevel::new(0), CompressionLevel::FASTEST);
        assert_eq!(CompressionLevel::new(42).get(), 9);
        assert_eq!(CompressionLevel::FASTEST.zstd(), 1);
        assert_eq!(CompressionLevel::SMALLEST.zstd(), 19);
        assert_eq!(serde_json::to_string(&CompressionMethod::Deflate).unwrap(), "\"deflate\"");
        let level: CompressionLevel = serde_json::from_str("12").unwrap();
        assert_eq!(level, CompressionLevel::SMALLEST);
    }
}
