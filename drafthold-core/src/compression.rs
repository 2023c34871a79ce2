/*!
Compression adapters for stored payloads.

The raw adapters (`GzipCompressor`, `NoCompression`) report failures as errors.
`BestEffortCompressor` wraps one of them with the storage policy: only
compress large payloads, keep the result only when it pays off, and turn
decompression failures into `None` so callers treat the bytes as unreadable.
*/

use crate::{DraftError, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};
use tracing::{debug, warn};

/// Payloads smaller than this are never compressed (50 KiB)
pub const COMPRESSION_THRESHOLD: usize = 50 * 1024;

/// Minimum relative size reduction for a compressed result to be kept
pub const MIN_COMPRESSION_GAIN: f64 = 0.2;

/// Compression abstraction for stored data
///
/// This trait defines the interface for all compression implementations.
/// It allows the engine to work with different compression algorithms
/// without being coupled to any specific implementation.
pub trait CompressionAdapter: Send + Sync {
    /// Compress the input data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;
}

/// Gzip compression adapter
///
/// # Example
/// ```rust
/// use drafthold_core::compression::{CompressionAdapter, GzipCompressor};
///
/// let compressor = GzipCompressor::new();
/// let data = b"some diagram data to compress";
/// let compressed = compressor.compress(data).unwrap();
/// let decompressed = compressor.decompress(&compressed).unwrap();
/// assert_eq!(data, &decompressed[..]);
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a new gzip compressor with the specified compression level (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level),
        }
    }

    /// Create a compressor for fast compression (level 1)
    pub fn fast() -> Self {
        Self::with_level(1)
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression_level);

        encoder.write_all(data).map_err(|e| {
            DraftError::compression(format!("Failed to write data for compression: {e}"))
        })?;

        encoder
            .finish()
            .map_err(|e| DraftError::compression(format!("Failed to finish compression: {e}")))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| DraftError::compression(format!("Failed to decompress data: {e}")))?;

        Ok(decompressed)
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

/// Pass-through adapter for environments where compression is unavailable
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl CompressionAdapter for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        Ok(compressed_data.to_vec())
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }
}

fn gain_percent(min_gain: f64) -> usize {
    (min_gain.clamp(0.0, 1.0) * 100.0).round() as usize
}

/// Bytes as they sit in storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stored {
    Raw(Vec<u8>),
    Compressed(Vec<u8>),
}

impl Stored {
    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Compressed(_))
    }

    /// The stored bytes, whatever their encoding
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Raw(bytes) | Self::Compressed(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// Storage compression policy on top of a [`CompressionAdapter`]
pub struct BestEffortCompressor {
    inner: Box<dyn CompressionAdapter>,
    threshold: usize,
    min_gain_percent: usize,
}

impl BestEffortCompressor {
    /// Gzip with the default threshold and gain
    pub fn new() -> Self {
        Self::with_adapter(GzipCompressor::new())
    }

    pub fn with_adapter<C: CompressionAdapter + 'static>(adapter: C) -> Self {
        Self {
            inner: Box::new(adapter),
            threshold: COMPRESSION_THRESHOLD,
            min_gain_percent: gain_percent(MIN_COMPRESSION_GAIN),
        }
    }

    /// Override the size threshold
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Override the minimum relative gain (clamped to `0.0..=1.0`)
    pub fn with_min_gain(mut self, min_gain: f64) -> Self {
        self.min_gain_percent = gain_percent(min_gain);
        self
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn algorithm_name(&self) -> &str {
        self.inner.algorithm_name()
    }

    /// Compress `data` if it is large enough and the result is worth keeping
    pub fn compress(&self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() < self.threshold {
            return None;
        }

        let compressed = match self.inner.compress(data) {
            Ok(compressed) => compressed,
            Err(e) => {
                warn!(error = %e, size = data.len(), "compression failed, storing raw bytes");
                return None;
            }
        };

        if compressed.len() * 100 > data.len() * (100 - self.min_gain_percent) {
            debug!(
                original = data.len(),
                compressed = compressed.len(),
                "compression gain below threshold, storing raw bytes"
            );
            return None;
        }

        Some(compressed)
    }

    /// Decompress `data`, or `None` if it cannot be read
    pub fn decompress(&self, data: &[u8]) -> Option<Vec<u8>> {
        match self.inner.decompress(data) {
            Ok(decompressed) => Some(decompressed),
            Err(e) => {
                warn!(error = %e, size = data.len(), "decompression failed");
                None
            }
        }
    }

    /// Wrap `data` as compressed when that pays off, raw otherwise
    pub fn pack(&self, data: Vec<u8>) -> Stored {
        match self.compress(&data) {
            Some(compressed) => Stored::Compressed(compressed),
            None => Stored::Raw(data),
        }
    }

    /// Recover the original bytes from a stored value
    pub fn unpack(&self, stored: &Stored) -> Option<Vec<u8>> {
        match stored {
            Stored::Raw(bytes) => Some(bytes.clone()),
            Stored::Compressed(bytes) => self.decompress(bytes),
        }
    }
}

impl Default for BestEffortCompressor {
    fn default() -> Self {
        Self::new()
    }
}
