/*!
Stored envelope around document payloads.

Layout (32-byte header + payload, integers little-endian):

| bytes  | field                                   |
|--------|-----------------------------------------|
| 0-3    | magic `"DRFT"`                          |
| 4-5    | format version                          |
| 6      | flags (bit 0: payload is compressed)    |
| 7      | reserved, zero                          |
| 8-15   | write timestamp, ms since Unix epoch    |
| 16-19  | CRC-32 of the payload                   |
| 20-27  | payload length                          |
| 28-31  | reserved, zero                          |
| 32..   | payload                                 |

A torn or truncated write fails the length or checksum check on decode.
*/

use crate::checksum::Checksum;
use crate::compression::{BestEffortCompressor, Stored};
use crate::model::Document;
use crate::validator;
use crate::{DraftError, Result};
use chrono::{DateTime, Utc};

const ENVELOPE_MAGIC: &[u8; 4] = b"DRFT";

/// Current envelope format version
pub const ENVELOPE_VERSION: u16 = 1;

/// Size of the fixed header in bytes
pub const ENVELOPE_HEADER_SIZE: usize = 32;

const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// A payload plus the metadata needed to read it back
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub stored: Stored,
    pub timestamp: DateTime<Utc>,
    pub version: u16,
}

impl Envelope {
    /// Wrap a payload stamped with the current time
    pub fn new(stored: Stored) -> Self {
        Self {
            stored,
            timestamp: Utc::now(),
            version: ENVELOPE_VERSION,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.stored.is_compressed()
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload = self.stored.as_bytes();
        let flags = if self.stored.is_compressed() {
            FLAG_COMPRESSED
        } else {
            0
        };

        let mut out = Vec::with_capacity(ENVELOPE_HEADER_SIZE + payload.len());
        out.extend_from_slice(ENVELOPE_MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.push(flags);
        out.push(0);
        out.extend_from_slice(&self.timestamp.timestamp_millis().to_le_bytes());
        out.extend_from_slice(&Checksum::compute(payload).value().to_le_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(payload);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < ENVELOPE_HEADER_SIZE {
            return Err(DraftError::corruption(format!(
                "envelope too small: {} bytes (minimum {ENVELOPE_HEADER_SIZE})",
                data.len()
            )));
        }

        let (header, payload) = data.split_at(ENVELOPE_HEADER_SIZE);
        if &header[0..4] != ENVELOPE_MAGIC {
            return Err(DraftError::invalid_format("missing envelope magic"));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > ENVELOPE_VERSION {
            return Err(DraftError::invalid_format(format!(
                "unsupported envelope version {version} (current: {ENVELOPE_VERSION})"
            )));
        }

        let flags = header[6];
        let millis = i64::from_le_bytes(read_array(&header[8..16]));
        let expected = Checksum::from_raw(u32::from_le_bytes(read_array(&header[16..20])));
        let declared_len = u64::from_le_bytes(read_array(&header[20..28]));

        if declared_len != payload.len() as u64 {
            return Err(DraftError::corruption(format!(
                "envelope length mismatch: declared {declared_len}, actual {}",
                payload.len()
            )));
        }
        expected.verify(payload)?;

        let timestamp = DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| DraftError::corruption(format!("invalid timestamp {millis}")))?;
        let stored = if flags & FLAG_COMPRESSED != 0 {
            Stored::Compressed(payload.to_vec())
        } else {
            Stored::Raw(payload.to_vec())
        };

        Ok(Self {
            stored,
            timestamp,
            version,
        })
    }

    /// Recover the document carried by this envelope
    ///
    /// The payload must decompress, parse and pass validation; any failure is
    /// reported as corruption of the stored copy.
    pub fn into_document(self, codec: &BestEffortCompressor) -> Result<Document> {
        let payload = codec
            .unpack(&self.stored)
            .ok_or_else(|| DraftError::corruption("payload failed to decompress"))?;

        let value: serde_json::Value = serde_json::from_slice(&payload)?;
        let report = validator::validate(&value);
        if !report.is_valid {
            return Err(DraftError::corruption(format!(
                "stored document fails validation: {}",
                report.errors.join("; ")
            )));
        }
        Ok(serde_json::from_value(value)?)
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
