/*!
CRC-32 integrity digests for stored payloads.
*/

use crate::{DraftError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fast, non-cryptographic digest of a byte payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(u32);

impl Checksum {
    /// Compute the digest of `data`
    pub fn compute(data: &[u8]) -> Self {
        Self(crc32fast::hash(data))
    }

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Check `data` against this digest
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let actual = Self::compute(data);
        if actual == *self {
            Ok(())
        } else {
            Err(DraftError::IntegrityCheckFailed {
                expected: *self,
                actual,
            })
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}
