//! Boot-environment block codec.
//!
//! Devices read their boot configuration from a fixed-size binary region
//! (U-Boot style environment). The layout is a compatibility contract with
//! the bootloader parser and must not drift:
//!
//! - bytes `[0..4]`: CRC-32C (Castagnoli) checksum, little-endian, computed
//!   over the entire padded data region
//! - bytes `[4..block_size]`: `key=value` records separated by single NUL
//!   bytes, terminated by an empty record (two NULs), then NUL padding out
//!   to the end of the region

use std::fmt::Write as _;

use crc::{CRC_32_ISCSI, Crc};
use thiserror::Error;

/// Checksum header size in bytes.
const CHECKSUM_LEN: usize = 4;

/// CRC-32C, the polynomial the bootloader verifies against.
const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Errors produced by the environment codec.
#[derive(Debug, Error)]
pub enum EnvBlockError {
    /// The serialized environment does not fit in the requested block.
    #[error("environment data needs {needed} bytes but the block holds {capacity}")]
    Oversize { needed: usize, capacity: usize },

    /// A key was inserted twice.
    #[error("duplicate environment key: {0}")]
    DuplicateKey(String),

    /// The block is smaller than the checksum header plus the terminator.
    #[error("block of {0} bytes is too small to be an environment block")]
    BlockTooSmall(usize),

    /// Stored checksum does not match the data region.
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    /// A record without a `=` separator was found while decoding.
    #[error("malformed record (no '=' separator): {0:?}")]
    MalformedRecord(String),

    /// A record contains bytes that are not valid UTF-8.
    #[error("record is not valid UTF-8")]
    InvalidUtf8,
}

/// Ordered string-to-string mapping rendered into the boot block.
///
/// Insertion order is preserved end to end; the bootloader sees records in
/// the order they were set here. Duplicate keys are rejected rather than
/// overwritten so a provisioning bug cannot silently drop a field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootEnvironment {
    entries: Vec<(String, String)>,
}

impl BootEnvironment {
    /// Create an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a `key=value` entry.
    ///
    /// # Errors
    ///
    /// Returns [`EnvBlockError::DuplicateKey`] if the key is already set.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), EnvBlockError> {
        let key = key.into();
        if self.entries.iter().any(|(k, _)| *k == key) {
            return Err(EnvBlockError::DuplicateKey(key));
        }
        self.entries.push((key, value.into()));
        Ok(())
    }

    /// Look up a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the environment holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the environment into a binary block of exactly `block_size`
    /// bytes: checksum header followed by the padded data region.
    ///
    /// # Errors
    ///
    /// Returns [`EnvBlockError::Oversize`] if the NUL-terminated records plus
    /// the 4-byte header exceed `block_size`, and
    /// [`EnvBlockError::BlockTooSmall`] if `block_size` cannot hold even an
    /// empty environment.
    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>, EnvBlockError> {
        if block_size < CHECKSUM_LEN + 2 {
            return Err(EnvBlockError::BlockTooSmall(block_size));
        }
        let capacity = block_size - CHECKSUM_LEN;

        let mut records = String::new();
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                records.push('\0');
            }
            // Infallible for String.
            let _ = write!(records, "{key}={value}");
        }

        // Terminating empty record, then pad the region with NULs.
        let needed = records.len() + 2;
        if needed > capacity {
            return Err(EnvBlockError::Oversize { needed, capacity });
        }

        let mut data = Vec::with_capacity(block_size);
        data.extend_from_slice(&[0; CHECKSUM_LEN]);
        data.extend_from_slice(records.as_bytes());
        data.resize(block_size, 0);

        let crc = CRC32C.checksum(&data[CHECKSUM_LEN..]);
        data[..CHECKSUM_LEN].copy_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Parse a binary block back into an environment, verifying the checksum
    /// over the data region first.
    ///
    /// # Errors
    ///
    /// Returns an error if the block is truncated, the checksum does not
    /// match, or a record is malformed.
    pub fn decode(block: &[u8]) -> Result<Self, EnvBlockError> {
        if block.len() < CHECKSUM_LEN + 2 {
            return Err(EnvBlockError::BlockTooSmall(block.len()));
        }
        let stored = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        let data = &block[CHECKSUM_LEN..];
        let computed = CRC32C.checksum(data);
        if stored != computed {
            return Err(EnvBlockError::ChecksumMismatch { stored, computed });
        }

        let mut env = Self::new();
        for record in data.split(|&b| b == 0) {
            if record.is_empty() {
                // Empty terminating record; everything after it is padding.
                break;
            }
            let record = std::str::from_utf8(record).map_err(|_| EnvBlockError::InvalidUtf8)?;
            let Some((key, value)) = record.split_once('=') else {
                return Err(EnvBlockError::MalformedRecord(record.to_string()));
            };
            env.set(key, value)?;
        }
        Ok(env)
    }
}
