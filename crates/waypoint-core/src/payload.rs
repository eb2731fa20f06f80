//! Bundle payload handles
//!
//! A payload either lives in memory (`Bytes`, so fragment slices are
//! zero-copy) or is spooled to a file under the store's payload directory.
//! Disk payload bytes are only readable through the bundle store, which
//! owns the files and the fd cache.

use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where payload bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadLocation {
    /// Held in memory
    Memory,
    /// Spooled to a file owned by the bundle store
    Disk,
}

/// Errors from payload access
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// Byte access on a disk payload; go through the bundle store
    #[error("payload is on disk; read it through the bundle store")]
    NotInMemory,

    /// Requested range extends past the payload
    #[error("payload range {offset}+{len} out of bounds (payload length {payload_len})")]
    RangeOutOfBounds {
        offset: u64,
        len: u64,
        payload_len: u64,
    },
}

/// A bundle payload handle
#[derive(Debug, Clone)]
pub enum Payload {
    /// In-memory payload
    Memory(Bytes),
    /// Disk payload: path and durable length
    Disk { path: PathBuf, len: u64 },
}

impl Payload {
    /// An empty in-memory payload
    pub fn empty() -> Self {
        Payload::Memory(Bytes::new())
    }

    /// Wrap in-memory bytes
    pub fn memory(data: impl Into<Bytes>) -> Self {
        Payload::Memory(data.into())
    }

    /// Reference a spooled payload file
    pub fn disk(path: PathBuf, len: u64) -> Self {
        Payload::Disk { path, len }
    }

    /// Payload length in bytes
    pub fn len(&self) -> u64 {
        match self {
            Payload::Memory(b) => b.len() as u64,
            Payload::Disk { len, .. } => *len,
        }
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Where the bytes live
    pub fn location(&self) -> PayloadLocation {
        match self {
            Payload::Memory(_) => PayloadLocation::Memory,
            Payload::Disk { .. } => PayloadLocation::Disk,
        }
    }

    /// The file path for disk payloads
    pub fn file_path(&self) -> Option<&PathBuf> {
        match self {
            Payload::Memory(_) => None,
            Payload::Disk { path, .. } => Some(path),
        }
    }

    /// The whole payload, when it is in memory
    pub fn bytes(&self) -> Result<Bytes, PayloadError> {
        match self {
            Payload::Memory(b) => Ok(b.clone()),
            Payload::Disk { .. } => Err(PayloadError::NotInMemory),
        }
    }

    /// A zero-copy slice of an in-memory payload
    pub fn slice(&self, offset: u64, len: u64) -> Result<Bytes, PayloadError> {
        let total = self.len();
        if offset.saturating_add(len) > total {
            return Err(PayloadError::RangeOutOfBounds {
                offset,
                len,
                payload_len: total,
            });
        }
        match self {
            Payload::Memory(b) => Ok(b.slice(offset as usize..(offset + len) as usize)),
            Payload::Disk { .. } => Err(PayloadError::NotInMemory),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_payload() {
        let p = Payload::memory(&b"hello world"[..]);
        assert_eq!(p.len(), 11);
        assert_eq!(p.location(), PayloadLocation::Memory);
        assert_eq!(p.slice(6, 5).unwrap(), Bytes::from_static(b"world"));
    }

    #[test]
    fn test_slice_bounds() {
        let p = Payload::memory(&b"abc"[..]);
        assert!(p.slice(0, 3).is_ok());
        assert!(matches!(
            p.slice(1, 3),
            Err(PayloadError::RangeOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_disk_payload_refuses_direct_reads() {
        let p = Payload::disk(PathBuf::from("/tmp/payload.0"), 42);
        assert_eq!(p.len(), 42);
        assert_eq!(p.location(), PayloadLocation::Disk);
        assert!(matches!(p.bytes(), Err(PayloadError::NotInMemory)));
    }
}
