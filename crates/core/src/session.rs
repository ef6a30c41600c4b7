//! Session persistence for the memory subsystem's auxiliary caches.
//!
//! The shadow bitmap itself is never persisted: after a session load it is
//! always recomputed by a full resync against whatever the restored guest
//! RAM contains. Only the handful of scalar caches needed to resume
//! classification travel in the blob.
//!
//! ## Blob format
//!
//! ```text
//! +------------------+
//! | Magic "SMEM"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian (currently 1)
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode payload
//! +------------------+
//! ```
//!
//! The surrounding emulator owns the session file; this core only reads
//! and writes the opaque blob.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::OsVersion;

/// Magic bytes identifying a memory-subsystem session blob.
const MAGIC: &[u8; 4] = b"SMEM";
/// Current blob format version.
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session blob too small ({0} bytes)")]
    Truncated(usize),
    #[error("bad session blob magic")]
    BadMagic,
    #[error("unsupported session blob version {found} (expected {expected})")]
    BadVersion { found: u32, expected: u32 },
    #[error("decompress error: {0}")]
    Decompress(String),
    #[error("serialize error: {0}")]
    Serialize(String),
}

/// The auxiliary caches that survive a session save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxState {
    pub os_version: OsVersion,
    /// Heap header addresses to re-register (and re-scan) on load.
    pub heap_bases: Vec<u32>,
    /// Chunk header addresses known at save time.
    pub tracked_chunks: Vec<u32>,
}

/// Serialize the aux caches into a blob.
pub fn save_to_vec(state: &AuxState) -> Result<Vec<u8>, SessionError> {
    let payload =
        bincode::serialize(state).map_err(|e| SessionError::Serialize(e.to_string()))?;
    let compressed = miniz_oxide::deflate::compress_to_vec(&payload, 6);

    let mut out = Vec::with_capacity(8 + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Parse a blob, verifying magic and version.
pub fn load_from_slice(data: &[u8]) -> Result<AuxState, SessionError> {
    if data.len() < 8 {
        return Err(SessionError::Truncated(data.len()));
    }
    if &data[0..4] != MAGIC {
        return Err(SessionError::BadMagic);
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != FORMAT_VERSION {
        return Err(SessionError::BadVersion { found: version, expected: FORMAT_VERSION });
    }

    let decompressed = miniz_oxide::inflate::decompress_to_vec(&data[8..])
        .map_err(|e| SessionError::Decompress(format!("{:?}", e)))?;

    bincode::deserialize(&decompressed).map_err(|e| SessionError::Serialize(e.to_string()))
}
