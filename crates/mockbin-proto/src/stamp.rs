// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Stamp trailer: how a produced executable carries its configuration.
//!
//! The producer appends `payload JSON ‖ u64-LE payload length ‖ magic` to a
//! copy of the relay binary. At startup the shim reads the tail of its own
//! executable: if the magic is present it parses the payload, otherwise it
//! falls back to the linked-mode environment variables. The trailer is inert
//! for the loader, which only maps the sections the headers describe.

use crate::ShimConfig;
use thiserror::Error;

/// Trailer magic, 8 bytes at the very end of a stamped executable.
pub const MAGIC: &[u8; 8] = b"MOCKBIN1";

/// Fixed-size part of the trailer: length field plus magic.
pub const FOOTER_LEN: usize = 8 + MAGIC.len();

#[derive(Debug, Error)]
pub enum StampError {
    #[error("no stamp trailer present")]
    Missing,
    #[error("stamp trailer is truncated")]
    Truncated,
    #[error("stamp payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Append a stamp trailer describing `config` to `binary`.
pub fn append(binary: &mut Vec<u8>, config: &ShimConfig) -> Result<(), StampError> {
    let payload = serde_json::to_vec(config)?;
    let len = payload.len() as u64;
    binary.extend_from_slice(&payload);
    binary.extend_from_slice(&len.to_le_bytes());
    binary.extend_from_slice(MAGIC);
    Ok(())
}

/// Parse the stamp trailer out of the tail bytes of an executable.
///
/// `tail` does not need to be the whole file; any suffix long enough to
/// contain the footer and payload works.
pub fn extract(tail: &[u8]) -> Result<ShimConfig, StampError> {
    if tail.len() < FOOTER_LEN {
        return Err(StampError::Missing);
    }
    let (rest, magic) = tail.split_at(tail.len() - MAGIC.len());
    if magic != MAGIC {
        return Err(StampError::Missing);
    }
    let (rest, len_bytes) = rest.split_at(rest.len() - 8);
    let len = u64::from_le_bytes(len_bytes.try_into().expect("8-byte slice")) as usize;
    if rest.len() < len {
        return Err(StampError::Truncated);
    }
    let payload = &rest[rest.len() - len..];
    Ok(serde_json::from_slice(payload)?)
}
