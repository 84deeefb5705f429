//! Cache descriptors and their on-disk encoding.
//!
//! A descriptor is a self-describing binary record:
//!
//! ```text
//! [version: u32 LE][payload: rmp][checksum: 32 bytes = blake3(payload)]
//! ```
//!
//! Decoding is deliberately forgiving: an unknown version, a bad checksum,
//! or a malformed payload all decode to "no descriptor" rather than an
//! error, because a cache that fails open costs a rebuild while a cache
//! that fails closed costs the build.

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use wire::ContentHash;

use crate::fingerprint::{ObservationKind, StrongFingerprint, WeakFingerprint};

/// Current descriptor format version.
pub const VERSION: u32 = 1;

/// One output recorded in a descriptor.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct DescriptorOutput {
    /// Canonical path, post-translation.
    pub path: String,
    pub hash: ContentHash,
    pub rewrite_count: u32,
}

/// One observed input recorded in a descriptor.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ObservedInput {
    pub path: String,
    pub kind: ObservationKind,
    /// Present for content observations.
    pub hash: Option<ContentHash>,
}

/// Everything needed to replay a pip from cache.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct CacheDescriptor {
    pub weak: WeakFingerprint,
    pub strong: StrongFingerprint,
    pub outputs: Vec<DescriptorOutput>,
    pub observed_inputs: Vec<ObservedInput>,
    /// Free-form provenance: who built this, from what.
    pub trace_info: String,
    /// The build session that published the descriptor.
    pub session_id: Uuid,
    pub stored_at: jiff::Timestamp,
}

/// Encode a descriptor for storage.
pub fn encode(descriptor: &CacheDescriptor) -> color_eyre::Result<Vec<u8>> {
    use color_eyre::eyre::Context;
    let payload = rmp_serde::to_vec_named(descriptor).context("encode descriptor")?;
    let checksum = ContentHash::from_buffer(&payload);

    let mut record = Vec::with_capacity(4 + payload.len() + 32);
    record.extend_from_slice(&VERSION.to_le_bytes());
    record.extend_from_slice(&payload);
    record.extend_from_slice(checksum.digest());
    Ok(record)
}

/// Decode a stored descriptor.
///
/// Returns `None` (a cache miss) for unknown versions, checksum mismatches,
/// or malformed payloads; each case is logged.
pub fn decode(record: &[u8]) -> Option<CacheDescriptor> {
    if record.len() < 4 + 32 {
        warn!(len = record.len(), "descriptor record too short");
        return None;
    }

    let version = u32::from_le_bytes(record[0..4].try_into().expect("4 bytes"));
    if version != VERSION {
        warn!(version, "unknown descriptor version, treating as miss");
        return None;
    }

    let payload = &record[4..record.len() - 32];
    let stored_checksum = &record[record.len() - 32..];
    let actual = ContentHash::from_buffer(payload);
    if actual.digest() != stored_checksum {
        warn!("descriptor checksum mismatch, treating as miss");
        return None;
    }

    match rmp_serde::from_slice(payload) {
        Ok(descriptor) => Some(descriptor),
        Err(err) => {
            warn!(?err, "malformed descriptor payload, treating as miss");
            None
        }
    }
}
