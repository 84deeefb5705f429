//! Content hashes.
//!
//! A [`ContentHash`] identifies a blob by its bytes: identical bytes always
//! produce identical hashes, on every machine and across process restarts.
//! The hash carries a typed algorithm prefix so that the on-disk and on-wire
//! encodings remain self-describing if the algorithm ever changes.

use color_eyre::eyre::{Context, bail};
use derive_more::Display;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{Display as StrumDisplay, EnumString};
use tracing::{instrument, trace};

/// The hash algorithm used to produce a [`ContentHash`].
///
/// There is exactly one algorithm today. The enum exists so that hashes
/// rendered to disk or the wire stay parseable if we ever migrate.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, StrumDisplay, EnumString, Default,
)]
#[strum(serialize_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Blake3,
}

/// The number of bytes in a content hash digest.
pub const DIGEST_LEN: usize = 32;

/// A 256-bit content identifier with a typed algorithm prefix.
///
/// Rendered as `{algorithm}:{hex}`, e.g. `blake3:af13...`. Equality includes
/// the algorithm: the same digest under two algorithms is two different
/// hashes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display("{}:{}", algorithm, self.digest_hex())]
pub struct ContentHash {
    algorithm: HashAlgorithm,
    digest: [u8; DIGEST_LEN],
}

impl ContentHash {
    /// Hash the contents of a buffer.
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(buffer.as_ref());
        Self::from_blake3(hasher.finalize())
    }

    /// Hash the contents of the iterator in order.
    ///
    /// Each field is length-prefixed before hashing so that field boundaries
    /// are unambiguous: `["ab", "c"]` and `["a", "bc"]` hash differently.
    pub fn from_fields(fields: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in fields {
            let field = field.as_ref();
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        Self::from_blake3(hasher.finalize())
    }

    /// Wrap a finalized blake3 hash.
    pub fn from_blake3(hash: blake3::Hash) -> Self {
        Self {
            algorithm: HashAlgorithm::Blake3,
            digest: *hash.as_bytes(),
        }
    }

    /// Parse a hash from raw digest bytes (the inverse of `digest`).
    ///
    /// The bytes must be exactly [`DIGEST_LEN`] long.
    pub fn from_digest(algorithm: HashAlgorithm, bytes: impl AsRef<[u8]>) -> color_eyre::Result<Self> {
        let bytes = bytes.as_ref();
        let len = bytes.len();
        if len != DIGEST_LEN {
            bail!("invalid digest length: expected {DIGEST_LEN} bytes, got {len}");
        }
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(bytes);
        Ok(Self { algorithm, digest })
    }

    /// Attempt to parse the hash from its rendered `{algorithm}:{hex}` form.
    ///
    /// A bare hex string (no prefix) is accepted and interpreted as the
    /// default algorithm, so that hand-written fixtures stay terse.
    #[instrument(fields(rendered = rendered.as_ref()))]
    pub fn parse(rendered: impl AsRef<str>) -> color_eyre::Result<Self> {
        let rendered = rendered.as_ref();
        let (algorithm, hex) = match rendered.split_once(':') {
            Some((algo, hex)) => (algo.parse::<HashAlgorithm>().context("parse algorithm")?, hex),
            None => (HashAlgorithm::default(), rendered),
        };

        let bytes = hex::decode(hex).context("decode hex")?;
        trace!(len = bytes.len(), "decoded hex digest");
        Self::from_digest(algorithm, bytes)
    }

    /// The algorithm that produced this hash.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// View the raw digest bytes.
    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// The digest as a hex string, without the algorithm prefix.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl From<&ContentHash> for ContentHash {
    fn from(hash: &ContentHash) -> Self {
        *hash
    }
}

impl AsRef<[u8]> for ContentHash {
    fn as_ref(&self) -> &[u8] {
        &self.digest
    }
}

impl PartialEq<blake3::Hash> for ContentHash {
    fn eq(&self, other: &blake3::Hash) -> bool {
        self.algorithm == HashAlgorithm::Blake3 && &self.digest == other.as_bytes()
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let rendered = String::deserialize(deserializer)?;
        Self::parse(&rendered).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn rendered_round_trip() {
        let hash = ContentHash::from_buffer(b"hello world");
        let parsed = ContentHash::parse(hash.to_string()).unwrap();
        pretty_assert_eq!(parsed, hash);
    }

    #[test]
    fn bare_hex_parses_as_default_algorithm() {
        let hash = ContentHash::from_buffer(b"hello world");
        let parsed = ContentHash::parse(hash.digest_hex()).unwrap();
        pretty_assert_eq!(parsed, hash);
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let a = ContentHash::from_fields(["ab", "c"]);
        let b = ContentHash::from_fields(["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn identical_bytes_identical_hash() {
        let a = ContentHash::from_buffer(b"42");
        let b = ContentHash::from_buffer(b"42");
        pretty_assert_eq!(a, b);
    }

    #[test]
    fn rejects_bad_digest_length() {
        assert!(ContentHash::parse("blake3:abcd").is_err());
        assert!(ContentHash::from_digest(HashAlgorithm::Blake3, [0u8; 16]).is_err());
    }
}
