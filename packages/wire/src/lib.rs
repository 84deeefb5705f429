//! Shared protocol types for the `kiln` build engine.
//!
//! This library holds the types that cross machine boundaries: content
//! hashes, the distribution message set, and the transport constants shared
//! by the orchestrator and worker services. It contains no engine logic.
//!
//! ## Use of `#[non_exhaustive]`
//!
//! We use `#[non_exhaustive]` on structs and enums to prevent users manually
//! constructing the types while still allowing their fields to be `pub` for
//! reading. The intention here is that users must generally construct the
//! types either by:
//! - Using constructors on the types
//! - Using builder methods
//! - Using deserialization
//!
//! We do this because some types in this module may contain invariants that
//! need to be upheld, and it's easier to ensure that all types follow these
//! guidelines in the module than do it piecemeal.

use std::{fmt, str::FromStr};

use color_eyre::eyre::bail;
use derive_more::Display;
use enum_assoc::Assoc;
use http::header::{self, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tap::Pipe;

pub mod dist;
mod hash;

pub use hash::{ContentHash, HashAlgorithm};

/// An authentication token for worker/orchestrator access.
///
/// This type wraps a token string and ensures it is never accidentally leaked
/// in logs or debug output. To access the actual token value, use the
/// `expose()` method.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(String);

impl Token {
    /// Expose the raw token value.
    ///
    /// This method must be called explicitly to access the token string,
    /// preventing accidental exposure in logs or debug output.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl FromStr for Token {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            bail!("token cannot be empty");
        }
        String::from(s).pipe(Self).pipe(Ok)
    }
}

impl<S: Into<String>> From<S> for Token {
    fn from(s: S) -> Self {
        Self(s.into())
    }
}

/// The default buffer size used by the client and server.
///
/// We're sending relatively large chunks over the network, so we think this is
/// a good buffer size to use, but haven't done a lot of testing with different
/// sizes.
pub const NETWORK_BUFFER_SIZE: usize = 1024 * 1024;

/// The default buffer size for static local buffers, e.g. when hashing files.
/// The goal with this is to allow things like SIMD operations but not be so
/// large that the buffer is unwieldy or too expensive.
pub const LOCAL_BUFFER_SIZE: usize = 16 * 1024;

/// Content types used on the distribution transport.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Assoc)]
#[func(pub const fn value(&self) -> HeaderValue)]
#[func(pub const fn to_str(&self) -> &'static str)]
#[display("{}", self.to_str())]
pub enum ContentType {
    /// MessagePack-encoded protocol messages.
    #[assoc(to_str = "application/msgpack")]
    #[assoc(value = HeaderValue::from_static(self.to_str()))]
    MsgPack,

    /// Raw blob bytes.
    #[assoc(to_str = "application/octet-stream")]
    #[assoc(value = HeaderValue::from_static(self.to_str()))]
    Bytes,

    /// Raw blob bytes, compressed with zstd.
    #[assoc(to_str = "application/octet-stream+zstd")]
    #[assoc(value = HeaderValue::from_static(self.to_str()))]
    BytesZstd,

    /// JSON, used for health and introspection endpoints.
    #[assoc(to_str = "application/json")]
    #[assoc(value = HeaderValue::from_static(self.to_str()))]
    Json,
}

impl ContentType {
    pub const HEADER: HeaderName = header::CONTENT_TYPE;
    pub const ACCEPT: HeaderName = header::ACCEPT;
}

impl PartialEq<ContentType> for HeaderValue {
    fn eq(&self, other: &ContentType) -> bool {
        self == other.value()
    }
}

impl PartialEq<ContentType> for &HeaderValue {
    fn eq(&self, other: &ContentType) -> bool {
        *self == other.value()
    }
}

impl PartialEq<HeaderValue> for ContentType {
    fn eq(&self, other: &HeaderValue) -> bool {
        other == self.value()
    }
}
