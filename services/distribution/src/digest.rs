//! Content digests
//!
//! Digests are the identity of every blob and manifest: `sha256:` followed by
//! 64 lowercase hex characters of the content's hash.

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWrite;

use crate::error::RegistryError;

const SHA256_HEX_LEN: usize = 64;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    /// SHA-256
    Sha256,
}

impl Algorithm {
    /// The algorithm name as it appears in digest strings
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content digest, e.g. `sha256:e3b0c442...`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Compute the digest of `content`
    pub fn compute(content: &[u8]) -> Self {
        Digest {
            algorithm: Algorithm::Sha256,
            hex: hex::encode(Sha256::digest(content)),
        }
    }

    /// Recompute the digest of `content` and compare it with this one
    pub fn verify(&self, content: &[u8]) -> bool {
        Digest::compute(content) == *self
    }

    /// The hash algorithm
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The lowercase hex encoded hash
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| RegistryError::DigestInvalid {
            digest: s.to_string(),
            reason,
        };

        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| invalid("missing algorithm prefix"))?;

        let algorithm = match algorithm {
            "sha256" => Algorithm::Sha256,
            "" => return Err(invalid("missing algorithm prefix")),
            _ => return Err(invalid("unsupported digest algorithm")),
        };

        if hex.len() != SHA256_HEX_LEN {
            return Err(invalid("wrong hash length"));
        }

        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(invalid("hash must be lowercase hex"));
        }

        Ok(Digest {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// An [`AsyncWrite`] sink which hashes and counts everything written to it.
///
/// Used to verify content held by a storage backend by downloading it into the
/// hasher, without buffering the content in memory.
#[derive(Clone, Default)]
pub struct DigestWriter {
    hasher: Sha256,
    written: u64,
}

impl fmt::Debug for DigestWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestWriter")
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

impl DigestWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Consume the writer, returning the digest of everything written and its length
    pub fn finish(self) -> (Digest, u64) {
        let digest = Digest {
            algorithm: Algorithm::Sha256,
            hex: hex::encode(self.hasher.finalize()),
        };
        (digest, self.written)
    }
}

impl AsyncWrite for DigestWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        this.hasher.update(buf);
        this.written += buf.len() as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
