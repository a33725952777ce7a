//! Content fingerprints for conditional node reads
//!
//! The tag is SHA-256 over the canonical JSON encoding of the payload. Object
//! keys are emitted in sorted order (serde_json's default map is ordered), so
//! logically equal payloads always hash the same. Tags are derived fresh on
//! every call; nothing is cached.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// Opaque validator tag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of already-encoded bytes
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Fingerprint of `payload` (canonical JSON)
    pub fn of<T: Serialize>(payload: &T) -> serde_json::Result<Self> {
        let body = canonical_json(payload)?;
        Ok(Self::of_bytes(&body))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Quoted form used in `ETag`
    pub fn header_value(&self) -> String {
        format!("\"{}\"", self.0)
    }

    /// True if an `If-None-Match` value matches this tag.
    ///
    /// Accepts `*`, a comma separated list, quoted or bare tags, and weak
    /// (`W/`) validators.
    pub fn matches(&self, if_none_match: &str) -> bool {
        if_none_match.split(',').map(str::trim).any(|candidate| {
            if candidate == "*" {
                return true;
            }
            let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
            let candidate = candidate
                .strip_prefix('"')
                .and_then(|c| c.strip_suffix('"'))
                .unwrap_or(candidate);
            candidate == self.0
        })
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical encoding: compact JSON with object keys sorted
pub fn canonical_json<T: Serialize>(payload: &T) -> serde_json::Result<Vec<u8>> {
    let value = serde_json::to_value(payload)?;
    serde_json::to_vec(&value)
}

/// Outcome of a conditional read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conditional {
    /// Caller already holds this version
    NotModified { tag: Fingerprint },
    /// New or changed content
    Fresh { tag: Fingerprint, body: Vec<u8> },
}

impl Conditional {
    /// Encode `payload`, fingerprint it and compare against the caller's validator
    pub fn evaluate<T: Serialize>(
        payload: &T,
        if_none_match: Option<&str>,
    ) -> serde_json::Result<Self> {
        let body = canonical_json(payload)?;
        let tag = Fingerprint::of_bytes(&body);

        match if_none_match {
            Some(validator) if tag.matches(validator) => Ok(Conditional::NotModified { tag }),
            _ => Ok(Conditional::Fresh { tag, body }),
        }
    }

    pub fn tag(&self) -> &Fingerprint {
        match self {
            Conditional::NotModified { tag } | Conditional::Fresh { tag, .. } => tag,
        }
    }
}
