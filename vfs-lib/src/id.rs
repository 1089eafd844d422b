use crate::{VfsError, VfsResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable, content-derived identifier for a byte sequence or a
/// directory DAG node. The wire form is an alphanumeric multibase string;
/// validation here is purely syntactic, the Content Store is the source
/// of truth for what an id actually references.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn decode(s: &str) -> VfsResult<Self> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(VfsError::InvalidParam(format!("invalid content id: {}", s)))
        }
    }

    pub fn is_valid(s: &str) -> bool {
        s.len() >= 46 && s.len() <= 128 && s.chars().all(|c| c.is_ascii_alphanumeric())
    }

    /// Wrap an id string that was validated when it was first stored.
    pub fn from_trusted(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a name-record publisher. A string decodes as a peer key
/// when it looks like an encoded public key hash; anything with a dot in
/// it is treated as a DNS-style domain by the resolver instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerKey(String);

impl PeerKey {
    pub fn decode_name(s: &str) -> Option<Self> {
        if s.len() >= 30 && s.chars().all(|c| c.is_ascii_alphanumeric()) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    /// Build a key from an already-trusted identity string (the local
    /// host identity reported by the Name Service).
    pub fn from_trusted(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_id_validation() {
        let good = "Qm".to_string() + &"a".repeat(44);
        assert!(ContentId::is_valid(&good));
        assert!(ContentId::decode(&good).is_ok());

        assert!(!ContentId::is_valid("Qmshort"));
        assert!(!ContentId::is_valid(&("Qm".to_string() + &"a".repeat(44) + "/x")));
        assert!(ContentId::decode("").is_err());
    }

    #[test]
    fn test_peer_key_decode() {
        assert!(PeerKey::decode_name(&"k".repeat(52)).is_some());
        assert!(PeerKey::decode_name("example.org").is_none());
        assert!(PeerKey::decode_name("short").is_none());
    }
}
