//! Core identifiers shared by the pool, sessions and the heap registry.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Network address of a pool member server.
///
/// Endpoints order by a stable SHA-256 derived key, then by address, so pool
/// iteration is the same on every process that sees the same topology.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Endpoint {
    address: String,
    order_key: u64,
}

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        let digest = Sha256::digest(address.as_bytes());
        let mut key = [0u8; 8];
        key.copy_from_slice(&digest[..8]);
        Self {
            address,
            order_key: u64::from_be_bytes(key),
        }
    }

    /// The address as given (`host:port`).
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Short hex fingerprint of the ordering key, for logs and diagnostics.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.order_key.to_be_bytes()[..4])
    }
}

impl From<String> for Endpoint {
    fn from(address: String) -> Self {
        Endpoint::new(address)
    }
}

impl From<&str> for Endpoint {
    fn from(address: &str) -> Self {
        Endpoint::new(address)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.address
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Endpoint {}

impl std::hash::Hash for Endpoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key
            .cmp(&other.order_key)
            .then_with(|| self.address.cmp(&other.address))
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.address)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Unique identifier for a session within one process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a heap subscription.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position in a heap's update history.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Sequence(self.0 - 1))
        } else {
            None
        }
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_endpoint_order_is_stable() {
        let a: BTreeSet<Endpoint> = ["a:1", "b:2", "c:3", "d:4"]
            .iter()
            .map(|s| Endpoint::new(*s))
            .collect();
        let b: BTreeSet<Endpoint> = ["d:4", "c:3", "b:2", "a:1"]
            .iter()
            .map(|s| Endpoint::new(*s))
            .collect();

        let a: Vec<_> = a.into_iter().collect();
        let b: Vec<_> = b.into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_endpoint_equality_ignores_construction_path() {
        let a = Endpoint::new("host:9003");
        let b: Endpoint = String::from("host:9003").into();
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a.fingerprint().len(), 8);
    }

    #[test]
    fn test_endpoint_serde_as_string() {
        let endpoint = Endpoint::new("host:9003");
        let json = serde_json::to_string(&endpoint).unwrap();
        assert_eq!(json, "\"host:9003\"");
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, endpoint);
    }

    #[test]
    fn test_sequence_navigation() {
        let seq = Sequence(5);
        assert_eq!(seq.next(), Sequence(6));
        assert_eq!(seq.prev(), Some(Sequence(4)));
        assert_eq!(Sequence(0).prev(), None);
    }
}
