//! Pool configuration.

use crate::wire::PROTOCOL_VERSION;
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for a [`SessionPool`](super::SessionPool).
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Host specification handed to the endpoint resolver, e.g.
    /// `"10.0.0.1:9003,10.0.0.2:9003"`.
    /// Default: empty
    pub hosts: String,

    /// Transport connect timeout.
    /// Default: 5s
    pub connect_timeout: Duration,

    /// How long to wait for the remote's handshake reply.
    /// Default: 5s
    pub handshake_timeout: Duration,

    /// Base interval of the reconnect backoff. Delays converge towards ten
    /// times this value.
    /// Default: 1s
    pub reconnect_base: Duration,

    /// Threads running connect and handshake attempts, shared by all endpoints.
    /// Default: 4
    pub connect_workers: usize,

    /// How often endpoints are re-resolved after `start()`.
    /// Default: 30s
    pub reconcile_interval: Duration,

    /// Protocol version offered in `Hello`.
    pub protocol_version: u32,

    /// Identity metadata sent in `Hello`.
    pub identity: BTreeMap<String, String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            hosts: String::new(),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            reconnect_base: Duration::from_secs(1),
            connect_workers: 4,
            reconcile_interval: Duration::from_secs(30),
            protocol_version: PROTOCOL_VERSION,
            identity: BTreeMap::new(),
        }
    }
}

impl PoolConfig {
    /// Defaults overlaid with `HEAPLINK_*` environment variables.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `HEAPLINK_HOSTS` | `hosts` |
    /// | `HEAPLINK_CONNECT_TIMEOUT_MS` | `connect_timeout` |
    /// | `HEAPLINK_HANDSHAKE_TIMEOUT_MS` | `handshake_timeout` |
    /// | `HEAPLINK_RECONNECT_BASE_MS` | `reconnect_base` |
    /// | `HEAPLINK_CONNECT_WORKERS` | `connect_workers` |
    /// | `HEAPLINK_RECONCILE_INTERVAL_MS` | `reconcile_interval` |
    /// | `HEAPLINK_IDENTITY` | `identity`, as `key=value,key=value` |
    ///
    /// Values that fail to parse keep the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let millis = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        if let Some(v) = lookup("HEAPLINK_HOSTS") {
            config.hosts = v;
        }
        config.connect_timeout = millis("HEAPLINK_CONNECT_TIMEOUT_MS", config.connect_timeout);
        config.handshake_timeout = millis("HEAPLINK_HANDSHAKE_TIMEOUT_MS", config.handshake_timeout);
        config.reconnect_base = millis("HEAPLINK_RECONNECT_BASE_MS", config.reconnect_base);
        config.reconcile_interval =
            millis("HEAPLINK_RECONCILE_INTERVAL_MS", config.reconcile_interval);
        if let Some(v) = lookup("HEAPLINK_CONNECT_WORKERS") {
            config.connect_workers = v
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .unwrap_or(config.connect_workers);
        }
        if let Some(v) = lookup("HEAPLINK_IDENTITY") {
            config.identity = v
                .split(',')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .collect();
        }

        config
    }
}
