//! Node configuration.

use crate::error::{Error, Result};
use crate::types::{Member, Tags, DEFAULT_BIND_PORT, MAX_NODE_NAME_LEN};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Lets the host extend the reconnect window for specific failed members
/// (e.g. keep stateful nodes around longer before reaping).
pub trait ReconnectTimeoutOverride: Send + Sync {
    /// Return `None` to use the configured `reconnect_timeout`.
    fn reconnect_timeout(&self, member: &Member) -> Option<Duration>;
}

/// Configuration for a node. `Config::default()` is tuned for a LAN.
#[derive(Clone)]
pub struct Config {
    /// Unique name of this node in the cluster. Defaults to the hostname.
    pub node_name: String,

    /// Tags gossiped with our alive message. Mutable at runtime via
    /// `Cluster::set_tags`.
    pub tags: Tags,

    /// Address and port to bind both the UDP and TCP sockets to.
    pub bind_addr: IpAddr,
    pub bind_port: u16,

    /// Address and port advertised to peers, when different from the bind
    /// endpoint (NAT, containers). `None` advertises the bind endpoint.
    pub advertise_addr: Option<IpAddr>,
    pub advertise_port: Option<u16>,

    // --- SWIM failure detection -------------------------------------------
    /// Full probe round cadence.
    pub probe_interval: Duration,
    /// How long to wait for a direct UDP ack before going indirect.
    pub probe_timeout: Duration,
    /// Peers asked to ping a node on our behalf when the direct probe fails.
    pub indirect_checks: usize,
    /// Multiplier over `probe_interval * log10(n+1)` for the initial
    /// suspicion timeout.
    pub suspicion_mult: u32,
    /// Cap on the suspicion timeout, as a multiple of the initial timeout.
    pub suspicion_max_timeout_mult: u32,

    // --- Gossip -----------------------------------------------------------
    pub gossip_interval: Duration,
    /// Random peers addressed per gossip tick.
    pub gossip_nodes: usize,
    /// Retransmit limit multiplier over `log10(n+1)`.
    pub retransmit_mult: u32,
    /// Anti-entropy full state exchange cadence. Scaled up with cluster size.
    pub push_pull_interval: Duration,
    /// TCP dial/read/write deadline for push/pull and fallback pings.
    pub stream_timeout: Duration,

    // --- Cluster layer ----------------------------------------------------
    /// How long a failed member is kept (and retried) before being reaped.
    pub reconnect_timeout: Duration,
    /// Per-member override hook for `reconnect_timeout`.
    pub reconnect_timeout_override: Option<Arc<dyn ReconnectTimeoutOverride>>,
    /// Cadence of reconnection attempts to failed members.
    pub reconnect_interval: Duration,
    /// How long a left member's tombstone is kept.
    pub tombstone_timeout: Duration,
    /// Member-map sweep cadence.
    pub reap_interval: Duration,
    /// Member-event coalescing window. Zero disables coalescing.
    pub coalesce_period: Duration,
    /// Quiet time that flushes a coalescing window early.
    pub quiescent_period: Duration,
    /// How long `leave()` waits for the intent to drain from the broadcast
    /// queue.
    pub broadcast_timeout: Duration,

    // --- Events and queries -----------------------------------------------
    /// Ring size (in Lamport ticks) of the user event de-dup buffer.
    pub event_buffer_size: usize,
    /// Ring size of the query de-dup buffer.
    pub query_buffer_size: usize,
    /// Multiplier for the default query deadline:
    /// `gossip_interval * query_timeout_mult * log10(n+1)`.
    pub query_timeout_mult: u32,
    pub query_size_limit: usize,
    pub query_response_size_limit: usize,
    pub user_event_size_limit: usize,
    /// Capacity of the user-facing event channel.
    pub event_channel_size: usize,

    // --- Persistence ------------------------------------------------------
    /// Append-only snapshot log enabling auto-rejoin. `None` disables.
    pub snapshot_path: Option<PathBuf>,
    /// Compaction triggers at `snapshot_bytes_per_node * members * 2`,
    /// floored at `snapshot_min_compact_size`.
    pub snapshot_bytes_per_node: usize,
    pub snapshot_min_compact_size: usize,

    // --- Security ---------------------------------------------------------
    /// Keyring file holding a base64 JSON key list; first key is primary.
    pub keyring_file: Option<PathBuf>,
    /// Single symmetric key (16/24/32 bytes) used when no keyring file is
    /// configured.
    pub encryption_key: Option<Vec<u8>>,
    /// Cluster label prefixed to every packet for multi-tenant segregation.
    pub label: String,
    /// Alive messages claiming an address outside these CIDRs are dropped.
    /// Empty allows everything.
    pub allowed_cidrs: Vec<String>,

    // --- Coordinates ------------------------------------------------------
    pub disable_coordinates: bool,
}

impl Default for Config {
    fn default() -> Self {
        let node_name = hostname();
        Self {
            node_name,
            tags: Tags::new(),
            bind_addr: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            bind_port: DEFAULT_BIND_PORT,
            advertise_addr: None,
            advertise_port: None,

            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            indirect_checks: 3,
            suspicion_mult: 4,
            suspicion_max_timeout_mult: 6,

            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            retransmit_mult: 4,
            push_pull_interval: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(10),

            reconnect_timeout: Duration::from_secs(24 * 60 * 60),
            reconnect_timeout_override: None,
            reconnect_interval: Duration::from_secs(30),
            tombstone_timeout: Duration::from_secs(24 * 60 * 60),
            reap_interval: Duration::from_secs(15),
            coalesce_period: Duration::ZERO,
            quiescent_period: Duration::from_millis(100),
            broadcast_timeout: Duration::from_secs(5),

            event_buffer_size: 512,
            query_buffer_size: 512,
            query_timeout_mult: 16,
            query_size_limit: 1024,
            query_response_size_limit: 1024,
            user_event_size_limit: 512,
            event_channel_size: 64,

            snapshot_path: None,
            snapshot_bytes_per_node: 128,
            snapshot_min_compact_size: 128 * 1024,

            keyring_file: None,
            encryption_key: None,
            label: String::new(),
            allowed_cidrs: Vec::new(),

            disable_coordinates: false,
        }
    }
}

impl Config {
    /// Convenience constructor for a named node on loopback, used heavily in
    /// tests.
    pub fn local(node_name: &str, port: u16) -> Self {
        Self {
            node_name: node_name.to_string(),
            bind_addr: IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            bind_port: port,
            ..Self::default()
        }
    }

    /// Whether member-event coalescing is on.
    pub fn coalesce_enabled(&self) -> bool {
        !self.coalesce_period.is_zero()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::Config("node_name must not be empty".to_string()));
        }
        if self.node_name.len() > MAX_NODE_NAME_LEN {
            return Err(Error::Config(format!(
                "node_name longer than {} bytes",
                MAX_NODE_NAME_LEN
            )));
        }
        if self.node_name.contains(['\n', ' ']) {
            // Names are written space-delimited into the snapshot log.
            return Err(Error::Config(
                "node_name must not contain spaces or newlines".to_string(),
            ));
        }
        if let Some(key) = &self.encryption_key {
            if !matches!(key.len(), 16 | 24 | 32) {
                return Err(Error::InvalidKey(key.len()));
            }
        }
        if self.probe_interval.is_zero() || self.gossip_interval.is_zero() {
            return Err(Error::Config(
                "probe_interval and gossip_interval must be non-zero".to_string(),
            ));
        }
        if self.indirect_checks == 0 {
            return Err(Error::Config(
                "indirect_checks must be at least 1".to_string(),
            ));
        }
        if self.event_buffer_size == 0 || self.query_buffer_size == 0 {
            return Err(Error::Config(
                "event_buffer_size and query_buffer_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "starling-node".to_string())
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("node_name", &self.node_name)
            .field("bind_addr", &self.bind_addr)
            .field("bind_port", &self.bind_port)
            .field("label", &self.label)
            .field("encrypted", &self.encryption_key.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_key_length() {
        let cfg = Config {
            encryption_key: Some(vec![0u8; 15]),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidKey(15))));
    }

    #[test]
    fn test_rejects_name_with_space() {
        let cfg = Config {
            node_name: "bad name".to_string(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
