//! Configuration for peers, relay clients and relay servers.
//!
//! The typed structs ([`PeerConfig`], [`RelayClientConfig`],
//! [`RelayServerConfig`]) are what the runtime consumes. [`Settings`] is the
//! on-disk TOML form with durations in milliseconds; it converts into the
//! typed structs and is validated on the way.

use crate::error::{RelayError, RelayResult};
use crate::peer::{MAX_RELAYS, PeerId};
use crate::relay::batch_wait;
use crate::strategy::{BufferLimits, RelayKind, RelayStrategy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Relay client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RelayClientConfig {
    /// Target relay-set size; `None` uses the strategy's default
    pub max_relay_count: Option<usize>,
    /// Timeout of one registration attempt
    pub setup_timeout: Duration,
    /// Timeout of keep-alive, peer-map and outbound relay round trips
    pub request_timeout: Duration,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            max_relay_count: None,
            setup_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(3),
        }
    }
}

impl RelayClientConfig {
    /// Set the target relay-set size.
    #[must_use]
    pub fn with_max_relay_count(mut self, count: usize) -> Self {
        self.max_relay_count = Some(count);
        self
    }

    /// Target relay-set size for `strategy`
    #[must_use]
    pub fn target_relay_count(&self, strategy: &RelayStrategy) -> usize {
        self.max_relay_count
            .unwrap_or_else(|| strategy.default_max_relay_count())
    }

    /// Validate configuration
    ///
    /// # Errors
    /// Returns `RelayError::InvalidConfig` if the relay count is zero or above
    /// what an address record can carry, or a timeout is zero.
    pub fn validate(&self) -> RelayResult<()> {
        if let Some(count) = self.max_relay_count {
            if count == 0 || count > MAX_RELAYS {
                return Err(RelayError::InvalidConfig(format!(
                    "max_relay_count must be between 1 and {MAX_RELAYS}, got {count}"
                )));
            }
        }
        if self.setup_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(RelayError::InvalidConfig(
                "relay client timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Relay server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RelayServerConfig {
    /// Relay kind served, with the buffer limits for buffered forwarding
    pub strategy: RelayStrategy,
    /// Maximum number of concurrent registrations
    pub max_clients: usize,
    /// Registrations idle longer than this are removed
    pub client_timeout: Duration,
    /// Cleanup interval
    pub cleanup_interval: Duration,
    /// Timeout for delivering a forwarded message
    pub forward_timeout: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            strategy: RelayStrategy::Unbuffered,
            max_clients: 1_000,
            client_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30),
            forward_timeout: Duration::from_secs(3),
        }
    }
}

impl RelayServerConfig {
    /// Server for `strategy` with default limits.
    #[must_use]
    pub fn for_strategy(strategy: RelayStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// Longest a forwarded message waits for the registrant's answer: one
    /// round trip, plus the buffer hold for buffered relaying. Never more than
    /// the client timeout plus one round trip.
    #[must_use]
    pub fn max_forward_wait(&self) -> Duration {
        match self.strategy {
            RelayStrategy::Unbuffered => self.forward_timeout,
            RelayStrategy::Buffered(limits) => batch_wait(limits, self.forward_timeout)
                .min(self.client_timeout.saturating_add(self.forward_timeout)),
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    /// Returns `RelayError::InvalidConfig` on zero capacity, zero durations
    /// or invalid buffer limits.
    pub fn validate(&self) -> RelayResult<()> {
        self.strategy.validate()?;
        if self.max_clients == 0 {
            return Err(RelayError::InvalidConfig(
                "max_clients must be positive".to_string(),
            ));
        }
        if self.client_timeout.is_zero()
            || self.cleanup_interval.is_zero()
            || self.forward_timeout.is_zero()
        {
            return Err(RelayError::InvalidConfig(
                "relay server durations must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Peer configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    /// Fixed identity; random if `None`
    pub id: Option<PeerId>,
    /// Whether inbound TCP is blocked
    pub firewalled_tcp: bool,
    /// Whether inbound UDP is blocked
    pub firewalled_udp: bool,
    /// Maintenance cadence: relay reconciliation, peer-map push, overflow promotion
    pub peer_map_update_interval: Duration,
    /// Timeout for direct requests
    pub request_timeout: Duration,
    /// Timeout for each relay hop attempt, covering relay-side buffering
    pub relay_timeout: Duration,
    /// Number of neighbors returned for a neighbor query
    pub neighbor_reply_size: usize,
    /// Capacity of the overflow bag of the neighbor table
    pub overflow_capacity: usize,
    /// Serve as a relay for unreachable peers
    pub relay_server: Option<RelayServerConfig>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            id: None,
            firewalled_tcp: false,
            firewalled_udp: false,
            peer_map_update_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(2),
            relay_timeout: Duration::from_secs(10),
            neighbor_reply_size: 20,
            overflow_capacity: crate::neighbor::DEFAULT_OVERFLOW_CAPACITY,
            relay_server: None,
        }
    }
}

impl PeerConfig {
    /// Configuration of a peer that cannot accept inbound connections.
    #[must_use]
    pub fn unreachable() -> Self {
        Self {
            firewalled_tcp: true,
            firewalled_udp: true,
            ..Self::default()
        }
    }

    /// Configuration of a reachable peer that relays for others.
    ///
    /// The relay timeout is raised above what `server` may hold a forwarded
    /// message, so this peer outwaits relays configured like itself.
    #[must_use]
    pub fn relay(server: RelayServerConfig) -> Self {
        let defaults = Self::default();
        let relay_timeout = defaults
            .relay_timeout
            .max(server.max_forward_wait().saturating_add(server.forward_timeout));
        Self {
            relay_timeout,
            relay_server: Some(server),
            ..defaults
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    /// Returns `RelayError::InvalidConfig` on zero durations or sizes, an
    /// invalid relay server section, or a relay timeout that does not outlast
    /// the relay server's longest forward wait.
    pub fn validate(&self) -> RelayResult<()> {
        if self.peer_map_update_interval.is_zero()
            || self.request_timeout.is_zero()
            || self.relay_timeout.is_zero()
        {
            return Err(RelayError::InvalidConfig(
                "peer durations must be positive".to_string(),
            ));
        }
        if self.neighbor_reply_size == 0 {
            return Err(RelayError::InvalidConfig(
                "neighbor_reply_size must be positive".to_string(),
            ));
        }
        if let Some(server) = &self.relay_server {
            server.validate()?;
            let hold = server.max_forward_wait();
            if self.relay_timeout <= hold {
                return Err(RelayError::InvalidConfig(format!(
                    "relay_timeout {:?} must exceed the {:?} a forwarded message may be held",
                    self.relay_timeout, hold
                )));
            }
        }
        Ok(())
    }
}

/// On-disk settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    /// Peer section
    #[serde(default)]
    pub peer: PeerSettings,
    /// Relay client section
    #[serde(default)]
    pub relay: RelaySettings,
    /// Relay server section
    #[serde(default)]
    pub server: ServerSettings,
}

/// Peer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerSettings {
    /// Seed the peer id is derived from; random if absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_seed: Option<String>,
    /// Whether the peer is behind a firewall or NAT
    #[serde(default)]
    pub firewalled: bool,
    /// Maintenance cadence in milliseconds
    #[serde(default = "default_peer_map_update_interval_ms")]
    pub peer_map_update_interval_ms: u64,
    /// Direct request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Relay hop timeout in milliseconds
    #[serde(default = "default_relay_timeout_ms")]
    pub relay_timeout_ms: u64,
    /// Neighbors returned per query
    #[serde(default = "default_neighbor_reply_size")]
    pub neighbor_reply_size: usize,
}

/// Relay client settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySettings {
    /// Relay kind
    #[serde(default = "default_kind")]
    pub kind: RelayKind,
    /// Target relay-set size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_relay_count: Option<usize>,
    /// Buffer limits for buffered relaying
    #[serde(default)]
    pub buffer: BufferSettings,
    /// Registration timeout in milliseconds
    #[serde(default = "default_setup_timeout_ms")]
    pub setup_timeout_ms: u64,
    /// Relay round-trip timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Relay server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSettings {
    /// Serve as a relay
    #[serde(default)]
    pub enabled: bool,
    /// Relay kind served
    #[serde(default = "default_kind")]
    pub kind: RelayKind,
    /// Buffer limits for buffered forwarding
    #[serde(default)]
    pub buffer: BufferSettings,
    /// Maximum concurrent registrations
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Idle registration timeout in milliseconds
    #[serde(default = "default_client_timeout_ms")]
    pub client_timeout_ms: u64,
    /// Cleanup interval in milliseconds
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Forwarding timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub forward_timeout_ms: u64,
}

/// Buffer limits; absent values are unlimited
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BufferSettings {
    /// Maximum age in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age_ms: Option<u64>,
    /// Maximum message count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_count: Option<usize>,
    /// Maximum byte total
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<usize>,
}

fn default_peer_map_update_interval_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    2_000
}

fn default_relay_timeout_ms() -> u64 {
    10_000
}

fn default_setup_timeout_ms() -> u64 {
    5_000
}

fn default_neighbor_reply_size() -> usize {
    20
}

fn default_kind() -> RelayKind {
    RelayKind::Unbuffered
}

fn default_max_clients() -> usize {
    1_000
}

fn default_client_timeout_ms() -> u64 {
    60_000
}

fn default_cleanup_interval_ms() -> u64 {
    30_000
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            id_seed: None,
            firewalled: false,
            peer_map_update_interval_ms: default_peer_map_update_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            relay_timeout_ms: default_relay_timeout_ms(),
            neighbor_reply_size: default_neighbor_reply_size(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            max_relay_count: None,
            buffer: BufferSettings::default(),
            setup_timeout_ms: default_setup_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: default_kind(),
            buffer: BufferSettings::default(),
            max_clients: default_max_clients(),
            client_timeout_ms: default_client_timeout_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            forward_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl BufferSettings {
    fn limits(&self) -> BufferLimits {
        BufferLimits::new(
            self.max_age_ms
                .map_or(Duration::MAX, Duration::from_millis),
            self.max_count.unwrap_or(usize::MAX),
            self.max_bytes.unwrap_or(usize::MAX),
        )
    }

    fn strategy(&self, kind: RelayKind) -> RelayStrategy {
        match kind {
            RelayKind::Unbuffered => RelayStrategy::Unbuffered,
            RelayKind::Buffered => RelayStrategy::Buffered(self.limits()),
        }
    }
}

impl Settings {
    /// Parse settings from TOML text.
    ///
    /// # Errors
    /// Returns `RelayError::InvalidConfig` if the text is not valid TOML or
    /// does not match the settings layout.
    pub fn from_toml_str(contents: &str) -> RelayResult<Self> {
        toml::from_str(contents).map_err(|e| RelayError::InvalidConfig(e.to_string()))
    }

    /// Load settings from a file
    ///
    /// # Errors
    /// Returns `RelayError::InvalidConfig` if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> RelayResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| RelayError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    /// Save settings to a file
    ///
    /// # Errors
    /// Returns `RelayError::InvalidConfig` if serialization or writing fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> RelayResult<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| RelayError::InvalidConfig(e.to_string()))?;
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RelayError::InvalidConfig(format!("{}: {e}", parent.display())))?;
        }
        fs::write(path, contents)
            .map_err(|e| RelayError::InvalidConfig(format!("{}: {e}", path.display())))
    }

    /// Relay strategy used by the relay client
    #[must_use]
    pub fn relay_strategy(&self) -> RelayStrategy {
        self.relay.buffer.strategy(self.relay.kind)
    }

    /// Typed relay client configuration
    ///
    /// # Errors
    /// Returns `RelayError::InvalidConfig` if the result does not validate.
    pub fn client_config(&self) -> RelayResult<RelayClientConfig> {
        let config = RelayClientConfig {
            max_relay_count: self.relay.max_relay_count,
            setup_timeout: Duration::from_millis(self.relay.setup_timeout_ms),
            request_timeout: Duration::from_millis(self.relay.request_timeout_ms),
        };
        self.relay_strategy().validate()?;
        config.validate()?;
        Ok(config)
    }

    /// Typed peer configuration
    ///
    /// # Errors
    /// Returns `RelayError::InvalidConfig` if the result does not validate.
    pub fn peer_config(&self) -> RelayResult<PeerConfig> {
        let relay_server = self.server.enabled.then(|| RelayServerConfig {
            strategy: self.server.buffer.strategy(self.server.kind),
            max_clients: self.server.max_clients,
            client_timeout: Duration::from_millis(self.server.client_timeout_ms),
            cleanup_interval: Duration::from_millis(self.server.cleanup_interval_ms),
            forward_timeout: Duration::from_millis(self.server.forward_timeout_ms),
        });

        let config = PeerConfig {
            id: self
                .peer
                .id_seed
                .as_deref()
                .map(|seed| PeerId::from_data(seed.as_bytes())),
            firewalled_tcp: self.peer.firewalled,
            firewalled_udp: self.peer.firewalled,
            peer_map_update_interval: Duration::from_millis(self.peer.peer_map_update_interval_ms),
            request_timeout: Duration::from_millis(self.peer.request_timeout_ms),
            relay_timeout: Duration::from_millis(self.peer.relay_timeout_ms),
            neighbor_reply_size: self.peer.neighbor_reply_size,
            relay_server,
            ..PeerConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_validate() {
        assert!(PeerConfig::default().validate().is_ok());
        assert!(RelayClientConfig::default().validate().is_ok());
        assert!(RelayServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_target_relay_count() {
        let config = RelayClientConfig::default();
        assert_eq!(config.target_relay_count(&RelayStrategy::Unbuffered), 5);
        assert_eq!(
            config.target_relay_count(&RelayStrategy::Buffered(BufferLimits::default())),
            2
        );
        assert_eq!(
            config
                .with_max_relay_count(3)
                .target_relay_count(&RelayStrategy::Unbuffered),
            3
        );
    }

    #[test]
    fn test_client_config_validation() {
        let zero = RelayClientConfig::default().with_max_relay_count(0);
        assert!(matches!(zero.validate(), Err(RelayError::InvalidConfig(_))));

        let too_many = RelayClientConfig::default().with_max_relay_count(MAX_RELAYS + 1);
        assert!(too_many.validate().is_err());
    }

    #[test]
    fn test_server_config_validation() {
        let mut config = RelayServerConfig::default();
        config.max_clients = 0;
        assert!(config.validate().is_err());

        let config = RelayServerConfig::for_strategy(RelayStrategy::Buffered(
            BufferLimits::new(Duration::ZERO, 1, 1),
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_forward_wait() {
        let unbuffered = RelayServerConfig::default();
        assert_eq!(unbuffered.max_forward_wait(), unbuffered.forward_timeout);

        let aged = RelayServerConfig::for_strategy(RelayStrategy::Buffered(BufferLimits::age_only(
            Duration::from_secs(10),
        )));
        assert_eq!(aged.max_forward_wait(), Duration::from_secs(13));

        let unbounded = RelayServerConfig {
            client_timeout: Duration::from_secs(20),
            ..RelayServerConfig::for_strategy(RelayStrategy::Buffered(BufferLimits::count_only(8)))
        };
        assert_eq!(unbounded.max_forward_wait(), Duration::from_secs(23));
    }

    #[test]
    fn test_relay_timeout_must_outlast_forward_wait() {
        let server = RelayServerConfig::for_strategy(RelayStrategy::Buffered(BufferLimits::age_only(
            Duration::from_secs(10),
        )));

        let impatient = PeerConfig {
            relay_timeout: Duration::from_secs(5),
            relay_server: Some(server.clone()),
            ..PeerConfig::default()
        };
        assert!(matches!(impatient.validate(), Err(RelayError::InvalidConfig(_))));

        let derived = PeerConfig::relay(server.clone());
        assert!(derived.relay_timeout > server.max_forward_wait());
        assert!(derived.validate().is_ok());

        let defaults = PeerConfig::relay(RelayServerConfig::for_strategy(RelayStrategy::Buffered(
            BufferLimits::default(),
        )));
        assert_eq!(defaults.relay_timeout, PeerConfig::default().relay_timeout);
    }

    #[test]
    fn test_settings_reject_short_relay_timeout() {
        let settings = Settings::from_toml_str(
            r#"
            [server]
            enabled = true
            kind = "buffered"

            [server.buffer]
            max_age_ms = 30000
            "#,
        )
        .unwrap();
        assert!(matches!(settings.peer_config(), Err(RelayError::InvalidConfig(_))));

        let mut patient = settings.clone();
        patient.peer.relay_timeout_ms = 40_000;
        assert_eq!(
            patient.peer_config().unwrap().relay_timeout,
            Duration::from_secs(40)
        );
    }

    #[test]
    fn test_settings_defaults_from_empty_toml() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings, Settings::default());

        let peer = settings.peer_config().unwrap();
        assert_eq!(peer.peer_map_update_interval, Duration::from_secs(5));
        assert!(peer.relay_server.is_none());
        assert_eq!(settings.relay_strategy(), RelayStrategy::Unbuffered);
    }

    #[test]
    fn test_settings_buffered_relay() {
        let settings = Settings::from_toml_str(
            r#"
            [peer]
            firewalled = true
            id_seed = "node-7"

            [relay]
            kind = "buffered"
            max_relay_count = 2

            [relay.buffer]
            max_age_ms = 2000
            "#,
        )
        .unwrap();

        assert_eq!(
            settings.relay_strategy(),
            RelayStrategy::Buffered(BufferLimits::age_only(Duration::from_millis(2000)))
        );
        let client = settings.client_config().unwrap();
        assert_eq!(client.max_relay_count, Some(2));

        let peer = settings.peer_config().unwrap();
        assert!(peer.firewalled_tcp && peer.firewalled_udp);
        assert_eq!(peer.id, Some(PeerId::from_data(b"node-7")));
    }

    #[test]
    fn test_settings_server_section() {
        let settings = Settings::from_toml_str(
            r#"
            [server]
            enabled = true
            kind = "buffered"
            max_clients = 3

            [server.buffer]
            max_count = 1
            "#,
        )
        .unwrap();

        let server = settings.peer_config().unwrap().relay_server.unwrap();
        assert_eq!(server.max_clients, 3);
        assert_eq!(server.strategy.limits().max_count, 1);
        assert_eq!(server.strategy.kind(), RelayKind::Buffered);
    }

    #[test]
    fn test_settings_invalid() {
        assert!(matches!(
            Settings::from_toml_str("[relay]\nkind = \"carrier-pigeon\""),
            Err(RelayError::InvalidConfig(_))
        ));

        let zero_interval = Settings::from_toml_str("[peer]\npeer_map_update_interval_ms = 0")
            .unwrap();
        assert!(zero_interval.peer_config().is_err());
    }

    #[test]
    fn test_settings_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/tether.toml");

        let mut settings = Settings::default();
        settings.relay.kind = RelayKind::Buffered;
        settings.relay.buffer.max_count = Some(10);
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_settings_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Settings::load(dir.path().join("absent.toml")),
            Err(RelayError::InvalidConfig(_))
        ));
    }
}
