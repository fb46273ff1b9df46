//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file only needs the keys it changes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Upper bound for every millisecond timing setting (one hour).
pub const MAX_WAIT_MS: u64 = 3_600_000;

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Per-connection pump settings.
    pub connection: ConnectionSettings,
    /// Hub behaviour.
    pub hub: HubSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.connection.mailbox_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.mailboxCapacity must be greater than 0".into(),
            ));
        }
        if !(1..=MAX_WAIT_MS).contains(&self.connection.write_wait_ms) {
            return Err(SettingsError::InvalidValue(format!(
                "connection.writeWaitMs must be between 1 and {MAX_WAIT_MS}, got {}",
                self.connection.write_wait_ms
            )));
        }
        if !(10..=MAX_WAIT_MS).contains(&self.connection.pong_wait_ms) {
            return Err(SettingsError::InvalidValue(format!(
                "connection.pongWaitMs must be between 10 and {MAX_WAIT_MS}, got {}",
                self.connection.pong_wait_ms
            )));
        }
        if self.hub.snapshot_interval_ms > MAX_WAIT_MS {
            return Err(SettingsError::InvalidValue(format!(
                "hub.snapshotIntervalMs must be at most {MAX_WAIT_MS}, got {}",
                self.hub.snapshot_interval_ms
            )));
        }
        if self.hub.command_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "hub.commandCapacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Upgrades beyond this many live connections are refused.
    pub max_connections: usize,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 1024,
            max_message_size: 64 * 1024,
        }
    }
}

/// Per-connection settings shared by the inbound and outbound pumps.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Outbound mailbox capacity; a full mailbox gets its connection evicted.
    pub mailbox_capacity: usize,
    /// Deadline for writing one frame, in milliseconds.
    pub write_wait_ms: u64,
    /// Read-liveness window, in milliseconds. Refreshed by every pong.
    pub pong_wait_ms: u64,
}

impl ConnectionSettings {
    /// Deadline for writing one frame.
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    /// Read-liveness window.
    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    /// Keep-alive period: nine tenths of the liveness window, so a ping
    /// always lands before the peer's read deadline would expire.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            write_wait_ms: 10_000,
            pong_wait_ms: 60_000,
        }
    }
}

/// How the inbound pump treats text frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InboundPolicy {
    /// Relay every text payload unchanged; positions are not tracked.
    RelayAll,
    /// Track positions and relay them unchanged; relay anything else too.
    #[default]
    PositionBroadcast,
    /// Track positions and acknowledge them to the sender only; relay
    /// anything else.
    PositionAck,
}

impl InboundPolicy {
    /// The kebab-case name used in settings and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RelayAll => "relay-all",
            Self::PositionBroadcast => "position-broadcast",
            Self::PositionAck => "position-ack",
        }
    }

    /// Whether text frames are classified as position records.
    pub fn tracks_positions(self) -> bool {
        !matches!(self, Self::RelayAll)
    }
}

impl fmt::Display for InboundPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InboundPolicy {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "relay-all" => Ok(Self::RelayAll),
            "position-broadcast" => Ok(Self::PositionBroadcast),
            "position-ack" => Ok(Self::PositionAck),
            other => Err(SettingsError::InvalidValue(format!(
                "unknown inbound policy '{other}'"
            ))),
        }
    }
}

/// Whether a relayed message is also delivered back to its sender.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderPolicy {
    /// Deliver to every other live connection.
    #[default]
    Exclude,
    /// Deliver to every live connection, the sender included.
    Include,
}

impl SenderPolicy {
    /// The lowercase name used in settings and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exclude => "exclude",
            Self::Include => "include",
        }
    }
}

impl fmt::Display for SenderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SenderPolicy {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "exclude" => Ok(Self::Exclude),
            "include" => Ok(Self::Include),
            other => Err(SettingsError::InvalidValue(format!(
                "unknown sender policy '{other}'"
            ))),
        }
    }
}

/// Hub behaviour.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Text frame handling.
    pub inbound_policy: InboundPolicy,
    /// Echo relayed messages to their sender or not.
    pub sender_policy: SenderPolicy,
    /// Capacity of the register and broadcast channels.
    pub command_capacity: usize,
    /// Period of the world snapshot broadcast, in milliseconds (`0` disables).
    pub snapshot_interval_ms: u64,
    /// Keep a world of positions at all.
    pub track_world: bool,
}

impl HubSettings {
    /// Snapshot period, `None` when disabled.
    pub fn snapshot_interval(&self) -> Option<Duration> {
        (self.snapshot_interval_ms > 0).then(|| Duration::from_millis(self.snapshot_interval_ms))
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            inbound_policy: InboundPolicy::default(),
            sender_policy: SenderPolicy::default(),
            command_capacity: 1024,
            snapshot_interval_ms: 0,
            track_world: true,
        }
    }
}

/// Log level for the stderr subscriber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace-level (most verbose).
    Trace,
    /// Debug-level.
    Debug,
    /// Info-level (default).
    #[default]
    Info,
    /// Warning-level.
    Warn,
    /// Error-level.
    Error,
}

impl LogLevel {
    /// Convert to a tracing filter string.
    pub fn as_filter_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(SettingsError::InvalidValue(format!(
                "unknown log level '{other}'"
            ))),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level written to stderr (`RUST_LOG` wins when set).
    pub level: LogLevel,
}
