//! Connector configuration and bus discovery from the environment.

use std::env;
use std::fs;
use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

pub const SESSION_BUS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";
pub const SYSTEM_BUS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";
/// Well-known system bus socket.
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/run/dbus/system_bus_socket";

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    /// Event-loop threads shared by all connections of one connector.
    pub workers: usize,

    /// Handshake deadline, counted from when the worker takes the channel.
    pub auth_timeout: Duration,

    /// Initial inbound buffer per connection; grows up to `max_message_size`.
    pub read_buffer_size: usize,

    pub max_message_size: usize,

    /// SO_SNDBUF / SO_RCVBUF request, if any.
    pub socket_buffer_size: Option<usize>,

    /// Trace every byte on the wire (hex) at TRACE level.
    pub log_wire_bytes: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            auth_timeout: Duration::from_secs(25),
            read_buffer_size: 64 * 1024,
            max_message_size: crate::protocol::MAX_MESSAGE_SIZE,
            socket_buffer_size: None,
            log_wire_bytes: false,
        }
    }
}

impl ConnectorConfig {
    /// Defaults overridden by environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DBUSLINK_WORKERS`: worker threads (default: 1)
    /// - `DBUSLINK_AUTH_TIMEOUT_MS`: handshake deadline in ms (default: 25000)
    /// - `DBUSLINK_LOG_WIRE`: `1`/`true` to trace wire bytes (default: false)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            workers: lookup("DBUSLINK_WORKERS")
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.workers),

            auth_timeout: lookup("DBUSLINK_AUTH_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.auth_timeout),

            log_wire_bytes: lookup("DBUSLINK_LOG_WIRE")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(defaults.log_wire_bytes),

            ..defaults
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.auth_timeout.is_zero() {
            return Err(Error::Config("auth_timeout must be non-zero".into()));
        }
        if self.read_buffer_size == 0 || self.read_buffer_size > self.max_message_size {
            return Err(Error::Config(format!(
                "read_buffer_size must be in 1..={}",
                self.max_message_size
            )));
        }
        Ok(())
    }
}

/// Session bus address: the environment, else ask `dbus-launch`.
pub fn session_bus_address() -> Result<String> {
    if let Ok(address) = env::var(SESSION_BUS_ENV) {
        if !address.trim().is_empty() {
            return Ok(address);
        }
    }

    let machine_id = MACHINE_ID_PATHS
        .iter()
        .find_map(|p| fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| Error::Config("no machine id found for dbus-launch".into()))?;

    debug!(%machine_id, "asking dbus-launch for the session bus");
    let output = Command::new("dbus-launch")
        .arg("--autolaunch")
        .arg(&machine_id)
        .output()?;
    if !output.status.success() {
        return Err(Error::Config(format!(
            "dbus-launch exited with {}",
            output.status
        )));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_launch_output(&text)
        .ok_or_else(|| Error::Config(format!("dbus-launch printed no {SESSION_BUS_ENV}")))
}

/// System bus address: the environment, else the well-known socket.
pub fn system_bus_address() -> String {
    env::var(SYSTEM_BUS_ENV)
        .ok()
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SYSTEM_BUS_ADDRESS.to_string())
}

/// Pull the session address out of `KEY=value` lines.
fn parse_launch_output(text: &str) -> Option<String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == SESSION_BUS_ENV)
        .map(|(_, value)| {
            value
                .trim()
                .trim_end_matches(';')
                .trim_matches(|c| c == '\'' || c == '"')
                .to_string()
        })
        .filter(|v| !v.is_empty())
}
