//! Call core configuration, loaded from environment variables.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

/// Tunables for the call core. Everything has a default; the environment
/// overrides.
#[derive(Debug, Clone)]
pub struct Config {
    /// STUN servers handed to the peer connection.
    pub stun_servers: Vec<String>,
    /// Delay between the offer gate opening and the offer being created,
    /// giving the joiner's subscription time to settle.
    pub settle_delay: Duration,
    /// How long a call may sit in `Connecting` before it fails.
    pub connect_timeout: Duration,
    /// Signals older than this relative to attempt start are dropped.
    pub signal_staleness: Duration,
    /// Per-room signal channel buffer size.
    pub signal_capacity: usize,
}

const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let stun_servers = std::env::var("HUDDLE_STUN_SERVERS")
            .unwrap_or_else(|_| DEFAULT_STUN_SERVER.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        let settle_delay_ms: u64 = std::env::var("HUDDLE_SETTLE_DELAY_MS")
            .unwrap_or_else(|_| "2000".to_string())
            .parse()
            .context("Invalid HUDDLE_SETTLE_DELAY_MS")?;

        let connect_timeout_secs: u64 = std::env::var("HUDDLE_CONNECT_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .context("Invalid HUDDLE_CONNECT_TIMEOUT_SECS")?;

        let signal_staleness_secs: u64 = std::env::var("HUDDLE_SIGNAL_STALENESS_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .context("Invalid HUDDLE_SIGNAL_STALENESS_SECS")?;

        let signal_capacity: usize = std::env::var("HUDDLE_SIGNAL_CAPACITY")
            .unwrap_or_else(|_| "64".to_string())
            .parse()
            .context("Invalid HUDDLE_SIGNAL_CAPACITY")?;

        let config = Self {
            stun_servers,
            settle_delay: Duration::from_millis(settle_delay_ms),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            signal_staleness: Duration::from_secs(signal_staleness_secs),
            signal_capacity,
        };

        info!(
            stun_servers = ?config.stun_servers,
            settle_delay_ms,
            connect_timeout_secs,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Configuration for tests: short delays so lifecycle tests finish
    /// quickly.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            settle_delay: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(5),
            signal_staleness: Duration::from_secs(30),
            signal_capacity: 64,
        }
    }
}
