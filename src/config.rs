use std::{fmt, str::FromStr, time::Duration};

use anyhow::anyhow;
use serde::Serialize;

use crate::rooms::{Truncation, MAX_CAPACITY, MIN_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    Push,
    Pull,
}

impl FromStr for RelayMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(RelayMode::Push),
            "pull" => Ok(RelayMode::Pull),
            other => Err(anyhow!("unknown relay mode {other:?}, expected push or pull")),
        }
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RelayMode::Push => f.write_str("push"),
            RelayMode::Pull => f.write_str("pull"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub relay: RelayMode,
    pub default_capacity: usize,
    pub truncation: Truncation,
    /// `None` keeps ghosts forever.
    pub lease: Option<Duration>,
    pub sweep_every: Duration,
    pub poll_ms: u64,
    pub auto_join_code: bool,
    pub cors_origin: Option<String>,
    pub broadcast_capacity: usize,
    pub session_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: "sqlite://onlynow.db".to_owned(),
            bind_addr: "0.0.0.0:8080".to_owned(),
            relay: RelayMode::Push,
            default_capacity: MIN_CAPACITY,
            truncation: Truncation::default(),
            lease: Some(Duration::from_secs(30)),
            sweep_every: Duration::from_secs(15),
            poll_ms: 500,
            auto_join_code: true,
            cors_origin: None,
            broadcast_capacity: 64,
            session_minutes: 30,
        }
    }
}

/// Longest lease accepted. Anything longer is indistinguishable from no lease.
pub const MAX_LEASE_SECS: u64 = 7 * 24 * 60 * 60;

fn var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };

    raw.trim()
        .parse()
        .map_err(|err| anyhow!("{key}={raw:?}: {err}"))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Config> {
        Config::from_lookup(|key| dotenv::var(key).ok())
    }

    /// Builds the config from any key -> value source, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
        let defaults = Config::default();

        let default_capacity = var(&lookup, "ONLYNOW_CAPACITY", defaults.default_capacity)?;
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&default_capacity) {
            return Err(anyhow!(
                "ONLYNOW_CAPACITY must be between {MIN_CAPACITY} and {MAX_CAPACITY}, got {default_capacity}"
            ));
        }

        let lines = var(&lookup, "ONLYNOW_TRUNCATE_LINES", defaults.truncation.lines)?;
        let max_chars = var(&lookup, "ONLYNOW_MAX_CHARS", defaults.truncation.max_chars)?;
        if lines == 0 || max_chars == 0 {
            return Err(anyhow!("ONLYNOW_TRUNCATE_LINES and ONLYNOW_MAX_CHARS must be positive"));
        }

        let lease_secs = var(&lookup, "ONLYNOW_LEASE_SECS", 30u64)?;
        if lease_secs > MAX_LEASE_SECS {
            return Err(anyhow!("ONLYNOW_LEASE_SECS must be at most {MAX_LEASE_SECS}, got {lease_secs}"));
        }

        let session_minutes = var(&lookup, "ONLYNOW_SESSION_MINUTES", defaults.session_minutes)?;
        if session_minutes <= 0 {
            return Err(anyhow!("ONLYNOW_SESSION_MINUTES must be positive, got {session_minutes}"));
        }

        let sweep_secs = var(&lookup, "ONLYNOW_SWEEP_SECS", defaults.sweep_every.as_secs())?;

        Ok(Config {
            database_url: var(&lookup, "DATABASE_URL", defaults.database_url)?,
            bind_addr: var(&lookup, "ONLYNOW_BIND", defaults.bind_addr)?,
            relay: var(&lookup, "ONLYNOW_RELAY", defaults.relay)?,
            default_capacity,
            truncation: Truncation { lines, max_chars },
            lease: (lease_secs > 0).then(|| Duration::from_secs(lease_secs)),
            sweep_every: Duration::from_secs(sweep_secs.max(1)),
            poll_ms: var(&lookup, "ONLYNOW_POLL_MS", defaults.poll_ms)?,
            auto_join_code: var(&lookup, "ONLYNOW_AUTO_JOIN_CODE", defaults.auto_join_code)?,
            cors_origin: lookup("ONLYNOW_CORS_ORIGIN").filter(|origin| !origin.is_empty()),
            broadcast_capacity: var(&lookup, "ONLYNOW_BROADCAST_CAPACITY", defaults.broadcast_capacity)?.max(1),
            session_minutes,
        })
    }
}
