use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::model::{MINUTE_MS, Ms, Severity};

pub const DEFAULT_TRAVEL_BUFFER_MINUTES: i64 = 90;
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-organization engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Organizational timezone every instant is normalized to.
    pub timezone: Tz,
    /// Minimum gap between bookings of one instructor at different locations.
    pub travel_buffer_ms: Ms,
    pub travel_buffer_severity: Severity,
    /// Upper bound on waiting for commit locks before answering `Busy`.
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            travel_buffer_ms: DEFAULT_TRAVEL_BUFFER_MINUTES * MINUTE_MS,
            travel_buffer_severity: Severity::Advisory,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl EngineConfig {
    pub fn with_travel_buffer_minutes(mut self, minutes: i64) -> Self {
        self.travel_buffer_ms = minutes.saturating_mul(MINUTE_MS);
        self
    }

    pub fn with_blocking_travel_buffer(mut self, blocking: bool) -> Self {
        self.travel_buffer_severity = if blocking {
            Severity::Blocking
        } else {
            Severity::Advisory
        };
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

/// Everything the server binary reads from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map here).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let timezone = match lookup("FORMACAL_TIMEZONE") {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| ConfigError::Invalid("FORMACAL_TIMEZONE", name))?,
            None => Tz::UTC,
        };
        let travel_minutes: i64 = parse_or(&lookup, "FORMACAL_TRAVEL_BUFFER_MINUTES", DEFAULT_TRAVEL_BUFFER_MINUTES)?;
        if travel_minutes < 0 || travel_minutes.checked_mul(MINUTE_MS).is_none() {
            return Err(ConfigError::Invalid(
                "FORMACAL_TRAVEL_BUFFER_MINUTES",
                travel_minutes.to_string(),
            ));
        }
        let blocking: bool = parse_or(&lookup, "FORMACAL_TRAVEL_BUFFER_BLOCKING", false)?;
        let lock_timeout_ms: u64 = parse_or(
            &lookup,
            "FORMACAL_LOCK_TIMEOUT_MS",
            DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
        )?;

        let engine = EngineConfig::default()
            .with_timezone(timezone)
            .with_travel_buffer_minutes(travel_minutes)
            .with_blocking_travel_buffer(blocking)
            .with_lock_timeout(Duration::from_millis(lock_timeout_ms));

        let metrics_port = match lookup("FORMACAL_METRICS_PORT") {
            Some(raw) => Some(
                raw.parse()
                    .map_err(|_| ConfigError::Invalid("FORMACAL_METRICS_PORT", raw))?,
            ),
            None => None,
        };

        Ok(Self {
            bind: lookup("FORMACAL_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "FORMACAL_PORT", 5433)?,
            data_dir: PathBuf::from(lookup("FORMACAL_DATA_DIR").unwrap_or_else(|| "./data".into())),
            max_connections: parse_or(&lookup, "FORMACAL_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&lookup, "FORMACAL_COMPACT_THRESHOLD", 1000)?,
            metrics_port,
            engine,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key, raw)),
        None => Ok(default),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid(key, value) => write!(f, "invalid value for {key}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}
