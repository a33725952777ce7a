//! Service configuration
//!
//! Loaded from a TOML file; every field has a default so an empty file (or no
//! file at all) yields a working single-node setup.

use crate::error::{CoreError, Result};
use chrono::{FixedOffset, Local, Offset, Weekday};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// SQLite database file (None = platform data dir)
    pub database_path: Option<PathBuf>,
    pub server: ServerConfig,
    pub node: NodeProtocolConfig,
    pub ingest: IngestConfig,
    pub calendar: CalendarConfig,
    pub devices: DeviceConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Settings shared with relay nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeProtocolConfig {
    /// Shared secret every node presents as `token`
    pub server_token: String,
    /// Seconds between traffic pushes, advertised in the runtime config
    pub push_interval_secs: u64,
    /// Seconds between user-list pulls, advertised in the runtime config
    pub pull_interval_secs: u64,
    /// Address nodes should bind, advertised in the runtime config
    pub listen_ip: String,
}

impl Default for NodeProtocolConfig {
    fn default() -> Self {
        Self {
            server_token: String::new(),
            push_interval_secs: 60,
            pull_interval_secs: 60,
            listen_ip: "0.0.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Reports of one batch applied in parallel
    pub max_concurrent_reports: usize,
    /// Upper bound on one report's transaction, lock wait included
    pub transaction_timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reports: 8,
            transaction_timeout_ms: 2_000,
        }
    }
}

impl IngestConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }
}

/// Calendar used to align period boundaries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// Fixed UTC offset such as "+08:00"; None = the host's current offset
    pub utc_offset: Option<String>,
    /// First day of the week for weekly plans
    pub week_starts_on: String,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            utc_offset: None,
            week_starts_on: "sunday".to_string(),
        }
    }
}

impl CalendarConfig {
    pub fn offset(&self) -> Result<FixedOffset> {
        match &self.utc_offset {
            Some(raw) => parse_utc_offset(raw),
            None => Ok(Local::now().offset().fix()),
        }
    }

    pub fn week_start(&self) -> Result<Weekday> {
        self.week_starts_on
            .trim()
            .parse::<Weekday>()
            .map_err(|_| CoreError::InvalidConfig {
                message: format!("unknown weekday: {}", self.week_starts_on),
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Sightings older than this no longer count as online
    pub stale_after_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 300,
        }
    }
}

impl DeviceConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub period_sweep_interval_secs: u64,
    pub device_sweep_interval_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            period_sweep_interval_secs: 3_600,
            device_sweep_interval_secs: 600,
        }
    }
}

impl MeterConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: MeterConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<()> {
        self.calendar.offset()?;
        self.calendar.week_start()?;

        if self.ingest.max_concurrent_reports == 0 {
            return Err(CoreError::InvalidConfig {
                message: "ingest.max_concurrent_reports must be at least 1".to_string(),
            });
        }
        if self.ingest.transaction_timeout_ms == 0 {
            return Err(CoreError::InvalidConfig {
                message: "ingest.transaction_timeout_ms must be positive".to_string(),
            });
        }
        if self.jobs.period_sweep_interval_secs == 0 || self.jobs.device_sweep_interval_secs == 0
        {
            return Err(CoreError::InvalidConfig {
                message: "job intervals must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Database location, falling back to the platform data directory
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join("meterboard").join("meterboard.db")))
    }
}

/// Parse "+HH:MM", "-HHMM" or "Z"
fn parse_utc_offset(raw: &str) -> Result<FixedOffset> {
    let invalid = || CoreError::InvalidConfig {
        message: format!("invalid utc offset: {raw}"),
    };

    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, rest) = match raw.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if minutes >= 60 {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}
