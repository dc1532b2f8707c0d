//! Ambient client configuration.
//!
//! Loaded the way the teacher's `GeckoSettings::load` loads: resolve a
//! platform config directory via `directories::ProjectDirs`, deserialize
//! if present, fall back to `Default::default()` on any missing file or
//! parse error. This crate uses TOML rather than the teacher's JSON,
//! which is otherwise the same serde-based "ambient config" idiom.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use hearth_proto::constants::SERVER_CONNECT_TIMEOUT;

/// Client-side configuration: socket directory, default connect timeout,
/// and scheduling hints for per-stream audio tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HearthConfig {
    /// Directory containing the per-connection-type socket files.
    pub socket_dir: PathBuf,
    /// Default timeout for blocking `connect_timeout` calls.
    #[serde(with = "duration_ms", default = "default_connect_timeout_ms")]
    pub connect_timeout: Duration,
    /// Whether audio tasks should attempt to raise their scheduling class
    /// to realtime (`SCHED_RR`) when the platform allows it.
    #[serde(default = "default_true")]
    pub realtime_scheduling: bool,
    /// Priority passed to the realtime scheduling hook, ignored if
    /// `realtime_scheduling` is false or unsupported.
    #[serde(default = "default_priority")]
    pub realtime_priority: i32,
}

fn default_true() -> bool {
    true
}

fn default_priority() -> i32 {
    10
}

fn default_connect_timeout_ms() -> Duration {
    SERVER_CONNECT_TIMEOUT
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

impl Default for HearthConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/run/hearth"),
            connect_timeout: SERVER_CONNECT_TIMEOUT,
            realtime_scheduling: true,
            realtime_priority: 10,
        }
    }
}

impl HearthConfig {
    /// Load from disk, or return default if missing/corrupt.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            info!("could not determine config path, using defaults");
            return Self::default();
        };

        if !path.exists() {
            info!("no config file at {:?}, using defaults", path);
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    info!("config loaded from {:?}", path);
                    config
                }
                Err(e) => {
                    error!("failed to parse config file {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(e) => {
                error!("failed to read config file {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path()
            .ok_or_else(|| std::io::Error::other("could not determine config path"))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = toml::to_string_pretty(self)
            .map_err(std::io::Error::other)?;
        fs::write(&path, serialized)
    }

    fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "hearth", "hearth")
            .map(|proj| proj.config_dir().join("client.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let cfg = HearthConfig::default();
        assert_eq!(cfg.connect_timeout, SERVER_CONNECT_TIMEOUT);
        assert!(cfg.realtime_scheduling);
    }

    #[test]
    fn roundtrips_through_toml() {
        let mut cfg = HearthConfig::default();
        cfg.socket_dir = PathBuf::from("/tmp/hearth-test");
        cfg.realtime_priority = 20;

        let serialized = toml::to_string_pretty(&cfg).unwrap();
        let back: HearthConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn missing_optional_fields_fall_back_to_defaults() {
        let partial = r#"socket_dir = "/run/hearth""#;
        let cfg: HearthConfig = toml::from_str(partial).unwrap();
        assert!(cfg.realtime_scheduling);
        assert_eq!(cfg.realtime_priority, 10);
    }
}
