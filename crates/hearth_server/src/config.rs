//! Ambient server configuration: socket directory, reset-quota refill
//! interval, and the hotword-pause-at-suspend toggle. Same load-or-default
//! discipline as the client's `HearthConfig` (`hearth_client::config`),
//! itself grounded in the teacher's `GeckoSettings::load`.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Server-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Directory the per-connection-type control sockets are created in.
    pub socket_dir: PathBuf,
    /// How often the idle-device-close / reset-quota-refill timer runs.
    #[serde(with = "duration_ms", default = "default_timer_period_ms")]
    pub timer_period: Duration,
    /// Whether active hotword streams are rerouted onto an empty hotword
    /// device across suspend rather than torn down.
    #[serde(default)]
    pub hotword_pause_at_suspend: bool,
    /// Maximum number of real hardware devices opened at once, beyond
    /// the always-present fallback pair.
    #[serde(default = "default_max_open_devices")]
    pub max_open_devices: u32,
}

fn default_timer_period_ms() -> Duration {
    Duration::from_secs(1)
}

fn default_max_open_devices() -> u32 {
    10
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

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/run/hearth"),
            timer_period: Duration::from_secs(1),
            hotword_pause_at_suspend: false,
            max_open_devices: default_max_open_devices(),
        }
    }
}

impl ServerConfig {
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
        let serialized = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(&path, serialized)
    }

    fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "hearth", "hearth")
            .map(|proj| proj.config_dir().join("hearthd.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.timer_period, Duration::from_secs(1));
        assert!(!cfg.hotword_pause_at_suspend);
    }

    #[test]
    fn roundtrips_through_toml() {
        let mut cfg = ServerConfig::default();
        cfg.socket_dir = PathBuf::from("/tmp/hearthd-test");
        cfg.hotword_pause_at_suspend = true;

        let serialized = toml::to_string_pretty(&cfg).unwrap();
        let back: ServerConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn missing_optional_fields_fall_back_to_defaults() {
        let partial = r#"socket_dir = "/run/hearth""#;
        let cfg: ServerConfig = toml::from_str(partial).unwrap();
        assert_eq!(cfg.max_open_devices, 10);
        assert!(!cfg.hotword_pause_at_suspend);
    }
}
