//! Configuration loading and management

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::capture::SAMPLE_RATE;

/// Timing and threshold constants of the state controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Fixed length of an audio recording; also the auto-stop deadline
    pub recording_duration: Duration,

    /// Idle time after which Selecting falls back to Idle
    pub selecting_timeout: Duration,

    /// Selector movement that enters Selecting from Idle or Incomplete
    pub selector_threshold: u16,

    /// Smaller movement that keeps Selecting alive
    pub selector_keepalive_threshold: u16,

    /// Consecutive transfer failures that force the Error state
    pub max_transfer_failures: u8,

    /// Cap edges held back while a transfer is outstanding
    pub edge_buffer_capacity: usize,

    /// Microphone sample rate
    pub sample_rate: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            recording_duration: Duration::from_secs(15),
            selecting_timeout: Duration::from_secs(5),
            selector_threshold: 200,
            selector_keepalive_threshold: 100,
            max_transfer_failures: 3,
            edge_buffer_capacity: 8,
            sample_rate: SAMPLE_RATE,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Directory holding artifacts and the presence record
    pub storage_dir: PathBuf,

    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Interval between controller ticks
    pub tick_interval: Duration,

    /// Base URL of the host relay; the simulated relay is used when unset
    pub relay_url: Option<String>,

    /// Simulated relay fails every attempt
    pub simulate_transfer_failure: bool,

    /// Latency of the simulated relay
    pub simulated_latency: Duration,

    /// Read operator commands from stdin
    pub console: bool,

    pub controller: ControllerConfig,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = match lookup("MEMORY_BOTTLE_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = lookup("HOME").context("neither MEMORY_BOTTLE_HOME nor HOME is set")?;
                PathBuf::from(home)
                    .join(".local")
                    .join("share")
                    .join("memory-bottle")
            }
        };

        let tick_ms = match lookup("MEMORY_BOTTLE_TICK_MS") {
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("invalid MEMORY_BOTTLE_TICK_MS: {raw:?}"))?,
            None => 100,
        };
        anyhow::ensure!(tick_ms > 0, "MEMORY_BOTTLE_TICK_MS must be positive");

        let relay_url = lookup("MEMORY_BOTTLE_RELAY_URL").filter(|url| !url.trim().is_empty());

        Ok(Self {
            storage_dir: data_dir.join("storage"),
            socket_path: data_dir.join("bottle.sock"),
            data_dir,
            tick_interval: Duration::from_millis(tick_ms),
            relay_url,
            simulate_transfer_failure: flag(lookup("MEMORY_BOTTLE_SIM_FAIL")),
            simulated_latency: Duration::from_secs(1),
            console: flag(lookup("MEMORY_BOTTLE_CONSOLE")),
            controller: ControllerConfig::default(),
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {:?}", self.data_dir))?;
        Ok(())
    }
}

fn flag(value: Option<String>) -> bool {
    matches!(value.as_deref().map(str::trim), Some("1" | "true" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_under_home() {
        let config = Config::from_lookup(lookup_from(&[("HOME", "/home/bottle")])).unwrap();
        assert_eq!(
            config.data_dir,
            PathBuf::from("/home/bottle/.local/share/memory-bottle")
        );
        assert!(config.socket_path.ends_with("memory-bottle/bottle.sock"));
        assert!(config.storage_dir.ends_with("memory-bottle/storage"));
        assert_eq!(config.tick_interval, Duration::from_millis(100));
        assert_eq!(config.relay_url, None);
        assert!(!config.console);
        assert!(!config.simulate_transfer_failure);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("MEMORY_BOTTLE_HOME", "/var/lib/bottle"),
            ("MEMORY_BOTTLE_TICK_MS", "20"),
            ("MEMORY_BOTTLE_RELAY_URL", "http://10.0.0.2:8080"),
            ("MEMORY_BOTTLE_CONSOLE", "1"),
            ("MEMORY_BOTTLE_SIM_FAIL", "true"),
        ]))
        .unwrap();
        assert_eq!(config.storage_dir, PathBuf::from("/var/lib/bottle/storage"));
        assert_eq!(config.tick_interval, Duration::from_millis(20));
        assert_eq!(config.relay_url.as_deref(), Some("http://10.0.0.2:8080"));
        assert!(config.console);
        assert!(config.simulate_transfer_failure);
    }

    #[test]
    fn test_invalid_tick_rejected() {
        assert!(Config::from_lookup(lookup_from(&[("HOME", "/h"), ("MEMORY_BOTTLE_TICK_MS", "fast")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("HOME", "/h"), ("MEMORY_BOTTLE_TICK_MS", "0")])).is_err());
    }

    #[test]
    fn test_missing_home() {
        assert!(Config::from_lookup(lookup_from(&[])).is_err());
    }

    #[test]
    fn test_controller_constants() {
        let controller = ControllerConfig::default();
        assert_eq!(controller.recording_duration, Duration::from_secs(15));
        assert_eq!(controller.selecting_timeout, Duration::from_secs(5));
        assert_eq!(controller.max_transfer_failures, 3);
    }
}
