//! Monitor configuration management

use anyhow::{Context, Result, anyhow};
use common::DeviceFilter;
use engine::DeviceConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub monitor: MonitorSettings,
    /// The device to stream from once it appears
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub log_level: String,
    /// Devices reported by the enumerator (VID:PID patterns, empty = all)
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default = "MonitorSettings::default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Sleep between polls of a streaming device
    #[serde(default = "MonitorSettings::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How far behind the clock packets are drained
    #[serde(default = "MonitorSettings::default_playout_delay_us")]
    pub playout_delay_us: u64,
    /// Transfer statistics reporting interval in seconds (0 = disabled)
    #[serde(default = "MonitorSettings::default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl MonitorSettings {
    fn default_scan_interval_ms() -> u64 {
        1000
    }

    fn default_poll_interval_ms() -> u64 {
        2
    }

    fn default_playout_delay_us() -> u64 {
        4000
    }

    fn default_stats_interval() -> u64 {
        10
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorSettings {
                log_level: "info".to_string(),
                filters: Vec::new(),
                scan_interval_ms: MonitorSettings::default_scan_interval_ms(),
                poll_interval_ms: MonitorSettings::default_poll_interval_ms(),
                playout_delay_us: MonitorSettings::default_playout_delay_us(),
                stats_interval_secs: MonitorSettings::default_stats_interval(),
            },
            device: DeviceConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/iso-usb/monitor.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let config = Self::load_from(&config_path)?;
        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: MonitorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("iso-usb").join("monitor.toml")
        } else {
            PathBuf::from(".config/iso-usb/monitor.toml")
        }
    }

    /// Parsed enumeration filters
    pub fn filters(&self) -> Result<Vec<DeviceFilter>> {
        self.monitor
            .filters
            .iter()
            .map(|f| f.parse::<DeviceFilter>().map_err(|e| anyhow!(e)))
            .collect()
    }

    /// Whether a device reported by the enumerator is the one to stream from
    pub fn wants(&self, vendor_id: u16, product_id: u16) -> bool {
        self.device.vendor_id == vendor_id && self.device.product_id == product_id
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.monitor.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.monitor.log_level,
                valid_levels.join(", ")
            ));
        }

        self.filters()?;

        if self.monitor.scan_interval_ms == 0 {
            return Err(anyhow!("scan_interval_ms must be at least 1"));
        }

        self.device
            .validate()
            .context("Invalid [device] section")?;

        Ok(())
    }
}
