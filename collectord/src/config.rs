use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// mDNS self-advertisement; disabled when the section is absent
    pub advertise: Option<AdvertiseConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// JSON-lines capture replayed by the scan driver
    #[serde(default = "default_capture_path")]
    pub capture: PathBuf,
    /// Sleep for the scan window while replaying
    #[serde(default = "default_true")]
    pub realtime: bool,
    /// Restart the capture from the top once exhausted
    #[serde(default)]
    pub loop_capture: bool,
    #[serde(default = "default_initial_scan")]
    pub initial_scan_secs: u64,
    #[serde(default = "default_min_scan")]
    pub min_scan_secs: u64,
    #[serde(default = "default_max_scan")]
    pub max_scan_secs: u64,
    #[serde(default = "default_scan_step")]
    pub scan_step_secs: u64,
    /// Use the wall clock for created/updated timestamps
    #[serde(default = "default_true")]
    pub use_system_clock: bool,
}

/// Pool sizes. Unset sizes are derived from `auxiliary_memory`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    /// A secondary memory tier is present (larger pools, bulk pre-resolution)
    #[serde(default)]
    pub auxiliary_memory: bool,
    pub device_slots: Option<usize>,
    pub staging_slots: Option<usize>,
    pub vendor_slots: Option<usize>,
    pub oui_slots: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_devices_db")]
    pub devices_db: PathBuf,
    #[serde(default = "default_vendors_db")]
    pub vendors_db: PathBuf,
    #[serde(default = "default_oui_db")]
    pub oui_db: PathBuf,
    /// Refresh hits/updated_at of rows that already exist
    #[serde(default = "default_true")]
    pub touch_known: bool,
    /// Prune every N completed cycles, 0 disables
    #[serde(default = "default_prune_every")]
    pub prune_every: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdvertiseConfig {
    /// Address announced alongside the API port
    pub address: String,
    #[serde(default = "default_instance")]
    pub instance: String,
}

/// Effective pool capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacities {
    pub devices: usize,
    pub staging: usize,
    pub vendors: usize,
    pub oui: usize,
}

impl CacheConfig {
    pub fn capacities(&self) -> Capacities {
        let base = if self.auxiliary_memory {
            Capacities { devices: 1024, staging: 256, vendors: 64, oui: 64 }
        } else {
            Capacities { devices: 48, staging: 32, vendors: 16, oui: 16 }
        };
        Capacities {
            devices: self.device_slots.unwrap_or(base.devices).max(1),
            staging: self.staging_slots.unwrap_or(base.staging).max(1),
            vendors: self.vendor_slots.unwrap_or(base.vendors).max(1),
            oui: self.oui_slots.unwrap_or(base.oui).max(1),
        }
    }
}

impl ScannerConfig {
    pub fn initial_scan(&self) -> Duration {
        Duration::from_secs(self.initial_scan_secs)
    }

    pub fn min_scan(&self) -> Duration {
        Duration::from_secs(self.min_scan_secs)
    }

    pub fn max_scan(&self) -> Duration {
        Duration::from_secs(self.max_scan_secs)
    }

    pub fn scan_step(&self) -> Duration {
        Duration::from_secs(self.scan_step_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_capture_path() -> PathBuf {
    PathBuf::from("/var/lib/blecollector/capture.jsonl")
}

fn default_initial_scan() -> u64 {
    30
}

fn default_min_scan() -> u64 {
    10
}

fn default_max_scan() -> u64 {
    60
}

fn default_scan_step() -> u64 {
    5
}

fn default_devices_db() -> PathBuf {
    PathBuf::from("/var/lib/blecollector/blemacs.db")
}

fn default_vendors_db() -> PathBuf {
    PathBuf::from("/var/lib/blecollector/ble-oui.db")
}

fn default_oui_db() -> PathBuf {
    PathBuf::from("/var/lib/blecollector/mac-oui-light.db")
}

fn default_prune_every() -> u64 {
    50
}

fn default_listen() -> String {
    "[::]:8054".to_string()
}

fn default_instance() -> String {
    "blecollector".to_string()
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            capture: default_capture_path(),
            realtime: true,
            loop_capture: false,
            initial_scan_secs: default_initial_scan(),
            min_scan_secs: default_min_scan(),
            max_scan_secs: default_max_scan(),
            scan_step_secs: default_scan_step(),
            use_system_clock: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            devices_db: default_devices_db(),
            vendors_db: default_vendors_db(),
            oui_db: default_oui_db(),
            touch_known: true,
            prune_every: default_prune_every(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        if config.scanner.min_scan_secs > config.scanner.max_scan_secs {
            anyhow::bail!(
                "min_scan_secs ({}) exceeds max_scan_secs ({})",
                config.scanner.min_scan_secs,
                config.scanner.max_scan_secs
            );
        }
        Ok(config)
    }
}
