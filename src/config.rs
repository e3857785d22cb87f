//! Configuration management for fragmend

use crate::ecc::SUPPORTED_SUPPLIER_COUNTS;
use crate::error::{Error, Result};
use crate::transfer::TransferConfig;
use crate::worker::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default plaintext block size: 4 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Default supplier count. Must be one of the supported erasure map sizes.
pub const DEFAULT_SUPPLIERS: usize = 4;

/// Identity and erasure geometry of this customer node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerConfig {
    /// Global customer id, e.g. `"alice@first-node.net"`.
    pub id: String,

    /// Number of supplier slots; fixes the erasure map.
    #[serde(default = "default_suppliers")]
    pub suppliers: usize,

    /// Plaintext bytes per block before framing and encoding.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Initial supplier roster, one peer id per slot. Shorter lists leave
    /// the remaining slots empty; the embedding application assigns them
    /// later through the directory handle.
    #[serde(default)]
    pub peers: Vec<String>,
}

fn default_suppliers() -> usize {
    DEFAULT_SUPPLIERS
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

impl Default for CustomerConfig {
    fn default() -> Self {
        CustomerConfig {
            id: String::new(),
            suppliers: DEFAULT_SUPPLIERS,
            block_size: DEFAULT_BLOCK_SIZE,
            peers: Vec::new(),
        }
    }
}

/// Per-supplier transfer queue tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    /// Sends in flight per supplier.
    #[serde(default = "default_send_window")]
    pub send_window: usize,

    /// Requests in flight per supplier.
    #[serde(default = "default_request_window")]
    pub request_window: usize,

    /// Sends larger than this wait for a free window slot (bytes).
    #[serde(default = "default_big_file_threshold")]
    pub big_file_threshold: u64,

    /// Assumed upload rate for send timeouts (bytes per second).
    #[serde(default = "default_speed")]
    pub send_speed: u64,

    /// Assumed download rate for request timeouts (bytes per second).
    #[serde(default = "default_speed")]
    pub request_speed: u64,

    /// Hard cap for a single send attempt (seconds).
    #[serde(default = "default_max_send_timeout_secs")]
    pub max_send_timeout_secs: u64,

    /// Wire-level delivery failures tolerated per entry.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

fn default_send_window() -> usize {
    4
}

fn default_request_window() -> usize {
    2
}

fn default_big_file_threshold() -> u64 {
    10 * 1024
}

fn default_speed() -> u64 {
    3 * 1024
}

fn default_max_send_timeout_secs() -> u64 {
    3600
}

fn default_retry_budget() -> u32 {
    2
}

impl Default for TransferSection {
    fn default() -> Self {
        TransferSection {
            send_window: default_send_window(),
            request_window: default_request_window(),
            big_file_threshold: default_big_file_threshold(),
            send_speed: default_speed(),
            request_speed: default_speed(),
            max_send_timeout_secs: default_max_send_timeout_secs(),
            retry_budget: default_retry_budget(),
        }
    }
}

/// Background repair tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildSection {
    /// Engine heartbeat driving queue ticks and state-machine timers (ms).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

impl Default for RebuildSection {
    fn default() -> Self {
        RebuildSection {
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

/// Restore behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreSection {
    /// Keep block fragments on disk after a successful restore instead of
    /// deleting them.
    #[serde(default)]
    pub keep_local_copies: bool,
}

impl Default for RestoreSection {
    fn default() -> Self {
        RestoreSection {
            keep_local_copies: false,
        }
    }
}

/// Raid worker pool tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Blocking threads for erasure work. Omit to detect from the CPU
    /// count.
    #[serde(default)]
    pub parallelism: Option<usize>,

    /// Seconds of idleness before the pool releases its threads.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    60
}

impl Default for WorkerSection {
    fn default() -> Self {
        WorkerSection {
            parallelism: None,
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmendConfig {
    /// Customer identity and erasure geometry.
    pub customer: CustomerConfig,

    /// Transfer queue tunables.
    #[serde(default)]
    pub transfer: TransferSection,

    /// Repair loop tunables.
    #[serde(default)]
    pub rebuild: RebuildSection,

    /// Restore behavior.
    #[serde(default)]
    pub restore: RestoreSection,

    /// Raid worker pool tunables.
    #[serde(default)]
    pub worker: WorkerSection,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to the data directory (fragments, saved listings).
    #[serde(default)]
    pub data_dir: PathBuf,
}

impl Default for FragmendConfig {
    fn default() -> Self {
        FragmendConfig {
            customer: CustomerConfig::default(),
            transfer: TransferSection::default(),
            rebuild: RebuildSection::default(),
            restore: RestoreSection::default(),
            worker: WorkerSection::default(),
            logging: LoggingConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fragmend")
}

impl FragmendConfig {
    /// Load configuration from a file (YAML or JSON), with environment
    /// variable substitution.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let content = Self::substitute_env_vars(&content);

        let mut config: FragmendConfig = if is_yaml(path_ref) {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        if config.data_dir == PathBuf::new() {
            config.data_dir = default_data_dir();
        }

        config.validate()?;
        Ok(config)
    }

    /// Substitute environment variables in config content.
    /// Supports ${VAR_NAME} syntax.
    fn substitute_env_vars(content: &str) -> String {
        let mut result = content.to_string();

        let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

        for cap in re.captures_iter(content) {
            let full_match = &cap[0];
            let var_name = &cap[1];

            if let Ok(value) = std::env::var(var_name) {
                result = result.replace(full_match, &value);
            }
        }

        result
    }

    /// Save configuration to a file (format determined by extension).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        let content = if is_yaml(path_ref) {
            serde_yaml::to_string(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config to YAML: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config to JSON: {}", e)))?
        };

        std::fs::write(path_ref, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.customer.id.is_empty() {
            return Err(Error::InvalidConfig("customer.id is required".to_string()));
        }

        if !SUPPORTED_SUPPLIER_COUNTS.contains(&self.customer.suppliers) {
            return Err(Error::InvalidConfig(format!(
                "customer.suppliers must be one of {:?}, got {}",
                SUPPORTED_SUPPLIER_COUNTS, self.customer.suppliers
            )));
        }

        if self.customer.peers.len() > self.customer.suppliers {
            return Err(Error::InvalidConfig(format!(
                "{} peers listed for {} supplier slots",
                self.customer.peers.len(),
                self.customer.suppliers
            )));
        }

        if self.customer.block_size == 0 {
            return Err(Error::InvalidConfig(
                "customer.block_size must be greater than 0".to_string(),
            ));
        }

        if self.transfer.send_window == 0 || self.transfer.request_window == 0 {
            return Err(Error::InvalidConfig(
                "transfer windows must be greater than 0".to_string(),
            ));
        }

        if self.transfer.send_speed == 0 || self.transfer.request_speed == 0 {
            return Err(Error::InvalidConfig(
                "transfer speeds must be greater than 0".to_string(),
            ));
        }

        if self.rebuild.tick_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "rebuild.tick_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.fragments_dir())?;
        std::fs::create_dir_all(self.listings_dir())?;
        Ok(())
    }

    /// Root of the local fragment store.
    pub fn fragments_dir(&self) -> PathBuf {
        self.data_dir.join("fragments")
    }

    /// Where the latest raw supplier listings are archived.
    pub fn listings_dir(&self) -> PathBuf {
        self.data_dir.join("listings")
    }

    /// Queue tunables in the transfer module's terms.
    pub fn transfer_config(&self) -> TransferConfig {
        let defaults = TransferConfig::default();
        TransferConfig {
            send_window: self.transfer.send_window,
            request_window: self.transfer.request_window,
            big_file_threshold: self.transfer.big_file_threshold,
            send_speed: self.transfer.send_speed,
            request_speed: self.transfer.request_speed,
            block_size_hint: self.customer.block_size as u64,
            max_send_timeout: Duration::from_secs(self.transfer.max_send_timeout_secs),
            retry_budget: self.transfer.retry_budget,
            ..defaults
        }
    }

    /// Pool tunables in the worker module's terms.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            parallelism: self.worker.parallelism,
            idle_timeout: Duration::from_secs(self.worker.idle_timeout_secs),
        }
    }

    /// Engine heartbeat interval.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.rebuild.tick_interval_ms)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}
