//! Configuration management for the bakery controller
//!
//! Configuration is loaded from `BAKERY_*` environment variables or from a
//! TOML file. Every section has defaults, so a file only needs the values it
//! changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::exports::ExportConfig;
use crate::provisioner::{ManagerConfig, ServerConfig};
use crate::template::PipelineConfig;
use crate::utils::retry::RetryConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Node database, disks and exports
    pub storage: StorageConfig,

    /// Template images and mount pipeline
    pub images: ImagesConfig,

    /// Power controller
    pub power: PowerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Where nodes and disks live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding node records
    pub database_path: PathBuf,

    /// Parent folder of all disk folders
    pub disk_root: PathBuf,

    /// Export file rewritten on every change
    pub export_file: PathBuf,

    /// Command run after the export file changed; empty disables it
    pub export_reload_command: Vec<String>,

    /// Timeout for the reload command in seconds
    pub export_reload_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/bakery.db"),
            disk_root: PathBuf::from("/srv/bakery/disks"),
            export_file: PathBuf::from("/etc/exports.d/bakery.exports"),
            export_reload_command: vec!["exportfs".to_string(), "-ra".to_string()],
            export_reload_timeout_secs: 30,
        }
    }
}

/// Template images and the tools that open them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    /// Folder scanned for `*.img` templates
    pub template_dir: PathBuf,

    /// Parent folder of the per-template boot artifact caches
    pub boot_root: PathBuf,

    /// Parent folder of partition mount points
    pub mount_root: PathBuf,

    /// Where mapped partitions appear
    pub device_dir: PathBuf,

    /// Upper bound on waiting for mapped partitions in milliseconds
    pub settle_timeout_ms: u64,

    /// Poll interval while waiting for mapped partitions in milliseconds
    pub settle_poll_ms: u64,

    /// Filesystem types tried in order
    pub filesystems: Vec<String>,

    pub mapper_program: String,

    pub copy_program: String,

    /// Timeout for mapping and mounting in seconds
    pub command_timeout_secs: u64,

    /// Timeout for one bulk copy in seconds
    pub copy_timeout_secs: u64,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            template_dir: PathBuf::from("/srv/bakery/templates"),
            boot_root: PathBuf::from("/srv/bakery/boot"),
            mount_root: PathBuf::from("/mnt/bakery"),
            device_dir: PathBuf::from("/dev/mapper"),
            settle_timeout_ms: 5_000,
            settle_poll_ms: 100,
            filesystems: vec!["vfat".to_string(), "ext4".to_string()],
            mapper_program: "kpartx".to_string(),
            copy_program: "rsync".to_string(),
            command_timeout_secs: 60,
            copy_timeout_secs: 3_600,
        }
    }
}

/// External power controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Executable receiving `{"piId","action"}` on stdin
    pub program: String,

    /// Extra arguments passed to the program
    pub args: Vec<String>,

    /// Timeout for one power action in seconds
    pub timeout_secs: u64,

    /// Pause between power off and power on in seconds
    pub cycle_delay_secs: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            program: "/usr/local/bin/bakery-power".to_string(),
            args: Vec::new(),
            timeout_secs: 30,
            cycle_delay_secs: 3,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name).map(PathBuf::from)
}

fn env_words(name: &str) -> Option<Vec<String>> {
    std::env::var(name)
        .ok()
        .map(|v| v.split_whitespace().map(str::to_string).collect())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BAKERY_BIND_ADDRESS") {
            config.server.bind_address = addr
                .parse()
                .with_context(|| format!("Invalid BAKERY_BIND_ADDRESS: {addr}"))?;
        }
        if let Some(mib) = env_parse("BAKERY_MAX_UPLOAD_MIB") {
            config.server.max_upload_mib = mib;
        }

        let storage = &mut config.storage;
        if let Some(path) = env_path("BAKERY_DATABASE_PATH") {
            storage.database_path = path;
        }
        if let Some(path) = env_path("BAKERY_DISK_ROOT") {
            storage.disk_root = path;
        }
        if let Some(path) = env_path("BAKERY_EXPORT_FILE") {
            storage.export_file = path;
        }
        if let Some(command) = env_words("BAKERY_EXPORT_RELOAD") {
            storage.export_reload_command = command;
        }

        let images = &mut config.images;
        if let Some(path) = env_path("BAKERY_TEMPLATE_DIR") {
            images.template_dir = path;
        }
        if let Some(path) = env_path("BAKERY_BOOT_ROOT") {
            images.boot_root = path;
        }
        if let Some(path) = env_path("BAKERY_MOUNT_ROOT") {
            images.mount_root = path;
        }
        if let Some(path) = env_path("BAKERY_DEVICE_DIR") {
            images.device_dir = path;
        }
        if let Some(ms) = env_parse("BAKERY_SETTLE_TIMEOUT_MS") {
            images.settle_timeout_ms = ms;
        }

        let power = &mut config.power;
        if let Ok(program) = std::env::var("BAKERY_POWER_PROGRAM") {
            power.program = program;
        }
        if let Some(secs) = env_parse("BAKERY_POWER_TIMEOUT") {
            power.timeout_secs = secs;
        }
        if let Some(secs) = env_parse("BAKERY_POWER_CYCLE_DELAY") {
            power.cycle_delay_secs = secs;
        }

        if let Ok(level) = std::env::var("BAKERY_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("BAKERY_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.server
            .validate()
            .map_err(|e| anyhow::anyhow!("server: {e}"))?;

        if self.images.filesystems.is_empty() {
            anyhow::bail!("images.filesystems must name at least one filesystem type");
        }

        if self.images.settle_poll_ms == 0 || self.images.settle_timeout_ms == 0 {
            anyhow::bail!("images settle timeout and poll interval must be greater than 0");
        }

        if self.power.program.trim().is_empty() {
            anyhow::bail!("power.program must not be empty");
        }

        if self.storage.disk_root == self.images.template_dir {
            anyhow::bail!("storage.disk_root and images.template_dir must differ");
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging.format must be text or json, got {}", self.logging.format);
        }

        Ok(())
    }

    /// Mount pipeline settings
    #[must_use]
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            mount_root: self.images.mount_root.clone(),
            device_dir: self.images.device_dir.clone(),
            settle_timeout: Duration::from_millis(self.images.settle_timeout_ms),
            settle_poll_interval: Duration::from_millis(self.images.settle_poll_ms),
            filesystems: self.images.filesystems.clone(),
            teardown_retry: RetryConfig::default(),
        }
    }

    /// Export file settings
    #[must_use]
    pub fn export_config(&self) -> ExportConfig {
        let mut config = ExportConfig::new(&self.storage.export_file)
            .with_reload_command(self.storage.export_reload_command.clone());
        config.reload_timeout = Duration::from_secs(self.storage.export_reload_timeout_secs);
        config
    }

    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            power_cycle_delay: Duration::from_secs(self.power.cycle_delay_secs),
        }
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.images.command_timeout_secs)
    }

    #[must_use]
    pub fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.images.copy_timeout_secs)
    }

    #[must_use]
    pub fn power_timeout(&self) -> Duration {
        Duration::from_secs(self.power.timeout_secs)
    }
}
