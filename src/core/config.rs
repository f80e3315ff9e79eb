//! Configuration management for Falcon Defender.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scan-related settings
    pub scan: ScanConfig,
    /// Rule source settings
    pub rules: RulesConfig,
    /// Quarantine settings
    pub quarantine: QuarantineConfig,
    /// Event stream settings
    pub events: EventConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigLoad(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&contents).map_err(|e| {
            Error::ConfigLoad(format!("Failed to parse config file: {}", e))
        })?;
        config.scan.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigSave(format!("Failed to create config directory: {}", e))
            })?;
        }

        std::fs::write(path, contents).map_err(|e| {
            Error::ConfigSave(format!("Failed to write config file: {}", e))
        })
    }

    /// Load configuration from default location, or create default if not exists.
    pub fn load_or_default() -> Self {
        let config_path = Self::default_config_path();

        if config_path.exists() {
            match Self::load(&config_path) {
                Ok(config) => return config,
                Err(e) => {
                    log::warn!("Failed to load config, using defaults: {}", e);
                }
            }
        }

        let config = Self::default();

        if let Err(e) = config.save(&config_path) {
            log::warn!("Failed to save default config: {}", e);
        }

        config
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> PathBuf {
        Self::data_dir().join("config.json")
    }

    /// Get the application data directory.
    pub fn data_dir() -> PathBuf {
        #[cfg(windows)]
        {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("C:\\ProgramData"))
                .join("FalconDefender")
        }

        #[cfg(not(windows))]
        {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("falcon-defender")
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.scan.scan_threads == 0 {
            return Err(Error::ConfigInvalid {
                field: "scan.scan_threads".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.scan.match_timeout_secs == 0 {
            return Err(Error::ConfigInvalid {
                field: "scan.match_timeout_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.events.channel_capacity == 0 {
            return Err(Error::ConfigInvalid {
                field: "events.channel_capacity".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.logging.keep_logs_days == 0 {
            return Err(Error::ConfigInvalid {
                field: "logging.keep_logs_days".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

/// Scan-related configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Skip files larger than this size (MB). A file of exactly this size is scanned.
    pub max_file_size_mb: u64,
    /// When non-empty, only these extensions are scanned
    pub allowed_extensions: Vec<String>,
    /// Extensions that are never scanned
    pub blocked_extensions: Vec<String>,
    /// Directory prefixes that are never scanned
    pub protected_paths: Vec<PathBuf>,
    /// Number of parallel match workers
    pub scan_threads: usize,
    /// Per-file matching timeout (seconds)
    pub match_timeout_secs: u64,
    /// Whether to follow symbolic links during directory walks
    pub follow_symlinks: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 100,
            allowed_extensions: Vec::new(),
            blocked_extensions: vec!["tmp".to_string(), "log".to_string(), "bak".to_string()],
            protected_paths: default_protected_paths(),
            scan_threads: num_cpus(),
            match_timeout_secs: 60,
            follow_symlinks: false,
        }
    }
}

impl ScanConfig {
    /// Size ceiling in bytes.
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    /// Lower-case extension lists and strip leading dots.
    pub fn normalize(&mut self) {
        for list in [&mut self.allowed_extensions, &mut self.blocked_extensions] {
            for ext in list.iter_mut() {
                *ext = normalize_extension(ext);
            }
            list.retain(|e| !e.is_empty());
        }
    }
}

/// Normalize an extension for comparison (`.EXE` -> `exe`).
pub fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

fn default_protected_paths() -> Vec<PathBuf> {
    #[cfg(windows)]
    {
        vec![
            PathBuf::from("C:\\Windows\\WinSxS"),
            PathBuf::from("C:\\$Recycle.Bin"),
        ]
    }

    #[cfg(not(windows))]
    {
        vec![
            PathBuf::from("/proc"),
            PathBuf::from("/sys"),
            PathBuf::from("/dev"),
        ]
    }
}

/// Rule source configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Directory holding `.yar`/`.yara` sources and the compiled cache
    pub rules_dir: Option<PathBuf>,
}

impl RulesConfig {
    /// Get the effective rules directory.
    pub fn rules_dir(&self) -> PathBuf {
        self.rules_dir
            .clone()
            .unwrap_or_else(|| Config::data_dir().join("rules"))
    }
}

/// Quarantine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantineConfig {
    /// Path for quarantine vault
    pub vault_path: Option<PathBuf>,
    /// Overwrite stored files before unlinking them on delete
    pub secure_delete: bool,
    /// Overwrite passes used by secure delete
    pub overwrite_passes: u32,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            vault_path: None,
            secure_delete: false,
            overwrite_passes: 1,
        }
    }
}

impl QuarantineConfig {
    /// Get the effective quarantine directory.
    pub fn quarantine_dir(&self) -> PathBuf {
        self.vault_path
            .clone()
            .unwrap_or_else(|| Config::data_dir().join("quarantine"))
    }
}

/// Event stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Events buffered per subscriber before the oldest are dropped
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Days to keep log files
    pub keep_logs_days: u32,
    /// Path for log files
    pub log_path: Option<PathBuf>,
    /// Also write log lines to a file under the log directory
    pub log_to_file: bool,
    /// Enable verbose console output
    pub verbose_console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            keep_logs_days: 30,
            log_path: None,
            log_to_file: false,
            verbose_console: false,
        }
    }
}

impl LoggingConfig {
    /// Get the effective log directory.
    pub fn log_dir(&self) -> PathBuf {
        self.log_path
            .clone()
            .unwrap_or_else(|| Config::data_dir().join("logs"))
    }
}

/// Get the number of CPUs, with a reasonable default.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scan.max_file_size_mb, 100);
        assert_eq!(config.scan.match_timeout_secs, 60);
        assert_eq!(config.scan.blocked_extensions, vec!["tmp", "log", "bak"]);
        assert!(config.scan.allowed_extensions.is_empty());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test_config.json");

        let mut config = Config::default();
        config.scan.max_file_size_mb = 12;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.scan.max_file_size_mb, 12);
        assert_eq!(loaded.events.channel_capacity, config.events.channel_capacity);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(
            &path,
            r#"{ "scan": { "blocked_extensions": [".TMP", "Exe", ""] } }"#,
        )
        .unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.scan.blocked_extensions, vec!["tmp", "exe"]);
        assert_eq!(loaded.scan.max_file_size_mb, 100);
        assert_eq!(loaded.quarantine.overwrite_passes, 1);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = Config::default();
        config.scan.scan_threads = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::ConfigInvalid { ref field, .. }) if field == "scan.scan_threads"
        ));

        let mut config = Config::default();
        config.events.channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "scan": { "match_timeout_secs": 0 } }"#).unwrap();
        assert!(Config::load(&path).is_err());

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::ConfigLoad(_))));
    }

    #[test]
    fn test_size_ceiling_bytes() {
        let config = ScanConfig {
            max_file_size_mb: 2,
            ..ScanConfig::default()
        };
        assert_eq!(config.max_file_size_bytes(), 2 * 1024 * 1024);
        assert_eq!(normalize_extension(" .YAR "), "yar");
    }
}
