//! Logging infrastructure for Falcon Defender.

use crate::core::config::Config;
use crate::core::error::{Error, Result};
use chrono::Local;
use env_logger::{Builder, Target};
use log::LevelFilter;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Logging configuration.
pub struct LogConfig {
    /// Log level
    pub level: LevelFilter,
    /// Enable console output
    pub console: bool,
    /// Enable file output
    pub file: bool,
    /// Log file path
    pub file_path: Option<PathBuf>,
    /// Show timestamps
    pub timestamps: bool,
    /// Show module path
    pub module_path: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            console: true,
            file: false,
            file_path: None,
            timestamps: true,
            module_path: false,
        }
    }
}

impl LogConfig {
    /// Create a log config from application config.
    pub fn from_config(config: &Config) -> Self {
        let level = parse_level(&config.logging.log_level);
        let level = if config.logging.verbose_console && level < LevelFilter::Debug {
            LevelFilter::Debug
        } else {
            level
        };

        Self {
            level,
            console: true,
            file: config.logging.log_to_file,
            file_path: Some(config.logging.log_dir().join("falcon-defender.log")),
            timestamps: true,
            module_path: level == LevelFilter::Debug || level == LevelFilter::Trace,
        }
    }

    /// Create a verbose log config for CLI.
    pub fn verbose() -> Self {
        Self {
            level: LevelFilter::Debug,
            console: true,
            file: false,
            file_path: None,
            timestamps: true,
            module_path: true,
        }
    }

    /// Create a quiet log config (errors only).
    pub fn quiet() -> Self {
        Self {
            level: LevelFilter::Error,
            console: true,
            file: false,
            file_path: None,
            timestamps: false,
            module_path: false,
        }
    }
}

fn parse_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// Writes every log line to stderr and to a log file.
struct TeeWriter {
    console: bool,
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.console {
            io::stderr().write_all(buf)?;
        }
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.console {
            io::stderr().flush()?;
        }
        self.file.flush()
    }
}

/// Initialize the logging system.
///
/// Installing a second logger is ignored with a debug message, so tests and
/// embedding applications can call this freely.
pub fn init_logging(config: LogConfig) -> Result<()> {
    let mut builder = Builder::new();
    builder.filter_level(config.level);

    let log_file = if config.file {
        match &config.file_path {
            Some(path) => Some(open_log_file(path)?),
            None => None,
        }
    } else {
        None
    };
    // ANSI colors only make sense on a terminal
    let colored = log_file.is_none();

    let timestamps = config.timestamps;
    let module_path = config.module_path;
    builder.format(move |buf, record| {
        let mut output = String::new();

        if timestamps {
            output.push_str(&format!("{} ", Local::now().format("%Y-%m-%d %H:%M:%S")));
        }

        let level_str = match (record.level(), colored) {
            (log::Level::Error, true) => "\x1b[31mERROR\x1b[0m",
            (log::Level::Warn, true) => "\x1b[33mWARN\x1b[0m ",
            (log::Level::Info, true) => "\x1b[32mINFO\x1b[0m ",
            (log::Level::Debug, true) => "\x1b[34mDEBUG\x1b[0m",
            (log::Level::Trace, true) => "\x1b[35mTRACE\x1b[0m",
            (log::Level::Error, false) => "ERROR",
            (log::Level::Warn, false) => "WARN ",
            (log::Level::Info, false) => "INFO ",
            (log::Level::Debug, false) => "DEBUG",
            (log::Level::Trace, false) => "TRACE",
        };
        output.push_str(&format!("[{}] ", level_str));

        if module_path {
            if let Some(path) = record.module_path() {
                output.push_str(&format!("{}: ", path));
            }
        }

        output.push_str(&format!("{}", record.args()));

        writeln!(buf, "{}", output)
    });

    match log_file {
        Some(file) => {
            builder.target(Target::Pipe(Box::new(TeeWriter {
                console: config.console,
                file,
            })));
        }
        None if !config.console => {
            builder.filter_level(LevelFilter::Off);
        }
        None => {
            builder.target(Target::Stderr);
        }
    }

    if let Err(e) = builder.try_init() {
        log::debug!("Logger already initialized: {}", e);
        return Ok(());
    }

    log::debug!("Logging initialized with level: {:?}", config.level);
    Ok(())
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::DirectoryAccess {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::file_write(path, e))
}

/// Clean up old log files.
pub fn cleanup_old_logs(log_dir: &Path, keep_days: u32) -> Result<u32> {
    use std::time::{Duration, SystemTime};

    let cutoff = SystemTime::now() - Duration::from_secs(keep_days as u64 * 24 * 60 * 60);
    let mut deleted = 0u32;

    if !log_dir.exists() {
        return Ok(0);
    }

    let entries = fs::read_dir(log_dir).map_err(|e| Error::DirectoryAccess {
        path: log_dir.to_path_buf(),
        source: e,
    })?;

    for entry in entries.flatten() {
        let path = entry.path();

        if path.extension().is_some_and(|ext| ext == "log") {
            if let Ok(metadata) = entry.metadata() {
                if let Ok(modified) = metadata.modified() {
                    if modified < cutoff && fs::remove_file(&path).is_ok() {
                        log::debug!("Deleted old log file: {:?}", path);
                        deleted += 1;
                    }
                }
            }
        }
    }

    if deleted > 0 {
        log::info!("Cleaned up {} old log file(s)", deleted);
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, LevelFilter::Info);
        assert!(config.console);
        assert!(!config.file);
    }

    #[test]
    fn test_log_config_verbose() {
        let config = LogConfig::verbose();
        assert_eq!(config.level, LevelFilter::Debug);
        assert!(config.module_path);
    }

    #[test]
    fn test_log_config_quiet() {
        let config = LogConfig::quiet();
        assert_eq!(config.level, LevelFilter::Error);
        assert!(!config.timestamps);
    }

    #[test]
    fn test_log_config_from_config() {
        let mut app = Config::default();
        app.logging.log_level = "warning".to_string();
        app.logging.log_path = Some(PathBuf::from("/var/log/falcon"));
        let config = LogConfig::from_config(&app);
        assert_eq!(config.level, LevelFilter::Warn);
        assert!(!config.file);
        assert_eq!(
            config.file_path,
            Some(PathBuf::from("/var/log/falcon/falcon-defender.log"))
        );

        app.logging.verbose_console = true;
        assert_eq!(LogConfig::from_config(&app).level, LevelFilter::Debug);
    }

    #[test]
    fn test_cleanup_keeps_recent_logs() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("today.log"), "x").unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let deleted = cleanup_old_logs(dir.path(), 30).unwrap();
        assert_eq!(deleted, 0);
        assert!(dir.path().join("today.log").exists());

        assert_eq!(cleanup_old_logs(&dir.path().join("missing"), 30).unwrap(), 0);
    }
}
