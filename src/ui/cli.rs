//! Command-line interface definition.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Falcon Defender: rule-based malware scanner with a quarantine vault
#[derive(Parser, Debug)]
#[command(name = "falcon-defender")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json)
    #[arg(long, default_value = "text", global = true)]
    pub format: OutputFormat,

    /// Configuration file to use instead of the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine processing
    Json,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan a file or directory
    Scan {
        /// Root to scan
        path: PathBuf,

        /// Skip files unchanged since the previous scan in this process
        #[arg(short, long)]
        incremental: bool,

        /// Move matched files into the quarantine vault
        #[arg(short, long)]
        quarantine: bool,
    },

    /// Manage quarantined items
    Quarantine {
        #[command(subcommand)]
        action: QuarantineAction,
    },

    /// Inspect or reload detection rules
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show application information
    Info,
}

/// Quarantine subcommands.
#[derive(Subcommand, Debug)]
pub enum QuarantineAction {
    /// List quarantined items
    List,

    /// Restore a quarantined item to its original location
    Restore {
        /// ID of item to restore
        id: i64,
    },

    /// Delete a quarantined item permanently
    Delete {
        /// ID of item to delete
        id: i64,
    },
}

/// Rule subcommands.
#[derive(Subcommand, Debug)]
pub enum RulesAction {
    /// Show the active rule set
    Show,

    /// Recompile if the rule sources changed
    Reload,
}

/// Configuration subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Reset configuration to defaults
    Reset {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Print the configuration file location
    Path,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_flags() {
        let cli = Cli::try_parse_from([
            "falcon-defender",
            "scan",
            "/tmp/data",
            "--incremental",
            "-q",
            "--format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Some(Commands::Scan {
                path,
                incremental,
                quarantine,
            }) => {
                assert_eq!(path, PathBuf::from("/tmp/data"));
                assert!(incremental);
                assert!(quarantine);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_quarantine_ids_are_numeric() {
        let cli = Cli::try_parse_from(["falcon-defender", "quarantine", "restore", "7"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Quarantine {
                action: QuarantineAction::Restore { id: 7 }
            })
        ));
        assert!(Cli::try_parse_from(["falcon-defender", "quarantine", "delete", "abc"]).is_err());
    }

    #[test]
    fn test_global_options() {
        let cli = Cli::try_parse_from([
            "falcon-defender",
            "rules",
            "reload",
            "--config",
            "/etc/falcon.json",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/falcon.json")));
        assert!(matches!(
            cli.command,
            Some(Commands::Rules {
                action: RulesAction::Reload
            })
        ));
    }

    #[test]
    fn test_scan_requires_path() {
        assert!(Cli::try_parse_from(["falcon-defender", "scan"]).is_err());
    }
}
