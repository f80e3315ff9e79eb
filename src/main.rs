//! Falcon Defender command-line driver.

use falcon_defender::core::config::Config;
use falcon_defender::core::error::Result;
use falcon_defender::detection::RuleStore;
use falcon_defender::quarantine::QuarantineVault;
use falcon_defender::scanner::{
    ConsoleProgressReporter, ScanCoordinator, ScanEvent, ScanSummary,
};
use falcon_defender::ui::cli::{
    Cli, Commands, ConfigAction, OutputFormat, QuarantineAction, RulesAction,
};
use falcon_defender::utils::logging::{cleanup_old_logs, init_logging, LogConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            if let Some(hint) = e.suggestion() {
                eprintln!("Hint: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse_args();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_config_path);
    let config = load_config(&config_path, cli.config.is_some())?;

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::from_config(&config)
    };
    init_logging(log_config)?;
    if config.logging.log_to_file {
        if let Err(e) = cleanup_old_logs(&config.logging.log_dir(), config.logging.keep_logs_days) {
            log::debug!("Log cleanup skipped: {}", e);
        }
    }

    log::info!("Falcon Defender v{}", env!("CARGO_PKG_VERSION"));
    let config = Arc::new(config);

    match cli.command {
        Some(Commands::Scan {
            path,
            incremental,
            quarantine,
        }) => run_scan(config, path, incremental, quarantine, cli.verbose, cli.format).await,
        Some(Commands::Quarantine { action }) => run_quarantine(config, action, cli.format).await,
        Some(Commands::Rules { action }) => run_rules(&config, action, cli.format),
        Some(Commands::Config { action }) => run_config(action, &config, &config_path),
        Some(Commands::Info) => run_info(&config, &config_path),
        None => {
            println!("Falcon Defender - Rule-Based Malware Scanner");
            println!();
            println!("Use --help for usage information");
            println!();
            println!("Quick start:");
            println!("  falcon-defender scan <path>             Scan a file or directory");
            println!("  falcon-defender scan <path> --quarantine  Scan and contain matches");
            println!("  falcon-defender quarantine list          View quarantined items");
            println!("  falcon-defender rules reload             Reload changed rules");
            Ok(())
        }
    }
}

/// An explicit `--config` must load; the default location falls back to defaults.
fn load_config(path: &Path, explicit: bool) -> Result<Config> {
    if explicit {
        return Config::load(path);
    }
    Ok(Config::load_or_default())
}

fn open_rules(config: &Config) -> Result<Arc<RuleStore>> {
    Ok(Arc::new(RuleStore::open(config.rules.rules_dir())?))
}

fn build_coordinator(config: Arc<Config>) -> Result<Arc<ScanCoordinator>> {
    let rules = open_rules(&config)?;
    let vault = match QuarantineVault::from_config(&config.quarantine) {
        Ok(vault) => Some(Arc::new(vault)),
        Err(e) => {
            log::warn!("Quarantine vault unavailable: {}", e);
            None
        }
    };
    Ok(Arc::new(ScanCoordinator::new(config, rules, vault)))
}

/// Run one scan session, printing progress until it finishes.
async fn run_scan(
    config: Arc<Config>,
    path: PathBuf,
    incremental: bool,
    quarantine: bool,
    verbose: bool,
    format: OutputFormat,
) -> Result<()> {
    let coordinator = build_coordinator(config)?;
    let reporter = if verbose {
        ConsoleProgressReporter::new().verbose()
    } else {
        ConsoleProgressReporter::new()
    };
    let show_progress = format == OutputFormat::Text;

    let mut events = coordinator.subscribe();
    let handle = coordinator.start(&path, incremental, quarantine)?;
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut cancelling = false;

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(envelope) => match envelope.event {
                    ScanEvent::Match(record) => reporter.report_match(&record),
                    ScanEvent::Error { path: Some(path), message } => {
                        log::debug!("{}: {}", path.display(), message);
                    }
                    ScanEvent::Done(_) => break,
                    _ => {}
                },
                Err(RecvError::Lagged(missed)) => log::debug!("Missed {} scan event(s)", missed),
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick(), if show_progress => {
                if let Some(progress) = coordinator.status().progress {
                    reporter.report("Scanning", &progress);
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancelling => {
                cancelling = true;
                eprintln!("\nCancelling scan...");
                coordinator.cancel()?;
            }
        }
    }
    reporter.finish();

    let summary = handle.wait().await?;
    print_summary(&summary, format)
}

fn print_summary(summary: &ScanSummary, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(summary)?);
        }
        OutputFormat::Text => {
            println!();
            println!("=== Scan {} ===", summary.outcome);
            println!("Session ID:      {}", summary.session_id);
            println!("Root:            {}", summary.root.display());
            println!("Files Found:     {}", summary.files_discovered);
            println!("Files Scanned:   {}", summary.files_considered);
            println!("Files Skipped:   {}", summary.files_skipped);
            println!(
                "Matches:         {} in {} file(s)",
                summary.matches.len(),
                summary.matched_files()
            );
            println!("Errors:          {}", summary.errors.len());
            println!("Duration:        {:.1} seconds", summary.duration().as_secs_f64());

            if !summary.matches.is_empty() {
                println!();
                for record in &summary.matches {
                    println!(
                        "  [{}] {} - {} ({})",
                        record.severity,
                        record.rule_name,
                        record.file_path.display(),
                        record.action
                    );
                }
            }
        }
    }
    Ok(())
}

/// Manage quarantine.
async fn run_quarantine(
    config: Arc<Config>,
    action: QuarantineAction,
    format: OutputFormat,
) -> Result<()> {
    let coordinator = build_coordinator(config)?;

    match action {
        QuarantineAction::List => {
            let records = coordinator.list_quarantined().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
                OutputFormat::Text if records.is_empty() => println!("Quarantine is empty."),
                OutputFormat::Text => {
                    for record in &records {
                        println!(
                            "{}  {}",
                            record.quarantined_at.format("%Y-%m-%d %H:%M:%S"),
                            record
                        );
                    }
                    println!();
                    println!("{} item(s) in quarantine", records.len());
                }
            }
        }
        QuarantineAction::Restore { id } => {
            let record = coordinator.restore_quarantined(id).await?;
            println!("Restored #{} to {}", id, record.original_path.display());
        }
        QuarantineAction::Delete { id } => {
            let record = coordinator.delete_quarantined(id).await?;
            println!("Deleted #{} ({})", id, record.original_path.display());
        }
    }
    Ok(())
}

/// Show or reload the rule set.
fn run_rules(config: &Config, action: RulesAction, format: OutputFormat) -> Result<()> {
    let store = open_rules(config)?;

    if let RulesAction::Reload = action {
        if store.reload_if_changed()? {
            println!("Rules reloaded.");
        } else {
            println!("Rules unchanged.");
        }
    }

    let active = store.active();
    match format {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "rules_dir": store.rules_dir(),
                "fingerprint": store.fingerprint().map(|f| f.as_str().to_string()),
                "rules": active.as_ref().map(|set| set.rule_names()).unwrap_or_default(),
                "compilations": store.compilations(),
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Text => {
            println!("Rules Directory:  {}", store.rules_dir().display());
            match &active {
                Some(set) => {
                    println!("Fingerprint:      {}", set.fingerprint);
                    println!("Compiled At:      {}", set.compiled_at.format("%Y-%m-%d %H:%M:%S"));
                    println!("Sources:          {}", set.sources.len());
                    println!("Rules:            {}", set.rule_count());
                    for name in set.rule_names() {
                        println!("  {}", name);
                    }
                }
                None => println!("No active rule set."),
            }
        }
    }
    Ok(())
}

/// Handle configuration commands.
fn run_config(action: ConfigAction, config: &Config, config_path: &Path) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        ConfigAction::Reset { yes } => {
            if !yes {
                println!("This replaces {} with defaults.", config_path.display());
                println!("Re-run with --yes to confirm.");
                return Ok(());
            }
            log::info!("Resetting configuration to defaults");
            Config::default().save(config_path)?;
            println!("Configuration reset to defaults.");
        }
        ConfigAction::Path => {
            println!("{}", config_path.display());
        }
    }
    Ok(())
}

/// Show application information.
fn run_info(config: &Config, config_path: &Path) -> Result<()> {
    println!("Falcon Defender - Rule-Based Malware Scanner");
    println!();
    println!("Version:          {}", env!("CARGO_PKG_VERSION"));
    println!("Config Path:      {}", config_path.display());
    println!("Data Directory:   {}", Config::data_dir().display());
    println!("Log Directory:    {}", config.logging.log_dir().display());
    println!("Rules Directory:  {}", config.rules.rules_dir().display());
    println!("Quarantine Path:  {}", config.quarantine.quarantine_dir().display());
    println!();
    println!("Scan Settings:");
    println!("  Max File Size:  {} MB", config.scan.max_file_size_mb);
    println!("  Threads:        {}", config.scan.scan_threads);
    println!("  Match Timeout:  {} s", config.scan.match_timeout_secs);
    println!("  Symlinks:       {}", config.scan.follow_symlinks);
    println!("  Blocked:        {}", config.scan.blocked_extensions.join(", "));
    Ok(())
}
