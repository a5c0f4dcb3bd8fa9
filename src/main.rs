//! dds-agent
//!
//! Connects to the DDS commander named in the server-info file, answers its
//! commands and runs the user task it assigns.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use dds_agent::config::AgentConfig;
use dds_agent::context::AgentContext;
use dds_agent::manager::ConnectionManager;

#[derive(Parser, Debug)]
#[command(name = "dds-agent")]
#[command(about = "DDS agent: runs user tasks on behalf of a DDS commander")]
struct Args {
    /// JSON configuration file (default: $DDS_AGENT_CONFIG, then built-in defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Work directory for logs, server info and the agent UUID
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path),
        None => AgentConfig::from_env(),
    }
    .context("Failed to load configuration")?;
    if let Some(dir) = args.work_dir {
        config.work_dir = dir;
    }
    std::fs::create_dir_all(&config.work_dir).with_context(|| {
        format!("Failed to create work directory {}", config.work_dir.display())
    })?;

    let _log_guard = init_logging(&args.log_level, &config.log_file())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        work_dir = %config.work_dir.display(),
        pid = std::process::id(),
        "Starting DDS agent"
    );

    let manager = ConnectionManager::new(Arc::new(AgentContext::new(config)));
    match manager.run().await {
        Ok(exit) => {
            info!(?exit, "DDS agent finished");
            Ok(ExitCode::SUCCESS)
        }
        // already logged by the manager
        Err(_) => Ok(ExitCode::FAILURE),
    }
}

/// Log to stderr and append to the agent log file in the work directory.
///
/// File writes go through a background worker; the returned guard flushes
/// it on drop and must live until the agent exits.
fn init_logging(level: &str, log_file: &Path) -> Result<WorkerGuard> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Failed to open log file {}", log_file.display()))?;

    let (file_writer, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_log_is_flushed_when_guard_drops() {
        let dir = tempfile::tempdir().unwrap();
        let log_file = dir.path().join("dds-agent.log");
        std::fs::write(&log_file, "earlier run\n").unwrap();

        let guard = init_logging("info", &log_file).unwrap();
        tracing::warn!(task = "wrf", "Task finished with errors");
        drop(guard);

        let text = std::fs::read_to_string(&log_file).unwrap();
        assert!(text.starts_with("earlier run\n"));
        assert!(text.contains("Task finished with errors"));
        assert!(text.contains("task=\"wrf\""));
        assert!(!text.contains('\u{1b}'));
    }
}
