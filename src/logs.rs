//! Log bundling for `GET_LOG`.
//!
//! Every `*.log` file in the work directory is copied into a staging
//! directory named `<timestamp>_<hostname>_<uuid>`, the directory is packed
//! into `<stem>.tar.gz` next to it, and the archive is read back into an
//! [`Attachment`]. The staging directory and the archive are removed
//! afterwards whether or not bundling succeeded.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::ProcessRunner;
use crate::transport::Attachment;

/// Packs a directory into a compressed archive.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Archive `parent/dir_name` into `archive`, storing paths relative to `parent`.
    async fn archive(&self, parent: &Path, dir_name: &str, archive: &Path) -> Result<()>;
}

/// [`Archiver`] that shells out to the first `tar` it finds.
pub struct TarArchiver {
    runner: Arc<dyn ProcessRunner>,
    candidates: Vec<PathBuf>,
    timeout: Duration,
}

impl TarArchiver {
    pub fn new(runner: Arc<dyn ProcessRunner>, candidates: Vec<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner,
            candidates,
            timeout,
        }
    }

    fn find_tar(&self) -> Option<&Path> {
        self.candidates
            .iter()
            .map(PathBuf::as_path)
            .find(|path| path.is_file())
    }
}

#[async_trait]
impl Archiver for TarArchiver {
    #[instrument(skip(self, parent, archive), fields(archive = %archive.display()))]
    async fn archive(&self, parent: &Path, dir_name: &str, archive: &Path) -> Result<()> {
        let Some(tar) = self.find_tar() else {
            bail!(
                "Could not find tar command, tried: {}",
                self.candidates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        };

        let args = vec![
            "czf".to_string(),
            archive.to_string_lossy().into_owned(),
            "-C".to_string(),
            parent.to_string_lossy().into_owned(),
            dir_name.to_string(),
        ];
        let result = self.runner.run(tar, &args, self.timeout).await?;
        if result.exit_code != 0 {
            bail!(
                "{} exited with code {}: {}",
                tar.display(),
                result.exit_code,
                result.stderr.trim()
            );
        }
        Ok(())
    }
}

/// Builds the log archive sent in reply to `GET_LOG`.
pub struct LogBundler {
    log_dir: PathBuf,
    archiver: Arc<dyn Archiver>,
}

impl LogBundler {
    pub fn new(log_dir: impl Into<PathBuf>, archiver: Arc<dyn Archiver>) -> Self {
        Self {
            log_dir: log_dir.into(),
            archiver,
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Bundle the current log files for the agent `id` running on `hostname`.
    pub async fn bundle(&self, hostname: &str, id: Uuid) -> Result<Attachment> {
        let stem = archive_stem(Local::now(), hostname, id);
        let staging = self.log_dir.join(&stem);
        let archive = self.log_dir.join(format!("{stem}.tar.gz"));

        let result = self.build(&stem, &staging, &archive).await;

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            log_cleanup_failure(&staging, &e);
        }
        if let Err(e) = tokio::fs::remove_file(&archive).await {
            log_cleanup_failure(&archive, &e);
        }

        result
    }

    async fn build(&self, stem: &str, staging: &Path, archive: &Path) -> Result<Attachment> {
        tokio::fs::create_dir_all(staging)
            .await
            .with_context(|| format!("Could not create directory: {}", staging.display()))?;

        let copied = self.copy_logs(staging).await?;
        debug!(copied, staging = %staging.display(), "Collected log files");

        self.archiver
            .archive(&self.log_dir, stem, archive)
            .await
            .context("Could not create log archive")?;

        let data = tokio::fs::read(archive).await.with_context(|| {
            format!("Could not open archive with log files: {}", archive.display())
        })?;

        let attachment = Attachment::new(format!("{stem}.tar.gz"), data);
        info!(
            file = %attachment.file_name,
            size = attachment.file_size,
            crc32 = attachment.crc32,
            "Log archive ready"
        );
        Ok(attachment)
    }

    async fn copy_logs(&self, staging: &Path) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.log_dir)
            .await
            .with_context(|| format!("Could not list log directory: {}", self.log_dir.display()))?;

        let mut copied = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension() != Some(OsStr::new("log")) || !entry.file_type().await?.is_file() {
                continue;
            }
            let target = staging.join(entry.file_name());
            tokio::fs::copy(&path, &target)
                .await
                .with_context(|| format!("Could not copy log file: {}", path.display()))?;
            copied += 1;
        }
        Ok(copied)
    }
}

/// `<%Y-%m-%d-%H-%M-%S>_<hostname>_<uuid>`.
pub fn archive_stem(now: DateTime<Local>, hostname: &str, id: Uuid) -> String {
    format!("{}_{hostname}_{id}", now.format("%Y-%m-%d-%H-%M-%S"))
}

fn log_cleanup_failure(path: &Path, e: &io::Error) {
    if e.kind() != io::ErrorKind::NotFound {
        warn!(path = %path.display(), error = %e, "Failed to clean up log bundle");
    }
}
