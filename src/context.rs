//! Shared agent state.

use std::sync::Arc;

use tracing::info;

use crate::backend::{LocalRunner, ProcessRunner};
use crate::config::AgentConfig;
use crate::identity::IdentityStore;
use crate::logs::{Archiver, LogBundler, TarArchiver};
use crate::watchdog::WatchdogRegistry;

/// Everything the connection manager and the protocol handler share.
///
/// Built once in `main` (or per test) and passed around behind an `Arc`.
pub struct AgentContext {
    pub config: AgentConfig,
    pub identity: IdentityStore,
    pub watchdog: Arc<WatchdogRegistry>,
    pub runner: Arc<dyn ProcessRunner>,
    pub logs: LogBundler,
}

impl AgentContext {
    /// Production wiring: local processes, `tar` for log archives.
    pub fn new(config: AgentConfig) -> Self {
        let runner: Arc<dyn ProcessRunner> = Arc::new(LocalRunner::new());
        let archiver = Arc::new(TarArchiver::new(
            Arc::clone(&runner),
            config.tar_candidates.clone(),
            config.archive_timeout(),
        ));
        Self::with_parts(config, runner, archiver, || info!("Idle callback called"))
    }

    pub fn with_parts(
        config: AgentConfig,
        runner: Arc<dyn ProcessRunner>,
        archiver: Arc<dyn Archiver>,
        idle_hook: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let identity = IdentityStore::new(config.identity_file());
        let watchdog = Arc::new(WatchdogRegistry::new(config.idle_interval(), idle_hook));
        let logs = LogBundler::new(config.work_dir.clone(), archiver);
        Self {
            config,
            identity,
            watchdog,
            runner,
            logs,
        }
    }
}
