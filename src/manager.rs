//! Connection manager.
//!
//! Owns the agent's run: starts the watchdog, reads the commander endpoint
//! from the server-info file, opens one [`Channel`], wires a
//! [`CommanderSession`] into it and waits until the channel ends or a
//! termination signal arrives. There is no reconnect: a failed connect is
//! reported and `run` returns.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerInfo;
use crate::context::AgentContext;
use crate::session::CommanderSession;
use crate::transport::{Channel, ChannelExit};
use crate::watchdog::WatchdogEntry;

pub struct ConnectionManager {
    ctx: Arc<AgentContext>,
    stop: CancellationToken,
    channels: Mutex<Vec<CancellationToken>>,
}

impl ConnectionManager {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self {
            ctx,
            stop: CancellationToken::new(),
            channels: Mutex::new(Vec::new()),
        }
    }

    pub const fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    /// Run the agent until its commander channel ends.
    ///
    /// SIGINT, SIGTERM and SIGQUIT all take the same path as [`stop`](Self::stop).
    pub async fn run(&self) -> Result<ChannelExit> {
        let mut signals = ShutdownSignals::register().context("Failed to install signal handlers")?;
        let watchdog = self.ctx.watchdog.start(self.stop.clone());
        info!(
            interval_secs = self.ctx.watchdog.interval().as_secs_f64(),
            "Watchdog started"
        );

        let serve = self.serve();
        tokio::pin!(serve);
        let result = loop {
            tokio::select! {
                result = &mut serve => break result,
                name = signals.recv() => {
                    info!(signal = name, "Received signal, shutting down");
                    self.stop();
                }
            }
        };

        match &result {
            Ok(exit) => info!(?exit, "Commander channel finished"),
            Err(e) => error!(error = %format!("{e:#}"), "Agent stopped with an error"),
        }

        self.stop();
        if let Err(e) = watchdog.await {
            warn!(error = %e, "Watchdog task failed");
        }
        result
    }

    async fn serve(&self) -> Result<ChannelExit> {
        let path = self.ctx.config.server_info_file();
        let server = ServerInfo::from_file(&path)?;
        info!(host = %server.host, port = server.port, "Contacting DDS commander");

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((server.host.as_str(), server.port))
            .await
            .with_context(|| format!("Cannot resolve commander host {}", server.host))?
            .collect();

        let channel = tokio::select! {
            () = self.stop.cancelled() => return Ok(ChannelExit::Stopped),
            channel = Channel::connect(&addrs) => channel.with_context(|| {
                format!("Cannot connect to commander at {}:{}", server.host, server.port)
            })?,
        };
        self.track(channel.stop_token());
        info!(peer = %channel.peer(), "Connected to commander");

        let mut session = CommanderSession::new(
            Arc::clone(&self.ctx),
            channel.outbox(),
            channel.peer(),
            channel.local_addr(),
        );
        let watchdog = Arc::clone(&self.ctx.watchdog);
        session.on_new_user_task(move |pid| watchdog.register(WatchdogEntry::for_task(pid)));

        Ok(channel.run(&mut session).await?)
    }

    fn track(&self, channel: CancellationToken) {
        let mut channels = self.lock_channels();
        if self.stop.is_cancelled() {
            channel.cancel();
        }
        channels.push(channel);
    }

    /// Stop the run loop and every open channel. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
        let channels: Vec<_> = self.lock_channels().drain(..).collect();
        if !channels.is_empty() {
            debug!(count = channels.len(), "Stopping channels");
        }
        for channel in channels {
            channel.cancel();
        }
    }

    fn lock_channels(&self) -> MutexGuard<'_, Vec<CancellationToken>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
}

impl ShutdownSignals {
    fn register() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.quit.recv() => "SIGQUIT",
        }
    }
}
