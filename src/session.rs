//! Commander session: the agent side of the DDS protocol.
//!
//! A [`CommanderSession`] is the [`Dispatcher`] plugged into a
//! [`Channel`](crate::transport::Channel). It decodes each frame into a
//! [`Message`], runs the matching handler and queues replies on the
//! channel's [`Outbox`]. Command-local failures become replies; only
//! identity and codec failures are returned as [`ChannelError`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::expand_path;
use crate::context::AgentContext;
use crate::error::ChannelError;
use crate::transport::protocol::{
    DownloadStat, HostInfo, Severity, SimpleMsg, UserTask, UuidBody, VersionInfo,
};
use crate::transport::{Attachment, Command, Dispatcher, Flow, Frame, FrameContext, Message, Outbox};

/// Lifecycle of one commander connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

type TaskListener = Box<dyn Fn(u32) + Send + Sync>;

/// Protocol handler for one commander connection.
pub struct CommanderSession {
    ctx: Arc<AgentContext>,
    outbox: Outbox,
    peer: SocketAddr,
    local: SocketAddr,
    state: SessionState,
    id: Uuid,
    handshake_complete: bool,
    user_task: Option<String>,
    task_pid: Option<u32>,
    on_new_task: Option<TaskListener>,
    decommissioned: bool,
}

impl CommanderSession {
    pub fn new(ctx: Arc<AgentContext>, outbox: Outbox, peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            ctx,
            outbox,
            peer,
            local,
            state: SessionState::Connecting,
            id: Uuid::nil(),
            handshake_complete: false,
            user_task: None,
            task_pid: None,
            on_new_task: None,
            decommissioned: false,
        }
    }

    /// Called with the pid of every user task this session starts.
    pub fn on_new_user_task(&mut self, listener: impl Fn(u32) + Send + Sync + 'static) {
        self.on_new_task = Some(Box::new(listener));
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub const fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    /// Task path assigned with `ASSIGN_USER_TASK`, not yet expanded.
    pub fn pending_task(&self) -> Option<&str> {
        self.user_task.as_deref()
    }

    /// Pid of the most recently started user task.
    pub const fn task_pid(&self) -> Option<u32> {
        self.task_pid
    }

    fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let frame = message.encode()?;
        if !self.outbox.push(frame) {
            debug!(command = %message.command(), "Channel closed, reply dropped");
        }
        Ok(())
    }

    fn on_handshake_ok(&mut self) -> Flow {
        self.handshake_complete = true;
        self.state = SessionState::Active;
        info!(peer = %self.peer, "Handshake completed");
        Flow::Continue
    }

    fn on_simple_msg(&self, msg: &SimpleMsg) -> Flow {
        let source = msg.src_command.map(|c| c.name());
        match msg.severity {
            Severity::Debug => debug!(?source, "Commander: {}", msg.text),
            Severity::Info | Severity::Unknown => info!(?source, "Commander: {}", msg.text),
            Severity::Warning => warn!(?source, "Commander: {}", msg.text),
            Severity::Error | Severity::Fatal => error!(?source, "Commander: {}", msg.text),
        }
        Flow::Continue
    }

    fn on_get_host_info(&self) -> Result<Flow, ChannelError> {
        let info = HostInfo {
            username: username(),
            hostname: hostname(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            install_path: self.ctx.config.work_dir.to_string_lossy().into_owned(),
            agent_pid: std::process::id(),
            agent_port: self.local.port(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        self.send(&Message::ReplyHostInfo(info))?;
        Ok(Flow::Continue)
    }

    fn on_get_uuid(&mut self) -> Result<Flow, ChannelError> {
        self.id = self.ctx.identity.load()?;
        self.send(&Message::ReplyUuid(UuidBody { id: self.id }))?;
        Ok(Flow::Continue)
    }

    fn on_set_uuid(&mut self, body: UuidBody) -> Result<Flow, ChannelError> {
        info!(id = %body.id, peer = %self.peer, "Commander assigned agent UUID");
        self.ctx.identity.store(body.id)?;
        self.id = body.id;
        Ok(Flow::Continue)
    }

    fn on_binary_attachment(&self, file: &Attachment, at: FrameContext) -> Result<Flow, ChannelError> {
        let stat = download_stat(file, at);
        if !file.is_intact() {
            warn!(
                file = %file.file_name,
                expected = file.crc32,
                received = stat.received_crc32,
                "Received binary has wrong checksum"
            );
        }
        info!(file = %file.file_name, size = stat.received_file_size, "Received binary attachment");
        self.send(&Message::BinaryDownloadStat(stat))?;
        Ok(Flow::Continue)
    }

    async fn on_get_log(&self) -> Result<Flow, ChannelError> {
        match self.ctx.logs.bundle(&hostname(), self.id).await {
            Ok(archive) => self.send(&Message::BinaryAttachmentLog(archive))?,
            Err(e) => {
                let text = format!("{e:#}");
                error!(error = %text, "Failed to bundle log files");
                self.send(&Message::GetLogError(
                    SimpleMsg::error(text).in_reply_to(Command::GetLog),
                ))?;
            }
        }
        Ok(Flow::Continue)
    }

    fn on_download_test(&self, file: &Attachment, at: FrameContext) -> Result<Flow, ChannelError> {
        let stat = download_stat(file, at);
        if file.is_intact() {
            self.send(&Message::DownloadTestStat(stat))?;
        } else {
            let text = format!(
                "Received binary has wrong checksum: {} instead of {} | size: {} name: {}",
                stat.received_crc32, file.crc32, stat.received_file_size, file.file_name
            );
            warn!("{text}");
            self.send(&Message::DownloadTestError(
                SimpleMsg::error(text).in_reply_to(Command::DownloadTest),
            ))?;
        }
        Ok(Flow::Continue)
    }

    fn on_assign_user_task(&mut self, task: UserTask) -> Flow {
        info!(task = %task.exe_file, "User task assigned");
        self.user_task = Some(task.exe_file);
        Flow::Continue
    }

    async fn on_activate_agent(&mut self) -> Result<Flow, ChannelError> {
        match self.start_user_task().await {
            Ok(pid) => {
                info!(pid, "User task started");
                self.task_pid = Some(pid);
                if let Some(listener) = &self.on_new_task {
                    listener(pid);
                }
            }
            Err(e) => {
                let text = format!("{e:#}");
                error!(error = %text, "Failed to start user task");
                self.send(&Message::SimpleMsg(
                    SimpleMsg::error(text).in_reply_to(Command::ActivateAgent),
                ))?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn start_user_task(&self) -> anyhow::Result<u32> {
        let raw = self
            .user_task
            .as_deref()
            .filter(|task| !task.is_empty())
            .context("No user task has been assigned")?;
        let program = expand_path(raw);
        info!(task = %program.display(), "Executing user task");
        self.ctx
            .runner
            .spawn(&program, &[], self.ctx.config.task_timeout())
            .await
    }

    fn on_disconnect(&mut self) -> Flow {
        self.state = SessionState::Closing;
        info!("The agent [{}] disconnected... Bye", self.id);
        Flow::Disconnect
    }

    fn on_shutdown(&mut self) -> Flow {
        self.decommission();
        Flow::Shutdown
    }

    /// Drop the persisted identity. Runs at most once per session.
    fn decommission(&mut self) {
        self.state = SessionState::Closing;
        if self.decommissioned {
            return;
        }
        self.decommissioned = true;
        if let Err(e) = self.ctx.identity.delete() {
            warn!(error = %e, "Failed to delete agent UUID file");
        }
        info!("The agent [{}] exited", self.id);
    }
}

#[async_trait]
impl Dispatcher for CommanderSession {
    fn on_connected(&mut self) -> Result<(), ChannelError> {
        match self.ctx.identity.load() {
            Ok(id) => self.id = id,
            Err(e) => warn!(error = %e, "Starting without a readable agent UUID"),
        }
        self.send(&Message::Handshake(VersionInfo::current()))?;
        self.state = SessionState::Handshaking;
        debug!(peer = %self.peer, "Handshake sent");
        Ok(())
    }

    async fn dispatch(&mut self, frame: Frame, at: FrameContext) -> Result<Flow, ChannelError> {
        let Some(message) = Message::decode(&frame)? else {
            return Ok(Flow::Unhandled);
        };

        if !self.handshake_complete && !allowed_before_handshake(&message) {
            warn!(command = %message.command(), "Command received before handshake, dropping");
            return Ok(Flow::Continue);
        }

        match message {
            Message::HandshakeOk => Ok(self.on_handshake_ok()),
            Message::SimpleMsg(msg) => Ok(self.on_simple_msg(&msg)),
            Message::GetHostInfo => self.on_get_host_info(),
            Message::GetUuid => self.on_get_uuid(),
            Message::SetUuid(body) => self.on_set_uuid(body),
            Message::BinaryAttachment(file) => self.on_binary_attachment(&file, at),
            Message::GetLog => self.on_get_log().await,
            Message::DownloadTest(file) => self.on_download_test(&file, at),
            Message::AssignUserTask(task) => Ok(self.on_assign_user_task(task)),
            Message::ActivateAgent => self.on_activate_agent().await,
            Message::Disconnect => Ok(self.on_disconnect()),
            Message::Shutdown => Ok(self.on_shutdown()),
            // agent -> commander only
            Message::Handshake(_)
            | Message::ReplyHostInfo(_)
            | Message::ReplyUuid(_)
            | Message::BinaryDownloadStat(_)
            | Message::BinaryAttachmentLog(_)
            | Message::GetLogError(_)
            | Message::DownloadTestStat(_)
            | Message::DownloadTestError(_) => Ok(Flow::Unhandled),
        }
    }

    fn on_remote_disconnected(&mut self) {
        self.decommission();
    }

    fn on_closed(&mut self) {
        self.state = SessionState::Closed;
    }
}

const fn allowed_before_handshake(message: &Message) -> bool {
    matches!(
        message,
        Message::HandshakeOk | Message::SimpleMsg(_) | Message::Disconnect | Message::Shutdown
    )
}

fn download_stat(file: &Attachment, at: FrameContext) -> DownloadStat {
    DownloadStat {
        received_crc32: file.checksum(),
        received_file_size: file.data.len() as u64,
        download_time_us: u64::try_from(at.header_read_at.elapsed().as_micros()).unwrap_or(u64::MAX),
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn username() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|user| user.name)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalRunner;
    use crate::config::AgentConfig;
    use crate::logs::Archiver;
    use crate::watchdog::WatchdogEntry;
    use std::path::Path;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct StubArchiver {
        fail: bool,
    }

    #[async_trait]
    impl Archiver for StubArchiver {
        async fn archive(&self, _parent: &Path, _dir: &str, archive: &Path) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("tar timed out after 60s");
            }
            std::fs::write(archive, b"archive bytes")?;
            Ok(())
        }
    }

    struct Harness {
        session: CommanderSession,
        sent: UnboundedReceiver<Frame>,
        ctx: Arc<AgentContext>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_archiver(StubArchiver { fail: false })
        }

        fn with_archiver(archiver: StubArchiver) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = AgentConfig {
                work_dir: dir.path().to_path_buf(),
                idle_time_seconds: 0.05,
                ..AgentConfig::default()
            };
            let ctx = Arc::new(AgentContext::with_parts(
                config,
                Arc::new(LocalRunner::new()),
                Arc::new(archiver),
                || {},
            ));
            let (outbox, sent) = Outbox::detached();
            let addr: SocketAddr = "127.0.0.1:20000".parse().unwrap();
            let local: SocketAddr = "127.0.0.1:41234".parse().unwrap();
            let session = CommanderSession::new(Arc::clone(&ctx), outbox, addr, local);
            Self {
                session,
                sent,
                ctx,
                _dir: dir,
            }
        }

        /// Connected and past the handshake, with the HANDSHAKE frame consumed.
        async fn active() -> Self {
            let mut h = Self::new();
            h.session.on_connected().unwrap();
            assert!(matches!(h.reply(), Message::Handshake(_)));
            assert_eq!(h.deliver(Message::HandshakeOk).await, Flow::Continue);
            h
        }

        async fn deliver(&mut self, message: Message) -> Flow {
            self.session
                .dispatch(message.encode().unwrap(), FrameContext::now())
                .await
                .unwrap()
        }

        fn reply(&mut self) -> Message {
            let frame = self.sent.try_recv().expect("no reply queued");
            Message::decode(&frame).unwrap().unwrap()
        }

        fn no_reply(&mut self) -> bool {
            self.sent.try_recv().is_err()
        }
    }

    #[tokio::test]
    async fn handshake_moves_session_to_active() {
        let mut h = Harness::new();
        assert_eq!(h.session.state(), SessionState::Connecting);

        h.session.on_connected().unwrap();
        assert_eq!(h.session.state(), SessionState::Handshaking);
        match h.reply() {
            Message::Handshake(v) => assert_eq!(v, VersionInfo::current()),
            other => panic!("expected handshake, got {other:?}"),
        }

        h.deliver(Message::HandshakeOk).await;
        assert!(h.session.handshake_complete());
        assert_eq!(h.session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn commands_before_handshake_are_dropped() {
        let mut h = Harness::new();
        h.session.on_connected().unwrap();
        h.reply();

        assert_eq!(h.deliver(Message::GetHostInfo).await, Flow::Continue);
        assert!(h.no_reply());
        assert_eq!(
            h.deliver(Message::SimpleMsg(SimpleMsg::info("hi"))).await,
            Flow::Continue
        );
    }

    #[tokio::test]
    async fn host_info_reports_this_process() {
        let mut h = Harness::active().await;
        h.deliver(Message::GetHostInfo).await;
        match h.reply() {
            Message::ReplyHostInfo(info) => {
                assert!(!info.hostname.is_empty());
                assert_eq!(info.agent_pid, std::process::id());
                assert_eq!(info.agent_port, 41234);
                assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
                assert!(info.timestamp > 0);
            }
            other => panic!("expected host info, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn uuid_set_get_and_delete() {
        let mut h = Harness::active().await;

        h.deliver(Message::GetUuid).await;
        assert_eq!(h.reply(), Message::ReplyUuid(UuidBody { id: Uuid::nil() }));

        let id = Uuid::new_v4();
        h.deliver(Message::SetUuid(UuidBody { id })).await;
        assert!(h.no_reply());
        h.deliver(Message::GetUuid).await;
        assert_eq!(h.reply(), Message::ReplyUuid(UuidBody { id }));
        assert_eq!(h.session.id(), id);

        std::fs::remove_file(h.ctx.identity.path()).unwrap();
        h.deliver(Message::GetUuid).await;
        assert_eq!(h.reply(), Message::ReplyUuid(UuidBody { id: Uuid::nil() }));
    }

    #[tokio::test]
    async fn unreadable_identity_is_fatal() {
        let mut h = Harness::active().await;
        std::fs::write(h.ctx.identity.path(), "garbage").unwrap();
        let frame = Message::GetUuid.encode().unwrap();
        let err = h.session.dispatch(frame, FrameContext::now()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Identity(_)));
    }

    #[tokio::test]
    async fn attachment_stat_reports_what_arrived() {
        let mut h = Harness::active().await;
        let file = Attachment {
            file_name: "hello.txt".to_string(),
            crc32: 0,
            file_size: 5,
            data: b"hello".to_vec(),
        };
        h.deliver(Message::BinaryAttachment(file)).await;
        match h.reply() {
            Message::BinaryDownloadStat(stat) => {
                assert_eq!(stat.received_crc32, crc32fast::hash(b"hello"));
                assert_eq!(stat.received_file_size, 5);
            }
            other => panic!("expected download stat, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn download_test_checks_crc() {
        let mut h = Harness::active().await;

        h.deliver(Message::DownloadTest(Attachment::new("ok.bin", vec![7; 64])))
            .await;
        match h.reply() {
            Message::DownloadTestStat(stat) => {
                assert_eq!(stat.received_file_size, 64);
                assert_eq!(stat.received_crc32, crc32fast::hash(&[7; 64]));
            }
            other => panic!("expected test stat, got {other:?}"),
        }

        let mut corrupted = Attachment::new("bad.bin", b"payload".to_vec());
        corrupted.data[0] ^= 0x01;
        h.deliver(Message::DownloadTest(corrupted.clone())).await;
        match h.reply() {
            Message::DownloadTestError(msg) => {
                assert_eq!(msg.severity, Severity::Error);
                assert!(msg.text.starts_with("Received binary has wrong checksum:"));
                assert!(msg.text.contains(&corrupted.crc32.to_string()));
                assert!(msg.text.contains("size: 7 name: bad.bin"));
            }
            other => panic!("expected test error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_log_sends_archive() {
        let mut h = Harness::active().await;
        h.deliver(Message::GetLog).await;
        match h.reply() {
            Message::BinaryAttachmentLog(archive) => {
                assert_eq!(archive.data, b"archive bytes");
                assert!(archive.is_intact());
                assert!(archive.file_name.ends_with(".tar.gz"));
            }
            other => panic!("expected log archive, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_log_failure_is_reported() {
        let mut h = Harness::with_archiver(StubArchiver { fail: true });
        h.session.on_connected().unwrap();
        h.reply();
        h.deliver(Message::HandshakeOk).await;

        h.deliver(Message::GetLog).await;
        match h.reply() {
            Message::GetLogError(msg) => assert!(msg.text.contains("timed out")),
            other => panic!("expected log error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn activated_task_is_watched_until_it_exits() {
        let mut h = Harness::active().await;
        let watchdog = Arc::clone(&h.ctx.watchdog);
        h.session
            .on_new_user_task(move |pid| watchdog.register(WatchdogEntry::for_task(pid)));

        h.deliver(Message::AssignUserTask(UserTask {
            exe_file: "/bin/true".to_string(),
        }))
        .await;
        assert_eq!(h.session.pending_task(), Some("/bin/true"));
        assert!(h.ctx.watchdog.is_empty());

        h.deliver(Message::ActivateAgent).await;
        assert!(h.no_reply());
        assert!(h.session.task_pid().is_some());
        assert_eq!(h.ctx.watchdog.len(), 1);

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.ctx.watchdog.tick();
            if h.ctx.watchdog.is_empty() {
                break;
            }
        }
        assert!(h.ctx.watchdog.is_empty());
    }

    #[tokio::test]
    async fn activation_without_task_fails_with_message() {
        let mut h = Harness::active().await;
        h.deliver(Message::ActivateAgent).await;
        match h.reply() {
            Message::SimpleMsg(msg) => {
                assert_eq!(msg.severity, Severity::Error);
                assert_eq!(msg.src_command, Some(Command::ActivateAgent));
            }
            other => panic!("expected error message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn activation_of_missing_program_fails_with_message() {
        let mut h = Harness::active().await;
        h.deliver(Message::AssignUserTask(UserTask {
            exe_file: "$HOME/definitely/not/a/dds-task".to_string(),
        }))
        .await;
        h.deliver(Message::ActivateAgent).await;
        match h.reply() {
            Message::SimpleMsg(msg) => {
                assert!(msg.text.contains("definitely/not/a/dds-task"));
                assert!(!msg.text.contains("$HOME"));
            }
            other => panic!("expected error message, got {other:?}"),
        }
        assert!(h.session.task_pid().is_none());
    }

    #[tokio::test]
    async fn shutdown_deletes_identity_once() {
        let mut h = Harness::active().await;
        h.deliver(Message::SetUuid(UuidBody { id: Uuid::new_v4() }))
            .await;
        assert!(h.ctx.identity.path().exists());

        assert_eq!(h.deliver(Message::Shutdown).await, Flow::Shutdown);
        assert!(!h.ctx.identity.path().exists());
        assert_eq!(h.session.state(), SessionState::Closing);

        // a later remote close must not delete a freshly written identity
        h.ctx.identity.store(Uuid::new_v4()).unwrap();
        h.session.on_remote_disconnected();
        assert!(h.ctx.identity.path().exists());

        h.session.on_closed();
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn disconnect_keeps_identity() {
        let mut h = Harness::active().await;
        h.deliver(Message::SetUuid(UuidBody { id: Uuid::new_v4() }))
            .await;
        assert_eq!(h.deliver(Message::Disconnect).await, Flow::Disconnect);
        assert!(h.ctx.identity.path().exists());
        assert_eq!(h.session.state(), SessionState::Closing);
    }

    #[tokio::test]
    async fn remote_close_decommissions() {
        let mut h = Harness::active().await;
        h.deliver(Message::SetUuid(UuidBody { id: Uuid::new_v4() }))
            .await;
        h.session.on_remote_disconnected();
        assert!(!h.ctx.identity.path().exists());
    }

    #[tokio::test]
    async fn unknown_and_outbound_only_commands_are_unhandled() {
        let mut h = Harness::active().await;
        let unknown = Frame::new(999, b"{}".to_vec()).unwrap();
        assert_eq!(
            h.session.dispatch(unknown, FrameContext::now()).await.unwrap(),
            Flow::Unhandled
        );
        assert_eq!(
            h.deliver(Message::ReplyUuid(UuidBody { id: Uuid::nil() })).await,
            Flow::Unhandled
        );
        assert!(h.no_reply());
    }

    #[tokio::test]
    async fn malformed_body_is_fatal() {
        let mut h = Harness::active().await;
        let frame = Frame::new(Command::SetUuid.id(), b"not json".to_vec()).unwrap();
        let err = h.session.dispatch(frame, FrameContext::now()).await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::InvalidBody {
                command: Command::SetUuid,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn simple_msg_with_unknown_fields_keeps_session_open() {
        let mut h = Harness::active().await;
        let body = br#"{"text":"new commander","severity":"notice","src_command":250}"#.to_vec();
        let frame = Frame::new(Command::SimpleMsg.id(), body).unwrap();
        assert_eq!(
            h.session.dispatch(frame, FrameContext::now()).await.unwrap(),
            Flow::Continue
        );
        assert!(h.no_reply());
        assert_eq!(h.session.state(), SessionState::Active);
    }
}
