//! TCP channel to the commander.
//!
//! A [`Channel`] owns one socket. A writer task drains the [`Outbox`] queue
//! strictly in FIFO order, one frame at a time. [`Channel::run`] is the only
//! reader: it waits for a header, then for the announced body, and hands the
//! complete frame to a [`Dispatcher`]. The channel itself knows nothing about
//! what the commands mean.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use async_trait::async_trait;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{read_body, read_header, write_frame, Frame};
use crate::error::ChannelError;

/// What the channel should do after a frame has been dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// No handler for this command id; the frame is dropped.
    Unhandled,
    /// Stop the channel; the agent was told to disconnect.
    Disconnect,
    /// Stop the channel; the agent was decommissioned.
    Shutdown,
}

/// Why [`Channel::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelExit {
    /// `stop()` was called locally.
    Stopped,
    /// The commander sent `DISCONNECT`.
    Disconnected,
    /// The commander sent `SHUTDOWN`.
    Shutdown,
    /// The commander closed the socket without a goodbye.
    RemoteClosed,
}

/// Per-frame facts recorded by the read loop.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// When the frame header finished arriving.
    pub header_read_at: Instant,
}

impl FrameContext {
    pub fn now() -> Self {
        Self {
            header_read_at: Instant::now(),
        }
    }
}

/// Command-aware side of a channel.
#[async_trait]
pub trait Dispatcher: Send {
    /// Called once, right after the transport connected and before the first read.
    fn on_connected(&mut self) -> Result<(), ChannelError>;

    /// Handle one inbound frame. Errors are connection-fatal.
    async fn dispatch(&mut self, frame: Frame, ctx: FrameContext) -> Result<Flow, ChannelError>;

    /// The peer closed the connection (EOF or reset).
    fn on_remote_disconnected(&mut self);

    /// The socket is closed; no more frames will arrive.
    fn on_closed(&mut self) {}
}

/// Cloneable handle onto a channel's outgoing queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Frame>,
}

impl Outbox {
    /// An outbox not attached to any socket; frames pile up in the returned receiver.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a frame for sending. Returns `false` if the channel is gone.
    pub fn push(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// One connection to the commander.
pub struct Channel {
    peer: SocketAddr,
    local: SocketAddr,
    reader: OwnedReadHalf,
    outbox: Outbox,
    writer: JoinHandle<Result<(), ChannelError>>,
    stop: CancellationToken,
}

impl Channel {
    /// Connect to the first address in `addrs` that accepts.
    ///
    /// Does not retry; reconnect policy belongs to the caller.
    pub async fn connect(addrs: &[SocketAddr]) -> Result<Self, ChannelError> {
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Self::from_stream(stream),
                Err(e) => {
                    debug!(%addr, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(ChannelError::Connect(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no commander address resolved")
        })))
    }

    /// Take ownership of a connected stream and start the writer task.
    pub fn from_stream(stream: TcpStream) -> Result<Self, ChannelError> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (outbox, queue) = Outbox::detached();
        let stop = CancellationToken::new();
        let writer = tokio::spawn(drain_outbox(writer, queue, stop.clone()));

        debug!(%peer, "Channel connected");
        Ok(Self {
            peer,
            local,
            reader,
            outbox,
            writer,
            stop,
        })
    }

    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Token that stops this channel when cancelled. Cancelling twice is a no-op.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Cancel pending I/O and close the socket. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Drive the read loop until the channel stops.
    ///
    /// Pending writes are abandoned once the loop ends, and both socket
    /// halves are dropped before this returns.
    pub async fn run<D>(mut self, dispatcher: &mut D) -> Result<ChannelExit, ChannelError>
    where
        D: Dispatcher + ?Sized,
    {
        let result = match dispatcher.on_connected() {
            Ok(()) => self.read_loop(dispatcher).await,
            Err(e) => Err(e),
        };
        self.stop.cancel();
        let written = (&mut self.writer).await;

        // A write failure stops the reader too, so it takes precedence over
        // the `Stopped` the read loop reports in that case. A peer reset seen
        // first by the writer is still a remote close.
        let outcome = match (result, written) {
            (Err(e), _) => Err(e),
            (Ok(ChannelExit::Stopped), Ok(Err(e))) if e.is_disconnect() => {
                Ok(self.remote_closed(dispatcher))
            }
            (Ok(exit), Ok(Err(e))) if e.is_disconnect() => Ok(exit),
            (Ok(_), Ok(Err(e))) => Err(e),
            (Ok(_), Err(e)) => Err(e.into()),
            (Ok(exit), Ok(Ok(()))) => Ok(exit),
        };
        dispatcher.on_closed();
        outcome
    }

    async fn read_loop<D>(&mut self, dispatcher: &mut D) -> Result<ChannelExit, ChannelError>
    where
        D: Dispatcher + ?Sized,
    {
        loop {
            let header = tokio::select! {
                biased;
                () = self.stop.cancelled() => return Ok(ChannelExit::Stopped),
                header = read_header(&mut self.reader) => header,
            };
            let header = match header {
                Ok(header) => header,
                Err(e) if e.is_disconnect() => return Ok(self.remote_closed(dispatcher)),
                Err(e) => return Err(e),
            };
            let ctx = FrameContext::now();

            let frame = tokio::select! {
                biased;
                () = self.stop.cancelled() => return Ok(ChannelExit::Stopped),
                frame = read_body(&mut self.reader, header) => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) if e.is_disconnect() => return Ok(self.remote_closed(dispatcher)),
                Err(e) => return Err(e),
            };

            let command_id = frame.command_id();
            let flow = tokio::select! {
                biased;
                () = self.stop.cancelled() => return Ok(ChannelExit::Stopped),
                flow = dispatcher.dispatch(frame, ctx) => flow?,
            };
            match flow {
                Flow::Continue => {}
                Flow::Unhandled => {
                    warn!(command_id, peer = %self.peer, "No handler for command, dropping frame");
                }
                Flow::Disconnect => return Ok(ChannelExit::Disconnected),
                Flow::Shutdown => return Ok(ChannelExit::Shutdown),
            }
        }
    }

    fn remote_closed<D>(&self, dispatcher: &mut D) -> ChannelExit
    where
        D: Dispatcher + ?Sized,
    {
        info!(peer = %self.peer, "Commander closed the connection");
        self.stop.cancel();
        dispatcher.on_remote_disconnected();
        ChannelExit::RemoteClosed
    }
}

/// Writer task: send queued frames one at a time until stopped.
async fn drain_outbox(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Frame>,
    stop: CancellationToken,
) -> Result<(), ChannelError> {
    loop {
        let frame = tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(()),
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => return Ok(()),
            },
        };

        let command_id = frame.command_id();
        tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(()),
            sent = write_frame(&mut writer, &frame) => {
                if let Err(e) = sent {
                    warn!(command_id, error = %e, "Failed to send frame, stopping channel");
                    stop.cancel();
                    return Err(e.into());
                }
                debug!(command_id, "Frame sent");
            }
        }
    }
}
