//! One framed connection between two protocol endpoints.
//!
//! A [`Channel`] wraps any [`Endpoint`] (a Unix domain socket, or a named
//! pipe on Windows) in a [`FrameCodec`]. Protocol code above this layer is
//! platform agnostic.

use std::fmt;
use std::io;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use uuid::Uuid;

use super::codec::FrameCodec;
use super::protocol::{AdminTag, Frame};

#[cfg(unix)]
pub type RawHandle = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawHandle = isize;

/// A byte-stream endpoint bound to one OS handle.
#[async_trait]
pub trait Endpoint: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {
    /// Zero-timeout readiness probe. Hang-up and error conditions count as
    /// readable so the caller goes on to observe them through `recv`.
    fn data_available(&self) -> bool;

    /// Waits until the endpoint is readable.
    async fn readable(&self) -> io::Result<()>;

    fn raw_handle(&self) -> RawHandle;
}

#[async_trait]
impl Endpoint for Box<dyn Endpoint> {
    fn data_available(&self) -> bool {
        (**self).data_available()
    }

    async fn readable(&self) -> io::Result<()> {
        (**self).readable().await
    }

    fn raw_handle(&self) -> RawHandle {
        (**self).raw_handle()
    }
}

#[cfg(unix)]
#[async_trait]
impl Endpoint for tokio::net::UnixStream {
    fn data_available(&self) -> bool {
        use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
        use std::os::fd::AsFd;

        let mut fds = [PollFd::new(self.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(0) => false,
            Ok(_) => fds[0].revents().is_some_and(|r| {
                r.intersects(
                    PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL,
                )
            }),
            Err(e) => {
                tracing::debug!(error = %e, "poll failed, reporting channel readable");
                true
            }
        }
    }

    async fn readable(&self) -> io::Result<()> {
        loop {
            tokio::net::UnixStream::readable(self).await?;
            if self.data_available() {
                return Ok(());
            }
            // Stale readiness; clear it so the next wait parks.
            let _ = self.try_io(tokio::io::Interest::READABLE, || {
                Err::<(), _>(io::Error::from(io::ErrorKind::WouldBlock))
            });
        }
    }

    fn raw_handle(&self) -> RawHandle {
        use std::os::fd::AsRawFd;
        self.as_raw_fd()
    }
}

#[cfg(windows)]
mod pipe_endpoints {
    use super::*;
    use futures::FutureExt;
    use std::os::windows::io::AsRawHandle;
    use tokio::net::windows::named_pipe::{NamedPipeClient, NamedPipeServer};

    macro_rules! pipe_endpoint {
        ($ty:ty) => {
            #[async_trait]
            impl Endpoint for $ty {
                fn data_available(&self) -> bool {
                    <$ty>::readable(self).now_or_never().is_some()
                }

                async fn readable(&self) -> io::Result<()> {
                    <$ty>::readable(self).await
                }

                fn raw_handle(&self) -> RawHandle {
                    self.as_raw_handle() as isize
                }
            }
        };
    }

    pipe_endpoint!(NamedPipeServer);
    pipe_endpoint!(NamedPipeClient);
}

/// Unique identifier for an accepted or connected channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the other end of a channel turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    /// Accepted, has not yet sent end-init or identify-stats.
    Unidentified,
    /// A child that completed end-init.
    AdminPeer,
    Watchdog,
    /// Reclassified by identify-stats; traffic goes to the stats layer.
    Stats,
    /// A stats channel registered for push notifications.
    NoticeSubscriber,
    /// Outgoing connection from this process.
    Client,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
    #[error("channel i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("expected {expected:?}, received {got:?}")]
    UnexpectedReply { expected: AdminTag, got: AdminTag },
    #[error("stats are disabled on the server")]
    StatsDisabled,
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub struct Channel {
    id: ConnId,
    framed: Framed<Box<dyn Endpoint>, FrameCodec>,
    role: ChannelRole,
    alive: bool,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("alive", &self.alive)
            .finish()
    }
}

impl Channel {
    pub fn new(endpoint: impl Endpoint, role: ChannelRole) -> Self {
        let endpoint: Box<dyn Endpoint> = Box::new(endpoint);
        Self {
            id: ConnId::new(),
            framed: Framed::new(endpoint, FrameCodec::new()),
            role,
            alive: true,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn set_role(&mut self, role: ChannelRole) {
        tracing::debug!(conn = %self.id, from = ?self.role, to = ?role, "Channel role changed");
        self.role = role;
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn raw_handle(&self) -> RawHandle {
        self.framed.get_ref().raw_handle()
    }

    pub async fn send(&mut self, frame: Frame) -> Result<(), ChannelError> {
        if !self.alive {
            return Err(ChannelError::Closed);
        }
        let tag = frame.tag;
        if let Err(e) = self.framed.send(frame).await {
            tracing::debug!(conn = %self.id, ?tag, error = %e, "Channel write failed");
            self.alive = false;
            return Err(e.into());
        }
        tracing::trace!(conn = %self.id, ?tag, "Frame sent");
        Ok(())
    }

    pub async fn send_text(&mut self, tag: AdminTag, text: impl AsRef<str>) -> Result<(), ChannelError> {
        self.send(Frame::admin(tag, text)).await
    }

    /// Receives the next frame. An orderly close by the peer yields a
    /// synthetic `EmptyRead` frame and marks the channel dead.
    pub async fn recv(&mut self) -> Result<Frame, ChannelError> {
        if !self.alive {
            return Err(ChannelError::Closed);
        }
        match self.framed.next().await {
            Some(Ok(frame)) => {
                tracing::trace!(conn = %self.id, tag = ?frame.tag, "Frame received");
                Ok(frame)
            }
            Some(Err(e)) => {
                tracing::debug!(conn = %self.id, error = %e, "Channel read failed");
                self.alive = false;
                Err(e.into())
            }
            None => {
                tracing::debug!(conn = %self.id, "Peer closed channel");
                self.alive = false;
                Ok(Frame::empty_read())
            }
        }
    }

    /// Sends `frame` and waits for the next frame from the peer.
    pub async fn exchange(&mut self, frame: Frame) -> Result<Frame, ChannelError> {
        self.send(frame).await?;
        self.recv().await
    }

    /// Sends a request and requires its paired reply tag.
    pub async fn request(&mut self, tag: AdminTag, text: impl AsRef<str>) -> Result<Frame, ChannelError> {
        let expected = tag.reply().ok_or(ChannelError::UnexpectedReply {
            expected: tag,
            got: tag,
        })?;
        let reply = self.exchange(Frame::admin(tag, text)).await?;
        if reply.tag != expected {
            return Err(ChannelError::UnexpectedReply {
                expected,
                got: reply.tag,
            });
        }
        Ok(reply)
    }

    /// True when a `recv` would not block: a frame is buffered or the
    /// endpoint is readable, including hang-up.
    pub fn peek(&self) -> bool {
        !self.alive || !self.framed.read_buffer().is_empty() || self.framed.get_ref().data_available()
    }

    pub async fn readable(&self) -> io::Result<()> {
        if !self.alive || !self.framed.read_buffer().is_empty() {
            return Ok(());
        }
        self.framed.get_ref().readable().await
    }

    /// Releases the endpoint without closing it.
    ///
    /// Bytes already read into the frame buffer are not part of the endpoint
    /// and are discarded; they are logged with their count.
    pub fn invalidate(self) -> Box<dyn Endpoint> {
        let buffered = self.framed.read_buffer().len();
        if buffered > 0 {
            tracing::warn!(conn = %self.id, buffered, "Channel invalidated with unread bytes, discarding them");
        } else {
            tracing::trace!(conn = %self.id, "Channel invalidated");
        }
        self.framed.into_inner()
    }

    /// Bytes read from the endpoint but not yet decoded into a frame.
    pub fn buffered_len(&self) -> usize {
        self.framed.read_buffer().len()
    }
}
