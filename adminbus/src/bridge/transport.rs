//! Channel addressing, listening and connecting.
//!
//! - **Unix**: a filesystem socket at `{temp_dir}/{product}.socket`
//! - **Windows**: a named pipe `\\.\pipe\{product}-{instance}`

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::channel::{Channel, ChannelError, ChannelRole};
use super::protocol::AdminTag;

/// Reply text of a positive identify-stats exchange.
pub const STATS_ENABLED_REPLY: &str = "true";
pub const STATS_DISABLED_REPLY: &str = "false";

pub fn socket_path(temp_dir: &Path, product: &str) -> PathBuf {
    temp_dir.join(format!("{product}.socket"))
}

#[cfg(windows)]
pub fn pipe_name(product: &str, instance: &str) -> String {
    format!(r"\\.\pipe\{product}-{instance}")
}

/// Bounded connect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub attempts: u32,
    pub retry_delay: Duration,
    pub attempt_timeout: Duration,
}

impl ConnectOptions {
    /// Single attempt, used by admin tooling.
    pub fn once(attempt_timeout: Duration) -> Self {
        Self {
            attempts: 1,
            retry_delay: Duration::ZERO,
            attempt_timeout,
        }
    }

    pub fn with_retries(attempts: u32, retry_delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            retry_delay,
            attempt_timeout,
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::once(Duration::from_secs(5))
    }
}

#[cfg(unix)]
pub struct AdminListener {
    path: PathBuf,
    listener: tokio::net::UnixListener,
}

#[cfg(unix)]
impl AdminListener {
    /// Binds the well-known socket, replacing a stale one.
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        use std::os::unix::net::UnixListener as StdUnixListener;

        let path = path.into();
        if path.exists() {
            tracing::debug!(path = %path.display(), "Removing stale admin socket");
            std::fs::remove_file(&path)?;
        }
        let std_listener = StdUnixListener::bind(&path)?;
        std_listener.set_nonblocking(true)?;
        let listener = tokio::net::UnixListener::from_std(std_listener)?;
        tracing::debug!(path = %path.display(), "Admin socket bound");
        Ok(Self { path, listener })
    }

    pub async fn accept(&self) -> io::Result<Channel> {
        let (stream, _) = self.listener.accept().await?;
        let channel = Channel::new(stream, ChannelRole::Unidentified);
        tracing::trace!(conn = %channel.id(), "Accepted admin connection");
        Ok(channel)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cleanup(&self) -> io::Result<()> {
        if self.path.exists() {
            tracing::debug!(path = %self.path.display(), "Removing admin socket");
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for AdminListener {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "Failed to remove admin socket");
        }
    }
}

#[cfg(windows)]
pub struct AdminListener {
    path: PathBuf,
    next: tokio::sync::Mutex<tokio::net::windows::named_pipe::NamedPipeServer>,
}

#[cfg(windows)]
impl AdminListener {
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let path = path.into();
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&path)?;
        Ok(Self {
            path,
            next: tokio::sync::Mutex::new(server),
        })
    }

    pub async fn accept(&self) -> io::Result<Channel> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let mut next = self.next.lock().await;
        next.connect().await?;
        let fresh = ServerOptions::new().create(&self.path)?;
        let connected = std::mem::replace(&mut *next, fresh);
        Ok(Channel::new(connected, ChannelRole::Unidentified))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
async fn connect_once(path: &Path) -> io::Result<Channel> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Channel::new(stream, ChannelRole::Client))
}

#[cfg(windows)]
async fn connect_once(path: &Path) -> io::Result<Channel> {
    let client = tokio::net::windows::named_pipe::ClientOptions::new().open(path)?;
    Ok(Channel::new(client, ChannelRole::Client))
}

/// Connects with bounded retries and a per-attempt timeout.
pub async fn connect(path: &Path, opts: ConnectOptions) -> Result<Channel, ChannelError> {
    let mut last = ChannelError::Timeout(opts.attempt_timeout);
    for attempt in 1..=opts.attempts {
        match tokio::time::timeout(opts.attempt_timeout, connect_once(path)).await {
            Ok(Ok(channel)) => {
                tracing::debug!(path = %path.display(), attempt, conn = %channel.id(), "Connected");
                return Ok(channel);
            }
            Ok(Err(e)) => {
                tracing::debug!(path = %path.display(), attempt, error = %e, "Connect failed");
                last = ChannelError::Io(e);
            }
            Err(_) => {
                tracing::debug!(path = %path.display(), attempt, "Connect timed out");
                last = ChannelError::Timeout(opts.attempt_timeout);
            }
        }
        if attempt < opts.attempts {
            tokio::time::sleep(opts.retry_delay).await;
        }
    }
    Err(last)
}

/// Connects and reclassifies the connection as a stats channel.
pub async fn connect_stats_channel(path: &Path, opts: ConnectOptions) -> Result<Channel, ChannelError> {
    let mut channel = connect(path, opts).await?;
    let reply = tokio::time::timeout(
        opts.attempt_timeout,
        channel.request(AdminTag::IdentifyStatsChannel, ""),
    )
    .await
    .map_err(|_| ChannelError::Timeout(opts.attempt_timeout))??;

    if reply.text() != STATS_ENABLED_REPLY {
        tracing::debug!(path = %path.display(), "Server has stats disabled");
        return Err(ChannelError::StatsDisabled);
    }
    channel.set_role(ChannelRole::Stats);
    Ok(channel)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bridge::protocol::Frame;

    #[test]
    fn socket_path_uses_product_suffix() {
        let path = socket_path(Path::new("/tmp/https-test"), "webservd");
        assert_eq!(path, PathBuf::from("/tmp/https-test/webservd.socket"));
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path(), "adminbus");
        std::fs::write(&path, b"stale").unwrap();

        let listener = AdminListener::bind(&path).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn connect_and_accept() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path(), "adminbus");
        let listener = AdminListener::bind(&path).unwrap();

        let (client, server) = tokio::join!(connect(&path, ConnectOptions::default()), listener.accept());
        let mut client = client.unwrap();
        let mut server = server.unwrap();
        assert_eq!(server.role(), ChannelRole::Unidentified);

        client.send_text(AdminTag::GetPwd, "").await.unwrap();
        assert_eq!(server.recv().await.unwrap().tag, AdminTag::GetPwd);
    }

    #[tokio::test]
    async fn connect_gives_up_after_bounded_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path(), "missing");
        let opts = ConnectOptions::with_retries(3, Duration::from_millis(5), Duration::from_millis(50));
        let started = std::time::Instant::now();
        assert!(matches!(connect(&path, opts).await, Err(ChannelError::Io(_))));
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn identify_stats_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path(), "adminbus");
        let listener = AdminListener::bind(&path).unwrap();

        for (reply, enabled) in [(STATS_ENABLED_REPLY, true), (STATS_DISABLED_REPLY, false)] {
            let server = async {
                let mut ch = listener.accept().await.unwrap();
                let req = ch.recv().await.unwrap();
                assert_eq!(req.tag, AdminTag::IdentifyStatsChannel);
                ch.send(Frame::admin(AdminTag::IdentifyStatsChannelAck, reply))
                    .await
                    .unwrap();
                ch
            };
            let (client, _server) = tokio::join!(connect_stats_channel(&path, ConnectOptions::default()), server);
            match client {
                Ok(ch) => {
                    assert!(enabled);
                    assert_eq!(ch.role(), ChannelRole::Stats);
                }
                Err(e) => {
                    assert!(!enabled);
                    assert!(matches!(e, ChannelError::StatsDisabled));
                }
            }
        }
    }
}
