//! Child admin loop.
//!
//! After the end-init handshake the child only answers: lifecycle commands
//! and stats polls arrive from the parent, and notices leave through a
//! separate stats channel owned by [`ChildNotifier`]. Commands the child
//! itself originates go over a short-lived connection
//! ([`send_peer_command`]).

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::AdminError;
use crate::bridge::channel::{Channel, ChannelRole};
use crate::bridge::protocol::{AdminTag, Frame, NoticeKind};
use crate::bridge::transport::{ConnectOptions, connect};
use crate::config::AdminConfig;
use crate::stats::child::{ChildNotifier, StatsResponder};
use crate::stats::messenger;

/// Server actions triggered by relayed commands.
#[async_trait]
pub trait ChildHandler: Send + Sync {
    async fn reconfigure(&self) {}

    async fn rotate_logs(&self) {}

    async fn reopen_logs(&self) {}

    async fn restart(&self) {}

    /// The parent asked this child to exit or went away.
    async fn terminate(&self) {}
}

pub struct NoopHandler;

impl ChildHandler for NoopHandler {}

enum Flow {
    Continue,
    Stop,
}

pub struct ChildAdmin {
    pid: i32,
    channel: Channel,
    responder: Option<StatsResponder>,
    notifier: Option<ChildNotifier>,
    handler: Arc<dyn ChildHandler>,
}

impl ChildAdmin {
    /// Connects to the parent and completes the end-init handshake.
    ///
    /// Statistics must be answerable before this returns: the parent polls
    /// the child right after the handshake.
    pub async fn connect(
        config: &AdminConfig,
        pid: i32,
        handler: Arc<dyn ChildHandler>,
        responder: Option<StatsResponder>,
    ) -> Result<Self, AdminError> {
        let path = config.socket_path();
        let mut channel = connect(&path, config.child_connect_options()).await?;
        end_init(&mut channel, pid, config.reply_timeout).await?;
        channel.set_role(ChannelRole::AdminPeer);

        let notifier = (config.stats_enabled && responder.is_some())
            .then(|| ChildNotifier::spawn(path, pid, config.child_connect_options()));
        tracing::info!(pid, stats = notifier.is_some(), "Child admin channel initialized");
        Ok(Self {
            pid,
            channel,
            responder,
            notifier,
            handler,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Sender for notices to the parent's stats service.
    pub fn notifier(&self) -> Option<ChildNotifier> {
        self.notifier.clone()
    }

    pub fn spawn(self) -> ChildAdminHandle {
        let shutdown = Arc::new(Notify::new());
        let terminating = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(self.run(shutdown.clone(), terminating.clone()));
        ChildAdminHandle {
            shutdown,
            terminating,
            task,
        }
    }

    async fn run(mut self, shutdown: Arc<Notify>, terminating: Arc<AtomicBool>) {
        while !terminating.load(Ordering::Acquire) {
            tokio::select! {
                biased;
                _ = shutdown.notified() => continue,
                ready = self.channel.readable() => {
                    if let Err(e) = ready {
                        tracing::warn!(pid = self.pid, error = %e, "Admin channel wait failed");
                        break;
                    }
                }
            }
            let frame = match self.channel.recv().await {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(pid = self.pid, error = %e, "Admin channel read failed");
                    self.handler.terminate().await;
                    break;
                }
            };
            if let Flow::Stop = self.dispatch(frame).await {
                break;
            }
        }
        tracing::debug!(pid = self.pid, "Child admin loop stopped");
    }

    async fn reply(&mut self, tag: AdminTag) -> Flow {
        let Some(reply) = tag.reply() else {
            return Flow::Continue;
        };
        match self.channel.send_text(reply, "").await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                tracing::warn!(pid = self.pid, ?tag, error = %e, "Reply to parent failed");
                Flow::Stop
            }
        }
    }

    fn reconfigure_done(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(NoticeKind::ReconfigureDone);
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Flow {
        let tag = frame.tag;
        tracing::debug!(pid = self.pid, ?tag, "Admin message from parent");
        match tag {
            AdminTag::ReqStatsData => self.answer_stats(frame).await,
            AdminTag::Reconfigure => {
                // Answer first; the parent waits on every child in turn.
                let flow = self.reply(tag).await;
                self.handler.reconfigure().await;
                self.reconfigure_done();
                flow
            }
            AdminTag::PeerReconfigure => {
                self.handler.reconfigure().await;
                let flow = self.reply(tag).await;
                self.reconfigure_done();
                flow
            }
            AdminTag::Rotate => {
                self.handler.rotate_logs().await;
                self.reply(tag).await
            }
            AdminTag::PeerReopenLogs => {
                self.handler.reopen_logs().await;
                self.reply(tag).await
            }
            AdminTag::Restart => {
                let flow = self.reply(tag).await;
                self.handler.restart().await;
                flow
            }
            AdminTag::Terminate | AdminTag::EmptyRead => {
                // Closing the channel is the answer.
                self.handler.terminate().await;
                Flow::Stop
            }
            other => {
                tracing::warn!(pid = self.pid, tag = ?other, "Ignoring unexpected admin message");
                Flow::Continue
            }
        }
    }

    async fn answer_stats(&mut self, frame: Frame) -> Flow {
        let request = match messenger::assemble(&mut self.channel, frame).await {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(pid = self.pid, error = %e, "Malformed stats request from parent");
                return Flow::Stop;
            }
        };
        let Some(responder) = self.responder.as_ref() else {
            tracing::warn!(pid = self.pid, "Stats request with statistics disabled");
            return Flow::Continue;
        };
        match responder.handle(&mut self.channel, &request).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "Answering stats request failed");
                Flow::Stop
            }
        }
    }
}

/// Three-way end-init: `EndInit(pid)`, `EndInitReply`, `EndInitReplyAck`.
async fn end_init(channel: &mut Channel, pid: i32, limit: Duration) -> Result<(), AdminError> {
    let reply = tokio::time::timeout(limit, channel.request(AdminTag::EndInit, pid.to_string()))
        .await
        .map_err(|_| AdminError::Handshake(format!("no end-init reply within {:?}", limit)))??;
    tracing::trace!(pid, tag = ?reply.tag, "End-init acknowledged");
    channel.send_text(AdminTag::EndInitReplyAck, pid.to_string()).await?;
    Ok(())
}

/// Handle to a running child admin loop.
pub struct ChildAdminHandle {
    shutdown: Arc<Notify>,
    terminating: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ChildAdminHandle {
    /// Stops the loop at its next wait; a reply in progress completes.
    pub fn shutdown(&self) {
        self.terminating.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<(), AdminError> {
        self.task
            .await
            .map_err(|e| AdminError::Protocol(format!("child admin loop panicked: {}", e)))
    }
}

/// Sends a command over a short-lived connection and waits for its reply.
///
/// `Terminate` also succeeds when the parent closes the connection.
pub async fn send_peer_command(
    path: &Path,
    tag: AdminTag,
    opts: ConnectOptions,
    limit: Duration,
) -> Result<(), AdminError> {
    if !tag.is_lifecycle_command() {
        return Err(AdminError::Protocol(format!("{:?} is not a peer command", tag)));
    }
    let mut channel = connect(path, opts).await?;
    let reply = tokio::time::timeout(limit, channel.exchange(Frame::admin(tag, "")))
        .await
        .map_err(|_| AdminError::Protocol(format!("no reply to {:?} within {:?}", tag, limit)))??;
    let graceful = tag == AdminTag::Terminate && reply.is_empty_read();
    if Some(reply.tag) != tag.reply() && !graceful {
        return Err(AdminError::Protocol(format!(
            "expected reply to {:?}, received {:?}",
            tag, reply.tag
        )));
    }
    tracing::debug!(?tag, "Peer command acknowledged");
    Ok(())
}

/// Asks every child, this one included, to reload its configuration.
pub async fn peer_reconfigure(config: &AdminConfig) -> Result<(), AdminError> {
    send_peer_command(
        &config.socket_path(),
        AdminTag::PeerReconfigure,
        config.client_connect_options(),
        config.reply_timeout,
    )
    .await
}

pub async fn peer_reopen_logs(config: &AdminConfig) -> Result<(), AdminError> {
    send_peer_command(
        &config.socket_path(),
        AdminTag::PeerReopenLogs,
        config.client_connect_options(),
        config.reply_timeout,
    )
    .await
}

/// Asks the parent to terminate every child so the supervisor restarts them.
pub async fn request_restart(config: &AdminConfig) -> Result<(), AdminError> {
    send_peer_command(
        &config.socket_path(),
        AdminTag::Terminate,
        config.client_connect_options(),
        config.reply_timeout,
    )
    .await
}
