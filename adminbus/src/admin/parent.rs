//! Parent admin loop: supervises child admin channels.
//!
//! Flow:
//! 1. Bind the well-known admin socket
//! 2. Accept children; each completes the end-init handshake and from then
//!    on only answers what the parent sends it
//! 3. After the N-th child, tell the watchdog and start relaying its commands
//! 4. Relay lifecycle commands to every child, one child at a time
//! 5. Hand stats channels to the stats service
//!
//! Everything runs on one task. Every read that follows a readiness wake-up
//! is bounded by the reply timeout, so a slow or half-written peer stalls the
//! loop for at most that long and is then dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::AdminError;
use super::children::{ChildSummary, ChildTable};
use crate::bridge::channel::{Channel, ChannelRole};
use crate::bridge::protocol::{AdminTag, Frame};
use crate::bridge::transport::{AdminListener, STATS_DISABLED_REPLY, STATS_ENABLED_REPLY};
use crate::config::AdminConfig;
use crate::stats::messenger;
use crate::stats::parent::ParentStats;
use crate::store::{AggregationStore, SharedStore};

/// Extension points of the embedding server.
#[async_trait]
pub trait ParentHooks: Send + Sync {
    /// Answers a request with a text reply, e.g. `GetPwd`. `None` sends an
    /// empty reply.
    async fn answer(&self, tag: AdminTag, arg: &str) -> Option<String> {
        let _ = (tag, arg);
        None
    }

    /// Called after a lifecycle command reached every child.
    async fn command_relayed(&self, tag: AdminTag, success: bool) {
        let _ = (tag, success);
    }
}

pub struct NoHooks;

impl ParentHooks for NoHooks {}

#[derive(Debug, Clone, Serialize)]
pub struct ParentStatus {
    pub expected_children: usize,
    pub connected_children: usize,
    pub children: Vec<ChildSummary>,
    pub watchdog_active: bool,
    pub reconfigure_in_progress: bool,
    pub open_channels: usize,
}

enum ParentCommand {
    Broadcast {
        tag: AdminTag,
        reply: oneshot::Sender<bool>,
    },
    ChildStarting,
    ChildDied {
        pid: i32,
    },
    Status {
        reply: oneshot::Sender<ParentStatus>,
    },
    Shutdown,
}

/// Handle to a running parent admin loop.
pub struct ParentHandle {
    tx: mpsc::Sender<ParentCommand>,
    store: SharedStore,
    path: PathBuf,
    task: JoinHandle<()>,
}

impl ParentHandle {
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    async fn send(&self, command: ParentCommand) -> Result<(), AdminError> {
        self.tx.send(command).await.map_err(|_| AdminError::Stopped)
    }

    /// Relays a lifecycle command to every initialized child. Returns
    /// whether each child answered with the paired reply or closed.
    pub async fn broadcast(&self, tag: AdminTag) -> Result<bool, AdminError> {
        let (reply, rx) = oneshot::channel();
        self.send(ParentCommand::Broadcast { tag, reply }).await?;
        rx.await.map_err(|_| AdminError::Stopped)
    }

    /// A replacement child is about to start.
    pub async fn child_starting(&self) -> Result<(), AdminError> {
        self.send(ParentCommand::ChildStarting).await
    }

    /// The process supervisor reaped `pid`.
    pub async fn child_died(&self, pid: i32) -> Result<(), AdminError> {
        self.send(ParentCommand::ChildDied { pid }).await
    }

    pub async fn status(&self) -> Result<ParentStatus, AdminError> {
        let (reply, rx) = oneshot::channel();
        self.send(ParentCommand::Status { reply }).await?;
        rx.await.map_err(|_| AdminError::Stopped)
    }

    pub async fn shutdown(&self) -> Result<(), AdminError> {
        self.send(ParentCommand::Shutdown).await
    }

    /// Waits for the loop to exit, after a shutdown or a relayed terminate.
    pub async fn wait(self) -> Result<(), AdminError> {
        self.task
            .await
            .map_err(|e| AdminError::Protocol(format!("admin loop panicked: {}", e)))
    }
}

/// Binds the admin socket and starts the parent loop.
///
/// `watchdog` is an already connected link owned by the caller's watchdog
/// client; this layer never closes it.
pub fn spawn_parent(
    config: &AdminConfig,
    watchdog: Option<Channel>,
    hooks: Arc<dyn ParentHooks>,
) -> Result<ParentHandle, AdminError> {
    let path = config.socket_path();
    let listener = AdminListener::bind(&path).map_err(AdminError::Bind)?;
    let store = AggregationStore::new(config.max_procs, config.header()).into_shared();
    let stats = ParentStats::new(store.clone(), config.stats_enabled, config.reply_timeout);

    let watchdog = watchdog.map(|mut channel| {
        channel.set_role(ChannelRole::Watchdog);
        channel
    });
    let (tx, rx) = mpsc::channel(16);
    let event_loop = ParentLoop {
        config: config.clone(),
        listener,
        children: ChildTable::new(config.max_procs),
        watchdog,
        watchdog_active: false,
        others: Vec::new(),
        stats,
        hooks,
        rx,
        terminating: false,
    };
    tracing::info!(
        path = %path.display(),
        max_procs = config.max_procs,
        stats = config.stats_enabled,
        "Parent admin listening"
    );
    let task = tokio::spawn(event_loop.run());
    Ok(ParentHandle {
        tx,
        store,
        path,
        task,
    })
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Child(usize),
    Watchdog,
    Other(usize),
}

enum Event {
    Command(Option<ParentCommand>),
    Accepted(std::io::Result<Channel>),
    Readable(Source),
}

struct ParentLoop {
    config: AdminConfig,
    listener: AdminListener,
    children: ChildTable,
    watchdog: Option<Channel>,
    watchdog_active: bool,
    /// Unidentified, stats and notice subscriber channels.
    others: Vec<Channel>,
    stats: ParentStats,
    hooks: Arc<dyn ParentHooks>,
    rx: mpsc::Receiver<ParentCommand>,
    terminating: bool,
}

async fn next_readable(
    children: &ChildTable,
    watchdog: Option<&Channel>,
    others: &[Channel],
) -> Source {
    let mut waits: Vec<BoxFuture<'_, Source>> = Vec::new();
    for (slot, child) in children.iter().enumerate() {
        if let Some(channel) = child.channel.as_ref() {
            waits.push(
                async move {
                    let _ = channel.readable().await;
                    Source::Child(slot)
                }
                .boxed(),
            );
        }
    }
    if let Some(channel) = watchdog {
        waits.push(
            async move {
                let _ = channel.readable().await;
                Source::Watchdog
            }
            .boxed(),
        );
    }
    for (index, channel) in others.iter().enumerate() {
        waits.push(
            async move {
                let _ = channel.readable().await;
                Source::Other(index)
            }
            .boxed(),
        );
    }
    if waits.is_empty() {
        return std::future::pending().await;
    }
    futures::future::select_all(waits).await.0
}

impl ParentLoop {
    async fn run(mut self) {
        while !self.terminating {
            let event = {
                let watchdog = self.watchdog.as_ref().filter(|_| self.watchdog_active);
                tokio::select! {
                    biased;
                    command = self.rx.recv() => Event::Command(command),
                    accepted = self.listener.accept() => Event::Accepted(accepted),
                    source = next_readable(&self.children, watchdog, &self.others) => Event::Readable(source),
                }
            };
            match event {
                Event::Command(None) => {
                    tracing::debug!("All parent handles dropped");
                    break;
                }
                Event::Command(Some(command)) => self.handle_command(command).await,
                Event::Accepted(Ok(channel)) => {
                    tracing::debug!(conn = %channel.id(), "Admin connection accepted");
                    self.others.push(channel);
                }
                Event::Accepted(Err(e)) => {
                    tracing::warn!(error = %e, "Admin accept failed");
                }
                Event::Readable(Source::Child(slot)) => self.handle_child(slot).await,
                Event::Readable(Source::Watchdog) => self.handle_watchdog().await,
                Event::Readable(Source::Other(index)) => {
                    let channel = self.others.swap_remove(index);
                    self.handle_other(channel).await;
                }
            }
        }
        tracing::info!(terminating = self.terminating, "Parent admin loop stopped");
    }

    async fn handle_command(&mut self, command: ParentCommand) {
        match command {
            ParentCommand::Broadcast { tag, reply } => {
                let ok = if tag.is_lifecycle_command() {
                    self.relay(tag).await
                } else {
                    tracing::warn!(?tag, "Refusing to broadcast a non-lifecycle command");
                    false
                };
                let _ = reply.send(ok);
            }
            ParentCommand::ChildStarting => self.stats.child_starting(),
            ParentCommand::ChildDied { pid } => match self.children.slot_of(pid) {
                Some(slot) => self.child_lost(slot).await,
                None => self.stats.child_died(pid),
            },
            ParentCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            ParentCommand::Shutdown => {
                tracing::info!("Parent admin shutdown requested");
                self.terminating = true;
            }
        }
    }

    fn status(&self) -> ParentStatus {
        ParentStatus {
            expected_children: self.children.len(),
            connected_children: self.children.connected_count(),
            children: self.children.summary(),
            watchdog_active: self.watchdog_active,
            reconfigure_in_progress: self.stats.reconfigure_in_progress(),
            open_channels: self.others.len(),
        }
    }

    /// Broadcasts `tag` and applies its effect on this process.
    async fn relay(&mut self, tag: AdminTag) -> bool {
        let ok = self.broadcast(tag).await;
        match tag {
            AdminTag::Reconfigure | AdminTag::PeerReconfigure => {
                self.stats.begin_reconfigure(&self.children)
            }
            AdminTag::Terminate => self.terminating = true,
            _ => {}
        }
        self.hooks.command_relayed(tag, ok).await;
        ok
    }

    async fn broadcast(&mut self, tag: AdminTag) -> bool {
        let expected = tag.reply();
        let limit = self.config.reply_timeout;
        let mut ok = true;
        let mut lost = Vec::new();

        for slot in self.children.initialized_slots() {
            let Some(child) = self.children.get_mut(slot) else {
                continue;
            };
            let pid = child.pid;
            let Some(channel) = child.channel.as_mut() else {
                continue;
            };
            match tokio::time::timeout(limit, channel.exchange(Frame::admin(tag, ""))).await {
                Ok(Ok(reply)) if Some(reply.tag) == expected => {
                    tracing::debug!(pid, ?tag, "Child acknowledged command");
                }
                Ok(Ok(reply)) if reply.is_empty_read() => {
                    tracing::debug!(pid, ?tag, "Child closed its channel on command");
                    lost.push(slot);
                }
                Ok(Ok(reply)) => {
                    tracing::error!(pid, ?tag, got = ?reply.tag, "Unexpected reply from child");
                    ok = false;
                    lost.push(slot);
                }
                Ok(Err(e)) => {
                    tracing::warn!(pid, ?tag, error = %e, "Relaying command to child failed");
                    ok = false;
                    lost.push(slot);
                }
                Err(_) => {
                    tracing::warn!(pid, ?tag, timeout = ?limit, "Child did not answer command");
                    ok = false;
                    lost.push(slot);
                }
            }
        }
        for slot in lost {
            self.child_lost(slot).await;
        }
        tracing::info!(?tag, ok, "Command relayed to children");
        ok
    }

    async fn child_lost(&mut self, slot: usize) {
        let Some(child) = self.children.get_mut(slot) else {
            return;
        };
        let pid = child.pid;
        drop(child.reset());
        tracing::info!(pid, slot, "Child admin channel closed");
        self.stats.child_died(pid);
        self.stats
            .ack_reconfigure(&mut self.children, None, &mut self.others)
            .await;
    }

    /// Children never start an exchange on their admin channel, so anything
    /// readable there is a close or a protocol violation.
    async fn handle_child(&mut self, slot: usize) {
        let Some(child) = self.children.get_mut(slot) else {
            return;
        };
        let pid = child.pid;
        let Some(channel) = child.channel.as_mut() else {
            return;
        };
        let limit = self.config.reply_timeout;
        match tokio::time::timeout(limit, channel.recv()).await {
            Ok(Ok(frame)) if frame.is_empty_read() => {}
            Ok(Ok(frame)) => {
                tracing::error!(pid, tag = ?frame.tag, "Child sent an unsolicited message, closing");
            }
            Ok(Err(e)) => tracing::warn!(pid, error = %e, "Child admin channel failed"),
            Err(_) => tracing::warn!(pid, timeout = ?limit, "Partial frame from child, closing"),
        }
        self.child_lost(slot).await;
    }

    async fn handle_watchdog(&mut self) {
        let Some(channel) = self.watchdog.as_mut() else {
            return;
        };
        let limit = self.config.reply_timeout;
        let frame = match tokio::time::timeout(limit, channel.recv()).await {
            Ok(Ok(frame)) if !frame.is_empty_read() => frame,
            Ok(Ok(_)) => {
                tracing::error!("Watchdog closed its channel");
                self.watchdog_active = false;
                return;
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Watchdog channel failed");
                self.watchdog_active = false;
                return;
            }
            Err(_) => {
                tracing::error!(timeout = ?limit, "Partial frame from watchdog, no longer listening");
                self.watchdog_active = false;
                return;
            }
        };
        if frame.tag.is_lifecycle_command() {
            tracing::info!(tag = ?frame.tag, "Watchdog command received");
            self.relay(frame.tag).await;
        } else {
            tracing::warn!(tag = ?frame.tag, "Ignoring watchdog message");
        }
    }

    async fn handle_other(&mut self, mut channel: Channel) {
        match channel.role() {
            ChannelRole::Stats | ChannelRole::NoticeSubscriber => {
                if self.handle_stats(&mut channel).await {
                    self.others.push(channel);
                }
            }
            _ => self.handle_unidentified(channel).await,
        }
    }

    /// Returns whether the channel stays open.
    async fn handle_stats(&mut self, channel: &mut Channel) -> bool {
        let message = match messenger::recv_message_within(channel, self.config.reply_timeout).await {
            Ok(message) => message,
            Err(e) if e.is_closed() => {
                tracing::debug!(conn = %channel.id(), "Stats channel closed");
                return false;
            }
            Err(e) => {
                tracing::warn!(conn = %channel.id(), error = %e, "Bad stats message, closing");
                return false;
            }
        };
        let result = match message.tag {
            AdminTag::ReqStatsData => {
                self.stats
                    .handle_request(&mut self.children, channel, message)
                    .await
            }
            AdminTag::StatsNotification => {
                self.stats
                    .handle_notice(&mut self.children, channel, message, &mut self.others)
                    .await
            }
            other => {
                tracing::warn!(conn = %channel.id(), tag = ?other, "Unexpected stats frame, closing");
                return false;
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(conn = %channel.id(), error = %e, "Stats exchange failed, closing");
                false
            }
        }
    }

    async fn handle_unidentified(&mut self, mut channel: Channel) {
        let limit = self.config.reply_timeout;
        let frame = match tokio::time::timeout(limit, channel.recv()).await {
            Ok(Ok(frame)) if frame.is_empty_read() => {
                tracing::trace!(conn = %channel.id(), "Connection closed");
                return;
            }
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                tracing::debug!(conn = %channel.id(), error = %e, "Connection failed");
                return;
            }
            Err(_) => {
                tracing::warn!(conn = %channel.id(), timeout = ?limit, "Partial frame, closing");
                return;
            }
        };

        let tag = frame.tag;
        let keep = match tag {
            AdminTag::EndInit => {
                self.end_init(channel, &frame.text()).await;
                return;
            }
            AdminTag::IdentifyStatsChannel => {
                let enabled = self.stats.is_enabled();
                let text = if enabled {
                    STATS_ENABLED_REPLY
                } else {
                    STATS_DISABLED_REPLY
                };
                let sent = channel.send_text(AdminTag::IdentifyStatsChannelAck, text).await;
                if enabled {
                    channel.set_role(ChannelRole::Stats);
                }
                sent.is_ok()
            }
            _ if tag.is_stats_carrier() => {
                tracing::error!(conn = %channel.id(), ?tag, "Stats frame on an admin channel, closing");
                false
            }
            _ if tag.is_lifecycle_command() => {
                tracing::info!(conn = %channel.id(), ?tag, "Peer command received");
                let ok = self.relay(tag).await;
                if !ok {
                    tracing::warn!(?tag, "Peer command did not reach every child");
                }
                match tag.reply() {
                    Some(reply) => channel.send_text(reply, "").await.is_ok(),
                    None => false,
                }
            }
            _ => match tag.reply() {
                Some(reply) => {
                    let text = self.hooks.answer(tag, &frame.text()).await.unwrap_or_default();
                    channel.send_text(reply, text).await.is_ok()
                }
                None => {
                    tracing::error!(conn = %channel.id(), ?tag, "Unexpected admin message, closing");
                    false
                }
            },
        };
        if keep {
            self.others.push(channel);
        }
    }

    async fn end_init(&mut self, mut channel: Channel, arg: &str) {
        let Ok(pid) = arg.trim().parse::<i32>() else {
            tracing::error!(conn = %channel.id(), arg, "End-init without a pid, closing");
            return;
        };
        let Some(slot) = self.children.free_slot() else {
            tracing::error!(pid, "End-init with every child slot taken, closing");
            return;
        };
        if let Err(e) = channel.send_text(AdminTag::EndInitReply, "").await {
            tracing::warn!(pid, error = %e, "End-init reply failed");
            return;
        }
        // The ack arrives before the parent writes again, so the two never
        // share a read.
        match tokio::time::timeout(self.config.reply_timeout, channel.recv()).await {
            Ok(Ok(frame)) if frame.tag == AdminTag::EndInitReplyAck => {}
            Ok(Ok(frame)) if frame.is_empty_read() => {
                tracing::warn!(pid, "Child closed during end-init");
                return;
            }
            Ok(Ok(frame)) => {
                tracing::debug!(pid, tag = ?frame.tag, "End-init reply was not acknowledged");
            }
            Ok(Err(e)) => {
                tracing::warn!(pid, error = %e, "End-init ack failed");
                return;
            }
            Err(_) => {
                tracing::debug!(pid, "End-init ack timed out");
            }
        }

        channel.set_role(ChannelRole::AdminPeer);
        if let Some(child) = self.children.get_mut(slot) {
            child.channel = Some(channel);
            child.pid = pid;
            child.initialized = true;
        }
        tracing::info!(
            pid,
            slot,
            connected = self.children.connected_count(),
            expected = self.children.len(),
            "Child completed end-init"
        );

        if self.children.all_connected() && !self.watchdog_active {
            self.release_watchdog().await;
        }
        self.stats
            .child_initialized(&mut self.children, slot, &mut self.others)
            .await;
    }

    async fn release_watchdog(&mut self) {
        let count = self.children.len();
        let Some(watchdog) = self.watchdog.as_mut() else {
            return;
        };
        match tokio::time::timeout(
            self.config.reply_timeout,
            watchdog.request(AdminTag::EndInit, count.to_string()),
        )
        .await
        {
            Ok(Ok(_)) => tracing::info!(children = count, "Watchdog released"),
            Ok(Err(e)) => tracing::error!(error = %e, "Watchdog end-init failed"),
            Err(_) => tracing::error!("Watchdog end-init timed out"),
        }
        self.watchdog_active = true;
    }
}
