//! Child side of the stats protocol.
//!
//! [`StatsResponder`] answers the parent's polls on the admin channel from a
//! [`StatsSource`] the embedding server implements. [`ChildNotifier`] owns
//! the child's separate stats channel and pushes notices from its own task,
//! so the admin loop never blocks on a notification ack.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::messenger::{self, ProtocolError, StatsMessage};
use super::types::{
    AccumulatedVsSlot, JdbcPoolInfo, JvmInfo, ListenSlot, ProcessInfo, SessionReplicationInfo,
    ThreadInfo, ThreadMode, ThreadSlotRequest, VirtualServerInfo, WebModuleInfo,
    WebModuleServlets,
};
use crate::bridge::channel::Channel;
use crate::bridge::payload::{encode_str_array, from_payload, to_payload};
use crate::bridge::protocol::{NoticeKind, StatsErrorCode, StatsRequestKind};
use crate::bridge::transport::{ConnectOptions, connect_stats_channel};

/// Live statistics of one child process.
pub trait StatsSource: Send + Sync {
    fn process_info(&self) -> ProcessInfo;

    fn listen_slots(&self) -> Vec<ListenSlot> {
        Vec::new()
    }

    fn vs_ids(&self) -> Vec<String>;

    fn virtual_servers(&self) -> Vec<VirtualServerInfo>;

    fn accumulated_vs(&self) -> AccumulatedVsSlot {
        AccumulatedVsSlot::default()
    }

    /// Deployed web module names, `//<vs-id>/<uri>`.
    fn web_module_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn web_modules(&self) -> Vec<WebModuleInfo> {
        Vec::new()
    }

    fn servlets(&self) -> Vec<WebModuleServlets> {
        Vec::new()
    }

    fn jdbc_pools(&self) -> Vec<JdbcPoolInfo> {
        Vec::new()
    }

    /// `None` until the JVM has started.
    fn jvm(&self) -> Option<JvmInfo> {
        None
    }

    fn session_replication(&self) -> Option<SessionReplicationInfo> {
        None
    }
}

/// Per-thread request data updated by worker threads between polls.
///
/// Every slot has its own lock, taken by the worker and by the snapshot
/// reader.
#[derive(Debug, Clone)]
pub struct LiveThreadSlots {
    slots: Arc<[Mutex<ThreadInfo>]>,
}

impl LiveThreadSlots {
    pub fn new(count: usize) -> Self {
        Self {
            slots: (0..count).map(|_| Mutex::new(ThreadInfo::default())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn lock(&self, index: usize) -> Option<MutexGuard<'_, ThreadInfo>> {
        let slot = self.slots.get(index)?;
        Some(slot.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(index, "Thread slot lock was poisoned, recovering");
            poisoned.into_inner()
        }))
    }

    /// Runs `f` on a thread's slot; `None` when `index` is out of range.
    pub fn update<R>(&self, index: usize, f: impl FnOnce(&mut ThreadInfo) -> R) -> Option<R> {
        self.lock(index).map(|mut slot| f(&mut slot))
    }

    pub fn snapshot(&self, index: usize) -> Option<ThreadInfo> {
        self.lock(index).map(|slot| slot.clone())
    }

    /// Indices of threads that are not empty.
    pub fn indices(&self) -> Vec<i32> {
        (0..self.slots.len())
            .filter(|&i| {
                self.lock(i)
                    .is_some_and(|slot| slot.slot.mode != ThreadMode::Empty)
            })
            .map(|i| i as i32)
            .collect()
    }
}

/// Answers the parent's stats requests on the admin channel.
pub struct StatsResponder {
    source: Arc<dyn StatsSource>,
    threads: LiveThreadSlots,
}

impl StatsResponder {
    pub fn new(source: Arc<dyn StatsSource>, threads: LiveThreadSlots) -> Self {
        Self { source, threads }
    }

    pub fn threads(&self) -> &LiveThreadSlots {
        &self.threads
    }

    fn answer(&self, kind: StatsRequestKind, body: &[u8]) -> Result<Bytes, StatsErrorCode> {
        use StatsRequestKind::*;

        let source = &self.source;
        let payload = match kind {
            GetStatsProcessInfo => to_payload(&source.process_info()),
            GetListenSlotData => to_payload(&source.listen_slots()),
            GetThreadIndexList => to_payload(&self.threads.indices()),
            GetThreadSlotData => {
                let req: ThreadSlotRequest =
                    from_payload(body).map_err(|_| StatsErrorCode::InReq)?;
                let index = usize::try_from(req.index).map_err(|_| StatsErrorCode::InReq)?;
                let thread = self.threads.snapshot(index).ok_or(StatsErrorCode::InReq)?;
                to_payload(&thread)
            }
            GetVsList => encode_str_array(&source.vs_ids()),
            GetStatsVirtualServerInfo => to_payload(&source.virtual_servers()),
            GetAccumulatedVsData => to_payload(&source.accumulated_vs()),
            GetWebModuleList => encode_str_array(&source.web_module_names()),
            GetAllWebModuleData => to_payload(&source.web_modules()),
            GetAllServletData => to_payload(&source.servlets()),
            GetJdbcConnPools => to_payload(&source.jdbc_pools()),
            GetJvmMgmtData => to_payload(&source.jvm()),
            GetSessReplData => to_payload(&source.session_replication()),
            _ => return Err(StatsErrorCode::InReq),
        };
        Ok(payload)
    }

    /// Answers one reassembled request.
    pub async fn handle(&self, channel: &mut Channel, req: &StatsMessage) -> Result<(), ProtocolError> {
        let Some(kind) = req.request_kind() else {
            tracing::warn!(msg_type = req.msg_type, "Unknown stats request from parent");
            return messenger::respond_error(channel, req.msg_type, StatsErrorCode::InReq).await;
        };
        tracing::trace!(?kind, "Answering parent stats request");
        match self.answer(kind, &req.payload) {
            Ok(payload) => messenger::respond(channel, req.msg_type, payload).await,
            Err(code) => messenger::respond_error(channel, req.msg_type, code).await,
        }
    }
}

/// Sends notices to the parent from a dedicated task.
///
/// The stats channel is connected lazily and reconnected after a failure.
#[derive(Debug, Clone)]
pub struct ChildNotifier {
    tx: mpsc::UnboundedSender<(NoticeKind, Bytes)>,
}

impl ChildNotifier {
    pub fn spawn(path: PathBuf, pid: i32, opts: ConnectOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_notifier(path, pid, opts, rx));
        Self { tx }
    }

    /// Queues a notice; delivery failures are logged by the notifier task.
    pub fn notify(&self, kind: NoticeKind) {
        self.notify_with(kind, Bytes::new());
    }

    pub fn notify_with(&self, kind: NoticeKind, payload: Bytes) {
        if self.tx.send((kind, payload)).is_err() {
            tracing::warn!(?kind, "Notifier task has stopped, notice dropped");
        }
    }
}

async fn run_notifier(
    path: PathBuf,
    pid: i32,
    opts: ConnectOptions,
    mut rx: mpsc::UnboundedReceiver<(NoticeKind, Bytes)>,
) {
    let mut channel: Option<Channel> = None;
    while let Some((kind, payload)) = rx.recv().await {
        if channel.is_none() {
            match connect_stats_channel(&path, opts).await {
                Ok(ch) => channel = Some(ch),
                Err(e) => {
                    tracing::warn!(pid, ?kind, error = %e, "Cannot reach parent stats channel");
                    continue;
                }
            }
        }
        let Some(ch) = channel.as_mut() else {
            continue;
        };
        match messenger::notify(ch, kind, pid, payload).await {
            Ok(()) => tracing::debug!(pid, ?kind, "Notice delivered"),
            Err(e) => {
                tracing::warn!(pid, ?kind, error = %e, "Notice delivery failed");
                channel = None;
            }
        }
    }
    tracing::debug!(pid, "Notifier stopped");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bridge::channel::ChannelRole;
    use crate::bridge::payload::decode_str_array;
    use crate::stats::messenger::StatsReply;
    use crate::stats::types::{ProcessSlot, ThreadSlot};
    use tokio::net::UnixStream;

    struct Fixed;

    impl StatsSource for Fixed {
        fn process_info(&self) -> ProcessInfo {
            ProcessInfo {
                slot: ProcessSlot {
                    pid: 77,
                    count_threads: 4,
                    ..Default::default()
                },
                ..Default::default()
            }
        }

        fn vs_ids(&self) -> Vec<String> {
            vec!["vs1".into(), "vs2".into()]
        }

        fn virtual_servers(&self) -> Vec<VirtualServerInfo> {
            Vec::new()
        }
    }

    fn pair() -> (Channel, Channel) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            Channel::new(a, ChannelRole::Client),
            Channel::new(b, ChannelRole::AdminPeer),
        )
    }

    async fn ask(responder: &StatsResponder, kind: StatsRequestKind, body: Bytes) -> StatsReply {
        let (mut child, mut parent) = pair();
        let serve = async {
            let req = messenger::recv_message(&mut child).await.unwrap();
            responder.handle(&mut child, &req).await.unwrap();
        };
        let (reply, ()) = tokio::join!(messenger::request(&mut parent, kind, body), serve);
        reply.unwrap()
    }

    #[test]
    fn live_thread_slots_report_busy_indices() {
        let threads = LiveThreadSlots::new(4);
        threads.update(1, |t| t.slot.mode = ThreadMode::Request);
        threads.update(3, |t| t.slot.mode = ThreadMode::KeepAlive);
        assert_eq!(threads.indices(), vec![1, 3]);
        assert!(threads.update(9, |_| ()).is_none());
        assert_eq!(threads.snapshot(3).unwrap().slot.mode, ThreadMode::KeepAlive);
    }

    #[test]
    fn live_thread_slots_are_shared_between_clones() {
        let threads = LiveThreadSlots::new(2);
        let worker = threads.clone();
        std::thread::spawn(move || {
            worker.update(0, |t| t.slot.vs_id = "vs1".into());
        })
        .join()
        .unwrap();
        assert_eq!(threads.snapshot(0).unwrap().slot.vs_id, "vs1");
    }

    #[tokio::test]
    async fn answers_process_and_vs_list() {
        let responder = StatsResponder::new(Arc::new(Fixed), LiveThreadSlots::new(1));
        let StatsReply::Data(payload) =
            ask(&responder, StatsRequestKind::GetStatsProcessInfo, Bytes::new()).await
        else {
            panic!("expected data");
        };
        let info: ProcessInfo = from_payload(&payload).unwrap();
        assert_eq!(info.slot.pid, 77);

        let StatsReply::Data(payload) = ask(&responder, StatsRequestKind::GetVsList, Bytes::new()).await
        else {
            panic!("expected data");
        };
        assert_eq!(decode_str_array(&payload).unwrap(), vec!["vs1", "vs2"]);
    }

    #[tokio::test]
    async fn answers_thread_slot_by_index() {
        let threads = LiveThreadSlots::new(2);
        threads.update(1, |t| {
            t.slot = ThreadSlot {
                mode: ThreadMode::Processing,
                vs_id: "vs2".into(),
                ..Default::default()
            }
        });
        let responder = StatsResponder::new(Arc::new(Fixed), threads);
        let body = to_payload(&ThreadSlotRequest { pid: 77, index: 1 });
        let StatsReply::Data(payload) = ask(&responder, StatsRequestKind::GetThreadSlotData, body).await
        else {
            panic!("expected data");
        };
        let thread: ThreadInfo = from_payload(&payload).unwrap();
        assert_eq!(thread.slot.vs_id, "vs2");

        let body = to_payload(&ThreadSlotRequest { pid: 77, index: 5 });
        assert_eq!(
            ask(&responder, StatsRequestKind::GetThreadSlotData, body).await,
            StatsReply::Error(StatsErrorCode::InReq)
        );
    }

    #[tokio::test]
    async fn parent_only_requests_are_rejected() {
        let responder = StatsResponder::new(Arc::new(Fixed), LiveThreadSlots::new(1));
        assert_eq!(
            ask(&responder, StatsRequestKind::GetPidList, Bytes::new()).await,
            StatsReply::Error(StatsErrorCode::InReq)
        );
    }

    #[tokio::test]
    async fn jvm_defaults_to_absent() {
        let responder = StatsResponder::new(Arc::new(Fixed), LiveThreadSlots::new(1));
        let StatsReply::Data(payload) = ask(&responder, StatsRequestKind::GetJvmMgmtData, Bytes::new()).await
        else {
            panic!("expected data");
        };
        assert_eq!(from_payload::<Option<JvmInfo>>(&payload).unwrap(), None);
    }
}
