//! Parent stats service.
//!
//! Answers stats requests from the aggregated store after refreshing it by
//! polling the children over their admin channels, handles child notices,
//! and runs the reconfigure barrier: while a reconfigure is in progress no
//! child is polled and requests are served from the cached store.

use std::time::Duration;

use bytes::Bytes;

use super::messenger::{self, ProtocolError, StatsMessage};
use super::render::{DumpQuery, render_perf_dump, render_xml};
use super::types::{
    AccumulatedVsSlot, INVALID_PROCESS_ID, JdbcPoolInfo, JvmInfo, ListenSlot, ProcessInfo,
    ServletRequest, SessionReplicationInfo, ThreadInfo, ThreadMode, ThreadSlotRequest,
    VirtualServerInfo, WebModuleInfo, WebModuleServlets,
};
use crate::admin::children::{ChildConn, ChildTable};
use crate::bridge::channel::{Channel, ChannelRole, ConnId};
use crate::bridge::codec::MAX_PACKET_PAYLOAD;
use crate::bridge::payload::{Wire, encode_str_array, from_payload, to_payload};
use crate::bridge::protocol::{NoticeKind, StatsErrorCode, StatsRequestKind};
use crate::store::{AggregationStore, ProcessNode, SharedStore, StoreError, VsNode, lock};

type PollResult<T> = Result<T, StatsErrorCode>;

/// Upper bound of a `TestGetBigFile` reply.
const MAX_TEST_FILE: usize = 1 << 20;

fn store_code(e: StoreError) -> StatsErrorCode {
    match e {
        StoreError::PidNotFound(_) => StatsErrorCode::PidNotExist,
        StoreError::UnknownVs(_) | StoreError::UnknownWebModule(_) => StatsErrorCode::VsData,
        _ => StatsErrorCode::Process,
    }
}

fn decode_pid(body: &[u8]) -> PollResult<i32> {
    from_payload::<i32>(body).map_err(|_| StatsErrorCode::InReq)
}

fn active_process(store: &AggregationStore, pid: i32) -> PollResult<&ProcessNode> {
    match store.process(pid) {
        Ok(node) if node.is_active() => Ok(node),
        _ => Err(StatsErrorCode::PidNotExist),
    }
}

fn test_file(len: usize) -> Bytes {
    (0..len.min(MAX_TEST_FILE))
        .map(|i| b'a' + (i % 26) as u8)
        .collect::<Vec<_>>()
        .into()
}

pub struct ParentStats {
    store: SharedStore,
    enabled: bool,
    reply_timeout: Duration,
    reconfigure_in_progress: bool,
}

impl ParentStats {
    pub fn new(store: SharedStore, enabled: bool, reply_timeout: Duration) -> Self {
        Self {
            store,
            enabled,
            reply_timeout,
            reconfigure_in_progress: false,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn reconfigure_in_progress(&self) -> bool {
        self.reconfigure_in_progress
    }

    // ---- polling ---------------------------------------------------------

    /// Sends one request to a child. A failed exchange drops the child's
    /// connection; an in-band error is passed through.
    async fn poll<T: Wire>(
        &self,
        child: &mut ChildConn,
        kind: StatsRequestKind,
        body: Bytes,
        fail: StatsErrorCode,
    ) -> PollResult<T> {
        let pid = child.pid;
        let Some(channel) = child.channel.as_mut() else {
            return Err(fail);
        };
        match messenger::query::<T>(channel, kind, body, self.reply_timeout).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(code)) => {
                tracing::debug!(pid, ?kind, ?code, "Child rejected stats request");
                Err(code)
            }
            Err(e) => {
                tracing::warn!(pid, ?kind, error = %e, "Polling child failed, dropping its channel");
                child.reset();
                Err(fail)
            }
        }
    }

    async fn poll_names(
        &self,
        child: &mut ChildConn,
        kind: StatsRequestKind,
        fail: StatsErrorCode,
    ) -> PollResult<Vec<String>> {
        let pid = child.pid;
        let Some(channel) = child.channel.as_mut() else {
            return Err(fail);
        };
        match messenger::query_names(channel, kind, self.reply_timeout).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(pid, ?kind, error = %e, "Polling child failed, dropping its channel");
                child.reset();
                Err(fail)
            }
        }
    }

    fn polling_paused(&self) -> bool {
        if self.reconfigure_in_progress {
            tracing::debug!("Reconfigure in progress, serving cached stats");
        }
        self.reconfigure_in_progress
    }

    /// Fetches a child's process snapshot, claiming a store slot on first
    /// sight, then its listen sockets and virtual server ids.
    async fn init_child_data(&self, children: &mut ChildTable, slot: usize) -> PollResult<()> {
        let child = children.get_mut(slot).ok_or(StatsErrorCode::Process)?;
        let pid = child.pid;
        let mut info: ProcessInfo = self
            .poll(child, StatsRequestKind::GetStatsProcessInfo, Bytes::new(), StatsErrorCode::Process)
            .await?;
        info.slot.pid = pid;
        {
            let mut store = lock(&self.store);
            if child.process_alive {
                store.update_process_slot(&info).map_err(store_code)?;
            } else {
                let claimed = match store.initialize_process_slot(&info) {
                    Err(StoreError::NoFreeProcessSlot(_)) => {
                        // A replacement arrived before anyone released the
                        // died child's slot.
                        store.unmark_last_process_slot();
                        store.initialize_process_slot(&info)
                    }
                    other => other,
                };
                let store_slot = claimed.map_err(store_code)?;
                tracing::info!(pid, slot, store_slot, "Child statistics initialized");
            }
        }
        child.process_alive = true;

        let listen: Vec<ListenSlot> = self
            .poll(child, StatsRequestKind::GetListenSlotData, Bytes::new(), StatsErrorCode::Process)
            .await?;
        lock(&self.store)
            .init_listen_slots(pid, &listen)
            .map_err(store_code)?;

        let ids = self
            .poll_names(child, StatsRequestKind::GetVsList, StatsErrorCode::VsData)
            .await?;
        lock(&self.store).init_vs_list(&ids);
        Ok(())
    }

    async fn init_web_module_list(&self, children: &mut ChildTable, slot: usize) -> PollResult<()> {
        let child = children.get_mut(slot).ok_or(StatsErrorCode::VsData)?;
        let pid = child.pid;
        let names = self
            .poll_names(child, StatsRequestKind::GetWebModuleList, StatsErrorCode::VsData)
            .await?;
        if let Err(e) = lock(&self.store).init_web_modules(pid, &names) {
            tracing::warn!(pid, error = %e, "Some web modules were not registered");
        }
        child.web_modules_initialized = true;
        tracing::debug!(pid, count = names.len(), "Web modules initialized");
        Ok(())
    }

    async fn refresh_process(&self, child: &mut ChildConn) -> PollResult<()> {
        let pid = child.pid;
        let mut info: ProcessInfo = self
            .poll(child, StatsRequestKind::GetStatsProcessInfo, Bytes::new(), StatsErrorCode::Process)
            .await?;
        info.slot.pid = pid;
        lock(&self.store)
            .update_process_slot(&info)
            .map_err(store_code)
    }

    pub async fn update_process_slots(&self, children: &mut ChildTable) -> PollResult<()> {
        if self.polling_paused() {
            return Ok(());
        }
        for child in children.iter_mut() {
            if child.process_alive {
                self.refresh_process(child).await?;
            }
        }
        lock(&self.store).accumulate_process_data();
        Ok(())
    }

    pub async fn update_thread_slots(&self, children: &mut ChildTable, pid: i32) -> PollResult<()> {
        if self.polling_paused() {
            return Ok(());
        }
        let slot = children.slot_of(pid).ok_or(StatsErrorCode::PidNotExist)?;
        let child = children.get_mut(slot).ok_or(StatsErrorCode::PidNotExist)?;
        let indices: Vec<i32> = self
            .poll(child, StatsRequestKind::GetThreadIndexList, Bytes::new(), StatsErrorCode::Process)
            .await?;
        let max_threads = lock(&self.store).header().max_threads as usize;
        let reported = indices.len();
        let indices: Vec<usize> = indices
            .into_iter()
            .filter_map(|i| usize::try_from(i).ok())
            .filter(|&i| i < max_threads)
            .collect();
        if indices.len() < reported {
            tracing::warn!(
                pid,
                reported,
                max_threads,
                "Child reported thread indices outside the configured limit, ignoring them"
            );
        }
        let count = indices.iter().max().map_or(0, |max| max + 1);
        lock(&self.store)
            .reset_thread_slots(pid, count)
            .map_err(store_code)?;

        for index in indices {
            let body = to_payload(&ThreadSlotRequest {
                pid,
                index: index as i32,
            });
            let thread: ThreadInfo = self
                .poll(child, StatsRequestKind::GetThreadSlotData, body, StatsErrorCode::Process)
                .await?;
            lock(&self.store)
                .update_thread_slot(pid, index, thread)
                .map_err(store_code)?;
        }
        Ok(())
    }

    pub async fn update_vs_core_data(&self, children: &mut ChildTable) -> PollResult<()> {
        if self.polling_paused() {
            return Ok(());
        }
        for child in children.iter_mut() {
            if !child.process_alive {
                continue;
            }
            let pid = child.pid;
            let servers: Vec<VirtualServerInfo> = self
                .poll(child, StatsRequestKind::GetStatsVirtualServerInfo, Bytes::new(), StatsErrorCode::VsData)
                .await?;
            let accumulated: AccumulatedVsSlot = self
                .poll(child, StatsRequestKind::GetAccumulatedVsData, Bytes::new(), StatsErrorCode::VsData)
                .await?;

            let mut store = lock(&self.store);
            for info in &servers {
                if let Err(e) = store.update_vs_slot(pid, info) {
                    tracing::warn!(pid, vs = %info.slot.id, error = %e, "Skipping virtual server data");
                }
            }
            store
                .update_accumulated_vs(pid, &accumulated)
                .map_err(store_code)?;
        }
        let mut store = lock(&self.store);
        store.aggregate_vs_data().map_err(store_code)?;
        store.aggregate_accumulated_vs_data();
        Ok(())
    }

    pub async fn update_web_module_data(&self, children: &mut ChildTable) -> PollResult<()> {
        if self.polling_paused() {
            return Ok(());
        }
        for child in children.iter_mut() {
            if !child.process_alive || !child.web_modules_initialized {
                continue;
            }
            let pid = child.pid;
            let modules: Vec<WebModuleInfo> = self
                .poll(child, StatsRequestKind::GetAllWebModuleData, Bytes::new(), StatsErrorCode::VsData)
                .await?;
            let servlets: Vec<WebModuleServlets> = self
                .poll(child, StatsRequestKind::GetAllServletData, Bytes::new(), StatsErrorCode::VsData)
                .await?;

            let mut store = lock(&self.store);
            if let Err(e) = store.update_web_module_data(pid, &modules) {
                tracing::warn!(pid, error = %e, "Web module data out of date");
            }
            for list in &servlets {
                if let Err(e) = store.update_servlet_data(pid, list) {
                    tracing::warn!(pid, error = %e, "Servlet data out of date");
                }
            }
        }
        let mut store = lock(&self.store);
        if let Err(e) = store.aggregate_all_web_module_data() {
            tracing::debug!(error = %e, "Web module views not aggregated");
        }
        if let Err(e) = store.aggregate_all_servlet_data() {
            tracing::debug!(error = %e, "Servlet views not aggregated");
        }
        Ok(())
    }

    pub async fn update_jdbc(&self, children: &mut ChildTable, pid: i32) -> PollResult<()> {
        if self.polling_paused() {
            return Ok(());
        }
        let slot = children.slot_of(pid).ok_or(StatsErrorCode::PidNotExist)?;
        let child = children.get_mut(slot).ok_or(StatsErrorCode::PidNotExist)?;
        let pools: Vec<JdbcPoolInfo> = self
            .poll(child, StatsRequestKind::GetJdbcConnPools, Bytes::new(), StatsErrorCode::Process)
            .await?;
        lock(&self.store)
            .update_jdbc_pools(pid, &pools)
            .map_err(store_code)
    }

    pub async fn update_jvm(&self, children: &mut ChildTable, pid: i32) -> PollResult<()> {
        if self.polling_paused() {
            return Ok(());
        }
        let slot = children.slot_of(pid).ok_or(StatsErrorCode::PidNotExist)?;
        let child = children.get_mut(slot).ok_or(StatsErrorCode::PidNotExist)?;
        let jvm: Option<JvmInfo> = self
            .poll(child, StatsRequestKind::GetJvmMgmtData, Bytes::new(), StatsErrorCode::JvmStatsNoInit)
            .await?;
        lock(&self.store)
            .update_jvm(pid, jvm.as_ref())
            .map_err(store_code)
    }

    /// Collected only with a single child.
    pub async fn update_session_replication(&self, children: &mut ChildTable) -> PollResult<()> {
        if children.len() != 1 {
            return Err(StatsErrorCode::NoSessReplStats);
        }
        if self.polling_paused() {
            return Ok(());
        }
        let child = children.get_mut(0).ok_or(StatsErrorCode::NoSessReplStats)?;
        if !child.process_alive {
            return Err(StatsErrorCode::NoSessReplStats);
        }
        let repl: Option<SessionReplicationInfo> = self
            .poll(child, StatsRequestKind::GetSessReplData, Bytes::new(), StatsErrorCode::NoSessReplStats)
            .await?;
        if let Some(repl) = repl {
            lock(&self.store).update_session_replication(&repl);
        }
        Ok(())
    }

    // ---- lifecycle -------------------------------------------------------

    /// First contact with a child that completed end-init.
    pub async fn child_initialized(
        &mut self,
        children: &mut ChildTable,
        slot: usize,
        subscribers: &mut Vec<Channel>,
    ) {
        if !self.enabled {
            return;
        }
        if let Err(code) = self.init_child_data(children, slot).await {
            tracing::warn!(slot, ?code, "Child statistics not initialized");
            return;
        }
        if self.reconfigure_in_progress
            && let Some(child) = children.get_mut(slot)
        {
            child.got_reconfig_ack = true;
        }
        if children.all_ready() {
            tracing::info!(children = children.len(), "All children initialized");
            self.forward(subscribers, NoticeKind::AllChildInitialized, INVALID_PROCESS_ID)
                .await;
        }
    }

    /// Arms the reconfigure barrier ahead of a reconfigure broadcast.
    pub fn begin_reconfigure(&mut self, children: &ChildTable) {
        if !self.enabled {
            return;
        }
        if children.all_ready() {
            tracing::debug!("Stats reconfigure barrier armed");
            self.reconfigure_in_progress = true;
        } else {
            tracing::debug!("Children not ready, stats reconfigure barrier skipped");
        }
    }

    /// Records `pid`'s reconfigure ack, if any, and completes the barrier
    /// once every live child has acked.
    pub async fn ack_reconfigure(
        &mut self,
        children: &mut ChildTable,
        pid: Option<i32>,
        subscribers: &mut Vec<Channel>,
    ) {
        if !self.reconfigure_in_progress {
            if pid.is_some() {
                tracing::debug!(?pid, "Reconfigure ack outside a reconfigure, ignored");
            }
            return;
        }
        if let Some(child) = pid
            .and_then(|pid| children.slot_of(pid))
            .and_then(|slot| children.get_mut(slot))
        {
            child.got_reconfig_ack = true;
        }
        let done = children
            .iter()
            .filter(|c| !c.process_alive || c.got_reconfig_ack)
            .count();
        if done < children.len() {
            tracing::debug!(done, total = children.len(), "Waiting for reconfigure acks");
            return;
        }

        self.reconfigure_in_progress = false;
        for child in children.iter_mut() {
            child.got_reconfig_ack = false;
        }
        self.do_stats_reconfigure(children).await;
        let count = {
            let mut store = lock(&self.store);
            let header = store.header_mut();
            header.count_reconfig += 1;
            header.count_reconfig
        };
        tracing::info!(count_reconfig = count, "Stats reconfigure complete");
        self.forward(subscribers, NoticeKind::ReconfigureDone, INVALID_PROCESS_ID)
            .await;
    }

    async fn do_stats_reconfigure(&self, children: &mut ChildTable) {
        lock(&self.store).do_reconfigure_changes();
        for slot in 0..children.len() {
            if !children.get(slot).is_some_and(|c| c.process_alive) {
                continue;
            }
            if let Err(code) = self.init_child_data(children, slot).await {
                tracing::warn!(slot, ?code, "Child data not refreshed after reconfigure");
                continue;
            }
            if let Err(code) = self.init_web_module_list(children, slot).await {
                tracing::warn!(slot, ?code, "Web modules not refreshed after reconfigure");
            }
        }
    }

    /// Accounts a died child in the store. Repeated calls for the same pid
    /// count once.
    pub fn child_died(&self, pid: i32) {
        let mut store = lock(&self.store);
        if !store.is_active_pid(pid) {
            return;
        }
        match store.mark_process_slot_empty(pid) {
            Ok(slot) => {
                store.header_mut().count_child_died += 1;
                tracing::info!(pid, slot, "Child process died");
            }
            Err(e) => tracing::debug!(pid, error = %e, "Died child has no process slot"),
        }
    }

    /// Releases a died child's slot for the child about to start.
    pub fn child_starting(&self) {
        match lock(&self.store).unmark_last_process_slot() {
            Some(slot) => tracing::debug!(slot, "Process slot released for new child"),
            None => tracing::debug!("No died child slot to release"),
        }
    }

    /// Bounds an exchange with a client, which may stop reading or acking.
    async fn to_client<F>(&self, exchange: F) -> Result<(), ProtocolError>
    where
        F: Future<Output = Result<(), ProtocolError>>,
    {
        tokio::time::timeout(self.reply_timeout, exchange)
            .await
            .map_err(|_| ProtocolError::Timeout(self.reply_timeout))?
    }

    // ---- notices ---------------------------------------------------------

    async fn forward(&self, subscribers: &mut Vec<Channel>, kind: NoticeKind, sender_pid: i32) {
        let mut failed: Vec<ConnId> = Vec::new();
        for channel in subscribers
            .iter_mut()
            .filter(|c| c.role() == ChannelRole::NoticeSubscriber)
        {
            let sent = tokio::time::timeout(
                self.reply_timeout,
                messenger::notify(channel, kind, sender_pid, Bytes::new()),
            )
            .await;
            match sent {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(conn = %channel.id(), ?kind, error = %e, "Dropping notice subscriber");
                    failed.push(channel.id());
                }
                Err(_) => {
                    tracing::debug!(conn = %channel.id(), ?kind, "Notice subscriber timed out");
                    failed.push(channel.id());
                }
            }
        }
        subscribers.retain(|c| !failed.contains(&c.id()));
        tracing::debug!(?kind, dropped = failed.len(), "Notice forwarded");
    }

    /// Acks a child notice, then acts on it.
    pub async fn handle_notice(
        &mut self,
        children: &mut ChildTable,
        channel: &mut Channel,
        notice: StatsMessage,
        subscribers: &mut Vec<Channel>,
    ) -> Result<(), ProtocolError> {
        self.to_client(messenger::ack_notification(channel, notice.msg_type))
            .await?;
        let pid = notice.sender_pid;
        let Some(kind) = notice.notice_kind() else {
            tracing::warn!(pid, msg_type = notice.msg_type, "Unknown notice");
            return Ok(());
        };
        tracing::debug!(pid, ?kind, "Notice received");

        match kind {
            NoticeKind::WebModuleInit => {
                let Some(slot) = children.slot_of(pid) else {
                    tracing::warn!(pid, "Web module notice from unknown child");
                    return Ok(());
                };
                if let Err(code) = self.init_web_module_list(children, slot).await {
                    tracing::warn!(pid, ?code, "Web module list not fetched");
                    return Ok(());
                }
                if let Some(child) = children.get_mut(slot)
                    && let Err(code) = self.refresh_process(child).await
                {
                    tracing::debug!(pid, ?code, "Process slot not refreshed");
                }
                let all = children.all_ready() && children.iter().all(|c| c.web_modules_initialized);
                if all {
                    lock(&self.store).header_mut().webapps_enabled = true;
                    self.forward(subscribers, NoticeKind::WebModuleInit, pid).await;
                }
            }
            NoticeKind::ReconfigureDone => {
                self.ack_reconfigure(children, Some(pid), subscribers).await;
            }
            NoticeKind::JvmInitialized => {
                lock(&self.store).header_mut().jvm_enabled = true;
                if let Err(code) = self.update_jvm(children, pid).await {
                    tracing::debug!(pid, ?code, "JVM data not fetched");
                }
            }
            NoticeKind::JdbcNodesCountChanged => {
                if let Err(code) = self.update_jdbc(children, pid).await {
                    tracing::debug!(pid, ?code, "JDBC pools not fetched");
                }
                self.forward(subscribers, kind, pid).await;
            }
            NoticeKind::SessReplNodeCountChanged => {
                if let Err(code) = self.update_session_replication(children).await {
                    tracing::debug!(pid, ?code, "Session replication not fetched");
                }
                self.forward(subscribers, kind, pid).await;
            }
            NoticeKind::VsCoreDataChange => {
                if let Err(code) = self.update_vs_core_data(children).await {
                    tracing::debug!(pid, ?code, "Virtual server data not fetched");
                }
            }
            NoticeKind::AllChildInitialized => {
                tracing::debug!(pid, "Ignoring parent-only notice from child");
            }
        }
        Ok(())
    }

    // ---- requests --------------------------------------------------------

    /// Answers one stats request from a client or tool.
    pub async fn handle_request(
        &mut self,
        children: &mut ChildTable,
        channel: &mut Channel,
        req: StatsMessage,
    ) -> Result<(), ProtocolError> {
        let Some(kind) = req.request_kind() else {
            tracing::warn!(msg_type = req.msg_type, "Unknown stats request");
            return self
                .to_client(messenger::respond_error(channel, req.msg_type, StatsErrorCode::InReq))
                .await;
        };
        tracing::debug!(conn = %channel.id(), ?kind, "Stats request");

        match kind {
            StatsRequestKind::IdentifyAsNoticeReceiver => {
                channel.set_role(ChannelRole::NoticeSubscriber);
                return self
                    .to_client(messenger::respond(channel, req.msg_type, Bytes::new()))
                    .await;
            }
            _ if !children.all_ready() => {
                return self
                    .to_client(messenger::respond_error(channel, req.msg_type, StatsErrorCode::NotReady))
                    .await;
            }
            StatsRequestKind::GetStatsXmlData | StatsRequestKind::GetServiceDump => {
                return self.serve_dump(children, channel, kind, &req.payload).await;
            }
            _ => {}
        }

        match self.answer(children, kind, &req.payload).await {
            Ok(payload) => self.to_client(messenger::respond(channel, req.msg_type, payload)).await,
            Err(code) => {
                self.to_client(messenger::respond_error(channel, req.msg_type, code))
                    .await
            }
        }
    }

    async fn answer(
        &self,
        children: &mut ChildTable,
        kind: StatsRequestKind,
        body: &[u8],
    ) -> PollResult<Bytes> {
        use StatsRequestKind::*;

        let payload = match kind {
            GetStatsHeader => {
                let mut store = lock(&self.store);
                let header = store.header_mut();
                let elapsed = chrono::Utc::now().timestamp_micros() - header.time_started;
                header.seconds_running = u32::try_from(elapsed / 1_000_000).unwrap_or(0);
                to_payload(&*header)
            }
            GetCpuInfo => to_payload(&lock(&self.store).cpu_info().to_vec()),
            GetStringStore => lock(&self.store).string_store().clone(),
            GetPidList => {
                self.update_process_slots(children).await?;
                to_payload(&lock(&self.store).pids())
            }
            GetStatsProcessInfo => {
                let pid = decode_pid(body)?;
                self.update_process_slots(children).await?;
                let store = lock(&self.store);
                if pid == INVALID_PROCESS_ID {
                    to_payload(&store.accumulated_process().to_info())
                } else {
                    to_payload(&active_process(&store, pid)?.to_info())
                }
            }
            GetListenSlotData => {
                let pid = decode_pid(body)?;
                let store = lock(&self.store);
                to_payload(&active_process(&store, pid)?.listen_slots)
            }
            GetThreadIndexList => {
                let pid = decode_pid(body)?;
                if !lock(&self.store).is_active_pid(pid) {
                    return Err(StatsErrorCode::PidNotExist);
                }
                self.update_thread_slots(children, pid).await?;
                let store = lock(&self.store);
                let indices: Vec<i32> = active_process(&store, pid)?
                    .threads
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.slot.mode != ThreadMode::Empty)
                    .map(|(i, _)| i as i32)
                    .collect();
                to_payload(&indices)
            }
            GetThreadSlotData => {
                let req: ThreadSlotRequest = from_payload(body).map_err(|_| StatsErrorCode::InReq)?;
                let index = usize::try_from(req.index).map_err(|_| StatsErrorCode::InReq)?;
                let store = lock(&self.store);
                active_process(&store, req.pid)?;
                to_payload(store.thread(req.pid, index).map_err(|_| StatsErrorCode::InReq)?)
            }
            GetVsList => encode_str_array(&lock(&self.store).vs_ids()),
            GetStatsVirtualServerInfo => {
                self.update_vs_core_data(children).await?;
                let servers: Vec<VirtualServerInfo> =
                    lock(&self.store).virtual_servers().map(VsNode::to_info).collect();
                to_payload(&servers)
            }
            GetAccumulatedVsData => {
                self.update_vs_core_data(children).await?;
                to_payload(lock(&self.store).accumulated_vs())
            }
            GetWebModuleList => encode_str_array(&lock(&self.store).web_module_names()),
            GetWebModuleData => {
                let name: String = from_payload(body).map_err(|_| StatsErrorCode::InReq)?;
                self.update_web_module_data(children).await?;
                let module = lock(&self.store).web_module(&name).ok_or(StatsErrorCode::VsData)?;
                to_payload(&module)
            }
            GetAllWebModuleData => {
                self.update_web_module_data(children).await?;
                to_payload(&lock(&self.store).all_web_modules())
            }
            GetServletData => {
                let req: ServletRequest = from_payload(body).map_err(|_| StatsErrorCode::InReq)?;
                self.update_web_module_data(children).await?;
                let servlets = lock(&self.store)
                    .servlets(&req.web_module)
                    .ok_or(StatsErrorCode::VsData)?;
                to_payload(&servlets)
            }
            GetAllServletData => {
                self.update_web_module_data(children).await?;
                to_payload(&lock(&self.store).all_servlets())
            }
            GetJdbcConnPools => {
                let pid = decode_pid(body)?;
                if !lock(&self.store).is_active_pid(pid) {
                    return Err(StatsErrorCode::PidNotExist);
                }
                self.update_jdbc(children, pid).await?;
                let store = lock(&self.store);
                let pools: Vec<JdbcPoolInfo> =
                    active_process(&store, pid)?.jdbc_pools.iter().cloned().collect();
                to_payload(&pools)
            }
            GetJvmMgmtData => {
                let pid = decode_pid(body)?;
                if !lock(&self.store).header().jvm_enabled {
                    return Err(StatsErrorCode::JvmStatsNoInit);
                }
                if !lock(&self.store).is_active_pid(pid) {
                    return Err(StatsErrorCode::PidNotExist);
                }
                self.update_jvm(children, pid).await?;
                let store = lock(&self.store);
                let jvm = active_process(&store, pid)?
                    .jvm
                    .clone()
                    .ok_or(StatsErrorCode::JvmStatsNoInit)?;
                to_payload(&jvm)
            }
            GetSessReplData => {
                self.update_session_replication(children).await?;
                let repl = lock(&self.store)
                    .session_replication()
                    .cloned()
                    .ok_or(StatsErrorCode::NoSessReplStats)?;
                to_payload(&repl)
            }
            TestGetBigFile => {
                let len = if body.is_empty() {
                    3 * MAX_PACKET_PAYLOAD + 17
                } else {
                    usize::try_from(decode_pid(body)?).map_err(|_| StatsErrorCode::InReq)?
                };
                test_file(len)
            }
            GetStatsXmlData | GetStatsXmlDataAck | GetServiceDump | GetServiceDumpAck
            | IdentifyAsNoticeReceiver => return Err(StatsErrorCode::InReq),
        };
        Ok(payload)
    }

    async fn refresh_for_dump(&self, children: &mut ChildTable, query: &DumpQuery) -> PollResult<()> {
        self.update_process_slots(children).await?;
        if query.thread {
            let pids: Vec<i32> = children
                .iter()
                .filter(|c| c.process_alive)
                .map(|c| c.pid)
                .collect();
            for pid in pids {
                self.update_thread_slots(children, pid).await?;
            }
        }
        if query.virtual_server {
            self.update_vs_core_data(children).await?;
            if query.web_module {
                self.update_web_module_data(children).await?;
            }
        }
        if query.session_replication
            && children.len() == 1
            && let Err(code) = self.update_session_replication(children).await
        {
            tracing::debug!(?code, "Session replication left out of dump");
        }
        Ok(())
    }

    async fn serve_dump(
        &self,
        children: &mut ChildTable,
        channel: &mut Channel,
        kind: StatsRequestKind,
        body: &[u8],
    ) -> Result<(), ProtocolError> {
        let query = if body.is_empty() {
            Ok(String::new())
        } else {
            from_payload::<String>(body)
        };
        let Ok(query) = query else {
            return self
                .to_client(messenger::respond_error(channel, kind.as_i32(), StatsErrorCode::InReq))
                .await;
        };
        let query = DumpQuery::parse(&query);
        if let Err(code) = self.refresh_for_dump(children, &query).await {
            return self
                .to_client(messenger::respond_error(channel, kind.as_i32(), code))
                .await;
        }
        let text = {
            let store = lock(&self.store);
            match kind {
                StatsRequestKind::GetStatsXmlData => render_xml(&store, &query),
                _ => render_perf_dump(&store),
            }
        };
        tracing::debug!(?kind, len = text.len(), "Streaming dump");
        self.to_client(messenger::stream_dump(channel, kind, &text)).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::stats::child::{LiveThreadSlots, StatsResponder, StatsSource};
    use crate::stats::messenger::StatsReply;
    use crate::stats::types::{HeaderSlot, ProcessSlot, RequestBucket, VirtualServerSlot, VsMode};
    use std::sync::Arc;
    use tokio::net::UnixStream;
    use tokio::task::JoinHandle;

    struct FakeChild {
        pid: i32,
        requests: u64,
    }

    impl StatsSource for FakeChild {
        fn process_info(&self) -> ProcessInfo {
            ProcessInfo {
                slot: ProcessSlot {
                    pid: self.pid,
                    peak_connections: self.pid as u32 % 100,
                    ..Default::default()
                },
                ..Default::default()
            }
        }

        fn vs_ids(&self) -> Vec<String> {
            vec!["vs1".into()]
        }

        fn virtual_servers(&self) -> Vec<VirtualServerInfo> {
            vec![VirtualServerInfo {
                slot: VirtualServerSlot {
                    mode: VsMode::Active,
                    id: "vs1".into(),
                    request_bucket: RequestBucket {
                        count_requests: self.requests,
                        ..Default::default()
                    },
                },
                ..Default::default()
            }]
        }
    }

    /// Serves parent polls for a fake child until the channel closes.
    fn spawn_child(pid: i32, requests: u64, channel: Channel) -> JoinHandle<()> {
        spawn_child_with(pid, requests, LiveThreadSlots::new(2), channel)
    }

    fn spawn_child_with(
        pid: i32,
        requests: u64,
        threads: LiveThreadSlots,
        channel: Channel,
    ) -> JoinHandle<()> {
        let responder = StatsResponder::new(Arc::new(FakeChild { pid, requests }), threads);
        let mut channel = channel;
        tokio::spawn(async move {
            while let Ok(req) = messenger::recv_message(&mut channel).await {
                if responder.handle(&mut channel, &req).await.is_err() {
                    break;
                }
            }
        })
    }

    fn parent_with(layout: &[(i32, u64)]) -> (ParentStats, ChildTable, Vec<JoinHandle<()>>) {
        let store = AggregationStore::new(layout.len(), HeaderSlot::default()).into_shared();
        let stats = ParentStats::new(store, true, Duration::from_secs(5));
        let mut table = ChildTable::new(layout.len());
        let mut tasks = Vec::new();
        for (slot, &(pid, requests)) in layout.iter().enumerate() {
            let (a, b) = UnixStream::pair().unwrap();
            let conn = table.get_mut(slot).unwrap();
            conn.channel = Some(Channel::new(a, ChannelRole::AdminPeer));
            conn.pid = pid;
            conn.initialized = true;
            tasks.push(spawn_child(pid, requests, Channel::new(b, ChannelRole::Client)));
        }
        (stats, table, tasks)
    }

    async fn client_request(
        stats: &mut ParentStats,
        table: &mut ChildTable,
        kind: StatsRequestKind,
        body: Bytes,
    ) -> StatsReply {
        let (a, b) = UnixStream::pair().unwrap();
        let mut server = Channel::new(a, ChannelRole::Stats);
        let mut client = Channel::new(b, ChannelRole::Client);
        let serve = async {
            let req = messenger::recv_message(&mut server).await.unwrap();
            stats.handle_request(table, &mut server, req).await.unwrap();
        };
        let (reply, ()) = tokio::join!(messenger::request(&mut client, kind, body), serve);
        reply.unwrap()
    }

    #[tokio::test]
    async fn requests_are_refused_until_children_initialized() {
        let (mut stats, mut table, _tasks) = parent_with(&[(101, 1), (102, 2)]);
        let reply = client_request(&mut stats, &mut table, StatsRequestKind::GetPidList, Bytes::new()).await;
        assert_eq!(reply, StatsReply::Error(StatsErrorCode::NotReady));

        let mut subscribers = Vec::new();
        for slot in 0..2 {
            stats.child_initialized(&mut table, slot, &mut subscribers).await;
        }
        assert!(table.all_ready());
        let StatsReply::Data(payload) =
            client_request(&mut stats, &mut table, StatsRequestKind::GetPidList, Bytes::new()).await
        else {
            panic!("expected pid list");
        };
        assert_eq!(from_payload::<Vec<i32>>(&payload).unwrap(), vec![101, 102]);
    }

    #[tokio::test]
    async fn virtual_server_counters_are_summed() {
        let (mut stats, mut table, _tasks) = parent_with(&[(101, 10), (102, 32)]);
        let mut subscribers = Vec::new();
        for slot in 0..2 {
            stats.child_initialized(&mut table, slot, &mut subscribers).await;
        }
        let StatsReply::Data(payload) = client_request(
            &mut stats,
            &mut table,
            StatsRequestKind::GetStatsVirtualServerInfo,
            Bytes::new(),
        )
        .await
        else {
            panic!("expected virtual servers");
        };
        let servers: Vec<VirtualServerInfo> = from_payload(&payload).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].slot.request_bucket.count_requests, 42);
    }

    #[tokio::test]
    async fn retired_pid_is_reported() {
        let (mut stats, mut table, _tasks) = parent_with(&[(101, 1)]);
        let mut subscribers = Vec::new();
        stats.child_initialized(&mut table, 0, &mut subscribers).await;

        let reply = client_request(
            &mut stats,
            &mut table,
            StatsRequestKind::GetStatsProcessInfo,
            to_payload(&999i32),
        )
        .await;
        assert_eq!(reply, StatsReply::Error(StatsErrorCode::PidNotExist));

        let reply = client_request(
            &mut stats,
            &mut table,
            StatsRequestKind::GetJvmMgmtData,
            to_payload(&101i32),
        )
        .await;
        assert_eq!(reply, StatsReply::Error(StatsErrorCode::JvmStatsNoInit));
    }

    #[tokio::test]
    async fn session_replication_needs_single_child() {
        let (mut stats, mut table, _tasks) = parent_with(&[(101, 1), (102, 1)]);
        let mut subscribers = Vec::new();
        for slot in 0..2 {
            stats.child_initialized(&mut table, slot, &mut subscribers).await;
        }
        let reply =
            client_request(&mut stats, &mut table, StatsRequestKind::GetSessReplData, Bytes::new()).await;
        assert_eq!(reply, StatsReply::Error(StatsErrorCode::NoSessReplStats));
    }

    #[tokio::test]
    async fn reconfigure_barrier_waits_for_every_child() {
        let (mut stats, mut table, _tasks) = parent_with(&[(101, 1), (102, 1)]);
        let mut subscribers = Vec::new();
        for slot in 0..2 {
            stats.child_initialized(&mut table, slot, &mut subscribers).await;
        }

        stats.begin_reconfigure(&table);
        assert!(stats.reconfigure_in_progress());
        stats.ack_reconfigure(&mut table, Some(101), &mut subscribers).await;
        assert!(stats.reconfigure_in_progress());
        assert_eq!(lock(stats.store()).header().count_reconfig, 0);

        stats.ack_reconfigure(&mut table, Some(102), &mut subscribers).await;
        assert!(!stats.reconfigure_in_progress());
        assert_eq!(lock(stats.store()).header().count_reconfig, 1);
        assert!(table.iter().all(|c| !c.got_reconfig_ack));
    }

    #[tokio::test]
    async fn died_child_counts_as_reconfigure_ack() {
        let (mut stats, mut table, _tasks) = parent_with(&[(101, 1), (102, 1)]);
        let mut subscribers = Vec::new();
        for slot in 0..2 {
            stats.child_initialized(&mut table, slot, &mut subscribers).await;
        }

        stats.begin_reconfigure(&table);
        stats.ack_reconfigure(&mut table, Some(101), &mut subscribers).await;
        assert!(stats.reconfigure_in_progress());

        // The same sequence the admin loop runs when a child's channel drops.
        let slot = table.slot_of(102).unwrap();
        drop(table.get_mut(slot).unwrap().reset());
        stats.child_died(102);
        stats.ack_reconfigure(&mut table, None, &mut subscribers).await;

        assert!(!stats.reconfigure_in_progress());
        let store = lock(stats.store());
        assert_eq!(store.header().count_reconfig, 1);
        assert_eq!(store.header().count_child_died, 1);
    }

    #[tokio::test]
    async fn thread_slots_are_capped_at_max_threads() {
        let header = HeaderSlot {
            max_threads: 4,
            ..HeaderSlot::default()
        };
        let store = AggregationStore::new(1, header).into_shared();
        let mut stats = ParentStats::new(store, true, Duration::from_secs(5));
        let mut table = ChildTable::new(1);
        let (a, b) = UnixStream::pair().unwrap();
        let conn = table.get_mut(0).unwrap();
        conn.channel = Some(Channel::new(a, ChannelRole::AdminPeer));
        conn.pid = 101;
        conn.initialized = true;
        let threads = LiveThreadSlots::new(8);
        for index in 0..8 {
            threads.update(index, |t| t.slot.mode = ThreadMode::Processing);
        }
        let _task = spawn_child_with(101, 1, threads, Channel::new(b, ChannelRole::Client));
        let mut subscribers = Vec::new();
        stats.child_initialized(&mut table, 0, &mut subscribers).await;

        assert_eq!(stats.update_thread_slots(&mut table, 101).await, Ok(()));
        let store = lock(stats.store());
        assert_eq!(store.process(101).unwrap().threads.len(), 4);
        assert!(store.thread(101, 4).is_err());
    }

    #[tokio::test]
    async fn polling_pauses_during_reconfigure() {
        let (mut stats, mut table, tasks) = parent_with(&[(101, 1)]);
        let mut subscribers = Vec::new();
        stats.child_initialized(&mut table, 0, &mut subscribers).await;
        stats.begin_reconfigure(&table);

        // With the child gone, only a paused poll can succeed.
        for task in tasks {
            task.abort();
        }
        assert_eq!(stats.update_process_slots(&mut table).await, Ok(()));
        assert!(table.get(0).unwrap().initialized);
    }

    #[tokio::test]
    async fn died_child_is_counted_once() {
        let (mut stats, mut table, _tasks) = parent_with(&[(101, 1)]);
        let mut subscribers = Vec::new();
        stats.child_initialized(&mut table, 0, &mut subscribers).await;

        stats.child_died(101);
        stats.child_died(101);
        let store = lock(stats.store());
        assert_eq!(store.header().count_child_died, 1);
        assert_eq!(store.last_died_slot(), Some(0));
    }

    #[tokio::test]
    async fn big_test_file_is_fragmented() {
        let (mut stats, mut table, _tasks) = parent_with(&[(101, 1)]);
        let mut subscribers = Vec::new();
        stats.child_initialized(&mut table, 0, &mut subscribers).await;
        let StatsReply::Data(payload) =
            client_request(&mut stats, &mut table, StatsRequestKind::TestGetBigFile, Bytes::new()).await
        else {
            panic!("expected test file");
        };
        assert_eq!(payload.len(), 3 * MAX_PACKET_PAYLOAD + 17);
        assert_eq!(&payload[..3], b"abc");
    }

    #[tokio::test]
    async fn xml_dump_streams_aggregated_data() {
        let (mut stats, mut table, _tasks) = parent_with(&[(101, 5)]);
        let mut subscribers = Vec::new();
        stats.child_initialized(&mut table, 0, &mut subscribers).await;

        let (a, b) = UnixStream::pair().unwrap();
        let mut server = Channel::new(a, ChannelRole::Stats);
        let mut client = Channel::new(b, ChannelRole::Client);
        let serve = async {
            let req = messenger::recv_message(&mut server).await.unwrap();
            stats.handle_request(&mut table, &mut server, req).await.unwrap();
        };
        let (dump, ()) = tokio::join!(
            messenger::fetch_dump(&mut client, StatsRequestKind::GetStatsXmlData, "thread=0"),
            serve
        );
        let xml = dump.unwrap().unwrap();
        assert!(xml.contains("<process pid=\"101\""));
        assert!(xml.contains("countRequests=\"5\""));
    }
}
