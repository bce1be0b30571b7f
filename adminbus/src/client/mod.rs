//! Stats client for admin tooling.
//!
//! [`StatsClient`] pulls the header once, then fetches the rest lazily.
//! Structural lists (pids, virtual server ids, web module names, listen
//! sockets) are cached until the server's reconfigure or child-death count
//! moves; per-object data is fetched on every call. A client that misses an
//! epoch between two refreshes only sees the latest state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;

use crate::bridge::channel::{Channel, ChannelError};
use crate::bridge::payload::{PayloadError, Wire, decode_str_array, from_payload, to_payload};
use crate::bridge::protocol::{AdminTag, NoticeKind, StatsErrorCode, StatsRequestKind};
use crate::bridge::transport::{ConnectOptions, connect_stats_channel};
use crate::config::AdminConfig;
use crate::stats::messenger::{self, ProtocolError, StatsReply};
use crate::stats::types::{
    AccumulatedVsSlot, CpuInfoSlot, HeaderSlot, INVALID_PROCESS_ID, JdbcPoolInfo, JvmInfo,
    ListenSlot, ProcessInfo, ServletInfo, ServletRequest, SessionReplicationInfo, ThreadInfo,
    ThreadSlotRequest, VirtualServerInfo, WebModuleInfo, WebModuleServlets,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no connection to the server: {0}")]
    NoConnection(String),
    #[error("server is busy, retry later")]
    ServerBusy,
    #[error("process {0} no longer exists")]
    PidNotExist(i32),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("unknown server error code {0}")]
    Unknown(i32),
    #[error("process {0} is not a server process")]
    IllegalPid(i32),
    #[error("virtual server {0} not found")]
    VsNotFound(String),
    #[error("web module {0} not found")]
    WebModuleNotFound(String),
    #[error("servlet {servlet} not found in {web_module}")]
    ServletNotFound { web_module: String, servlet: String },
    #[error("no jvm statistics for process {0}")]
    JvmNotFound(i32),
    #[error("jdbc pool {0} not found")]
    JdbcNotFound(String),
    #[error("session replication statistics not found")]
    SessReplNotFound,
    #[error("statistics are disabled on the server")]
    StatsDisabled,
}

impl From<ChannelError> for ClientError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::StatsDisabled => ClientError::StatsDisabled,
            other => ClientError::NoConnection(other.to_string()),
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::UnknownErrorCode(code) => ClientError::Unknown(code),
            ProtocolError::Channel(e) => e.into(),
            other if other.is_closed() => ClientError::NoConnection(other.to_string()),
            other => ClientError::Internal(other.to_string()),
        }
    }
}

impl From<PayloadError> for ClientError {
    fn from(e: PayloadError) -> Self {
        ClientError::Internal(format!("malformed reply: {}", e))
    }
}

/// Maps an in-band error; `missing` names what the request was about.
fn code_error(code: StatsErrorCode, missing: impl FnOnce() -> ClientError) -> ClientError {
    match code {
        StatsErrorCode::NotReady => ClientError::ServerBusy,
        StatsErrorCode::PidNotExist
        | StatsErrorCode::VsData
        | StatsErrorCode::JvmStatsNoInit
        | StatsErrorCode::NoSessReplStats => missing(),
        StatsErrorCode::InReq => ClientError::Internal("request rejected as malformed".into()),
        StatsErrorCode::Process => ClientError::Internal("server failed to collect process data".into()),
    }
}

fn internal(code: StatsErrorCode) -> ClientError {
    code_error(code, || ClientError::Internal(code.to_string()))
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub path: PathBuf,
    pub connect: ConnectOptions,
    pub reply_timeout: Duration,
    /// Reconnect attempts after a transport failure.
    pub retries: u32,
}

impl ClientOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            connect: ConnectOptions::default(),
            reply_timeout: Duration::from_secs(30),
            retries: 1,
        }
    }

    pub fn from_config(config: &AdminConfig) -> Self {
        Self {
            path: config.socket_path(),
            connect: config.client_connect_options(),
            reply_timeout: config.reply_timeout,
            retries: config.client_retries,
        }
    }
}

/// What a [`StatsClient::refresh`] observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Refresh {
    pub reconfigured: bool,
    pub child_died: bool,
}

#[derive(Debug, Default)]
struct Cache {
    cpu_info: Option<Vec<CpuInfoSlot>>,
    string_store: Option<Bytes>,
    pids: Option<Vec<i32>>,
    vs_ids: Option<Vec<String>>,
    web_module_names: Option<Vec<String>>,
    listen_slots: HashMap<i32, Vec<ListenSlot>>,
}

pub struct StatsClient {
    options: ClientOptions,
    channel: Option<Channel>,
    header: Option<HeaderSlot>,
    cache: Cache,
}

impl StatsClient {
    /// Connects and pulls the header.
    pub async fn connect(options: ClientOptions) -> Result<Self, ClientError> {
        let mut client = Self {
            options,
            channel: None,
            header: None,
            cache: Cache::default(),
        };
        client.refresh().await?;
        Ok(client)
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.channel.as_ref().is_some_and(Channel::is_alive)
    }

    /// Header from the last refresh.
    pub fn header(&self) -> Option<&HeaderSlot> {
        self.header.as_ref()
    }

    async fn channel(&mut self) -> Result<&mut Channel, ClientError> {
        if !self.is_connected() {
            let channel = connect_stats_channel(&self.options.path, self.options.connect).await?;
            tracing::debug!(path = %self.options.path.display(), conn = %channel.id(), "Stats client connected");
            self.channel = Some(channel);
        }
        self.channel
            .as_mut()
            .ok_or_else(|| ClientError::NoConnection("channel unavailable".into()))
    }

    fn disconnect(&mut self) {
        self.channel = None;
        // A new connection may reach a restarted server.
        self.header = None;
        self.cache = Cache::default();
    }

    /// One request with reconnects on transport failures.
    async fn fetch(
        &mut self,
        kind: StatsRequestKind,
        body: Bytes,
    ) -> Result<Result<Bytes, StatsErrorCode>, ClientError> {
        let limit = self.options.reply_timeout;
        let mut attempt = 0;
        loop {
            let result = match self.channel().await {
                Ok(channel) => messenger::request_within(channel, kind, body.clone(), limit)
                    .await
                    .map_err(ClientError::from),
                Err(e) => Err(e),
            };
            match result {
                Ok(StatsReply::Data(payload)) => return Ok(Ok(payload)),
                Ok(StatsReply::Error(code)) => return Ok(Err(code)),
                Err(e @ (ClientError::StatsDisabled | ClientError::Unknown(_))) => return Err(e),
                Err(e) => {
                    self.disconnect();
                    if attempt >= self.options.retries {
                        return Err(e);
                    }
                    attempt += 1;
                    tracing::debug!(?kind, attempt, error = %e, "Retrying stats request");
                }
            }
        }
    }

    async fn query<T: Wire>(
        &mut self,
        kind: StatsRequestKind,
        body: Bytes,
        missing: impl FnOnce() -> ClientError,
    ) -> Result<T, ClientError> {
        match self.fetch(kind, body).await? {
            Ok(payload) => Ok(from_payload(&payload)?),
            Err(code) => Err(code_error(code, missing)),
        }
    }

    async fn query_names(&mut self, kind: StatsRequestKind) -> Result<Vec<String>, ClientError> {
        match self.fetch(kind, Bytes::new()).await? {
            Ok(payload) => Ok(decode_str_array(&payload)?),
            Err(code) => Err(internal(code)),
        }
    }

    /// Re-reads the header and drops cached lists invalidated by a
    /// reconfigure or a child death since the previous refresh.
    pub async fn refresh(&mut self) -> Result<Refresh, ClientError> {
        let header: HeaderSlot = self
            .query(StatsRequestKind::GetStatsHeader, Bytes::new(), || {
                ClientError::Internal("header unavailable".into())
            })
            .await?;
        let seen = match self.header.as_ref() {
            Some(old) => Refresh {
                reconfigured: header.count_reconfig != old.count_reconfig,
                child_died: header.count_child_died != old.count_child_died,
            },
            None => Refresh::default(),
        };
        if seen.reconfigured {
            tracing::debug!(count = header.count_reconfig, "Server reconfigured, dropping structure");
            self.cache.vs_ids = None;
            self.cache.web_module_names = None;
            self.cache.listen_slots.clear();
        }
        if seen.child_died {
            tracing::debug!(count = header.count_child_died, "Server child died, dropping process lists");
            self.cache.pids = None;
            self.cache.listen_slots.clear();
        }
        self.header = Some(header);
        Ok(seen)
    }

    pub async fn cpu_info(&mut self) -> Result<&[CpuInfoSlot], ClientError> {
        if self.cache.cpu_info.is_none() {
            let cpus = self
                .query(StatsRequestKind::GetCpuInfo, Bytes::new(), || {
                    ClientError::Internal("cpu info unavailable".into())
                })
                .await?;
            self.cache.cpu_info = Some(cpus);
        }
        Ok(self.cache.cpu_info.as_deref().unwrap_or_default())
    }

    pub async fn string_store(&mut self) -> Result<Bytes, ClientError> {
        if let Some(strings) = &self.cache.string_store {
            return Ok(strings.clone());
        }
        let strings = self
            .fetch(StatsRequestKind::GetStringStore, Bytes::new())
            .await?
            .map_err(internal)?;
        self.cache.string_store = Some(strings.clone());
        Ok(strings)
    }

    pub async fn pids(&mut self) -> Result<Vec<i32>, ClientError> {
        if let Some(pids) = &self.cache.pids {
            return Ok(pids.clone());
        }
        let pids: Vec<i32> = self
            .query(StatsRequestKind::GetPidList, Bytes::new(), || {
                ClientError::Internal("pid list unavailable".into())
            })
            .await?;
        self.cache.pids = Some(pids.clone());
        Ok(pids)
    }

    async fn check_pid(&mut self, pid: i32) -> Result<(), ClientError> {
        if pid == INVALID_PROCESS_ID || self.pids().await?.contains(&pid) {
            Ok(())
        } else {
            Err(ClientError::IllegalPid(pid))
        }
    }

    fn retired(&mut self, pid: i32) -> ClientError {
        self.cache.pids = None;
        self.cache.listen_slots.remove(&pid);
        ClientError::PidNotExist(pid)
    }

    async fn per_process<T: Wire>(
        &mut self,
        kind: StatsRequestKind,
        pid: i32,
        body: Bytes,
        missing: impl FnOnce() -> ClientError,
    ) -> Result<T, ClientError> {
        self.check_pid(pid).await?;
        match self.fetch(kind, body).await? {
            Ok(payload) => Ok(from_payload(&payload)?),
            Err(StatsErrorCode::PidNotExist) => Err(self.retired(pid)),
            Err(code) => Err(code_error(code, missing)),
        }
    }

    /// Process snapshot; `INVALID_PROCESS_ID` asks for the accumulated view.
    pub async fn process(&mut self, pid: i32) -> Result<ProcessInfo, ClientError> {
        self.per_process(
            StatsRequestKind::GetStatsProcessInfo,
            pid,
            to_payload(&pid),
            || ClientError::PidNotExist(pid),
        )
        .await
    }

    pub async fn listen_slots(&mut self, pid: i32) -> Result<Vec<ListenSlot>, ClientError> {
        if let Some(slots) = self.cache.listen_slots.get(&pid) {
            return Ok(slots.clone());
        }
        let slots: Vec<ListenSlot> = self
            .per_process(
                StatsRequestKind::GetListenSlotData,
                pid,
                to_payload(&pid),
                || ClientError::PidNotExist(pid),
            )
            .await?;
        self.cache.listen_slots.insert(pid, slots.clone());
        Ok(slots)
    }

    pub async fn thread_indices(&mut self, pid: i32) -> Result<Vec<i32>, ClientError> {
        self.per_process(
            StatsRequestKind::GetThreadIndexList,
            pid,
            to_payload(&pid),
            || ClientError::PidNotExist(pid),
        )
        .await
    }

    pub async fn thread(&mut self, pid: i32, index: i32) -> Result<ThreadInfo, ClientError> {
        self.per_process(
            StatsRequestKind::GetThreadSlotData,
            pid,
            to_payload(&ThreadSlotRequest { pid, index }),
            || ClientError::PidNotExist(pid),
        )
        .await
    }

    pub async fn jdbc_pools(&mut self, pid: i32) -> Result<Vec<JdbcPoolInfo>, ClientError> {
        self.per_process(
            StatsRequestKind::GetJdbcConnPools,
            pid,
            to_payload(&pid),
            || ClientError::PidNotExist(pid),
        )
        .await
    }

    pub async fn jdbc_pool(&mut self, pid: i32, name: &str) -> Result<JdbcPoolInfo, ClientError> {
        self.jdbc_pools(pid)
            .await?
            .into_iter()
            .find(|pool| pool.name == name)
            .ok_or_else(|| ClientError::JdbcNotFound(name.to_owned()))
    }

    pub async fn jvm(&mut self, pid: i32) -> Result<JvmInfo, ClientError> {
        self.per_process(
            StatsRequestKind::GetJvmMgmtData,
            pid,
            to_payload(&pid),
            || ClientError::JvmNotFound(pid),
        )
        .await
    }

    pub async fn vs_ids(&mut self) -> Result<Vec<String>, ClientError> {
        if let Some(ids) = &self.cache.vs_ids {
            return Ok(ids.clone());
        }
        let ids = self.query_names(StatsRequestKind::GetVsList).await?;
        self.cache.vs_ids = Some(ids.clone());
        Ok(ids)
    }

    pub async fn virtual_servers(&mut self) -> Result<Vec<VirtualServerInfo>, ClientError> {
        self.query(StatsRequestKind::GetStatsVirtualServerInfo, Bytes::new(), || {
            ClientError::Internal("virtual server data unavailable".into())
        })
        .await
    }

    pub async fn virtual_server(&mut self, id: &str) -> Result<VirtualServerInfo, ClientError> {
        if !self.vs_ids().await?.iter().any(|known| known == id) {
            return Err(ClientError::VsNotFound(id.to_owned()));
        }
        self.virtual_servers()
            .await?
            .into_iter()
            .find(|vs| vs.slot.id == id)
            .ok_or_else(|| ClientError::VsNotFound(id.to_owned()))
    }

    pub async fn accumulated_vs(&mut self) -> Result<AccumulatedVsSlot, ClientError> {
        self.query(StatsRequestKind::GetAccumulatedVsData, Bytes::new(), || {
            ClientError::Internal("virtual server data unavailable".into())
        })
        .await
    }

    pub async fn web_module_names(&mut self) -> Result<Vec<String>, ClientError> {
        if let Some(names) = &self.cache.web_module_names {
            return Ok(names.clone());
        }
        let names = self.query_names(StatsRequestKind::GetWebModuleList).await?;
        self.cache.web_module_names = Some(names.clone());
        Ok(names)
    }

    pub async fn web_module(&mut self, name: &str) -> Result<WebModuleInfo, ClientError> {
        if !self.web_module_names().await?.iter().any(|known| known == name) {
            return Err(ClientError::WebModuleNotFound(name.to_owned()));
        }
        self.query(
            StatsRequestKind::GetWebModuleData,
            to_payload(&name.to_owned()),
            || ClientError::WebModuleNotFound(name.to_owned()),
        )
        .await
    }

    pub async fn web_modules(&mut self) -> Result<Vec<WebModuleInfo>, ClientError> {
        self.query(StatsRequestKind::GetAllWebModuleData, Bytes::new(), || {
            ClientError::Internal("web module data unavailable".into())
        })
        .await
    }

    pub async fn servlets(&mut self, web_module: &str) -> Result<WebModuleServlets, ClientError> {
        self.query(
            StatsRequestKind::GetServletData,
            to_payload(&ServletRequest {
                web_module: web_module.to_owned(),
            }),
            || ClientError::WebModuleNotFound(web_module.to_owned()),
        )
        .await
    }

    pub async fn servlet(&mut self, web_module: &str, servlet: &str) -> Result<ServletInfo, ClientError> {
        self.servlets(web_module)
            .await?
            .servlets
            .into_iter()
            .find(|s| s.name == servlet)
            .ok_or_else(|| ClientError::ServletNotFound {
                web_module: web_module.to_owned(),
                servlet: servlet.to_owned(),
            })
    }

    pub async fn all_servlets(&mut self) -> Result<Vec<WebModuleServlets>, ClientError> {
        self.query(StatsRequestKind::GetAllServletData, Bytes::new(), || {
            ClientError::Internal("servlet data unavailable".into())
        })
        .await
    }

    pub async fn session_replication(&mut self) -> Result<SessionReplicationInfo, ClientError> {
        self.query(StatsRequestKind::GetSessReplData, Bytes::new(), || {
            ClientError::SessReplNotFound
        })
        .await
    }

    async fn dump(&mut self, kind: StatsRequestKind, query: &str) -> Result<String, ClientError> {
        let limit = self.options.reply_timeout;
        let channel = self.channel().await?;
        let result = tokio::time::timeout(limit, messenger::fetch_dump(channel, kind, query)).await;
        match result {
            Ok(Ok(Ok(text))) => Ok(text),
            Ok(Ok(Err(code))) => Err(internal(code)),
            Ok(Err(e)) => {
                self.disconnect();
                Err(e.into())
            }
            Err(_) => {
                self.disconnect();
                Err(ClientError::NoConnection(format!("no dump within {:?}", limit)))
            }
        }
    }

    /// XML statistics; `query` selects sections, e.g. `thread=0&jvm=0`.
    pub async fn xml(&mut self, query: &str) -> Result<String, ClientError> {
        self.dump(StatsRequestKind::GetStatsXmlData, query).await
    }

    pub async fn perf_dump(&mut self) -> Result<String, ClientError> {
        self.dump(StatsRequestKind::GetServiceDump, "").await
    }

    /// Asks the server for a generated payload of `len` bytes.
    pub async fn test_big_file(&mut self, len: Option<i32>) -> Result<Bytes, ClientError> {
        let body = len.map(|len| to_payload(&len)).unwrap_or_default();
        self.fetch(StatsRequestKind::TestGetBigFile, body)
            .await?
            .map_err(internal)
    }
}

/// A pushed server event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub sender_pid: i32,
}

/// A stats channel registered for push notifications.
pub struct NoticeReceiver {
    channel: Channel,
}

impl NoticeReceiver {
    pub async fn subscribe(options: &ClientOptions) -> Result<Self, ClientError> {
        let mut channel = connect_stats_channel(&options.path, options.connect).await?;
        let reply = messenger::request_within(
            &mut channel,
            StatsRequestKind::IdentifyAsNoticeReceiver,
            Bytes::new(),
            options.reply_timeout,
        )
        .await?;
        match reply {
            StatsReply::Data(_) => {
                tracing::debug!(conn = %channel.id(), "Subscribed to notices");
                Ok(Self { channel })
            }
            StatsReply::Error(code) => Err(internal(code)),
        }
    }

    /// Waits for the next notice and acknowledges it.
    pub async fn next(&mut self) -> Result<Notice, ClientError> {
        loop {
            let message = messenger::recv_message(&mut self.channel).await?;
            if message.tag != AdminTag::StatsNotification {
                return Err(ClientError::Internal(format!(
                    "unexpected {:?} on notice channel",
                    message.tag
                )));
            }
            messenger::ack_notification(&mut self.channel, message.msg_type).await?;
            match message.notice_kind() {
                Some(kind) => {
                    return Ok(Notice {
                        kind,
                        sender_pid: message.sender_pid,
                    });
                }
                None => tracing::debug!(msg_type = message.msg_type, "Skipping unknown notice"),
            }
        }
    }
}

/// Shared clients keyed by server id.
#[derive(Default)]
pub struct ClientManager {
    clients: DashMap<String, Arc<tokio::sync::Mutex<StatsClient>>>,
}

impl ClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the client for `server_id`, connecting on first use or after
    /// the previous connection failed.
    pub async fn client(
        &self,
        server_id: &str,
        options: ClientOptions,
    ) -> Result<Arc<tokio::sync::Mutex<StatsClient>>, ClientError> {
        let existing = self.clients.get(server_id).map(|c| Arc::clone(c.value()));
        if let Some(client) = existing {
            let mut guard = client.lock().await;
            if guard.is_connected() {
                drop(guard);
                return Ok(client);
            }
            tracing::debug!(server_id, "Reconnecting stats client");
            guard.refresh().await?;
            drop(guard);
            return Ok(client);
        }

        let client = Arc::new(tokio::sync::Mutex::new(StatsClient::connect(options).await?));
        let entry = self
            .clients
            .entry(server_id.to_owned())
            .or_insert_with(|| Arc::clone(&client));
        Ok(Arc::clone(entry.value()))
    }

    pub fn remove(&self, server_id: &str) -> bool {
        self.clients.remove(server_id).is_some()
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.clients.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn socket_for(temp_dir: &Path, product: &str) -> PathBuf {
        crate::bridge::transport::socket_path(temp_dir, product)
    }
}
