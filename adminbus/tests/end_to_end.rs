//! Parent, children and clients talking over a real socket.

#![cfg(unix)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use adminbus::admin::{peer_reconfigure, peer_reopen_logs};
use adminbus::bridge::protocol::{FragmentFlag, Frame, NO_SENDER_PID, StatsHeader};
use adminbus::bridge::transport::{connect, connect_stats_channel};
use adminbus::stats::LiveThreadSlots;
use adminbus::stats::types::{
    INVALID_PROCESS_ID, ProcessInfo, ProcessSlot, RequestBucket, VirtualServerInfo,
    VirtualServerSlot, VsMode,
};
use adminbus::{
    AdminConfig, AdminTag, Channel, ChannelRole, ChildAdmin, ChildAdminHandle, ChildHandler,
    ClientError, ClientManager, ClientOptions, NoHooks, NoticeKind, NoticeReceiver, ParentHandle,
    ParentHooks, StatsClient, StatsResponder, StatsSource, spawn_parent,
};
use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const WAIT: Duration = Duration::from_secs(10);
const TICK: Duration = Duration::from_millis(25);

struct FakeServer {
    pid: i32,
    requests: u64,
}

impl StatsSource for FakeServer {
    fn process_info(&self) -> ProcessInfo {
        ProcessInfo {
            slot: ProcessSlot {
                pid: self.pid,
                count_threads: 4,
                request_bucket: RequestBucket {
                    count_requests: self.requests,
                    ..Default::default()
                },
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
            hostnames: "localhost".into(),
            ..Default::default()
        }]
    }
}

#[derive(Default)]
struct Counting {
    reconfigures: AtomicUsize,
    reopens: AtomicUsize,
    terminates: AtomicUsize,
}

#[async_trait]
impl ChildHandler for Counting {
    async fn reconfigure(&self) {
        self.reconfigures.fetch_add(1, Ordering::SeqCst);
    }

    async fn reopen_logs(&self) {
        self.reopens.fetch_add(1, Ordering::SeqCst);
    }

    async fn terminate(&self) {
        self.terminates.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Recording {
    relayed: Mutex<Vec<(AdminTag, bool)>>,
}

#[async_trait]
impl ParentHooks for Recording {
    async fn answer(&self, tag: AdminTag, _arg: &str) -> Option<String> {
        (tag == AdminTag::GetPwd).then(|| "/srv/www".to_string())
    }

    async fn command_relayed(&self, tag: AdminTag, success: bool) {
        self.relayed.lock().unwrap().push((tag, success));
    }
}

fn config(dir: &TempDir, children: usize) -> AdminConfig {
    AdminConfig::new("e2e")
        .with_temp_dir(dir.path())
        .with_max_procs(children)
        .with_reply_timeout(Duration::from_secs(5))
        .with_connect_timeout(Duration::from_secs(2))
}

async fn start_child(
    config: &AdminConfig,
    pid: i32,
    requests: u64,
    handler: Arc<Counting>,
) -> ChildAdminHandle {
    let responder = StatsResponder::new(
        Arc::new(FakeServer { pid, requests }),
        LiveThreadSlots::new(4),
    );
    ChildAdmin::connect(config, pid, handler, Some(responder))
        .await
        .unwrap()
        .spawn()
}

/// Connects once every child has reported its statistics.
async fn ready_client(config: &AdminConfig) -> StatsClient {
    tokio::time::timeout(WAIT, async {
        loop {
            match StatsClient::connect(ClientOptions::from_config(config)).await {
                Ok(client) => return client,
                Err(ClientError::ServerBusy) => tokio::time::sleep(TICK).await,
                Err(e) => panic!("stats client failed: {e}"),
            }
        }
    })
    .await
    .expect("server never became ready")
}

async fn wait_connected(parent: &ParentHandle, expected: usize) {
    tokio::time::timeout(WAIT, async {
        while parent.status().await.unwrap().connected_children != expected {
            tokio::time::sleep(TICK).await;
        }
    })
    .await
    .expect("child count never settled");
}

#[tokio::test]
async fn stats_are_aggregated_across_children() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2);
    let parent = spawn_parent(&config, None, Arc::new(NoHooks)).unwrap();
    let _a = start_child(&config, 101, 10, Arc::default()).await;
    let _b = start_child(&config, 102, 32, Arc::default()).await;

    let mut client = ready_client(&config).await;
    let header = client.header().unwrap();
    assert_eq!(header.max_procs, 2);
    assert_eq!(header.count_reconfig, 0);

    let mut pids = client.pids().await.unwrap();
    pids.sort();
    assert_eq!(pids, vec![101, 102]);

    let one = client.process(101).await.unwrap();
    assert_eq!(one.slot.pid, 101);
    assert_eq!(one.slot.request_bucket.count_requests, 10);

    let servers = client.virtual_servers().await.unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].slot.request_bucket.count_requests, 42);
    assert!(matches!(
        client.virtual_server("missing").await,
        Err(ClientError::VsNotFound(_))
    ));
    assert!(matches!(client.process(999).await, Err(ClientError::IllegalPid(999))));

    let xml = client.xml("").await.unwrap();
    assert!(xml.contains("<process pid=\"101\""));
    assert!(xml.contains("<process pid=\"102\""));

    let big = client.test_big_file(None).await.unwrap();
    assert_eq!(big.len(), 3 * adminbus::bridge::MAX_PACKET_PAYLOAD + 17);

    let manager = ClientManager::new();
    let shared = manager.client("e2e", ClientOptions::from_config(&config)).await.unwrap();
    let again = manager.client("e2e", ClientOptions::from_config(&config)).await.unwrap();
    assert!(Arc::ptr_eq(&shared, &again));
    assert_eq!(shared.lock().await.pids().await.unwrap().len(), 2);
    assert_eq!(manager.server_ids(), vec!["e2e".to_string()]);

    parent.shutdown().await.unwrap();
    tokio::time::timeout(WAIT, parent.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn reconfigure_completes_after_every_child_reports() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2);
    let hooks = Arc::new(Recording::default());
    let parent = spawn_parent(&config, None, hooks.clone()).unwrap();
    let first = Arc::new(Counting::default());
    let second = Arc::new(Counting::default());
    let _a = start_child(&config, 101, 1, first.clone()).await;
    let _b = start_child(&config, 102, 2, second.clone()).await;

    let mut client = ready_client(&config).await;
    let mut receiver = NoticeReceiver::subscribe(&ClientOptions::from_config(&config))
        .await
        .unwrap();
    let done = tokio::spawn(async move {
        loop {
            let notice = receiver.next().await.unwrap();
            if notice.kind == NoticeKind::ReconfigureDone {
                return notice;
            }
        }
    });

    assert!(parent.broadcast(AdminTag::Reconfigure).await.unwrap());
    let notice = tokio::time::timeout(WAIT, done).await.unwrap().unwrap();
    assert_eq!(notice.sender_pid, INVALID_PROCESS_ID);

    assert!(!parent.status().await.unwrap().reconfigure_in_progress);
    assert_eq!(first.reconfigures.load(Ordering::SeqCst), 1);
    assert_eq!(second.reconfigures.load(Ordering::SeqCst), 1);
    assert_eq!(
        hooks.relayed.lock().unwrap().as_slice(),
        &[(AdminTag::Reconfigure, true)]
    );

    let seen = client.refresh().await.unwrap();
    assert!(seen.reconfigured);
    assert!(!seen.child_died);
    assert_eq!(client.header().unwrap().count_reconfig, 1);
}

#[tokio::test]
async fn peer_commands_reach_every_child() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2);
    let parent = spawn_parent(&config, None, Arc::new(Recording::default())).unwrap();
    let first = Arc::new(Counting::default());
    let second = Arc::new(Counting::default());
    let _a = start_child(&config, 101, 1, first.clone()).await;
    let _b = start_child(&config, 102, 2, second.clone()).await;
    wait_connected(&parent, 2).await;

    peer_reopen_logs(&config).await.unwrap();
    assert_eq!(first.reopens.load(Ordering::SeqCst), 1);
    assert_eq!(second.reopens.load(Ordering::SeqCst), 1);

    peer_reconfigure(&config).await.unwrap();
    assert_eq!(first.reconfigures.load(Ordering::SeqCst), 1);
    assert_eq!(second.reconfigures.load(Ordering::SeqCst), 1);

    let mut admin = connect(&config.socket_path(), config.client_connect_options())
        .await
        .unwrap();
    let reply = admin.request(AdminTag::GetPwd, "").await.unwrap();
    assert_eq!(reply.text(), "/srv/www");
}

#[tokio::test]
async fn died_child_is_counted_once_and_replaced() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2);
    let parent = spawn_parent(&config, None, Arc::new(NoHooks)).unwrap();
    let _a = start_child(&config, 101, 1, Arc::default()).await;
    let b = start_child(&config, 102, 2, Arc::default()).await;
    let mut client = ready_client(&config).await;

    b.shutdown();
    tokio::time::timeout(WAIT, b.wait()).await.unwrap().unwrap();
    wait_connected(&parent, 1).await;
    // The supervisor reports the same death again.
    parent.child_died(102).await.unwrap();
    assert!(matches!(client.refresh().await, Err(ClientError::ServerBusy)));

    parent.child_starting().await.unwrap();
    let _c = start_child(&config, 103, 3, Arc::default()).await;
    let seen = tokio::time::timeout(WAIT, async {
        loop {
            match client.refresh().await {
                Ok(seen) => return seen,
                Err(ClientError::ServerBusy) => tokio::time::sleep(TICK).await,
                Err(e) => panic!("refresh failed: {e}"),
            }
        }
    })
    .await
    .unwrap();
    assert!(seen.child_died);
    assert_eq!(client.header().unwrap().count_child_died, 1);

    let mut pids = client.pids().await.unwrap();
    pids.sort();
    assert_eq!(pids, vec![101, 103]);
    assert!(matches!(client.process(102).await, Err(ClientError::IllegalPid(102))));
}

#[tokio::test]
async fn watchdog_is_released_and_relays_terminate() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2);
    let (ours, theirs) = UnixStream::pair().unwrap();
    let hooks = Arc::new(Recording::default());
    let parent = spawn_parent(
        &config,
        Some(Channel::new(ours, ChannelRole::Watchdog)),
        hooks.clone(),
    )
    .unwrap();

    let watchdog = tokio::spawn(async move {
        let mut channel = Channel::new(theirs, ChannelRole::Client);
        let frame = channel.recv().await.unwrap();
        assert_eq!(frame.tag, AdminTag::EndInit);
        assert_eq!(frame.text(), "2");
        channel.send_text(AdminTag::EndInitReply, "").await.unwrap();
        channel
    });

    let first = Arc::new(Counting::default());
    let second = Arc::new(Counting::default());
    let a = start_child(&config, 101, 1, first.clone()).await;
    let b = start_child(&config, 102, 2, second.clone()).await;

    let mut watchdog = tokio::time::timeout(WAIT, watchdog).await.unwrap().unwrap();
    tokio::time::timeout(WAIT, async {
        while !parent.status().await.unwrap().watchdog_active {
            tokio::time::sleep(TICK).await;
        }
    })
    .await
    .unwrap();

    watchdog.send(Frame::admin(AdminTag::Terminate, "")).await.unwrap();
    tokio::time::timeout(WAIT, parent.wait()).await.unwrap().unwrap();
    tokio::time::timeout(WAIT, a.wait()).await.unwrap().unwrap();
    tokio::time::timeout(WAIT, b.wait()).await.unwrap().unwrap();

    assert_eq!(first.terminates.load(Ordering::SeqCst), 1);
    assert_eq!(second.terminates.load(Ordering::SeqCst), 1);
    assert_eq!(
        hooks.relayed.lock().unwrap().as_slice(),
        &[(AdminTag::Terminate, true)]
    );
}

#[tokio::test]
async fn unsolicited_child_message_closes_the_channel() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 1).with_stats(false);
    let parent = spawn_parent(&config, None, Arc::new(NoHooks)).unwrap();

    let mut child = connect(&config.socket_path(), config.child_connect_options())
        .await
        .unwrap();
    let reply = child.request(AdminTag::EndInit, "301").await.unwrap();
    assert_eq!(reply.tag, AdminTag::EndInitReply);
    child.send_text(AdminTag::EndInitReplyAck, "301").await.unwrap();
    wait_connected(&parent, 1).await;

    child.send(Frame::admin(AdminTag::Rotate, "")).await.unwrap();
    let closed = tokio::time::timeout(WAIT, child.recv()).await.unwrap().unwrap();
    assert!(closed.is_empty_read());
    wait_connected(&parent, 0).await;

    assert!(matches!(
        StatsClient::connect(ClientOptions::from_config(&config)).await,
        Err(ClientError::StatsDisabled)
    ));
}

#[tokio::test]
async fn half_written_peers_are_dropped_without_stalling_the_parent() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 1).with_reply_timeout(Duration::from_millis(300));
    let parent = spawn_parent(&config, None, Arc::new(NoHooks)).unwrap();

    // Half of a length prefix, then silence.
    let mut stalled = UnixStream::connect(config.socket_path()).await.unwrap();
    stalled.write_all(&[8, 0]).await.unwrap();

    // The first fragment of a two-fragment stats message, then silence.
    let mut stats = connect_stats_channel(&config.socket_path(), config.client_connect_options())
        .await
        .unwrap();
    let header = StatsHeader {
        msg_type: 1,
        sender_pid: NO_SENDER_PID,
        total_len: 8,
        packet_len: 4,
        flags: FragmentFlag::First,
        reserved: 0,
    };
    stats
        .send(Frame::stats(AdminTag::ReqStatsData, header, Bytes::from_static(b"abcd")))
        .await
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), parent.status())
        .await
        .expect("parent loop did not answer")
        .unwrap();
    assert_eq!(status.expected_children, 1);

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(WAIT, stalled.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(read, 0);

    let ack = tokio::time::timeout(WAIT, stats.recv()).await.unwrap().unwrap();
    assert_eq!(ack.tag, AdminTag::RespStatsDataAck);
    let closed = tokio::time::timeout(WAIT, stats.recv()).await.unwrap().unwrap();
    assert!(closed.is_empty_read());

    let handler = Arc::new(Counting::default());
    let _child = start_child(&config, 401, 1, handler).await;
    wait_connected(&parent, 1).await;
}
