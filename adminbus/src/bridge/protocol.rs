//! Message tags and frame types shared by admin and stats channels.
//!
//! Tag values are part of the wire format: both ends of a channel must agree
//! on the integer of every variant. The marker values that bracket ranges in
//! the numbering (`First`, `StatsMessageBegin`, `StatsMessageLast`, `Last`)
//! are never sent and have no variant here.

use bytes::Bytes;
use serde::Serialize;

/// Outer tag of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum AdminTag {
    GetPwd = 1,
    GetPwdReply = 2,
    GetListenSocket = 3,
    GetListenSocketReply = 4,
    CloseListenSocket = 5,
    CloseListenSocketReply = 6,
    EndInit = 7,
    EndInitReply = 8,
    EndInitReplyAck = 9,
    SetPidPath = 10,
    SetPidPathReply = 11,
    Restart = 12,
    RestartReply = 13,
    Terminate = 14,
    TerminateReply = 15,
    Reconfigure = 16,
    ReconfigureReply = 17,
    GetReconfigStatus = 18,
    GetReconfigStatusReply = 19,
    ReconfigStatus = 20,
    ReconfigStatusReply = 21,
    ReconfigStatusDone = 22,
    ReconfigStatusDoneReply = 23,
    /// Synthesized locally when a read observes an orderly close.
    EmptyRead = 24,
    Rotate = 25,
    RotateReply = 26,
    PeerReconfigure = 27,
    PeerReconfigureReply = 28,
    PeerReopenLogs = 29,
    PeerReopenLogsReply = 30,
    IdentifyStatsChannel = 31,
    IdentifyStatsChannelAck = 32,
    ReqStatsData = 34,
    RespStatsData = 35,
    RespStatsDataAck = 36,
    RespError = 37,
    StatsNotification = 38,
    StatsNotificationAck = 39,
}

impl AdminTag {
    pub fn from_i32(value: i32) -> Option<Self> {
        use AdminTag::*;
        let tag = match value {
            1 => GetPwd,
            2 => GetPwdReply,
            3 => GetListenSocket,
            4 => GetListenSocketReply,
            5 => CloseListenSocket,
            6 => CloseListenSocketReply,
            7 => EndInit,
            8 => EndInitReply,
            9 => EndInitReplyAck,
            10 => SetPidPath,
            11 => SetPidPathReply,
            12 => Restart,
            13 => RestartReply,
            14 => Terminate,
            15 => TerminateReply,
            16 => Reconfigure,
            17 => ReconfigureReply,
            18 => GetReconfigStatus,
            19 => GetReconfigStatusReply,
            20 => ReconfigStatus,
            21 => ReconfigStatusReply,
            22 => ReconfigStatusDone,
            23 => ReconfigStatusDoneReply,
            24 => EmptyRead,
            25 => Rotate,
            26 => RotateReply,
            27 => PeerReconfigure,
            28 => PeerReconfigureReply,
            29 => PeerReopenLogs,
            30 => PeerReopenLogsReply,
            31 => IdentifyStatsChannel,
            32 => IdentifyStatsChannelAck,
            34 => ReqStatsData,
            35 => RespStatsData,
            36 => RespStatsDataAck,
            37 => RespError,
            38 => StatsNotification,
            39 => StatsNotificationAck,
            _ => return None,
        };
        Some(tag)
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// True for tags whose frames carry the inner stats header.
    pub fn is_stats_carrier(self) -> bool {
        matches!(
            self,
            AdminTag::ReqStatsData
                | AdminTag::RespStatsData
                | AdminTag::RespStatsDataAck
                | AdminTag::RespError
                | AdminTag::StatsNotification
                | AdminTag::StatsNotificationAck
        )
    }

    /// The tag a peer answers this request with, if it is a request.
    pub fn reply(self) -> Option<AdminTag> {
        use AdminTag::*;
        let reply = match self {
            GetPwd => GetPwdReply,
            GetListenSocket => GetListenSocketReply,
            CloseListenSocket => CloseListenSocketReply,
            EndInit => EndInitReply,
            EndInitReply => EndInitReplyAck,
            SetPidPath => SetPidPathReply,
            Restart => RestartReply,
            Terminate => TerminateReply,
            Reconfigure => ReconfigureReply,
            GetReconfigStatus => GetReconfigStatusReply,
            ReconfigStatus => ReconfigStatusReply,
            ReconfigStatusDone => ReconfigStatusDoneReply,
            Rotate => RotateReply,
            PeerReconfigure => PeerReconfigureReply,
            PeerReopenLogs => PeerReopenLogsReply,
            IdentifyStatsChannel => IdentifyStatsChannelAck,
            RespStatsData => RespStatsDataAck,
            StatsNotification => StatsNotificationAck,
            _ => return None,
        };
        Some(reply)
    }

    /// Commands relayed by the parent to every initialized child.
    pub fn is_lifecycle_command(self) -> bool {
        matches!(
            self,
            AdminTag::Reconfigure
                | AdminTag::Terminate
                | AdminTag::Restart
                | AdminTag::Rotate
                | AdminTag::PeerReconfigure
                | AdminTag::PeerReopenLogs
        )
    }
}

/// Inner stats request types carried in `StatsHeader::msg_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum StatsRequestKind {
    GetStatsHeader = 1,
    GetCpuInfo = 2,
    GetStringStore = 3,
    GetStatsProcessInfo = 4,
    GetStatsXmlData = 5,
    GetStatsXmlDataAck = 6,
    GetServiceDump = 7,
    GetServiceDumpAck = 8,
    GetAccumulatedVsData = 9,
    GetStatsVirtualServerInfo = 10,
    GetVsList = 11,
    GetListenSlotData = 12,
    GetWebModuleList = 13,
    GetWebModuleData = 14,
    GetAllWebModuleData = 15,
    GetServletData = 16,
    GetAllServletData = 17,
    GetThreadIndexList = 18,
    GetThreadSlotData = 19,
    GetPidList = 20,
    GetJdbcConnPools = 21,
    GetJvmMgmtData = 22,
    GetSessReplData = 23,
    IdentifyAsNoticeReceiver = 24,
    TestGetBigFile = 25,
}

impl StatsRequestKind {
    pub fn from_i32(value: i32) -> Option<Self> {
        use StatsRequestKind::*;
        let kind = match value {
            1 => GetStatsHeader,
            2 => GetCpuInfo,
            3 => GetStringStore,
            4 => GetStatsProcessInfo,
            5 => GetStatsXmlData,
            6 => GetStatsXmlDataAck,
            7 => GetServiceDump,
            8 => GetServiceDumpAck,
            9 => GetAccumulatedVsData,
            10 => GetStatsVirtualServerInfo,
            11 => GetVsList,
            12 => GetListenSlotData,
            13 => GetWebModuleList,
            14 => GetWebModuleData,
            15 => GetAllWebModuleData,
            16 => GetServletData,
            17 => GetAllServletData,
            18 => GetThreadIndexList,
            19 => GetThreadSlotData,
            20 => GetPidList,
            21 => GetJdbcConnPools,
            22 => GetJvmMgmtData,
            23 => GetSessReplData,
            24 => IdentifyAsNoticeReceiver,
            25 => TestGetBigFile,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Continuation request used while streaming a dump.
    pub fn ack(self) -> Option<Self> {
        match self {
            StatsRequestKind::GetStatsXmlData => Some(StatsRequestKind::GetStatsXmlDataAck),
            StatsRequestKind::GetServiceDump => Some(StatsRequestKind::GetServiceDumpAck),
            _ => None,
        }
    }
}

/// In-band application errors. The channel stays usable after one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum StatsErrorCode {
    #[error("statistics are not ready yet")]
    NotReady = 1,
    #[error("malformed request")]
    InReq = 2,
    #[error("virtual server data error")]
    VsData = 3,
    #[error("process data error")]
    Process = 4,
    #[error("process id no longer exists")]
    PidNotExist = 5,
    #[error("jvm statistics are not initialized")]
    JvmStatsNoInit = 6,
    #[error("session replication statistics unavailable")]
    NoSessReplStats = 7,
}

impl StatsErrorCode {
    pub fn from_i32(value: i32) -> Option<Self> {
        use StatsErrorCode::*;
        let code = match value {
            1 => NotReady,
            2 => InReq,
            3 => VsData,
            4 => Process,
            5 => PidNotExist,
            6 => JvmStatsNoInit,
            7 => NoSessReplStats,
            _ => return None,
        };
        Some(code)
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Push notifications, carried in `StatsHeader::msg_type` of a
/// `StatsNotification` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum NoticeKind {
    VsCoreDataChange = 1,
    JvmInitialized = 2,
    WebModuleInit = 3,
    ReconfigureDone = 4,
    JdbcNodesCountChanged = 5,
    SessReplNodeCountChanged = 6,
    AllChildInitialized = 7,
}

impl NoticeKind {
    pub fn from_i32(value: i32) -> Option<Self> {
        use NoticeKind::*;
        let kind = match value {
            1 => VsCoreDataChange,
            2 => JvmInitialized,
            3 => WebModuleInit,
            4 => ReconfigureDone,
            5 => JdbcNodesCountChanged,
            6 => SessReplNodeCountChanged,
            7 => AllChildInitialized,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Position of a packet within a (possibly fragmented) stats message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum FragmentFlag {
    Complete = 1,
    First = 2,
    Next = 3,
    Last = 4,
}

impl FragmentFlag {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(FragmentFlag::Complete),
            2 => Some(FragmentFlag::First),
            3 => Some(FragmentFlag::Next),
            4 => Some(FragmentFlag::Last),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Whether `next` may follow `self` within one message.
    pub fn may_precede(self, next: FragmentFlag) -> bool {
        matches!(
            (self, next),
            (FragmentFlag::First, FragmentFlag::Next)
                | (FragmentFlag::First, FragmentFlag::Last)
                | (FragmentFlag::Next, FragmentFlag::Next)
                | (FragmentFlag::Next, FragmentFlag::Last)
        )
    }
}

/// Sender pid used by everything except child notifications.
pub const NO_SENDER_PID: i32 = -1;

/// A stats message longer than the 32-bit length fields can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stats message of {0} bytes does not fit the length field")]
pub struct LengthOverflow(pub usize);

/// Converts a byte count into a header length field.
pub fn wire_len(len: usize) -> Result<i32, LengthOverflow> {
    i32::try_from(len).map_err(|_| LengthOverflow(len))
}

/// Inner header of stats-carrying frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsHeader {
    pub msg_type: i32,
    pub sender_pid: i32,
    pub total_len: i32,
    pub packet_len: i32,
    pub flags: FragmentFlag,
    pub reserved: i32,
}

impl StatsHeader {
    /// Header for a message that fits into a single packet.
    pub fn complete(msg_type: i32, sender_pid: i32, len: usize) -> Result<Self, LengthOverflow> {
        let len = wire_len(len)?;
        Ok(Self {
            msg_type,
            sender_pid,
            total_len: len,
            packet_len: len,
            flags: FragmentFlag::Complete,
            reserved: 0,
        })
    }
}

/// One decoded message unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: AdminTag,
    /// Present exactly when `tag.is_stats_carrier()`.
    pub stats: Option<StatsHeader>,
    /// Text argument (without NUL) for admin frames, packet payload for
    /// stats frames.
    pub body: Bytes,
}

impl Frame {
    pub fn admin(tag: AdminTag, text: impl AsRef<str>) -> Self {
        Self {
            tag,
            stats: None,
            body: Bytes::copy_from_slice(text.as_ref().as_bytes()),
        }
    }

    pub fn stats(tag: AdminTag, header: StatsHeader, payload: Bytes) -> Self {
        Self {
            tag,
            stats: Some(header),
            body: payload,
        }
    }

    /// A single-packet stats frame.
    pub fn stats_complete(
        tag: AdminTag,
        msg_type: i32,
        sender_pid: i32,
        payload: Bytes,
    ) -> Result<Self, LengthOverflow> {
        let header = StatsHeader::complete(msg_type, sender_pid, payload.len())?;
        Ok(Self::stats(tag, header, payload))
    }

    pub fn empty_read() -> Self {
        Self::admin(AdminTag::EmptyRead, "")
    }

    pub fn is_empty_read(&self) -> bool {
        self.tag == AdminTag::EmptyRead
    }

    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn msg_type(&self) -> Option<i32> {
        self.stats.map(|h| h.msg_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_tags_keep_wire_numbering() {
        assert_eq!(AdminTag::EndInit.as_i32(), 7);
        assert_eq!(AdminTag::EmptyRead.as_i32(), 24);
        assert_eq!(AdminTag::ReqStatsData.as_i32(), 34);
        assert_eq!(AdminTag::StatsNotificationAck.as_i32(), 39);
        assert_eq!(AdminTag::from_i32(33), None);
        assert_eq!(AdminTag::from_i32(40), None);
        assert_eq!(AdminTag::from_i32(0), None);
        for v in 1..=39 {
            if let Some(tag) = AdminTag::from_i32(v) {
                assert_eq!(tag.as_i32(), v);
            }
        }
    }

    #[test]
    fn every_reply_is_terminal_except_end_init() {
        for v in 1..=39 {
            let Some(tag) = AdminTag::from_i32(v) else {
                continue;
            };
            if let Some(reply) = tag.reply() {
                assert_ne!(reply, tag);
                if tag != AdminTag::EndInit {
                    assert_eq!(reply.reply(), None, "{tag:?} -> {reply:?}");
                }
            }
        }
        assert_eq!(
            AdminTag::EndInit.reply().and_then(AdminTag::reply),
            Some(AdminTag::EndInitReplyAck)
        );
    }

    #[test]
    fn stats_carriers_are_the_stats_range() {
        let carriers: Vec<_> = (1..=39)
            .filter_map(AdminTag::from_i32)
            .filter(|t| t.is_stats_carrier())
            .map(AdminTag::as_i32)
            .collect();
        assert_eq!(carriers, vec![34, 35, 36, 37, 38, 39]);
    }

    #[test]
    fn lifecycle_commands_serialize() {
        let tags: Vec<_> = (1..=39)
            .filter_map(AdminTag::from_i32)
            .filter(|t| t.is_lifecycle_command())
            .collect();
        insta::assert_json_snapshot!(tags, @r#"
        [
          "restart",
          "terminate",
          "reconfigure",
          "rotate",
          "peer_reconfigure",
          "peer_reopen_logs"
        ]
        "#);
    }

    #[test]
    fn dump_requests_have_ack_kinds() {
        assert_eq!(
            StatsRequestKind::GetStatsXmlData.ack(),
            Some(StatsRequestKind::GetStatsXmlDataAck)
        );
        assert_eq!(
            StatsRequestKind::GetServiceDump.ack(),
            Some(StatsRequestKind::GetServiceDumpAck)
        );
        assert_eq!(StatsRequestKind::GetPidList.ack(), None);
        assert_eq!(StatsRequestKind::from_i32(0), None);
        assert_eq!(StatsRequestKind::from_i32(26), None);
    }

    #[test]
    fn fragment_flag_ordering() {
        use FragmentFlag::*;
        assert!(First.may_precede(Next));
        assert!(First.may_precede(Last));
        assert!(Next.may_precede(Last));
        assert!(!Last.may_precede(Next));
        assert!(!Complete.may_precede(Next));
        assert!(!Next.may_precede(First));
    }

    #[test]
    fn stats_error_messages() {
        assert_eq!(
            StatsErrorCode::NotReady.to_string(),
            "statistics are not ready yet"
        );
        assert_eq!(StatsErrorCode::from_i32(5), Some(StatsErrorCode::PidNotExist));
        assert_eq!(StatsErrorCode::from_i32(8), None);
    }

    #[test]
    fn complete_header_rejects_lengths_past_i32() {
        let header = StatsHeader::complete(1, -1, 4060).unwrap();
        assert_eq!((header.total_len, header.packet_len), (4060, 4060));

        let len = i32::MAX as usize + 1;
        assert_eq!(StatsHeader::complete(1, -1, len), Err(LengthOverflow(len)));
    }
}
