//! Statistics slots exchanged between children, the parent and clients.
//!
//! Slot field order is the wire order. Composite `*Info` types bundle a slot
//! with the sub-lists a single request returns.

use serde::Serialize;

use crate::bridge::payload::{PayloadError, StatsReader, StatsWriter, Wire, wire_mode, wire_slot};

pub const STATS_MAGIC: &[u8; 4] = b"iWS\n";
pub const STATS_VERSION_MAJOR: i32 = 1;
pub const STATS_VERSION_MINOR: i32 = 3;

/// Pid of a process slot that no child owns.
pub const INVALID_PROCESS_ID: i32 = -1;

wire_mode! {
    pub enum ProcessMode {
        #[default]
        Empty = 0,
        Active = 1,
    }
}

wire_mode! {
    pub enum ListenMode {
        #[default]
        Empty = 0,
        Active = 1,
    }
}

wire_mode! {
    pub enum VsMode {
        #[default]
        Empty = 0,
        Active = 1,
        Disabled = 2,
        Unknown = 3,
    }
}

wire_mode! {
    pub enum WebModuleMode {
        #[default]
        Empty = 0,
        Enabled = 1,
        Disabled = 2,
        Unknown = 3,
    }
}

wire_mode! {
    pub enum ThreadMode {
        #[default]
        Empty = 0,
        Idle = 1,
        Dns = 2,
        Request = 3,
        Processing = 4,
        Response = 5,
        Updating = 6,
        KeepAlive = 7,
    }
}

wire_mode! {
    pub enum NodeState {
        #[default]
        Invalid = 0,
        Active = 1,
    }
}

/// Server-wide header; the first thing every client fetches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeaderSlot {
    pub version_major: i32,
    pub version_minor: i32,
    pub version_server: String,
    /// Microseconds since the epoch.
    pub time_started: i64,
    pub ticks_per_second: u32,
    pub max_procs: u32,
    pub max_threads: u32,
    pub max_profile_buckets: u32,
    pub seconds_running: u32,
    pub count_child_died: u32,
    pub count_reconfig: u32,
    pub jvm_enabled: bool,
    pub webapps_enabled: bool,
    pub seconds_update_interval: i32,
    pub flag_profiling_enabled: bool,
    pub load_1min_average: f64,
    pub load_5min_average: f64,
    pub load_15min_average: f64,
    pub rate_bytes_transmitted: u64,
    pub rate_bytes_received: u64,
}

impl Default for HeaderSlot {
    fn default() -> Self {
        Self {
            version_major: STATS_VERSION_MAJOR,
            version_minor: STATS_VERSION_MINOR,
            version_server: String::new(),
            time_started: 0,
            ticks_per_second: 0,
            max_procs: 0,
            max_threads: 0,
            max_profile_buckets: 0,
            seconds_running: 0,
            count_child_died: 0,
            count_reconfig: 0,
            jvm_enabled: false,
            webapps_enabled: false,
            seconds_update_interval: 0,
            flag_profiling_enabled: false,
            load_1min_average: 0.0,
            load_5min_average: 0.0,
            load_15min_average: 0.0,
            rate_bytes_transmitted: 0,
            rate_bytes_received: 0,
        }
    }
}

impl Wire for HeaderSlot {
    fn encode(&self, w: &mut StatsWriter) {
        w.put_raw(STATS_MAGIC);
        w.put_i32(self.version_major);
        w.put_i32(self.version_minor);
        w.put_str(&self.version_server);
        w.put_i64(self.time_started);
        w.put_u32(self.ticks_per_second);
        w.put_u32(self.max_procs);
        w.put_u32(self.max_threads);
        w.put_u32(self.max_profile_buckets);
        w.put_u32(self.seconds_running);
        w.put_u32(self.count_child_died);
        w.put_u32(self.count_reconfig);
        w.put_bool(self.jvm_enabled);
        w.put_bool(self.webapps_enabled);
        w.put_i32(self.seconds_update_interval);
        w.put_bool(self.flag_profiling_enabled);
        w.put_f64(self.load_1min_average);
        w.put_f64(self.load_5min_average);
        w.put_f64(self.load_15min_average);
        w.put_u64(self.rate_bytes_transmitted);
        w.put_u64(self.rate_bytes_received);
    }

    fn decode(r: &mut StatsReader<'_>) -> Result<Self, PayloadError> {
        let magic = r.get_u32()?.to_ne_bytes();
        if &magic != STATS_MAGIC {
            return Err(PayloadError::BadMagic);
        }
        let version_major = r.get_i32()?;
        let version_minor = r.get_i32()?;
        if version_major != STATS_VERSION_MAJOR || version_minor < STATS_VERSION_MINOR {
            return Err(PayloadError::Version {
                major: version_major,
                minor: version_minor,
            });
        }
        Ok(Self {
            version_major,
            version_minor,
            version_server: r.get_str()?,
            time_started: r.get_i64()?,
            ticks_per_second: r.get_u32()?,
            max_procs: r.get_u32()?,
            max_threads: r.get_u32()?,
            max_profile_buckets: r.get_u32()?,
            seconds_running: r.get_u32()?,
            count_child_died: r.get_u32()?,
            count_reconfig: r.get_u32()?,
            jvm_enabled: r.get_bool()?,
            webapps_enabled: r.get_bool()?,
            seconds_update_interval: r.get_i32()?,
            flag_profiling_enabled: r.get_bool()?,
            load_1min_average: r.get_f64()?,
            load_5min_average: r.get_f64()?,
            load_15min_average: r.get_f64()?,
            rate_bytes_transmitted: r.get_u64()?,
            rate_bytes_received: r.get_u64()?,
        })
    }
}

wire_slot! {
    pub struct CpuInfoSlot {
        pub id: String,
        pub percent_idle: f64,
        pub percent_user: f64,
        pub percent_kernel: f64,
    }
}

wire_slot! {
    pub struct ListenSlot {
        pub mode: ListenMode,
        pub id: String,
        /// `ip:port` of the bound socket.
        pub address: String,
        pub count_acceptors: i32,
        pub flag_secure: bool,
        pub default_vs_id: String,
    }
}

wire_slot! {
    pub struct RequestBucket {
        pub count_requests: u64,
        pub count_bytes_received: u64,
        pub count_bytes_transmitted: u64,
        pub rate_bytes_transmitted: u64,
        pub count_open_connections: u32,
        pub count_2xx: u64,
        pub count_3xx: u64,
        pub count_4xx: u64,
        pub count_5xx: u64,
        pub count_other: u64,
        pub count_200: u64,
        pub count_302: u64,
        pub count_304: u64,
        pub count_400: u64,
        pub count_401: u64,
        pub count_403: u64,
        pub count_404: u64,
        pub count_503: u64,
        pub method: String,
        pub uri: String,
    }
}

wire_slot! {
    pub struct ProfileBucket {
        /// Offsets into the string store.
        pub offset_name: i32,
        pub offset_description: i32,
        pub count_calls: u64,
        pub count_requests: u64,
        pub ticks_dispatch: u64,
        pub ticks_function: u64,
    }
}

wire_slot! {
    pub struct ThreadPoolBucket {
        pub offset_name: i32,
        pub count_threads_idle: u32,
        pub count_threads: u32,
        pub max_threads: u32,
        pub count_queued: u32,
        pub peak_queued: u32,
        pub max_queued: u32,
    }
}

wire_slot! {
    pub struct DnsBucket {
        pub flag_cache_enabled: bool,
        pub flag_async_enabled: bool,
        pub count_cache_entries: u32,
        pub max_cache_entries: u32,
        pub count_cache_hits: u32,
        pub count_cache_misses: u32,
        pub count_async_name_lookups: u32,
        pub count_async_addr_lookups: u32,
        pub count_async_lookups_in_progress: u32,
    }
}

wire_slot! {
    pub struct KeepAliveBucket {
        pub count_connections: u32,
        pub max_connections: u32,
        pub num_threads: u32,
        pub seconds_timeout: u32,
        pub count_hits: u64,
        pub count_flushes: u64,
        pub count_timeouts: u64,
        pub count_refusals: u64,
    }
}

wire_slot! {
    pub struct CacheBucket {
        pub flag_enabled: bool,
        pub seconds_max_age: i32,
        pub count_entries: u32,
        pub max_entries: u32,
        pub count_open_entries: u32,
        pub max_open_entries: u32,
        pub size_heap_cache: u64,
        pub max_heap_cache_size: u64,
        pub size_mmap_cache: u64,
        pub max_mmap_cache_size: u64,
        pub count_hits: u64,
        pub count_misses: u64,
        pub count_info_hits: u64,
        pub count_info_misses: u64,
        pub count_content_hits: u64,
        pub count_content_misses: u64,
        pub count_accelerator_entries: u32,
        pub count_acceleratable_requests: u64,
        pub count_unacceleratable_requests: u64,
        pub count_acceleratable_responses: u64,
        pub count_unacceleratable_responses: u64,
        pub count_accelerator_hits: u64,
        pub count_accelerator_misses: u64,
    }
}

wire_slot! {
    pub struct ConnectionQueueSlot {
        pub id: String,
        pub count_queued: u32,
        pub peak_queued: u32,
        pub max_queued: u32,
        pub count_overflows: u32,
        pub count_total_queued: u64,
        pub ticks_total_queued: u64,
        pub count_total_connections: u64,
        pub count_queued_1min_average: f64,
        pub count_queued_5min_average: f64,
        pub count_queued_15min_average: f64,
    }
}

wire_slot! {
    pub struct ProcessSlot {
        pub time_started: i64,
        pub mode: ProcessMode,
        pub pid: i32,
        pub count_connections: u32,
        pub peak_connections: u32,
        pub count_configurations: u32,
        pub fraction_system_memory_usage: u32,
        pub count_connection_queues: i32,
        pub count_thread_pools: i32,
        pub jvm_management_stats: bool,
        pub count_idle_threads: i32,
        pub count_threads: i32,
        pub cache_bucket: CacheBucket,
        pub dns_bucket: DnsBucket,
        pub keep_alive_bucket: KeepAliveBucket,
        pub request_bucket: RequestBucket,
        pub size_virtual: u64,
        pub size_resident: u64,
    }
}

wire_slot! {
    pub struct ThreadSlot {
        pub time_started: i64,
        pub mode: ThreadMode,
        pub offset_function_name: i32,
        pub conn_queue_id: String,
        pub vs_id: String,
        pub request_bucket: RequestBucket,
        pub address_client: String,
        pub time_request_started: i64,
    }
}

wire_slot! {
    pub struct VirtualServerSlot {
        pub mode: VsMode,
        pub id: String,
        pub request_bucket: RequestBucket,
    }
}

wire_slot! {
    pub struct WebModuleSlot {
        pub mode: WebModuleMode,
        pub count_jsp: i32,
        pub count_jsp_reload: i32,
        pub count_sessions: i32,
        pub count_active_sessions: i32,
        pub peak_active_sessions: i32,
        pub count_rejected_sessions: i32,
        pub count_expired_sessions: i32,
        pub session_max_alive_time: i32,
        pub session_avg_alive_time: i32,
    }
}

wire_slot! {
    pub struct WebModuleCacheSlot {
        pub enabled: bool,
        pub cache_type: i32,
        pub max_entries: i32,
        pub threshold: i32,
        pub table_size: i32,
        pub entry_count: i32,
        pub hit_count: i32,
        pub miss_count: i32,
        pub removal_count: i32,
        pub refresh_count: i32,
        pub overflow_count: i32,
        pub add_count: i32,
        pub lru_list_length: i32,
        pub trim_count: i32,
        pub segment_size: i32,
        pub current_size: i64,
        pub max_size: i64,
    }
}

wire_slot! {
    pub struct ServletSlot {
        pub count_request: i32,
        pub count_error: i32,
        pub millisec_processing: i64,
        pub millisec_peak_processing: i64,
    }
}

wire_slot! {
    pub struct JdbcConnPoolSlot {
        pub max_connections: i32,
        pub current_connections: i32,
        pub peak_connections: i32,
        pub free_connections: i32,
        pub leased_connections: i32,
        pub total_failed_validation: i32,
        pub total_recreated_connections: i32,
        pub queue_size: i32,
        pub peak_queue_size: i32,
        pub total_resized: i32,
        pub total_timedout: i32,
        pub total_leased_connections: u64,
        pub peak_wait_time: u64,
        pub average_queue_time: f64,
    }
}

wire_slot! {
    pub struct JvmManagementSlot {
        pub loaded_class_count: i32,
        pub total_loaded_class_count: i64,
        pub unloaded_class_count: i64,
        pub size_heap_used: i64,
        pub thread_count: i32,
        pub peak_thread_count: i32,
        pub total_started_thread_count: i64,
        pub garbage_collection_count: i64,
        pub garbage_collection_time: i64,
    }
}

wire_slot! {
    pub struct SessionReplicationSlot {
        pub count_instances: i32,
        pub count_self_recovery_attempts: i32,
        pub count_self_recovery_failures: i32,
        pub count_failover_attempts: i32,
        pub count_failover_failures: i32,
        pub count_backup_conn_failures: i32,
        pub count_backup_conn_failover_succ: i32,
        pub count_sent_puts: i32,
        pub count_sent_gets: i32,
        pub count_sent_removes: i32,
        pub count_received_puts: i32,
        pub count_received_gets: i32,
        pub count_received_removes: i32,
        pub flag_async_queue_enabled: bool,
        pub count_async_queue_entries: i32,
        pub peak_async_queue_entries: i32,
        pub count_lock_failures: i32,
    }
}

wire_slot! {
    pub struct AvgBucket {
        pub one_minute_average: f64,
        pub five_minute_average: f64,
        pub fifteen_minute_average: f64,
    }
}

wire_slot! {
    /// Totals over every virtual server of a process.
    ///
    /// In the cluster-wide view the response time averages are means of the
    /// per-child moving averages, not a merge of the underlying distributions.
    pub struct AccumulatedVsSlot {
        pub request_bucket: RequestBucket,
        pub all_reqs_profile_bucket: ProfileBucket,
        pub request_avg_bucket: AvgBucket,
        pub error_avg_bucket: AvgBucket,
        pub response_time_avg_bucket: AvgBucket,
        pub max_response_time: f64,
    }
}

wire_slot! {
    /// Process slot together with its per-process lists.
    pub struct ProcessInfo {
        pub slot: ProcessSlot,
        pub connection_queues: Vec<ConnectionQueueSlot>,
        pub thread_pools: Vec<ThreadPoolBucket>,
    }
}

wire_slot! {
    pub struct ThreadInfo {
        pub slot: ThreadSlot,
        pub profiles: Vec<ProfileBucket>,
    }
}

wire_slot! {
    pub struct VirtualServerInfo {
        pub slot: VirtualServerSlot,
        /// Space separated.
        pub hostnames: String,
        pub interfaces: String,
        pub profiles: Vec<ProfileBucket>,
    }
}

wire_slot! {
    pub struct WebModuleInfo {
        /// `//<vs-id>/<uri>`.
        pub name: String,
        pub slot: WebModuleSlot,
        pub cache: WebModuleCacheSlot,
    }
}

wire_slot! {
    pub struct ServletInfo {
        pub name: String,
        pub slot: ServletSlot,
    }
}

wire_slot! {
    /// Servlets of one web module.
    pub struct WebModuleServlets {
        pub web_module: String,
        pub servlets: Vec<ServletInfo>,
    }
}

wire_slot! {
    pub struct JdbcPoolInfo {
        pub name: String,
        pub slot: JdbcConnPoolSlot,
    }
}

wire_slot! {
    pub struct JvmInfo {
        pub slot: JvmManagementSlot,
        pub vm_version: String,
        pub vm_name: String,
        pub vm_vendor: String,
    }
}

wire_slot! {
    pub struct WebAppStoreInfo {
        pub mode: NodeState,
        pub store_id: String,
        pub vs_id: String,
        pub uri: String,
        pub count_replicated_sessions: i32,
    }
}

wire_slot! {
    pub struct SessReplInstanceInfo {
        pub mode: NodeState,
        pub instance_id: String,
        pub stores: Vec<WebAppStoreInfo>,
    }
}

wire_slot! {
    pub struct SessionReplicationInfo {
        pub slot: SessionReplicationSlot,
        pub cluster_members: String,
        pub current_backup_instance_id: String,
        pub state: String,
        pub instances: Vec<SessReplInstanceInfo>,
    }
}

wire_slot! {
    /// Request body of `GetThreadSlotData`.
    pub struct ThreadSlotRequest {
        pub pid: i32,
        pub index: i32,
    }
}

wire_slot! {
    /// Request body of `GetServletData`.
    pub struct ServletRequest {
        pub web_module: String,
    }
}

impl WebModuleInfo {
    /// Virtual server id embedded in the web module name.
    pub fn vs_id(&self) -> Option<&str> {
        web_module_vs_id(&self.name)
    }
}

/// Splits `//<vs-id>/<uri>` and returns the vs id.
pub fn web_module_vs_id(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("//")?;
    let end = rest.find('/')?;
    Some(&rest[..end])
}

pub fn web_module_belongs_to(name: &str, vs_id: &str) -> bool {
    web_module_vs_id(name) == Some(vs_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::payload::{from_payload, to_payload};

    #[test]
    fn header_checks_magic_and_version() {
        let header = HeaderSlot {
            version_server: "adminbus/0.4".into(),
            max_procs: 2,
            count_reconfig: 3,
            ..Default::default()
        };
        let bytes = to_payload(&header);
        assert_eq!(&bytes[..4], b"iWS\n");
        assert_eq!(from_payload::<HeaderSlot>(&bytes).unwrap(), header);

        let mut bad = bytes.to_vec();
        bad[0] = b'x';
        assert_eq!(from_payload::<HeaderSlot>(&bad).unwrap_err(), PayloadError::BadMagic);

        let old = HeaderSlot {
            version_minor: 2,
            ..header
        };
        assert_eq!(
            from_payload::<HeaderSlot>(&to_payload(&old)).unwrap_err(),
            PayloadError::Version { major: 1, minor: 2 }
        );
    }

    #[test]
    fn process_info_decodes_sub_lists() {
        let info = ProcessInfo {
            slot: ProcessSlot {
                pid: 4242,
                mode: ProcessMode::Active,
                count_connection_queues: 1,
                count_thread_pools: 2,
                ..Default::default()
            },
            connection_queues: vec![ConnectionQueueSlot {
                id: "cq1".into(),
                peak_queued: 9,
                ..Default::default()
            }],
            thread_pools: vec![ThreadPoolBucket::default(), ThreadPoolBucket::default()],
        };
        let decoded = from_payload::<ProcessInfo>(&to_payload(&info)).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn web_module_names_carry_vs_id() {
        assert_eq!(web_module_vs_id("//https-a/app"), Some("https-a"));
        assert_eq!(web_module_vs_id("//https-a/"), Some("https-a"));
        assert_eq!(web_module_vs_id("https-a/app"), None);
        assert!(web_module_belongs_to("//vs1/app", "vs1"));
        assert!(!web_module_belongs_to("//vs10/app", "vs1"));
    }

    #[test]
    fn slots_serialize_for_tooling() {
        let slot = ServletInfo {
            name: "jsp".into(),
            slot: ServletSlot {
                count_request: 10,
                count_error: 1,
                millisec_processing: 250,
                millisec_peak_processing: 40,
            },
        };
        insta::assert_json_snapshot!(slot, @r#"
        {
          "name": "jsp",
          "slot": {
            "count_request": 10,
            "count_error": 1,
            "millisec_processing": 250,
            "millisec_peak_processing": 40
          }
        }
        "#);
    }
}
