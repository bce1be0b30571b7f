//! Text renderings of the aggregated store: the XML stats document and the
//! plain-text perf dump.

use serde::Serialize;

use super::types::{ProcessMode, ThreadMode, VsMode, WebModuleMode};
use crate::store::{AggregationStore, ProcessNode, VsNode, WebModuleNode};

/// Sections selected by a dump query such as `thread=0&jvm=0`.
///
/// Every section is on unless the query turns it off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DumpQuery {
    pub process: bool,
    pub thread: bool,
    pub virtual_server: bool,
    pub web_module: bool,
    pub servlet: bool,
    pub profile: bool,
    pub jdbc: bool,
    pub jvm: bool,
    pub session_replication: bool,
}

impl Default for DumpQuery {
    fn default() -> Self {
        Self {
            process: true,
            thread: true,
            virtual_server: true,
            web_module: true,
            servlet: true,
            profile: true,
            jdbc: true,
            jvm: true,
            session_replication: true,
        }
    }
}

impl DumpQuery {
    pub fn parse(query: &str) -> Self {
        let mut q = Self::default();
        let terms = query
            .split(|c: char| c == '&' || c == ';' || c.is_whitespace())
            .filter(|t| !t.is_empty());
        for term in terms {
            let (name, value) = term.split_once('=').unwrap_or((term, "1"));
            let on = !matches!(value, "0" | "false" | "off" | "no");
            let flag = match name {
                "process" => &mut q.process,
                "thread" => &mut q.thread,
                "virtual-server" | "vs" => &mut q.virtual_server,
                "web-module" | "webapp" => &mut q.web_module,
                "servlet" => &mut q.servlet,
                "profile" => &mut q.profile,
                "jdbc" => &mut q.jdbc,
                "jvm" => &mut q.jvm,
                "session-replication" => &mut q.session_replication,
                other => {
                    tracing::trace!(term = other, "Ignoring unknown dump query term");
                    continue;
                }
            };
            *flag = on;
        }
        q
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

struct Xml {
    out: String,
    depth: usize,
}

impl Xml {
    fn new() -> Self {
        Self {
            out: String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n"),
            depth: 0,
        }
    }

    fn tag(&mut self, name: &str, attrs: &[(&str, String)], close: bool) {
        self.out.push_str(&"  ".repeat(self.depth));
        self.out.push('<');
        self.out.push_str(name);
        for (key, value) in attrs {
            self.out.push_str(&format!(" {key}=\"{}\"", escape(value)));
        }
        self.out.push_str(if close { "/>\n" } else { ">\n" });
    }

    fn open(&mut self, name: &str, attrs: &[(&str, String)]) {
        self.tag(name, attrs, false);
        self.depth += 1;
    }

    fn empty(&mut self, name: &str, attrs: &[(&str, String)]) {
        self.tag(name, attrs, true);
    }

    fn close(&mut self, name: &str) {
        self.depth = self.depth.saturating_sub(1);
        self.out.push_str(&"  ".repeat(self.depth));
        self.out.push_str(&format!("</{name}>\n"));
    }
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_owned()
}

fn process_mode(mode: ProcessMode) -> &'static str {
    match mode {
        ProcessMode::Empty => "empty",
        ProcessMode::Active => "active",
    }
}

fn thread_mode(mode: ThreadMode) -> &'static str {
    match mode {
        ThreadMode::Empty => "empty",
        ThreadMode::Idle => "idle",
        ThreadMode::Dns => "DNS",
        ThreadMode::Request => "request",
        ThreadMode::Processing => "processing",
        ThreadMode::Response => "response",
        ThreadMode::Updating => "updating",
        ThreadMode::KeepAlive => "keep-alive",
    }
}

fn vs_mode(mode: VsMode) -> &'static str {
    match mode {
        VsMode::Empty => "empty",
        VsMode::Active => "active",
        VsMode::Disabled => "disabled",
        VsMode::Unknown => "unknown",
    }
}

fn web_module_mode(mode: WebModuleMode) -> &'static str {
    match mode {
        WebModuleMode::Empty => "empty",
        WebModuleMode::Enabled => "enabled",
        WebModuleMode::Disabled => "disabled",
        WebModuleMode::Unknown => "unknown",
    }
}

/// Renders the XML stats document for `query`.
pub fn render_xml(store: &AggregationStore, query: &DumpQuery) -> String {
    let header = store.header();
    let mut xml = Xml::new();
    xml.open(
        "stats",
        &[
            ("versionMajor", header.version_major.to_string()),
            ("versionMinor", header.version_minor.to_string()),
            ("flagEnabled", flag(true)),
        ],
    );
    xml.open(
        "server",
        &[
            ("versionServer", header.version_server.clone()),
            ("timeStarted", header.time_started.to_string()),
            ("secondsRunning", header.seconds_running.to_string()),
            ("ticksPerSecond", header.ticks_per_second.to_string()),
            ("maxProcs", header.max_procs.to_string()),
            ("maxThreads", header.max_threads.to_string()),
            ("countChildDied", header.count_child_died.to_string()),
            ("countReconfig", header.count_reconfig.to_string()),
            ("flagProfilingEnabled", flag(header.flag_profiling_enabled)),
        ],
    );

    for cpu in store.cpu_info() {
        xml.empty(
            "cpu-info",
            &[
                ("cpu", cpu.id.clone()),
                ("percentIdle", format!("{:.2}", cpu.percent_idle)),
                ("percentUser", format!("{:.2}", cpu.percent_user)),
                ("percentKernel", format!("{:.2}", cpu.percent_kernel)),
            ],
        );
    }

    if query.process {
        for node in store.processes().iter().filter(|p| p.is_active()) {
            render_process(&mut xml, node, query);
        }
    }
    if query.virtual_server {
        for vs in store.virtual_servers() {
            render_vs(&mut xml, vs, query);
        }
    }
    if let Some(repl) = store.session_replication().filter(|_| query.session_replication) {
        xml.open(
            "session-replication",
            &[
                ("state", repl.state.clone()),
                ("countInstances", repl.slot.count_instances.to_string()),
                ("currentBackupInstanceId", repl.current_backup_instance_id.clone()),
            ],
        );
        for instance in &repl.instances {
            xml.open("instance", &[("id", instance.instance_id.clone())]);
            for webapp in &instance.stores {
                xml.empty(
                    "webapp-store",
                    &[
                        ("id", webapp.store_id.clone()),
                        ("vsId", webapp.vs_id.clone()),
                        ("uri", webapp.uri.clone()),
                        ("countReplicatedSessions", webapp.count_replicated_sessions.to_string()),
                    ],
                );
            }
            xml.close("instance");
        }
        xml.close("session-replication");
    }

    xml.close("server");
    xml.close("stats");
    xml.out
}

fn render_process(xml: &mut Xml, node: &ProcessNode, query: &DumpQuery) {
    let slot = &node.slot;
    xml.open(
        "process",
        &[
            ("pid", slot.pid.to_string()),
            ("mode", process_mode(slot.mode).to_owned()),
            ("timeStarted", slot.time_started.to_string()),
            ("countConfigurations", slot.count_configurations.to_string()),
            ("countThreads", slot.count_threads.to_string()),
            ("countIdleThreads", slot.count_idle_threads.to_string()),
            ("countConnections", slot.count_connections.to_string()),
            ("peakConnections", slot.peak_connections.to_string()),
            ("sizeVirtual", slot.size_virtual.to_string()),
            ("sizeResident", slot.size_resident.to_string()),
        ],
    );
    for queue in &node.connection_queues {
        xml.empty(
            "connection-queue",
            &[
                ("id", queue.id.clone()),
                ("countQueued", queue.count_queued.to_string()),
                ("peakQueued", queue.peak_queued.to_string()),
                ("maxQueued", queue.max_queued.to_string()),
                ("countOverflows", queue.count_overflows.to_string()),
                ("countTotalConnections", queue.count_total_connections.to_string()),
            ],
        );
    }
    for pool in &node.thread_pools {
        xml.empty(
            "thread-pool",
            &[
                ("countThreadsIdle", pool.count_threads_idle.to_string()),
                ("countThreads", pool.count_threads.to_string()),
                ("maxThreads", pool.max_threads.to_string()),
                ("countQueued", pool.count_queued.to_string()),
                ("peakQueued", pool.peak_queued.to_string()),
                ("maxQueued", pool.max_queued.to_string()),
            ],
        );
    }
    for listen in &node.listen_slots {
        xml.empty(
            "listen",
            &[
                ("id", listen.id.clone()),
                ("address", listen.address.clone()),
                ("countAcceptors", listen.count_acceptors.to_string()),
                ("flagSecure", flag(listen.flag_secure)),
                ("defaultVsId", listen.default_vs_id.clone()),
            ],
        );
    }
    if query.thread {
        for thread in node.threads.iter().filter(|t| t.slot.mode != ThreadMode::Empty) {
            xml.empty(
                "thread",
                &[
                    ("mode", thread_mode(thread.slot.mode).to_owned()),
                    ("timeStarted", thread.slot.time_started.to_string()),
                    ("connectionQueueId", thread.slot.conn_queue_id.clone()),
                    ("vsId", thread.slot.vs_id.clone()),
                    ("clientAddress", thread.slot.address_client.clone()),
                    ("countRequests", thread.slot.request_bucket.count_requests.to_string()),
                ],
            );
        }
    }
    if query.jdbc {
        for pool in &node.jdbc_pools {
            xml.empty(
                "jdbc-resource",
                &[
                    ("name", pool.name.clone()),
                    ("maxConnections", pool.slot.max_connections.to_string()),
                    ("currentConnections", pool.slot.current_connections.to_string()),
                    ("peakConnections", pool.slot.peak_connections.to_string()),
                    ("freeConnections", pool.slot.free_connections.to_string()),
                    ("leasedConnections", pool.slot.leased_connections.to_string()),
                    ("queueSize", pool.slot.queue_size.to_string()),
                ],
            );
        }
    }
    if let Some(jvm) = node.jvm.as_ref().filter(|_| query.jvm) {
        xml.empty(
            "jvm",
            &[
                ("vmName", jvm.vm_name.clone()),
                ("vmVersion", jvm.vm_version.clone()),
                ("vmVendor", jvm.vm_vendor.clone()),
                ("sizeHeap", jvm.slot.size_heap_used.to_string()),
                ("countThreads", jvm.slot.thread_count.to_string()),
                ("peakThreads", jvm.slot.peak_thread_count.to_string()),
                ("countGarbageCollections", jvm.slot.garbage_collection_count.to_string()),
            ],
        );
    }
    xml.close("process");
}

fn render_vs(xml: &mut Xml, vs: &VsNode, query: &DumpQuery) {
    let requests = &vs.slot.request_bucket;
    xml.open(
        "virtual-server",
        &[
            ("id", vs.slot.id.clone()),
            ("mode", vs_mode(vs.slot.mode).to_owned()),
            ("hosts", vs.hostnames.clone()),
            ("interfaces", vs.interfaces.clone()),
        ],
    );
    xml.empty(
        "request-bucket",
        &[
            ("countRequests", requests.count_requests.to_string()),
            ("countBytesReceived", requests.count_bytes_received.to_string()),
            ("countBytesTransmitted", requests.count_bytes_transmitted.to_string()),
            ("countOpenConnections", requests.count_open_connections.to_string()),
            ("count2xx", requests.count_2xx.to_string()),
            ("count3xx", requests.count_3xx.to_string()),
            ("count4xx", requests.count_4xx.to_string()),
            ("count5xx", requests.count_5xx.to_string()),
            ("countOther", requests.count_other.to_string()),
        ],
    );
    if query.profile {
        for (index, profile) in vs.profiles.iter().enumerate() {
            xml.empty(
                "profile",
                &[
                    ("index", index.to_string()),
                    ("countCalls", profile.count_calls.to_string()),
                    ("countRequests", profile.count_requests.to_string()),
                    ("ticksDispatch", profile.ticks_dispatch.to_string()),
                    ("ticksFunction", profile.ticks_function.to_string()),
                ],
            );
        }
    }
    if query.web_module {
        for wm in vs.web_modules.live() {
            render_web_module(xml, wm, query);
        }
    }
    xml.close("virtual-server");
}

fn render_web_module(xml: &mut Xml, wm: &WebModuleNode, query: &DumpQuery) {
    xml.open(
        "web-module",
        &[
            ("name", wm.name.clone()),
            ("mode", web_module_mode(wm.slot.mode).to_owned()),
            ("countJsp", wm.slot.count_jsp.to_string()),
            ("countSessions", wm.slot.count_sessions.to_string()),
            ("countActiveSessions", wm.slot.count_active_sessions.to_string()),
            ("peakActiveSessions", wm.slot.peak_active_sessions.to_string()),
            ("countRejectedSessions", wm.slot.count_rejected_sessions.to_string()),
            ("countExpiredSessions", wm.slot.count_expired_sessions.to_string()),
        ],
    );
    if query.servlet {
        for servlet in &wm.servlets {
            xml.empty(
                "servlet",
                &[
                    ("name", servlet.name.clone()),
                    ("countRequests", servlet.slot.count_request.to_string()),
                    ("countErrors", servlet.slot.count_error.to_string()),
                    ("millisecProcessing", servlet.slot.millisec_processing.to_string()),
                    ("millisecPeakProcessing", servlet.slot.millisec_peak_processing.to_string()),
                ],
            );
        }
    }
    xml.close("web-module");
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Renders the plain-text perf dump from the cluster-wide views.
pub fn render_perf_dump(store: &AggregationStore) -> String {
    let header = store.header();
    let node = store.accumulated_process();
    let slot = &node.slot;
    let mut out = String::new();
    let mut line = |text: String| {
        out.push_str(&text);
        out.push('\n');
    };

    line(format!("{} pids: {:?}", header.version_server, store.pids()));
    line(format!("Server running for {} seconds", header.seconds_running));
    line(String::new());

    for queue in &node.connection_queues {
        line(format!("ConnectionQueue {}:", queue.id));
        line("-----------------------------------------".into());
        line(format!(
            "Current/Peak/Limit Queue Length            {}/{}/{}",
            queue.count_queued, queue.peak_queued, queue.max_queued
        ));
        line(format!("Total Connections Queued                   {}", queue.count_total_queued));
        line(format!("Total Connections Overflowed               {}", queue.count_overflows));
        line(String::new());
    }

    let keep_alive = &slot.keep_alive_bucket;
    line("KeepAliveInfo:".into());
    line("--------------------".into());
    line(format!(
        "KeepAliveCount        {}/{}",
        keep_alive.count_connections, keep_alive.max_connections
    ));
    line(format!("KeepAliveHits         {}", keep_alive.count_hits));
    line(format!("KeepAliveFlushes      {}", keep_alive.count_flushes));
    line(format!("KeepAliveRefusals     {}", keep_alive.count_refusals));
    line(format!("KeepAliveTimeouts     {}", keep_alive.count_timeouts));
    line(format!("KeepAliveTimeout      {} seconds", keep_alive.seconds_timeout));
    line(String::new());

    let cache = &slot.cache_bucket;
    line("CacheInfo:".into());
    line("------------------".into());
    if cache.flag_enabled {
        let lookups = cache.count_hits + cache.count_misses;
        line(format!(
            "File Cache Enabled    yes\nHit Ratio             {}/{} ({:.2}%)",
            cache.count_hits,
            lookups,
            ratio(cache.count_hits, lookups)
        ));
        line(format!(
            "Cache Entries         {}/{}",
            cache.count_entries, cache.max_entries
        ));
        line(format!("Maximum Age           {}", cache.seconds_max_age));
    } else {
        line("File Cache Enabled    no".into());
    }
    line(String::new());

    for pool in &node.thread_pools {
        line("Native pools:".into());
        line("----------------------------".into());
        line(format!(
            "Idle/Peak/Limit               {}/{}/{}",
            pool.count_threads_idle, pool.count_threads, pool.max_threads
        ));
        line(format!(
            "Work Queue Length/Peak/Limit  {}/{}/{}",
            pool.count_queued, pool.peak_queued, pool.max_queued
        ));
        line(String::new());
    }

    let dns = &slot.dns_bucket;
    line("DNSCacheInfo:".into());
    line("------------------".into());
    if dns.flag_cache_enabled {
        let lookups = u64::from(dns.count_cache_hits) + u64::from(dns.count_cache_misses);
        line(format!(
            "HitRatio              {}/{} ({:.2}%)",
            dns.count_cache_hits,
            lookups,
            ratio(u64::from(dns.count_cache_hits), lookups)
        ));
    } else {
        line("Server DNS cache disabled".into());
    }
    line(String::new());

    let requests = &slot.request_bucket;
    line("Server Requests:".into());
    line("------------------".into());
    line(format!("Total Requests        {}", requests.count_requests));
    line(format!("Bytes Received        {}", requests.count_bytes_received));
    line(format!("Bytes Sent            {}", requests.count_bytes_transmitted));
    line(format!(
        "2xx/3xx/4xx/5xx/other {}/{}/{}/{}/{}",
        requests.count_2xx,
        requests.count_3xx,
        requests.count_4xx,
        requests.count_5xx,
        requests.count_other
    ));

    if header.flag_profiling_enabled {
        line(String::new());
        line("Per Virtual Server:".into());
        line("------------------".into());
        for vs in store.virtual_servers() {
            line(format!(
                "{:<20} requests {:>10}  open connections {:>6}",
                vs.slot.id,
                vs.slot.request_bucket.count_requests,
                vs.slot.request_bucket.count_open_connections
            ));
        }
    }
    out
}
