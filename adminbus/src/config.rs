//! Admin layer configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::transport::{ConnectOptions, socket_path};
use crate::stats::types::HeaderSlot;

/// Settings shared by the parent, its children and clients of one instance.
#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub temp_dir: PathBuf,
    pub product: String,
    pub max_procs: usize,
    pub stats_enabled: bool,
    /// Bound on every request/reply exchange with a peer.
    pub reply_timeout: Duration,
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
    pub child_connect_retries: u32,
    pub child_connect_delay: Duration,
    pub client_retries: u32,
    pub profiling: bool,
    pub server_version: String,
    pub update_interval: Duration,
    pub max_threads: u32,
    pub max_profile_buckets: u32,
}

impl AdminConfig {
    pub fn new(product: impl Into<String>) -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            product: product.into(),
            max_procs: 1,
            stats_enabled: true,
            reply_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            child_connect_retries: 30,
            child_connect_delay: Duration::from_secs(1),
            client_retries: 1,
            profiling: false,
            server_version: concat!("adminbus/", env!("CARGO_PKG_VERSION")).to_string(),
            update_interval: Duration::from_secs(5),
            max_threads: 512,
            max_profile_buckets: 16,
        }
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    pub fn with_max_procs(mut self, n: usize) -> Self {
        self.max_procs = n.max(1);
        self
    }

    pub fn with_stats(mut self, enabled: bool) -> Self {
        self.stats_enabled = enabled;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_child_connect_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.child_connect_retries = retries;
        self.child_connect_delay = delay;
        self
    }

    pub fn with_client_retries(mut self, retries: u32) -> Self {
        self.client_retries = retries;
        self
    }

    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.profiling = enabled;
        self
    }

    pub fn with_server_version(mut self, version: impl Into<String>) -> Self {
        self.server_version = version.into();
        self
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_limits(mut self, max_threads: u32, max_profile_buckets: u32) -> Self {
        self.max_threads = max_threads;
        self.max_profile_buckets = max_profile_buckets;
        self
    }

    /// Builds a config for `product` overlaid with `ADMINBUS_*` variables.
    pub fn from_env(product: impl Into<String>) -> Self {
        Self::new(product).apply_env(|key| std::env::var(key).ok())
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup("ADMINBUS_TEMP_DIR").filter(|d| !d.is_empty()) {
            self.temp_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("ADMINBUS_MAX_PROCS") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.max_procs = n,
                _ => tracing::warn!(value = %raw, "Ignoring invalid ADMINBUS_MAX_PROCS"),
            }
        }
        if let Some(raw) = lookup("ADMINBUS_STATS") {
            self.stats_enabled = !matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "0" | "off" | "false" | "no"
            );
        }
        self
    }

    pub fn socket_path(&self) -> PathBuf {
        socket_path(&self.temp_dir, &self.product)
    }

    /// Children keep retrying while the parent is still binding its socket.
    pub fn child_connect_options(&self) -> ConnectOptions {
        ConnectOptions::with_retries(
            self.child_connect_retries.max(1),
            self.child_connect_delay,
            self.connect_timeout,
        )
    }

    pub fn client_connect_options(&self) -> ConnectOptions {
        ConnectOptions::with_retries(
            self.client_retries.max(1),
            self.child_connect_delay,
            self.connect_timeout,
        )
    }

    /// Header slot describing this instance, stamped with the current time.
    pub fn header(&self) -> HeaderSlot {
        HeaderSlot {
            version_server: self.server_version.clone(),
            time_started: chrono::Utc::now().timestamp_micros(),
            ticks_per_second: 1_000_000,
            max_procs: self.max_procs as u32,
            max_threads: self.max_threads,
            max_profile_buckets: self.max_profile_buckets,
            seconds_update_interval: self.update_interval.as_secs() as i32,
            flag_profiling_enabled: self.profiling,
            ..HeaderSlot::default()
        }
    }
}
