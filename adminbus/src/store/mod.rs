//! Parent-side mirror of every child's statistics.
//!
//! The store keeps one [`ProcessNode`] per child slot and one [`VsMirror`] per
//! child. With more than one child a consolidated mirror and an accumulated
//! process node hold the cluster-wide views; with a single child the child's
//! own data is the cluster view and every `aggregate_*` call is a no-op.
//!
//! Views are recomputed on demand by the `aggregate_*` and
//! `accumulate_process_data` passes, never incrementally.

pub mod aggregate;
pub mod nodes;
pub mod process;
pub mod vs;

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use thiserror::Error;

pub use nodes::{NodeList, StoreNode};
pub use process::ProcessNode;
pub use vs::{VsMirror, VsNode, WebModuleNode};

use crate::bridge::payload::PayloadError;
use crate::stats::types::{
    AccumulatedVsSlot, CpuInfoSlot, HeaderSlot, INVALID_PROCESS_ID, JdbcPoolInfo, JvmInfo,
    ListenSlot, ProcessInfo, ProcessMode, ProcessSlot, SessionReplicationInfo, ThreadInfo,
    VirtualServerInfo, VsMode, WebModuleInfo, WebModuleServlets, web_module_vs_id,
};

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("no process slot for pid {0}")]
    PidNotFound(i32),

    #[error("all {0} process slots are in use")]
    NoFreeProcessSlot(usize),

    #[error("virtual server {0} is not known")]
    UnknownVs(String),

    #[error("web module {0} is not known")]
    UnknownWebModule(String),

    #[error("thread index {index} out of range for pid {pid}")]
    ThreadIndex { pid: i32, index: usize },

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

pub type SharedStore = Arc<Mutex<AggregationStore>>;

/// Locks the shared store, recovering from a poisoned lock.
pub fn lock(store: &SharedStore) -> MutexGuard<'_, AggregationStore> {
    store.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Aggregation store lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

#[derive(Debug)]
pub struct AggregationStore {
    header: HeaderSlot,
    cpu_info: Vec<CpuInfoSlot>,
    string_store: Bytes,
    processes: Vec<ProcessNode>,
    accumulated_process: ProcessNode,
    children: Vec<VsMirror>,
    consolidated: VsMirror,
    /// Mirror of a died child, folded into its replacement's counters until
    /// the replacement dies in turn.
    inherited: Vec<Option<VsMirror>>,
}

impl AggregationStore {
    pub fn new(max_procs: usize, header: HeaderSlot) -> Self {
        let max_procs = max_procs.max(1);
        Self {
            header,
            cpu_info: Vec::new(),
            string_store: Bytes::new(),
            processes: vec![ProcessNode::default(); max_procs],
            accumulated_process: ProcessNode::default(),
            children: vec![VsMirror::default(); max_procs],
            consolidated: VsMirror::default(),
            inherited: vec![None; max_procs],
        }
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn child_count(&self) -> usize {
        self.processes.len()
    }

    fn multi_child(&self) -> bool {
        self.processes.len() > 1
    }

    pub fn header(&self) -> &HeaderSlot {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut HeaderSlot {
        &mut self.header
    }

    pub fn cpu_info(&self) -> &[CpuInfoSlot] {
        &self.cpu_info
    }

    pub fn set_cpu_info(&mut self, cpus: Vec<CpuInfoSlot>) {
        self.cpu_info = cpus;
    }

    pub fn string_store(&self) -> &Bytes {
        &self.string_store
    }

    pub fn set_string_store(&mut self, strings: Bytes) {
        self.string_store = strings;
    }

    // ---- processes -------------------------------------------------------

    pub fn processes(&self) -> &[ProcessNode] {
        &self.processes
    }

    /// Slot currently owned by `pid`, including a died child not yet replaced.
    pub fn slot_of(&self, pid: i32) -> Option<usize> {
        if pid == INVALID_PROCESS_ID {
            return None;
        }
        self.processes.iter().position(|p| p.pid() == pid)
    }

    fn slot_for(&self, pid: i32) -> Result<usize, StoreError> {
        self.slot_of(pid).ok_or(StoreError::PidNotFound(pid))
    }

    pub fn process(&self, pid: i32) -> Result<&ProcessNode, StoreError> {
        let slot = self.slot_for(pid)?;
        Ok(&self.processes[slot])
    }

    fn process_mut(&mut self, pid: i32) -> Result<&mut ProcessNode, StoreError> {
        let slot = self.slot_for(pid)?;
        Ok(&mut self.processes[slot])
    }

    pub fn is_active_pid(&self, pid: i32) -> bool {
        self.slot_of(pid)
            .is_some_and(|slot| self.processes[slot].is_active())
    }

    /// Pids of live children in slot order.
    pub fn pids(&self) -> Vec<i32> {
        self.processes
            .iter()
            .filter(|p| p.is_active())
            .map(ProcessNode::pid)
            .collect()
    }

    /// Claims a free slot for a child's first snapshot.
    pub fn initialize_process_slot(&mut self, info: &ProcessInfo) -> Result<usize, StoreError> {
        let slot = self
            .processes
            .iter()
            .position(|p| p.pid() == INVALID_PROCESS_ID)
            .ok_or(StoreError::NoFreeProcessSlot(self.processes.len()))?;
        let node = &mut self.processes[slot];
        node.apply(info);
        node.slot.mode = ProcessMode::Active;
        node.jdbc_pools.clear();
        tracing::debug!(pid = info.slot.pid, slot, "Process slot initialized");
        Ok(slot)
    }

    pub fn update_process_slot(&mut self, info: &ProcessInfo) -> Result<(), StoreError> {
        self.process_mut(info.slot.pid)?.apply(info);
        Ok(())
    }

    /// Marks a died child's slot empty, keeping its pid.
    pub fn mark_process_slot_empty(&mut self, pid: i32) -> Result<usize, StoreError> {
        let slot = self.slot_for(pid)?;
        self.processes[slot].slot.mode = ProcessMode::Empty;
        tracing::debug!(pid, slot, "Process slot marked empty");
        Ok(slot)
    }

    /// First slot whose child died and has not been replaced.
    pub fn last_died_slot(&self) -> Option<usize> {
        self.processes.iter().position(ProcessNode::is_died)
    }

    /// Releases the died child's slot for its replacement.
    ///
    /// The died child's virtual server mirror is kept as a baseline for the
    /// slot, so the replacement's counters continue from where it stopped.
    pub fn unmark_last_process_slot(&mut self) -> Option<usize> {
        let slot = self.last_died_slot()?;
        let old_pid = self.processes[slot].pid();
        self.processes[slot].slot.pid = INVALID_PROCESS_ID;

        let fresh = self.children[slot].fresh_like();
        let died = std::mem::replace(&mut self.children[slot], fresh);
        self.inherited[slot] = Some(died);
        tracing::debug!(pid = old_pid, slot, "Died process slot released");
        Some(slot)
    }

    pub fn reset_thread_slots(&mut self, pid: i32, count: usize) -> Result<(), StoreError> {
        self.process_mut(pid)?.reset_threads(count);
        Ok(())
    }

    pub fn update_thread_slot(
        &mut self,
        pid: i32,
        index: usize,
        info: ThreadInfo,
    ) -> Result<(), StoreError> {
        let node = self.process_mut(pid)?;
        let thread = node
            .threads
            .get_mut(index)
            .ok_or(StoreError::ThreadIndex { pid, index })?;
        *thread = info;
        Ok(())
    }

    pub fn thread(&self, pid: i32, index: usize) -> Result<&ThreadInfo, StoreError> {
        self.process(pid)?
            .threads
            .get(index)
            .ok_or(StoreError::ThreadIndex { pid, index })
    }

    pub fn init_listen_slots(&mut self, pid: i32, slots: &[ListenSlot]) -> Result<(), StoreError> {
        self.process_mut(pid)?.set_listen_slots(slots);
        Ok(())
    }

    pub fn update_jdbc_pools(&mut self, pid: i32, pools: &[JdbcPoolInfo]) -> Result<(), StoreError> {
        self.process_mut(pid)?.update_jdbc_pools(pools);
        Ok(())
    }

    /// `None` means the child has no JVM data yet, which is not an error.
    pub fn update_jvm(&mut self, pid: i32, info: Option<&JvmInfo>) -> Result<(), StoreError> {
        let node = self.process_mut(pid)?;
        if let Some(info) = info {
            node.update_jvm(info);
        }
        Ok(())
    }

    /// Session replication data lives on the first process node.
    pub fn update_session_replication(&mut self, info: &SessionReplicationInfo) {
        self.processes[0].update_session_replication(info);
    }

    pub fn session_replication(&self) -> Option<&SessionReplicationInfo> {
        self.processes[0].session_replication.as_ref()
    }

    /// Recomputes the accumulated process view from every owned slot.
    pub fn accumulate_process_data(&mut self) {
        if !self.multi_child() {
            return;
        }
        let mut total = ProcessSlot::default();
        let mut pools = Vec::new();
        for node in self.processes.iter().filter(|p| p.pid() != INVALID_PROCESS_ID) {
            aggregate::accumulate_process(&mut total, &node.slot);
            if pools.len() < node.thread_pools.len() {
                pools.resize_with(node.thread_pools.len(), Default::default);
            }
            for (sum, pool) in pools.iter_mut().zip(&node.thread_pools) {
                aggregate::accumulate_thread_pool(sum, pool);
            }
        }
        total.mode = ProcessMode::Active;
        total.pid = INVALID_PROCESS_ID;
        total.count_thread_pools = pools.len() as i32;
        self.accumulated_process.slot = total;
        self.accumulated_process.thread_pools = pools;
    }

    /// Cluster-wide process view; the child's own node with a single child.
    pub fn accumulated_process(&self) -> &ProcessNode {
        if self.multi_child() {
            &self.accumulated_process
        } else {
            &self.processes[0]
        }
    }

    // ---- virtual servers -------------------------------------------------

    fn view(&self) -> &VsMirror {
        if self.multi_child() {
            &self.consolidated
        } else {
            &self.children[0]
        }
    }

    fn mirrors_mut(&mut self) -> impl Iterator<Item = &mut VsMirror> {
        let consolidated = self.multi_child().then_some(&mut self.consolidated);
        self.children.iter_mut().chain(consolidated)
    }

    fn mirror_mut(&mut self, pid: i32) -> Result<&mut VsMirror, StoreError> {
        let slot = self.slot_for(pid)?;
        Ok(&mut self.children[slot])
    }

    /// Reconciles every mirror with the configured virtual server ids.
    pub fn init_vs_list(&mut self, ids: &[String]) {
        for mirror in self.mirrors_mut() {
            mirror.init_servers(ids);
        }
        tracing::debug!(count = ids.len(), "Virtual server list initialized");
    }

    /// Marks every virtual server and web module empty ahead of a new
    /// configuration.
    pub fn do_reconfigure_changes(&mut self) {
        for mirror in self.mirrors_mut() {
            mirror.mark_all_empty();
        }
    }

    /// Enables `names` in `pid`'s mirror and the consolidated view, then
    /// prunes web modules of those two mirrors that were not re-enabled.
    ///
    /// Names under an unknown virtual server are skipped and reported in the
    /// returned error after the rest have been applied.
    pub fn init_web_modules(&mut self, pid: i32, names: &[String]) -> Result<(), StoreError> {
        let slot = self.slot_for(pid)?;
        let multi = self.multi_child();
        let mut unknown = None;
        for name in names {
            let Some(vs_id) = web_module_vs_id(name) else {
                unknown.get_or_insert_with(|| StoreError::UnknownVs(name.clone()));
                continue;
            };
            let mut found = self.children[slot].enable_web_module(vs_id, name);
            if multi {
                found &= self.consolidated.enable_web_module(vs_id, name);
            }
            if !found {
                tracing::warn!(pid, web_module = %name, "Web module under unknown virtual server");
                unknown.get_or_insert_with(|| StoreError::UnknownVs(vs_id.to_owned()));
            }
        }
        self.children[slot].prune_web_modules();
        if multi {
            self.consolidated.prune_web_modules();
        }
        match unknown {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn update_vs_slot(&mut self, pid: i32, info: &VirtualServerInfo) -> Result<(), StoreError> {
        let slot = self.slot_for(pid)?;
        let id = info.slot.id.as_str();
        let baseline = self.inherited[slot]
            .as_ref()
            .and_then(|m| m.servers.find(id))
            .map(|vs| (vs.slot.request_bucket.clone(), vs.profiles.clone()));

        let node = self.children[slot]
            .servers
            .find_mut(id)
            .ok_or_else(|| StoreError::UnknownVs(id.to_owned()))?;
        node.apply(info);
        if let Some((mut requests, mut profiles)) = baseline {
            aggregate::aggregate_request_bucket(&mut requests, &node.slot.request_bucket);
            node.slot.request_bucket = requests;
            aggregate::aggregate_profiles(&mut profiles, &node.profiles);
            if profiles.len() == node.profiles.len() {
                node.profiles = profiles;
            }
        }
        Ok(())
    }

    pub fn update_accumulated_vs(
        &mut self,
        pid: i32,
        slot: &AccumulatedVsSlot,
    ) -> Result<(), StoreError> {
        self.mirror_mut(pid)?.accumulated = slot.clone();
        Ok(())
    }

    pub fn update_web_module_data(
        &mut self,
        pid: i32,
        modules: &[WebModuleInfo],
    ) -> Result<(), StoreError> {
        let mirror = self.mirror_mut(pid)?;
        for info in modules {
            let node = mirror
                .web_module_mut(&info.name)
                .ok_or_else(|| StoreError::UnknownWebModule(info.name.clone()))?;
            node.slot = info.slot.clone();
            node.cache = info.cache.clone();
        }
        Ok(())
    }

    pub fn update_servlet_data(
        &mut self,
        pid: i32,
        data: &WebModuleServlets,
    ) -> Result<(), StoreError> {
        let mirror = self.mirror_mut(pid)?;
        let node = mirror
            .web_module_mut(&data.web_module)
            .ok_or_else(|| StoreError::UnknownWebModule(data.web_module.clone()))?;
        for servlet in &data.servlets {
            *node.servlet_mut(&servlet.name) = servlet.slot.clone();
        }
        Ok(())
    }

    /// Rebuilds consolidated virtual server data from every child.
    pub fn aggregate_vs_data(&mut self) -> Result<(), StoreError> {
        if !self.multi_child() {
            return Ok(());
        }
        let Some((first, rest)) = self.children.split_first() else {
            return Ok(());
        };
        for target in self.consolidated.servers.iter_mut() {
            let id = target.id().to_owned();
            let source = first
                .servers
                .find(&id)
                .ok_or_else(|| StoreError::UnknownVs(id.clone()))?;
            target.apply(&source.to_info());
            for child in rest {
                let source = child
                    .servers
                    .find(&id)
                    .ok_or_else(|| StoreError::UnknownVs(id.clone()))?;
                aggregate::aggregate_request_bucket(
                    &mut target.slot.request_bucket,
                    &source.slot.request_bucket,
                );
                aggregate::aggregate_profiles(&mut target.profiles, &source.profiles);
            }
        }
        Ok(())
    }

    pub fn aggregate_accumulated_vs_data(&mut self) {
        if !self.multi_child() {
            return;
        }
        self.consolidated.accumulated =
            aggregate::merge_accumulated_vs(self.children.iter().map(|c| &c.accumulated));
    }

    pub fn aggregate_web_module_data(&mut self, name: &str) -> Result<(), StoreError> {
        if !self.multi_child() {
            return Ok(());
        }
        let unknown = || StoreError::UnknownWebModule(name.to_owned());
        let target = self.consolidated.web_module_mut(name).ok_or_else(unknown)?;
        let mut children = self.children.iter();
        let first = children
            .next()
            .and_then(|c| c.web_module(name))
            .ok_or_else(unknown)?;
        target.slot = first.slot.clone();
        target.cache = first.cache.clone();
        for child in children {
            let source = child.web_module(name).ok_or_else(unknown)?;
            aggregate::aggregate_web_module(
                &mut target.slot,
                &mut target.cache,
                &source.slot,
                &source.cache,
            );
        }
        Ok(())
    }

    pub fn aggregate_all_web_module_data(&mut self) -> Result<(), StoreError> {
        for name in self.web_module_names() {
            self.aggregate_web_module_data(&name)?;
        }
        Ok(())
    }

    pub fn aggregate_servlet_data(&mut self, web_module: &str) -> Result<(), StoreError> {
        if !self.multi_child() {
            return Ok(());
        }
        let unknown = || StoreError::UnknownWebModule(web_module.to_owned());
        let target = self
            .consolidated
            .web_module_mut(web_module)
            .ok_or_else(unknown)?;
        let mut children = self.children.iter();
        let first = children
            .next()
            .and_then(|c| c.web_module(web_module))
            .ok_or_else(unknown)?;
        for servlet in &first.servlets {
            *target.servlet_mut(&servlet.name) = servlet.slot.clone();
        }
        for child in children {
            let source = child.web_module(web_module).ok_or_else(unknown)?;
            for servlet in &first.servlets {
                if let Some(other) = source.servlets.find(&servlet.name) {
                    aggregate::aggregate_servlet(target.servlet_mut(&servlet.name), &other.slot);
                }
            }
        }
        Ok(())
    }

    pub fn aggregate_all_servlet_data(&mut self) -> Result<(), StoreError> {
        for name in self.web_module_names() {
            self.aggregate_servlet_data(&name)?;
        }
        Ok(())
    }

    /// Live virtual server ids in configuration order.
    pub fn vs_ids(&self) -> Vec<String> {
        self.view()
            .servers
            .iter()
            .filter(|vs| vs.slot.mode != VsMode::Empty)
            .map(|vs| vs.id().to_owned())
            .collect()
    }

    pub fn virtual_servers(&self) -> impl Iterator<Item = &VsNode> {
        self.view().servers.live()
    }

    pub fn vs_info(&self, id: &str) -> Option<VirtualServerInfo> {
        self.view().servers.find(id).map(VsNode::to_info)
    }

    pub fn accumulated_vs(&self) -> &AccumulatedVsSlot {
        &self.view().accumulated
    }

    pub fn web_module_names(&self) -> Vec<String> {
        self.view().web_modules().map(|wm| wm.name.clone()).collect()
    }

    pub fn web_module(&self, name: &str) -> Option<WebModuleInfo> {
        self.view().web_module(name).map(WebModuleNode::to_info)
    }

    pub fn all_web_modules(&self) -> Vec<WebModuleInfo> {
        self.view().web_modules().map(WebModuleNode::to_info).collect()
    }

    pub fn servlets(&self, web_module: &str) -> Option<WebModuleServlets> {
        self.view()
            .web_module(web_module)
            .map(WebModuleNode::servlet_list)
    }

    pub fn all_servlets(&self) -> Vec<WebModuleServlets> {
        self.view()
            .web_modules()
            .map(WebModuleNode::servlet_list)
            .collect()
    }
}
