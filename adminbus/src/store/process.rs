//! Per-process mirror of one child.

use serde::Serialize;

use super::nodes::{NodeList, StoreNode};
use crate::stats::types::{
    ConnectionQueueSlot, INVALID_PROCESS_ID, JdbcPoolInfo, JvmInfo, ListenSlot, NodeState,
    ProcessInfo, ProcessMode, ProcessSlot, SessionReplicationInfo, ThreadInfo, ThreadMode,
    ThreadPoolBucket,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessNode {
    pub slot: ProcessSlot,
    pub connection_queues: Vec<ConnectionQueueSlot>,
    pub thread_pools: Vec<ThreadPoolBucket>,
    pub listen_slots: Vec<ListenSlot>,
    pub threads: Vec<ThreadInfo>,
    pub jdbc_pools: NodeList<JdbcPoolInfo>,
    pub jvm: Option<JvmInfo>,
    pub session_replication: Option<SessionReplicationInfo>,
}

impl Default for ProcessNode {
    fn default() -> Self {
        Self {
            slot: ProcessSlot {
                pid: INVALID_PROCESS_ID,
                ..Default::default()
            },
            connection_queues: Vec::new(),
            thread_pools: Vec::new(),
            listen_slots: Vec::new(),
            threads: Vec::new(),
            jdbc_pools: NodeList::new(),
            jvm: None,
            session_replication: None,
        }
    }
}

impl ProcessNode {
    pub fn pid(&self) -> i32 {
        self.slot.pid
    }

    pub fn is_active(&self) -> bool {
        self.slot.mode == ProcessMode::Active && self.slot.pid != INVALID_PROCESS_ID
    }

    /// A child that died and whose slot nobody claimed yet.
    pub fn is_died(&self) -> bool {
        self.slot.mode == ProcessMode::Empty && self.slot.pid != INVALID_PROCESS_ID
    }

    pub fn apply(&mut self, info: &ProcessInfo) {
        self.slot = info.slot.clone();
        self.connection_queues.clone_from(&info.connection_queues);
        self.thread_pools.clone_from(&info.thread_pools);
    }

    pub fn to_info(&self) -> ProcessInfo {
        ProcessInfo {
            slot: self.slot.clone(),
            connection_queues: self.connection_queues.clone(),
            thread_pools: self.thread_pools.clone(),
        }
    }

    /// Grows the thread table to `count` entries and marks all of them empty.
    pub fn reset_threads(&mut self, count: usize) {
        if self.threads.len() < count {
            self.threads.resize_with(count, ThreadInfo::default);
        }
        for thread in &mut self.threads {
            thread.slot.mode = ThreadMode::Empty;
        }
    }

    pub fn set_listen_slots(&mut self, slots: &[ListenSlot]) {
        self.listen_slots.truncate(slots.len());
        for (index, slot) in slots.iter().enumerate() {
            match self.listen_slots.get_mut(index) {
                Some(existing) => existing.clone_from(slot),
                None => self.listen_slots.push(slot.clone()),
            }
        }
    }

    /// Pools are never removed, only added or refreshed.
    pub fn update_jdbc_pools(&mut self, pools: &[JdbcPoolInfo]) {
        for pool in pools {
            let node = self.jdbc_pools.get_or_append(&pool.name, || JdbcPoolInfo {
                name: pool.name.clone(),
                ..Default::default()
            });
            node.slot = pool.slot.clone();
        }
    }

    /// The vm identity strings are recorded once.
    pub fn update_jvm(&mut self, info: &JvmInfo) {
        match &mut self.jvm {
            Some(jvm) => jvm.slot = info.slot.clone(),
            None => self.jvm = Some(info.clone()),
        }
    }

    pub fn update_session_replication(&mut self, incoming: &SessionReplicationInfo) {
        let target = self
            .session_replication
            .get_or_insert_with(SessionReplicationInfo::default);
        target.slot = incoming.slot.clone();
        target.cluster_members.clone_from(&incoming.cluster_members);
        target
            .current_backup_instance_id
            .clone_from(&incoming.current_backup_instance_id);
        target.state.clone_from(&incoming.state);

        for instance in &mut target.instances {
            instance.mode = NodeState::Invalid;
        }
        for reported in &incoming.instances {
            let index = match target
                .instances
                .iter()
                .position(|i| i.instance_id == reported.instance_id)
            {
                Some(index) => index,
                None => {
                    target.instances.push(Default::default());
                    target.instances.len() - 1
                }
            };
            let instance = &mut target.instances[index];
            instance.mode = NodeState::Active;
            instance.instance_id.clone_from(&reported.instance_id);

            for store in &mut instance.stores {
                store.mode = NodeState::Invalid;
            }
            for reported_store in &reported.stores {
                match instance
                    .stores
                    .iter_mut()
                    .find(|s| s.store_id == reported_store.store_id)
                {
                    Some(store) => {
                        store.clone_from(reported_store);
                        store.mode = NodeState::Active;
                    }
                    None => {
                        let mut store = reported_store.clone();
                        store.mode = NodeState::Active;
                        instance.stores.push(store);
                    }
                }
            }
            instance.stores.retain(|s| s.mode == NodeState::Active);
        }
        target.instances.retain(|i| i.mode == NodeState::Active);
    }
}

impl StoreNode for JdbcPoolInfo {
    fn key(&self) -> &str {
        &self.name
    }

    fn is_empty_node(&self) -> bool {
        false
    }

    fn mark_empty(&mut self) {}
}
