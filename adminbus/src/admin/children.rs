//! Parent-side bookkeeping of child connections.

use serde::Serialize;

use crate::bridge::channel::Channel;
use crate::stats::types::INVALID_PROCESS_ID;

/// One child slot on the parent.
#[derive(Debug)]
pub struct ChildConn {
    pub channel: Option<Channel>,
    pub pid: i32,
    /// End-init handshake completed.
    pub initialized: bool,
    /// The stats layer claimed a process slot for this child.
    pub process_alive: bool,
    pub got_reconfig_ack: bool,
    pub web_modules_initialized: bool,
}

impl Default for ChildConn {
    fn default() -> Self {
        Self {
            channel: None,
            pid: INVALID_PROCESS_ID,
            initialized: false,
            process_alive: false,
            got_reconfig_ack: false,
            web_modules_initialized: false,
        }
    }
}

impl ChildConn {
    /// Forgets the connection; the channel is returned so the caller decides
    /// how to dispose of it.
    pub fn reset(&mut self) -> Option<Channel> {
        let channel = self.channel.take();
        *self = Self::default();
        channel
    }

    pub fn is_connected(&self) -> bool {
        self.initialized && self.channel.as_ref().is_some_and(Channel::is_alive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChildSummary {
    pub slot: usize,
    pub pid: i32,
    pub process_alive: bool,
    pub web_modules_initialized: bool,
}

/// Fixed table of `max_procs` child slots.
#[derive(Debug)]
pub struct ChildTable {
    slots: Vec<ChildConn>,
}

impl ChildTable {
    pub fn new(max_procs: usize) -> Self {
        Self {
            slots: (0..max_procs.max(1)).map(|_| ChildConn::default()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&ChildConn> {
        self.slots.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut ChildConn> {
        self.slots.get_mut(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildConn> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ChildConn> {
        self.slots.iter_mut()
    }

    /// Slots that completed end-init, in slot order.
    pub fn initialized_slots(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| self.slots[i].initialized)
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.slots.iter().filter(|c| c.initialized).count()
    }

    pub fn all_connected(&self) -> bool {
        self.connected_count() == self.slots.len()
    }

    /// Every child connected and known to the stats layer.
    pub fn all_ready(&self) -> bool {
        self.slots.iter().all(|c| c.initialized && c.process_alive)
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|c| !c.initialized)
    }

    pub fn slot_of(&self, pid: i32) -> Option<usize> {
        if pid == INVALID_PROCESS_ID {
            return None;
        }
        self.slots
            .iter()
            .position(|c| c.initialized && c.pid == pid)
    }

    pub fn summary(&self) -> Vec<ChildSummary> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, c)| c.initialized)
            .map(|(slot, c)| ChildSummary {
                slot,
                pid: c.pid,
                process_alive: c.process_alive,
                web_modules_initialized: c.web_modules_initialized,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(table: &mut ChildTable, pid: i32) -> usize {
        let slot = table.free_slot().unwrap();
        let conn = table.get_mut(slot).unwrap();
        conn.pid = pid;
        conn.initialized = true;
        slot
    }

    #[test]
    fn slots_fill_in_order_and_free_on_reset() {
        let mut table = ChildTable::new(2);
        assert_eq!(claim(&mut table, 10), 0);
        assert_eq!(claim(&mut table, 11), 1);
        assert!(table.all_connected());
        assert_eq!(table.free_slot(), None);
        assert_eq!(table.slot_of(11), Some(1));

        table.get_mut(0).unwrap().reset();
        assert_eq!(table.connected_count(), 1);
        assert_eq!(table.slot_of(10), None);
        assert_eq!(claim(&mut table, 12), 0);
    }

    #[test]
    fn ready_needs_stats_initialization() {
        let mut table = ChildTable::new(1);
        claim(&mut table, 10);
        assert!(!table.all_ready());
        table.get_mut(0).unwrap().process_alive = true;
        assert!(table.all_ready());
    }

    #[test]
    fn invalid_pid_never_matches() {
        let table = ChildTable::new(3);
        assert_eq!(table.slot_of(INVALID_PROCESS_ID), None);
        assert!(table.summary().is_empty());
    }
}
