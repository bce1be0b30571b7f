//! Virtual server, web module and servlet nodes.

use serde::Serialize;

use super::nodes::{NodeList, StoreNode};
use crate::stats::types::{
    AccumulatedVsSlot, ProfileBucket, ServletInfo, ServletSlot, VirtualServerInfo,
    VirtualServerSlot, VsMode, WebModuleCacheSlot, WebModuleInfo, WebModuleMode, WebModuleServlets,
    WebModuleSlot,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VsNode {
    pub slot: VirtualServerSlot,
    pub hostnames: String,
    pub interfaces: String,
    pub profiles: Vec<ProfileBucket>,
    pub web_modules: NodeList<WebModuleNode>,
}

impl VsNode {
    pub fn new(id: &str) -> Self {
        Self {
            slot: VirtualServerSlot {
                mode: VsMode::Active,
                id: id.to_owned(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn id(&self) -> &str {
        &self.slot.id
    }

    /// Same id and web modules, zeroed counters.
    pub fn fresh_like(&self) -> Self {
        let mut fresh = Self::new(self.id());
        fresh.slot.mode = self.slot.mode;
        fresh.profiles = vec![ProfileBucket::default(); self.profiles.len()];
        for wm in &self.web_modules {
            let mut node = WebModuleNode::new(&wm.name);
            node.slot.mode = wm.slot.mode;
            fresh.web_modules.get_or_append(&wm.name, || node);
        }
        fresh
    }

    /// Replaces the data a child reports for this server, keeping web modules.
    pub fn apply(&mut self, info: &VirtualServerInfo) {
        self.slot = info.slot.clone();
        self.hostnames.clone_from(&info.hostnames);
        self.interfaces.clone_from(&info.interfaces);
        self.profiles.clone_from(&info.profiles);
    }

    pub fn to_info(&self) -> VirtualServerInfo {
        VirtualServerInfo {
            slot: self.slot.clone(),
            hostnames: self.hostnames.clone(),
            interfaces: self.interfaces.clone(),
            profiles: self.profiles.clone(),
        }
    }
}

impl StoreNode for VsNode {
    fn key(&self) -> &str {
        &self.slot.id
    }

    fn is_empty_node(&self) -> bool {
        self.slot.mode == VsMode::Empty
    }

    fn mark_empty(&mut self) {
        self.slot.mode = VsMode::Empty;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WebModuleNode {
    pub name: String,
    pub slot: WebModuleSlot,
    pub cache: WebModuleCacheSlot,
    pub servlets: NodeList<ServletInfo>,
}

impl WebModuleNode {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            slot: WebModuleSlot {
                mode: WebModuleMode::Enabled,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn to_info(&self) -> WebModuleInfo {
        WebModuleInfo {
            name: self.name.clone(),
            slot: self.slot.clone(),
            cache: self.cache.clone(),
        }
    }

    pub fn servlet_list(&self) -> WebModuleServlets {
        WebModuleServlets {
            web_module: self.name.clone(),
            servlets: self.servlets.iter().cloned().collect(),
        }
    }

    pub fn servlet_mut(&mut self, name: &str) -> &mut ServletSlot {
        &mut self
            .servlets
            .get_or_append(name, || ServletInfo {
                name: name.to_owned(),
                slot: ServletSlot::default(),
            })
            .slot
    }
}

impl StoreNode for WebModuleNode {
    fn key(&self) -> &str {
        &self.name
    }

    fn is_empty_node(&self) -> bool {
        self.slot.mode == WebModuleMode::Empty
    }

    fn mark_empty(&mut self) {
        self.slot.mode = WebModuleMode::Empty;
    }
}

// Servlets live as long as their web module.
impl StoreNode for ServletInfo {
    fn key(&self) -> &str {
        &self.name
    }

    fn is_empty_node(&self) -> bool {
        false
    }

    fn mark_empty(&mut self) {}
}

/// Virtual server data as seen by one child, or the consolidated view.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VsMirror {
    pub servers: NodeList<VsNode>,
    /// Totals over all virtual servers of the process.
    pub accumulated: AccumulatedVsSlot,
}

impl VsMirror {
    /// Reconciles the server list with `ids`, keeping counters of servers
    /// that survive.
    pub fn init_servers(&mut self, ids: &[String]) {
        for id in ids {
            let node = self.servers.get_or_append(id, || VsNode::new(id));
            node.slot.mode = VsMode::Active;
        }
        self.servers.prune_empty();
    }

    pub fn mark_all_empty(&mut self) {
        for vs in self.servers.iter_mut() {
            vs.mark_empty();
            vs.web_modules.mark_all_empty();
        }
    }

    /// Enables `name` under its virtual server; `false` when the server is
    /// unknown.
    pub fn enable_web_module(&mut self, vs_id: &str, name: &str) -> bool {
        let Some(vs) = self.servers.find_mut(vs_id) else {
            return false;
        };
        let wm = vs.web_modules.get_or_append(name, || WebModuleNode::new(name));
        wm.slot.mode = WebModuleMode::Enabled;
        true
    }

    pub fn prune_web_modules(&mut self) {
        for vs in self.servers.iter_mut() {
            vs.web_modules.prune_empty();
        }
    }

    pub fn web_module(&self, name: &str) -> Option<&WebModuleNode> {
        self.servers.iter().find_map(|vs| vs.web_modules.find(name))
    }

    pub fn web_module_mut(&mut self, name: &str) -> Option<&mut WebModuleNode> {
        self.servers
            .iter_mut()
            .find_map(|vs| vs.web_modules.find_mut(name))
    }

    pub fn web_modules(&self) -> impl Iterator<Item = &WebModuleNode> {
        self.servers.iter().flat_map(|vs| vs.web_modules.iter())
    }

    /// Structure only, for a slot whose previous owner died.
    pub fn fresh_like(&self) -> Self {
        let mut fresh = Self::default();
        for vs in &self.servers {
            let node = vs.fresh_like();
            fresh.servers.get_or_append(vs.id(), || node);
        }
        fresh
    }
}
