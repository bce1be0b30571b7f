//! Id-keyed node lists with soft delete.
//!
//! A node marked empty stays in its list so a later lookup by id can
//! reactivate it with its counters intact; `prune_empty` drops what was not
//! reactivated.

use serde::Serialize;

/// A statistics node identified by a string id and carrying a mode.
pub trait StoreNode {
    fn key(&self) -> &str;
    fn is_empty_node(&self) -> bool;
    fn mark_empty(&mut self);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct NodeList<T> {
    nodes: Vec<T>,
}

impl<T> Default for NodeList<T> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<T: StoreNode> NodeList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.nodes.iter_mut()
    }

    /// Nodes not marked empty.
    pub fn live(&self) -> impl Iterator<Item = &T> {
        self.nodes.iter().filter(|n| !n.is_empty_node())
    }

    pub fn keys(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.key().to_owned()).collect()
    }

    pub fn position(&self, key: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.key() == key)
    }

    /// Finds by id, including nodes marked empty.
    pub fn find(&self, key: &str) -> Option<&T> {
        self.nodes.iter().find(|n| n.key() == key)
    }

    pub fn find_mut(&mut self, key: &str) -> Option<&mut T> {
        self.nodes.iter_mut().find(|n| n.key() == key)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.nodes.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.nodes.get_mut(index)
    }

    /// Returns the node for `key`, appending `make()` if there is none.
    pub fn get_or_append(&mut self, key: &str, make: impl FnOnce() -> T) -> &mut T {
        let index = match self.position(key) {
            Some(i) => i,
            None => {
                self.nodes.push(make());
                self.nodes.len() - 1
            }
        };
        &mut self.nodes[index]
    }

    pub fn mark_all_empty(&mut self) {
        for node in &mut self.nodes {
            node.mark_empty();
        }
    }

    /// Removes nodes still marked empty, returning how many went away.
    pub fn prune_empty(&mut self) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|n| !n.is_empty_node());
        before - self.nodes.len()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

impl<'a, T> IntoIterator for &'a NodeList<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Node {
        id: String,
        live: bool,
        hits: u32,
    }

    impl Node {
        fn new(id: &str) -> Self {
            Self {
                id: id.into(),
                live: true,
                hits: 0,
            }
        }
    }

    impl StoreNode for Node {
        fn key(&self) -> &str {
            &self.id
        }

        fn is_empty_node(&self) -> bool {
            !self.live
        }

        fn mark_empty(&mut self) {
            self.live = false;
        }
    }

    #[test]
    fn get_or_append_reuses_existing_nodes() {
        let mut list = NodeList::new();
        list.get_or_append("a", || Node::new("a")).hits = 5;
        list.get_or_append("b", || Node::new("b"));
        let a = list.get_or_append("a", || Node::new("a"));
        assert_eq!(a.hits, 5);
        assert_eq!(list.keys(), vec!["a", "b"]);
    }

    #[test]
    fn mark_then_prune_keeps_reactivated_nodes() {
        let mut list = NodeList::new();
        for id in ["a", "b", "c"] {
            list.get_or_append(id, || Node::new(id)).hits = 1;
        }
        list.mark_all_empty();
        assert_eq!(list.live().count(), 0);
        assert_eq!(list.len(), 3);

        list.find_mut("b").unwrap().live = true;
        assert_eq!(list.prune_empty(), 2);
        assert_eq!(list.keys(), vec!["b"]);
        assert_eq!(list.find("b").unwrap().hits, 1);
    }

    #[test]
    fn removing_the_head_leaves_a_valid_list() {
        let mut list = NodeList::new();
        for id in ["a", "b"] {
            list.get_or_append(id, || Node::new(id));
        }
        list.find_mut("a").unwrap().mark_empty();
        list.prune_empty();
        assert_eq!(list.get(0).map(|n| n.id.as_str()), Some("b"));
        assert_eq!(list.position("b"), Some(0));
    }
}
