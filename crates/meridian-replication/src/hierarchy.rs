//! Parent/child ownership tree stored in a generational arena.
//!
//! Nodes refer to each other by [`NodeId`] rather than by pointer, so
//! reparenting is O(children of the old parent) and there are no ownership
//! cycles. Every node hangs, directly or through ancestors, under one of
//! three fixed [`Root`]s.
//!
//! Creating a cycle (parenting a node under its own descendant) is a caller
//! error and is not checked.

use std::collections::VecDeque;

/// Handle to a node. Stale handles (to removed nodes) never alias a newer
/// node thanks to the generation counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// The three fixed top-level collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Root {
    /// Considered for loading on clients.
    Active,
    /// Remembered but never loaded (e.g. logged-out players).
    Inactive,
    /// Torn down, waiting to be forgotten.
    Deleted,
}

impl Root {
    const ALL: [Root; 3] = [Root::Active, Root::Inactive, Root::Deleted];

    fn slot(self) -> usize {
        match self {
            Root::Active => 0,
            Root::Inactive => 1,
            Root::Deleted => 2,
        }
    }
}

/// Where a node hangs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parent {
    Root(Root),
    Node(NodeId),
}

#[derive(Debug)]
struct Node<T> {
    value: T,
    parent: Parent,
    children: Vec<NodeId>,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

/// Arena-backed tree with three fixed roots.
#[derive(Debug)]
pub struct Hierarchy<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    roots: [Vec<NodeId>; 3],
    len: usize,
}

impl<T> Default for Hierarchy<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            roots: [Vec::new(), Vec::new(), Vec::new()],
            len: 0,
        }
    }
}

impl<T> Hierarchy<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value under `parent`, which must be live.
    pub fn insert(&mut self, value: T, parent: Parent) -> NodeId {
        let node = Node {
            value,
            parent,
            children: Vec::new(),
        };
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.attach(id, parent);
        self.len += 1;
        id
    }

    fn node(&self, id: NodeId) -> Option<&Node<T>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node<T>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.node(id).map(|n| &n.value)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.node_mut(id).map(|n| &mut n.value)
    }

    pub fn parent(&self, id: NodeId) -> Option<Parent> {
        self.node(id).map(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map_or(&[], |n| n.children.as_slice())
    }

    /// Nodes hanging directly under `root`, in attachment order.
    pub fn root_children(&self, root: Root) -> &[NodeId] {
        &self.roots[root.slot()]
    }

    /// The root this node ultimately hangs under.
    pub fn root_of(&self, id: NodeId) -> Option<Root> {
        let mut current = id;
        loop {
            match self.node(current)?.parent {
                Parent::Root(root) => return Some(root),
                Parent::Node(parent) => current = parent,
            }
        }
    }

    fn attach(&mut self, id: NodeId, parent: Parent) {
        match parent {
            Parent::Root(root) => self.roots[root.slot()].push(id),
            Parent::Node(parent) => {
                if let Some(p) = self.node_mut(parent) {
                    p.children.push(id);
                }
            }
        }
    }

    fn detach(&mut self, id: NodeId, parent: Parent) {
        let siblings = match parent {
            Parent::Root(root) => Some(&mut self.roots[root.slot()]),
            Parent::Node(parent) => self.node_mut(parent).map(|p| &mut p.children),
        };
        if let Some(siblings) = siblings
            && let Some(pos) = siblings.iter().position(|&c| c == id)
        {
            siblings.remove(pos);
        }
    }

    /// Move a node (and implicitly its subtree) under a new parent.
    ///
    /// Returns `false` if the node does not exist.
    pub fn set_parent(&mut self, id: NodeId, parent: Parent) -> bool {
        let Some(old) = self.parent(id) else {
            return false;
        };
        if old == parent {
            return true;
        }
        self.detach(id, old);
        if let Some(node) = self.node_mut(id) {
            node.parent = parent;
        }
        self.attach(id, parent);
        true
    }

    /// The node followed by all its descendants, breadth first.
    ///
    /// A snapshot: later mutation of the tree does not affect it.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        if !self.contains(id) {
            return out;
        }
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            queue.extend(self.children(current).iter().copied());
            out.push(current);
        }
        out
    }

    /// Every node under `root`, breadth first across its top-level nodes.
    pub fn walk_root(&self, root: Root) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut queue: VecDeque<NodeId> = self.root_children(root).iter().copied().collect();
        while let Some(current) = queue.pop_front() {
            queue.extend(self.children(current).iter().copied());
            out.push(current);
        }
        out
    }

    /// Remove a node and its whole subtree, returning the removed values in
    /// breadth-first order.
    pub fn remove_subtree(&mut self, id: NodeId) -> Vec<T> {
        let Some(parent) = self.parent(id) else {
            return Vec::new();
        };
        self.detach(id, parent);

        let mut removed = Vec::new();
        for node_id in self.descendants(id) {
            let slot = &mut self.slots[node_id.index as usize];
            if let Some(node) = slot.node.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(node_id.index);
                self.len -= 1;
                removed.push(node.value);
            }
        }
        removed
    }

    /// Number of nodes under each root, in `Active, Inactive, Deleted` order.
    pub fn root_counts(&self) -> [usize; 3] {
        Root::ALL.map(|root| self.walk_root(root).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_attaches_to_parent() {
        let mut tree = Hierarchy::new();
        let a = tree.insert("a", Parent::Root(Root::Active));
        let b = tree.insert("b", Parent::Node(a));

        assert_eq!(tree.root_children(Root::Active), &[a]);
        assert_eq!(tree.children(a), &[b]);
        assert_eq!(tree.parent(b), Some(Parent::Node(a)));
        assert_eq!(tree.root_of(b), Some(Root::Active));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_set_parent_moves_between_child_sets() {
        let mut tree = Hierarchy::new();
        let a = tree.insert(1, Parent::Root(Root::Active));
        let b = tree.insert(2, Parent::Root(Root::Active));
        let c = tree.insert(3, Parent::Node(a));

        assert!(tree.set_parent(c, Parent::Node(b)));
        assert!(tree.children(a).is_empty());
        assert_eq!(tree.children(b), &[c]);

        assert!(tree.set_parent(b, Parent::Root(Root::Inactive)));
        assert_eq!(tree.root_children(Root::Active), &[a]);
        assert_eq!(tree.root_children(Root::Inactive), &[b]);
        // children follow implicitly
        assert_eq!(tree.root_of(c), Some(Root::Inactive));
    }

    #[test]
    fn test_descendants_are_breadth_first() {
        let mut tree = Hierarchy::new();
        let root = tree.insert("r", Parent::Root(Root::Active));
        let a = tree.insert("a", Parent::Node(root));
        let b = tree.insert("b", Parent::Node(root));
        let a1 = tree.insert("a1", Parent::Node(a));
        let b1 = tree.insert("b1", Parent::Node(b));

        assert_eq!(tree.descendants(root), vec![root, a, b, a1, b1]);
        assert_eq!(tree.descendants(b), vec![b, b1]);
    }

    #[test]
    fn test_removed_handles_go_stale() {
        let mut tree = Hierarchy::new();
        let a = tree.insert("a", Parent::Root(Root::Deleted));
        let child = tree.insert("child", Parent::Node(a));

        assert_eq!(tree.remove_subtree(a), vec!["a", "child"]);
        assert!(!tree.contains(a));
        assert!(!tree.contains(child));
        assert!(tree.root_children(Root::Deleted).is_empty());
        assert!(tree.is_empty());

        // slot reuse must not resurrect the old handle
        let b = tree.insert("b", Parent::Root(Root::Active));
        assert_ne!(a, b);
        assert_eq!(tree.get(a), None);
        assert_eq!(tree.get(b), Some(&"b"));
    }

    #[test]
    fn test_walk_root_and_counts() {
        let mut tree = Hierarchy::new();
        let a = tree.insert(0, Parent::Root(Root::Active));
        tree.insert(1, Parent::Node(a));
        tree.insert(2, Parent::Root(Root::Inactive));

        assert_eq!(tree.walk_root(Root::Active).len(), 2);
        assert_eq!(tree.root_counts(), [2, 1, 0]);
    }
}
