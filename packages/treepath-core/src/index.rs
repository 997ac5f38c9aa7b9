//! In-memory assembly of a subtree from a flat result set.
//!
//! Nodes live in an arena addressed by [`NodeRef`]; parent and child links are indices, so a
//! loaded tree has a single owner and no reference cycles.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::Result;
use crate::ids::NodeKey;
use crate::node::Node;
use crate::path::PathCodec;
use crate::query::{Order, Predicate};
use crate::traits::RecordStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeRef(usize);

#[derive(Clone, Debug)]
struct Slot<K> {
    node: Node<K>,
    parent: Option<NodeRef>,
    children: Vec<NodeRef>,
}

/// Owner node plus every loaded descendant, linked parent to children in sibling order.
#[derive(Clone, Debug)]
pub struct TreeIndex<K> {
    codec: PathCodec,
    slots: Vec<Slot<K>>,
    by_id: HashMap<K, NodeRef>,
}

impl<K: NodeKey> TreeIndex<K> {
    pub fn new(owner: Node<K>, codec: PathCodec) -> Self {
        let mut by_id = HashMap::new();
        by_id.insert(owner.id.clone(), NodeRef(0));
        Self {
            codec,
            slots: vec![Slot {
                node: owner,
                parent: None,
                children: Vec::new(),
            }],
            by_id,
        }
    }

    /// Attaches `rows` below `owner` in ascending depth so parents always precede their
    /// children; within one depth the incoming order (e.g. by position) is preserved.
    ///
    /// Returns the index and the number of rows that could not be attached because none of
    /// their ancestors below the owner were present.
    pub fn build(owner: Node<K>, rows: Vec<Node<K>>, codec: PathCodec) -> Result<(Self, usize)> {
        let mut ranked = Vec::with_capacity(rows.len());
        for row in rows {
            if row.id == owner.id {
                continue;
            }
            ranked.push((codec.depth(&row.path)?, row));
        }
        ranked.sort_by_key(|(depth, _)| *depth);

        let mut index = Self::new(owner, codec);
        let mut dropped = 0;
        for (_, row) in ranked {
            let id = row.id.clone();
            if index.add_descendant(row)?.is_none() {
                warn!(%id, owner = %index.owner().id, "row has no loaded ancestor; dropped");
                dropped += 1;
            }
        }
        Ok((index, dropped))
    }

    pub fn root(&self) -> NodeRef {
        NodeRef(0)
    }

    pub fn owner(&self) -> &Node<K> {
        &self.slots[0].node
    }

    pub fn codec(&self) -> &PathCodec {
        &self.codec
    }

    /// Number of nodes, the owner included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.len() == 1
    }

    pub fn node(&self, at: NodeRef) -> &Node<K> {
        &self.slots[at.0].node
    }

    pub fn find(&self, id: &K) -> Option<NodeRef> {
        self.by_id.get(id).copied()
    }

    pub fn get(&self, id: &K) -> Option<&Node<K>> {
        self.find(id).map(|at| self.node(at))
    }

    pub fn parent(&self, at: NodeRef) -> Option<NodeRef> {
        self.slots[at.0].parent
    }

    pub fn child_refs(&self, at: NodeRef) -> &[NodeRef] {
        &self.slots[at.0].children
    }

    pub fn children(&self, at: NodeRef) -> impl Iterator<Item = &Node<K>> + '_ {
        self.slots[at.0].children.iter().map(|c| self.node(*c))
    }

    /// Attaches `node` as the last child of `parent`. Re-adding a known id replaces its row
    /// and keeps its loaded children, moving it under `parent` if needed.
    pub fn add_child(&mut self, parent: NodeRef, node: Node<K>) -> NodeRef {
        if let Some(existing) = self.find(&node.id) {
            if existing == self.root() {
                self.slots[0].node = node;
                return existing;
            }
            self.slots[existing.0].node = node;
            if self.slots[existing.0].parent != Some(parent) {
                if let Some(old) = self.slots[existing.0].parent {
                    self.slots[old.0].children.retain(|c| *c != existing);
                }
                self.slots[existing.0].parent = Some(parent);
                self.slots[parent.0].children.push(existing);
            }
            return existing;
        }
        let at = NodeRef(self.slots.len());
        self.by_id.insert(node.id.clone(), at);
        self.slots.push(Slot {
            node,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.slots[parent.0].children.push(at);
        at
    }

    /// Whether the node at `at` is an ancestor of `node` (its immediate parent when
    /// `closest_only`).
    pub fn is_parent_of(&self, at: NodeRef, node: &Node<K>, closest_only: bool) -> Result<bool> {
        self.codec
            .is_parent_of(&self.node(at).id, &node.path, closest_only)
    }

    /// Whether `node` is an ancestor of the node at `at`.
    pub fn is_child_of(&self, at: NodeRef, node: &Node<K>) -> Result<bool> {
        self.codec.is_parent_of(&node.id, &self.node(at).path, false)
    }

    /// The loaded child of `at` that lies on the ancestor chain of `node`.
    pub fn child_parent_of(&self, at: NodeRef, node: &Node<K>) -> Result<Option<NodeRef>> {
        let ancestors: Vec<K> = self.codec.parent_ids(&node.path)?;
        Ok(self
            .child_refs(at)
            .iter()
            .copied()
            .find(|c| ancestors.contains(&self.node(*c).id)))
    }

    /// Descends from the owner along `node`'s ancestry and attaches it under the deepest
    /// loaded ancestor that is its immediate parent. Returns `None` when the chain is broken.
    pub fn add_descendant(&mut self, node: Node<K>) -> Result<Option<NodeRef>> {
        let mut at = self.root();
        loop {
            if self.is_parent_of(at, &node, true)? {
                return Ok(Some(self.add_child(at, node)));
            }
            match self.child_parent_of(at, &node)? {
                Some(next) => at = next,
                None => return Ok(None),
            }
        }
    }

    /// Pre-order walk from the owner, yielding `(depth, node)` with the owner at depth 0.
    pub fn depth_first(&self) -> Vec<(usize, &Node<K>)> {
        let mut out = Vec::with_capacity(self.slots.len());
        let mut stack = vec![(0usize, self.root())];
        while let Some((depth, at)) = stack.pop() {
            out.push((depth, self.node(at)));
            for child in self.child_refs(at).iter().rev() {
                stack.push((depth + 1, *child));
            }
        }
        out
    }
}

/// Whether a view's subtree has been fetched.
#[derive(Clone, Debug)]
pub enum LoadState<K> {
    Unloaded,
    Loaded(TreeIndex<K>),
}

#[derive(Clone, Debug)]
pub struct LoadOptions<K> {
    /// Extra filter AND-ed with the subtree filter.
    pub filter: Option<Predicate<K>>,
    pub force_reload: bool,
}

impl<K> Default for LoadOptions<K> {
    fn default() -> Self {
        Self {
            filter: None,
            force_reload: false,
        }
    }
}

impl<K> LoadOptions<K> {
    pub fn forced() -> Self {
        Self {
            filter: None,
            force_reload: true,
        }
    }

    pub fn with_filter(mut self, filter: Predicate<K>) -> Self {
        self.filter = Some(filter);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Already loaded; nothing was queried.
    Cached,
    Loaded {
        fetched: usize,
        attached: usize,
        dropped: usize,
    },
}

/// A node together with the lazily loaded subtree below it.
#[derive(Clone, Debug)]
pub struct TreeView<K> {
    owner: Node<K>,
    state: LoadState<K>,
}

impl<K: NodeKey> TreeView<K> {
    pub fn new(owner: Node<K>) -> Self {
        Self {
            owner,
            state: LoadState::Unloaded,
        }
    }

    pub fn owner(&self) -> &Node<K> {
        &self.owner
    }

    pub fn state(&self) -> &LoadState<K> {
        &self.state
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, LoadState::Loaded(_))
    }

    pub fn index(&self) -> Option<&TreeIndex<K>> {
        match &self.state {
            LoadState::Loaded(index) => Some(index),
            LoadState::Unloaded => None,
        }
    }

    /// Direct children of the owner, `None` until loaded.
    pub fn children(&self) -> Option<Vec<&Node<K>>> {
        self.index().map(|index| index.children(index.root()).collect())
    }

    pub fn unload(&mut self) {
        self.state = LoadState::Unloaded;
    }

    /// Fetches every row whose path runs through the owner and assembles it. A no-op on an
    /// already loaded view unless `force_reload` is set.
    pub fn load<S>(
        &mut self,
        store: &S,
        codec: &PathCodec,
        order: Order,
        options: LoadOptions<K>,
    ) -> Result<LoadOutcome>
    where
        S: RecordStore<Key = K>,
    {
        if self.is_loaded() && !options.force_reload {
            return Ok(LoadOutcome::Cached);
        }

        let mut filter = Predicate::PathContains(codec.segment(&self.owner.id)?);
        if let Some(extra) = options.filter {
            filter = filter.and(extra);
        }
        let rows = store.find(&filter, order)?;
        let fetched = rows.len();
        let (index, dropped) = TreeIndex::build(self.owner.clone(), rows, codec.clone())?;
        let attached = index.len() - 1;
        debug!(owner = %self.owner.id, fetched, attached, dropped, "tree loaded");
        self.state = LoadState::Loaded(index);
        Ok(LoadOutcome::Loaded {
            fetched,
            attached,
            dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64, path: &str) -> Node<i64> {
        let codec = PathCodec::default();
        Node {
            id,
            parent_id: codec.closest_parent_id(path).unwrap(),
            path: path.to_string(),
            position: None,
        }
    }

    #[test]
    fn builds_nested_levels_regardless_of_input_order() {
        // parent ids deliberately not ascending with depth: 9 sits under 20
        let rows = vec![
            node(9, ".1.20.9."),
            node(30, ".1.20.9.30."),
            node(20, ".1.20."),
            node(2, ".1.2."),
        ];
        let (index, dropped) = TreeIndex::build(node(1, ".1."), rows, PathCodec::default()).unwrap();
        assert_eq!(dropped, 0);
        assert_eq!(index.len(), 5);
        let top: Vec<i64> = index.children(index.root()).map(|n| n.id).collect();
        assert_eq!(top, vec![20, 2]);
        let twenty = index.find(&20).unwrap();
        let nine = index.child_refs(twenty)[0];
        assert_eq!(index.node(nine).id, 9);
        assert_eq!(index.parent(nine), Some(twenty));
        assert_eq!(index.children(nine).map(|n| n.id).collect::<Vec<_>>(), vec![30]);
    }

    #[test]
    fn drops_rows_with_missing_ancestors() {
        let rows = vec![node(2, ".1.2."), node(4, ".1.3.4.")];
        let (index, dropped) = TreeIndex::build(node(1, ".1."), rows, PathCodec::default()).unwrap();
        assert_eq!(dropped, 1);
        assert!(index.get(&4).is_none());
    }

    #[test]
    fn add_child_is_idempotent() {
        let mut index = TreeIndex::new(node(1, ".1."), PathCodec::default());
        let root = index.root();
        let a = index.add_child(root, node(2, ".1.2."));
        let mut updated = node(2, ".1.2.");
        updated.position = Some(4);
        let b = index.add_child(root, updated);
        assert_eq!(a, b);
        assert_eq!(index.child_refs(root).len(), 1);
        assert_eq!(index.node(a).position, Some(4));
    }

    #[test]
    fn parent_and_child_relations() {
        let mut index = TreeIndex::new(node(1, ".1."), PathCodec::default());
        let two = index.add_descendant(node(2, ".1.2.")).unwrap().unwrap();
        let deep = node(3, ".1.2.3.");
        assert!(index.is_parent_of(two, &deep, true).unwrap());
        assert!(!index.is_parent_of(index.root(), &deep, true).unwrap());
        assert!(index.is_parent_of(index.root(), &deep, false).unwrap());
        assert!(index.is_child_of(two, index.owner()).unwrap());
        assert_eq!(index.child_parent_of(index.root(), &deep).unwrap(), Some(two));
    }

    #[test]
    fn depth_first_is_preorder() {
        let rows = vec![node(2, ".1.2."), node(3, ".1.3."), node(4, ".1.2.4.")];
        let (index, _) = TreeIndex::build(node(1, ".1."), rows, PathCodec::default()).unwrap();
        let walk: Vec<(usize, i64)> = index.depth_first().into_iter().map(|(d, n)| (d, n.id)).collect();
        assert_eq!(walk, vec![(0, 1), (1, 2), (2, 4), (1, 3)]);
    }
}
