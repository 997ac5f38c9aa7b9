use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::config::{PathRefresh, TreeConfig};
use crate::error::{Error, Result};
use crate::index::{LoadOptions, LoadOutcome, TreeView};
use crate::maintainer::PathMaintainer;
use crate::node::{NewNode, Node};
use crate::path::PathCodec;
use crate::position::PositionManager;
use crate::query::{Field, Order, Predicate};
use crate::traits::RecordStore;

type Key<S> = <S as RecordStore>::Key;

/// Tree facade that wires a record store to path and position maintenance.
///
/// Every mutating call runs inside one store transaction, so the parent-path read and the
/// writes derived from it commit or roll back together.
pub struct Tree<S: RecordStore> {
    store: S,
    config: TreeConfig,
    hooks: Hooks,
}

#[derive(Clone, Debug)]
struct Hooks {
    maintainer: PathMaintainer,
    positions: Option<PositionManager>,
}

impl<S: RecordStore> Tree<S> {
    pub fn new(store: S, config: TreeConfig) -> Result<Self> {
        config.validate()?;
        let codec = PathCodec::new(config.delimiter.clone())?;
        let positions = if config.has_positions() {
            Some(PositionManager::from_config(&config)?)
        } else {
            None
        };
        Ok(Self {
            store,
            hooks: Hooks {
                maintainer: PathMaintainer::new(codec, config.path_refresh),
                positions,
            },
            config,
        })
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn codec(&self) -> &PathCodec {
        self.hooks.maintainer.codec()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    fn order(&self) -> Order {
        if self.hooks.positions.is_some() {
            Order::ByPosition
        } else {
            Order::Unordered
        }
    }

    /// Inserts a row and stores its path. With positions configured, an explicit position makes
    /// room among the new siblings and a missing one appends.
    pub fn insert(&mut self, node: NewNode<Key<S>>) -> Result<Node<Key<S>>> {
        let hooks = &self.hooks;
        self.store.transaction(|store| hooks.insert(store, node))
    }

    pub fn get(&self, id: &Key<S>) -> Result<Option<Node<Key<S>>>> {
        self.store.find_one(id)
    }

    fn require(&self, id: &Key<S>) -> Result<Node<Key<S>>> {
        self.store
            .find_one(id)?
            .ok_or_else(|| Error::NotFound(format!("row {id}")))
    }

    /// Persists parent and position changes carried by `node`, recomputing paths as the
    /// configured [`PathRefresh`] policy requires.
    pub fn update(&mut self, node: Node<Key<S>>) -> Result<Node<Key<S>>> {
        let hooks = &self.hooks;
        self.store.transaction(|store| hooks.update(store, node, None))
    }

    /// Moves `id` (and its subtree) under `new_parent`. See [`Tree::move_to`].
    pub fn reparent(&mut self, id: &Key<S>, new_parent: Option<Key<S>>) -> Result<Node<Key<S>>> {
        self.move_to(id, new_parent, None)
    }

    /// Moves `id` under `new_parent` at `position`. With `None` the node is appended to a new
    /// sibling group, or keeps its place when `new_parent` is its current parent.
    pub fn move_to(
        &mut self,
        id: &Key<S>,
        new_parent: Option<Key<S>>,
        position: Option<i64>,
    ) -> Result<Node<Key<S>>> {
        let hooks = &self.hooks;
        self.store.transaction(|store| {
            let mut node = store
                .find_one_for_update(id)?
                .ok_or_else(|| Error::NotFound(format!("row {id}")))?;
            node.parent_id = new_parent;
            hooks.update(store, node, Some(position))
        })
    }

    /// Recomputes the path of `id` from its parent's current row regardless of policy.
    pub fn refresh_path(&mut self, id: &Key<S>) -> Result<Node<Key<S>>> {
        let maintainer = PathMaintainer::new(self.codec().clone(), PathRefresh::Always);
        self.store.transaction(|store| {
            let previous = store
                .find_one_for_update(id)?
                .ok_or_else(|| Error::NotFound(format!("row {id}")))?;
            let mut node = previous.clone();
            maintainer.before_update(store, &previous, &mut node)?;
            Ok(node)
        })
    }

    /// See [`PositionManager::set_position`].
    pub fn set_position(
        &mut self,
        id: &Key<S>,
        position: Option<i64>,
        run_validation: bool,
    ) -> Result<Node<Key<S>>> {
        let positions = self.hooks.positions()?;
        self.store.transaction(|store| {
            let mut owner = store
                .find_one_for_update(id)?
                .ok_or_else(|| Error::NotFound(format!("row {id}")))?;
            positions.set_position(store, &mut owner, position, run_validation)?;
            Ok(owner)
        })
    }

    /// Deletes `id` and its whole subtree, closing the position gap it leaves. Returns the
    /// number of rows removed.
    pub fn delete(&mut self, id: &Key<S>) -> Result<usize> {
        let hooks = &self.hooks;
        self.store.transaction(|store| {
            let node = store
                .find_one_for_update(id)?
                .ok_or_else(|| Error::NotFound(format!("row {id}")))?;
            if let (Some(positions), Some(from)) = (&hooks.positions, node.position) {
                positions.close_gap(store, node.parent_id.as_ref(), from)?;
            }
            hooks.maintainer.after_delete(store, &node)
        })
    }

    pub fn load_tree(
        &self,
        view: &mut TreeView<Key<S>>,
        options: LoadOptions<Key<S>>,
    ) -> Result<LoadOutcome> {
        view.load(&self.store, self.codec(), self.order(), options)
    }

    /// Loaded view of the subtree under `id`.
    pub fn view(&self, id: &Key<S>) -> Result<TreeView<Key<S>>> {
        let mut view = TreeView::new(self.require(id)?);
        self.load_tree(&mut view, LoadOptions::default())?;
        Ok(view)
    }

    pub fn children(&self, id: &Key<S>) -> Result<Vec<Node<Key<S>>>> {
        let view = self.view(id)?;
        Ok(view
            .children()
            .unwrap_or_default()
            .into_iter()
            .cloned()
            .collect())
    }

    /// Every loaded descendant of `id` in pre-order.
    pub fn descendants(&self, id: &Key<S>) -> Result<Vec<Node<Key<S>>>> {
        let view = self.view(id)?;
        Ok(view
            .index()
            .map(|index| {
                index
                    .depth_first()
                    .into_iter()
                    .skip(1)
                    .map(|(_, n)| n.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn roots(&self) -> Result<Vec<Node<Key<S>>>> {
        self.store.find(&Predicate::ParentIs(None), self.order())
    }

    /// Row of the closest ancestor recorded in the path of `id`.
    pub fn parent(&self, id: &Key<S>) -> Result<Option<Node<Key<S>>>> {
        let node = self.require(id)?;
        match self.codec().closest_parent_id::<Key<S>>(&node.path)? {
            Some(parent) => self.store.find_one(&parent),
            None => Ok(None),
        }
    }

    /// Ancestor rows of `id`, root first.
    pub fn ancestors(&self, id: &Key<S>) -> Result<Vec<Node<Key<S>>>> {
        let node = self.require(id)?;
        let ids: Vec<Key<S>> = self.codec().parent_ids(&node.path)?;
        ids.iter()
            .map(|ancestor| {
                self.store.find_one(ancestor)?.ok_or_else(|| {
                    Error::InconsistentState(format!("ancestor {ancestor} of {id} is missing"))
                })
            })
            .collect()
    }

    pub fn parent_ids(&self, node: &Node<Key<S>>) -> Result<Vec<Key<S>>> {
        self.codec().parent_ids(&node.path)
    }

    pub fn is_parent_of(
        &self,
        parent: &Node<Key<S>>,
        node: &Node<Key<S>>,
        closest_only: bool,
    ) -> Result<bool> {
        self.codec().is_parent_of(&parent.id, &node.path, closest_only)
    }

    pub fn is_child_of(&self, node: &Node<Key<S>>, parent: &Node<Key<S>>) -> Result<bool> {
        self.is_parent_of(parent, node, false)
    }

    /// Checks every stored path against its parent row and that positions are unique within
    /// each sibling group. Intended for tests and debugging.
    pub fn validate_invariants(&self) -> Result<()> {
        let codec = self.codec();
        let rows = self.store.find(&Predicate::All, Order::Unordered)?;
        let by_id: HashMap<&Key<S>, &Node<Key<S>>> = rows.iter().map(|n| (&n.id, n)).collect();
        let mut taken: HashMap<Option<&Key<S>>, HashSet<i64>> = HashMap::new();

        for row in &rows {
            let own: Key<S> = codec.self_id(&row.path)?;
            if own != row.id {
                return Err(Error::InconsistentState(format!(
                    "path {} of row {} ends with {own}",
                    row.path, row.id
                )));
            }
            let expected = match row.parent_id.as_ref().and_then(|p| by_id.get(p)) {
                Some(parent) => codec.encode(&parent.path, &row.id)?,
                None => codec.segment(&row.id)?,
            };
            if row.path != expected {
                return Err(Error::InconsistentState(format!(
                    "row {} has path {} but its parent implies {expected}",
                    row.id, row.path
                )));
            }
            if let Some(position) = row.position {
                if !taken.entry(row.parent_id.as_ref()).or_default().insert(position) {
                    return Err(Error::InconsistentState(format!(
                        "position {position} is used twice among siblings of row {}",
                        row.id
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Hooks {
    fn positions(&self) -> Result<&PositionManager> {
        self.positions
            .as_ref()
            .ok_or_else(|| Error::MissingAttribute("position attribute is not configured".into()))
    }

    fn check_position(&self, position: Option<i64>) -> Result<()> {
        match position {
            Some(p) if self.positions.is_none() => Err(Error::MissingAttribute(format!(
                "position {p} requested but no position attribute is configured"
            ))),
            Some(p) => PositionManager::check_target(p),
            None => Ok(()),
        }
    }

    fn insert<S: RecordStore>(&self, store: &mut S, mut new: NewNode<S::Key>) -> Result<Node<S::Key>> {
        self.check_position(new.position)?;
        if new.id.is_some() && new.id == new.parent_id {
            return Err(Error::InvalidOperation("node cannot be its own parent".into()));
        }
        if let Some(positions) = &self.positions {
            let parent = new.parent_id.as_ref();
            new.position = Some(match new.position {
                Some(at) => {
                    positions.make_room(store, parent, at)?;
                    at
                }
                None => positions.next_position(store, parent)?,
            });
        }
        let id = store.insert(new)?;
        let mut node = store
            .find_one(&id)?
            .ok_or_else(|| Error::InconsistentState(format!("inserted row {id} not found")))?;
        self.maintainer.after_insert(store, &mut node)?;
        debug!(id = %node.id, path = %node.path, position = ?node.position, "node inserted");
        Ok(node)
    }

    /// `position`: `None` keeps the position carried by `pending` (a differing value is a
    /// request); `Some(target)` is an explicit move target where `Some(None)` means append.
    fn update<S: RecordStore>(
        &self,
        store: &mut S,
        pending: Node<S::Key>,
        position: Option<Option<i64>>,
    ) -> Result<Node<S::Key>> {
        let previous = store
            .find_one_for_update(&pending.id)?
            .ok_or_else(|| Error::NotFound(format!("row {}", pending.id)))?;
        let mut node = pending;
        let requested = match position {
            Some(target) => target,
            None if node.position != previous.position => node.position,
            None => None,
        };
        let parent_changed = previous.parent_id != node.parent_id;
        self.maintainer.before_update(store, &previous, &mut node)?;

        let mut fields = Vec::new();
        if parent_changed {
            fields.push(Field::Parent(node.parent_id.clone()));
        }
        match &self.positions {
            None => {
                self.check_position(requested)?;
                node.position = previous.position;
            }
            Some(positions) if parent_changed => {
                self.check_position(requested)?;
                if let Some(from) = previous.position {
                    positions.close_gap(store, previous.parent_id.as_ref(), from)?;
                }
                let parent = node.parent_id.as_ref();
                let to = match requested {
                    Some(at) => {
                        positions.make_room(store, parent, at)?;
                        at
                    }
                    None => positions.next_position(store, parent)?,
                };
                node.position = Some(to);
                fields.push(Field::Position(Some(to)));
            }
            Some(positions) => {
                if position.is_none() && node.position != previous.position {
                    self.check_position(node.position)?;
                    let mut owner = previous.clone();
                    positions.set_position(store, &mut owner, node.position, false)?;
                    if node.position.is_none() {
                        fields.push(Field::Position(None));
                    }
                } else if let Some(at) = requested {
                    self.check_position(Some(at))?;
                    let mut owner = previous.clone();
                    positions.set_position(store, &mut owner, Some(at), false)?;
                    node.position = Some(at);
                } else {
                    node.position = previous.position;
                }
            }
        }
        if !fields.is_empty() {
            store.update(&node.id, &fields)?;
        }
        Ok(node)
    }
}
