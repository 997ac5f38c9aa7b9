use tracing::debug;

use crate::config::{Attribute, TreeConfig};
use crate::error::{Error, Result};
use crate::ids::NodeKey;
use crate::node::Node;
use crate::query::{BulkUpdate, Field, Predicate};
use crate::traits::RecordStore;

/// Largest position a row may hold. One slot stays free above it so a move can shift its owner
/// by one before overwriting it.
pub const MAX_POSITION: i64 = i64::MAX - 1;

/// Sibling ordering through the position column.
///
/// All renumbering is done with set-based shifts scoped to one sibling group; rows are never
/// read, adjusted and written back one at a time. Every scan or shift first takes the group's
/// lock through [`RecordStore::lock_siblings`].
#[derive(Clone, Debug)]
pub struct PositionManager {
    column: String,
}

impl PositionManager {
    /// Fails with `MissingAttribute` unless a position attribute is configured.
    pub fn from_config(config: &TreeConfig) -> Result<Self> {
        Ok(Self {
            column: config.column(Attribute::Position)?.to_string(),
        })
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    /// Rows sharing the immediate parent `parent` (roots when `None`).
    pub fn sibling_scope<K: NodeKey>(parent: Option<&K>) -> Predicate<K> {
        Predicate::ParentIs(parent.cloned())
    }

    /// Rejects targets outside `0..=MAX_POSITION`.
    pub fn check_target(position: i64) -> Result<()> {
        if position < 0 {
            return Err(Error::InvalidOperation(format!(
                "position {position} must not be negative"
            )));
        }
        if position > MAX_POSITION {
            return Err(Error::InvalidOperation(format!(
                "position {position} exceeds the maximum of {MAX_POSITION}"
            )));
        }
        Ok(())
    }

    /// Position that appends after the current last sibling.
    pub fn next_position<S: RecordStore>(
        &self,
        store: &mut S,
        parent: Option<&S::Key>,
    ) -> Result<i64> {
        store.lock_siblings(parent)?;
        match store.max_position(&Self::sibling_scope(parent))? {
            None => Ok(0),
            Some(max) if max < MAX_POSITION => Ok(max + 1),
            Some(max) => Err(Error::InvalidOperation(format!(
                "no position left after {max} among siblings"
            ))),
        }
    }

    /// Shifts siblings at or after `at` one slot later so `at` is free.
    pub fn make_room<S: RecordStore>(
        &self,
        store: &mut S,
        parent: Option<&S::Key>,
        at: i64,
    ) -> Result<usize> {
        Self::check_target(at)?;
        store.lock_siblings(parent)?;
        let scope = Self::sibling_scope(parent);
        if let Some(max) = store.max_position(&scope)? {
            if max >= at && max >= MAX_POSITION {
                return Err(Error::InvalidOperation(format!(
                    "no room to shift siblings past {max}"
                )));
            }
        }
        let filter = scope.and(Predicate::PositionAtLeast(at));
        let shifted = store.bulk_update(&filter, &BulkUpdate::ShiftPosition(1))?;
        debug!(column = %self.column, at, shifted, "made room among siblings");
        Ok(shifted)
    }

    /// Shifts siblings after `vacated` one slot earlier.
    pub fn close_gap<S: RecordStore>(
        &self,
        store: &mut S,
        parent: Option<&S::Key>,
        vacated: i64,
    ) -> Result<usize> {
        store.lock_siblings(parent)?;
        let filter = Self::sibling_scope(parent).and(Predicate::PositionAbove(vacated));
        let shifted = store.bulk_update(&filter, &BulkUpdate::ShiftPosition(-1))?;
        debug!(column = %self.column, vacated, shifted, "closed gap among siblings");
        Ok(shifted)
    }

    /// Moves `owner` to `position` within its sibling group, or with `None` closes the gap it
    /// leaves behind without storing a new position for it (used when the owner is going away).
    ///
    /// Moving from `from` to `to` shifts every sibling in `[min, max]` by one towards `from`;
    /// the owner falls inside that range and is then assigned `to` directly. Targets outside
    /// `0..=MAX_POSITION` are rejected; with `run_validation` the owner is re-read from the store.
    /// Returns the number of rows shifted.
    pub fn set_position<S: RecordStore>(
        &self,
        store: &mut S,
        owner: &mut Node<S::Key>,
        position: Option<i64>,
        run_validation: bool,
    ) -> Result<usize> {
        if let Some(to) = position {
            Self::check_target(to)?;
        }
        if run_validation {
            let current = store
                .find_one_for_update(&owner.id)?
                .ok_or_else(|| Error::NotFound(format!("row {}", owner.id)))?;
            owner.parent_id = current.parent_id;
            owner.position = current.position;
        }

        let parent = owner.parent_id.clone();
        let Some(to) = position else {
            return match owner.position {
                Some(from) => self.close_gap(store, parent.as_ref(), from),
                None => Ok(0),
            };
        };

        let shifted = match owner.position {
            Some(from) => {
                store.lock_siblings(parent.as_ref())?;
                let (lo, hi) = (from.min(to), from.max(to));
                let delta = if to < from { 1 } else { -1 };
                let filter =
                    Self::sibling_scope(parent.as_ref()).and(Predicate::PositionBetween(lo, hi));
                store.bulk_update(&filter, &BulkUpdate::ShiftPosition(delta))?
            }
            None => self.make_room(store, parent.as_ref(), to)?,
        };
        store.update(&owner.id, &[Field::Position(Some(to))])?;
        debug!(id = %owner.id, from = ?owner.position, to, shifted, "position set");
        owner.position = Some(to);
        Ok(shifted)
    }
}
