use crate::ids::NodeKey;
use crate::node::Node;

/// Row filter understood by every [`RecordStore`](crate::traits::RecordStore).
///
/// Path predicates are plain substring/prefix matches; backends must not treat any character
/// of the needle as a wildcard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate<K> {
    All,
    Id(K),
    PathContains(String),
    PathStartsWith(String),
    /// `None` selects roots.
    ParentIs(Option<K>),
    PositionAtLeast(i64),
    PositionAbove(i64),
    /// Inclusive on both ends.
    PositionBetween(i64, i64),
    And(Vec<Predicate<K>>),
    Not(Box<Predicate<K>>),
}

impl<K: NodeKey> Predicate<K> {
    pub fn and(self, other: Predicate<K>) -> Predicate<K> {
        match (self, other) {
            (Predicate::All, p) | (p, Predicate::All) => p,
            (Predicate::And(mut left), Predicate::And(right)) => {
                left.extend(right);
                Predicate::And(left)
            }
            (Predicate::And(mut left), p) => {
                left.push(p);
                Predicate::And(left)
            }
            (p, Predicate::And(mut right)) => {
                right.insert(0, p);
                Predicate::And(right)
            }
            (a, b) => Predicate::And(vec![a, b]),
        }
    }

    pub fn negate(self) -> Predicate<K> {
        Predicate::Not(Box::new(self))
    }

    /// Reference evaluation, used by the in-memory store. Position predicates never match rows
    /// without a position, mirroring SQL `NULL` comparisons.
    pub fn matches(&self, node: &Node<K>) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Id(id) => &node.id == id,
            Predicate::PathContains(needle) => node.path.contains(needle.as_str()),
            Predicate::PathStartsWith(prefix) => node.path.starts_with(prefix.as_str()),
            Predicate::ParentIs(parent) => &node.parent_id == parent,
            Predicate::PositionAtLeast(p) => node.position.is_some_and(|pos| pos >= *p),
            Predicate::PositionAbove(p) => node.position.is_some_and(|pos| pos > *p),
            Predicate::PositionBetween(lo, hi) => {
                node.position.is_some_and(|pos| pos >= *lo && pos <= *hi)
            }
            Predicate::And(parts) => parts.iter().all(|p| p.matches(node)),
            Predicate::Not(inner) => !inner.matches(node),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Order {
    /// Store default.
    #[default]
    Unordered,
    /// Ascending position, rows without one last, ties broken by id.
    ByPosition,
}

/// Single-row column assignment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Field<K> {
    Path(String),
    Parent(Option<K>),
    Position(Option<i64>),
}

impl<K: NodeKey> Field<K> {
    pub fn apply(&self, node: &mut Node<K>) {
        match self {
            Field::Path(path) => node.path = path.clone(),
            Field::Parent(parent) => node.parent_id = parent.clone(),
            Field::Position(position) => node.position = *position,
        }
    }
}

/// Set-based update applied to every matching row in one statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BulkUpdate {
    /// `position = position + delta`; rows without a position are left alone.
    ShiftPosition(i64),
    /// Replace the leading `from` of the path with `to`.
    ReplacePathPrefix { from: String, to: String },
}

impl BulkUpdate {
    /// Applies the update to one row; returns whether the row changed.
    pub fn apply<K: NodeKey>(&self, node: &mut Node<K>) -> bool {
        match self {
            // a shift past the i64 range leaves the row alone
            BulkUpdate::ShiftPosition(delta) => {
                match node.position.and_then(|p| p.checked_add(*delta)) {
                    Some(pos) => {
                        node.position = Some(pos);
                        true
                    }
                    None => false,
                }
            }
            BulkUpdate::ReplacePathPrefix { from, to } => match node.path.strip_prefix(from.as_str()) {
                Some(rest) => {
                    node.path = format!("{to}{rest}");
                    true
                }
                None => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64, parent: Option<i64>, path: &str, position: Option<i64>) -> Node<i64> {
        Node {
            id,
            parent_id: parent,
            path: path.to_string(),
            position,
        }
    }

    #[test]
    fn and_flattens_and_drops_all() {
        let p: Predicate<i64> = Predicate::All.and(Predicate::Id(1));
        assert_eq!(p, Predicate::Id(1));
        let p = Predicate::Id(1)
            .and(Predicate::ParentIs(None))
            .and(Predicate::PositionAbove(2));
        assert_eq!(
            p,
            Predicate::And(vec![
                Predicate::Id(1),
                Predicate::ParentIs(None),
                Predicate::PositionAbove(2)
            ])
        );
    }

    #[test]
    fn position_predicates_skip_unpositioned_rows() {
        let n = node(1, None, ".1.", None);
        assert!(!Predicate::PositionAtLeast(0).matches(&n));
        assert!(!Predicate::PositionBetween(0, 10).matches(&n));
        assert!(Predicate::PositionAbove(0).negate().matches(&n));
    }

    #[test]
    fn path_predicates_are_literal() {
        let n = node(12, Some(5), ".5.12.", Some(0));
        assert!(Predicate::PathContains(".5.".into()).matches(&n));
        assert!(!Predicate::PathContains(".1.".into()).matches(&n));
        assert!(Predicate::PathStartsWith(".5.".into()).matches(&n));
        assert!(!Predicate::PathStartsWith(".12.".into()).matches(&n));
    }

    #[test]
    fn bulk_updates_touch_only_applicable_rows() {
        let mut n = node(12, Some(5), ".5.12.", None);
        assert!(!BulkUpdate::ShiftPosition(1).apply(&mut n));
        let mut last = node(13, Some(5), ".5.13.", Some(i64::MAX));
        assert!(!BulkUpdate::ShiftPosition(1).apply(&mut last));
        assert_eq!(last.position, Some(i64::MAX));
        assert!(BulkUpdate::ReplacePathPrefix {
            from: ".5.".into(),
            to: ".7.5.".into()
        }
        .apply(&mut n));
        assert_eq!(n.path, ".7.5.12.");
    }
}
