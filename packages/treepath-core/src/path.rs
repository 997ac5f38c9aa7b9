//! Encoding of the materialized path column.
//!
//! A path is `delimiter + id + delimiter` for every ancestor from the root down to the node
//! itself, with adjacent delimiters collapsed: `.1.4.9.` is node 9 under 4 under root 1.
//! Root nodes carry just their own segment (`.1.`).

use std::fmt::Display;

use crate::error::{Error, Result};
use crate::ids::NodeKey;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathCodec {
    delimiter: String,
}

impl PathCodec {
    pub fn new(delimiter: impl Into<String>) -> Result<Self> {
        let delimiter = delimiter.into();
        if delimiter.is_empty() {
            return Err(Error::MissingAttribute("delimiter must not be empty".into()));
        }
        Ok(Self { delimiter })
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Ancestor path handed to [`encode`](Self::encode) for nodes without a parent.
    pub fn root(&self) -> &str {
        &self.delimiter
    }

    /// `delimiter + id + delimiter`, the substring that marks `id` as an ancestor-or-self.
    pub fn segment<K: Display>(&self, id: &K) -> Result<String> {
        let text = id.to_string();
        if text.is_empty() {
            return Err(Error::malformed(&text, "empty key"));
        }
        if text.contains(self.delimiter.as_str()) {
            return Err(Error::malformed(
                &text,
                format!("key contains the delimiter {:?}", self.delimiter),
            ));
        }
        Ok(format!("{d}{text}{d}", d = self.delimiter))
    }

    /// Path of a node with id `self_id` whose parent path is `ancestor_path`.
    ///
    /// `ancestor_path` is the bare delimiter (or empty) for roots. A path that already ends with
    /// the node's own segment is returned unchanged.
    pub fn encode<K: Display>(&self, ancestor_path: &str, self_id: &K) -> Result<String> {
        let segment = self.segment(self_id)?;
        if ancestor_path.is_empty() || ancestor_path == self.delimiter {
            return Ok(segment);
        }
        self.split(ancestor_path)?;
        if ancestor_path.ends_with(&segment) {
            return Ok(ancestor_path.to_string());
        }
        let base = &ancestor_path[..ancestor_path.len() - self.delimiter.len()];
        Ok(format!("{base}{segment}"))
    }

    /// Every id in `path`, root first, including the node's own id last.
    pub fn ids<K: NodeKey>(&self, path: &str) -> Result<Vec<K>> {
        self.split(path)?
            .into_iter()
            .map(|raw| {
                raw.parse::<K>()
                    .map_err(|_| Error::malformed(path, format!("segment {raw:?} is not a valid key")))
            })
            .collect()
    }

    /// Ancestor ids in root-to-nearest order, excluding the node itself.
    pub fn parent_ids<K: NodeKey>(&self, path: &str) -> Result<Vec<K>> {
        let mut ids = self.ids(path)?;
        ids.pop();
        Ok(ids)
    }

    pub fn closest_parent_id<K: NodeKey>(&self, path: &str) -> Result<Option<K>> {
        Ok(self.parent_ids(path)?.pop())
    }

    /// Id of the node the path belongs to.
    pub fn self_id<K: NodeKey>(&self, path: &str) -> Result<K> {
        self.ids(path)?
            .pop()
            .ok_or_else(|| Error::malformed(path, "path has no segments"))
    }

    /// Path of the closest parent, or the bare delimiter for roots.
    pub fn parent_path(&self, path: &str) -> Result<String> {
        let segments = self.split(path)?;
        if segments.len() <= 1 {
            return Ok(self.delimiter.clone());
        }
        let d = &self.delimiter;
        let joined = segments[..segments.len() - 1].join(d);
        Ok(format!("{d}{joined}{d}"))
    }

    /// Number of segments; 1 for roots.
    pub fn depth(&self, path: &str) -> Result<usize> {
        Ok(self.split(path)?.len())
    }

    /// Whether `id` is `path`'s node or one of its ancestors.
    pub fn contains<K: Display>(&self, path: &str, id: &K) -> Result<bool> {
        Ok(path.contains(&self.segment(id)?))
    }

    /// Whether `parent` is an ancestor of the node at `child_path` (its immediate parent when
    /// `closest_only` is set).
    pub fn is_parent_of<K: NodeKey>(
        &self,
        parent: &K,
        child_path: &str,
        closest_only: bool,
    ) -> Result<bool> {
        let ancestors: Vec<K> = self.parent_ids(child_path)?;
        Ok(if closest_only {
            ancestors.last() == Some(parent)
        } else {
            ancestors.contains(parent)
        })
    }

    fn split<'a>(&self, path: &'a str) -> Result<Vec<&'a str>> {
        let d = self.delimiter.as_str();
        if path == d {
            return Ok(Vec::new());
        }
        let inner = path
            .strip_prefix(d)
            .and_then(|rest| rest.strip_suffix(d))
            .ok_or_else(|| Error::malformed(path, "path must start and end with the delimiter"))?;
        if inner.is_empty() {
            return Err(Error::malformed(path, "empty segment"));
        }
        let segments: Vec<&str> = inner.split(d).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(Error::malformed(path, "empty segment"));
        }
        Ok(segments)
    }
}

impl Default for PathCodec {
    fn default() -> Self {
        Self {
            delimiter: crate::config::DEFAULT_DELIMITER.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> PathCodec {
        PathCodec::default()
    }

    #[test]
    fn encodes_roots_and_children() {
        let c = codec();
        assert_eq!(c.encode(".", &5).unwrap(), ".5.");
        assert_eq!(c.encode("", &5).unwrap(), ".5.");
        assert_eq!(c.encode(".5.", &9).unwrap(), ".5.9.");
        assert_eq!(c.encode(".5.9.", &12).unwrap(), ".5.9.12.");
    }

    #[test]
    fn encode_is_idempotent_on_own_segment() {
        assert_eq!(codec().encode(".5.9.", &9).unwrap(), ".5.9.");
        // a longer id sharing a suffix is not the node's own segment
        assert_eq!(codec().encode(".5.19.", &9).unwrap(), ".5.19.9.");
    }

    #[test]
    fn multi_character_delimiter() {
        let c = PathCodec::new("::").unwrap();
        assert_eq!(c.encode("::", &1).unwrap(), "::1::");
        assert_eq!(c.encode("::1::", &2).unwrap(), "::1::2::");
        assert_eq!(c.parent_ids::<i64>("::1::2::3::").unwrap(), vec![1, 2]);
    }

    #[test]
    fn decodes_ancestors() {
        let c = codec();
        assert_eq!(c.parent_ids::<i64>(".1.4.9.").unwrap(), vec![1, 4]);
        assert_eq!(c.closest_parent_id::<i64>(".1.4.9.").unwrap(), Some(4));
        assert_eq!(c.closest_parent_id::<i64>(".1.").unwrap(), None);
        assert_eq!(c.self_id::<i64>(".1.4.9.").unwrap(), 9);
        assert_eq!(c.parent_path(".1.4.9.").unwrap(), ".1.4.");
        assert_eq!(c.parent_path(".1.").unwrap(), ".");
        assert_eq!(c.depth(".1.4.9.").unwrap(), 3);
    }

    #[test]
    fn rejects_malformed_paths() {
        let c = codec();
        for bad in ["", "1.2", ".1.2", "..", ".1..2.", ".a.2."] {
            assert!(
                matches!(c.parent_ids::<i64>(bad), Err(Error::MalformedPath { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_keys_containing_delimiter() {
        assert!(matches!(
            codec().encode(".", &"a.b"),
            Err(Error::MalformedPath { .. })
        ));
    }

    #[test]
    fn parent_checks_respect_closest_only() {
        let c = codec();
        assert!(c.is_parent_of(&4i64, ".1.4.9.", true).unwrap());
        assert!(!c.is_parent_of(&1i64, ".1.4.9.", true).unwrap());
        assert!(c.is_parent_of(&1i64, ".1.4.9.", false).unwrap());
        assert!(!c.is_parent_of(&9i64, ".1.4.9.", false).unwrap());
    }

    #[test]
    fn string_keys() {
        let c = codec();
        let path = c.encode(&c.encode(".", &"alpha").unwrap(), &"beta").unwrap();
        assert_eq!(path, ".alpha.beta.");
        assert_eq!(c.parent_ids::<String>(&path).unwrap(), vec!["alpha".to_string()]);
    }
}
