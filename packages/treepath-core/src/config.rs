use crate::error::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const DEFAULT_PATH_ATTRIBUTE: &str = "path";
pub const DEFAULT_PARENT_ATTRIBUTE: &str = "parent_id";
pub const DEFAULT_DELIMITER: &str = ".";

/// Logical attributes the tree engine reads and writes on every row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Attribute {
    Path,
    Parent,
    Position,
}

/// When an update recomputes the stored path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PathRefresh {
    /// Only when the parent reference changed.
    #[default]
    OnParentChange,
    /// On every update, even if the parent is unchanged.
    Always,
}

/// Per-table tree configuration.
///
/// Attribute names are resolved to storage columns once, here, rather than on every access.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TreeConfig {
    pub path_attribute: String,
    pub parent_attribute: String,
    pub position_attribute: Option<String>,
    pub delimiter: String,
    pub path_refresh: PathRefresh,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            path_attribute: DEFAULT_PATH_ATTRIBUTE.to_string(),
            parent_attribute: DEFAULT_PARENT_ATTRIBUTE.to_string(),
            position_attribute: None,
            delimiter: DEFAULT_DELIMITER.to_string(),
            path_refresh: PathRefresh::default(),
        }
    }
}

impl TreeConfig {
    pub fn with_path_attribute(mut self, name: impl Into<String>) -> Self {
        self.path_attribute = name.into();
        self
    }

    pub fn with_parent_attribute(mut self, name: impl Into<String>) -> Self {
        self.parent_attribute = name.into();
        self
    }

    pub fn with_position_attribute(mut self, name: impl Into<String>) -> Self {
        self.position_attribute = Some(name.into());
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn with_path_refresh(mut self, refresh: PathRefresh) -> Self {
        self.path_refresh = refresh;
        self
    }

    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: TreeConfig = serde_json::from_str(json)
            .map_err(|e| Error::InvalidOperation(format!("tree config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn has_positions(&self) -> bool {
        self.position_attribute.is_some()
    }

    /// Storage column backing `attr`.
    pub fn column(&self, attr: Attribute) -> Result<&str> {
        match attr {
            Attribute::Path => Ok(&self.path_attribute),
            Attribute::Parent => Ok(&self.parent_attribute),
            Attribute::Position => self.position_attribute.as_deref().ok_or_else(|| {
                Error::MissingAttribute("position attribute is not configured".into())
            }),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.delimiter.is_empty() {
            return Err(Error::MissingAttribute("delimiter must not be empty".into()));
        }
        let mut columns = vec![
            ("path_attribute", self.path_attribute.as_str()),
            ("parent_attribute", self.parent_attribute.as_str()),
        ];
        if let Some(position) = &self.position_attribute {
            columns.push(("position_attribute", position.as_str()));
        }
        for (setting, name) in &columns {
            if name.is_empty() {
                return Err(Error::MissingAttribute(format!("{setting} must not be empty")));
            }
            validate_identifier(name)?;
        }
        for (i, (_, a)) in columns.iter().enumerate() {
            if columns[i + 1..].iter().any(|(_, b)| a.eq_ignore_ascii_case(b)) {
                return Err(Error::InvalidOperation(format!(
                    "attribute {a:?} is configured more than once"
                )));
            }
        }
        Ok(())
    }
}

/// Accepts plain SQL identifiers (`[A-Za-z_][A-Za-z0-9_]*`) so backends can splice
/// table and column names into statements.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidOperation(format!(
            "{name:?} is not a valid identifier"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_conventional_columns() {
        let config = TreeConfig::default();
        assert_eq!(config.column(Attribute::Path).unwrap(), "path");
        assert_eq!(config.column(Attribute::Parent).unwrap(), "parent_id");
        assert_eq!(config.delimiter, ".");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn position_column_requires_configuration() {
        let config = TreeConfig::default();
        assert!(matches!(
            config.column(Attribute::Position),
            Err(Error::MissingAttribute(_))
        ));
        let config = config.with_position_attribute("sort_order");
        assert_eq!(config.column(Attribute::Position).unwrap(), "sort_order");
    }

    #[test]
    fn rejects_empty_and_unsafe_names() {
        assert!(matches!(
            TreeConfig::default().with_delimiter("").validate(),
            Err(Error::MissingAttribute(_))
        ));
        assert!(matches!(
            TreeConfig::default().with_path_attribute("").validate(),
            Err(Error::MissingAttribute(_))
        ));
        assert!(matches!(
            TreeConfig::default().with_parent_attribute("parent; DROP").validate(),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            TreeConfig::default().with_position_attribute("PATH").validate(),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn loads_from_json_with_defaults() {
        let config =
            TreeConfig::from_json_str(r#"{"position_attribute":"pos","path_refresh":"always"}"#)
                .unwrap();
        assert_eq!(config.path_attribute, "path");
        assert_eq!(config.position_attribute.as_deref(), Some("pos"));
        assert_eq!(config.path_refresh, PathRefresh::Always);
    }
}
