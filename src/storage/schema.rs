//! Collection, index and view descriptions

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::wal::RawJson;

/// Collection type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    #[default]
    Document,
    Edge,
}

/// Collection properties as exchanged by inventory and restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDescription {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: CollectionKind,
    #[serde(default = "default_wait_for_sync")]
    pub wait_for_sync: bool,
}

fn default_wait_for_sync() -> bool {
    false
}

impl CollectionDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: CollectionKind::Document,
            wait_for_sync: false,
        }
    }

    /// System collections start with an underscore
    pub fn is_system(&self) -> bool {
        self.name.starts_with('_')
    }

    pub fn validate(&self) -> Result<()> {
        validate_name("collection", &self.name)
    }
}

/// Secondary index types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Persistent,
    Hash,
    Skiplist,
    Ttl,
    Geo,
    Fulltext,
}

/// Index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescription {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: IndexKind,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
}

impl IndexDescription {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::malformed("index id cannot be empty"));
        }
        if self.fields.is_empty() || self.fields.iter().any(|f| f.is_empty()) {
            return Err(Error::malformed(format!(
                "index '{}' needs at least one non-empty field",
                self.id
            )));
        }
        if self.kind == IndexKind::Ttl && self.fields.len() != 1 {
            return Err(Error::malformed(format!(
                "ttl index '{}' must cover exactly one field",
                self.id
            )));
        }
        Ok(())
    }
}

/// View definition; properties are opaque to the replication layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: RawJson,
}

impl ViewDescription {
    pub fn validate(&self) -> Result<()> {
        validate_name("view", &self.name)?;
        if self.kind.is_empty() {
            return Err(Error::malformed(format!("view '{}' has no type", self.name)));
        }
        match self.properties.to_value() {
            Ok(serde_json::Value::Object(_)) => Ok(()),
            _ => Err(Error::malformed(format!(
                "view '{}' properties must be an object",
                self.name
            ))),
        }
    }
}

fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 256 {
        return Err(Error::malformed(format!("invalid {} name '{}'", what, name)));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(Error::malformed(format!("invalid {} name '{}'", what, name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_description_defaults() {
        let desc: CollectionDescription = serde_json::from_value(json!({"name": "orders"})).unwrap();
        assert_eq!(desc.kind, CollectionKind::Document);
        assert!(!desc.wait_for_sync);
        assert!(desc.validate().is_ok());

        let edge: CollectionDescription =
            serde_json::from_value(json!({"name": "links", "type": "edge"})).unwrap();
        assert_eq!(edge.kind, CollectionKind::Edge);
    }

    #[test]
    fn test_name_validation() {
        assert!(CollectionDescription::new("_graphs").validate().is_ok());
        assert!(CollectionDescription::new("").validate().is_err());
        assert!(CollectionDescription::new("a/b").validate().is_err());
        assert!(CollectionDescription::new("has space").validate().is_err());
    }

    #[test]
    fn test_index_validation() {
        let index: IndexDescription = serde_json::from_value(json!({
            "id": "idx_1", "type": "persistent", "fields": ["customer"], "unique": true
        }))
        .unwrap();
        assert!(index.validate().is_ok());
        assert!(!index.sparse);

        let ttl = IndexDescription {
            id: "idx_2".into(),
            kind: IndexKind::Ttl,
            fields: vec!["a".into(), "b".into()],
            unique: false,
            sparse: false,
        };
        assert!(ttl.validate().is_err());
    }

    #[test]
    fn test_view_validation() {
        let view = ViewDescription {
            name: "search".into(),
            kind: "arangosearch".into(),
            properties: RawJson::from(json!({"links": {}})),
        };
        assert!(view.validate().is_ok());

        let bad = ViewDescription {
            properties: RawJson::from(json!([1, 2])),
            ..view
        };
        assert!(bad.validate().is_err());
    }
}
