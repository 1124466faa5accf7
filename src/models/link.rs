//! Link payloads -- signed evidence that a step executed.
//!
//! A link records what went in (materials), what came out (products), the
//! command that ran, and its observable side effects (byproducts,
//! environment). One link is produced per (step, functionary) pair.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{validate_item_name, ArtifactMap};

/// Observable side effects of the recorded command.
///
/// Every field may be absent: a record-start/record-stop pair runs no
/// command at all.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByProducts {
    /// Exit code of the command.
    #[serde(
        rename = "return-value",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub return_value: Option<i64>,
    /// Captured standard output (empty when capture was disabled).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Captured standard error (empty when capture was disabled).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Set when the command was terminated for exceeding its timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<bool>,
}

/// A link payload (`_type: "link"`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Link {
    /// Discriminator, always `"link"`.
    #[serde(rename = "_type", default = "link_type")]
    pub type_: String,
    /// Step name this link attests.
    pub name: String,
    /// Argument vector that was executed; may be empty.
    #[serde(default)]
    pub command: Vec<String>,
    /// Input artifacts: normalized path/URI to digest set.
    #[serde(default)]
    pub materials: ArtifactMap,
    /// Output artifacts: normalized path/URI to digest set.
    #[serde(default)]
    pub products: ArtifactMap,
    /// Command side effects.
    #[serde(default)]
    pub byproducts: ByProducts,
    /// Key/value scalars captured at runtime (e.g. workdir variables).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, serde_json::Value>,
}

fn link_type() -> String {
    "link".into()
}

impl Link {
    /// Creates an empty link for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Schema`] for an invalid name.
    pub fn new(name: &str) -> Result<Self> {
        validate_item_name(name)?;
        Ok(Self {
            type_: link_type(),
            name: name.into(),
            command: Vec::new(),
            materials: ArtifactMap::new(),
            products: ArtifactMap::new(),
            byproducts: ByProducts::default(),
            environment: BTreeMap::new(),
        })
    }

    /// Validates the payload after deserialization.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Schema`] for a wrong `_type`, a bad
    /// name, or artifact keys that are not `/`-normalized.
    pub fn validate(&self) -> Result<()> {
        if self.type_ != "link" {
            return Err(crate::error::Error::schema(
                "link",
                format!("_type must be 'link', got '{}'", self.type_),
            ));
        }
        validate_item_name(&self.name)?;
        for (which, artifacts) in [("materials", &self.materials), ("products", &self.products)] {
            for path in artifacts.keys() {
                if path.contains('\\') || path.contains("//") {
                    return Err(crate::error::Error::schema(
                        format!("link '{}' {which}", self.name),
                        format!("artifact path '{path}' is not normalized"),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::DigestSet;

    fn digest(hex: &str) -> DigestSet {
        let mut d = DigestSet::new();
        d.insert("sha256".into(), hex.into());
        d
    }

    #[test]
    fn minimal_link_roundtrips() {
        let mut link = Link::new("clone").unwrap();
        link.materials.insert("foo.py".into(), digest("ab"));
        link.byproducts.return_value = Some(0);

        let json = serde_json::to_string(&link).unwrap();
        let parsed: Link = serde_json::from_str(&json).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed, link);
    }

    #[test]
    fn absent_byproduct_fields_not_serialized() {
        let link = Link::new("clone").unwrap();
        let json = serde_json::to_string(&link).unwrap();
        assert!(!json.contains("return-value"));
        assert!(!json.contains("stdout"));
        assert!(!json.contains("environment"));
    }

    #[test]
    fn deserializes_with_missing_optional_fields() {
        let link: Link =
            serde_json::from_str(r#"{"_type": "link", "name": "clone"}"#).unwrap();
        link.validate().unwrap();
        assert!(link.command.is_empty());
        assert!(link.materials.is_empty());
        assert_eq!(link.byproducts, ByProducts::default());
    }

    #[test]
    fn wrong_type_tag_rejected() {
        let link: Link =
            serde_json::from_str(r#"{"_type": "layout", "name": "clone"}"#).unwrap();
        assert!(link.validate().is_err());
    }

    #[test]
    fn unnormalized_artifact_path_rejected() {
        let mut link = Link::new("clone").unwrap();
        link.products.insert("dir\\file".into(), digest("ab"));
        assert!(link.validate().is_err());

        let mut link = Link::new("clone").unwrap();
        link.products.insert("dir//file".into(), digest("ab"));
        assert!(link.validate().is_err());
    }

    #[test]
    fn name_with_separator_rejected() {
        assert!(Link::new("a/b").is_err());
    }
}
