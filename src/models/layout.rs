//! Layout payloads -- the project owner's signed policy document.
//!
//! A layout enumerates the ordered steps of a pipeline, which functionary
//! keys may evidence each step, the command a step is expected to run, and
//! the artifact rules constraining its materials and products. Inspections
//! are verifier-side steps executed during verification.
//!
//! Invariants are enforced on construction and on load:
//! - step and inspection names are unique and contain no path separators;
//! - every keyid a step authorizes exists in the layout's key table;
//! - `1 <= threshold <= |pubkeys|` (a step with no authorized keys is
//!   rejected outright -- it could never be evidenced);
//! - `expires` parses as an RFC 3339 timestamp.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::crypto::Key;
use crate::error::{Error, Result};
use crate::models::rule::ArtifactRule;
use crate::models::validate_item_name;

/// A declared pipeline step, evidenced later by functionary links.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Discriminator, always `"step"`.
    #[serde(rename = "_type", default = "step_type")]
    pub type_: String,
    /// Unique step name.
    pub name: String,
    /// Rules over the step's materials, applied in order.
    #[serde(default)]
    pub expected_materials: Vec<ArtifactRule>,
    /// Rules over the step's products, applied in order.
    #[serde(default)]
    pub expected_products: Vec<ArtifactRule>,
    /// Keyids of functionaries authorized to evidence this step.
    #[serde(default)]
    pub pubkeys: Vec<String>,
    /// Command the functionary is expected to run; may be empty.
    #[serde(default)]
    pub expected_command: Vec<String>,
    /// Minimum number of distinct functionaries that must agree.
    #[serde(default = "default_threshold")]
    pub threshold: u32,
}

fn step_type() -> String {
    "step".into()
}

fn default_threshold() -> u32 {
    1
}

impl Step {
    /// Creates a step with defaults (threshold 1, no rules, no keys).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] for an invalid name.
    pub fn new(name: &str) -> Result<Self> {
        validate_item_name(name)?;
        Ok(Self {
            type_: step_type(),
            name: name.into(),
            expected_materials: Vec::new(),
            expected_products: Vec::new(),
            pubkeys: Vec::new(),
            expected_command: Vec::new(),
            threshold: default_threshold(),
        })
    }
}

/// A verifier-side step: its link is generated during verification by
/// running `run` in the evidence directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inspection {
    /// Discriminator, always `"inspection"`.
    #[serde(rename = "_type", default = "inspection_type")]
    pub type_: String,
    /// Unique inspection name.
    pub name: String,
    /// Rules over the inspection's materials.
    #[serde(default)]
    pub expected_materials: Vec<ArtifactRule>,
    /// Rules over the inspection's products.
    #[serde(default)]
    pub expected_products: Vec<ArtifactRule>,
    /// Command the verifier executes.
    #[serde(default)]
    pub run: Vec<String>,
}

fn inspection_type() -> String {
    "inspection".into()
}

impl Inspection {
    /// Creates an inspection with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] for an invalid name.
    pub fn new(name: &str) -> Result<Self> {
        validate_item_name(name)?;
        Ok(Self {
            type_: inspection_type(),
            name: name.into(),
            expected_materials: Vec::new(),
            expected_products: Vec::new(),
            run: Vec::new(),
        })
    }
}

/// A layout payload (`_type: "layout"`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    /// Discriminator, always `"layout"`.
    #[serde(rename = "_type", default = "layout_type")]
    pub type_: String,
    /// Expiration timestamp, RFC 3339. The layout is rejected once the
    /// current time reaches it.
    pub expires: String,
    /// Free-text description.
    #[serde(default)]
    pub readme: String,
    /// Public keys of all functionaries, by keyid.
    #[serde(default)]
    pub keys: BTreeMap<String, Key>,
    /// Ordered pipeline steps.
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Ordered verifier-side inspections.
    #[serde(default)]
    pub inspect: Vec<Inspection>,
}

fn layout_type() -> String {
    "layout".into()
}

impl Layout {
    /// Creates an empty layout expiring at `expires` (RFC 3339).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] if `expires` does not parse.
    pub fn new(expires: &str) -> Result<Self> {
        let layout = Self {
            type_: layout_type(),
            expires: expires.into(),
            readme: String::new(),
            keys: BTreeMap::new(),
            steps: Vec::new(),
            inspect: Vec::new(),
        };
        layout.parse_expires()?;
        Ok(layout)
    }

    /// Parses the expiration timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] if `expires` is not RFC 3339.
    pub fn parse_expires(&self) -> Result<OffsetDateTime> {
        OffsetDateTime::parse(&self.expires, &Rfc3339).map_err(|e| {
            Error::schema(
                "layout expires",
                format!("'{}' is not an RFC 3339 timestamp: {e}", self.expires),
            )
        })
    }

    /// Looks up a step by name.
    pub fn step_by_name(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Validates all layout invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] on the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        if self.type_ != "layout" {
            return Err(Error::schema(
                "layout",
                format!("_type must be 'layout', got '{}'", self.type_),
            ));
        }
        self.parse_expires()?;

        for (keyid, key) in &self.keys {
            if !key.keyid.is_empty() && key.keyid != *keyid {
                return Err(Error::schema(
                    "layout keys",
                    format!(
                        "key table id '{keyid}' disagrees with descriptor keyid '{}'",
                        key.keyid
                    ),
                ));
            }
            if keyid.is_empty() || !keyid.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::schema(
                    "layout keys",
                    format!("keyid '{keyid}' is not hex"),
                ));
            }
            if key.keyval.private.is_some() {
                return Err(Error::schema(
                    "layout keys",
                    format!("key '{keyid}' carries private material"),
                ));
            }
        }

        let mut step_names = HashSet::new();
        for step in &self.steps {
            validate_item_name(&step.name)?;
            if step.type_ != "step" {
                return Err(Error::schema(
                    format!("step '{}'", step.name),
                    format!("_type must be 'step', got '{}'", step.type_),
                ));
            }
            if !step_names.insert(step.name.as_str()) {
                return Err(Error::schema(
                    "layout steps",
                    format!("duplicate step name '{}'", step.name),
                ));
            }
            for keyid in &step.pubkeys {
                if !self.keys.contains_key(keyid) {
                    return Err(Error::schema(
                        format!("step '{}'", step.name),
                        format!("pubkey '{keyid}' is not in the layout key table"),
                    ));
                }
            }
            if step.pubkeys.is_empty() {
                // A step no key can evidence can never be verified.
                return Err(Error::schema(
                    format!("step '{}'", step.name),
                    "step authorizes no functionary keys",
                ));
            }
            if step.threshold < 1 {
                return Err(Error::schema(
                    format!("step '{}'", step.name),
                    "threshold must be at least 1",
                ));
            }
            if step.threshold as usize > step.pubkeys.len() {
                return Err(Error::schema(
                    format!("step '{}'", step.name),
                    format!(
                        "threshold {} exceeds the {} authorized key(s)",
                        step.threshold,
                        step.pubkeys.len()
                    ),
                ));
            }
        }

        let mut inspection_names = HashSet::new();
        for inspection in &self.inspect {
            validate_item_name(&inspection.name)?;
            if inspection.type_ != "inspection" {
                return Err(Error::schema(
                    format!("inspection '{}'", inspection.name),
                    format!("_type must be 'inspection', got '{}'", inspection.type_),
                ));
            }
            if !inspection_names.insert(inspection.name.as_str())
                || step_names.contains(inspection.name.as_str())
            {
                return Err(Error::schema(
                    "layout inspections",
                    format!("duplicate item name '{}'", inspection.name),
                ));
            }
            if inspection.run.is_empty() {
                return Err(Error::schema(
                    format!("inspection '{}'", inspection.name),
                    "inspection has no command to run",
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::crypto::KeyVal;
    use std::collections::BTreeMap as Map;

    fn test_key(keyid: &str) -> Key {
        Key {
            keyid: keyid.into(),
            keytype: "ed25519".into(),
            scheme: "ed25519".into(),
            keyid_hash_algorithms: None,
            keyval: KeyVal {
                public: "aa".repeat(32),
                private: None,
            },
            subkeys: Map::new(),
        }
    }

    fn valid_layout() -> Layout {
        let keyid = "ab".repeat(32);
        let mut layout = Layout::new("2035-01-01T00:00:00Z").unwrap();
        layout.keys.insert(keyid.clone(), test_key(&keyid));
        let mut step = Step::new("clone").unwrap();
        step.pubkeys = vec![keyid];
        layout.steps.push(step);
        layout
    }

    #[test]
    fn valid_layout_passes() {
        valid_layout().validate().unwrap();
    }

    #[test]
    fn bad_expires_rejected() {
        assert!(Layout::new("tomorrow").is_err());
        assert!(Layout::new("2030-01-01").is_err());
    }

    #[test]
    fn duplicate_step_names_rejected() {
        let mut layout = valid_layout();
        let mut dup = layout.steps[0].clone();
        dup.expected_command = vec!["git".into()];
        layout.steps.push(dup);
        let err = layout.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Schema);
    }

    #[test]
    fn inspection_name_colliding_with_step_rejected() {
        let mut layout = valid_layout();
        let mut inspection = Inspection::new("clone").unwrap();
        inspection.run = vec!["true".into()];
        layout.inspect.push(inspection);
        assert!(layout.validate().is_err());
    }

    #[test]
    fn unknown_pubkey_rejected() {
        let mut layout = valid_layout();
        layout.steps[0].pubkeys.push("cd".repeat(32));
        assert!(layout.validate().is_err());
    }

    #[test]
    fn empty_pubkeys_rejected() {
        let mut layout = valid_layout();
        layout.steps[0].pubkeys.clear();
        assert!(layout.validate().is_err());
    }

    #[test]
    fn threshold_above_keyset_rejected() {
        let mut layout = valid_layout();
        layout.steps[0].threshold = 2;
        assert!(layout.validate().is_err());
    }

    #[test]
    fn zero_threshold_rejected() {
        let mut layout = valid_layout();
        layout.steps[0].threshold = 0;
        assert!(layout.validate().is_err());
    }

    #[test]
    fn private_key_in_layout_rejected() {
        let mut layout = valid_layout();
        let keyid = "ab".repeat(32);
        if let Some(key) = layout.keys.get_mut(&keyid) {
            key.keyval.private = Some(crate::crypto::PrivateKey("s3cret".into()));
        }
        assert!(layout.validate().is_err());
    }

    #[test]
    fn inspection_without_command_rejected() {
        let mut layout = valid_layout();
        layout.inspect.push(Inspection::new("check").unwrap());
        assert!(layout.validate().is_err());
    }

    #[test]
    fn layout_roundtrips_through_serde() {
        let layout = valid_layout();
        let json = serde_json::to_string(&layout).unwrap();
        let parsed: Layout = serde_json::from_str(&json).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed, layout);
    }

    #[test]
    fn threshold_defaults_to_one() {
        let step: Step =
            serde_json::from_str(r#"{"_type": "step", "name": "s", "pubkeys": ["ab"]}"#).unwrap();
        assert_eq!(step.threshold, 1);
    }
}
