//! Artifact-rule language: parsing and wire representation.
//!
//! Rules constrain the materials a step may consume and the products it
//! may emit. Two input forms normalize to the same tagged variant:
//!
//! - the ordered-token form stored in layouts, e.g.
//!   `["MATCH", "foo.py", "WITH", "PRODUCTS", "FROM", "clone"]`
//! - a structured map form, e.g.
//!   `{"rule_type": "match", "pattern": "foo.py", "dest_type": "products",
//!     "dest_name": "clone"}`
//!
//! Keywords are case-insensitive; operand case is preserved. Unknown rule
//! tags are rejected at parse time. Serialization always emits the token
//! form with uppercase keywords.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Which artifact set of a link a rule refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactSide {
    /// The link's materials.
    Materials,
    /// The link's products.
    Products,
}

impl ArtifactSide {
    /// Lowercase name, as used in error context.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Materials => "materials",
            Self::Products => "products",
        }
    }

    /// Uppercase keyword, as used in the token form.
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Materials => "MATERIALS",
            Self::Products => "PRODUCTS",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "materials" => Some(Self::Materials),
            "products" => Some(Self::Products),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single artifact rule, normalized from either input form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArtifactRule {
    /// Cross-step linkage: queued entries matching `pattern` (after
    /// stripping `source_prefix`) must appear with an equal digest set in
    /// the named side of `dest_step`'s link (after stripping
    /// `dest_prefix`).
    Match {
        /// Glob pattern over the path remainder.
        pattern: String,
        /// Optional prefix stripped from queue entries before matching.
        source_prefix: Option<String>,
        /// Which side of the destination link to consult.
        dest_side: ArtifactSide,
        /// Optional prefix prepended when looking up destination entries.
        dest_prefix: Option<String>,
        /// Name of the step (or inspection) whose link is consulted.
        dest_step: String,
    },
    /// Consume matching queue entries; never fails.
    Allow {
        /// Glob pattern.
        pattern: String,
    },
    /// Fail if any remaining queue entry matches.
    Disallow {
        /// Glob pattern.
        pattern: String,
    },
    /// Fail unless the full artifact set contains exactly this path.
    /// Takes a literal filename, not a pattern, and consumes nothing.
    Require {
        /// Literal path.
        filename: String,
    },
    /// Products side: consume entries that do not appear in materials.
    Create {
        /// Glob pattern.
        pattern: String,
    },
    /// Materials side: consume entries that do not appear in products.
    Delete {
        /// Glob pattern.
        pattern: String,
    },
    /// Consume entries present on both sides with differing digest sets.
    Modify {
        /// Glob pattern.
        pattern: String,
    },
}

impl ArtifactRule {
    /// Parses the ordered-token form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] for unknown tags, wrong arity, or a
    /// malformed `MATCH` clause.
    pub fn from_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<Self> {
        let lower: Vec<String> = tokens
            .iter()
            .map(|t| t.as_ref().to_ascii_lowercase())
            .collect();

        let bad = |reason: String| Error::schema("artifact rule", reason);

        let (Some(tag), Some(operand)) = (lower.first(), tokens.get(1)) else {
            return Err(bad(format!(
                "rule needs at least a tag and an operand, got {} token(s)",
                tokens.len()
            )));
        };
        let operand = operand.as_ref().to_string();

        let generic = |arity_ok: bool, rule: Self| {
            if arity_ok {
                Ok(rule)
            } else {
                Err(bad(format!(
                    "'{}' takes exactly one operand",
                    tag.to_uppercase()
                )))
            }
        };

        match tag.as_str() {
            "allow" => generic(tokens.len() == 2, Self::Allow { pattern: operand }),
            "disallow" => generic(tokens.len() == 2, Self::Disallow { pattern: operand }),
            "require" => generic(tokens.len() == 2, Self::Require { filename: operand }),
            "create" => generic(tokens.len() == 2, Self::Create { pattern: operand }),
            "delete" => generic(tokens.len() == 2, Self::Delete { pattern: operand }),
            "modify" => generic(tokens.len() == 2, Self::Modify { pattern: operand }),
            "match" => {
                // MATCH <pattern> [IN <src>] WITH (MATERIALS|PRODUCTS)
                //       [IN <dst>] FROM <step>
                let kw = |i: usize| lower.get(i).map(String::as_str);
                let op = |i: usize| tokens.get(i).map(|t| t.as_ref().to_string());

                let (source_prefix, side_idx) = if kw(2) == Some("in") {
                    (op(3), 4)
                } else {
                    (None, 2)
                };
                if kw(side_idx) != Some("with") {
                    return Err(bad("match rule is missing the WITH keyword".into()));
                }
                let side = kw(side_idx + 1)
                    .and_then(ArtifactSide::parse)
                    .ok_or_else(|| {
                        bad("match rule destination must be MATERIALS or PRODUCTS".into())
                    })?;
                let (dest_prefix, from_idx) = if kw(side_idx + 2) == Some("in") {
                    (op(side_idx + 3), side_idx + 4)
                } else {
                    (None, side_idx + 2)
                };
                if kw(from_idx) != Some("from") {
                    return Err(bad("match rule is missing the FROM keyword".into()));
                }
                let dest_step = op(from_idx + 1)
                    .ok_or_else(|| bad("match rule is missing the step name".into()))?;
                if tokens.len() != from_idx + 2 {
                    return Err(bad(format!(
                        "match rule has trailing tokens after FROM {dest_step}"
                    )));
                }
                Ok(Self::Match {
                    pattern: operand,
                    source_prefix,
                    dest_side: side,
                    dest_prefix,
                    dest_step,
                })
            }
            other => Err(bad(format!("unknown rule tag '{other}'"))),
        }
    }

    /// Emits the ordered-token wire form with uppercase keywords.
    pub fn to_tokens(&self) -> Vec<String> {
        match self {
            Self::Allow { pattern } => vec!["ALLOW".into(), pattern.clone()],
            Self::Disallow { pattern } => vec!["DISALLOW".into(), pattern.clone()],
            Self::Require { filename } => vec!["REQUIRE".into(), filename.clone()],
            Self::Create { pattern } => vec!["CREATE".into(), pattern.clone()],
            Self::Delete { pattern } => vec!["DELETE".into(), pattern.clone()],
            Self::Modify { pattern } => vec!["MODIFY".into(), pattern.clone()],
            Self::Match {
                pattern,
                source_prefix,
                dest_side,
                dest_prefix,
                dest_step,
            } => {
                let mut out = vec!["MATCH".into(), pattern.clone()];
                if let Some(src) = source_prefix {
                    out.push("IN".into());
                    out.push(src.clone());
                }
                out.push("WITH".into());
                out.push(dest_side.keyword().into());
                if let Some(dst) = dest_prefix {
                    out.push("IN".into());
                    out.push(dst.clone());
                }
                out.push("FROM".into());
                out.push(dest_step.clone());
                out
            }
        }
    }

    /// The uppercase tag of this rule, for diagnostics.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Match { .. } => "MATCH",
            Self::Allow { .. } => "ALLOW",
            Self::Disallow { .. } => "DISALLOW",
            Self::Require { .. } => "REQUIRE",
            Self::Create { .. } => "CREATE",
            Self::Delete { .. } => "DELETE",
            Self::Modify { .. } => "MODIFY",
        }
    }

    fn from_structured(map: &serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let get = |k: &str| map.get(k).and_then(serde_json::Value::as_str);
        let rule_type = get("rule_type")
            .ok_or_else(|| Error::schema("artifact rule", "structured rule needs 'rule_type'"))?;
        let pattern = get("pattern")
            .ok_or_else(|| Error::schema("artifact rule", "structured rule needs 'pattern'"))?;

        if rule_type.eq_ignore_ascii_case("match") {
            let mut tokens: Vec<String> = vec!["MATCH".into(), pattern.into()];
            if let Some(src) = get("source_prefix").filter(|s| !s.is_empty()) {
                tokens.push("IN".into());
                tokens.push(src.into());
            }
            tokens.push("WITH".into());
            tokens.push(
                get("dest_type")
                    .ok_or_else(|| {
                        Error::schema("artifact rule", "structured match rule needs 'dest_type'")
                    })?
                    .into(),
            );
            if let Some(dst) = get("dest_prefix").filter(|s| !s.is_empty()) {
                tokens.push("IN".into());
                tokens.push(dst.into());
            }
            tokens.push("FROM".into());
            tokens.push(
                get("dest_name")
                    .ok_or_else(|| {
                        Error::schema("artifact rule", "structured match rule needs 'dest_name'")
                    })?
                    .into(),
            );
            Self::from_tokens(&tokens)
        } else {
            Self::from_tokens(&[rule_type, pattern])
        }
    }
}

impl fmt::Display for ArtifactRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_tokens().join(" "))
    }
}

impl Serialize for ArtifactRule {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_tokens().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ArtifactRule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match &value {
            serde_json::Value::Array(items) => {
                let tokens: Vec<String> = items
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .map(String::from)
                            .ok_or_else(|| D::Error::custom("rule tokens must be strings"))
                    })
                    .collect::<std::result::Result<_, _>>()?;
                ArtifactRule::from_tokens(&tokens).map_err(D::Error::custom)
            }
            serde_json::Value::Object(map) => {
                ArtifactRule::from_structured(map).map_err(D::Error::custom)
            }
            _ => Err(D::Error::custom(
                "artifact rule must be a token list or a structured map",
            )),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(tokens: &[&str]) -> ArtifactRule {
        ArtifactRule::from_tokens(tokens).unwrap()
    }

    #[test]
    fn generic_rules_parse() {
        assert_eq!(
            parse(&["CREATE", "foo.py"]),
            ArtifactRule::Create {
                pattern: "foo.py".into()
            }
        );
        assert_eq!(
            parse(&["disallow", "*"]),
            ArtifactRule::Disallow {
                pattern: "*".into()
            }
        );
        assert_eq!(
            parse(&["Require", ".keep"]),
            ArtifactRule::Require {
                filename: ".keep".into()
            }
        );
    }

    #[test]
    fn operand_case_preserved() {
        assert_eq!(
            parse(&["ALLOW", "Foo.PY"]),
            ArtifactRule::Allow {
                pattern: "Foo.PY".into()
            }
        );
    }

    #[test]
    fn match_rule_all_forms() {
        // Minimal form.
        assert_eq!(
            parse(&["MATCH", "foo", "WITH", "PRODUCTS", "FROM", "clone"]),
            ArtifactRule::Match {
                pattern: "foo".into(),
                source_prefix: None,
                dest_side: ArtifactSide::Products,
                dest_prefix: None,
                dest_step: "clone".into(),
            }
        );
        // Source prefix only.
        assert_eq!(
            parse(&["MATCH", "foo", "IN", "src", "WITH", "MATERIALS", "FROM", "build"]),
            ArtifactRule::Match {
                pattern: "foo".into(),
                source_prefix: Some("src".into()),
                dest_side: ArtifactSide::Materials,
                dest_prefix: None,
                dest_step: "build".into(),
            }
        );
        // Destination prefix only.
        assert_eq!(
            parse(&["MATCH", "foo", "WITH", "PRODUCTS", "IN", "dist", "FROM", "build"]),
            ArtifactRule::Match {
                pattern: "foo".into(),
                source_prefix: None,
                dest_side: ArtifactSide::Products,
                dest_prefix: Some("dist".into()),
                dest_step: "build".into(),
            }
        );
        // Both prefixes.
        assert_eq!(
            parse(&[
                "MATCH", "foo", "IN", "src", "WITH", "PRODUCTS", "IN", "dist", "FROM", "build"
            ]),
            ArtifactRule::Match {
                pattern: "foo".into(),
                source_prefix: Some("src".into()),
                dest_side: ArtifactSide::Products,
                dest_prefix: Some("dist".into()),
                dest_step: "build".into(),
            }
        );
    }

    #[test]
    fn unknown_tag_rejected() {
        let err = ArtifactRule::from_tokens(&["FORBID", "x"]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Schema);
    }

    #[test]
    fn wrong_arity_rejected() {
        assert!(ArtifactRule::from_tokens(&["CREATE"]).is_err());
        assert!(ArtifactRule::from_tokens(&["CREATE", "a", "b"]).is_err());
        assert!(ArtifactRule::from_tokens(&["MATCH", "x", "WITH", "STUFF", "FROM", "s"]).is_err());
        assert!(ArtifactRule::from_tokens(&["MATCH", "x", "WITH", "PRODUCTS"]).is_err());
        assert!(ArtifactRule::from_tokens(
            &["MATCH", "x", "WITH", "PRODUCTS", "FROM", "s", "extra"]
        )
        .is_err());
    }

    #[test]
    fn tokens_roundtrip() {
        for tokens in [
            vec!["CREATE", "foo.tar.gz"],
            vec!["MATCH", "foo", "IN", "src", "WITH", "PRODUCTS", "IN", "dist", "FROM", "build"],
            vec!["DISALLOW", "*"],
        ] {
            let rule = ArtifactRule::from_tokens(&tokens).unwrap();
            let out = rule.to_tokens();
            assert_eq!(out, tokens);
            assert_eq!(ArtifactRule::from_tokens(&out).unwrap(), rule);
        }
    }

    #[test]
    fn serde_token_form() {
        let json = r#"["MATCH", "foo.py", "WITH", "PRODUCTS", "FROM", "clone"]"#;
        let rule: ArtifactRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.tag(), "MATCH");
        let out = serde_json::to_string(&rule).unwrap();
        assert_eq!(
            out,
            r#"["MATCH","foo.py","WITH","PRODUCTS","FROM","clone"]"#
        );
    }

    #[test]
    fn serde_structured_form() {
        let json = r#"{"rule_type": "match", "pattern": "foo", "source_prefix": "src",
                       "dest_type": "products", "dest_prefix": "", "dest_name": "build"}"#;
        let rule: ArtifactRule = serde_json::from_str(json).unwrap();
        assert_eq!(
            rule,
            ArtifactRule::Match {
                pattern: "foo".into(),
                source_prefix: Some("src".into()),
                dest_side: ArtifactSide::Products,
                dest_prefix: None,
                dest_step: "build".into(),
            }
        );

        let generic: ArtifactRule =
            serde_json::from_str(r#"{"rule_type": "allow", "pattern": "*.md"}"#).unwrap();
        assert_eq!(
            generic,
            ArtifactRule::Allow {
                pattern: "*.md".into()
            }
        );
    }

    #[test]
    fn serde_rejects_non_string_tokens() {
        assert!(serde_json::from_str::<ArtifactRule>(r#"["ALLOW", 42]"#).is_err());
        assert!(serde_json::from_str::<ArtifactRule>(r#""ALLOW *""#).is_err());
    }

    #[test]
    fn display_joins_tokens() {
        let rule = parse(&["MATCH", "foo", "WITH", "PRODUCTS", "FROM", "clone"]);
        assert_eq!(rule.to_string(), "MATCH foo WITH PRODUCTS FROM clone");
    }
}
