//! Skill Type Definitions
//!
//! Core data structures for the skill system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{Result, SkillError};

/// Maximum length of a category or name segment
pub const MAX_SEGMENT_LEN: usize = 64;

/// Maximum length of a namespace identifier
pub const MAX_NAMESPACE_LEN: usize = 128;

/// Isolation boundary partitioning all skill data by owning agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    /// Validate and wrap an agent identifier
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(SkillError::validation("namespace must not be empty"));
        }
        if value.len() > MAX_NAMESPACE_LEN {
            return Err(SkillError::validation(format!(
                "namespace longer than {} bytes",
                MAX_NAMESPACE_LEN
            )));
        }
        if value == "." || value == ".." {
            return Err(SkillError::validation("namespace must not be a relative path"));
        }
        if value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '/' || c == '\\')
        {
            return Err(SkillError::Validation(format!(
                "namespace contains forbidden characters: {:?}",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Namespace {
    type Error = SkillError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check a category or name segment.
///
/// Segments become directory names and module path components, so only
/// ASCII alphanumerics, underscore and hyphen are accepted.
pub fn validate_segment(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(SkillError::Validation(format!("{} must not be empty", kind)));
    }
    if value.len() > MAX_SEGMENT_LEN {
        return Err(SkillError::Validation(format!(
            "{} '{}' longer than {} characters",
            kind, value, MAX_SEGMENT_LEN
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(SkillError::Validation(format!(
            "Invalid {}: '{}' (allowed: A-Z a-z 0-9 _ -)",
            kind, value
        )));
    }
    Ok(())
}

/// (category, name) pair addressing one skill within a namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SkillIdentity {
    pub category: String,
    pub name: String,
}

impl SkillIdentity {
    /// Build a validated identity
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let identity = Self {
            category: category.into(),
            name: name.into(),
        };
        identity.validate()?;
        Ok(identity)
    }

    /// Parse `category/name`
    pub fn parse(path: &str) -> Result<Self> {
        match path.split_once('/') {
            Some((category, name)) => Self::new(category, name),
            None => Err(SkillError::Validation(format!(
                "expected <category>/<name>, got '{}'",
                path
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_segment("category", &self.category)?;
        validate_segment("name", &self.name)
    }

    /// Python import path of the materialized package
    pub fn module_path(&self) -> String {
        format!("skills.{}.{}", self.category, self.name)
    }
}

impl fmt::Display for SkillIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.name)
    }
}

/// One external tool invocation detected in skill source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityRef {
    pub server: String,
    pub tool: String,
}

impl CapabilityRef {
    pub fn new(server: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
        }
    }
}

impl fmt::Display for CapabilityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.server, self.tool)
    }
}

/// Authoritative skill row as held by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillRecord {
    pub namespace: Namespace,
    pub category: String,
    pub name: String,
    /// Executable code body
    pub source: String,
    /// Module docstring, empty when absent
    pub description: String,
    pub tags: BTreeSet<String>,
    /// Capability references in first-occurrence order
    pub dependencies: Vec<CapabilityRef>,
    /// Successful invocations so far
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SkillRecord {
    pub fn identity(&self) -> SkillIdentity {
        SkillIdentity {
            category: self.category.clone(),
            name: self.name.clone(),
        }
    }

    /// Hex SHA-256 of the source text
    pub fn source_sha256(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Per-namespace skill counts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillStats {
    pub total_skills: u64,
    pub by_category: BTreeMap<String, u64>,
}

/// Trim tags, drop empties, collapse duplicates
pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_validation() {
        assert!(validate_segment("name", "add_three").is_ok());
        assert!(validate_segment("name", "data-sync2").is_ok());
        assert!(validate_segment("name", "").is_err());
        assert!(validate_segment("name", "../etc").is_err());
        assert!(validate_segment("name", "has space").is_err());
        assert!(validate_segment("name", "émoji").is_err());
        assert!(validate_segment("name", &"x".repeat(MAX_SEGMENT_LEN + 1)).is_err());
    }

    #[test]
    fn test_namespace_rules() {
        assert!(Namespace::new("agent-1").is_ok());
        assert!(Namespace::new("").is_err());
        assert!(Namespace::new("   ").is_err());
        assert!(Namespace::new("a/b").is_err());
        assert!(Namespace::new("tab\there").is_err());
        assert!(Namespace::new("..").is_err());
    }

    #[test]
    fn test_identity_parse() {
        let id = SkillIdentity::parse("math/add_three").unwrap();
        assert_eq!(id.category, "math");
        assert_eq!(id.name, "add_three");
        assert_eq!(id.module_path(), "skills.math.add_three");
        assert_eq!(id.to_string(), "math/add_three");

        assert!(SkillIdentity::parse("no_slash").is_err());
        assert!(SkillIdentity::parse("math/a/b").is_err());
    }

    #[test]
    fn test_normalize_tags() {
        let tags = normalize_tags(["  b", "a", "", "b "]);
        assert_eq!(tags.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_namespace_serde_rejects_empty() {
        let ok: std::result::Result<Namespace, _> = serde_json::from_str("\"agent-1\"");
        assert!(ok.is_ok());
        let bad: std::result::Result<Namespace, _> = serde_json::from_str("\"\"");
        assert!(bad.is_err());
    }
}
