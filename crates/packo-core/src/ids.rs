//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::CoreError;

/// Maximum length of a resource name (DNS-1123 label).
const MAX_NAME_LEN: usize = 63;

/// Name of a build job. Unique within a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobName(String);

impl JobName {
    /// Create a new JobName without validation.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Parse a JobName, rejecting anything that is not a lowercase DNS-1123 label.
    pub fn parse(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        let invalid = |reason: &str| CoreError::InvalidJobName {
            name: name.clone(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(invalid("must be at most 63 characters"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid("must contain only lowercase letters, digits and '-'"));
        }
        if name.starts_with('-') || name.ends_with('-') {
            return Err(invalid("must start and end with an alphanumeric character"));
        }

        Ok(Self(name))
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Stable object identity assigned by the resource store on create.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid(String);

impl Uid {
    /// Create a new Uid from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random Uid.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_generate() {
        let id1 = Uid::generate();
        let id2 = Uid::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_job_name_display() {
        let name = JobName::new("build-init");
        assert_eq!(format!("{}", name), "build-init");
    }

    #[test]
    fn test_job_name_parse_accepts_labels() {
        for name in ["controller", "build-init", "rebase", "webhook", "completion", "a1"] {
            assert!(JobName::parse(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_job_name_parse_rejects_invalid() {
        for name in ["", "-lead", "trail-", "Upper", "under_score", "dot.ted"] {
            assert!(
                matches!(JobName::parse(name), Err(CoreError::InvalidJobName { .. })),
                "{name:?} should be rejected"
            );
        }
        assert!(JobName::parse("a".repeat(64)).is_err());
    }
}
