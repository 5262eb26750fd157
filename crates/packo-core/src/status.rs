//! Condition values and build attempt selection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tri-state value of a named condition on a build record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// The controller has not decided yet.
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Returns true if the condition holds.
    pub fn is_true(&self) -> bool {
        matches!(self, Self::True)
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Name of a condition, e.g. `Ready`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionType(String);

impl ConditionType {
    /// The condition a build controller sets once the latest build succeeded.
    pub const READY: &'static str = "Ready";

    /// Create a new condition type.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The `Ready` condition.
    pub fn ready() -> Self {
        Self::new(Self::READY)
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConditionType {
    fn default() -> Self {
        Self::ready()
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which build attempt of a job to stream logs for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptSelector {
    /// Whatever attempt is most recent when the stream opens.
    #[default]
    Latest,
    /// A specific build counter value.
    Build(u64),
}

impl AttemptSelector {
    /// Select the attempt an upsert is expected to trigger.
    ///
    /// `latest_build` is the counter carried by the post-write record. The
    /// controller increments it asynchronously, so `latest + 1` can name an
    /// attempt that never starts when the write did not change the spec.
    pub fn next_after(latest_build: Option<u64>) -> Self {
        match latest_build {
            Some(n) => Self::Build(n + 1),
            None => Self::Latest,
        }
    }
}

impl fmt::Display for AttemptSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Build(n) => write!(f, "#{}", n),
        }
    }
}
