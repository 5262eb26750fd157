//! Observed state of a build job, as held by the resource store.

use crate::{BuildRequest, ConditionStatus, ConditionType, JobName, Uid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity metadata of a stored resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Resource name.
    pub name: JobName,

    /// Namespace the resource lives in.
    pub namespace: String,

    /// Object identity, assigned by the store on create.
    pub uid: Option<Uid>,

    /// Optimistic concurrency token, bumped by the store on every write.
    pub resource_version: u64,

    /// When the store created the object.
    pub created_at: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Metadata for an object that has not been stored yet.
    pub fn new(name: JobName, namespace: impl Into<String>) -> Self {
        Self {
            name,
            namespace: namespace.into(),
            uid: None,
            resource_version: 0,
            created_at: None,
        }
    }
}

/// A named tri-state condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Condition name.
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    /// Current value.
    pub status: ConditionStatus,

    /// Human readable detail, usually set when the status is False.
    pub message: Option<String>,

    /// When the status last changed.
    pub last_transition: DateTime<Utc>,
}

/// Status written by the build controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatus {
    /// Counter of the most recent build attempt, if any has started.
    pub latest_build: Option<u64>,

    /// Named conditions.
    pub conditions: Vec<Condition>,
}

impl BuildStatus {
    /// Get a condition by name.
    pub fn condition(&self, condition_type: &ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| &c.condition_type == condition_type)
    }

    /// Value of a condition, `Unknown` when absent.
    pub fn condition_status(&self, condition_type: &ConditionType) -> ConditionStatus {
        self.condition(condition_type)
            .map(|c| c.status)
            .unwrap_or_default()
    }

    /// Set a condition, keeping its transition time when the value is unchanged.
    pub fn set_condition(
        &mut self,
        condition_type: ConditionType,
        status: ConditionStatus,
        message: Option<String>,
    ) {
        let now = Utc::now();
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition = now;
                }
                existing.status = status;
                existing.message = message;
            }
            None => self.conditions.push(Condition {
                condition_type,
                status,
                message,
                last_transition: now,
            }),
        }
    }
}

/// A build request together with its observed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Identity metadata.
    pub meta: ObjectMeta,

    /// Mirror of the submitted request.
    pub spec: BuildRequest,

    /// Controller-written status.
    pub status: BuildStatus,
}

impl BuildRecord {
    /// A not-yet-stored record for a request.
    pub fn from_request(request: BuildRequest) -> Self {
        Self {
            meta: ObjectMeta::new(request.name.clone(), request.namespace.clone()),
            spec: request,
            status: BuildStatus::default(),
        }
    }

    /// Replace the spec, keeping identity metadata and status.
    pub fn with_spec(&self, request: BuildRequest) -> Self {
        Self {
            meta: self.meta.clone(),
            spec: request,
            status: self.status.clone(),
        }
    }

    /// Resource name.
    pub fn name(&self) -> &JobName {
        &self.meta.name
    }

    /// Returns true if the `Ready` condition is True.
    pub fn is_ready(&self) -> bool {
        self.status
            .condition_status(&ConditionType::ready())
            .is_true()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BuilderRef, SourceRef};

    fn request(name: &str) -> BuildRequest {
        BuildRequest::for_go_command(
            JobName::new(name),
            "default",
            "registry.local",
            SourceRef::new("registry.local/source@sha256:00"),
            BuilderRef::cluster_builder("default-builder"),
        )
    }

    #[test]
    fn test_with_spec_preserves_identity() {
        let mut stored = BuildRecord::from_request(request("controller"));
        stored.meta.uid = Some(Uid::generate());
        stored.meta.resource_version = 4;
        stored.status.latest_build = Some(2);

        let mut changed = request("controller");
        changed.tag = "registry.local/other".to_string();
        let replaced = stored.with_spec(changed.clone());

        assert_eq!(replaced.meta, stored.meta);
        assert_eq!(replaced.status, stored.status);
        assert_eq!(replaced.spec, changed);
    }

    #[test]
    fn test_conditions() {
        let mut record = BuildRecord::from_request(request("webhook"));
        assert!(!record.is_ready());
        assert_eq!(
            record.status.condition_status(&ConditionType::ready()),
            ConditionStatus::Unknown
        );

        record
            .status
            .set_condition(ConditionType::ready(), ConditionStatus::False, Some("boom".into()));
        assert!(!record.is_ready());

        record
            .status
            .set_condition(ConditionType::ready(), ConditionStatus::True, None);
        assert!(record.is_ready());
        assert_eq!(record.status.conditions.len(), 1);
        assert!(record.status.condition(&ConditionType::ready()).unwrap().message.is_none());
    }
}
