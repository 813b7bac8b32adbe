//! Registration status conditions
//!
//! Conditions are kept in a map keyed by type so that there is exactly one
//! entry per type. They serialize as an array, sorted by type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// `NameConflict=False` reason
pub const REASON_NO_CONFLICTS: &str = "NoConflicts";

/// `NameConflict=True` reason
pub const REASON_CONFLICTING_NAME: &str = "ConflictingName";

/// `Terminating=True` reason
pub const REASON_INSTANCE_DELETION: &str = "InstanceDeletionInProgress";

/// Condition types a registration can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    /// One of the claimed identifiers is owned by another accepted registration
    NameConflict,
    /// Deletion requested; instances are being drained
    Terminating,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameConflict => write!(f, "NameConflict"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Tri-state condition status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }
}

/// A single observed status fact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    pub status: ConditionStatus,

    /// Last time the condition was written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<DateTime<Utc>>,

    /// Last time `status` changed value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Machine-readable reason for the last transition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable details
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Conditions keyed by type
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Condition>", into = "Vec<Condition>")]
pub struct Conditions {
    entries: BTreeMap<ConditionType, Condition>,
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, type_: ConditionType) -> Option<&Condition> {
        self.entries.get(&type_)
    }

    /// Status of the given condition, `Unknown` if absent
    pub fn status(&self, type_: ConditionType) -> ConditionStatus {
        self.get(type_).map(|c| c.status).unwrap_or_default()
    }

    pub fn is_true(&self, type_: ConditionType) -> bool {
        self.status(type_) == ConditionStatus::True
    }

    pub fn is_false(&self, type_: ConditionType) -> bool {
        self.status(type_) == ConditionStatus::False
    }

    /// Write a condition.
    ///
    /// `last_transition_time` only moves when `status` changes. Returns false
    /// (and leaves the probe time alone) when status, reason and message are
    /// all unchanged, so callers can skip redundant writes.
    pub fn set(
        &mut self,
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let reason = reason.into();
        let message = message.into();

        match self.entries.get_mut(&type_) {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                {
                    return false;
                }
                if existing.status != status {
                    existing.last_transition_time = Some(now);
                }
                existing.status = status;
                existing.reason = reason;
                existing.message = message;
                existing.last_probe_time = Some(now);
                true
            }
            None => {
                self.entries.insert(
                    type_,
                    Condition {
                        type_,
                        status,
                        last_probe_time: Some(now),
                        last_transition_time: Some(now),
                        reason,
                        message,
                    },
                );
                true
            }
        }
    }

    /// Replace the entry of the condition's type wholesale
    pub fn upsert(&mut self, condition: Condition) -> Option<Condition> {
        self.entries.insert(condition.type_, condition)
    }

    pub fn remove(&mut self, type_: ConditionType) -> Option<Condition> {
        self.entries.remove(&type_)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<Condition>> for Conditions {
    fn from(list: Vec<Condition>) -> Self {
        // Later entries of the same type win.
        let entries = list.into_iter().map(|c| (c.type_, c)).collect();
        Self { entries }
    }
}

impl From<Conditions> for Vec<Condition> {
    fn from(conditions: Conditions) -> Self {
        conditions.entries.into_values().collect()
    }
}

/// Registration status, written only by the control plane
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationStatus {
    #[serde(default)]
    pub conditions: Conditions,
}

impl RegistrationStatus {
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}
