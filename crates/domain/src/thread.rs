use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Active,
    Archived,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadStatus::Active => "active",
            ThreadStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ThreadStatus::Active),
            "archived" => Some(ThreadStatus::Archived),
            _ => None,
        }
    }
}

/// How events on this thread are driven.
///
/// `Immediate` threads get a worker as soon as an event is enqueued;
/// `Deferred` threads accumulate events until something starts a worker
/// explicitly (batch processing, scheduled drains).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadMode {
    Immediate,
    Deferred,
}

impl ThreadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadMode::Immediate => "immediate",
            ThreadMode::Deferred => "deferred",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "immediate" => Some(ThreadMode::Immediate),
            "deferred" => Some(ThreadMode::Deferred),
            _ => None,
        }
    }
}

/// A conversation: the unit of worker exclusivity.
///
/// Invariant: `worker_locked_by` is `None` exactly when the lease is
/// absent or expired (`worker_lease_expires_at` null or in the past).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    /// Caller-stable lookup key; `id` is the internal ULID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    pub status: ThreadStatus,
    pub mode: ThreadMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_locked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    /// Whether a live lease is currently held (by anyone).
    pub fn lease_held_at(&self, now: DateTime<Utc>) -> bool {
        self.worker_locked_by.is_some()
            && self.worker_lease_expires_at.is_some_and(|t| t > now)
    }
}

/// Caller-supplied thread description used by find-or-create.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ThreadMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl ThreadSpec {
    pub fn by_external_id(external_id: impl Into<String>) -> Self {
        Self {
            external_id: Some(external_id.into()),
            ..Default::default()
        }
    }
}
