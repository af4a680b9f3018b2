//! Persistence of instance records.
//!
//! Status is never stored: it is derived from the record's timestamps, and
//! every mutation below is a guarded update that only applies when the record
//! is in the expected status. Callers learn whether anything changed through
//! the returned `bool`, which is what makes every workflow step idempotent.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use instancer_common::{Instance, InstanceStatus, ValidationError};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryInstanceStore;
pub use postgres::PgInstanceStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid instance record: {0}")]
    Validation(#[from] ValidationError),
    #[error("instance {id} already exists")]
    AlreadyExists { id: Uuid },
    #[error("corrupt instance record: {0}")]
    Serialization(String),
}

/// Conjunctive filter over instance records. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceFilter {
    pub status: Option<InstanceStatus>,
    pub owner: Option<String>,
    pub provider: Option<String>,
    /// Only records that entered their current status strictly before this instant.
    pub entered_before: Option<DateTime<Utc>>,
    pub triaged: Option<bool>,
}

impl InstanceFilter {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn entered_before(mut self, at: DateTime<Utc>) -> Self {
        self.entered_before = Some(at);
        self
    }

    pub fn triaged(mut self, triaged: bool) -> Self {
        self.triaged = Some(triaged);
        self
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        if let Some(status) = self.status {
            if instance.status() != status {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if &instance.owner != owner {
                return false;
            }
        }
        if let Some(provider) = &self.provider {
            if &instance.provider != provider {
                return false;
            }
        }
        if let Some(at) = self.entered_before {
            if instance.status_since() >= at {
                return false;
            }
        }
        if let Some(triaged) = self.triaged {
            if instance.is_deletion_triaged != triaged {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Validates and persists a new record. Fails with `AlreadyExists` on id reuse.
    async fn insert(&self, instance: &Instance) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Instance>, StoreError>;

    /// Records matching `filter`, oldest first.
    async fn list(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, StoreError>;

    /// Requested -> Booting.
    async fn mark_booting(
        &self,
        id: Uuid,
        hostname: &str,
        cpu_platform: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Booting -> Running.
    async fn mark_running(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Any live status -> Deleted. `reason` is kept in the transition history.
    async fn mark_deleted(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, StoreError>;

    /// Deleted and untriaged -> triaged. One way.
    async fn mark_deletion_triaged(&self, id: Uuid, reason: &str) -> Result<bool, StoreError>;

    async fn count_by_status(&self) -> Result<BTreeMap<InstanceStatus, i64>, StoreError>;
}
