use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use instancer_common::{Instance, InstanceStatus};
use sqlx::{Pool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{InstanceFilter, InstanceStore, StoreError};

const INSTANCE_COLUMNS: &str = "id, provider, zone, owner, instance_type, is_spot, \
     cpu_count_requested, memory_requested_mib, memory_reserved_mib, gpu_kind, gpu_count, \
     boot_image, boot_disk_gib, local_ssd_gib, persistent_ssd_gib, persistent_hdd_gib, \
     hostname, cpu_platform, created_at, booted_at, started_at, deleted_at, is_deletion_triaged";

/// SQL expression yielding the derived status of a row.
const STATUS_EXPR: &str = "CASE \
     WHEN deleted_at IS NOT NULL THEN 'deleted' \
     WHEN started_at IS NOT NULL THEN 'running' \
     WHEN booted_at IS NOT NULL THEN 'booting' \
     ELSE 'requested' END";

/// SQL expression yielding the instant a row entered its current status.
const STATUS_SINCE_EXPR: &str = "COALESCE(deleted_at, started_at, booted_at, created_at)";

fn status_predicate(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Requested => "deleted_at IS NULL AND booted_at IS NULL",
        InstanceStatus::Booting => {
            "deleted_at IS NULL AND booted_at IS NOT NULL AND started_at IS NULL"
        }
        InstanceStatus::Running => "deleted_at IS NULL AND started_at IS NOT NULL",
        InstanceStatus::Deleted => "deleted_at IS NOT NULL",
    }
}

fn parse_status(raw: &str) -> Result<InstanceStatus, StoreError> {
    InstanceStatus::ALL
        .into_iter()
        .find(|s| s.as_str() == raw)
        .ok_or_else(|| StoreError::Serialization(format!("unknown status '{raw}'")))
}

#[derive(Clone)]
pub struct PgInstanceStore {
    db: Pool<Postgres>,
}

impl PgInstanceStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    /// Record a state transition in instance_state_history. Best effort.
    async fn log_state_transition(
        &self,
        instance_id: Uuid,
        from_status: &str,
        to_status: InstanceStatus,
        reason: &str,
    ) {
        let res = sqlx::query(
            "INSERT INTO instance_state_history (instance_id, from_status, to_status, reason)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(instance_id)
        .bind(from_status)
        .bind(to_status.as_str())
        .bind(reason)
        .execute(&self.db)
        .await;
        if let Err(e) = res {
            tracing::warn!(%instance_id, error = %e, "failed to record state transition");
        }
    }
}

#[async_trait]
impl InstanceStore for PgInstanceStore {
    async fn insert(&self, instance: &Instance) -> Result<(), StoreError> {
        instance.validate_new()?;
        let res = sqlx::query(
            "INSERT INTO instances (
                id, provider, zone, owner, instance_type, is_spot,
                cpu_count_requested, memory_requested_mib, memory_reserved_mib, gpu_kind, gpu_count,
                boot_image, boot_disk_gib, local_ssd_gib, persistent_ssd_gib, persistent_hdd_gib,
                created_at, is_deletion_triaged
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, FALSE)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(instance.id)
        .bind(&instance.provider)
        .bind(&instance.zone)
        .bind(&instance.owner)
        .bind(&instance.instance_type)
        .bind(instance.is_spot)
        .bind(instance.cpu_count_requested)
        .bind(instance.memory_requested_mib)
        .bind(instance.memory_reserved_mib)
        .bind(&instance.gpu_kind)
        .bind(instance.gpu_count)
        .bind(&instance.boot_image)
        .bind(instance.boot_disk_gib)
        .bind(instance.local_ssd_gib)
        .bind(instance.persistent_ssd_gib)
        .bind(instance.persistent_hdd_gib)
        .bind(instance.created_at)
        .execute(&self.db)
        .await?;

        if res.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists { id: instance.id });
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Instance>, StoreError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = $1");
        let row = sqlx::query_as::<_, Instance>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row)
    }

    async fn list(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE TRUE"));
        if let Some(status) = filter.status {
            qb.push(" AND ").push(status_predicate(status));
        }
        if let Some(owner) = &filter.owner {
            qb.push(" AND owner = ").push_bind(owner.clone());
        }
        if let Some(provider) = &filter.provider {
            qb.push(" AND provider = ").push_bind(provider.clone());
        }
        if let Some(at) = filter.entered_before {
            qb.push(" AND ")
                .push(STATUS_SINCE_EXPR)
                .push(" < ")
                .push_bind(at);
        }
        if let Some(triaged) = filter.triaged {
            qb.push(" AND is_deletion_triaged = ").push_bind(triaged);
        }
        qb.push(" ORDER BY created_at, id");

        let rows = qb.build_query_as::<Instance>().fetch_all(&self.db).await?;
        Ok(rows)
    }

    async fn mark_booting(
        &self,
        id: Uuid,
        hostname: &str,
        cpu_platform: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE instances
             SET booted_at = GREATEST(created_at, $2),
                 hostname = $3,
                 cpu_platform = $4
             WHERE id = $1 AND deleted_at IS NULL AND booted_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .bind(hostname)
        .bind(cpu_platform)
        .execute(&self.db)
        .await?;

        if res.rows_affected() == 0 {
            return Ok(false);
        }
        self.log_state_transition(
            id,
            InstanceStatus::Requested.as_str(),
            InstanceStatus::Booting,
            "provider_booted",
        )
        .await;
        Ok(true)
    }

    async fn mark_running(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE instances
             SET started_at = GREATEST(booted_at, $2)
             WHERE id = $1
               AND deleted_at IS NULL
               AND booted_at IS NOT NULL
               AND started_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .execute(&self.db)
        .await?;

        if res.rows_affected() == 0 {
            return Ok(false);
        }
        self.log_state_transition(
            id,
            InstanceStatus::Booting.as_str(),
            InstanceStatus::Running,
            "health_check_passed",
        )
        .await;
        Ok(true)
    }

    async fn mark_deleted(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, StoreError> {
        // Capture the previous status in the same statement for the history row.
        let sql = format!(
            "WITH prev AS (
                SELECT id, {STATUS_EXPR} AS from_status
                FROM instances
                WHERE id = $1 AND deleted_at IS NULL
                FOR UPDATE
             )
             UPDATE instances i
             SET deleted_at = GREATEST(i.created_at, $2)
             FROM prev
             WHERE i.id = prev.id
             RETURNING prev.from_status"
        );
        let from_status: Option<String> = sqlx::query_scalar(&sql)
            .bind(id)
            .bind(at)
            .fetch_optional(&self.db)
            .await?;

        let Some(from_status) = from_status else {
            return Ok(false);
        };
        self.log_state_transition(id, &from_status, InstanceStatus::Deleted, reason)
            .await;
        Ok(true)
    }

    async fn mark_deletion_triaged(&self, id: Uuid, reason: &str) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE instances
             SET is_deletion_triaged = TRUE
             WHERE id = $1 AND deleted_at IS NOT NULL AND NOT is_deletion_triaged",
        )
        .bind(id)
        .execute(&self.db)
        .await?;

        if res.rows_affected() == 0 {
            return Ok(false);
        }
        tracing::debug!(instance_id = %id, reason, "deletion triaged");
        Ok(true)
    }

    async fn count_by_status(&self) -> Result<BTreeMap<InstanceStatus, i64>, StoreError> {
        let sql = format!("SELECT {STATUS_EXPR} AS status, COUNT(*) FROM instances GROUP BY 1");
        let rows: Vec<(String, i64)> = sqlx::query_as(&sql).fetch_all(&self.db).await?;

        let mut counts: BTreeMap<InstanceStatus, i64> =
            InstanceStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for (raw, count) in rows {
            counts.insert(parse_status(&raw)?, count);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_round_trip_through_sql_labels() {
        for status in InstanceStatus::ALL {
            assert_eq!(parse_status(status.as_str()).unwrap(), status);
            assert!(STATUS_EXPR.contains(&format!("'{}'", status.as_str())));
        }
        assert!(matches!(
            parse_status("ready"),
            Err(StoreError::Serialization(_))
        ));
    }
}
