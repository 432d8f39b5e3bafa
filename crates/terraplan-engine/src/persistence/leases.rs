//! SQLite lease store shared between workers.

use crate::cache::{expiry, LeaseStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use terraplan_core::{CacheEntry, CacheKey, PlanError};
use tracing::debug;

#[derive(sqlx::FromRow)]
struct EntryRow {
    location: String,
    created_at: i64,
}

fn db_error(err: sqlx::Error) -> PlanError {
    PlanError::coordination(format!("lease store: {}", err))
}

#[derive(Clone)]
pub struct SqliteLeaseStore {
    pool: SqlitePool,
}

impl SqliteLeaseStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Delete leases whose holders stopped renewing them.
    async fn purge_expired(&self) -> Result<u64, PlanError> {
        let result = sqlx::query("DELETE FROM cache_leases WHERE expires_at <= ?1")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn get_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, PlanError> {
        let row = sqlx::query_as::<_, EntryRow>(
            "SELECT location, created_at FROM cache_entries WHERE cache_key = ?1",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(|row| {
            let created_at = DateTime::<Utc>::from_timestamp_millis(row.created_at)
                .ok_or_else(|| {
                    PlanError::coordination(format!(
                        "entry {} has invalid timestamp {}",
                        key.short(),
                        row.created_at
                    ))
                })?;
            Ok(CacheEntry {
                location: row.location,
                created_at,
            })
        })
        .transpose()
    }

    async fn try_lease(
        &self,
        key: &CacheKey,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, PlanError> {
        let result = sqlx::query(
            r#"
            INSERT INTO cache_leases (cache_key, holder, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(cache_key) DO UPDATE
                SET holder = excluded.holder, expires_at = excluded.expires_at
                WHERE cache_leases.expires_at <= ?4 OR cache_leases.holder = excluded.holder
            "#,
        )
        .bind(key.as_str())
        .bind(holder)
        .bind(expiry(ttl).timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn renew(&self, key: &CacheKey, holder: &str, ttl: Duration) -> Result<bool, PlanError> {
        let result = sqlx::query(
            "UPDATE cache_leases SET expires_at = ?1 WHERE cache_key = ?2 AND holder = ?3",
        )
        .bind(expiry(ttl).timestamp_millis())
        .bind(key.as_str())
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn publish(
        &self,
        key: &CacheKey,
        holder: &str,
        entry: &CacheEntry,
    ) -> Result<(), PlanError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let owned = sqlx::query("DELETE FROM cache_leases WHERE cache_key = ?1 AND holder = ?2")
            .bind(key.as_str())
            .bind(holder)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        if owned.rows_affected() == 0 {
            tx.rollback().await.map_err(db_error)?;
            return Err(PlanError::coordination(format!(
                "{} no longer holds the lease on {}",
                holder,
                key.short()
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO cache_entries (cache_key, location, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(cache_key) DO UPDATE
                SET location = excluded.location, created_at = excluded.created_at
            "#,
        )
        .bind(key.as_str())
        .bind(&entry.location)
        .bind(entry.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn release(&self, key: &CacheKey, holder: &str) -> Result<(), PlanError> {
        sqlx::query("DELETE FROM cache_leases WHERE cache_key = ?1 AND holder = ?2")
            .bind(key.as_str())
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn lease_active(&self, key: &CacheKey) -> Result<bool, PlanError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM cache_leases WHERE cache_key = ?1 AND expires_at > ?2",
        )
        .bind(key.as_str())
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(count > 0)
    }

    async fn prune(&self, max_entries: usize, max_age: Duration) -> Result<u64, PlanError> {
        let leases = self.purge_expired().await?;
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let aged = sqlx::query("DELETE FROM cache_entries WHERE created_at < ?1")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        let overflow = sqlx::query(
            r#"
            DELETE FROM cache_entries WHERE cache_key IN (
                SELECT cache_key FROM cache_entries
                ORDER BY created_at DESC
                LIMIT -1 OFFSET ?1
            )
            "#,
        )
        .bind(i64::try_from(max_entries).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        let removed = aged.rows_affected() + overflow.rows_affected();
        if removed > 0 || leases > 0 {
            debug!(removed, expired_leases = leases, "Pruned lease database");
        }
        Ok(removed)
    }
}
