// ABOUTME: Persisted OAuth token records and their SQLite repository
// ABOUTME: Upsert, conditional refresh writes, eviction-aware reads, and full scans

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::{debug, warn};

use warden_core::{from_epoch_millis, to_epoch_millis, TokenKey};
use warden_security::EncryptedBlob;

use crate::error::{StorageError, StorageResult};

/// Token record as it is laid out in the database, secrets still encrypted
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRecord {
    pub provider: String,
    pub user_id: String,
    pub access_token: EncryptedBlob,
    pub refresh_token: Option<EncryptedBlob>,
    pub token_type: String,
    pub scope: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub refresh_count: u32,
    pub provider_metadata: serde_json::Map<String, serde_json::Value>,
    /// Moment after which the record is treated as gone
    pub evict_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn key(&self) -> TokenKey {
        TokenKey::new(&self.provider, &self.user_id)
    }
}

/// Result of a conditional refresh write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The record matched the expected refresh count and was replaced
    Updated,
    /// No record exists for the key (removed while the refresh ran)
    Missing,
    /// The record exists but another writer moved its refresh count
    Conflict,
}

/// Durable keyed storage for token records
#[async_trait]
pub trait TokenRepository: Send + Sync {
    /// Insert or overwrite the record for its key
    async fn upsert(&self, record: &TokenRecord) -> StorageResult<()>;

    /// Replace the record only if its refresh count still equals `expected_refresh_count`
    async fn compare_and_swap(
        &self,
        record: &TokenRecord,
        expected_refresh_count: u32,
    ) -> StorageResult<CasOutcome>;

    /// Fetch a record that has not been evicted as of `now`
    async fn fetch(&self, key: &TokenKey, now: DateTime<Utc>) -> StorageResult<Option<TokenRecord>>;

    /// Delete a record, returning whether one existed
    async fn delete(&self, key: &TokenKey) -> StorageResult<bool>;

    /// All records not evicted as of `now`
    async fn list(&self, now: DateTime<Utc>) -> StorageResult<Vec<TokenRecord>>;

    /// Drop records whose eviction time has passed
    async fn purge_evicted(&self, now: DateTime<Utc>) -> StorageResult<u64>;

    /// Release underlying connections
    async fn close(&self);
}

/// SQLite implementation of [`TokenRepository`]
#[derive(Clone)]
pub struct SqliteTokenRepository {
    pool: SqlitePool,
}

impl SqliteTokenRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_record(row: &SqliteRow) -> StorageResult<TokenRecord> {
        let provider: String = row.try_get("provider")?;
        let user_id: String = row.try_get("user_id")?;
        let corrupt = |reason: String| StorageError::CorruptRecord {
            key: format!("{}:{}", provider, user_id),
            reason,
        };

        let access_json: String = row.try_get("access_token")?;
        let access_token = EncryptedBlob::from_json(&access_json)
            .map_err(|e| corrupt(format!("access token: {}", e)))?;

        let refresh_json: Option<String> = row.try_get("refresh_token")?;
        let refresh_token = refresh_json
            .map(|json| EncryptedBlob::from_json(&json))
            .transpose()
            .map_err(|e| corrupt(format!("refresh token: {}", e)))?;

        let scope_json: String = row.try_get("scope")?;
        let scope: Vec<String> = serde_json::from_str(&scope_json)?;

        let metadata_json: String = row.try_get("provider_metadata")?;
        let provider_metadata = serde_json::from_str(&metadata_json)?;

        let refresh_count: i64 = row.try_get("refresh_count")?;
        let last_refreshed_at: Option<i64> = row.try_get("last_refreshed_at")?;

        Ok(TokenRecord {
            access_token,
            refresh_token,
            token_type: row.try_get("token_type")?,
            scope,
            issued_at: from_epoch_millis(row.try_get("issued_at")?),
            expires_at: from_epoch_millis(row.try_get("expires_at")?),
            last_refreshed_at: last_refreshed_at.map(from_epoch_millis),
            refresh_count: u32::try_from(refresh_count)
                .map_err(|_| corrupt(format!("refresh_count {}", refresh_count)))?,
            provider_metadata,
            evict_at: from_epoch_millis(row.try_get("evict_at")?),
            provider,
            user_id,
        })
    }
}

/// Column values shared by the insert and conditional update statements
struct EncodedRecord {
    access_token: String,
    refresh_token: Option<String>,
    scope: String,
    metadata: String,
}

fn encode(record: &TokenRecord) -> StorageResult<EncodedRecord> {
    let corrupt = |reason: String| StorageError::CorruptRecord {
        key: record.key().to_string(),
        reason,
    };
    Ok(EncodedRecord {
        access_token: record
            .access_token
            .to_json()
            .map_err(|e| corrupt(e.to_string()))?,
        refresh_token: record
            .refresh_token
            .as_ref()
            .map(EncryptedBlob::to_json)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?,
        scope: serde_json::to_string(&record.scope)?,
        metadata: serde_json::to_string(&record.provider_metadata)?,
    })
}

const SELECT_COLUMNS: &str = r#"
    SELECT provider, user_id, access_token, refresh_token, token_type, scope,
           issued_at, expires_at, last_refreshed_at, refresh_count,
           provider_metadata, evict_at
    FROM oauth_tokens
"#;

#[async_trait]
impl TokenRepository for SqliteTokenRepository {
    async fn upsert(&self, record: &TokenRecord) -> StorageResult<()> {
        debug!("Upserting token record {}", record.key());
        let encoded = encode(record)?;
        let now = to_epoch_millis(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO oauth_tokens (
                provider, user_id, access_token, refresh_token, token_type, scope,
                issued_at, expires_at, last_refreshed_at, refresh_count,
                provider_metadata, evict_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(provider, user_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_type = excluded.token_type,
                scope = excluded.scope,
                issued_at = excluded.issued_at,
                expires_at = excluded.expires_at,
                last_refreshed_at = excluded.last_refreshed_at,
                refresh_count = excluded.refresh_count,
                provider_metadata = excluded.provider_metadata,
                evict_at = excluded.evict_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.provider)
        .bind(&record.user_id)
        .bind(&encoded.access_token)
        .bind(&encoded.refresh_token)
        .bind(&record.token_type)
        .bind(&encoded.scope)
        .bind(to_epoch_millis(record.issued_at))
        .bind(to_epoch_millis(record.expires_at))
        .bind(record.last_refreshed_at.map(to_epoch_millis))
        .bind(i64::from(record.refresh_count))
        .bind(&encoded.metadata)
        .bind(to_epoch_millis(record.evict_at))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn compare_and_swap(
        &self,
        record: &TokenRecord,
        expected_refresh_count: u32,
    ) -> StorageResult<CasOutcome> {
        let encoded = encode(record)?;

        let result = sqlx::query(
            r#"
            UPDATE oauth_tokens SET
                access_token = ?,
                refresh_token = ?,
                token_type = ?,
                scope = ?,
                issued_at = ?,
                expires_at = ?,
                last_refreshed_at = ?,
                refresh_count = ?,
                provider_metadata = ?,
                evict_at = ?,
                updated_at = ?
            WHERE provider = ? AND user_id = ? AND refresh_count = ?
            "#,
        )
        .bind(&encoded.access_token)
        .bind(&encoded.refresh_token)
        .bind(&record.token_type)
        .bind(&encoded.scope)
        .bind(to_epoch_millis(record.issued_at))
        .bind(to_epoch_millis(record.expires_at))
        .bind(record.last_refreshed_at.map(to_epoch_millis))
        .bind(i64::from(record.refresh_count))
        .bind(&encoded.metadata)
        .bind(to_epoch_millis(record.evict_at))
        .bind(to_epoch_millis(Utc::now()))
        .bind(&record.provider)
        .bind(&record.user_id)
        .bind(i64::from(expected_refresh_count))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(CasOutcome::Updated);
        }

        let exists = sqlx::query("SELECT 1 FROM oauth_tokens WHERE provider = ? AND user_id = ?")
            .bind(&record.provider)
            .bind(&record.user_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();

        let outcome = if exists {
            CasOutcome::Conflict
        } else {
            CasOutcome::Missing
        };
        warn!(
            "Conditional write for {} skipped: {:?}",
            record.key(),
            outcome
        );
        Ok(outcome)
    }

    async fn fetch(&self, key: &TokenKey, now: DateTime<Utc>) -> StorageResult<Option<TokenRecord>> {
        let query = format!(
            "{} WHERE provider = ? AND user_id = ? AND evict_at > ?",
            SELECT_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(&key.provider)
            .bind(&key.user_id)
            .bind(to_epoch_millis(now))
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn delete(&self, key: &TokenKey) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM oauth_tokens WHERE provider = ? AND user_id = ?")
            .bind(&key.provider)
            .bind(&key.user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, now: DateTime<Utc>) -> StorageResult<Vec<TokenRecord>> {
        let query = format!(
            "{} WHERE evict_at > ? ORDER BY provider, user_id",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(to_epoch_millis(now))
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::row_to_record(row) {
                Ok(record) => records.push(record),
                // One unreadable row must not hide the rest of the scan
                Err(StorageError::CorruptRecord { key, reason }) => {
                    warn!("Skipping corrupt token record {}: {}", key, reason);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn purge_evicted(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM oauth_tokens WHERE evict_at <= ?")
            .bind(to_epoch_millis(now))
            .execute(&self.pool)
            .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            debug!("Purged {} evicted token records", purged);
        }
        Ok(purged)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
