use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::state::{CheckoutState, SagaContext, SagaRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Saga not found: {0}")]
    NotFound(Uuid),

    #[error("Conditional update conflict for saga {0}")]
    Conflict(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt saga row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable storage of saga records.
///
/// `update` is fenced on the record's version: two concurrent updaters of
/// the same saga cannot both succeed, and `processed_event_ids` always lands
/// in the same write as `state` and `context`.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Create the schema if absent.
    async fn bootstrap(&self) -> StoreResult<()>;

    /// Insert a new record; `Conflict` if the saga id already exists.
    async fn create(&self, record: &SagaRecord) -> StoreResult<()>;

    async fn load(&self, saga_id: Uuid) -> StoreResult<SagaRecord>;

    /// Persist `record` (whose version is `expected_version + 1`) only if
    /// the stored version still equals `expected_version`.
    async fn update(&self, record: &SagaRecord, expected_version: i64) -> StoreResult<()>;

    /// Non-terminal sagas untouched since `older_than`, oldest first.
    async fn find_stale(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<SagaRecord>>;
}

/// Saga record as stored in the `sagas` relation.
#[derive(Debug, Clone, sqlx::FromRow)]
struct SagaRow {
    saga_id: Uuid,
    user_id: Uuid,
    cart_id: Uuid,
    state: String,
    context: serde_json::Value,
    processed_event_ids: serde_json::Value,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SagaRow {
    fn from_record(record: &SagaRecord) -> StoreResult<Self> {
        Ok(Self {
            saga_id: record.saga_id,
            user_id: record.user_id,
            cart_id: record.cart_id,
            state: record.state.to_string(),
            context: serde_json::to_value(&record.context)?,
            processed_event_ids: serde_json::to_value(&record.processed_event_ids)?,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    fn into_record(self) -> StoreResult<SagaRecord> {
        let state = CheckoutState::from_str(&self.state).map_err(StoreError::Corrupt)?;
        let context: SagaContext = serde_json::from_value(self.context)?;
        let processed_event_ids: BTreeSet<Uuid> =
            serde_json::from_value(self.processed_event_ids)?;

        Ok(SagaRecord {
            saga_id: self.saga_id,
            user_id: self.user_id,
            cart_id: self.cart_id,
            state,
            context,
            processed_event_ids,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// PostgreSQL implementation of `SagaStore`.
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn bootstrap(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sagas (
                saga_id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                cart_id UUID NOT NULL,
                state TEXT NOT NULL,
                context JSONB NOT NULL,
                processed_event_ids JSONB NOT NULL,
                version BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sagas_state_updated_at ON sagas (state, updated_at)",
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("Saga table bootstrapped");
        Ok(())
    }

    async fn create(&self, record: &SagaRecord) -> StoreResult<()> {
        let row = SagaRow::from_record(record)?;

        let result = sqlx::query(
            r#"
            INSERT INTO sagas (
                saga_id, user_id, cart_id, state, context,
                processed_event_ids, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (saga_id) DO NOTHING
            "#,
        )
        .bind(row.saga_id)
        .bind(row.user_id)
        .bind(row.cart_id)
        .bind(&row.state)
        .bind(&row.context)
        .bind(&row.processed_event_ids)
        .bind(row.version)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(record.saga_id));
        }

        tracing::info!(saga_id = %record.saga_id, "Saga record created");
        Ok(())
    }

    async fn load(&self, saga_id: Uuid) -> StoreResult<SagaRecord> {
        let row: SagaRow = sqlx::query_as(
            r#"
            SELECT saga_id, user_id, cart_id, state, context,
                   processed_event_ids, version, created_at, updated_at
            FROM sagas
            WHERE saga_id = $1
            "#,
        )
        .bind(saga_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(saga_id))?;

        row.into_record()
    }

    async fn update(&self, record: &SagaRecord, expected_version: i64) -> StoreResult<()> {
        let row = SagaRow::from_record(record)?;

        let result = sqlx::query(
            r#"
            UPDATE sagas
            SET state = $2, context = $3, processed_event_ids = $4,
                version = $5, updated_at = $6
            WHERE saga_id = $1 AND version = $7
            "#,
        )
        .bind(row.saga_id)
        .bind(&row.state)
        .bind(&row.context)
        .bind(&row.processed_event_ids)
        .bind(row.version)
        .bind(row.updated_at)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(record.saga_id));
        }

        tracing::debug!(
            saga_id = %record.saga_id,
            state = %record.state,
            version = record.version,
            "Saga record updated"
        );
        Ok(())
    }

    async fn find_stale(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<SagaRecord>> {
        let rows: Vec<SagaRow> = sqlx::query_as(
            r#"
            SELECT saga_id, user_id, cart_id, state, context,
                   processed_event_ids, version, created_at, updated_at
            FROM sagas
            WHERE state NOT IN ('COMPLETED', 'FAILED') AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SagaRow::into_record).collect()
    }
}

/// In-memory implementation with the same conditional-update semantics.
/// Backs the USE_IN_MEMORY_DB shim and the test suites.
#[derive(Default)]
pub struct InMemorySagaStore {
    records: RwLock<HashMap<Uuid, SagaRecord>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn bootstrap(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn create(&self, record: &SagaRecord) -> StoreResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.saga_id) {
            return Err(StoreError::Conflict(record.saga_id));
        }
        records.insert(record.saga_id, record.clone());
        Ok(())
    }

    async fn load(&self, saga_id: Uuid) -> StoreResult<SagaRecord> {
        self.records
            .read()
            .await
            .get(&saga_id)
            .cloned()
            .ok_or(StoreError::NotFound(saga_id))
    }

    async fn update(&self, record: &SagaRecord, expected_version: i64) -> StoreResult<()> {
        let mut records = self.records.write().await;
        match records.get(&record.saga_id) {
            None => Err(StoreError::NotFound(record.saga_id)),
            Some(existing) if existing.version != expected_version => {
                Err(StoreError::Conflict(record.saga_id))
            }
            Some(_) => {
                records.insert(record.saga_id, record.clone());
                Ok(())
            }
        }
    }

    async fn find_stale(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<SagaRecord>> {
        let records = self.records.read().await;
        let mut stale: Vec<SagaRecord> = records
            .values()
            .filter(|r| !r.is_terminal() && r.updated_at < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.updated_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use domain::cart::{CartDetails, CartItem};

    fn record() -> SagaRecord {
        SagaRecord::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            CartDetails {
                items: vec![CartItem {
                    product_id: Uuid::new_v4().to_string(),
                    quantity: 1,
                    unit_price_cents: 100,
                }],
                total_price: 100,
            },
        )
    }

    #[test]
    fn test_row_round_trip() {
        let mut original = record();
        original.processed_event_ids.insert(Uuid::new_v4());
        original.record_error("payment", "declined");

        let row = SagaRow::from_record(&original).unwrap();
        assert_eq!(row.state, "INITIATED");

        let restored = row.into_record().unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_corrupt_state_rejected() {
        let mut row = SagaRow::from_record(&record()).unwrap();
        row.state = "LIMBO".to_string();
        assert!(matches!(row.into_record(), Err(StoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_in_memory_create_conflict() {
        let store = InMemorySagaStore::new();
        let record = record();

        store.create(&record).await.unwrap();
        let err = store.create(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_in_memory_load_not_found() {
        let store = InMemorySagaStore::new();
        let err = store.load(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_in_memory_conditional_update() {
        let store = InMemorySagaStore::new();
        let record = record();
        store.create(&record).await.unwrap();

        let mut updated = record.clone();
        updated.version = 2;
        updated.context.current_step = "INVENTORY_RESERVATION_SENT".to_string();
        store.update(&updated, 1).await.unwrap();

        // A second updater holding the old version loses.
        let mut racer = record.clone();
        racer.version = 2;
        let err = store.update(&racer, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let loaded = store.load(record.saga_id).await.unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.context.current_step, "INVENTORY_RESERVATION_SENT");
    }

    #[tokio::test]
    async fn test_find_stale_skips_terminal_and_fresh() {
        let store = InMemorySagaStore::new();

        let mut stuck = record();
        stuck.updated_at = Utc::now() - Duration::minutes(30);
        store.create(&stuck).await.unwrap();

        let mut done = record();
        done.state = CheckoutState::Completed;
        done.updated_at = Utc::now() - Duration::minutes(30);
        store.create(&done).await.unwrap();

        let fresh = record();
        store.create(&fresh).await.unwrap();

        let cutoff = Utc::now() - Duration::minutes(5);
        let stale = store.find_stale(cutoff, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].saga_id, stuck.saga_id);
    }
}
