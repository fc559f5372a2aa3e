use async_trait::async_trait;
use metrics::counter;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::TableName;
use crate::conform::ConformedRecord;
use crate::pipeline::RecordSink;

/// Capacity of the `producer_id` column.
pub const PRODUCER_ID_MAX_CHARS: usize = 200;

/// Enumeration of errors for operations with PersistenceSink.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

fn query_error(command: &str) -> impl FnOnce(sqlx::Error) -> PersistenceError + '_ {
    move |error| PersistenceError::QueryError {
        command: command.to_owned(),
        error,
    }
}

/// A stored record. Rows are only ever appended.
#[derive(sqlx::FromRow, Debug)]
pub struct PersistedRow {
    pub id: i64,
    pub producer_id: Option<String>,
    pub info: sqlx::types::Json<Value>,
}

/// Append-only storage of conformed records, one row per record, in a PostgreSQL table.
pub struct PersistenceSink {
    table: TableName,
    pool: PgPool,
}

impl PersistenceSink {
    /// Connect to PostgreSQL. Does not create the table, see `ensure_schema`.
    pub async fn new(
        table: TableName,
        url: &str,
        max_connections: u32,
    ) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| PersistenceError::ConnectionError { error })?;

        Ok(Self::from_pool(table, pool))
    }

    pub fn from_pool(table: TableName, pool: PgPool) -> Self {
        Self { table, pool }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Create the table and its producer index unless they already exist.
    /// Safe to call any number of times, including from concurrent processes.
    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| PersistenceError::ConnectionError { error })?;

        // Bootstraps of the same table queue up behind this lock until the transaction ends
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(self.table.as_str())
            .execute(&mut *tx)
            .await
            .map_err(query_error("LOCK"))?;

        let exists: bool = sqlx::query_scalar(
            r#"
SELECT EXISTS(
    SELECT 1 FROM information_schema.tables
    WHERE table_schema = current_schema() AND table_name = $1
)
            "#,
        )
        .bind(self.table.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(query_error("SELECT"))?;

        if exists {
            info!("{} table is ready for use", self.table);
        } else {
            info!("database did not have a {} table, creating...", self.table);
            let create_table = format!(
                r#"
CREATE TABLE IF NOT EXISTS "{0}" (
    id BIGSERIAL NOT NULL PRIMARY KEY,
    producer_id VARCHAR({1}),
    info JSON NOT NULL
)
                "#,
                self.table, PRODUCER_ID_MAX_CHARS
            );
            sqlx::query(&create_table)
                .execute(&mut *tx)
                .await
                .map_err(query_error("CREATE TABLE"))?;
        }

        let create_index = format!(
            r#"CREATE INDEX IF NOT EXISTS "{0}_producer_index" ON "{0}" (producer_id)"#,
            self.table
        );
        sqlx::query(&create_index)
            .execute(&mut *tx)
            .await
            .map_err(query_error("CREATE INDEX"))?;

        tx.commit()
            .await
            .map_err(query_error("COMMIT"))?;

        Ok(())
    }

    /// Insert one row per record, each in its own transaction. A failed row is logged and
    /// does not affect the others. Returns the number of rows written.
    pub async fn persist(&self, batch: &[ConformedRecord]) -> usize {
        let mut written = 0;

        for record in batch {
            match self.insert(record).await {
                Ok(id) => {
                    written += 1;
                    debug!(
                        id,
                        offset = record.meta.offset,
                        producer_id = %record.meta.producer_id,
                        "persisted record"
                    );
                }
                Err(error) => {
                    counter!("argus_rows_failed_total").increment(1);
                    error!(
                        offset = record.meta.offset,
                        producer_id = %record.meta.producer_id,
                        schema_key = %record.meta.schema_key,
                        "failed to persist record: {}",
                        error
                    );
                }
            }
        }

        counter!("argus_rows_persisted_total").increment(written as u64);
        info!("{} item(s) added to the {} table", written, self.table);
        written
    }

    async fn insert(&self, record: &ConformedRecord) -> Result<i64, PersistenceError> {
        let query = format!(
            r#"
INSERT INTO "{}"
    (producer_id, info)
VALUES
    ($1, $2::json)
RETURNING id
            "#,
            self.table
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| PersistenceError::ConnectionError { error })?;

        let id: i64 = sqlx::query_scalar(&query)
            .bind(&record.meta.producer_id)
            .bind(sqlx::types::Json(record.info()))
            .fetch_one(&mut *tx)
            .await
            .map_err(query_error("INSERT"))?;

        tx.commit().await.map_err(query_error("COMMIT"))?;

        Ok(id)
    }

    /// The most recent row stored for a producer.
    pub async fn latest(&self, producer_id: &str) -> Result<Option<PersistedRow>, PersistenceError> {
        let query = format!(
            r#"SELECT id, producer_id, info FROM "{}" WHERE producer_id = $1 ORDER BY id DESC LIMIT 1"#,
            self.table
        );

        sqlx::query_as(&query)
            .bind(producer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }
}

#[async_trait]
impl RecordSink for PersistenceSink {
    async fn persist(&self, batch: &[ConformedRecord]) -> usize {
        PersistenceSink::persist(self, batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conform::RecordMeta;
    use argus_common::kafka_messages::{Envelope, TimestampType};
    use serde_json::json;
    use std::str::FromStr;

    fn record(offset: i64, producer_id: &str) -> ConformedRecord {
        ConformedRecord {
            meta: RecordMeta {
                timestamp: Some(1709288100000),
                timestamp_type: TimestampType::CreateTime,
                topic: "heartbeats".to_owned(),
                partition: 0,
                offset,
                producer_id: producer_id.to_owned(),
                schema_key: "cpu_load".to_owned(),
            },
            raw: Envelope {
                producer_id: producer_id.to_owned(),
                schema_key: "cpu_load".to_owned(),
                payload: json!(["12.5"]),
            },
            conformed: json!([12.5]),
        }
    }

    fn sink(db: PgPool) -> PersistenceSink {
        PersistenceSink::from_pool(TableName::from_str("heartbeat").unwrap(), db)
    }

    async fn count(db: &PgPool, query: &str) -> i64 {
        sqlx::query_scalar(query).fetch_one(db).await.unwrap()
    }

    #[sqlx::test(migrations = false)]
    async fn test_ensure_schema_is_idempotent(db: PgPool) {
        let sink = sink(db.clone());

        sink.ensure_schema().await.expect("first bootstrap failed");
        sink.ensure_schema().await.expect("second bootstrap failed");

        assert_eq!(
            count(
                &db,
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = 'heartbeat'"
            )
            .await,
            1
        );
        assert_eq!(
            count(
                &db,
                "SELECT COUNT(*) FROM pg_indexes WHERE tablename = 'heartbeat' AND indexname = 'heartbeat_producer_index'"
            )
            .await,
            1
        );
    }

    #[sqlx::test(migrations = false)]
    async fn test_concurrent_ensure_schema(db: PgPool) {
        let first = sink(db.clone());
        let second = sink(db.clone());

        let (a, b) = tokio::join!(first.ensure_schema(), second.ensure_schema());

        a.expect("first bootstrap failed");
        b.expect("second bootstrap failed");
    }

    #[sqlx::test(migrations = false)]
    async fn test_persist_and_read_back(db: PgPool) {
        let sink = sink(db.clone());
        sink.ensure_schema().await.unwrap();

        let written = sink
            .persist(&[record(0, "faker-1"), record(1, "faker-1"), record(2, "faker-2")])
            .await;

        assert_eq!(written, 3);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM heartbeat").await, 3);

        let latest = sink
            .latest("faker-1")
            .await
            .unwrap()
            .expect("a row should exist");
        assert_eq!(latest.producer_id.as_deref(), Some("faker-1"));
        assert_eq!(latest.info.0["meta"]["offset"], json!(1));
        assert_eq!(latest.info.0["data"]["deserializer"], json!("cpu_load"));
        assert_eq!(latest.info.0["data"]["data"], json!(["12.5"]));

        assert!(sink.latest("nobody").await.unwrap().is_none());
    }

    #[sqlx::test(migrations = false)]
    async fn test_failed_row_does_not_block_the_batch(db: PgPool) {
        let sink = sink(db.clone());
        sink.ensure_schema().await.unwrap();

        let oversized = "x".repeat(PRODUCER_ID_MAX_CHARS + 1);
        let written = sink
            .persist(&[record(0, "faker-1"), record(1, &oversized), record(2, "faker-1")])
            .await;

        assert_eq!(written, 2);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM heartbeat").await, 2);
    }

    #[sqlx::test(migrations = false)]
    async fn test_redelivery_appends(db: PgPool) {
        let sink = sink(db.clone());
        sink.ensure_schema().await.unwrap();

        sink.persist(&[record(5, "faker-1")]).await;
        sink.persist(&[record(5, "faker-1")]).await;

        assert_eq!(count(&db, "SELECT COUNT(*) FROM heartbeat").await, 2);
    }
}
