//! Dedup reconciler.
//!
//! Checks collected notices against the store of already-ingested ones.
//! Identifiers are staged into a connection-local scratch table in
//! batches, then a single anti-join against the regime's notification
//! table yields the ones the store has never seen.
//!
//! The scratch table is dropped and recreated on every call, so a
//! connection must not run two reconciliations at once. [`NoticeStore`]
//! takes `&mut self` to make that a compile-time property.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashSet;
use tracing::debug;

use crate::models::{CollectedRecord, Regime};

/// Most values staged by one insert statement.
pub const STAGE_BATCH_SIZE: usize = 999;

/// Store of notices that have already been ingested.
#[async_trait]
pub trait NoticeStore: Send {
    /// The subset of `identifiers` with no row in `regime`'s table,
    /// distinct, in first-seen order.
    async fn find_unseen(&mut self, identifiers: &[String], regime: Regime) -> Result<Vec<String>>;
}

/// Insert batches for `identifiers`.
pub fn staging_batches<T>(identifiers: &[T]) -> std::slice::Chunks<'_, T> {
    identifiers.chunks(STAGE_BATCH_SIZE)
}

/// [`NoticeStore`] over a single SQLite connection.
pub struct SqliteNoticeStore {
    conn: SqliteConnection,
}

impl SqliteNoticeStore {
    pub fn new(conn: SqliteConnection) -> Self {
        Self { conn }
    }

    async fn reset_scratch(&mut self) -> Result<()> {
        sqlx::query("DROP TABLE IF EXISTS temp.collected_notices")
            .execute(&mut self.conn)
            .await?;
        sqlx::query("CREATE TEMP TABLE collected_notices (notifnr TEXT NOT NULL)")
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NoticeStore for SqliteNoticeStore {
    async fn find_unseen(&mut self, identifiers: &[String], regime: Regime) -> Result<Vec<String>> {
        if identifiers.is_empty() {
            return Ok(Vec::new());
        }

        self.reset_scratch().await?;

        let mut batches = 0usize;
        for batch in staging_batches(identifiers) {
            let mut insert: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO temp.collected_notices (notifnr) ");
            insert.push_values(batch, |mut row, id| {
                row.push_bind(id);
            });
            insert.build().execute(&mut self.conn).await?;
            batches += 1;
        }

        let unseen: Vec<String> = sqlx::query_scalar(&format!(
            r#"
            SELECT t.notifnr
            FROM temp.collected_notices t
            LEFT JOIN {table} n ON t.notifnr = n.notificationnumber
            WHERE n.notificationnumber IS NULL
            GROUP BY t.notifnr
            ORDER BY MIN(t.rowid)
            "#,
            table = regime.table()
        ))
        .fetch_all(&mut self.conn)
        .await?;

        debug!(
            regime = %regime,
            staged = identifiers.len(),
            batches,
            unseen = unseen.len(),
            "reconciled against store"
        );
        Ok(unseen)
    }
}

/// Keep only the records `store` has not seen, one per key.
///
/// Regime-B records are reconciled by notification number and come back
/// with their registry ids intact.
pub async fn reconcile<S>(
    store: &mut S,
    records: Vec<CollectedRecord>,
    regime: Regime,
) -> Result<Vec<CollectedRecord>>
where
    S: NoticeStore + ?Sized,
{
    if records.is_empty() {
        return Ok(Vec::new());
    }

    let keys: Vec<String> = records.iter().map(|r| r.key().to_string()).collect();
    let unseen: HashSet<String> = store.find_unseen(&keys, regime).await?.into_iter().collect();

    let mut emitted = HashSet::new();
    Ok(records
        .into_iter()
        .filter(|record| unseen.contains(record.key()) && emitted.insert(record.key().to_string()))
        .collect())
}
