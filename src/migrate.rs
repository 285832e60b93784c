use anyhow::Result;
use sqlx::SqliteConnection;

use crate::config::Config;
use crate::db;
use crate::models::Regime;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let mut conn = db::connect(config).await?;
    create_schema(&mut conn).await?;
    Ok(())
}

/// Create the per-regime notification tables. Idempotent.
///
/// In production these tables are filled by the ingestion process; this
/// crate only ever reads them.
pub async fn create_schema(conn: &mut SqliteConnection) -> Result<()> {
    for regime in [Regime::A, Regime::B] {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id_notification INTEGER PRIMARY KEY AUTOINCREMENT,
                notificationnumber TEXT NOT NULL,
                imported_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )
            "#,
            table = regime.table()
        ))
        .execute(&mut *conn)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_number ON {table}(notificationnumber)",
            table = regime.table()
        ))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}
