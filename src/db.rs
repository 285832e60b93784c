use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::ConnectOptions;
use std::str::FromStr;

use crate::config::Config;

/// Open a dedicated connection to the notice store.
///
/// The reconciler's scratch table lives on the connection, so callers
/// hold their own connection instead of sharing a pool.
pub async fn connect(config: &Config) -> Result<SqliteConnection> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    options
        .connect()
        .await
        .with_context(|| format!("Failed to open notice store: {}", db_path.display()))
}
