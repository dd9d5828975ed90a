pub mod init;
pub mod serve;
pub mod status;

use std::path::Path;

use margin_core::config::MarginConfig;
use margin_core::db::sqlite::SqliteRepository;
use margin_core::db::DatabasePool;

/// Load and validate the configuration, then open the database.
pub async fn open(config_path: &str) -> anyhow::Result<(MarginConfig, SqliteRepository)> {
    let config = MarginConfig::load(Path::new(config_path))?;
    config.validate()?;

    let path = config
        .margin
        .database
        .path
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("SQLite path not configured"))?;
    let connect_str = format!("sqlite:{}?mode=rwc", path);
    let DatabasePool::Sqlite(pool) = DatabasePool::new_sqlite(&connect_str).await?;
    Ok((config, SqliteRepository::new(pool)))
}
