use std::{ops::Deref, path::Path, time::Duration};

use sqlx::{
    migrate::{MigrateError, Migrator},
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
    },
};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

// the reconciler is the only writer, readers wait this long for its locks
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("library database {0} does not exist and creating it is disabled")]
    Missing(String),
    #[error("failed to open library database: {0}")]
    Open(#[from] sqlx::Error),
    #[error("failed to migrate library database: {0}")]
    Migrate(#[from] MigrateError),
}

/// Connection pool of the library database.
#[derive(Clone)]
pub struct Pool(SqlitePool);

impl From<SqlitePool> for Pool {
    fn from(pool: SqlitePool) -> Self {
        Self(pool)
    }
}

impl Deref for Pool {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Opens the library database at `path` and brings its schema up to date.
///
/// With `create` unset a missing file is an error instead of an empty library.
pub async fn open_library(path: &str, create: bool) -> Result<Pool, DatabaseError> {
    if !create && !Path::new(path).exists() {
        return Err(DatabaseError::Missing(path.to_string()));
    }

    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .idle_timeout(Duration::from_secs(60))
        .max_lifetime(Duration::from_secs(3 * 60))
        .connect_with(opts)
        .await?;

    migrate(&pool).await?;
    debug!("library database {path} ready");

    Ok(Pool(pool))
}

async fn migrate(pool: &SqlitePool) -> Result<(), MigrateError> {
    match MIGRATOR.run(pool).await {
        Err(MigrateError::VersionMismatch(version)) => {
            warn!("schema migration {version} changed after it was applied");
            Ok(())
        }
        res => res,
    }
}
