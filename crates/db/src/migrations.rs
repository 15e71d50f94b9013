use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Number of up-migrations in `MIGRATOR` not yet recorded in the database.
pub async fn pending_count(pool: &DbPool) -> Result<usize, sqlx::Error> {
    let recorded: i64 = match sqlx::query_scalar(
        "SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1",
    )
    .fetch_one(pool)
    .await
    {
        Ok(count) => count,
        Err(sqlx::Error::Database(error)) if error.message().contains("no such table") => 0,
        Err(error) => return Err(error),
    };

    let expected =
        MIGRATOR.iter().filter(|migration| migration.migration_type.is_up_migration()).count();
    Ok(expected.saturating_sub(usize::try_from(recorded).unwrap_or(0)))
}
