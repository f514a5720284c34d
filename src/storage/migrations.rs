use sqlx::SqlitePool;

use crate::error_handling::StorageError;

/// Applies the SQL migrations in the crate's `migrations/` directory.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StorageError> {
    let migrations_dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
    let migrator = sqlx::migrate::Migrator::new(migrations_dir.as_path()).await?;
    migrator.run(pool).await?;
    Ok(())
}
