//! Shared test utilities for edgemesh integration tests.
//!
//! Each test gets its own SQLite store file in a temporary directory with
//! all migrations applied. Dropping the returned [`TempDir`] removes the
//! store, so tests are fully isolated and leave nothing behind.

use sqlx::SqlitePool;
use tempfile::TempDir;

use edgemesh_db::config::StoreConfig;
use edgemesh_db::pool;

/// Create a temporary store with migrations applied.
///
/// Returns `(pool, dir)`. Keep `dir` alive for the duration of the test;
/// the store file lives inside it.
pub async fn create_test_db() -> (SqlitePool, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = StoreConfig::new(dir.path().join("edgemesh-test.db"));

    let pool = pool::create_pool(&config)
        .await
        .expect("failed to open test store");

    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    (pool, dir)
}
