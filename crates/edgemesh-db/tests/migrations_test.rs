//! Migration smoke tests: the schema applies cleanly to a fresh store and
//! re-running the migrator is a no-op.

use edgemesh_db::pool;
use edgemesh_test_utils::create_test_db;

#[tokio::test]
async fn migrations_create_all_tables() {
    let (pool, _dir) = create_test_db().await;

    let counts = pool::table_counts(&pool).await.expect("table_counts");
    let names: Vec<&str> = counts.iter().map(|(name, _)| name.as_str()).collect();

    for expected in ["jobs", "node_metrics", "nodes", "results", "tasks"] {
        assert!(
            names.contains(&expected),
            "expected table {expected}, got {names:?}"
        );
    }
    for (_, count) in &counts {
        assert_eq!(*count, 0, "fresh store should have empty tables");
    }

    pool.close().await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (pool, _dir) = create_test_db().await;

    // Second run must find everything already applied.
    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .expect("re-running migrations should succeed");

    pool.close().await;
}
