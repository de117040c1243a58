// Smoke test binary: exercises the pool, sessions and query cache against live services
// Usage: qcache-smoke [sql]
// Connection settings come from config/ and QCACHE__* variables, the password
// from PG_PASSWORD_<DB>_<USER>.

use anyhow::{ensure, Context, Result};
use common::bootstrap;
use common::cache::{Origin, QueryCache};
use common::config::Settings;
use common::db::SessionFactory;
use common::telemetry;
use common::value::Value;
use tracing::{error, info};

const DEFAULT_SQL: &str = "SELECT schemaname, tablename FROM pg_tables ORDER BY tablename LIMIT 5";

const LOOKUP_ONE: &str = "SELECT * FROM pg_tables WHERE schemaname = $1 AND tablename = $2";

const LOOKUP_TEN: &str = "SELECT tablename AS _qkey, * FROM pg_tables \
                          WHERE schemaname = 'pg_catalog' \
                          AND tablename IN ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)";

#[tokio::main]
async fn main() -> Result<()> {
    let settings =
        Settings::load().map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    settings.validate()?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!("Starting query cache smoke test");

    let sql = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_SQL.to_string());

    let pool = bootstrap::init_connection_pool(&settings);
    let cache = bootstrap::init_query_cache(&settings, pool.clone()).await?;

    let outcome = run(&cache, &sql).await;

    pool.close_all().await;
    telemetry::shutdown_tracer();

    match outcome {
        Ok(()) => {
            info!(stats = ?pool.stats(), "All smoke checks passed");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Smoke check failed");
            Err(e)
        }
    }
}

async fn run(cache: &QueryCache, sql: &str) -> Result<()> {
    check_sessions(cache.sessions(), sql).await?;
    // Twice: the second pass starts from a warm cache and must reset it
    check_run1(cache).await?;
    check_run1(cache).await?;
    check_run10(cache).await?;
    Ok(())
}

/// Nested sessions hold two connections; a later session reuses one
async fn check_sessions(sessions: &SessionFactory, sql: &str) -> Result<()> {
    let pool = sessions.pool();
    let before = pool.stats().created;

    let mut outer = sessions.session();
    let rows = outer.query(sql, &[]).await?;
    info!(rows = rows.len(), "Outer session query");
    {
        let mut inner = sessions.session();
        for row in inner.query(sql, &[]).await? {
            info!(row = ?row, "Inner session row");
        }
        inner.close();
    }
    outer.close();

    let mut again = sessions.session();
    let rows = again.query(sql, &[]).await?;
    info!(rows = rows.len(), "Reused session query");
    again.close();

    let created = pool.stats().created - before;
    ensure!(
        created == 2,
        "expected 2 physical connections for 3 sessions, pool opened {}",
        created
    );
    Ok(())
}

async fn check_run1(cache: &QueryCache) -> Result<()> {
    cache.invalidate("myquery", "pg_catalog").await?;

    let expectations = [
        ("pg_class", Origin::Miss),
        ("pg_type", Origin::Miss),
        ("pg_class", Origin::Hit),
        ("pg_type", Origin::Hit),
    ];
    for (table, expected) in expectations {
        let key = [Value::from("pg_catalog"), Value::from(table)];
        let row = cache
            .run1("myquery", LOOKUP_ONE, &key, 60)
            .await?
            .with_context(|| format!("pg_catalog.{} not found", table))?;

        ensure!(
            row.origin == expected,
            "run1 {}: expected {:?}, got {:?}",
            table,
            expected,
            row.origin
        );
        info!(table = table, origin = ?row.origin, "run1 checked");
    }
    Ok(())
}

async fn check_run10(cache: &QueryCache) -> Result<()> {
    for table in ["pg_class", "pg_type", "pg_am"] {
        cache.invalidate("anotherquery", table).await?;
    }

    let rounds: [(&[&str], &[(&str, Origin)]); 3] = [
        (
            &["pg_class", "pg_type"],
            &[("pg_class", Origin::Miss), ("pg_type", Origin::Miss)],
        ),
        (
            &["pg_class", "pg_type", "pg_am"],
            &[
                ("pg_class", Origin::Hit),
                ("pg_type", Origin::Hit),
                ("pg_am", Origin::Miss),
            ],
        ),
        (
            &["pg_class", "pg_type", "pg_am"],
            &[
                ("pg_class", Origin::Hit),
                ("pg_type", Origin::Hit),
                ("pg_am", Origin::Hit),
            ],
        ),
    ];

    for (round, &(keys, expected)) in rounds.iter().enumerate() {
        let rows = cache.run10("anotherquery", LOOKUP_TEN, keys, 60).await?;
        for &(table, origin) in expected {
            let row = rows
                .get(table)
                .with_context(|| format!("run10 round {}: pg_catalog.{} missing", round, table))?;
            ensure!(
                row.origin == origin,
                "run10 round {} {}: expected {:?}, got {:?}",
                round,
                table,
                origin,
                row.origin
            );
        }
        info!(round = round, keys = keys.len(), "run10 checked");
    }
    Ok(())
}
