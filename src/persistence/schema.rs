//! Table creation for the SQL backends. Every statement is idempotent, so the
//! schema is applied on each connect.

use sqlx::{MySqlPool, PgPool};
use tracing::info;

use super::errors::{PersistenceError, PersistenceResult};

const POSTGRES_MIGRATIONS: &[(&str, &str)] = &[
    (
        "20240601000000_create_workflow_offloads",
        include_str!("../../migrations/postgres/20240601000000_create_workflow_offloads.sql"),
    ),
    (
        "20240601000001_create_workflow_history",
        include_str!("../../migrations/postgres/20240601000001_create_workflow_history.sql"),
    ),
];

const MYSQL_MIGRATIONS: &[(&str, &str)] = &[
    (
        "20240601000000_create_workflow_offloads",
        include_str!("../../migrations/mysql/20240601000000_create_workflow_offloads.sql"),
    ),
    (
        "20240601000001_create_workflow_history",
        include_str!("../../migrations/mysql/20240601000001_create_workflow_history.sql"),
    ),
];

pub async fn ensure_postgres(pool: &PgPool) -> PersistenceResult<()> {
    for (name, sql) in POSTGRES_MIGRATIONS {
        sqlx::raw_sql(sql)
            .execute(pool)
            .await
            .map_err(|e| PersistenceError::from_sqlx("migrate", e))?;
        info!(migration = %name, backend = "postgres", "🗄️ Applied migration");
    }
    Ok(())
}

pub async fn ensure_mysql(pool: &MySqlPool) -> PersistenceResult<()> {
    for (name, sql) in MYSQL_MIGRATIONS {
        sqlx::raw_sql(sql)
            .execute(pool)
            .await
            .map_err(|e| PersistenceError::from_sqlx("migrate", e))?;
        info!(migration = %name, backend = "mysql", "🗄️ Applied migration");
    }
    Ok(())
}
