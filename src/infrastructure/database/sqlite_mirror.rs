use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

use crate::application::ports::mirror::{HistoryRow, RegistryMirror};
use crate::registry::{Environment, ScopeState, SlotName};

/// SQLite implementation of the registry mirror.
///
/// Strictly an index over the filesystem of record: callers treat every
/// write as best-effort, and the reconciler rebuilds these tables from
/// the scope files whenever they drift.
#[derive(Clone)]
pub struct SqliteMirror {
    pool: SqlitePool,
}

impl SqliteMirror {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("Invalid mirror database URL")?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to mirror database")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        let migration = include_str!("../../../migrations/001_initial.sql");
        sqlx::raw_sql(migration)
            .execute(&self.pool)
            .await
            .context("Failed to run mirror migrations")?;
        info!("Mirror schema is up to date");
        Ok(())
    }
}

#[async_trait]
impl RegistryMirror for SqliteMirror {
    async fn upsert_scope(&self, scope: &ScopeState) -> Result<()> {
        sqlx::query("INSERT INTO projects (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
            .bind(&scope.project)
            .execute(&self.pool)
            .await?;

        for name in [SlotName::Blue, SlotName::Green] {
            let slot = scope.slot(name);
            sqlx::query(
                r#"
                INSERT INTO slots (
                    project, environment, slot, state, port, container_id,
                    image, deployed_at, grace_expires_at, is_active, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))
                ON CONFLICT(project, environment, slot) DO UPDATE SET
                    state = excluded.state,
                    port = excluded.port,
                    container_id = excluded.container_id,
                    image = excluded.image,
                    deployed_at = excluded.deployed_at,
                    grace_expires_at = excluded.grace_expires_at,
                    is_active = excluded.is_active,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&scope.project)
            .bind(scope.environment.to_string())
            .bind(name.to_string())
            .bind(slot.state.to_string())
            .bind(slot.port.map(|p| p as i64))
            .bind(&slot.container)
            .bind(&slot.image)
            .bind(slot.deployed_at.map(|t| t.to_rfc3339()))
            .bind(slot.grace_expires_at.map(|t| t.to_rfc3339()))
            .bind(scope.active_slot == Some(name))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn append_history(&self, row: &HistoryRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deployments (
                project, environment, slot, from_state, to_state,
                image, port, operator, outcome
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.project)
        .bind(row.environment.to_string())
        .bind(row.slot.to_string())
        .bind(row.from_state.to_string())
        .bind(row.to_state.to_string())
        .bind(&row.image)
        .bind(row.port.map(|p| p as i64))
        .bind(&row.operator)
        .bind(&row.outcome)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_scope_keys(&self) -> Result<Vec<(String, Environment)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT DISTINCT project, environment FROM slots")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(project, env)| env.parse().ok().map(|env| (project, env)))
            .collect())
    }

    async fn delete_scope(&self, project: &str, environment: Environment) -> Result<()> {
        sqlx::query("DELETE FROM slots WHERE project = ? AND environment = ?")
            .bind(project)
            .bind(environment.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
