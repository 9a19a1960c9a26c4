use anyhow::Result;
use async_trait::async_trait;

use crate::registry::{Environment, ScopeState, SlotName, SlotState};

/// One append-only deployment history row, recorded per state transition.
#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub project: String,
    pub environment: Environment,
    pub slot: SlotName,
    pub from_state: SlotState,
    pub to_state: SlotState,
    pub image: Option<String>,
    pub port: Option<u16>,
    pub operator: String,
    pub outcome: String,
}

/// Relational mirror of the filesystem registry. The mirror is an index,
/// not a cache: writes are best-effort after the filesystem commit and
/// the reconciler re-derives it from the filesystem on drift.
#[async_trait]
pub trait RegistryMirror: Send + Sync + 'static {
    /// Idempotently push a scope's current state into the mirror.
    async fn upsert_scope(&self, scope: &ScopeState) -> Result<()>;

    /// Append one history row. History is never mutated or deleted.
    async fn append_history(&self, row: &HistoryRow) -> Result<()>;

    /// All (project, environment) scope keys the mirror currently holds.
    async fn list_scope_keys(&self) -> Result<Vec<(String, Environment)>>;

    /// Drop a scope's slot rows (used when the filesystem no longer has
    /// the scope). History rows are retained.
    async fn delete_scope(&self, project: &str, environment: Environment) -> Result<()>;
}
