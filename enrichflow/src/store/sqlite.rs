//! SQLite-backed store.
//!
//! One connection guarded by a mutex. Every statement runs on tokio's
//! blocking pool so a slow disk never stalls the stage workers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql};
use serde::de::DeserializeOwned;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::migrations::MigrationManager;
use super::PipelineStore;
use crate::core::{
    CompletionKey, CompletionRecord, Entity, PipelineRun, RunStatus, StageProgress, StageRun,
};
use crate::eligibility::{DependencySubject, EligibilityQuery, Selection};
use crate::errors::StoreError;
use crate::registry::CountryGate;

/// First SQLite release with `INSERT ... ON CONFLICT DO UPDATE`.
const UPSERT_MIN_VERSION: i32 = 3_024_000;

/// Durable [`PipelineStore`] on a single SQLite database.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    native_upsert: bool,
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStore")
            .field("native_upsert", &self.native_upsert)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (or creates) a database file and applies migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Backend(format!(
                        "Failed to create directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        MigrationManager::initialize(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            native_upsert: rusqlite::version_number() >= UPSERT_MIN_VERSION,
        })
    }

    /// Returns the applied schema version.
    ///
    /// # Errors
    ///
    /// Returns an error if the version table cannot be read.
    pub fn schema_version(&self) -> Result<u32, StoreError> {
        Ok(MigrationManager::get_version(&self.conn.lock())?)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
    }

    fn exists(conn: &Connection, table: &str, id: &str) -> Result<bool, StoreError> {
        let sql = format!("SELECT 1 FROM {table} WHERE id = ?1");
        Ok(conn
            .query_row(&sql, [id], |_| Ok(()))
            .optional()?
            .is_some())
    }
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = StoreError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

const ENTITY_COLUMNS: &str = "id, tenant_id, scope_id, entity_type, name, parent_id, owner_id, \
                              tier, country, domain, registration_id";

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        scope_id: row.get(2)?,
        entity_type: parse_col(row, 3)?,
        name: row.get(4)?,
        parent_id: row.get(5)?,
        owner_id: row.get(6)?,
        tier: row.get(7)?,
        country: row.get(8)?,
        domain: row.get(9)?,
        registration_id: row.get(10)?,
    })
}

const COMPLETION_COLUMNS: &str = "pipeline_run_id, tenant_id, scope_id, entity_type, entity_id, \
                                  stage, status, cost, error, completed_at";

fn completion_from_row(row: &Row<'_>) -> rusqlite::Result<CompletionRecord> {
    Ok(CompletionRecord {
        pipeline_run_id: row.get(0)?,
        tenant_id: row.get(1)?,
        scope_id: row.get(2)?,
        entity_type: parse_col(row, 3)?,
        entity_id: row.get(4)?,
        stage: row.get(5)?,
        status: parse_col(row, 6)?,
        cost: row.get(7)?,
        error: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

const PIPELINE_RUN_COLUMNS: &str = "id, tenant_id, scope_id, status, cost, stage_runs_json, \
                                    stage_order_json, filters_json, created_at, updated_at, \
                                    finished_at";

fn pipeline_run_from_row(row: &Row<'_>) -> rusqlite::Result<PipelineRun> {
    Ok(PipelineRun {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        scope_id: row.get(2)?,
        status: parse_col(row, 3)?,
        cost: row.get(4)?,
        stage_runs: json_col(row, 5)?,
        stage_order: json_col(row, 6)?,
        filters: json_col(row, 7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        finished_at: row.get(10)?,
    })
}

const STAGE_RUN_COLUMNS: &str = "id, pipeline_run_id, stage, status, progress_json, error, \
                                 created_at, started_at, updated_at, finished_at";

fn stage_run_from_row(row: &Row<'_>) -> rusqlite::Result<StageRun> {
    Ok(StageRun {
        id: row.get(0)?,
        pipeline_run_id: row.get(1)?,
        stage: row.get(2)?,
        status: parse_col(row, 3)?,
        progress: json_col(row, 4)?,
        error: row.get(5)?,
        created_at: row.get(6)?,
        started_at: row.get(7)?,
        updated_at: row.get(8)?,
        finished_at: row.get(9)?,
    })
}

/// A compiled WHERE clause with positional parameters.
#[derive(Debug, Default)]
struct SqlFilter {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl SqlFilter {
    fn push(&mut self, clause: impl Into<String>, params: impl IntoIterator<Item = Value>) {
        self.clauses.push(clause.into());
        self.params.extend(params);
    }

    fn where_sql(&self) -> String {
        self.clauses.join(" AND ")
    }
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Gate predicate over the row aliased `alias`. Never evaluates to NULL.
fn gate_sql(gate: &CountryGate, alias: &str) -> (String, Vec<Value>) {
    let mut rules = Vec::new();
    let mut params = Vec::new();

    if !gate.countries.is_empty() {
        rules.push(format!(
            "COALESCE(UPPER({alias}.country), '') IN ({})",
            placeholders(gate.countries.len())
        ));
        params.extend(gate.countries.iter().map(|c| text(c)));
    }
    for tld in &gate.tlds {
        rules.push(format!("COALESCE(SUBSTR(LOWER({alias}.domain), -?), '') = ?"));
        params.push(Value::Integer(tld.len() as i64));
        params.push(text(tld));
    }
    if gate.match_registration_id {
        rules.push(format!("COALESCE(TRIM({alias}.registration_id), '') <> ''"));
    }

    if rules.is_empty() {
        return ("0".to_string(), params);
    }
    (
        format!("({alias}.id IS NOT NULL AND ({}))", rules.join(" OR ")),
        params,
    )
}

fn compile(query: &EligibilityQuery) -> SqlFilter {
    let mut filter = SqlFilter::default();
    let scope = &query.scope;

    filter.push(
        "e.tenant_id = ? AND e.scope_id = ? AND e.entity_type = ?",
        [
            text(&scope.tenant_id),
            text(&scope.scope_id),
            text(query.entity_type.as_str()),
        ],
    );
    filter.push(
        "NOT EXISTS (SELECT 1 FROM completion_records c \
         WHERE c.pipeline_run_id = ? AND c.entity_id = e.id AND c.stage = ?)",
        [text(&scope.pipeline_run_id), text(&query.stage)],
    );

    let gate_alias = if query.gate_uses_parent() { "p" } else { "e" };

    match query.selection {
        Selection::GateRejected => {
            if let Some(gate) = &query.gate {
                let (sql, params) = gate_sql(gate, gate_alias);
                filter.push(format!("NOT {sql}"), params);
            } else {
                filter.push("0", []);
            }
        }
        Selection::Eligible => {
            for dep in &query.dependencies {
                let subject = match dep.subject {
                    DependencySubject::SameEntity => "e.id",
                    DependencySubject::Parent => "e.parent_id",
                };
                filter.push(
                    format!(
                        "EXISTS (SELECT 1 FROM completion_records d \
                         WHERE d.tenant_id = ? AND d.entity_id = {subject} AND d.stage = ? \
                         AND d.status IN ('completed', 'skipped'))"
                    ),
                    [text(&scope.tenant_id), text(&dep.stage)],
                );
            }
            if let Some(owner) = &query.owner_id {
                filter.push("e.owner_id = ?", [text(owner)]);
            }
            if let Some(tiers) = &query.tiers {
                if tiers.is_empty() {
                    filter.push("0", []);
                } else {
                    filter.push(
                        format!("e.tier IN ({})", placeholders(tiers.len())),
                        tiers.iter().map(|t| text(t)),
                    );
                }
            }
            if let Some(gate) = &query.gate {
                let (sql, params) = gate_sql(gate, gate_alias);
                filter.push(sql, params);
            }
        }
    }

    filter
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

#[async_trait]
impl PipelineStore for SqliteStore {
    async fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        let entity = entity.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "INSERT OR REPLACE INTO entities ({ENTITY_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            );
            conn.execute(
                &sql,
                params![
                    entity.id,
                    entity.tenant_id,
                    entity.scope_id,
                    entity.entity_type.as_str(),
                    entity.name,
                    entity.parent_id,
                    entity.owner_id,
                    entity.tier,
                    entity.country,
                    entity.domain,
                    entity.registration_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?1");
            Ok(conn.query_row(&sql, [id], entity_from_row).optional()?)
        })
        .await
    }

    async fn upsert_completion(&self, record: &CompletionRecord) -> Result<(), StoreError> {
        let record = record.clone();
        let native_upsert = self.native_upsert;
        self.with_conn(move |conn| {
            let sql = if native_upsert {
                format!(
                    "INSERT INTO completion_records ({COMPLETION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                     ON CONFLICT(pipeline_run_id, entity_id, stage) DO UPDATE SET \
                     tenant_id = excluded.tenant_id, scope_id = excluded.scope_id, \
                     entity_type = excluded.entity_type, status = excluded.status, \
                     cost = excluded.cost, error = excluded.error, \
                     completed_at = excluded.completed_at"
                )
            } else {
                format!(
                    "INSERT OR REPLACE INTO completion_records ({COMPLETION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                )
            };
            conn.execute(
                &sql,
                params![
                    record.pipeline_run_id,
                    record.tenant_id,
                    record.scope_id,
                    record.entity_type.as_str(),
                    record.entity_id,
                    record.stage,
                    record.status.as_str(),
                    record.cost,
                    record.error,
                    record.completed_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_completion(
        &self,
        key: &CompletionKey,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {COMPLETION_COLUMNS} FROM completion_records \
                 WHERE pipeline_run_id = ?1 AND entity_id = ?2 AND stage = ?3"
            );
            Ok(conn
                .query_row(
                    &sql,
                    params![key.pipeline_run_id, key.entity_id, key.stage],
                    completion_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn list_completions(
        &self,
        pipeline_run_id: &str,
    ) -> Result<Vec<CompletionRecord>, StoreError> {
        let pipeline_run_id = pipeline_run_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {COMPLETION_COLUMNS} FROM completion_records \
                 WHERE pipeline_run_id = ?1 ORDER BY stage, entity_id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map([pipeline_run_id], completion_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    async fn select_entity_ids(
        &self,
        query: &EligibilityQuery,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let mut filter = compile(query);
        let mut sql = format!(
            "SELECT e.id FROM entities e LEFT JOIN entities p ON p.id = e.parent_id \
             WHERE {} ORDER BY e.name, e.id",
            filter.where_sql()
        );
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            filter
                .params
                .push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map(params_from_iter(filter.params.iter()), |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
        .await
    }

    async fn count_entities(&self, query: &EligibilityQuery) -> Result<u64, StoreError> {
        let filter = compile(query);
        let sql = format!(
            "SELECT COUNT(*) FROM entities e LEFT JOIN entities p ON p.id = e.parent_id WHERE {}",
            filter.where_sql()
        );
        self.with_conn(move |conn| {
            let count: i64 =
                conn.query_row(&sql, params_from_iter(filter.params.iter()), |row| row.get(0))?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn insert_pipeline_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let stage_runs = serde_json::to_string(&run.stage_runs)?;
        let stage_order = serde_json::to_string(&run.stage_order)?;
        let filters = serde_json::to_string(&run.filters)?;
        let run = run.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "INSERT INTO pipeline_runs ({PIPELINE_RUN_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            );
            conn.execute(
                &sql,
                params![
                    run.id,
                    run.tenant_id,
                    run.scope_id,
                    run.status.as_str(),
                    run.cost,
                    stage_runs,
                    stage_order,
                    filters,
                    run.created_at,
                    run.updated_at,
                    run.finished_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_pipeline_run(&self, id: &str) -> Result<Option<PipelineRun>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {PIPELINE_RUN_COLUMNS} FROM pipeline_runs WHERE id = ?1");
            Ok(conn.query_row(&sql, [id], pipeline_run_from_row).optional()?)
        })
        .await
    }

    async fn latest_pipeline_run(
        &self,
        tenant_id: &str,
        scope_id: &str,
    ) -> Result<Option<PipelineRun>, StoreError> {
        let tenant_id = tenant_id.to_string();
        let scope_id = scope_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {PIPELINE_RUN_COLUMNS} FROM pipeline_runs \
                 WHERE tenant_id = ?1 AND scope_id = ?2 \
                 ORDER BY created_at DESC, id DESC LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, [tenant_id, scope_id], pipeline_run_from_row)
                .optional()?)
        })
        .await
    }

    async fn transition_pipeline_run(
        &self,
        id: &str,
        from: &[RunStatus],
        to: RunStatus,
    ) -> Result<bool, StoreError> {
        let id = id.to_string();
        let from = from.to_vec();
        self.with_conn(move |conn| {
            if !Self::exists(conn, "pipeline_runs", &id)? {
                return Err(StoreError::not_found("pipeline run", id));
            }
            if from.is_empty() {
                return Ok(false);
            }

            let now = now();
            let terminal = to.is_terminal();
            let from: Vec<&str> = from.iter().map(RunStatus::as_str).collect();
            let sql = format!(
                "UPDATE pipeline_runs SET status = ?, updated_at = ?, \
                 finished_at = CASE WHEN ? THEN ? ELSE finished_at END \
                 WHERE id = ? AND status IN ({})",
                placeholders(from.len())
            );
            let to = to.as_str();
            let mut args: Vec<&dyn ToSql> = vec![&to, &now, &terminal, &now, &id];
            args.extend(from.iter().map(|s| s as &dyn ToSql));

            Ok(conn.execute(&sql, params_from_iter(args))? > 0)
        })
        .await
    }

    async fn set_pipeline_run_cost(&self, id: &str, cost: f64) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE pipeline_runs SET cost = ?1, updated_at = ?2 WHERE id = ?3",
                params![cost, now(), id],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("pipeline run", id));
            }
            Ok(())
        })
        .await
    }

    async fn insert_stage_run(&self, run: &StageRun) -> Result<(), StoreError> {
        let progress = serde_json::to_string(&run.progress)?;
        let run = run.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "INSERT INTO stage_runs ({STAGE_RUN_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            );
            conn.execute(
                &sql,
                params![
                    run.id,
                    run.pipeline_run_id,
                    run.stage,
                    run.status.as_str(),
                    progress,
                    run.error,
                    run.created_at,
                    run.started_at,
                    run.updated_at,
                    run.finished_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_stage_run(&self, id: &str) -> Result<Option<StageRun>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {STAGE_RUN_COLUMNS} FROM stage_runs WHERE id = ?1");
            Ok(conn.query_row(&sql, [id], stage_run_from_row).optional()?)
        })
        .await
    }

    async fn list_stage_runs(&self, pipeline_run_id: &str) -> Result<Vec<StageRun>, StoreError> {
        let pipeline_run_id = pipeline_run_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {STAGE_RUN_COLUMNS} FROM stage_runs \
                 WHERE pipeline_run_id = ?1 ORDER BY created_at, id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let runs = stmt
                .query_map([pipeline_run_id], stage_run_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(runs)
        })
        .await
    }

    async fn update_stage_progress(
        &self,
        id: &str,
        progress: &StageProgress,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        let progress = serde_json::to_string(progress)?;
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE stage_runs SET progress_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![progress, now(), id],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("stage run", id));
            }
            Ok(())
        })
        .await
    }

    async fn transition_stage_run(
        &self,
        id: &str,
        from: &[RunStatus],
        to: RunStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let id = id.to_string();
        let from = from.to_vec();
        let error = error.map(str::to_string);
        self.with_conn(move |conn| {
            if !Self::exists(conn, "stage_runs", &id)? {
                return Err(StoreError::not_found("stage run", id));
            }
            if from.is_empty() {
                return Ok(false);
            }

            let now = now();
            let starting = to == RunStatus::Running;
            let terminal = to.is_terminal();
            let from: Vec<&str> = from.iter().map(RunStatus::as_str).collect();
            let sql = format!(
                "UPDATE stage_runs SET status = ?, updated_at = ?, \
                 started_at = CASE WHEN ? AND started_at IS NULL THEN ? ELSE started_at END, \
                 finished_at = CASE WHEN ? THEN ? ELSE finished_at END, \
                 error = COALESCE(?, error) \
                 WHERE id = ? AND status IN ({})",
                placeholders(from.len())
            );
            let to = to.as_str();
            let mut args: Vec<&dyn ToSql> =
                vec![&to, &now, &starting, &now, &terminal, &now, &error, &id];
            args.extend(from.iter().map(|s| s as &dyn ToSql));

            Ok(conn.execute(&sql, params_from_iter(args))? > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CompletionStatus, EntityType, RunScope};
    use crate::eligibility::EligibilityFilter;
    use crate::registry::{SoftDepToggles, StageRegistry};

    fn scope() -> RunScope {
        RunScope::new("t1", "s1", "r1")
    }

    async fn seeded() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        let entities = [
            Entity::company("c1", "t1", "s1", "Acme").with_country("US").with_domain("acme.com"),
            Entity::company("c2", "t1", "s1", "Firma").with_country("CZ"),
            Entity::company("c3", "t1", "s1", "Nordic").with_domain("https://www.nordic.no/"),
            Entity::contact("p1", "t1", "s1", "Jane", "c1"),
            Entity::contact("p2", "t1", "s1", "Orphan", "missing"),
        ];
        for entity in &entities {
            store.upsert_entity(entity).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_open_applies_schema() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_statements_run_off_the_runtime_thread() {
        let store = Arc::new(seeded().await);
        let guard = store.conn.lock();
        let pending = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.get_entity("c1").await }
        });

        // The single runtime thread keeps ticking while the statement waits.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        drop(guard);
        let entity = pending.await.unwrap().unwrap().unwrap();
        assert_eq!(entity.name, "Acme");
    }

    #[tokio::test]
    async fn test_entity_round_trip() {
        let store = seeded().await;
        let entity = store.get_entity("c3").await.unwrap().unwrap();
        assert_eq!(entity.domain.as_deref(), Some("nordic.no"));
        assert_eq!(entity.entity_type, EntityType::Company);
        assert!(store.get_entity("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_completion_keeps_one_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let base = CompletionRecord::new(
            &scope(),
            EntityType::Company,
            "c1",
            "l1",
            CompletionStatus::Failed,
        );
        store.upsert_completion(&base.clone().with_error("boom")).await.unwrap();
        store
            .upsert_completion(&CompletionRecord {
                status: CompletionStatus::Completed,
                ..base
            })
            .await
            .unwrap();

        let records = store.list_completions("r1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, CompletionStatus::Completed);
        assert!(records[0].error.is_none());
    }

    #[tokio::test]
    async fn test_gate_sides_partition_companies() {
        let store = seeded().await;
        let registry = StageRegistry::builtin();
        let filter = EligibilityFilter {
            soft_deps: SoftDepToggles::new().disable("registry"),
            ..Default::default()
        };
        let eligible =
            EligibilityQuery::eligible(&registry, "registry", &scope(), &filter).unwrap();
        let rejected = EligibilityQuery::gate_rejected(&registry, "registry", &scope())
            .unwrap()
            .unwrap();

        assert_eq!(
            store.select_entity_ids(&eligible, None).await.unwrap(),
            vec!["c2", "c3"]
        );
        assert_eq!(store.select_entity_ids(&rejected, None).await.unwrap(), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_parent_dependency_and_missing_parent() {
        let store = seeded().await;
        let query = EligibilityQuery::eligible(
            &StageRegistry::builtin(),
            "person",
            &scope(),
            &EligibilityFilter::default(),
        )
        .unwrap();
        assert!(store.select_entity_ids(&query, None).await.unwrap().is_empty());

        store
            .upsert_completion(&CompletionRecord::new(
                &RunScope::new("t1", "s1", "earlier"),
                EntityType::Company,
                "c1",
                "l2",
                CompletionStatus::Completed,
            ))
            .await
            .unwrap();
        assert_eq!(store.select_entity_ids(&query, None).await.unwrap(), vec!["p1"]);
        assert_eq!(store.count_entities(&query).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stage_run_transitions() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = PipelineRun {
            id: "pr1".to_string(),
            tenant_id: "t1".to_string(),
            scope_id: "s1".to_string(),
            status: RunStatus::Running,
            cost: 0.0,
            stage_runs: [("l1".to_string(), "sr1".to_string())].into_iter().collect(),
            stage_order: vec!["l1".to_string()],
            filters: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            finished_at: None,
        };
        store.insert_pipeline_run(&run).await.unwrap();
        store
            .insert_stage_run(&StageRun::pending("sr1", "pr1", "l1"))
            .await
            .unwrap();

        assert!(store
            .transition_stage_run("sr1", &[RunStatus::Pending], RunStatus::Running, None)
            .await
            .unwrap());
        assert!(store
            .transition_stage_run("sr1", &RunStatus::ACTIVE, RunStatus::Failed, Some("boom"))
            .await
            .unwrap());
        assert!(!store
            .transition_stage_run("sr1", &RunStatus::ACTIVE, RunStatus::Completed, None)
            .await
            .unwrap());

        let stored = store.get_stage_run("sr1").await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert!(stored.started_at.is_some());
        assert!(stored.finished_at.is_some());

        let latest = store.latest_pipeline_run("t1", "s1").await.unwrap().unwrap();
        assert_eq!(latest.stage_runs["l1"], "sr1");
    }
}
