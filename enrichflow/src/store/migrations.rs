use rusqlite::{Connection, Result, Transaction};

/// Current database schema version
const CURRENT_VERSION: u32 = 2;

type Migration = fn(&Transaction<'_>) -> Result<()>;

/// Numbered schema migrations tracked in `schema_version`.
pub struct MigrationManager;

impl MigrationManager {
    /// Creates the version table and applies every pending migration.
    pub fn initialize(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )?;

        let current = Self::get_version(conn)?;
        for version in (current + 1)..=CURRENT_VERSION {
            Self::apply_migration(conn, version)?;
        }
        Ok(())
    }

    fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
        let Some(migration) = migration(version) else {
            return Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_MISUSE),
                Some(format!("No migration found for version {version}")),
            ));
        };

        let tx = conn.unchecked_transaction()?;
        migration(&tx)?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
        tx.commit()
    }

    /// Returns the applied schema version (0 for a fresh database).
    pub fn get_version(conn: &Connection) -> Result<u32> {
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
    }
}

fn migration(version: u32) -> Option<Migration> {
    match version {
        1 => Some(migration_v1),
        2 => Some(migration_v2),
        _ => None,
    }
}

/// Migration v1: entities, completion records and run state
fn migration_v1(tx: &Transaction<'_>) -> Result<()> {
    tx.execute(
        "CREATE TABLE entities (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            scope_id TEXT NOT NULL,
            entity_type TEXT NOT NULL CHECK(entity_type IN ('company','contact')),
            name TEXT NOT NULL,
            parent_id TEXT NULL,
            owner_id TEXT NULL,
            tier TEXT NULL,
            country TEXT NULL,
            domain TEXT NULL,
            registration_id TEXT NULL
        )",
        [],
    )?;

    tx.execute(
        "CREATE TABLE completion_records (
            id INTEGER PRIMARY KEY,
            pipeline_run_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            scope_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('completed','failed','skipped')),
            cost REAL NOT NULL DEFAULT 0,
            error TEXT NULL,
            completed_at TEXT NOT NULL,
            UNIQUE(pipeline_run_id, entity_id, stage)
        )",
        [],
    )?;

    tx.execute(
        "CREATE TABLE pipeline_runs (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            scope_id TEXT NOT NULL,
            status TEXT NOT NULL,
            cost REAL NOT NULL DEFAULT 0,
            stage_runs_json TEXT NOT NULL,
            stage_order_json TEXT NOT NULL,
            filters_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            finished_at TEXT NULL
        )",
        [],
    )?;

    tx.execute(
        "CREATE TABLE stage_runs (
            id TEXT PRIMARY KEY,
            pipeline_run_id TEXT NOT NULL REFERENCES pipeline_runs(id),
            stage TEXT NOT NULL,
            status TEXT NOT NULL,
            progress_json TEXT NOT NULL,
            error TEXT NULL,
            created_at TEXT NOT NULL,
            started_at TEXT NULL,
            updated_at TEXT NOT NULL,
            finished_at TEXT NULL
        )",
        [],
    )?;

    Ok(())
}

/// Migration v2: indexes for eligibility and status lookups
fn migration_v2(tx: &Transaction<'_>) -> Result<()> {
    tx.execute(
        "CREATE INDEX idx_entities_scope ON entities(tenant_id, scope_id, entity_type)",
        [],
    )?;
    tx.execute(
        "CREATE INDEX idx_completions_dependency \
         ON completion_records(entity_id, stage, tenant_id)",
        [],
    )?;
    tx.execute(
        "CREATE INDEX idx_pipeline_runs_scope ON pipeline_runs(tenant_id, scope_id, created_at)",
        [],
    )?;
    tx.execute(
        "CREATE INDEX idx_stage_runs_pipeline ON stage_runs(pipeline_run_id)",
        [],
    )?;
    Ok(())
}
