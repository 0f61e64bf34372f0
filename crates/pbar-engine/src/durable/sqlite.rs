//! SQLite-backed durable store.
//!
//! Writes go through a single connection behind a mutex; calls hop to the
//! blocking pool so the async runtime never blocks on disk I/O. Step rows
//! are keyed by (bar, version, position), so rotating a bar inserts fresh
//! rows for the new version and leaves prior versions readable.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use pbar_common::{
    BarSchema, CompletedTrace, ExternalId, SamplingTechnique, StepSpec, Technique, TraceStep,
};

use super::{DurableStore, StepSample};
use crate::error::StoreError;
use crate::hot_store::StoreResult;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS progress_bars(
    id INTEGER PRIMARY KEY,
    owner TEXT NOT NULL,
    uid TEXT UNIQUE NOT NULL,
    name TEXT NOT NULL,
    sampling_max_count INTEGER NOT NULL,
    sampling_max_age_seconds INTEGER NULL,
    sampling_technique TEXT NOT NULL,
    version INTEGER NOT NULL,
    created_at REAL NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS progress_bars_owner_name
    ON progress_bars(owner, name);

CREATE TABLE IF NOT EXISTS progress_bar_steps(
    id INTEGER PRIMARY KEY,
    progress_bar_id INTEGER NOT NULL REFERENCES progress_bars(id) ON DELETE CASCADE,
    bar_version INTEGER NOT NULL,
    uid TEXT UNIQUE NOT NULL,
    name TEXT NOT NULL,
    position INTEGER NOT NULL,
    iterated INTEGER NOT NULL,
    one_off_technique TEXT NOT NULL,
    one_off_percentile INTEGER NOT NULL,
    iterated_technique TEXT NOT NULL,
    iterated_percentile INTEGER NOT NULL,
    created_at REAL NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS progress_bar_steps_bar_version_position
    ON progress_bar_steps(progress_bar_id, bar_version, position);
CREATE UNIQUE INDEX IF NOT EXISTS progress_bar_steps_bar_version_name
    ON progress_bar_steps(progress_bar_id, bar_version, name);

CREATE TABLE IF NOT EXISTS progress_bar_traces(
    id INTEGER PRIMARY KEY,
    progress_bar_id INTEGER NOT NULL REFERENCES progress_bars(id) ON DELETE CASCADE,
    bar_version INTEGER NOT NULL,
    uid TEXT UNIQUE NOT NULL,
    created_at REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS progress_bar_traces_bar_version_created_at
    ON progress_bar_traces(progress_bar_id, bar_version, created_at);

CREATE TABLE IF NOT EXISTS progress_bar_trace_steps(
    id INTEGER PRIMARY KEY,
    progress_bar_trace_id INTEGER NOT NULL
        REFERENCES progress_bar_traces(id) ON DELETE CASCADE,
    uid TEXT UNIQUE NOT NULL,
    position INTEGER NOT NULL,
    step_name TEXT NOT NULL,
    iterations INTEGER NULL,
    started_at REAL NOT NULL,
    finished_at REAL NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS progress_bar_trace_steps_trace_position
    ON progress_bar_trace_steps(progress_bar_trace_id, position);
";

fn db_err(e: rusqlite::Error) -> StoreError {
    match e {
        // Constraint violations (duplicate names, uids) are deterministic;
        // retrying them would just replay the same failure.
        rusqlite::Error::SqliteFailure(err, message)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Integrity(message.unwrap_or_else(|| err.to_string()))
        }
        other => StoreError::Unavailable(other.to_string()),
    }
}

fn parse_technique(raw: &str) -> Result<Technique, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Integrity(format!("unknown technique column value {raw:?}")))
}

/// SQLite `DurableStore` implementation.
#[derive(Clone)]
pub struct SqliteDurableStore {
    conn: Arc<Mutex<Connection>>,
}

impl fmt::Debug for SqliteDurableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteDurableStore").finish_non_exhaustive()
    }
}

impl SqliteDurableStore {
    /// Open (and migrate) a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path).map_err(db_err)?)
    }

    /// Open an in-memory database; used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(db_err)?;
        conn.execute_batch(SCHEMA_SQL).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking pool: {e}")))?
    }
}

fn bar_row_id(conn: &Connection, bar_uid: &str) -> Result<Option<i64>, StoreError> {
    conn.query_row(
        "SELECT id FROM progress_bars WHERE uid = ?1",
        params![bar_uid],
        |row| row.get(0),
    )
    .optional()
    .map_err(db_err)
}

fn insert_step_row(
    conn: &Connection,
    bar_id: i64,
    version: u32,
    step: &StepSpec,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO progress_bar_steps (
            progress_bar_id, bar_version, uid, name, position, iterated,
            one_off_technique, one_off_percentile,
            iterated_technique, iterated_percentile, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            bar_id,
            version,
            step.uid.as_str(),
            step.name,
            step.position,
            step.iterated as i64,
            step.one_off_technique.as_str(),
            i64::from(step.one_off_percentile),
            step.iterated_technique.as_str(),
            i64::from(step.iterated_percentile),
            step.created_at,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn load_steps(
    conn: &Connection,
    bar_id: i64,
    version: u32,
) -> Result<Vec<StepSpec>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT uid, name, position, iterated,
                    one_off_technique, one_off_percentile,
                    iterated_technique, iterated_percentile, created_at
             FROM progress_bar_steps
             WHERE progress_bar_id = ?1 AND bar_version = ?2
             ORDER BY position",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![bar_id, version], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, f64>(8)?,
            ))
        })
        .map_err(db_err)?;

    let mut steps = Vec::new();
    for row in rows {
        let (uid, name, position, iterated, one_off_t, one_off_p, iterated_t, iterated_p, created_at) =
            row.map_err(db_err)?;
        steps.push(StepSpec {
            uid: ExternalId::from(uid),
            name,
            position,
            iterated: iterated != 0,
            one_off_technique: parse_technique(&one_off_t)?,
            one_off_percentile: one_off_p.clamp(0, 100) as u8,
            iterated_technique: parse_technique(&iterated_t)?,
            iterated_percentile: iterated_p.clamp(0, 100) as u8,
            created_at,
        });
    }
    Ok(steps)
}

fn load_trace_steps(conn: &Connection, trace_id: i64) -> Result<Vec<TraceStep>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT position, step_name, iterations, started_at, finished_at
             FROM progress_bar_trace_steps
             WHERE progress_bar_trace_id = ?1
             ORDER BY position",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![trace_id], |row| {
            Ok(TraceStep {
                position: row.get(0)?,
                step_name: row.get(1)?,
                iterations: row.get::<_, Option<u32>>(2)?,
                started_at: row.get(3)?,
                finished_at: Some(row.get::<_, f64>(4)?),
            })
        })
        .map_err(db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn load_bar(&self, owner: &str, name: &str) -> StoreResult<Option<BarSchema>> {
        let owner = owner.to_string();
        let name = name.to_string();
        self.with_conn(move |conn| {
            let bar = conn
                .query_row(
                    "SELECT id, uid, sampling_max_count, sampling_max_age_seconds,
                            sampling_technique, version, created_at
                     FROM progress_bars WHERE owner = ?1 AND name = ?2",
                    params![owner, name],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u32>(2)?,
                            row.get::<_, Option<u32>>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, u32>(5)?,
                            row.get::<_, f64>(6)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_err)?;
            let Some((bar_id, uid, max_count, max_age, technique, version, created_at)) = bar
            else {
                return Ok(None);
            };
            let technique: SamplingTechnique = technique.parse().map_err(|_| {
                StoreError::Integrity(format!("unknown sampling_technique {technique:?}"))
            })?;
            let mut steps = load_steps(conn, bar_id, version)?;
            if steps.first().map(|s| s.position) != Some(0) {
                return Err(StoreError::Integrity(format!(
                    "bar {uid} version {version} has no default spec row"
                )));
            }
            let default_spec = steps.remove(0);
            Ok(Some(BarSchema {
                bar_uid: ExternalId::from(uid),
                owner,
                name,
                version,
                sampling_max_count: max_count,
                sampling_max_age_seconds: max_age,
                sampling_technique: technique,
                default_spec,
                steps,
                created_at,
            }))
        })
        .await
    }

    async fn create_bar(&self, schema: &BarSchema) -> StoreResult<()> {
        schema.check_integrity().map_err(StoreError::Integrity)?;
        let schema = schema.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            tx.execute(
                "INSERT INTO progress_bars (
                    owner, uid, name, sampling_max_count, sampling_max_age_seconds,
                    sampling_technique, version, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    schema.owner,
                    schema.bar_uid.as_str(),
                    schema.name,
                    schema.sampling_max_count,
                    schema.sampling_max_age_seconds,
                    schema.sampling_technique.as_str(),
                    schema.version,
                    schema.created_at,
                ],
            )
            .map_err(db_err)?;
            let bar_id = tx.last_insert_rowid();
            insert_step_row(&tx, bar_id, schema.version, &schema.default_spec)?;
            for step in &schema.steps {
                insert_step_row(&tx, bar_id, schema.version, step)?;
            }
            tx.commit().map_err(db_err)
        })
        .await
    }

    async fn rotate_bar(
        &self,
        owner: &str,
        name: &str,
        steps: Vec<StepSpec>,
    ) -> StoreResult<BarSchema> {
        let owner_arg = owner.to_string();
        let name_arg = name.to_string();
        self.with_conn(move |conn| {
            let owner = owner_arg;
            let name = name_arg;
            let tx = conn.transaction().map_err(db_err)?;
            let (bar_id, old_version): (i64, u32) = tx
                .query_row(
                    "SELECT id, version FROM progress_bars WHERE owner = ?1 AND name = ?2",
                    params![owner, name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(db_err)?
                .ok_or_else(|| {
                    StoreError::Integrity(format!("no bar {owner}/{name} to rotate"))
                })?;
            let new_version = old_version + 1;
            tx.execute(
                "UPDATE progress_bars SET version = ?1 WHERE id = ?2",
                params![new_version, bar_id],
            )
            .map_err(db_err)?;

            // Carry the default spec forward under a fresh uid; old version
            // rows stay behind, readable.
            let old_steps = load_steps(&tx, bar_id, old_version)?;
            let mut default_spec = old_steps
                .into_iter()
                .find(|s| s.position == 0)
                .ok_or_else(|| {
                    StoreError::Integrity(format!(
                        "bar {owner}/{name} version {old_version} has no default spec row"
                    ))
                })?;
            default_spec.uid = ExternalId::step();
            insert_step_row(&tx, bar_id, new_version, &default_spec)?;
            for step in &steps {
                insert_step_row(&tx, bar_id, new_version, step)?;
            }
            tx.commit().map_err(db_err)?;
            Ok((bar_id, new_version))
        })
        .await?;

        self.load_bar(owner, name).await?.ok_or_else(|| {
            StoreError::Integrity(format!("bar {owner}/{name} vanished during rotation"))
        })
    }

    async fn trace_exists(&self, trace_uid: &str) -> StoreResult<bool> {
        let uid = trace_uid.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT 1 FROM progress_bar_traces WHERE uid = ?1",
                params![uid],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)
            .map(|row| row.is_some())
        })
        .await
    }

    async fn insert_trace(&self, trace: &CompletedTrace) -> StoreResult<bool> {
        let trace = trace.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM progress_bar_traces WHERE uid = ?1",
                    params![trace.uid.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            if exists.is_some() {
                return Ok(false);
            }
            let bar_id = bar_row_id(&tx, trace.bar_uid.as_str())?.ok_or_else(|| {
                StoreError::Integrity(format!("no bar row for {}", trace.bar_uid))
            })?;
            tx.execute(
                "INSERT INTO progress_bar_traces (progress_bar_id, bar_version, uid, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![bar_id, trace.bar_version, trace.uid.as_str(), trace.created_at],
            )
            .map_err(db_err)?;
            let trace_id = tx.last_insert_rowid();
            for step in &trace.steps {
                let finished_at = step.finished_at.ok_or_else(|| {
                    StoreError::Integrity(format!(
                        "retained trace {} has an unfinished step at position {}",
                        trace.uid, step.position
                    ))
                })?;
                tx.execute(
                    "INSERT INTO progress_bar_trace_steps (
                        progress_bar_trace_id, uid, position, step_name,
                        iterations, started_at, finished_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        trace_id,
                        ExternalId::trace_step().as_str(),
                        step.position,
                        step.step_name,
                        step.iterations,
                        step.started_at,
                        finished_at,
                    ],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(true)
        })
        .await
    }

    async fn load_trace(&self, trace_uid: &str) -> StoreResult<Option<CompletedTrace>> {
        let uid = trace_uid.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT t.id, b.uid, t.bar_version, t.created_at
                     FROM progress_bar_traces t
                     JOIN progress_bars b ON b.id = t.progress_bar_id
                     WHERE t.uid = ?1",
                    params![uid],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u32>(2)?,
                            row.get::<_, f64>(3)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_err)?;
            let Some((trace_id, bar_uid, bar_version, created_at)) = row else {
                return Ok(None);
            };
            Ok(Some(CompletedTrace {
                uid: ExternalId::from(uid),
                bar_uid: ExternalId::from(bar_uid),
                bar_version,
                created_at,
                steps: load_trace_steps(conn, trace_id)?,
            }))
        })
        .await
    }

    async fn latest_retained_at(&self, bar_uid: &str, version: u32) -> StoreResult<Option<f64>> {
        let bar_uid = bar_uid.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT MAX(t.created_at)
                 FROM progress_bar_traces t
                 JOIN progress_bars b ON b.id = t.progress_bar_id
                 WHERE b.uid = ?1 AND t.bar_version = ?2",
                params![bar_uid, version],
                |row| row.get::<_, Option<f64>>(0),
            )
            .map_err(db_err)
        })
        .await
    }

    async fn retained_count(&self, bar_uid: &str, version: u32) -> StoreResult<u64> {
        let bar_uid = bar_uid.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*)
                 FROM progress_bar_traces t
                 JOIN progress_bars b ON b.id = t.progress_bar_id
                 WHERE b.uid = ?1 AND t.bar_version = ?2",
                params![bar_uid, version],
                |row| row.get::<_, i64>(0),
            )
            .map_err(db_err)
            .map(|n| n.max(0) as u64)
        })
        .await
    }

    async fn evict_oldest_beyond(
        &self,
        bar_uid: &str,
        version: u32,
        keep: u32,
    ) -> StoreResult<Vec<CompletedTrace>> {
        let bar_uid = bar_uid.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let rows: Vec<(i64, String, f64)> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT t.id, t.uid, t.created_at
                         FROM progress_bar_traces t
                         JOIN progress_bars b ON b.id = t.progress_bar_id
                         WHERE b.uid = ?1 AND t.bar_version = ?2
                         ORDER BY t.created_at",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![bar_uid, version], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })
                    .map_err(db_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(db_err)?
            };
            if rows.len() <= keep as usize {
                return Ok(Vec::new());
            }
            let mut evicted = Vec::new();
            for (trace_id, uid, created_at) in &rows[..rows.len() - keep as usize] {
                evicted.push(CompletedTrace {
                    uid: ExternalId::from(uid.as_str()),
                    bar_uid: ExternalId::from(bar_uid.as_str()),
                    bar_version: version,
                    created_at: *created_at,
                    steps: load_trace_steps(&tx, *trace_id)?,
                });
                tx.execute(
                    "DELETE FROM progress_bar_traces WHERE id = ?1",
                    params![trace_id],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(evicted)
        })
        .await
    }

    async fn step_samples(
        &self,
        bar_uid: &str,
        version: u32,
        position: u32,
        min_created_at: f64,
    ) -> StoreResult<Vec<StepSample>> {
        let bar_uid = bar_uid.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT t.uid, ts.iterations, ts.finished_at - ts.started_at AS duration
                     FROM progress_bar_trace_steps ts
                     JOIN progress_bar_traces t ON t.id = ts.progress_bar_trace_id
                     JOIN progress_bars b ON b.id = t.progress_bar_id
                     WHERE b.uid = ?1 AND t.bar_version = ?2 AND ts.position = ?3
                       AND t.created_at >= ?4
                     ORDER BY duration",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![bar_uid, version, position, min_created_at], |row| {
                    Ok(StepSample {
                        trace_uid: row.get(0)?,
                        iterations: row.get::<_, Option<u32>>(1)?,
                        duration: row.get(2)?,
                    })
                })
                .map_err(db_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
        })
        .await
    }
}
