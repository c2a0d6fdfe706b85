use super::{
    ExecutionStore, LabelSelector, Requirement, RepositoryStore, StoreError, WatchBus, WatchEvent,
    WatchEventKind,
};
use crate::models::{execution::Condition, ExecutionKey, ExecutionRecord, Repository, SpecStatus};
use async_trait::async_trait;
use futures::TryFutureExt;
use serde::{Deserialize, Serialize};
use sqlx::{
    pool::PoolConnection, sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, Execute,
    FromRow, Pool, QueryBuilder, Sqlite, Transaction,
};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use std::{fs::File, io, ops::Deref, path::Path};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Journal rows older than this are pruned. A watcher that falls further behind relies on resync.
const JOURNAL_RETENTION: Duration = Duration::from_secs(600);

/// How often one process prunes the journal.
const JOURNAL_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on journal rows published per poll.
const JOURNAL_BATCH: i64 = 1000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS execution_records (
    namespace        TEXT    NOT NULL,
    name             TEXT    NOT NULL,
    created          INTEGER NOT NULL,
    resource_version INTEGER NOT NULL,
    spec_status      TEXT    NOT NULL,
    conditions       TEXT    NOT NULL,
    PRIMARY KEY (namespace, name)
) STRICT;

CREATE TABLE IF NOT EXISTS execution_record_labels (
    namespace TEXT NOT NULL,
    name      TEXT NOT NULL,
    key       TEXT NOT NULL,
    value     TEXT NOT NULL,
    FOREIGN KEY (namespace, name) REFERENCES execution_records(namespace, name) ON DELETE CASCADE,
    PRIMARY KEY (namespace, name, key)
) STRICT;

CREATE INDEX IF NOT EXISTS idx_execution_record_labels_kv ON execution_record_labels (key, value);

CREATE TABLE IF NOT EXISTS execution_changes (
    revision  INTEGER PRIMARY KEY AUTOINCREMENT,
    kind      TEXT    NOT NULL,
    changed   INTEGER NOT NULL,
    record    TEXT    NOT NULL
) STRICT;

CREATE INDEX IF NOT EXISTS idx_execution_changes_changed ON execution_changes (changed);

CREATE TABLE IF NOT EXISTS repositories (
    namespace         TEXT    NOT NULL,
    name              TEXT    NOT NULL,
    url               TEXT    NOT NULL,
    concurrency_limit INTEGER,
    PRIMARY KEY (namespace, name)
) STRICT;"#;

#[derive(Deserialize, Serialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub path: String,

    /// How often (in milliseconds) the change journal is checked for writes made by other processes. 0 turns
    /// polling off and watchers only see writes made through this process.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

fn default_poll_interval() -> u64 {
    500
}

#[derive(Debug, Clone)]
pub struct Engine {
    write_pool: Pool<Sqlite>,
    read_pool: Pool<Sqlite>,
    watch: WatchBus,
    changes: Arc<ChangeFeed>,
}

/// Follows the change journal every process writes to, so watchers see writes from other processes too.
#[derive(Debug)]
struct ChangeFeed {
    poll_interval: Duration,

    /// Last journal revision looked at.
    cursor: AtomicI64,

    /// Whether a poller task is running.
    polling: AtomicBool,

    /// Revisions written through this engine while polling. They were published when written so the poller
    /// skips them.
    own: Mutex<BTreeSet<i64>>,
}

impl ChangeFeed {
    fn own(&self) -> MutexGuard<'_, BTreeSet<i64>> {
        self.own.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, FromRow)]
struct ExecutionRow {
    namespace: String,
    name: String,
    created: i64,
    resource_version: i64,
    spec_status: String,
    conditions: String,
}

#[derive(Debug, Clone, FromRow)]
struct ChangeRow {
    revision: i64,
    kind: String,
    record: String,
}

#[derive(Debug, Clone, FromRow)]
struct RepositoryRow {
    namespace: String,
    name: String,
    url: String,
    concurrency_limit: Option<i64>,
}

impl From<RepositoryRow> for Repository {
    fn from(row: RepositoryRow) -> Self {
        Repository {
            namespace: row.namespace,
            name: row.name,
            url: row.url,
            concurrency_limit: row.concurrency_limit.map(from_db_int),
        }
    }
}

fn to_db_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

/// Sqlite Errors are determined by database error code. We map these to the specific code so that
/// when we come back with a database error we can detect which one happened.
/// See the codes here: https://www.sqlite.org/rescode.html
fn map_sqlx_error(e: sqlx::Error, query: &str) -> StoreError {
    match e {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(database_err) => {
            if let Some(err_code) = database_err.code() {
                match err_code.deref() {
                    "1555" | "2067" => StoreError::Exists,
                    _ => StoreError::Internal(format!(
                        "Error occurred while running store query; [{err_code}] {database_err}; query: {query}"
                    )),
                }
            } else {
                StoreError::Internal(format!(
                    "Error occurred while running store query; {database_err}; query: {query}"
                ))
            }
        }
        _ => StoreError::Internal(format!(
            "Error occurred while running query; {:#?}; query: {query}",
            e
        )),
    }
}

// Create file if not exists.
fn touch_file(path: &Path) -> io::Result<()> {
    if !path.exists() {
        File::create(path)?;
    }

    Ok(())
}

impl Engine {
    pub async fn new(config: &Config) -> Result<Self, StoreError> {
        touch_file(Path::new(&config.path)).map_err(|e| {
            StoreError::FailedPrecondition(format!(
                "could not create database file '{}'; {e}",
                config.path
            ))
        })?;

        // Reads get a pool of their own. Writes go through a single connection so sqlite never has to arbitrate
        // between concurrent writers and return "database is locked".
        let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.path))
            .map_err(|e| StoreError::FailedPrecondition(format!("invalid sqlite path; {e}")))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Label rows are removed along with their record through the cascade.
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let read_pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(connect_options.clone())
            .await
            .map_err(|e| StoreError::Connection(format!("{:?}", e)))?;

        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .map_err(|e| StoreError::Connection(format!("{:?}", e)))?;

        sqlx::query(SCHEMA)
            .execute(&write_pool)
            .await
            .map_err(|e| map_sqlx_error(e, "schema"))?;

        let (cursor,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(revision), 0) FROM execution_changes;")
                .fetch_one(&read_pool)
                .await
                .map_err(|e| map_sqlx_error(e, "journal cursor"))?;

        debug!(path = config.path, cursor, "sqlite store ready");

        Ok(Engine {
            write_pool,
            read_pool,
            watch: WatchBus::new(),
            changes: Arc::new(ChangeFeed {
                poll_interval: Duration::from_millis(config.poll_interval),
                cursor: AtomicI64::new(cursor),
                polling: AtomicBool::new(false),
                own: Mutex::new(BTreeSet::new()),
            }),
        })
    }

    async fn read_conn(&self) -> Result<PoolConnection<Sqlite>, StoreError> {
        self.read_pool
            .acquire()
            .await
            .map_err(|e| StoreError::Connection(format!("{:?}", e)))
    }

    async fn write_conn(&self) -> Result<PoolConnection<Sqlite>, StoreError> {
        self.write_pool
            .acquire()
            .await
            .map_err(|e| StoreError::Connection(format!("{:?}", e)))
    }

    async fn open_tx(&self) -> Result<Transaction<'_, Sqlite>, StoreError> {
        self.write_pool
            .begin()
            .await
            .map_err(|e| StoreError::Connection(format!("{:?}", e)))
    }

    /// Commits a write that was journaled as `revision` and publishes it to this process' watchers.
    async fn commit_change(
        &self,
        tx: Transaction<'_, Sqlite>,
        revision: i64,
        kind: WatchEventKind,
        record: ExecutionRecord,
    ) -> Result<(), StoreError> {
        let tracked = self.changes.polling.load(Ordering::SeqCst);
        if tracked {
            self.changes.own().insert(revision);
        }

        if let Err(e) = tx.commit().await {
            if tracked {
                self.changes.own().remove(&revision);
            }
            return Err(StoreError::Internal(format!(
                "could not commit transaction; {e}"
            )));
        }

        self.watch.publish(kind, record);
        Ok(())
    }

    /// Starts the journal poller unless it is already running or polling is turned off.
    fn start_polling(&self) {
        if self.changes.poll_interval.is_zero() || self.changes.polling.swap(true, Ordering::SeqCst) {
            return;
        }

        tokio::spawn(self.clone().poll_changes());
    }

    /// Publishes journal entries written by other processes until nobody is watching anymore.
    async fn poll_changes(self) {
        let mut ticker = tokio::time::interval(self.changes.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_prune = Instant::now();

        debug!(poll_interval_ms = self.changes.poll_interval.as_millis() as u64,
            "polling change journal");

        loop {
            ticker.tick().await;

            if self.watch.receiver_count() == 0 {
                self.changes.polling.store(false, Ordering::SeqCst);

                // A watcher may have subscribed in between; only one of us keeps polling.
                if self.watch.receiver_count() == 0
                    || self.changes.polling.swap(true, Ordering::SeqCst)
                {
                    debug!("no watchers left; stopped polling change journal");
                    return;
                }
            }

            if let Err(e) = self.publish_changes().await {
                warn!(error = %e, "could not read change journal");
            }

            if last_prune.elapsed() >= JOURNAL_PRUNE_INTERVAL {
                last_prune = Instant::now();
                if let Err(e) = self.prune_changes().await {
                    warn!(error = %e, "could not prune change journal");
                }
            }
        }
    }

    async fn publish_changes(&self) -> Result<(), StoreError> {
        let after = self.changes.cursor.load(Ordering::SeqCst);
        let mut conn = self.read_conn().await?;

        let query = sqlx::query_as::<_, ChangeRow>(
            "SELECT revision, kind, record FROM execution_changes WHERE revision > ? \
             ORDER BY revision LIMIT ?;",
        )
        .bind(after)
        .bind(JOURNAL_BATCH);

        let sql = query.sql();

        let rows = query
            .fetch_all(&mut *conn)
            .map_err(|e| map_sqlx_error(e, sql))
            .await?;

        let Some(last) = rows.last().map(|row| row.revision) else {
            return Ok(());
        };

        let mut events = vec![];
        {
            let mut own = self.changes.own();

            for row in rows {
                if own.remove(&row.revision) {
                    continue;
                }

                match parse_change(&row) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!(revision = row.revision, error = %e, "skipping unreadable journal entry"),
                }
            }

            own.retain(|revision| *revision > last);
        }

        self.changes.cursor.store(last, Ordering::SeqCst);

        for (kind, record) in events {
            self.watch.publish(kind, record);
        }

        Ok(())
    }

    async fn prune_changes(&self) -> Result<(), StoreError> {
        let cutoff = crate::epoch_milli().saturating_sub(JOURNAL_RETENTION.as_millis() as u64);
        let mut conn = self.write_conn().await?;

        let query = sqlx::query("DELETE FROM execution_changes WHERE changed < ?;")
            .bind(to_db_int(cutoff));

        let sql = query.sql();

        let result = query
            .execute(&mut *conn)
            .map_err(|e| map_sqlx_error(e, sql))
            .await?;

        debug!(pruned = result.rows_affected(), "pruned change journal");
        Ok(())
    }
}

fn parse_change(row: &ChangeRow) -> Result<(WatchEventKind, ExecutionRecord), StoreError> {
    let kind = WatchEventKind::from_str(&row.kind).map_err(|e| {
        StoreError::Internal(format!(
            "could not parse value '{}' for column 'kind'; {e}",
            row.kind
        ))
    })?;

    let record = serde_json::from_str(&row.record).map_err(|e| {
        StoreError::Internal(format!("could not parse value for column 'record'; {e}"))
    })?;

    Ok((kind, record))
}

/// Appends a change to the journal as part of the write's transaction. Returns the change's revision.
async fn journal(
    conn: &mut sqlx::SqliteConnection,
    kind: WatchEventKind,
    record: &ExecutionRecord,
) -> Result<i64, StoreError> {
    let snapshot = serde_json::to_string(record)
        .map_err(|e| StoreError::Internal(format!("could not serialize record; {e}")))?;

    let query = sqlx::query("INSERT INTO execution_changes (kind, changed, record) VALUES (?, ?, ?);")
        .bind(kind.to_string())
        .bind(to_db_int(crate::epoch_milli()))
        .bind(snapshot);

    let sql = query.sql();

    let result = query
        .execute(&mut *conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await?;

    Ok(result.last_insert_rowid())
}

async fn fetch_labels(
    conn: &mut sqlx::SqliteConnection,
    namespace: &str,
    name: &str,
) -> Result<BTreeMap<String, String>, StoreError> {
    let query = sqlx::query_as::<_, (String, String)>(
        "SELECT key, value FROM execution_record_labels WHERE namespace = ? AND name = ?;",
    )
    .bind(namespace)
    .bind(name);

    let sql = query.sql();

    let rows = query
        .fetch_all(&mut *conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await?;

    Ok(rows.into_iter().collect())
}

async fn insert_labels(
    conn: &mut sqlx::SqliteConnection,
    record: &ExecutionRecord,
) -> Result<(), StoreError> {
    for (key, value) in &record.labels {
        let query = sqlx::query(
            "INSERT INTO execution_record_labels (namespace, name, key, value) VALUES (?, ?, ?, ?);",
        )
        .bind(&record.namespace)
        .bind(&record.name)
        .bind(key)
        .bind(value);

        let sql = query.sql();

        query
            .execute(&mut *conn)
            .map_err(|e| map_sqlx_error(e, sql))
            .await?;
    }

    Ok(())
}

async fn fetch_record(
    conn: &mut sqlx::SqliteConnection,
    key: &ExecutionKey,
) -> Result<ExecutionRecord, StoreError> {
    let query = sqlx::query_as::<_, ExecutionRow>(
        "SELECT namespace, name, created, resource_version, spec_status, conditions \
         FROM execution_records WHERE namespace = ? AND name = ?;",
    )
    .bind(&key.namespace)
    .bind(&key.name);

    let sql = query.sql();

    let row = query
        .fetch_one(&mut *conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await?;

    let labels = fetch_labels(conn, &key.namespace, &key.name).await?;
    into_record(row, labels)
}

fn into_record(
    row: ExecutionRow,
    labels: BTreeMap<String, String>,
) -> Result<ExecutionRecord, StoreError> {
    let spec_status = SpecStatus::from_str(&row.spec_status).map_err(|e| {
        StoreError::Internal(format!(
            "could not parse value '{}' for column 'spec_status'; {e}",
            row.spec_status
        ))
    })?;

    let conditions: Vec<Condition> = serde_json::from_str(&row.conditions).map_err(|e| {
        StoreError::Internal(format!(
            "could not parse value '{}' for column 'conditions'; {e}",
            row.conditions
        ))
    })?;

    Ok(ExecutionRecord {
        namespace: row.namespace,
        name: row.name,
        created: from_db_int(row.created),
        resource_version: from_db_int(row.resource_version),
        labels,
        spec_status,
        conditions,
    })
}

fn serialize_conditions(record: &ExecutionRecord) -> Result<String, StoreError> {
    serde_json::to_string(&record.conditions)
        .map_err(|e| StoreError::Internal(format!("could not serialize conditions; {e}")))
}

#[async_trait]
impl ExecutionStore for Engine {
    async fn list_executions(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut conn = self.read_conn().await?;

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT r.namespace, r.name, r.created, r.resource_version, r.spec_status, r.conditions \
             FROM execution_records r WHERE 1 = 1",
        );

        if let Some(namespace) = namespace {
            builder.push(" AND r.namespace = ");
            builder.push_bind(namespace.to_string());
        }

        // Each requirement is answered by the (key, value) index on the labels table.
        for requirement in selector.requirements() {
            builder.push(
                " AND EXISTS (SELECT 1 FROM execution_record_labels l \
                 WHERE l.namespace = r.namespace AND l.name = r.name AND l.key = ",
            );

            match requirement {
                Requirement::Equals { key, value } => {
                    builder.push_bind(key.clone());
                    builder.push(" AND l.value = ");
                    builder.push_bind(value.clone());
                }
                Requirement::Exists { key } => {
                    builder.push_bind(key.clone());
                }
            }

            builder.push(")");
        }

        builder.push(" ORDER BY r.namespace, r.name;");

        let sql = builder.sql().to_string();

        let rows = builder
            .build_query_as::<ExecutionRow>()
            .fetch_all(&mut *conn)
            .map_err(|e| map_sqlx_error(e, &sql))
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let labels = fetch_labels(&mut conn, &row.namespace, &row.name).await?;
            records.push(into_record(row, labels)?);
        }

        Ok(records)
    }

    async fn get_execution(&self, key: &ExecutionKey) -> Result<ExecutionRecord, StoreError> {
        let mut conn = self.read_conn().await?;
        fetch_record(&mut conn, key).await
    }

    async fn create_execution(
        &self,
        record: &ExecutionRecord,
    ) -> Result<ExecutionRecord, StoreError> {
        let mut stored = record.clone();
        stored.resource_version = 1;

        let conditions = serialize_conditions(&stored)?;

        let mut tx = self.open_tx().await?;

        let query = sqlx::query(
            "INSERT INTO execution_records (namespace, name, created, resource_version, spec_status, conditions) \
             VALUES (?, ?, ?, ?, ?, ?);",
        )
        .bind(&stored.namespace)
        .bind(&stored.name)
        .bind(to_db_int(stored.created))
        .bind(to_db_int(stored.resource_version))
        .bind(stored.spec_status.to_string())
        .bind(conditions);

        let sql = query.sql();

        query
            .execute(&mut *tx)
            .map_err(|e| map_sqlx_error(e, sql))
            .await?;

        insert_labels(&mut tx, &stored).await?;
        let revision = journal(&mut tx, WatchEventKind::Added, &stored).await?;

        self.commit_change(tx, revision, WatchEventKind::Added, stored.clone())
            .await?;
        Ok(stored)
    }

    async fn update_execution(
        &self,
        record: &ExecutionRecord,
    ) -> Result<ExecutionRecord, StoreError> {
        let conditions = serialize_conditions(record)?;

        let mut tx = self.open_tx().await?;

        let query = sqlx::query(
            "UPDATE execution_records SET spec_status = ?, conditions = ?, resource_version = resource_version + 1 \
             WHERE namespace = ? AND name = ? AND resource_version = ?;",
        )
        .bind(record.spec_status.to_string())
        .bind(conditions)
        .bind(&record.namespace)
        .bind(&record.name)
        .bind(to_db_int(record.resource_version));

        let sql = query.sql();

        let result = query
            .execute(&mut *tx)
            .map_err(|e| map_sqlx_error(e, sql))
            .await?;

        if result.rows_affected() == 0 {
            // Either the record is gone or somebody else got there first. The transaction rolls back on drop.
            return match fetch_record(&mut tx, &record.key()).await {
                Ok(_) => Err(StoreError::Conflict),
                Err(e) => Err(e),
            };
        }

        let query = sqlx::query(
            "DELETE FROM execution_record_labels WHERE namespace = ? AND name = ?;",
        )
        .bind(&record.namespace)
        .bind(&record.name);

        let sql = query.sql();

        query
            .execute(&mut *tx)
            .map_err(|e| map_sqlx_error(e, sql))
            .await?;

        insert_labels(&mut tx, record).await?;

        let stored = fetch_record(&mut tx, &record.key()).await?;
        let revision = journal(&mut tx, WatchEventKind::Modified, &stored).await?;

        self.commit_change(tx, revision, WatchEventKind::Modified, stored.clone())
            .await?;
        Ok(stored)
    }

    async fn delete_execution(&self, key: &ExecutionKey) -> Result<(), StoreError> {
        let mut tx = self.open_tx().await?;

        let removed = fetch_record(&mut tx, key).await?;

        let query = sqlx::query("DELETE FROM execution_records WHERE namespace = ? AND name = ?;")
            .bind(&key.namespace)
            .bind(&key.name);

        let sql = query.sql();

        query
            .execute(&mut *tx)
            .map_err(|e| map_sqlx_error(e, sql))
            .await?;

        let revision = journal(&mut tx, WatchEventKind::Deleted, &removed).await?;

        self.commit_change(tx, revision, WatchEventKind::Deleted, removed)
            .await
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        // Subscribe first so the poller never sees zero watchers on its first tick.
        let receiver = self.watch.subscribe();
        self.start_polling();
        receiver
    }
}

#[async_trait]
impl RepositoryStore for Engine {
    async fn list_repositories(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<Repository>, StoreError> {
        let mut conn = self.read_conn().await?;

        let query = sqlx::query_as::<_, RepositoryRow>(
            "SELECT namespace, name, url, concurrency_limit FROM repositories \
             WHERE (?1 IS NULL OR namespace = ?1) ORDER BY namespace, name;",
        )
        .bind(namespace);

        let sql = query.sql();

        let rows = query
            .fetch_all(&mut *conn)
            .map_err(|e| map_sqlx_error(e, sql))
            .await?;

        Ok(rows.into_iter().map(Repository::from).collect())
    }

    async fn get_repository(&self, namespace: &str, name: &str) -> Result<Repository, StoreError> {
        let mut conn = self.read_conn().await?;

        let query = sqlx::query_as::<_, RepositoryRow>(
            "SELECT namespace, name, url, concurrency_limit FROM repositories WHERE namespace = ? AND name = ?;",
        )
        .bind(namespace)
        .bind(name);

        let sql = query.sql();

        query
            .fetch_one(&mut *conn)
            .map_ok(Repository::from)
            .map_err(|e| map_sqlx_error(e, sql))
            .await
    }

    async fn create_repository(&self, repository: &Repository) -> Result<(), StoreError> {
        let mut conn = self.write_conn().await?;

        let query = sqlx::query(
            "INSERT INTO repositories (namespace, name, url, concurrency_limit) VALUES (?, ?, ?, ?);",
        )
        .bind(&repository.namespace)
        .bind(&repository.name)
        .bind(&repository.url)
        .bind(repository.concurrency_limit.map(to_db_int));

        let sql = query.sql();

        query
            .execute(&mut *conn)
            .map_ok(|_| ())
            .map_err(|e| map_sqlx_error(e, sql))
            .await
    }

    async fn delete_repository(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut conn = self.write_conn().await?;

        let query = sqlx::query("DELETE FROM repositories WHERE namespace = ? AND name = ?;")
            .bind(namespace)
            .bind(name);

        let sql = query.sql();

        let result = query
            .execute(&mut *conn)
            .map_err(|e| map_sqlx_error(e, sql))
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        Ok(())
    }
}
