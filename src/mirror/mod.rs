//! Relational copy of the sheet rows, reached through the `sqlx` Any driver.
//!
//! Every operation opens its own connection and closes it afterwards.
//! Establishing the connection goes through the retry and timeout envelope
//! configured on [`MirrorConfig`].

pub mod discovery;
mod sql;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use futures::TryStreamExt;
use sqlx::AnyConnection;
use sqlx::any::AnyRow;
use sqlx::{Any, Connection, Row};
use tracing::{debug, info, instrument, warn};

use crate::codec;
use crate::error::{Result, StoreError};
use crate::model::{FieldKind, FieldValue, Record, RecordId, Schema};
use crate::resilience::{RetryPolicy, with_retry, with_timeout};
use crate::sync::BatchSummary;

pub use sql::{Dialect, sanitize_table_name};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and how to reach the mirror table. Absence of a config means the
/// workbook is not mirrored at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    url: String,
    table: String,
    dialect: Dialect,
    connect_timeout: Duration,
    retry: RetryPolicy,
}

impl MirrorConfig {
    /// `table` is sanitised; the URL scheme selects the dialect.
    pub fn new(url: impl Into<String>, table: &str) -> Result<Self> {
        let url = url.into();
        let dialect = Dialect::from_url(&url)?;
        Ok(Self {
            url,
            table: sanitize_table_name(table),
            dialect,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_connect_timeout(mut self, limit: Duration) -> Self {
        self.connect_timeout = limit;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }
}

/// Opens one connection to `url`, retrying per `retry` with a time limit on
/// every attempt.
pub async fn connect(url: &str, limit: Duration, retry: &RetryPolicy) -> Result<AnyConnection> {
    sqlx::any::install_default_drivers();
    with_retry(retry, "database connect", || {
        let url = url.to_string();
        with_timeout("database connect", limit, async move {
            AnyConnection::connect(&url)
                .await
                .map_err(StoreError::Connection)
        })
    })
    .await
}

/// Creates database `name` on the server behind `server_url` when missing.
/// SQLite files are created on connect, so nothing happens for them.
#[instrument(level = "info", skip_all, fields(database = %name))]
pub async fn ensure_database(server_url: &str, name: &str, limit: Duration) -> Result<()> {
    match Dialect::from_url(server_url)? {
        Dialect::Sqlite => Ok(()),
        Dialect::MySql => {
            if sanitize_table_name(name) != name {
                return Err(StoreError::Validation(format!(
                    "'{name}' is not a valid database name"
                )));
            }
            let mut conn = connect(server_url, limit, &RetryPolicy::once()).await?;
            let result = sqlx::query::<Any>(&sql::create_database(name))
                .execute(&mut conn)
                .await
                .map_err(StoreError::Query);
            close(conn).await;
            result?;
            info!("database ready");
            Ok(())
        }
    }
}

/// Dumps of `table` found in `dir`, newest first. A missing directory holds
/// no dumps.
pub fn dump_files(dir: &Path, table: &str) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::access(dir, err)),
    };
    let prefix = format!("{table}_backup_");
    let mut dumps = Vec::new();
    for entry in entries {
        let path = entry.map_err(|err| StoreError::access(dir, err))?.path();
        let matches = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".sql"));
        if matches && path.is_file() {
            dumps.push(path);
        }
    }
    dumps.sort();
    dumps.reverse();
    Ok(dumps)
}

/// What the server reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: String,
    pub database: Option<String>,
}

/// A mirror table holding one row per record, keyed by the generated id.
#[derive(Debug, Clone)]
pub struct RelationalMirror {
    config: MirrorConfig,
    schema: Schema,
}

impl RelationalMirror {
    pub fn new(config: MirrorConfig, schema: Schema) -> Result<Self> {
        sql::validate_columns(&schema)?;
        Ok(Self { config, schema })
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn connect(&self) -> Result<AnyConnection> {
        connect(
            &self.config.url,
            self.config.connect_timeout,
            &self.config.retry,
        )
        .await
    }

    /// Creates the table when it does not exist yet.
    #[instrument(level = "debug", skip_all, fields(table = %self.config.table))]
    pub async fn ensure_schema(&self) -> Result<()> {
        let statement = sql::create_table(self.config.dialect, &self.config.table, &self.schema);
        let mut conn = self.connect().await?;
        let result = sqlx::query::<Any>(&statement)
            .execute(&mut conn)
            .await
            .map_err(StoreError::Query);
        close(conn).await;
        result?;
        debug!("mirror table ready");
        Ok(())
    }

    /// Inserts `record` and returns the id the database assigned.
    #[instrument(level = "debug", skip_all, fields(table = %self.config.table))]
    pub async fn insert(&self, record: &Record) -> Result<RecordId> {
        let statement = sql::insert(&self.config.table, &self.schema);
        let mut query = sqlx::query::<Any>(&statement);
        for value in self.bind_values(record) {
            query = match value {
                BoundValue::Text(text) => query.bind(text),
                BoundValue::Integer(number) => query.bind(number),
            };
        }

        let mut conn = self.connect().await?;
        let result = query.execute(&mut conn).await.map_err(StoreError::Query);
        close(conn).await;
        let id = result?.last_insert_id().ok_or_else(|| {
            StoreError::NotFound(format!("generated id for {}", self.config.table))
        })?;
        debug!(id, "inserted mirror row");
        Ok(id)
    }

    /// Overwrites row `id`. `false` when no such row exists.
    #[instrument(level = "debug", skip_all, fields(table = %self.config.table, id))]
    pub async fn update(&self, id: RecordId, record: &Record) -> Result<bool> {
        let statement = sql::update(&self.config.table, &self.schema);
        let mut query = sqlx::query::<Any>(&statement);
        for value in self.bind_values(record) {
            query = match value {
                BoundValue::Text(text) => query.bind(text),
                BoundValue::Integer(number) => query.bind(number),
            };
        }
        let query = query.bind(id);

        let mut conn = self.connect().await?;
        let result = query.execute(&mut conn).await.map_err(StoreError::Query);
        close(conn).await;
        Ok(result?.rows_affected() > 0)
    }

    /// Removes row `id`. `false` when no such row exists.
    #[instrument(level = "debug", skip_all, fields(table = %self.config.table, id))]
    pub async fn delete(&self, id: RecordId) -> Result<bool> {
        let statement = sql::delete(&self.config.table);
        let mut conn = self.connect().await?;
        let result = sqlx::query::<Any>(&statement)
            .bind(id)
            .execute(&mut conn)
            .await
            .map_err(StoreError::Query);
        close(conn).await;
        Ok(result?.rows_affected() > 0)
    }

    /// Every mirror row ordered by id.
    #[instrument(level = "debug", skip_all, fields(table = %self.config.table))]
    pub async fn read_all(&self) -> Result<Vec<(RecordId, Record)>> {
        let statement = sql::select_all(self.config.dialect, &self.config.table, &self.schema);
        let mut conn = self.connect().await?;
        let result = {
            let mut rows = sqlx::query::<Any>(&statement).fetch(&mut conn);
            let mut records = Vec::new();
            loop {
                match rows.try_next().await {
                    Ok(Some(row)) => match self.decode_row(&row) {
                        Ok(entry) => records.push(entry),
                        Err(error) => break Err(error),
                    },
                    Ok(None) => break Ok(records),
                    Err(error) => break Err(StoreError::Query(error)),
                }
            }
        };
        close(conn).await;
        let records = result?;
        debug!(rows = records.len(), "read mirror rows");
        Ok(records)
    }

    pub async fn count(&self) -> Result<i64> {
        let statement = sql::count(&self.config.table);
        let mut conn = self.connect().await?;
        let result = sqlx::query::<Any>(&statement)
            .fetch_one(&mut conn)
            .await
            .and_then(|row| row.try_get::<i64, _>(0))
            .map_err(StoreError::Query);
        close(conn).await;
        result
    }

    /// Version and current database of the server, which doubles as a
    /// connection test.
    #[instrument(level = "debug", skip_all, fields(table = %self.config.table))]
    pub async fn server_info(&self) -> Result<ServerInfo> {
        let mut conn = self.connect().await?;
        let result = sqlx::query::<Any>(sql::server_info(self.config.dialect))
            .fetch_one(&mut conn)
            .await
            .and_then(|row| {
                Ok(ServerInfo {
                    version: row.try_get::<String, _>(0)?,
                    database: row.try_get::<Option<String>, _>(1)?,
                })
            })
            .map_err(StoreError::Query);
        close(conn).await;
        result
    }

    /// Writes `<dir>/<table>_backup_<yyyyMMdd_HHmmss>.sql` with the table
    /// definition and one `INSERT` per row.
    #[instrument(level = "info", skip_all, fields(table = %self.config.table, dir = %dir.display()))]
    pub async fn dump(&self, dir: &Path) -> Result<PathBuf> {
        let records = self.read_all().await?;
        let dialect = self.config.dialect;
        let table = &self.config.table;

        let mut script = format!(
            "-- {table} backup taken {}\n{};\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            sql::create_table(dialect, table, &self.schema)
        );
        let columns: Vec<String> = std::iter::once(sql::ID_COLUMN)
            .chain(self.schema.names())
            .map(sql::quote)
            .collect();
        for (id, record) in &records {
            let mut values = vec![id.to_string()];
            values.extend(self.bind_values(record).into_iter().map(|value| match value {
                BoundValue::Text(Some(text)) => dialect.literal(&text),
                BoundValue::Text(None) => "NULL".to_string(),
                BoundValue::Integer(number) => number.to_string(),
            }));
            script.push_str(&format!(
                "{}({}) VALUES ({});\n",
                sql::insert_prefix(table),
                columns.join(", "),
                values.join(", ")
            ));
        }

        fs::create_dir_all(dir).map_err(|err| StoreError::access(dir, err))?;
        let path = dir.join(format!(
            "{table}_backup_{}.sql",
            Local::now().format("%Y%m%d_%H%M%S")
        ));
        fs::write(&path, script).map_err(|err| StoreError::access(&path, err))?;
        info!(rows = records.len(), path = %path.display(), "wrote mirror dump");
        Ok(path)
    }

    /// Empties the table, then replays every `INSERT` line of a script written
    /// by [`dump`](Self::dump). Lines aimed at another table or rejected by
    /// the database are counted as failures; ids are restored as dumped.
    #[instrument(level = "info", skip_all, fields(table = %self.config.table, script = %script.display()))]
    pub async fn restore(&self, script: &Path) -> Result<BatchSummary> {
        let text = fs::read_to_string(script).map_err(|err| StoreError::access(script, err))?;
        let prefix = sql::insert_prefix(&self.config.table);
        let statements: Vec<(u64, &str)> = (1u64..)
            .zip(text.lines())
            .map(|(line, statement)| (line, statement.trim()))
            .filter(|(_, statement)| statement.starts_with("INSERT INTO"))
            .collect();

        self.ensure_schema().await?;
        let mut conn = self.connect().await?;
        let cleared = sqlx::query::<Any>(&sql::clear_table(self.config.dialect, &self.config.table))
            .execute(&mut conn)
            .await;
        if let Err(error) = cleared {
            close(conn).await;
            return Err(StoreError::Query(error));
        }

        let mut summary = BatchSummary::default();
        for (line, statement) in statements {
            if !statement.starts_with(&prefix) {
                summary.failure(line, format!("not a row of {}", self.config.table));
                continue;
            }
            let executed = sqlx::query::<Any>(statement.trim_end_matches(';'))
                .persistent(false)
                .execute(&mut conn)
                .await;
            match executed {
                Ok(_) => summary.success(),
                Err(error) => summary.failure(line, StoreError::Query(error).to_string()),
            }
        }
        close(conn).await;
        info!(restored = summary.succeeded, failed = summary.failed, "mirror restored");
        Ok(summary)
    }

    /// Values in schema order, normalised for the column types.
    fn bind_values(&self, record: &Record) -> Vec<BoundValue> {
        self.schema
            .fields()
            .iter()
            .enumerate()
            .map(|(position, field)| {
                let value = record.get(position);
                match field.kind {
                    FieldKind::Integer => BoundValue::Integer(match value {
                        Some(FieldValue::Integer(number)) => *number,
                        Some(FieldValue::Text(text)) => codec::parse_integer(text),
                        None => 0,
                    }),
                    FieldKind::Date => BoundValue::Text(
                        value
                            .and_then(|value| codec::parse_date(&value.to_string()))
                            .map(|date| date.format("%Y-%m-%d").to_string()),
                    ),
                    FieldKind::Text => BoundValue::Text(Some(
                        value.map(FieldValue::to_string).unwrap_or_default(),
                    )),
                }
            })
            .collect()
    }

    fn decode_row(&self, row: &AnyRow) -> Result<(RecordId, Record)> {
        let id: RecordId = row.try_get(0).map_err(StoreError::Query)?;
        let values = self
            .schema
            .fields()
            .iter()
            .enumerate()
            .map(|(position, field)| {
                let column = position + 1;
                Ok(match field.kind {
                    FieldKind::Integer => FieldValue::Integer(
                        row.try_get::<Option<i64>, _>(column)
                            .map_err(StoreError::Query)?
                            .unwrap_or(0),
                    ),
                    FieldKind::Date | FieldKind::Text => FieldValue::Text(
                        row.try_get::<Option<String>, _>(column)
                            .map_err(StoreError::Query)?
                            .unwrap_or_default(),
                    ),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((id, Record::new(values)))
    }
}

enum BoundValue {
    Text(Option<String>),
    Integer(i64),
}

async fn close(conn: AnyConnection) {
    if let Err(error) = conn.close().await {
        warn!(error = %error, "closing database connection failed");
    }
}
