//! Keeps a workbook sheet and its relational mirror in step.
//!
//! Single mutations go to the mirror first for add and update (the id comes
//! from the database) and last for delete. The workbook write is never
//! blocked by a mirror failure; the failure is reported in the outcome.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use crate::codec;
use crate::error::{Result, StoreError};
use crate::io::csv_import::{self, CsvLine};
use crate::io::store;
use crate::mirror::RelationalMirror;
use crate::model::{Record, RecordId, Schema, SheetRow};

/// What happened on the mirror side of a single mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorStatus {
    /// No mirror is configured.
    Disabled,
    Synced,
    /// The workbook changed but the mirror did not follow.
    Failed(String),
}

impl MirrorStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, MirrorStatus::Failed(_))
    }

    fn failed(error: &StoreError) -> Self {
        MirrorStatus::Failed(error.to_string())
    }
}

impl fmt::Display for MirrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorStatus::Disabled => f.write_str("not mirrored"),
            MirrorStatus::Synced => f.write_str("mirrored"),
            MirrorStatus::Failed(reason) => write!(f, "mirror failed: {reason}"),
        }
    }
}

/// Result of an add, update or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    pub row_index: u32,
    pub id: Option<RecordId>,
    pub mirror: MirrorStatus,
}

/// A row or line a batch operation had to skip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    /// Sheet row index or source line number.
    pub row: u64,
    pub reason: String,
}

/// Counts of a batch operation. Failed rows never abort the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<RowFailure>,
}

impl BatchSummary {
    pub(crate) fn success(&mut self) {
        self.succeeded += 1;
    }

    pub(crate) fn failure(&mut self, row: u64, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(row, reason = %reason, "row skipped");
        self.failed += 1;
        self.failures.push(RowFailure { row, reason });
    }
}

/// Drives one sheet of one workbook file, optionally mirrored.
#[derive(Debug, Clone)]
pub struct SyncOrchestrator {
    path: PathBuf,
    sheet: String,
    schema: Schema,
    mirror: Option<RelationalMirror>,
}

impl SyncOrchestrator {
    pub fn new(path: impl Into<PathBuf>, sheet: impl Into<String>, schema: Schema) -> Self {
        Self {
            path: path.into(),
            sheet: sheet.into(),
            schema,
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, mirror: RelationalMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sheet(&self) -> &str {
        &self.sheet
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn mirror(&self) -> Option<&RelationalMirror> {
        self.mirror.as_ref()
    }

    /// Makes sure the sheet and its header exist, then tries to create the
    /// mirror table. A mirror failure is reported, not returned.
    #[instrument(level = "info", skip_all, fields(path = %self.path.display(), sheet = %self.sheet))]
    pub async fn prepare(&self) -> Result<MirrorStatus> {
        store::ensure_sheet(&self.path, &self.sheet)?;
        store::ensure_header_row(&self.path, &self.sheet, &self.schema)?;

        let Some(mirror) = &self.mirror else {
            return Ok(MirrorStatus::Disabled);
        };
        Ok(match mirror.ensure_schema().await {
            Ok(()) => MirrorStatus::Synced,
            Err(error) => {
                warn!(error = %error, "mirror table unavailable");
                MirrorStatus::failed(&error)
            }
        })
    }

    /// Data rows of the sheet, header excluded.
    pub fn rows(&self) -> Result<Vec<SheetRow>> {
        Ok(store::data_rows(
            store::read_rows(&self.path, &self.sheet)?,
            &self.schema,
        ))
    }

    pub fn search(&self, keyword: &str) -> Result<Vec<SheetRow>> {
        store::search_rows(&self.path, &self.sheet, &self.schema, keyword)
    }

    /// Inserts into the mirror, then appends the row with the new id. When
    /// the mirror insert fails the row is still written, without an id.
    #[instrument(level = "info", skip_all, fields(path = %self.path.display(), sheet = %self.sheet))]
    pub async fn add(&self, record: &Record) -> Result<MutationOutcome> {
        let (id, mirror) = match &self.mirror {
            None => (None, MirrorStatus::Disabled),
            Some(mirror) => match mirror.insert(record).await {
                Ok(id) => (Some(id), MirrorStatus::Synced),
                Err(error) => {
                    warn!(error = %error, "mirror insert failed, writing row without id");
                    (None, MirrorStatus::failed(&error))
                }
            },
        };

        let row_index = store::add_row(&self.path, &self.sheet, &codec::encode_row(id, record))?;
        info!(row = row_index, id, "row added");
        Ok(MutationOutcome {
            row_index,
            id,
            mirror,
        })
    }

    /// Replaces row `row_index`. `None` when the row does not exist, in which
    /// case nothing is touched.
    #[instrument(level = "info", skip_all, fields(path = %self.path.display(), sheet = %self.sheet, row = row_index))]
    pub async fn update(&self, row_index: u32, record: &Record) -> Result<Option<MutationOutcome>> {
        let Some(row) = store::find_row(&self.path, &self.sheet, row_index)? else {
            return Ok(None);
        };
        self.reject_header(&row)?;

        let current = row.record_id();
        let (id, mirror) = match &self.mirror {
            None => (current, MirrorStatus::Disabled),
            Some(mirror) => match current {
                Some(id) => match mirror.update(id, record).await {
                    Ok(true) => (Some(id), MirrorStatus::Synced),
                    Ok(false) => {
                        warn!(id, "mirror row missing, inserting it again");
                        self.insert_or_keep(mirror, record, Some(id)).await
                    }
                    Err(error) => {
                        warn!(error = %error, "mirror update failed");
                        (Some(id), MirrorStatus::failed(&error))
                    }
                },
                None => self.insert_or_keep(mirror, record, None).await,
            },
        };

        let values = codec::encode_row(id, record);
        if !store::update_row(&self.path, &self.sheet, row_index, &values)? {
            return Ok(None);
        }
        info!(id, "row updated");
        Ok(Some(MutationOutcome {
            row_index,
            id,
            mirror,
        }))
    }

    /// Removes row `row_index`, then its mirror row. `None` when the row does
    /// not exist.
    #[instrument(level = "info", skip_all, fields(path = %self.path.display(), sheet = %self.sheet, row = row_index))]
    pub async fn delete(&self, row_index: u32) -> Result<Option<MutationOutcome>> {
        let Some(row) = store::find_row(&self.path, &self.sheet, row_index)? else {
            return Ok(None);
        };
        self.reject_header(&row)?;

        if !store::delete_row(&self.path, &self.sheet, row_index)? {
            return Ok(None);
        }

        let id = row.record_id();
        let mirror = match (&self.mirror, id) {
            (None, _) => MirrorStatus::Disabled,
            (Some(_), None) => MirrorStatus::Synced,
            (Some(mirror), Some(id)) => match mirror.delete(id).await {
                Ok(true) => MirrorStatus::Synced,
                Ok(false) => {
                    warn!(id, "no mirror row to delete");
                    MirrorStatus::Failed(format!("mirror row {id} not found"))
                }
                Err(error) => {
                    warn!(error = %error, "mirror delete failed");
                    MirrorStatus::failed(&error)
                }
            },
        };
        info!(id, "row deleted");
        Ok(Some(MutationOutcome {
            row_index,
            id,
            mirror,
        }))
    }

    /// Deletes every data row, last row first, keeping the header.
    #[instrument(level = "info", skip_all, fields(path = %self.path.display(), sheet = %self.sheet))]
    pub async fn delete_all(&self) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        for row in self.rows()?.into_iter().rev() {
            match self.delete(row.index).await {
                Ok(Some(outcome)) => match outcome.mirror {
                    MirrorStatus::Failed(reason) => {
                        summary.failure(u64::from(row.index), format!("removed, {reason}"))
                    }
                    _ => summary.success(),
                },
                Ok(None) => summary.failure(u64::from(row.index), "row vanished"),
                Err(error) => summary.failure(u64::from(row.index), error.to_string()),
            }
        }
        info!(deleted = summary.succeeded, failed = summary.failed, "delete all finished");
        Ok(summary)
    }

    /// Adds one row per line of the CSV file at `csv`.
    #[instrument(level = "info", skip_all, fields(path = %self.path.display(), csv = %csv.display()))]
    pub async fn import_csv(&self, csv: &Path) -> Result<BatchSummary> {
        let lines = csv_import::read_file(csv, &self.schema)?;
        self.bulk_insert(&lines).await
    }

    /// Adds one row per line. Lines that cannot be split or have fewer fields
    /// than the schema are malformed and counted as failures, as are rows
    /// written without a mirror id. With a mirror configured, the mirror table
    /// is checked once up front and a connection failure aborts the batch.
    pub async fn bulk_insert(&self, lines: &[CsvLine]) -> Result<BatchSummary> {
        if let Some(mirror) = &self.mirror {
            mirror.ensure_schema().await?;
        }

        let mut summary = BatchSummary::default();
        for line in lines {
            let decoded = line
                .fields
                .as_ref()
                .map_err(Clone::clone)
                .and_then(|fields| {
                    codec::decode_complete(fields, &self.schema).map_err(|error| error.to_string())
                });
            let record = match decoded {
                Ok(record) => record,
                Err(reason) => {
                    summary.failure(line.line, reason);
                    continue;
                }
            };
            match self.add(&record).await {
                Ok(outcome) => match outcome.mirror {
                    MirrorStatus::Failed(reason) => summary.failure(
                        line.line,
                        format!("written to row {} without an id, {reason}", outcome.row_index),
                    ),
                    _ => summary.success(),
                },
                Err(error) => summary.failure(line.line, error.to_string()),
            }
        }
        info!(imported = summary.succeeded, failed = summary.failed, "bulk insert finished");
        Ok(summary)
    }

    /// Workbook → mirror. Rows carrying an id update their mirror row, which
    /// is inserted again when it has gone missing; rows without an id are
    /// inserted. New ids are written back into the sheet in one save. Fails
    /// up front when no mirror is configured or the table cannot be created.
    #[instrument(level = "info", skip_all, fields(path = %self.path.display(), sheet = %self.sheet))]
    pub async fn push_to_mirror(&self) -> Result<BatchSummary> {
        let mirror = self.require_mirror()?;
        mirror.ensure_schema().await?;

        let mut summary = BatchSummary::default();
        let mut assigned = Vec::new();
        for row in self.rows()? {
            let record = match codec::decode_complete(row.fields(), &self.schema) {
                Ok(record) => record,
                Err(error) => {
                    summary.failure(u64::from(row.index), error.to_string());
                    continue;
                }
            };
            let pushed = match row.record_id() {
                Some(id) => match mirror.update(id, &record).await {
                    Ok(true) => Ok(None),
                    Ok(false) => mirror.insert(&record).await.map(Some),
                    Err(error) => Err(error),
                },
                None => mirror.insert(&record).await.map(Some),
            };
            match pushed {
                Ok(Some(id)) => {
                    assigned.push((row.index, codec::encode_row(Some(id), &record)));
                    summary.success();
                }
                Ok(None) => summary.success(),
                Err(error) => summary.failure(u64::from(row.index), error.to_string()),
            }
        }

        store::update_rows(&self.path, &self.sheet, &assigned)?;
        info!(
            synced = summary.succeeded,
            assigned = assigned.len(),
            failed = summary.failed,
            "workbook pushed to mirror"
        );
        Ok(summary)
    }

    /// Mirror → workbook: replaces every data row with the mirror content,
    /// ordered by id. Returns the number of rows written.
    #[instrument(level = "info", skip_all, fields(path = %self.path.display(), sheet = %self.sheet))]
    pub async fn pull_from_mirror(&self) -> Result<usize> {
        let mirror = self.require_mirror()?;
        let records = mirror.read_all().await?;

        store::ensure_sheet(&self.path, &self.sheet)?;
        store::ensure_header_row(&self.path, &self.sheet, &self.schema)?;
        let rows: Vec<Vec<String>> = records
            .iter()
            .map(|(id, record)| codec::encode_row(Some(*id), record))
            .collect();
        store::replace_data_rows(&self.path, &self.sheet, &rows)?;
        info!(rows = rows.len(), "workbook replaced from mirror");
        Ok(rows.len())
    }

    fn require_mirror(&self) -> Result<&RelationalMirror> {
        self.mirror
            .as_ref()
            .ok_or_else(|| StoreError::Validation("no mirror database is configured".into()))
    }

    fn reject_header(&self, row: &SheetRow) -> Result<()> {
        if row.index == 1 && self.schema.matches_header(&row.values) {
            return Err(StoreError::Validation("row 1 is the header row".into()));
        }
        Ok(())
    }

    async fn insert_or_keep(
        &self,
        mirror: &RelationalMirror,
        record: &Record,
        current: Option<RecordId>,
    ) -> (Option<RecordId>, MirrorStatus) {
        match mirror.insert(record).await {
            Ok(id) => (Some(id), MirrorStatus::Synced),
            Err(error) => {
                warn!(error = %error, "mirror insert failed");
                (current, MirrorStatus::failed(&error))
            }
        }
    }
}
