//! Row-level operations against one sheet of a workbook file.
//!
//! Every call opens the package, applies one change and saves it again; no
//! handle is kept between calls, so each operation sees what is on disk.

use std::path::Path;

use tracing::{debug, info, instrument};

use crate::error::{Result, StoreError};
use crate::io::workbook::Workbook;
use crate::io::worksheet::Worksheet;
use crate::model::{Schema, SheetRow};

/// Creates the workbook and/or the sheet when missing. Returns `true` when
/// anything was created.
#[instrument(level = "debug", skip_all, fields(path = %path.display(), sheet = %sheet))]
pub fn ensure_sheet(path: &Path, sheet: &str) -> Result<bool> {
    let mut workbook = Workbook::open_or_create(path)?;
    if workbook.find_sheet(sheet).is_some() {
        return Ok(false);
    }
    workbook.add_sheet(sheet)?;
    workbook.save()?;
    info!("created sheet");
    Ok(true)
}

/// Makes row 1 the `["Id", ...fields]` header. Returns `true` when a header
/// row was written.
#[instrument(level = "debug", skip_all, fields(path = %path.display(), sheet = %sheet))]
pub fn ensure_header_row(path: &Path, sheet: &str, schema: &Schema) -> Result<bool> {
    let mut workbook = Workbook::open(path)?;
    let mut worksheet = workbook.worksheet(sheet)?;

    if let Some(first) = worksheet.row(1) {
        if schema.matches_header(&first.values(workbook.shared_strings())?) {
            return Ok(false);
        }
    }

    let shifted = worksheet.row(1).is_some();
    worksheet.insert_first_row(&schema.header_row(), workbook.shared_strings_mut())?;
    workbook.put_worksheet(sheet, &worksheet)?;
    workbook.save()?;
    info!(shifted, "wrote header row");
    Ok(true)
}

/// Every row of the sheet, header included, with shared strings resolved.
#[instrument(level = "debug", skip_all, fields(path = %path.display(), sheet = %sheet))]
pub fn read_rows(path: &Path, sheet: &str) -> Result<Vec<SheetRow>> {
    let workbook = Workbook::open(path)?;
    let worksheet = workbook.worksheet(sheet)?;
    collect_rows(&worksheet, &workbook)
}

/// The row stored at `index`, if any.
pub fn find_row(path: &Path, sheet: &str, index: u32) -> Result<Option<SheetRow>> {
    let workbook = Workbook::open(path)?;
    let worksheet = workbook.worksheet(sheet)?;
    worksheet
        .row(index)
        .map(|row| {
            Ok(SheetRow {
                index: row.index,
                values: row.values(workbook.shared_strings())?,
            })
        })
        .transpose()
}

/// Appends `values` as a new row and returns its index.
#[instrument(level = "debug", skip_all, fields(path = %path.display(), sheet = %sheet))]
pub fn add_row(path: &Path, sheet: &str, values: &[String]) -> Result<u32> {
    let mut workbook = Workbook::open(path)?;
    let mut worksheet = workbook.worksheet(sheet)?;
    let index = worksheet.append_row(values, workbook.shared_strings_mut())?;
    workbook.put_worksheet(sheet, &worksheet)?;
    workbook.save()?;
    debug!(row = index, "appended row");
    Ok(index)
}

/// Replaces the cells of row `index`. `false` when no such row exists.
#[instrument(level = "debug", skip_all, fields(path = %path.display(), sheet = %sheet, row = index))]
pub fn update_row(path: &Path, sheet: &str, index: u32, values: &[String]) -> Result<bool> {
    check_index(index)?;
    let mut workbook = Workbook::open(path)?;
    let mut worksheet = workbook.worksheet(sheet)?;
    if !worksheet.replace_row(index, values, workbook.shared_strings_mut())? {
        return Ok(false);
    }
    workbook.put_worksheet(sheet, &worksheet)?;
    workbook.save()?;
    debug!("updated row");
    Ok(true)
}

/// Removes row `index` without renumbering later rows. `false` when absent.
#[instrument(level = "debug", skip_all, fields(path = %path.display(), sheet = %sheet, row = index))]
pub fn delete_row(path: &Path, sheet: &str, index: u32) -> Result<bool> {
    check_index(index)?;
    let mut workbook = Workbook::open(path)?;
    let mut worksheet = workbook.worksheet(sheet)?;
    if !worksheet.remove_row(index) {
        return Ok(false);
    }
    workbook.put_worksheet(sheet, &worksheet)?;
    workbook.save()?;
    debug!("deleted row");
    Ok(true)
}

/// Replaces several rows in one save. Returns how many rows existed.
#[instrument(level = "debug", skip_all, fields(path = %path.display(), sheet = %sheet, rows = updates.len()))]
pub fn update_rows(path: &Path, sheet: &str, updates: &[(u32, Vec<String>)]) -> Result<usize> {
    if updates.is_empty() {
        return Ok(0);
    }
    let mut workbook = Workbook::open(path)?;
    let mut worksheet = workbook.worksheet(sheet)?;
    let mut replaced = 0;
    for (index, values) in updates {
        check_index(*index)?;
        if worksheet.replace_row(*index, values, workbook.shared_strings_mut())? {
            replaced += 1;
        }
    }
    workbook.put_worksheet(sheet, &worksheet)?;
    workbook.save()?;
    Ok(replaced)
}

/// Drops every row below the header and appends `rows` in order, all in one
/// save. Row numbering restarts right after the header.
#[instrument(level = "debug", skip_all, fields(path = %path.display(), sheet = %sheet, rows = rows.len()))]
pub fn replace_data_rows(path: &Path, sheet: &str, rows: &[Vec<String>]) -> Result<Vec<u32>> {
    let mut workbook = Workbook::open(path)?;
    let mut worksheet = workbook.worksheet(sheet)?;
    worksheet.clear_below_first_row();
    let indices = rows
        .iter()
        .map(|values| worksheet.append_row(values, workbook.shared_strings_mut()))
        .collect::<Result<Vec<_>>>()?;
    workbook.put_worksheet(sheet, &worksheet)?;
    workbook.save()?;
    Ok(indices)
}

/// Data rows whose cells contain `keyword`, ignoring case. Row 1 is skipped
/// when it is the header of `schema`.
pub fn search_rows(path: &Path, sheet: &str, schema: &Schema, keyword: &str) -> Result<Vec<SheetRow>> {
    let needle = keyword.to_lowercase();
    Ok(data_rows(read_rows(path, sheet)?, schema)
        .into_iter()
        .filter(|row| {
            row.values
                .iter()
                .any(|value| value.to_lowercase().contains(&needle))
        })
        .collect())
}

/// Drops the header row from `rows` when it matches `schema`.
pub fn data_rows(rows: Vec<SheetRow>, schema: &Schema) -> Vec<SheetRow> {
    rows.into_iter()
        .filter(|row| !(row.index == 1 && schema.matches_header(&row.values)))
        .collect()
}

fn collect_rows(worksheet: &Worksheet, workbook: &Workbook) -> Result<Vec<SheetRow>> {
    worksheet
        .rows()
        .iter()
        .map(|row| {
            Ok(SheetRow {
                index: row.index,
                values: row.values(workbook.shared_strings())?,
            })
        })
        .collect()
}

fn check_index(index: u32) -> Result<()> {
    if index == 0 {
        return Err(StoreError::Validation("row indices start at 1".into()));
    }
    Ok(())
}
