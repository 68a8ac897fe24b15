// 📒 Workbench datasets - spreadsheets waiting to be uploaded
//
// A dataset keeps its header, its rows, the plan mapping them, one
// disambiguation map per row and the results of the last upload or
// validation. Only a committed upload marks it uploaded; only an uploaded
// dataset can be unuploaded.

use crate::error::{Error, Result};
use crate::schema::{FieldValue, Record};
use crate::upload::batch::{BatchOutcome, UploadOptions, Uploader};
use crate::upload::bind::Row;
use crate::upload::disambiguation::Disambiguation;
use crate::upload::plan::UploadPlan;
use crate::upload::results::UploadResult;
use crate::upload::unupload::{UnuploadSummary, Unuploader};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    /// No row failed
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub uploading_agent_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub id: i64,
    pub name: String,
    pub collection_id: i64,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub upload_plan: Option<UploadPlan>,
    /// One entry per row
    pub row_disambiguation: Vec<Option<Disambiguation>>,
    /// Results of the last upload or validation
    pub row_results: Option<Vec<UploadResult>>,
    pub upload_status: Option<UploadStatus>,
}

impl Dataset {
    pub fn is_uploaded(&self) -> bool {
        self.upload_status.is_some()
    }

    /// Rows keyed by column header
    pub fn rows_as_maps(&self) -> Vec<Row> {
        self.rows
            .iter()
            .map(|cells| {
                self.columns
                    .iter()
                    .zip(cells.iter())
                    .map(|(column, cell)| (column.clone(), cell.clone()))
                    .collect()
            })
            .collect()
    }
}

// ============================================================================
// STORAGE
// ============================================================================

pub fn create_dataset(
    conn: &Connection,
    name: &str,
    collection_id: i64,
    columns: &[String],
    rows: &[Vec<String>],
) -> Result<i64> {
    if let Some((index, _)) = rows.iter().enumerate().find(|(_, r)| r.len() != columns.len()) {
        return Err(Error::InvalidInput(format!(
            "row {} has a different number of cells than the header",
            index
        )));
    }
    conn.execute(
        "INSERT INTO spdataset (name, collectionid, columns, data, rowdisambiguation)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            name,
            collection_id,
            serde_json::to_string(columns)?,
            serde_json::to_string(rows)?,
            serde_json::to_string(&vec![None::<Disambiguation>; rows.len()])?,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Create a dataset from a CSV file with a header row
pub fn import_csv<P: AsRef<Path>>(conn: &Connection, path: P, name: &str, collection_id: i64) -> Result<i64> {
    let mut reader = csv::Reader::from_path(path.as_ref())?;
    let columns: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }

    let id = create_dataset(conn, name, collection_id, &columns, &rows)?;
    info!(dataset = id, rows = rows.len(), columns = columns.len(), "imported CSV");
    Ok(id)
}

fn from_json<T: serde::de::DeserializeOwned>(text: Option<String>) -> Result<Option<T>> {
    match text {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn load_dataset(conn: &Connection, id: i64) -> Result<Dataset> {
    let row = conn
        .query_row(
            "SELECT name, collectionid, columns, data, uploadplan, rowdisambiguation, rowresults, uploadresult
             FROM spdataset WHERE spdatasetid = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("dataset {}", id)))?;
    let (name, collection_id, columns, data, plan, disambiguation, results, status) = row;

    let rows: Vec<Vec<String>> = serde_json::from_str(&data)?;
    let mut row_disambiguation: Vec<Option<Disambiguation>> = from_json(disambiguation)?.unwrap_or_default();
    row_disambiguation.resize(rows.len(), None);

    Ok(Dataset {
        id,
        name,
        collection_id,
        columns: serde_json::from_str(&columns)?,
        rows,
        upload_plan: from_json(plan)?,
        row_disambiguation,
        row_results: from_json(results)?,
        upload_status: from_json(status)?,
    })
}

pub fn set_upload_plan(conn: &Connection, id: i64, plan: &UploadPlan) -> Result<()> {
    let dataset = load_dataset(conn, id)?;
    if dataset.is_uploaded() {
        return Err(Error::InvalidInput(format!("dataset {} is already uploaded", id)));
    }
    conn.execute(
        "UPDATE spdataset SET uploadplan = ?1, rowresults = NULL WHERE spdatasetid = ?2",
        params![serde_json::to_string(plan)?, id],
    )?;
    Ok(())
}

/// Choose existing records for one row; `None` clears the choice
pub fn set_row_disambiguation(
    conn: &Connection,
    id: i64,
    row: usize,
    disambiguation: Option<Disambiguation>,
) -> Result<()> {
    let mut dataset = load_dataset(conn, id)?;
    let slot = dataset
        .row_disambiguation
        .get_mut(row)
        .ok_or_else(|| Error::InvalidInput(format!("dataset {} has no row {}", id, row)))?;
    *slot = disambiguation.filter(|d| !d.is_empty());
    conn.execute(
        "UPDATE spdataset SET rowdisambiguation = ?1 WHERE spdatasetid = ?2",
        params![serde_json::to_string(&dataset.row_disambiguation)?, id],
    )?;
    Ok(())
}

// ============================================================================
// UPLOAD / UNUPLOAD
// ============================================================================

/// Upload (or with `no_commit`, validate) every row of a dataset
pub fn upload_dataset(
    conn: &mut Connection,
    uploader: &Uploader,
    id: i64,
    options: UploadOptions,
) -> Result<BatchOutcome> {
    let dataset = load_dataset(conn, id)?;
    if dataset.is_uploaded() {
        return Err(Error::InvalidInput(format!("dataset {} is already uploaded", id)));
    }
    if dataset.collection_id != uploader.collection.collection_id {
        return Err(Error::InvalidInput(format!(
            "dataset {} belongs to collection {}",
            id, dataset.collection_id
        )));
    }
    let plan = dataset
        .upload_plan
        .as_ref()
        .ok_or_else(|| Error::InvalidInput(format!("dataset {} has no upload plan", id)))?;
    let missing: Vec<String> = plan
        .columns()
        .into_iter()
        .filter(|c| !dataset.columns.contains(c))
        .collect();
    if !missing.is_empty() {
        return Err(Error::Plan(format!("columns not in dataset: {}", missing.join(", "))));
    }

    let outcome = uploader.run(conn, plan, &dataset.rows_as_maps(), &dataset.row_disambiguation, options)?;

    let results_json = serde_json::to_string(&outcome.results)?;
    let status = if outcome.committed {
        Some(UploadStatus {
            success: outcome.success(),
            timestamp: Utc::now(),
            uploading_agent_id: uploader.agent_id,
        })
    } else {
        None
    };
    let status_json = status.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "UPDATE spdataset SET rowresults = ?1, uploadresult = ?2 WHERE spdatasetid = ?3",
        params![results_json, status_json, id],
    )?;

    if let Some(status) = &status_json {
        let mut changed = Record::new();
        changed.insert("uploadresult".to_string(), FieldValue::Text(status.clone()));
        uploader
            .collaborators
            .auditor
            .update(conn, "spdataset", id, uploader.agent_id, &changed)?;
    }
    info!(dataset = id, committed = outcome.committed, success = outcome.success(), "dataset processed");
    Ok(outcome)
}

pub fn unupload_dataset(conn: &mut Connection, unuploader: &Unuploader, id: i64) -> Result<UnuploadSummary> {
    let dataset = load_dataset(conn, id)?;
    if !dataset.is_uploaded() {
        return Err(Error::InvalidInput(format!("dataset {} has not been uploaded", id)));
    }
    let results = dataset.row_results.unwrap_or_default();

    let summary = unuploader.unupload(conn, &results)?;

    conn.execute(
        "UPDATE spdataset SET rowresults = NULL, uploadresult = NULL WHERE spdatasetid = ?1",
        params![id],
    )?;
    let mut changed = Record::new();
    changed.insert("uploadresult".to_string(), FieldValue::Null);
    unuploader
        .collaborators
        .auditor
        .update(conn, "spdataset", id, unuploader.agent_id, &changed)?;
    info!(dataset = id, deleted = summary.deleted, "dataset unuploaded");
    Ok(summary)
}
