//! Builtin operation: keep the rows of a table whose column equals a value.
//!
//! Sources are CSV with a header row, or a JSON array of objects (which
//! is what this operation writes, so filtering its own output is a no-op).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{OperationError, Result};
use crate::operations::{required_scalar, required_str, Artifact, Operation, OperationKind};
use crate::sandbox::{write_atomic, Sandbox};

type Row = Map<String, Value>;

/// Rows plus the columns they may be filtered on.
#[derive(Debug, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

fn is_json_source(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

fn read_csv(path: &Path) -> Result<Table> {
    let read_err = |e: csv::Error| OperationError::Read(format!("{}: {e}", path.display()));

    let mut reader = csv::Reader::from_path(path).map_err(read_err)?;
    let columns: Vec<String> = reader
        .headers()
        .map_err(read_err)?
        .iter()
        .map(str::to_string)
        .collect();
    if let Some(dup) = columns
        .iter()
        .enumerate()
        .find_map(|(i, name)| columns[..i].contains(name).then_some(name))
    {
        return Err(OperationError::Read(format!(
            "{}: duplicate column {dup} in header",
            path.display()
        )));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(read_err)?;
        let row: Row = columns
            .iter()
            .zip(record.iter())
            .map(|(name, field)| (name.clone(), Value::String(field.to_string())))
            .collect();
        rows.push(row);
    }
    Ok(Table { columns, rows })
}

fn read_json(path: &Path) -> Result<Table> {
    let raw = std::fs::read(path)
        .map_err(|e| OperationError::Read(format!("{}: {e}", path.display())))?;
    let items: Vec<Map<String, Value>> = serde_json::from_slice(&raw).map_err(|e| {
        OperationError::Read(format!(
            "{}: expected a JSON array of objects: {e}",
            path.display()
        ))
    })?;

    let mut table = Table::default();
    for item in items {
        let row: Row = item
            .into_iter()
            .map(|(name, value)| (name, Value::String(cell_text(&value))))
            .collect();
        for name in row.keys() {
            if !table.has_column(name) {
                table.columns.push(name.clone());
            }
        }
        table.rows.push(row);
    }
    Ok(table)
}

/// String form of a JSON cell; strings are taken without quotes.
fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn load_table(path: &Path) -> Result<Table> {
    if is_json_source(path) {
        read_json(path)
    } else {
        read_csv(path)
    }
}

/// Rows whose `column` equals `value`, in input order.
fn filter_rows(table: Table, column: &str, value: &str) -> Result<Vec<Row>> {
    // An empty JSON array has no columns to check against.
    if !table.columns.is_empty() && !table.has_column(column) {
        return Err(OperationError::InvalidParameters(format!(
            "column {column} not found (available: {})",
            table.columns.join(", ")
        )));
    }

    Ok(table
        .rows
        .into_iter()
        .filter(|row| row.get(column).map(cell_text).as_deref() == Some(value))
        .collect())
}

pub struct CsvFilterOperation {
    sandbox: Arc<Sandbox>,
}

impl CsvFilterOperation {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Operation for CsvFilterOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::CsvFilter
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<Artifact> {
        let csv_path = required_str(params, "csvPath")?;
        let column = required_str(params, "column")?.to_string();
        let value = required_scalar(params, "value")?;
        let output = required_str(params, "outputPath")?;

        let source = self.sandbox.admit_source(csv_path)?;
        let dest = self.sandbox.admit(output)?;

        let kept = tokio::task::spawn_blocking(move || {
            let table = load_table(&source)?;
            filter_rows(table, &column, &value)
        })
        .await
        .map_err(|e| OperationError::Read(e.to_string()))??;

        debug!("CsvFilter kept {} rows", kept.len());
        let body = serde_json::to_vec_pretty(&kept)
            .map_err(|e| OperationError::Write(e.to_string()))?;
        write_atomic(&dest, body).await?;
        Ok(Artifact::file(dest.into_path_buf()))
    }
}
