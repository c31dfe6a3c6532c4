//! Builtin operation: run a SQL query and store the first scalar.
//!
//! Two engines sit behind [`QueryEngine`]: SQLite for `.db` files and
//! DuckDB for everything else. [`select_engine`] is the only place the
//! choice is made; adding an engine means adding an [`EngineKind`]
//! variant and a match arm there and in [`engine_for`].
//!
//! An empty result set and a `NULL` first column both produce the empty
//! string.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{OperationError, Result};
use crate::operations::{required_str, Artifact, Operation, OperationKind};
use crate::sandbox::{write_atomic, Sandbox};

/// Which query engine handles a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Embedded relational engine (SQLite).
    Embedded,
    /// Analytical columnar engine (DuckDB).
    Analytical,
}

/// Chooses the engine from the data source's extension. `.db` is
/// SQLite; anything else, including no extension, is DuckDB.
pub fn select_engine(path: &Path) -> EngineKind {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("db") => EngineKind::Embedded,
        _ => EngineKind::Analytical,
    }
}

/// Executes a query against a read-only data source and returns the
/// first column of the first row, already rendered as a string.
pub trait QueryEngine: Send + Sync {
    fn first_scalar(&self, db_path: &Path, query: &str) -> Result<String>;
}

fn query_error(e: impl std::fmt::Display) -> OperationError {
    OperationError::Query(e.to_string())
}

/// Formats a float without a trailing `.0` when it is integral.
fn format_real(value: f64) -> String {
    value.to_string()
}

pub struct SqliteEngine;

impl SqliteEngine {
    fn render(value: rusqlite::types::ValueRef<'_>) -> String {
        use rusqlite::types::ValueRef;
        match value {
            ValueRef::Null => String::new(),
            ValueRef::Integer(i) => i.to_string(),
            ValueRef::Real(f) => format_real(f),
            ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
        }
    }
}

impl QueryEngine for SqliteEngine {
    fn first_scalar(&self, db_path: &Path, query: &str) -> Result<String> {
        use rusqlite::{Connection, OpenFlags};

        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(query_error)?;
        let mut stmt = conn.prepare(query).map_err(query_error)?;
        let mut rows = stmt.query([]).map_err(query_error)?;
        match rows.next().map_err(query_error)? {
            Some(row) => Ok(Self::render(row.get_ref(0).map_err(query_error)?)),
            None => Ok(String::new()),
        }
    }
}

#[cfg(feature = "analytical")]
pub struct DuckDbEngine;

#[cfg(feature = "analytical")]
impl DuckDbEngine {
    fn render(value: duckdb::types::Value) -> String {
        use duckdb::types::Value as V;
        match value {
            V::Null => String::new(),
            V::Boolean(b) => b.to_string(),
            V::TinyInt(i) => i.to_string(),
            V::SmallInt(i) => i.to_string(),
            V::Int(i) => i.to_string(),
            V::BigInt(i) => i.to_string(),
            V::HugeInt(i) => i.to_string(),
            V::UTinyInt(i) => i.to_string(),
            V::USmallInt(i) => i.to_string(),
            V::UInt(i) => i.to_string(),
            V::UBigInt(i) => i.to_string(),
            V::Float(f) => format_real(f64::from(f)),
            V::Double(f) => format_real(f),
            V::Decimal(d) => d.normalize().to_string(),
            V::Text(s) | V::Enum(s) => s,
            V::Blob(b) => String::from_utf8_lossy(&b).into_owned(),
            other => format!("{other:?}"),
        }
    }
}

#[cfg(feature = "analytical")]
impl QueryEngine for DuckDbEngine {
    fn first_scalar(&self, db_path: &Path, query: &str) -> Result<String> {
        use duckdb::{AccessMode, Config, Connection};

        let config = Config::default()
            .access_mode(AccessMode::ReadOnly)
            .map_err(query_error)?;
        let conn = Connection::open_with_flags(db_path, config).map_err(query_error)?;
        let mut stmt = conn.prepare(query).map_err(query_error)?;
        let mut rows = stmt.query([]).map_err(query_error)?;
        match rows.next().map_err(query_error)? {
            Some(row) => Ok(Self::render(
                row.get::<_, duckdb::types::Value>(0).map_err(query_error)?,
            )),
            None => Ok(String::new()),
        }
    }
}

/// Stand-in when the crate is built without the `analytical` feature.
#[cfg(not(feature = "analytical"))]
pub struct DuckDbEngine;

#[cfg(not(feature = "analytical"))]
impl QueryEngine for DuckDbEngine {
    fn first_scalar(&self, db_path: &Path, _query: &str) -> Result<String> {
        Err(OperationError::Query(format!(
            "{}: analytical engine not compiled in (enable the `analytical` feature)",
            db_path.display()
        )))
    }
}

/// Maps an [`EngineKind`] to its implementation.
pub fn engine_for(kind: EngineKind) -> Box<dyn QueryEngine> {
    match kind {
        EngineKind::Embedded => Box::new(SqliteEngine),
        EngineKind::Analytical => Box::new(DuckDbEngine),
    }
}

/// `Query`: run `query` against `dbPath`, write the scalar to `outputPath`.
pub struct QueryOperation {
    sandbox: Arc<Sandbox>,
}

impl QueryOperation {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Operation for QueryOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::Query
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<Artifact> {
        let db_path = required_str(params, "dbPath")?;
        let query = required_str(params, "query")?.to_string();
        let output = required_str(params, "outputPath")?;

        let db_path: PathBuf = self.sandbox.admit_source(db_path)?;
        let dest = self.sandbox.admit(output)?;

        let kind = select_engine(&db_path);
        debug!("Query on {} with {kind:?} engine", db_path.display());

        let value = tokio::task::spawn_blocking(move || engine_for(kind).first_scalar(&db_path, &query))
            .await
            .map_err(query_error)??;

        write_atomic(&dest, value.clone().into_bytes()).await?;
        Ok(Artifact::file(dest.into_path_buf()).with_value(value))
    }
}
