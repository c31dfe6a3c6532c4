pub mod builtin;
pub mod dispatcher;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorKind, OperationError, Result, VcsStep};

/// The closed set of operations the dispatcher knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OperationKind {
    Fetch,
    Scrape,
    VersionControlCommit,
    Query,
    ImageTransform,
    Transcribe,
    MarkdownRender,
    CsvFilter,
}

impl OperationKind {
    pub const ALL: [OperationKind; 8] = [
        Self::Fetch,
        Self::Scrape,
        Self::VersionControlCommit,
        Self::Query,
        Self::ImageTransform,
        Self::Transcribe,
        Self::MarkdownRender,
        Self::CsvFilter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "Fetch",
            Self::Scrape => "Scrape",
            Self::VersionControlCommit => "VersionControlCommit",
            Self::Query => "Query",
            Self::ImageTransform => "ImageTransform",
            Self::Transcribe => "Transcribe",
            Self::MarkdownRender => "MarkdownRender",
            Self::CsvFilter => "CsvFilter",
        }
    }

    /// snake_case spelling, also accepted on the wire.
    pub fn snake_name(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Scrape => "scrape",
            Self::VersionControlCommit => "version_control_commit",
            Self::Query => "query",
            Self::ImageTransform => "image_transform",
            Self::Transcribe => "transcribe",
            Self::MarkdownRender => "markdown_render",
            Self::CsvFilter => "csv_filter",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name || kind.snake_name() == name)
            .ok_or_else(|| OperationError::UnsupportedOperation(name.to_string()))
    }
}

/// A structured request as produced by the external interpreter.
///
/// `operation` stays a string on the wire so that unknown names reach
/// the dispatcher and come back as `UnsupportedOperation` instead of a
/// deserialization error.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskRequest {
    pub operation: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// What a successful handler produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub output_path: PathBuf,
    /// Scalar extracted by the operation (Query only).
    pub value: Option<String>,
}

impl Artifact {
    pub fn file(output_path: PathBuf) -> Self {
        Self {
            output_path,
            value: None,
        }
    }

    pub fn with_value(mut self, value: String) -> Self {
        self.value = Some(value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
}

/// Uniform response shape returned by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<VcsStep>,
}

impl OperationResult {
    pub fn success(artifact: Artifact) -> Self {
        Self {
            status: Status::Success,
            output_path: Some(artifact.output_path),
            value: artifact.value,
            message: None,
            error: None,
            step: None,
        }
    }

    pub fn failure(err: &OperationError) -> Self {
        Self {
            status: Status::Failure,
            output_path: None,
            value: None,
            message: Some(err.to_string()),
            error: Some(err.kind()),
            step: err.step(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// A single capability the dispatcher can invoke.
///
/// Implementations are stateless apart from immutable configuration
/// captured at construction (the sandbox, HTTP client, VCS client).
#[async_trait]
pub trait Operation: Send + Sync {
    fn kind(&self) -> OperationKind;

    /// Validates `params`, admits every path, performs the work and
    /// returns the produced artifact. Nothing is written on failure.
    async fn execute(&self, params: &Map<String, Value>) -> Result<Artifact>;
}

// ── Parameter helpers ─────────────────────────────────────

pub(crate) fn required_str<'a>(params: &'a Map<String, Value>, name: &str) -> Result<&'a str> {
    match params.get(name) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(OperationError::InvalidParameters(format!(
            "parameter {name} must be a string, got {other}"
        ))),
        None => Err(OperationError::missing(name)),
    }
}

pub(crate) fn optional_str<'a>(
    params: &'a Map<String, Value>,
    name: &str,
) -> Result<Option<&'a str>> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => required_str(params, name).map(Some),
    }
}

/// A required parameter rendered as a string; numbers and booleans are
/// accepted and stringified.
pub(crate) fn required_scalar(params: &Map<String, Value>, name: &str) -> Result<String> {
    match params.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(other) => Err(OperationError::InvalidParameters(format!(
            "parameter {name} must be a scalar, got {other}"
        ))),
        None => Err(OperationError::missing(name)),
    }
}

pub(crate) fn optional_u32(params: &Map<String, Value>, name: &str) -> Result<Option<u32>> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| {
                OperationError::InvalidParameters(format!(
                    "parameter {name} must be a non-negative integer, got {value}"
                ))
            }),
    }
}
