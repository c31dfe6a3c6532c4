//! Builtin operation: render Markdown to an HTML fragment.
//!
//! Rendering follows CommonMark via `pulldown-cmark` with no extensions
//! enabled, so the output is the same for the same input on every run.

use std::sync::Arc;

use async_trait::async_trait;
use pulldown_cmark::{html, Options, Parser};
use serde_json::{Map, Value};

use crate::error::{OperationError, Result};
use crate::operations::{required_str, Artifact, Operation, OperationKind};
use crate::sandbox::{write_atomic, Sandbox};

/// Renders CommonMark `source` to HTML.
pub fn render_html(source: &str) -> String {
    let parser = Parser::new_ext(source, Options::empty());
    let mut out = String::with_capacity(source.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

pub struct MarkdownRenderOperation {
    sandbox: Arc<Sandbox>,
}

impl MarkdownRenderOperation {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Operation for MarkdownRenderOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::MarkdownRender
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<Artifact> {
        let markdown_path = required_str(params, "markdownPath")?;
        let output = required_str(params, "outputPath")?;

        let source = self.sandbox.admit_source(markdown_path)?;
        let dest = self.sandbox.admit(output)?;

        let text = tokio::fs::read_to_string(&source)
            .await
            .map_err(|e| OperationError::Read(format!("{}: {e}", source.display())))?;

        write_atomic(&dest, render_html(&text).into_bytes()).await?;
        Ok(Artifact::file(dest.into_path_buf()))
    }
}
