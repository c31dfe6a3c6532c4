//! Builtin operation: "transcribe" an audio file.
//!
//! The audio input is a UTF-8 textual stand-in; its text is the
//! transcript and is copied verbatim. No speech decoding happens here.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{OperationError, Result};
use crate::operations::{required_str, Artifact, Operation, OperationKind};
use crate::sandbox::{write_atomic, Sandbox};

pub struct TranscribeOperation {
    sandbox: Arc<Sandbox>,
}

impl TranscribeOperation {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Operation for TranscribeOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::Transcribe
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<Artifact> {
        let audio_path = required_str(params, "audioPath")?;
        let output = required_str(params, "outputPath")?;

        let source = self.sandbox.admit_source(audio_path)?;
        let dest = self.sandbox.admit(output)?;

        let transcript = tokio::fs::read_to_string(&source)
            .await
            .map_err(|e| OperationError::Read(format!("{}: {e}", source.display())))?;

        write_atomic(&dest, transcript.into_bytes()).await?;
        Ok(Artifact::file(dest.into_path_buf()))
    }
}
