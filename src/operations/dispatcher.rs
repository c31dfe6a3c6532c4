//! Task dispatcher: maps a request to exactly one handler.
//!
//! Every handler is constructed once at startup and held as a field, so
//! resolving an [`OperationKind`] is an exhaustive `match` and a new kind
//! cannot be added without wiring its handler. The dispatcher performs no
//! confinement checks of its own; each handler admits its own paths.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::OperationError;
use crate::operations::builtin::{
    CsvFilterOperation, FetchOperation, GitCli, HttpFetcher, ImageTransformOperation,
    MarkdownRenderOperation, QueryOperation, ScrapeOperation, TranscribeOperation,
    VcsCommitOperation, VersionControlClient,
};
use crate::operations::{Operation, OperationKind, OperationResult, TaskRequest};
use crate::sandbox::Sandbox;

pub struct Dispatcher {
    fetch: FetchOperation,
    scrape: ScrapeOperation,
    vcs_commit: VcsCommitOperation,
    query: QueryOperation,
    image_transform: ImageTransformOperation,
    transcribe: TranscribeOperation,
    markdown_render: MarkdownRenderOperation,
    csv_filter: CsvFilterOperation,
}

impl Dispatcher {
    pub fn new(sandbox: Arc<Sandbox>, config: &Config) -> Self {
        Self::with_vcs_client(sandbox, config, Arc::new(GitCli::new(&config.vcs)))
    }

    /// Builds a dispatcher whose `VersionControlCommit` handler talks to
    /// `vcs` instead of the `git` binary.
    pub fn with_vcs_client(
        sandbox: Arc<Sandbox>,
        config: &Config,
        vcs: Arc<dyn VersionControlClient>,
    ) -> Self {
        let fetcher = Arc::new(HttpFetcher::new(&config.fetch));
        Self {
            fetch: FetchOperation::new(Arc::clone(&sandbox), Arc::clone(&fetcher)),
            scrape: ScrapeOperation::new(Arc::clone(&sandbox), fetcher),
            vcs_commit: VcsCommitOperation::new(Arc::clone(&sandbox), vcs),
            query: QueryOperation::new(Arc::clone(&sandbox)),
            image_transform: ImageTransformOperation::new(Arc::clone(&sandbox)),
            transcribe: TranscribeOperation::new(Arc::clone(&sandbox)),
            markdown_render: MarkdownRenderOperation::new(Arc::clone(&sandbox)),
            csv_filter: CsvFilterOperation::new(sandbox),
        }
    }

    fn handler(&self, kind: OperationKind) -> &dyn Operation {
        match kind {
            OperationKind::Fetch => &self.fetch,
            OperationKind::Scrape => &self.scrape,
            OperationKind::VersionControlCommit => &self.vcs_commit,
            OperationKind::Query => &self.query,
            OperationKind::ImageTransform => &self.image_transform,
            OperationKind::Transcribe => &self.transcribe,
            OperationKind::MarkdownRender => &self.markdown_render,
            OperationKind::CsvFilter => &self.csv_filter,
        }
    }

    /// Runs `request` once and folds any failure into the result.
    pub async fn dispatch(&self, request: &TaskRequest) -> OperationResult {
        let kind = match request.operation.parse::<OperationKind>() {
            Ok(kind) => kind,
            Err(e) => {
                warn!("Rejected request: {e}");
                return OperationResult::failure(&e);
            }
        };

        info!("Dispatching {kind}");
        let started = Instant::now();
        match self.handler(kind).execute(&request.parameters).await {
            Ok(artifact) => {
                info!(
                    "{kind} succeeded in {:?}: {}",
                    started.elapsed(),
                    artifact.output_path.display()
                );
                OperationResult::success(artifact)
            }
            Err(e) => {
                log_failure(kind, &e);
                OperationResult::failure(&e)
            }
        }
    }
}

fn log_failure(kind: OperationKind, err: &OperationError) {
    match err.step() {
        Some(step) => warn!("{kind} failed at {step}: {err}"),
        None => warn!("{kind} failed ({:?}): {err}", err.kind()),
    }
}
