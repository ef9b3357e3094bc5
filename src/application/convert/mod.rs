//! Sandboxed document conversion.
//!
//! Each conversion gets its own [`Workspace`], runs the external engine with
//! a bounded deadline through [`EngineInvocation`], and returns the rendered
//! bytes. The workspace is removed on every exit path.

mod engine;
mod workspace;

use std::{collections::BTreeMap, io, sync::Arc, time::Instant};

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::{ConvertSettings, EngineSettings};

pub use engine::{EngineInvocation, EngineOutput, INPUT_FORMAT};
pub use workspace::Workspace;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("resource path `{0}` resolves outside the workspace")]
    PathTraversal(String),
    #[error("request carries {count} resources, limit is {limit}")]
    TooManyResources { count: usize, limit: usize },
    #[error("{context}: {source}")]
    Workspace {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("{message}")]
    Execution { message: String, stderr: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertErrorKind {
    Validation,
    PathTraversal,
    TooManyResources,
    Workspace,
    Execution,
}

impl ConvertErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::PathTraversal => "path_traversal",
            Self::TooManyResources => "too_many_resources",
            Self::Workspace => "workspace",
            Self::Execution => "execution",
        }
    }
}

impl ConvertError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn workspace(context: impl Into<String>, source: io::Error) -> Self {
        Self::Workspace {
            context: context.into(),
            source,
        }
    }

    pub fn execution(message: impl Into<String>, stderr: Vec<u8>) -> Self {
        Self::Execution {
            message: message.into(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }
    }

    pub fn kind(&self) -> ConvertErrorKind {
        match self {
            Self::Validation(_) => ConvertErrorKind::Validation,
            Self::PathTraversal(_) => ConvertErrorKind::PathTraversal,
            Self::TooManyResources { .. } => ConvertErrorKind::TooManyResources,
            Self::Workspace { .. } => ConvertErrorKind::Workspace,
            Self::Execution { .. } => ConvertErrorKind::Execution,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConversionRequest {
    pub document: Vec<u8>,
    pub resources: BTreeMap<String, Vec<u8>>,
    pub template: Option<String>,
}

/// Runs conversions, capping how many engine processes are alive at once.
#[derive(Debug, Clone)]
pub struct Converter {
    engine: EngineSettings,
    max_resources: usize,
    permits: Arc<Semaphore>,
}

impl Converter {
    pub fn new(engine: EngineSettings, limits: &ConvertSettings) -> Self {
        Self {
            engine,
            max_resources: limits.max_resources.get() as usize,
            permits: Arc::new(Semaphore::new(limits.max_concurrent.get() as usize)),
        }
    }

    pub async fn convert(&self, request: ConversionRequest) -> Result<Vec<u8>, ConvertError> {
        let started_at = Instant::now();
        let result = self.convert_inner(&request).await;
        let elapsed = started_at.elapsed();

        metrics::histogram!("folio_convert_ms").record(elapsed.as_secs_f64() * 1000.0);
        match &result {
            Ok(content) => {
                metrics::counter!("folio_convert_total", "result" => "ok").increment(1);
                info!(
                    target = "folio::convert",
                    op = "convert",
                    result = "ok",
                    elapsed_ms = elapsed.as_millis() as u64,
                    input_bytes = request.document.len(),
                    resources = request.resources.len(),
                    output_bytes = content.len(),
                    "Conversion finished"
                );
            }
            Err(err) => {
                let kind = err.kind().as_str();
                metrics::counter!("folio_convert_total", "result" => kind).increment(1);
                warn!(
                    target = "folio::convert",
                    op = "convert",
                    result = "error",
                    error_code = kind,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %err,
                    "Conversion failed"
                );
            }
        }
        result
    }

    async fn convert_inner(&self, request: &ConversionRequest) -> Result<Vec<u8>, ConvertError> {
        if request.document.is_empty() {
            return Err(ConvertError::validation("document is empty"));
        }
        if request.resources.len() > self.max_resources {
            return Err(ConvertError::TooManyResources {
                count: request.resources.len(),
                limit: self.max_resources,
            });
        }

        // The semaphore is never closed.
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ConvertError::execution("converter is shutting down", Vec::new()))?;

        let workspace = Workspace::create(&self.engine.temp_dir)?;
        workspace.write_input(&request.document).await?;
        workspace.write_resources(&request.resources).await?;

        let invocation =
            EngineInvocation::build(&self.engine, &workspace, request.template.as_deref());
        invocation.run(self.engine.command_timeout).await?;

        let content = workspace.read_output().await?;
        if let Err(err) = workspace.close() {
            warn!(
                target = "folio::convert",
                op = "convert",
                error = %err,
                "Failed to remove workspace"
            );
        }
        Ok(content)
    }
}
