//! Dependency resolver seam.
//!
//! The worker never resolves dependencies itself. It hands a
//! [`ResolveRequest`] and an [`OutputSink`] to a [`DependencyResolver`] and
//! gets back an explicit [`Resolution`]: exit code, lock artifact and any
//! diagnostics. A returned `Err` is treated as a resolver crash.

mod process;

use async_trait::async_trait;

use crate::error::ResolverError;
use crate::scheduler::{Job, OutputSink, ResolveOptions};

pub use process::{ProcessHandle, ProcessResolver};

/// Everything a resolver needs to know about one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    pub job_id: String,
    /// Manifest to resolve, already sanitized.
    pub manifest: String,
    pub options: ResolveOptions,
}

impl ResolveRequest {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id().to_string(),
            manifest: job.manifest().to_string(),
            options: job.options().clone(),
        }
    }
}

/// Outcome of one resolver invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution<H> {
    /// Resolver exit code. Zero means success.
    pub exit_code: i32,
    /// Lock artifact, present only when the resolver produced one.
    pub artifact: Option<String>,
    /// Extra text to append to the job output, if any.
    pub diagnostics: Option<String>,
    /// Resolver-specific details for callers that want them.
    pub handle: H,
}

impl<H> Resolution<H> {
    /// A successful resolution carrying `artifact`.
    pub fn success(artifact: impl Into<String>, handle: H) -> Self {
        Self {
            exit_code: 0,
            artifact: Some(artifact.into()),
            diagnostics: None,
            handle,
        }
    }

    /// A failed resolution with the given non-zero exit code.
    pub fn failure(exit_code: i32, handle: H) -> Self {
        Self {
            exit_code,
            artifact: None,
            diagnostics: None,
            handle,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        self.diagnostics = Some(diagnostics.into());
        self
    }

    /// Whether the resolver exited with code zero.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Resolves a manifest into a lock artifact.
///
/// Implementations stream progress through `output` and must be idempotent
/// for a given request: a slow worker and its replacement may both resolve
/// the same job.
#[async_trait]
pub trait DependencyResolver: Send + Sync {
    /// Resolver-specific details returned alongside the result.
    type Handle: Send + 'static;

    async fn resolve(
        &self,
        request: &ResolveRequest,
        output: &mut dyn OutputSink,
    ) -> Result<Resolution<Self::Handle>, ResolverError>;
}
