//! Job definitions for the scheduler.
//!
//! This module defines the persisted unit of work and its state machine:
//!
//! - `Job`: A manifest to resolve, plus its output, result and retry bookkeeping
//! - `JobStatus`: `queued` → `processing` → `finished` | `finished_with_errors`
//! - `ResolveOptions`: Typed resolver flags fixed at job creation
//! - `Verbosity`: Output threshold applied by the output bridge
//!
//! The serialized form is both what the store holds and what API clients
//! receive, so field names and status strings are part of the wire contract.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by invalid job state transitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Invalid state transition for job '{id}' from '{from}' to '{to}'")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting on the main queue for a worker claim.
    Queued,
    /// Claimed by a worker.
    Processing,
    /// Resolved successfully; the lock artifact is available.
    Finished,
    /// Resolution failed or the resolver crashed.
    FinishedWithErrors,
}

impl JobStatus {
    /// Whether this is a terminal status. Terminal statuses are sticky.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::FinishedWithErrors)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::FinishedWithErrors => write!(f, "finished_with_errors"),
        }
    }
}

/// Output verbosity, ordered from least to most verbose.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
    VeryVerbose,
    Debug,
}

impl Verbosity {
    /// Maps a `-v` repetition count to a verbosity level.
    pub fn from_occurrences(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Verbose,
            2 => Verbosity::VeryVerbose,
            _ => Verbosity::Debug,
        }
    }
}

/// Resolver options attached to a job at creation time.
///
/// The worker never mutates these; they are read once when the resolver is
/// invoked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResolveOptions {
    /// Restrict the update to these packages. Empty means all packages.
    pub packages: Vec<String>,
    pub prefer_source: bool,
    pub prefer_dist: bool,
    /// Skip dev requirements.
    pub no_dev: bool,
    pub no_suggest: bool,
    pub prefer_stable: bool,
    pub prefer_lowest: bool,
    /// `Some(true)` keeps ANSI decoration in the output, `Some(false)` or
    /// `None` strips it.
    pub ansi: Option<bool>,
    /// Prefix each output line with elapsed time.
    pub profile: bool,
    pub verbosity: Verbosity,
}

impl ResolveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the update to the given packages.
    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages = packages.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the output verbosity.
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Sets whether dev requirements are skipped.
    pub fn with_no_dev(mut self, no_dev: bool) -> Self {
        self.no_dev = no_dev;
        self
    }

    /// Sets ANSI decoration.
    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = Some(ansi);
        self
    }

    /// Enables elapsed-time prefixes on output lines.
    pub fn with_profile(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }

    /// Whether output keeps its ANSI decoration.
    pub fn is_decorated(&self) -> bool {
        self.ansi.unwrap_or(false)
    }
}

/// A dependency resolution job.
///
/// Jobs are stored under `<queue_key>:jobs:<id>` and refreshed to the full
/// TTL on every write. Mutation goes through methods that keep the record's
/// invariants: the processing start time is set once, retries only grow and
/// terminal statuses are never left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub(crate) id: String,
    pub(crate) status: JobStatus,
    pub(crate) manifest: String,
    #[serde(default)]
    pub(crate) original_manifest: String,
    #[serde(default)]
    pub(crate) result_artifact: String,
    #[serde(default)]
    pub(crate) output: String,
    #[serde(default)]
    pub(crate) options: ResolveOptions,
    #[serde(default, with = "start_time")]
    pub(crate) processing_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub(crate) retries: u32,
}

impl Job {
    /// Creates a queued job. The original manifest defaults to `manifest`.
    pub fn new(id: impl Into<String>, manifest: impl Into<String>) -> Self {
        let manifest = manifest.into();

        Self {
            id: id.into(),
            status: JobStatus::Queued,
            original_manifest: manifest.clone(),
            manifest,
            result_artifact: String::new(),
            output: String::new(),
            options: ResolveOptions::default(),
            processing_start_time: None,
            retries: 0,
        }
    }

    /// Generates a fresh opaque job id.
    pub fn generate_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Keeps the client's manifest as submitted, before sanitization.
    pub fn with_original_manifest(mut self, original: impl Into<String>) -> Self {
        self.original_manifest = original.into();
        self
    }

    /// Sets the resolver options.
    pub fn with_options(mut self, options: ResolveOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn manifest(&self) -> &str {
        &self.manifest
    }

    pub fn original_manifest(&self) -> &str {
        &self.original_manifest
    }

    /// The lock artifact. Empty until the job is finished.
    pub fn result_artifact(&self) -> &str {
        &self.result_artifact
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn options(&self) -> &ResolveOptions {
        &self.options
    }

    pub fn processing_start_time(&self) -> Option<DateTime<Utc>> {
        self.processing_start_time
    }

    /// Number of claims made on this job so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Whether the job reached a terminal status.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves the job into `processing`.
    ///
    /// The start time is recorded only on the first call; later claims after
    /// a crash keep the original, which is what staleness detection measures
    /// against. Stored with whole-second precision.
    pub fn start_processing(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.transition(JobStatus::Processing)?;

        if self.processing_start_time.is_none() {
            self.processing_start_time = Some(now.trunc_subsecs(0));
        }

        Ok(())
    }

    /// Counts one more claim attempt.
    pub fn increment_retries(&mut self) {
        self.retries = self.retries.saturating_add(1);
    }

    /// Marks the job finished with the produced lock artifact.
    pub fn finish(&mut self, artifact: impl Into<String>) -> Result<(), JobError> {
        self.transition(JobStatus::Finished)?;
        self.result_artifact = artifact.into();
        Ok(())
    }

    /// Marks the job finished with errors. The artifact stays empty.
    pub fn finish_with_errors(&mut self) -> Result<(), JobError> {
        self.transition(JobStatus::FinishedWithErrors)
    }

    /// Appends raw text to the output log.
    pub fn append_output(&mut self, text: &str) {
        self.output.push_str(text);
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), JobError> {
        if self.status.is_terminal() {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }

        self.status = to;
        Ok(())
    }
}

/// Serde adapter for `processingStartTime`: ISO-8601 string, or `""` when unset.
mod start_time {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(time) => serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;

        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => parse(text).map(Some).map_err(de::Error::custom),
        }
    }

    /// Accepts RFC 3339 as well as the basic `+0000` offset form.
    fn parse(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(text)
            .or_else(|_| DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%z"))
            .map(|time| time.with_timezone(&Utc))
    }
}
