//! Output sinks for resolver progress.
//!
//! A resolver writes its progress through an [`OutputSink`]. During a worker
//! run the sink is a [`JobOutput`] bound to the claimed job: every accepted
//! write is appended to `Job::output` and the record is re-persisted through
//! a [`JobUpdater`], so clients polling the job see live progress. Manual
//! runs use [`ConsoleOutput`] instead.
//!
//! Error writes share the normal path; there is no separate error stream.
//! Overwrites never rewrite earlier output, they append.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::time::Instant;

use super::job::{Job, Verbosity};
use super::queue::{JobQueue, QueueError};

/// Receives the job after each accepted output write.
#[async_trait]
pub trait JobUpdater: Send + Sync {
    async fn job_updated(&self, job: &Job) -> Result<(), QueueError>;
}

#[async_trait]
impl JobUpdater for JobQueue {
    async fn job_updated(&self, job: &Job) -> Result<(), QueueError> {
        self.update_job(job).await
    }
}

/// Destination for resolver output.
#[async_trait]
pub trait OutputSink: Send {
    /// Configured verbosity threshold.
    fn verbosity(&self) -> Verbosity;

    /// Writes `message`, followed by a newline if `newline` is set, when
    /// `verbosity` does not exceed the configured threshold.
    async fn write(
        &mut self,
        message: &str,
        newline: bool,
        verbosity: Verbosity,
    ) -> Result<(), QueueError>;

    async fn write_error(
        &mut self,
        message: &str,
        newline: bool,
        verbosity: Verbosity,
    ) -> Result<(), QueueError> {
        self.write(message, newline, verbosity).await
    }

    async fn overwrite(
        &mut self,
        message: &str,
        newline: bool,
        verbosity: Verbosity,
    ) -> Result<(), QueueError> {
        self.write(message, newline, verbosity).await
    }

    async fn overwrite_error(
        &mut self,
        message: &str,
        newline: bool,
        verbosity: Verbosity,
    ) -> Result<(), QueueError> {
        self.write_error(message, newline, verbosity).await
    }

    /// Writes one line at normal verbosity.
    async fn writeln(&mut self, message: &str) -> Result<(), QueueError> {
        self.write(message, true, Verbosity::Normal).await
    }
}

/// Output sink that captures writes into a job record.
pub struct JobOutput<'a> {
    job: Option<&'a mut Job>,
    updater: Option<&'a dyn JobUpdater>,
    verbosity: Verbosity,
    decorated: bool,
    profile_start: Option<Instant>,
}

impl<'a> JobOutput<'a> {
    /// Binds a sink to `job`, taking verbosity, decoration and profiling from
    /// the job's options. `updater` runs after every accepted write.
    pub fn new(job: &'a mut Job, updater: &'a dyn JobUpdater) -> Self {
        let options = job.options();
        let verbosity = options.verbosity;
        let decorated = options.is_decorated();
        let profile_start = options.profile.then(Instant::now);

        Self {
            job: Some(job),
            updater: Some(updater),
            verbosity,
            decorated,
            profile_start,
        }
    }

    /// A sink with no job bound. Every write is accepted and discarded.
    pub fn detached(verbosity: Verbosity) -> Self {
        Self {
            job: None,
            updater: None,
            verbosity,
            decorated: false,
            profile_start: None,
        }
    }

    /// The bound job, if any.
    pub fn job(&self) -> Option<&Job> {
        self.job.as_deref()
    }

    fn render(&self, message: &str, newline: bool) -> String {
        let mut text = String::with_capacity(message.len() + 16);

        if let Some(start) = self.profile_start {
            text.push_str(&format!("[{:.2}s] ", start.elapsed().as_secs_f64()));
        }

        if self.decorated {
            text.push_str(message);
        } else {
            text.push_str(&strip_ansi(message));
        }

        if newline {
            text.push('\n');
        }

        text
    }
}

#[async_trait]
impl OutputSink for JobOutput<'_> {
    fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    async fn write(
        &mut self,
        message: &str,
        newline: bool,
        verbosity: Verbosity,
    ) -> Result<(), QueueError> {
        if verbosity > self.verbosity {
            return Ok(());
        }

        let text = self.render(message, newline);
        let Some(job) = self.job.as_deref_mut() else {
            return Ok(());
        };

        job.append_output(&text);

        if let Some(updater) = self.updater {
            updater.job_updated(job).await?;
        }

        Ok(())
    }
}

/// Output sink that prints to the process's standard output.
#[derive(Debug, Clone)]
pub struct ConsoleOutput {
    verbosity: Verbosity,
}

impl ConsoleOutput {
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity }
    }
}

#[async_trait]
impl OutputSink for ConsoleOutput {
    fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    async fn write(
        &mut self,
        message: &str,
        newline: bool,
        verbosity: Verbosity,
    ) -> Result<(), QueueError> {
        if verbosity > self.verbosity {
            return Ok(());
        }

        if newline {
            println!("{}", message);
        } else {
            print!("{}", message);
        }

        Ok(())
    }
}

/// Removes ANSI escape sequences from `text`.
pub fn strip_ansi(text: &str) -> std::borrow::Cow<'_, str> {
    static ANSI: OnceLock<Option<Regex>> = OnceLock::new();

    match ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").ok()) {
        Some(pattern) => pattern.replace_all(text, ""),
        None => std::borrow::Cow::Borrowed(text),
    }
}
