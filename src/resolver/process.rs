//! Resolver that shells out to an external composer-compatible command.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{DependencyResolver, Resolution, ResolveRequest};
use crate::error::ResolverError;
use crate::scheduler::{OutputSink, ResolveOptions, Verbosity};

const MANIFEST_FILE: &str = "composer.json";
const LOCK_FILE: &str = "composer.lock";

/// Details of a finished resolver process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Full command line that was run.
    pub command_line: String,
    pub duration: Duration,
}

/// Runs `<command> update` in a per-job scratch directory.
///
/// The manifest is written to `<jobs_dir>/<job id>/composer.json`, with
/// `COMPOSER_HOME` and `COMPOSER` pointing into that directory, so
/// concurrent jobs never share state. Plugins, scripts and package
/// installation are always disabled; only the lock file is produced. The
/// scratch directory is removed once the command exits.
#[derive(Debug, Clone)]
pub struct ProcessResolver {
    program: String,
    leading_args: Vec<String>,
    jobs_dir: PathBuf,
}

impl ProcessResolver {
    /// Creates a resolver.
    ///
    /// `command` may carry leading arguments (`"php composer.phar"`); it is
    /// split on whitespace.
    pub fn new(command: &str, jobs_dir: impl Into<PathBuf>) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| "composer".to_string());

        Self {
            program,
            leading_args: parts.collect(),
            jobs_dir: jobs_dir.into(),
        }
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    /// Arguments passed after the command for the given options.
    pub fn command_args(options: &ResolveOptions) -> Vec<String> {
        let mut args: Vec<String> = [
            "update",
            "--no-interaction",
            "--no-plugins",
            "--no-scripts",
            "--no-install",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let flags = [
            (options.prefer_source, "--prefer-source"),
            (options.prefer_dist, "--prefer-dist"),
            (options.no_dev, "--no-dev"),
            (options.no_suggest, "--no-suggest"),
            (options.prefer_stable, "--prefer-stable"),
            (options.prefer_lowest, "--prefer-lowest"),
        ];
        args.extend(
            flags
                .iter()
                .filter(|(enabled, _)| *enabled)
                .map(|(_, flag)| flag.to_string()),
        );

        args.push(if options.is_decorated() { "--ansi" } else { "--no-ansi" }.to_string());

        match options.verbosity {
            Verbosity::Quiet => args.push("--quiet".to_string()),
            Verbosity::Normal => {}
            Verbosity::Verbose => args.push("-v".to_string()),
            Verbosity::VeryVerbose => args.push("-vv".to_string()),
            Verbosity::Debug => args.push("-vvv".to_string()),
        }

        args.extend(options.packages.iter().cloned());
        args
    }

    fn work_dir(&self, job_id: &str) -> Result<PathBuf, ResolverError> {
        if job_id.is_empty()
            || job_id.contains('/')
            || job_id.contains('\\')
            || job_id.contains("..")
        {
            return Err(ResolverError::InvalidJobId(job_id.to_string()));
        }

        Ok(self.jobs_dir.join(job_id))
    }

    async fn run_in(
        &self,
        work_dir: &Path,
        request: &ResolveRequest,
        output: &mut dyn OutputSink,
    ) -> Result<Resolution<ProcessHandle>, ResolverError> {
        let start = Instant::now();
        let manifest_path = work_dir.join(MANIFEST_FILE);
        tokio::fs::write(&manifest_path, &request.manifest).await?;

        let args = Self::command_args(&request.options);
        let command_line = std::iter::once(self.program.as_str())
            .chain(self.leading_args.iter().map(String::as_str))
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .args(&args)
            .current_dir(work_dir)
            .env("COMPOSER_HOME", work_dir)
            .env("COMPOSER", &manifest_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(job_id = %request.job_id, command = %command_line, "Spawning resolver");

        let mut child = cmd.spawn().map_err(|e| ResolverError::Launch {
            command: command_line.clone(),
            reason: e.to_string(),
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ResolverError::Failed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ResolverError::Failed("stderr not captured".to_string()))?;

        // Lines are read as bytes so output in a legacy encoding cannot
        // abort the stream.
        let mut stdout = BufReader::new(stdout);
        let mut stderr = BufReader::new(stderr);
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                read = stdout.read_until(b'\n', &mut stdout_buf), if stdout_open => {
                    if read? == 0 {
                        stdout_open = false;
                    } else {
                        let line = take_line(&mut stdout_buf);
                        output.write(&line, true, Verbosity::Normal).await?;
                    }
                }
                read = stderr.read_until(b'\n', &mut stderr_buf), if stderr_open => {
                    if read? == 0 {
                        stderr_open = false;
                    } else {
                        let line = take_line(&mut stderr_buf);
                        output.write_error(&line, true, Verbosity::Normal).await?;
                    }
                }
            }
        }

        let status = child.wait().await?;
        let exit_code = status.code().unwrap_or(-1);
        let handle = ProcessHandle {
            command_line,
            duration: start.elapsed(),
        };

        info!(
            job_id = %request.job_id,
            exit_code,
            duration_ms = handle.duration.as_millis() as u64,
            "Resolver process exited"
        );

        if exit_code != 0 {
            return Ok(Resolution::failure(exit_code, handle));
        }

        match tokio::fs::read_to_string(work_dir.join(LOCK_FILE)).await {
            Ok(lock) => Ok(Resolution::success(lock, handle)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Resolution {
                exit_code,
                artifact: None,
                diagnostics: Some(format!("Resolver exited successfully but wrote no {LOCK_FILE}.")),
                handle,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DependencyResolver for ProcessResolver {
    type Handle = ProcessHandle;

    async fn resolve(
        &self,
        request: &ResolveRequest,
        output: &mut dyn OutputSink,
    ) -> Result<Resolution<ProcessHandle>, ResolverError> {
        let work_dir = self.work_dir(&request.job_id)?;
        tokio::fs::create_dir_all(&work_dir).await?;

        let result = self.run_in(&work_dir, request, output).await;

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!(job_id = %request.job_id, error = %e, "Failed to remove job directory");
        }

        result
    }
}

/// Decodes one buffered line without its terminator and clears the buffer.
fn take_line(buf: &mut Vec<u8>) -> String {
    let mut end = buf.len();
    if buf[..end].ends_with(b"\n") {
        end -= 1;
    }
    if buf[..end].ends_with(b"\r") {
        end -= 1;
    }

    let line = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.clear();
    line
}
