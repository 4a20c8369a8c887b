//! Execution adapter that drives the dataset CLI tools as child processes.

use super::{classify_failure, ExecutionAdapter, ExecutionError, ExecutionRequest};
use crate::config::ToolSettings;
use crate::registry_store::{DatasetMetadata, ExecutionResult, HealthSignal, JobKind};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Name of the clone target inside a job's scratch directory.
const CLONE_DIR: &str = "dataset";

/// Values substituted into command templates.
#[derive(Clone, Copy)]
struct Placeholders<'a> {
    url: &'a str,
    workdir: &'a Path,
    revision: &'a str,
}

/// Split a command template into argv and substitute `{url}`, `{workdir}`
/// and `{revision}`. Substitution happens after splitting, so values with
/// spaces stay a single argument.
pub fn render_command(
    template: &str,
    url: &str,
    workdir: &Path,
    revision: &str,
) -> Result<Vec<String>, ExecutionError> {
    let parts = shlex::split(template).ok_or_else(|| {
        ExecutionError::Unexpected(format!("malformed command template: {}", template))
    })?;
    let workdir = workdir.to_string_lossy();
    Ok(parts
        .into_iter()
        .map(|part| {
            part.replace("{url}", url)
                .replace("{workdir}", &workdir)
                .replace("{revision}", revision)
        })
        .collect())
}

fn first_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

fn non_empty_lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.contains("->") && !line.ends_with("/HEAD"))
        .map(str::to_string)
        .collect()
}

async fn measure_size(path: PathBuf) -> Result<u64, ExecutionError> {
    tokio::task::spawn_blocking(move || {
        WalkDir::new(&path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|metadata| metadata.len())
            .sum::<u64>()
    })
    .await
    .map_err(|e| ExecutionError::Unexpected(format!("size measurement failed: {}", e)))
}

pub struct CliToolAdapter {
    settings: ToolSettings,
}

impl CliToolAdapter {
    pub fn new(settings: ToolSettings) -> Self {
        Self { settings }
    }

    async fn spawn(
        &self,
        step: &str,
        template: &str,
        vars: Placeholders<'_>,
    ) -> Result<Output, ExecutionError> {
        let argv = render_command(template, vars.url, vars.workdir, vars.revision)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ExecutionError::Unexpected(format!("{} command is empty", step)))?;

        debug!(step, command = %argv.join(" "), "Running tool step");
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ExecutionError::Unexpected(format!(
                    "failed to spawn {} command '{}': {}",
                    step, program, e
                ))
            })
    }

    /// Run a step that must succeed, returning its stdout.
    async fn run_step(
        &self,
        step: &str,
        template: &str,
        vars: Placeholders<'_>,
    ) -> Result<String, ExecutionError> {
        let output = self.spawn(step, template, vars).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_failure(
                step,
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    /// Run a probe whose failure only means the value is absent.
    async fn probe_optional(
        &self,
        step: &str,
        template: &str,
        vars: Placeholders<'_>,
    ) -> Result<Option<String>, ExecutionError> {
        let output = self.spawn(step, template, vars).await?;
        if output.status.success() {
            Ok(first_line(&String::from_utf8_lossy(&output.stdout)))
        } else {
            debug!(step, status = %output.status, "Optional probe returned nothing");
            Ok(None)
        }
    }

    async fn collect_metadata(
        &self,
        vars: Placeholders<'_>,
    ) -> Result<DatasetMetadata, ExecutionError> {
        let head_describe = self
            .probe_optional("describe", &self.settings.describe_command, vars)
            .await?;
        let annex_uuid = self
            .probe_optional("annex-uuid", &self.settings.annex_uuid_command, vars)
            .await?;
        let branches = self
            .run_step("branches", &self.settings.branches_command, vars)
            .await?;
        let tags = self
            .run_step("tags", &self.settings.tags_command, vars)
            .await?;

        Ok(DatasetMetadata {
            head_describe,
            annex_uuid,
            branches: non_empty_lines(&branches),
            tags: non_empty_lines(&tags),
        })
    }

    /// A failing integrity check degrades the dataset instead of failing the job.
    async fn check_integrity(
        &self,
        vars: Placeholders<'_>,
    ) -> Result<(HealthSignal, Option<String>), ExecutionError> {
        let output = self
            .spawn("verify", &self.settings.verify_command, vars)
            .await?;
        if output.status.success() {
            return Ok((HealthSignal::Healthy, None));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.code().is_none() {
            return Err(classify_failure("verify", None, &stderr));
        }
        warn!(status = %output.status, "Integrity check failed: {}", stderr.trim());
        Ok((
            HealthSignal::Degraded,
            Some(format!("integrity check failed: {}", stderr.trim())),
        ))
    }

    async fn execute_plan(
        &self,
        request: &ExecutionRequest,
        workdir: &Path,
    ) -> Result<ExecutionResult, ExecutionError> {
        let previous = request.last_revision.as_deref().unwrap_or("");
        let vars = Placeholders {
            url: &request.url,
            workdir,
            revision: previous,
        };

        self.run_step("clone", &self.settings.clone_command, vars)
            .await?;
        let revision = first_line(
            &self
                .run_step("revision", &self.settings.revision_command, vars)
                .await?,
        );
        let revision_changed = revision.is_some() && revision != request.last_revision;
        let vars = Placeholders {
            revision: revision.as_deref().unwrap_or(previous),
            ..vars
        };

        let (health_signal, metadata, detail) = match request.kind {
            JobKind::Register | JobKind::Refresh => {
                let metadata = self.collect_metadata(vars).await?;
                (HealthSignal::Healthy, Some(metadata), None)
            }
            JobKind::Verify => {
                let (signal, detail) = self.check_integrity(vars).await?;
                (signal, None, detail)
            }
        };

        let size_bytes = measure_size(workdir.to_path_buf()).await?;

        Ok(ExecutionResult {
            revision,
            size_bytes,
            health_signal,
            revision_changed,
            metadata,
            detail,
        })
    }
}

#[async_trait]
impl ExecutionAdapter for CliToolAdapter {
    async fn run(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let scratch_root = &self.settings.scratch_dir;
        tokio::fs::create_dir_all(scratch_root).await.map_err(|e| {
            ExecutionError::Unexpected(format!(
                "cannot create scratch root {:?}: {}",
                scratch_root, e
            ))
        })?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("job-{}-", request.job_id))
            .tempdir_in(scratch_root)
            .map_err(|e| {
                ExecutionError::Unexpected(format!("cannot create scratch directory: {}", e))
            })?;
        let workdir = scratch.path().join(CLONE_DIR);
        let timeout = Duration::from_secs(self.settings.timeout_secs);

        // Dropping the plan future kills any child still running.
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
            result = tokio::time::timeout(timeout, self.execute_plan(request, &workdir)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(ExecutionError::Transient(format!(
                        "{} job timed out after {}s",
                        request.kind,
                        timeout.as_secs()
                    ))),
                }
            }
        };

        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            warn!("Failed to remove scratch directory {:?}: {}", scratch_path, e);
        }
        outcome
    }
}
