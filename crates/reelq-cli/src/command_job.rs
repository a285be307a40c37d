//! Job function that runs the configured external generator command.

use async_trait::async_trait;
use reelq_config::JobSettings;
use reelq_core::{ClaimedJob, JobOutcome};
use reelq_scheduler::{JobFunction, ProgressReporter};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const PROMPT_FILE: &str = "prompt.txt";

/// Runs `command` once per job inside `<output_path>/<task_uuid>/`.
///
/// The child sees the job through `REELQ_*` environment variables and may
/// print `progress <n>` lines on stdout. Exit status 0 means success.
#[derive(Debug, Clone)]
pub struct CommandJob {
    program: String,
    args: Vec<String>,
    output_path: PathBuf,
}

impl CommandJob {
    pub fn new(settings: &JobSettings) -> anyhow::Result<Self> {
        let (program, args) = settings
            .command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("job command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            output_path: settings.output_path.clone(),
        })
    }

    /// `<output_path>/<task_uuid>`, as long as the uuid is a single plain
    /// path component.
    fn work_dir(&self, task_uuid: &str) -> Result<PathBuf, String> {
        let mut components = Path::new(task_uuid).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => Ok(self.output_path.join(name)),
            _ => Err(format!("task uuid {task_uuid:?} is not a plain directory name")),
        }
    }

    async fn execute(&self, job: &ClaimedJob, reporter: &ProgressReporter) -> Result<(), String> {
        let payload = &job.payload;
        let work_dir = self.work_dir(&payload.task_uuid)?;
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| format!("failed to create {}: {e}", work_dir.display()))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&work_dir)
            .env("REELQ_JOB_ID", job.id.to_string())
            .env("REELQ_TASK_UUID", &payload.task_uuid)
            .env("REELQ_WIDTH", payload.width.to_string())
            .env("REELQ_HEIGHT", payload.height.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(prompt) = &payload.prompt {
            let prompt_file = work_dir.join(PROMPT_FILE);
            tokio::fs::write(&prompt_file, prompt)
                .await
                .map_err(|e| format!("failed to write {}: {e}", prompt_file.display()))?;
            command.env("REELQ_PROMPT_FILE", &prompt_file);
        }

        let mut child = command
            .spawn()
            .map_err(|e| format!("failed to start {}: {e}", self.program))?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut last = None;
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        last = Some(line);
                    }
                }
            }
            last
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match parse_progress(&line) {
                    Some(progress) => {
                        if let Err(e) = reporter.report(progress).await {
                            warn!(job_id = %job.id, error = %e, "Failed to record progress");
                        }
                    }
                    None => debug!(job_id = %job.id, "{line}"),
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| format!("failed to wait for {}: {e}", self.program))?;
        let last_stderr = stderr_task.await.ok().flatten();

        if status.success() {
            Ok(())
        } else {
            let mut reason = format!("{} exited with {status}", self.program);
            if let Some(line) = last_stderr {
                reason.push_str(": ");
                reason.push_str(&line);
            }
            Err(reason)
        }
    }
}

#[async_trait]
impl JobFunction for CommandJob {
    async fn run(&self, job: ClaimedJob, reporter: ProgressReporter) -> JobOutcome {
        info!(job_id = %job.id, task_uuid = %job.payload.task_uuid, "Starting job command");
        match self.execute(&job, &reporter).await {
            Ok(()) => JobOutcome::success(job.id),
            Err(reason) => JobOutcome::failure(job.id, reason),
        }
    }
}

/// Parse a `progress <n>` line. Values above 100 are clamped.
pub fn parse_progress(line: &str) -> Option<u8> {
    let value = line.trim().strip_prefix("progress")?.trim();
    let n: u32 = value.parse().ok()?;
    Some(n.min(100) as u8)
}
