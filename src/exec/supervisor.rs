/// Renderer process supervision
///
/// One invocation = one child in its own process group. The supervisor
/// enforces the wall-clock deadline by signalling the whole group, so
/// helpers the renderer forks die with it, then hands the evidence to the
/// outcome classifier.
use crate::config::loader::RendererConfig;
use crate::config::types::{RenderOutcome, RenderResource, ResourceKey, Result};
use crate::exec::command::RenderInvocation;
use crate::utils::output::{merged_pipe, OutputCollector, OutputIntegrity};
use crate::verdict::{OutcomeClassifier, RenderEvidence};
use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What happened while terminating an overdue renderer
#[derive(Debug, Clone, Default)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// Evidence and outcome of one renderer run
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub job_id: Uuid,
    pub key: ResourceKey,
    pub started_at: DateTime<Utc>,
    pub command: String,
    pub pid: u32,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub output: String,
    /// Error-marker lines seen anywhere in the output
    pub error_lines: Vec<String>,
    pub output_integrity: OutputIntegrity,
    pub output_bytes: u64,
    pub wall_time: Duration,
    pub kill: Option<KillReport>,
    pub outcome: RenderOutcome,
}

pub struct ProcessSupervisor {
    config: RendererConfig,
    classifier: OutcomeClassifier,
}

impl ProcessSupervisor {
    pub fn new(config: RendererConfig) -> Self {
        let classifier = OutcomeClassifier::new(&config.error_markers);
        Self { config, classifier }
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Run the renderer for `resource` as job `job_id` and wait for it, at
    /// most `deadline`.
    ///
    /// Returns `Err` only when the renderer could not be started or the
    /// output directory could not be prepared; every run that started
    /// yields a `RenderJob` whose outcome says whether it succeeded.
    pub fn invoke(
        &self,
        job_id: Uuid,
        resource: &RenderResource,
        deadline: Duration,
    ) -> Result<RenderJob> {
        remove_stale_artifact(resource)?;

        let invocation = RenderInvocation::build(&self.config, resource);
        let command_line = invocation.display();
        let (reader, out, err) = merged_pipe()?;

        let mut cmd = invocation.to_command();
        cmd.stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            .process_group(0);

        let started_at = Utc::now();
        let start = Instant::now();

        let mut child = cmd.spawn().map_err(|e| {
            log::error!("Failed to start renderer `{}`: {}", command_line, e);
            e
        })?;
        // Close the parent's write ends so the collector sees EOF
        drop(cmd);

        let pid = child.id();
        log::info!(
            "Render {} started for {} (pid {}): {}",
            job_id,
            resource.key,
            pid,
            command_line
        );

        let classifier = self.classifier.clone();
        let pending = OutputCollector::new(self.config.output_limit_bytes)
            .flag_lines(move |line| classifier.is_error_line(line))
            .start(reader);
        let (status, timed_out, kill_report) = self.wait_with_deadline(&mut child, deadline)?;
        let wall_time = start.elapsed();
        let captured = pending.finish(self.config.collection_timeout());

        if captured.integrity != OutputIntegrity::Complete {
            log::warn!(
                "Render {} output integrity: {} ({} bytes seen)",
                job_id,
                captured.integrity,
                captured.total_bytes
            );
        }
        if captured.flagged_overflow > 0 {
            log::warn!(
                "Render {} printed {} more error lines than were kept",
                job_id,
                captured.flagged_overflow
            );
        }

        let output = captured.text();
        let exit_code = status.code();
        let signal = status.signal();
        let outcome = self.classifier.classify(&RenderEvidence {
            exit_code,
            signal,
            timed_out,
            deadline,
            error_lines: &captured.flagged_lines,
            artifact_path: &resource.artifact_path,
            artifact_exists: resource.artifact_path.is_file(),
        });

        match &outcome {
            RenderOutcome::Done(path) => log::info!(
                "Render {} for {} done in {:?}: {}",
                job_id,
                resource.key,
                wall_time,
                path.display()
            ),
            RenderOutcome::Failed(failure) => log::warn!(
                "Render {} for {} failed after {:?}: {}",
                job_id,
                resource.key,
                wall_time,
                failure.error
            ),
        }

        Ok(RenderJob {
            job_id,
            key: resource.key.clone(),
            started_at,
            command: command_line,
            pid,
            exit_code,
            signal,
            timed_out,
            output,
            error_lines: captured.flagged_lines,
            output_integrity: captured.integrity,
            output_bytes: captured.total_bytes,
            wall_time,
            kill: kill_report,
            outcome,
        })
    }

    fn wait_with_deadline(
        &self,
        child: &mut Child,
        deadline: Duration,
    ) -> io::Result<(ExitStatus, bool, Option<KillReport>)> {
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok((status, false, None));
            }
            if start.elapsed() >= deadline {
                log::warn!(
                    "Renderer pid {} exceeded deadline of {:?}, terminating",
                    child.id(),
                    deadline
                );
                let report = terminate_group(child, self.config.kill_grace())?;
                let status = child.wait()?;
                return Ok((status, true, Some(report)));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// SIGTERM the renderer's group, give it `grace` to exit, then SIGKILL
fn terminate_group(child: &mut Child, grace: Duration) -> io::Result<KillReport> {
    let mut report = KillReport::default();
    let start = Instant::now();
    let pid = Pid::from_raw(child.id() as i32);

    if let Err(errno) = killpg(pid, Signal::SIGTERM) {
        let _ = kill(pid, Signal::SIGTERM);
        report
            .notes
            .push(format!("group SIGTERM fallback used: {}", errno));
    }
    report.term_sent = true;

    while start.elapsed() < grace {
        if child.try_wait()?.is_some() {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    // The leader may be gone while descendants still hold the group
    match killpg(pid, Signal::SIGKILL) {
        Ok(()) => report.kill_sent = true,
        Err(nix::errno::Errno::ESRCH) => {}
        Err(errno) => {
            let _ = kill(pid, Signal::SIGKILL);
            report.kill_sent = true;
            report
                .notes
                .push(format!("group SIGKILL fallback used: {}", errno));
        }
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    Ok(report)
}

/// An artifact left by an earlier run must not pass for this run's output
fn remove_stale_artifact(resource: &RenderResource) -> Result<()> {
    match fs::remove_file(&resource.artifact_path) {
        Ok(()) => {
            log::debug!(
                "Removed stale artifact {}",
                resource.artifact_path.display()
            );
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
