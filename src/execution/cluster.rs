//! Batch-Cluster Backend
//!
//! Submits payloads to a batch resource manager through its command-line
//! front end (qsub/qstat/qdel shaped). The resource profile is translated
//! into native job attributes, the payload command is fed to the submit
//! command on stdin, and the printed job id is polled until terminal.
//!
//! Adapter conventions:
//!
//! - submit command: reads the payload from stdin, prints the job id on
//!   the first line of stdout
//! - status command: invoked with the job id; prints `queued` or
//!   `running` while the job is active, `done <exitcode>` once terminal
//! - cancel command: invoked with the job id
//!
//! One scheduler session is opened per run and released on every exit
//! path, including early returns, via `Drop`. Connectivity problems are
//! retried a bounded number of times with doubling backoff before the
//! whole run is failed: a backend that cannot answer makes the remaining
//! dispatch meaningless.

use std::any::Any;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::ResourceProfile;
use crate::error::EngineError;
use crate::execution::backend::{Backend, ExitStatus, JobHandle};

/// Attempts for the connectivity probe and for status polls.
const MAX_ATTEMPTS: u32 = 3;

/// Initial backoff; doubled after every failed attempt.
const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

/// Default interval between status polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Front-end commands of the target resource manager.
#[derive(Debug, Clone)]
pub struct ClusterCommands {
    pub submit: String,
    pub status: String,
    pub cancel: String,
}

impl Default for ClusterCommands {
    fn default() -> Self {
        Self {
            submit: "qsub".to_string(),
            status: "qstat".to_string(),
            cancel: "qdel".to_string(),
        }
    }
}

/// Scheduler session scoped to one run.
///
/// Opening probes the status command; dropping releases the session, so
/// an early `?` return cannot leak it.
struct ClusterSession {
    id: String,
}

impl ClusterSession {
    fn open(commands: &ClusterCommands, backoff: Duration) -> Result<Self, EngineError> {
        retry_with_backoff(backoff, "scheduler probe", || {
            let (status, _stdout) = run_shell(&commands.status, None)?;
            if status.is_success() {
                Ok(())
            } else {
                Err(EngineError::Infrastructure(format!(
                    "scheduler probe '{}' failed with {}",
                    commands.status, status
                )))
            }
        })?;

        let id = format!("ruleflow-{}", std::process::id());
        info!("Opened scheduler session {}", id);
        Ok(Self { id })
    }
}

impl Drop for ClusterSession {
    fn drop(&mut self) {
        info!("Released scheduler session {}", self.id);
    }
}

/// Batch-scheduler executor.
pub struct ClusterBackend {
    commands: ClusterCommands,
    poll_interval: Duration,
    backoff: Duration,
    // Held for the run's lifetime; dropped with the backend.
    _session: ClusterSession,
}

impl ClusterBackend {
    /// Opens a session against the resource manager.
    pub fn connect(commands: ClusterCommands) -> Result<Self, EngineError> {
        Self::connect_with(commands, DEFAULT_POLL_INTERVAL, DEFAULT_BACKOFF)
    }

    /// Connects with explicit poll and backoff intervals.
    pub fn connect_with(
        commands: ClusterCommands,
        poll_interval: Duration,
        backoff: Duration,
    ) -> Result<Self, EngineError> {
        let session = ClusterSession::open(&commands, backoff)?;
        Ok(Self {
            commands,
            poll_interval,
            backoff,
            _session: session,
        })
    }

    /// Renders the profile as native job attributes.
    fn native_attributes(resources: &ResourceProfile) -> String {
        format!(
            "-l nodes=1:ppn={},mem={}gb,walltime={}",
            resources.cores,
            resources.mem_gb,
            resources.walltime_clock()
        )
    }
}

/// One submitted batch job.
struct ClusterJob {
    job_id: String,
    canceled: AtomicBool,
}

impl JobHandle for ClusterJob {
    fn describe(&self) -> String {
        format!("job {}", self.job_id)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Backend for ClusterBackend {
    fn submit(
        &self,
        command: &str,
        resources: &ResourceProfile,
    ) -> Result<Arc<dyn JobHandle>, EngineError> {
        let line = format!("{} {}", self.commands.submit, Self::native_attributes(resources));
        let (status, stdout) = run_shell(&line, Some(command))?;

        if !status.is_success() {
            return Err(EngineError::Infrastructure(format!(
                "submit command '{}' failed with {}",
                line, status
            )));
        }

        let job_id = stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                EngineError::Infrastructure(format!(
                    "submit command '{}' printed no job id",
                    line
                ))
            })?
            .to_string();

        debug!("Submitted job {} ({})", job_id, resources);

        Ok(Arc::new(ClusterJob {
            job_id,
            canceled: AtomicBool::new(false),
        }))
    }

    fn wait(&self, handle: &dyn JobHandle) -> Result<ExitStatus, EngineError> {
        let job = downcast(handle)?;

        loop {
            let report = retry_with_backoff(self.backoff, "status poll", || {
                let line = format!("{} {}", self.commands.status, job.job_id);
                let (status, stdout) = run_shell(&line, None)?;
                if status.is_success() {
                    Ok(stdout)
                } else {
                    Err(EngineError::Infrastructure(format!(
                        "status command '{}' failed with {}",
                        line, status
                    )))
                }
            })?;

            match parse_status(&report) {
                JobState::Active => {}
                JobState::Done(code) => {
                    if job.canceled.load(Ordering::SeqCst) {
                        return Ok(ExitStatus::Canceled);
                    }
                    return Ok(ExitStatus::from_code(code));
                }
                JobState::Unparseable => {
                    return Err(EngineError::Infrastructure(format!(
                        "unrecognized status report for job {}: '{}'",
                        job.job_id,
                        report.trim()
                    )));
                }
            }

            std::thread::sleep(self.poll_interval);
        }
    }

    fn cancel(&self, handle: &dyn JobHandle) -> Result<(), EngineError> {
        let job = downcast(handle)?;
        job.canceled.store(true, Ordering::SeqCst);

        let line = format!("{} {}", self.commands.cancel, job.job_id);
        let (status, _stdout) = run_shell(&line, None)?;
        if !status.is_success() {
            warn!("cancel command '{}' failed with {}", line, status);
        }
        Ok(())
    }
}

enum JobState {
    Active,
    Done(i32),
    Unparseable,
}

/// Parses the status command's report.
fn parse_status(report: &str) -> JobState {
    let mut tokens = report.split_whitespace();
    match tokens.next() {
        Some("queued") | Some("running") => JobState::Active,
        Some("done") => match tokens.next().and_then(|t| t.parse().ok()) {
            Some(code) => JobState::Done(code),
            None => JobState::Unparseable,
        },
        _ => JobState::Unparseable,
    }
}

fn downcast(handle: &dyn JobHandle) -> Result<&ClusterJob, EngineError> {
    handle
        .as_any()
        .downcast_ref::<ClusterJob>()
        .ok_or_else(|| EngineError::Infrastructure("foreign job handle".to_string()))
}

/// Runs a shell line, optionally feeding stdin, capturing stdout.
fn run_shell(line: &str, stdin: Option<&str>) -> Result<(ExitStatus, String), EngineError> {
    let mut child = Command::new("bash")
        .arg("-c")
        .arg(line)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| EngineError::Infrastructure(format!("failed to run '{}': {}", line, e)))?;

    if let (Some(payload), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(payload.as_bytes()).map_err(|e| {
            EngineError::Infrastructure(format!("failed to feed '{}': {}", line, e))
        })?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| EngineError::Infrastructure(format!("failed to wait on '{}': {}", line, e)))?;

    let code = output.status.code().unwrap_or(-1);
    Ok((
        ExitStatus::from_code(code),
        String::from_utf8_lossy(&output.stdout).into_owned(),
    ))
}

/// Retries a transient operation with doubling backoff.
fn retry_with_backoff<T>(
    base: Duration,
    what: &str,
    mut op: impl FnMut() -> Result<T, EngineError>,
) -> Result<T, EngineError> {
    let mut delay = base;
    let mut last_err = None;

    for attempt in 1..=MAX_ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("{} attempt {}/{} failed: {}", what, attempt, MAX_ATTEMPTS, e);
                last_err = Some(e);
                if attempt < MAX_ATTEMPTS {
                    std::thread::sleep(delay);
                    delay *= 2;
                }
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| EngineError::Infrastructure(format!("{} failed", what))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/bash\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn fast() -> (Duration, Duration) {
        (Duration::from_millis(20), Duration::from_millis(10))
    }

    fn profile() -> ResourceProfile {
        ResourceProfile::new(4, 16, 3600)
    }

    #[test]
    fn test_probe_failure_is_infrastructure_error() {
        let commands = ClusterCommands {
            submit: "true".to_string(),
            status: "false".to_string(),
            cancel: "true".to_string(),
        };
        let (poll, backoff) = fast();

        let result = ClusterBackend::connect_with(commands, poll, backoff);
        assert!(matches!(result, Err(EngineError::Infrastructure(_))));
    }

    #[test]
    fn test_submit_translates_native_attributes() {
        let dir = tempdir().unwrap();
        let attrs_file = dir.path().join("attrs.txt");
        let submit = write_script(
            dir.path(),
            "submit.sh",
            &format!("cat > /dev/null; echo \"$@\" > {}; echo job-42", attrs_file.display()),
        );
        let status = write_script(dir.path(), "status.sh", "echo done 0");
        let cancel = write_script(dir.path(), "cancel.sh", "exit 0");

        let (poll, backoff) = fast();
        let backend = ClusterBackend::connect_with(
            ClusterCommands { submit, status, cancel },
            poll,
            backoff,
        )
        .unwrap();

        let handle = backend.submit("echo payload", &profile()).unwrap();
        assert_eq!(handle.describe(), "job job-42");

        let attrs = fs::read_to_string(&attrs_file).unwrap();
        assert!(attrs.contains("ppn=4"));
        assert!(attrs.contains("mem=16gb"));
        assert!(attrs.contains("walltime=01:00:00"));
    }

    #[test]
    fn test_wait_polls_until_done() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("polled-once");
        let submit = write_script(dir.path(), "submit.sh", "cat > /dev/null; echo j1");
        // Probe (no args) always succeeds; the first per-job poll
        // reports running, every later one done.
        let status = write_script(
            dir.path(),
            "status.sh",
            &format!(
                "[ -z \"$1\" ] && exit 0; \
                 if [ -f {m} ]; then echo done 0; else touch {m}; echo running; fi",
                m = marker.display()
            ),
        );
        let cancel = write_script(dir.path(), "cancel.sh", "exit 0");

        let (poll, backoff) = fast();
        let backend = ClusterBackend::connect_with(
            ClusterCommands { submit, status, cancel },
            poll,
            backoff,
        )
        .unwrap();

        let handle = backend.submit("echo payload", &profile()).unwrap();
        assert_eq!(backend.wait(handle.as_ref()).unwrap(), ExitStatus::Success);
        assert!(marker.exists());
    }

    #[test]
    fn test_nonzero_job_exit_is_task_failure_not_error() {
        let dir = tempdir().unwrap();
        let submit = write_script(dir.path(), "submit.sh", "cat > /dev/null; echo j1");
        let status = write_script(dir.path(), "status.sh", "echo done 7");
        let cancel = write_script(dir.path(), "cancel.sh", "exit 0");

        let (poll, backoff) = fast();
        let backend = ClusterBackend::connect_with(
            ClusterCommands { submit, status, cancel },
            poll,
            backoff,
        )
        .unwrap();

        let handle = backend.submit("exit 7", &profile()).unwrap();
        assert_eq!(backend.wait(handle.as_ref()).unwrap(), ExitStatus::Code(7));
    }

    #[test]
    fn test_cancel_invokes_cancel_command_and_maps_status() {
        let dir = tempdir().unwrap();
        let canceled_file = dir.path().join("canceled");
        let submit = write_script(dir.path(), "submit.sh", "cat > /dev/null; echo j9");
        // Reports running until the cancel command has fired.
        let status = write_script(
            dir.path(),
            "status.sh",
            &format!(
                "if [ -f {c} ]; then echo done 143; else echo running; fi",
                c = canceled_file.display()
            ),
        );
        let cancel = write_script(
            dir.path(),
            "cancel.sh",
            &format!("touch {}", canceled_file.display()),
        );

        let (poll, backoff) = fast();
        let backend = Arc::new(
            ClusterBackend::connect_with(
                ClusterCommands { submit, status, cancel },
                poll,
                backoff,
            )
            .unwrap(),
        );

        let handle = backend.submit("sleep 600", &profile()).unwrap();

        let waiter = {
            let backend = Arc::clone(&backend);
            let handle = Arc::clone(&handle);
            std::thread::spawn(move || backend.wait(handle.as_ref()))
        };

        std::thread::sleep(Duration::from_millis(50));
        backend.cancel(handle.as_ref()).unwrap();

        assert_eq!(waiter.join().unwrap().unwrap(), ExitStatus::Canceled);
        assert!(canceled_file.exists());
    }

    #[test]
    fn test_status_poll_retries_before_infrastructure_error() {
        let dir = tempdir().unwrap();
        let submit = write_script(dir.path(), "submit.sh", "cat > /dev/null; echo j1");
        // Status succeeds for the probe (no args) but fails per-job.
        let status = write_script(dir.path(), "status.sh", "[ -z \"$1\" ] && exit 0; exit 1");
        let cancel = write_script(dir.path(), "cancel.sh", "exit 0");

        let (poll, backoff) = fast();
        let backend = ClusterBackend::connect_with(
            ClusterCommands { submit, status, cancel },
            poll,
            backoff,
        )
        .unwrap();

        let handle = backend.submit("echo x", &profile()).unwrap();
        let result = backend.wait(handle.as_ref());
        assert!(matches!(result, Err(EngineError::Infrastructure(_))));
    }

    #[test]
    fn test_parse_status_variants() {
        assert!(matches!(parse_status("queued\n"), JobState::Active));
        assert!(matches!(parse_status("running"), JobState::Active));
        assert!(matches!(parse_status("done 0"), JobState::Done(0)));
        assert!(matches!(parse_status("done 11"), JobState::Done(11)));
        assert!(matches!(parse_status("???"), JobState::Unparseable));
        assert!(matches!(parse_status("done"), JobState::Unparseable));
    }
}
