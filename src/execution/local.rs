//! Local Process Backend
//!
//! Runs each payload as a `bash -c` subprocess on the current machine.
//! The wall-clock limit from the resource profile is enforced here: the
//! process is killed once the limit is exceeded and the task fails with
//! a timeout status. Core and memory figures are advisory locally; the
//! concurrency cap is the only throttle.

use std::any::Any;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::config::ResourceProfile;
use crate::error::EngineError;
use crate::execution::backend::{Backend, ExitStatus, JobHandle};

/// How often a running child is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Subprocess executor.
#[derive(Debug, Default)]
pub struct LocalBackend;

impl LocalBackend {
    /// Creates a local backend.
    pub fn new() -> Self {
        Self
    }
}

/// One spawned child; shared between the waiting worker and the
/// coordinator's cancel path.
struct LocalJob {
    child: Mutex<Child>,
    canceled: AtomicBool,
    started: Instant,
    walltime: Duration,
    pid: u32,
}

impl JobHandle for LocalJob {
    fn describe(&self) -> String {
        format!("pid {}", self.pid)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl LocalJob {
    /// Kills the child, tolerating an already-exited process.
    fn kill(&self) {
        let mut child = match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = child.kill() {
            debug!("kill pid {}: {}", self.pid, e);
        }
    }
}

impl Backend for LocalBackend {
    fn submit(
        &self,
        command: &str,
        resources: &ResourceProfile,
    ) -> Result<Arc<dyn JobHandle>, EngineError> {
        let child = Command::new("bash")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| EngineError::Infrastructure(format!("failed to spawn bash: {}", e)))?;

        let pid = child.id();
        debug!("Spawned pid {} ({})", pid, resources);

        Ok(Arc::new(LocalJob {
            child: Mutex::new(child),
            canceled: AtomicBool::new(false),
            started: Instant::now(),
            walltime: resources.walltime,
            pid,
        }))
    }

    fn wait(&self, handle: &dyn JobHandle) -> Result<ExitStatus, EngineError> {
        let job = downcast(handle)?;

        loop {
            let exited = {
                let mut child = job.child.lock().map_err(|_| {
                    EngineError::Infrastructure("local job mutex poisoned".to_string())
                })?;
                child.try_wait().map_err(|e| {
                    EngineError::Infrastructure(format!("wait on pid {}: {}", job.pid, e))
                })?
            };

            if let Some(status) = exited {
                if job.canceled.load(Ordering::SeqCst) {
                    return Ok(ExitStatus::Canceled);
                }
                return Ok(map_status(status));
            }

            if job.started.elapsed() > job.walltime {
                warn!(
                    "pid {} exceeded walltime of {}s, killing",
                    job.pid,
                    job.walltime.as_secs()
                );
                job.kill();
                reap(job);
                return Ok(if job.canceled.load(Ordering::SeqCst) {
                    ExitStatus::Canceled
                } else {
                    ExitStatus::TimedOut
                });
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn cancel(&self, handle: &dyn JobHandle) -> Result<(), EngineError> {
        let job = downcast(handle)?;
        job.canceled.store(true, Ordering::SeqCst);
        job.kill();
        Ok(())
    }
}

fn downcast(handle: &dyn JobHandle) -> Result<&LocalJob, EngineError> {
    handle
        .as_any()
        .downcast_ref::<LocalJob>()
        .ok_or_else(|| EngineError::Infrastructure("foreign job handle".to_string()))
}

/// Collects the exit status after a kill so no zombie is left behind.
fn reap(job: &LocalJob) {
    if let Ok(mut child) = job.child.lock() {
        let _ = child.wait();
    }
}

#[cfg(unix)]
fn map_status(status: std::process::ExitStatus) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;

    match status.code() {
        Some(code) => ExitStatus::from_code(code),
        None => ExitStatus::Signal(status.signal().unwrap_or(-1)),
    }
}

#[cfg(not(unix))]
fn map_status(status: std::process::ExitStatus) -> ExitStatus {
    ExitStatus::from_code(status.code().unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn profile(walltime_secs: u64) -> ResourceProfile {
        ResourceProfile::new(1, 1, walltime_secs)
    }

    #[test]
    fn test_exit_zero_is_success() {
        let backend = LocalBackend::new();
        let handle = backend.submit("exit 0", &profile(60)).unwrap();
        assert_eq!(backend.wait(handle.as_ref()).unwrap(), ExitStatus::Success);
    }

    #[test]
    fn test_nonzero_exit_code_preserved() {
        let backend = LocalBackend::new();
        let handle = backend.submit("exit 3", &profile(60)).unwrap();
        assert_eq!(backend.wait(handle.as_ref()).unwrap(), ExitStatus::Code(3));
    }

    #[test]
    fn test_payload_side_effects_land() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.txt");

        let backend = LocalBackend::new();
        let handle = backend
            .submit(&format!("echo done > {}", out.display()), &profile(60))
            .unwrap();

        assert!(backend.wait(handle.as_ref()).unwrap().is_success());
        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "done");
    }

    #[test]
    fn test_walltime_kill_maps_to_timeout() {
        let backend = LocalBackend::new();
        let handle = backend.submit("sleep 30", &profile(1)).unwrap();

        let status = backend.wait(handle.as_ref()).unwrap();
        assert_eq!(status, ExitStatus::TimedOut);
    }

    #[test]
    fn test_cancel_maps_to_canceled() {
        let backend = LocalBackend::new();
        let handle = backend.submit("sleep 30", &profile(60)).unwrap();

        let waiter = {
            let handle = Arc::clone(&handle);
            std::thread::spawn(move || LocalBackend::new().wait(handle.as_ref()))
        };

        std::thread::sleep(Duration::from_millis(200));
        backend.cancel(handle.as_ref()).unwrap();

        let status = waiter.join().unwrap().unwrap();
        assert_eq!(status, ExitStatus::Canceled);
    }
}
