//! Execution Backend Interface
//!
//! The engine never inspects what a payload does; it hands an opaque
//! command string and a resource profile to a backend and waits for a
//! terminal status. Two implementations ship with the crate:
//!
//! - [`crate::execution::local::LocalBackend`] - subprocess on the
//!   current machine
//! - [`crate::execution::cluster::ClusterBackend`] - batch-scheduler
//!   submission (qsub/qstat/qdel shaped)
//!
//! Backends are selected by configuration and passed around as trait
//! objects; unit tests substitute stubs with trivial payloads.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ResourceProfile;
use crate::error::EngineError;

/// Terminal status of one dispatched job.
///
/// Only `Success` maps to a completed task; everything else is preserved
/// for diagnostics and marks the task failed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exit code 0.
    Success,
    /// Non-zero exit code.
    Code(i32),
    /// Terminated by a signal.
    Signal(i32),
    /// Killed after exceeding its wall-clock limit.
    TimedOut,
    /// Terminated by an explicit cancel.
    Canceled,
}

impl ExitStatus {
    /// True for exit code 0.
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    /// Maps a raw exit code.
    pub fn from_code(code: i32) -> Self {
        if code == 0 {
            ExitStatus::Success
        } else {
            ExitStatus::Code(code)
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Success => write!(f, "exit 0"),
            ExitStatus::Code(c) => write!(f, "exit {}", c),
            ExitStatus::Signal(s) => write!(f, "signal {}", s),
            ExitStatus::TimedOut => write!(f, "walltime exceeded"),
            ExitStatus::Canceled => write!(f, "canceled"),
        }
    }
}

/// Opaque handle to one in-flight job.
///
/// Handles live only while their task is running; the dispatcher drops
/// them (and any underlying session resource) before the task goes
/// terminal. `as_any` lets a backend downcast its own handles.
pub trait JobHandle: Send + Sync {
    /// Backend-specific identifier, for logs.
    fn describe(&self) -> String;

    fn as_any(&self) -> &dyn Any;
}

/// A pluggable job executor.
///
/// `wait` blocks until the job is terminal and only errs for
/// infrastructure problems; a failing payload is a non-success
/// [`ExitStatus`], not an error.
pub trait Backend: Send + Sync {
    /// Submits a command with its resource request.
    fn submit(
        &self,
        command: &str,
        resources: &ResourceProfile,
    ) -> Result<Arc<dyn JobHandle>, EngineError>;

    /// Blocks until the job reaches a terminal status.
    fn wait(&self, handle: &dyn JobHandle) -> Result<ExitStatus, EngineError>;

    /// Requests termination of a running job.
    fn cancel(&self, handle: &dyn JobHandle) -> Result<(), EngineError>;
}
