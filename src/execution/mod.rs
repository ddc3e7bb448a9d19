//! Workflow Execution Module
//!
//! Dispatches built task graphs to a pluggable backend and tracks the
//! run to a final report.
//!
//! # Architecture
//!
//! - [`engine`]: Coordinator loop orchestrating one run
//! - [`state`]: Mutex-guarded status table for in-flight runs
//! - [`backend`]: The executor trait and terminal job statuses
//! - [`local`]: Subprocess backend for the current machine
//! - [`cluster`]: Batch-scheduler backend (qsub/qstat/qdel shaped)

pub mod backend;
pub mod cluster;
pub mod engine;
pub mod local;
pub mod state;

pub use backend::{Backend, ExitStatus, JobHandle};
pub use cluster::{ClusterBackend, ClusterCommands};
pub use engine::{run_pipeline, Engine, RunReport};
pub use local::LocalBackend;
pub use state::{RunState, TaskStatus};
