//! Engine Error Taxonomy
//!
//! Errors are split by where they strike and how much of a run they take
//! down:
//!
//! - [`EngineError::Configuration`] - bad or missing rule/resource entry,
//!   fatal before any job runs
//! - [`EngineError::Graph`] - ambiguous or unsatisfiable pattern match,
//!   fatal at build time
//! - [`EngineError::MissingInput`] - an origination file is absent and
//!   cannot be produced, fatal at build time
//! - [`EngineError::Template`] - a placeholder references a capture group
//!   that does not exist in the bindings
//! - [`EngineError::Infrastructure`] - the execution backend itself is
//!   unusable, aborts the whole run
//!
//! A failed job is *not* an error: it is a terminal task status that
//! blocks dependents while unrelated branches keep running.

use std::path::PathBuf;

use thiserror::Error;

/// All failure modes surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad or missing configuration (rule or resource entry).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The rule set cannot be expanded into a valid task graph.
    #[error("graph error: {0}")]
    Graph(String),

    /// An origination input does not exist and nothing produces it.
    #[error("missing input file: {}", .0.display())]
    MissingInput(PathBuf),

    /// A template placeholder references an unknown capture group.
    #[error("template error in '{template}': unknown group '{group}'")]
    Template { template: String, group: String },

    /// The execution backend is unreachable or its session was lost.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// Filesystem access failed while building or evaluating the graph.
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// True if the error invalidates the whole run rather than one task.
    pub fn is_fatal(&self) -> bool {
        // Every variant here is fatal; per-task failures are statuses.
        true
    }
}
