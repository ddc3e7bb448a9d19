//! Staleness Evaluation
//!
//! Decides once per run, right after graph build, whether each task needs
//! to run. Standard make-style contract: a task is satisfied when all of
//! its outputs exist and none is older than any input. A needed
//! predecessor makes every dependent needed, regardless of timestamps.
//!
//! The filesystem is assumed stable for the duration of one invocation
//! except for files the run itself produces, so evaluation is not
//! repeated mid-run.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use log::debug;

use crate::error::EngineError;
use crate::workflow::graph::TaskGraph;

/// Whether a task's outputs are up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Outputs missing or older than an input, or a predecessor is needed.
    Needed,
    /// Every output exists and is not older than any input.
    Satisfied,
}

/// Evaluates freshness for every task, in id order.
///
/// Edges always point to lower ids, so a single forward pass sees every
/// predecessor's verdict before its dependents. An origination task whose
/// file is absent fails the run: nothing can produce it.
pub fn evaluate(graph: &TaskGraph) -> Result<Vec<Freshness>, EngineError> {
    let mut verdicts = Vec::with_capacity(graph.len());

    for task in graph.tasks() {
        let verdict = if task.origin {
            for file in &task.outputs {
                if !file.exists() {
                    return Err(EngineError::MissingInput(file.clone()));
                }
            }
            Freshness::Satisfied
        } else if task
            .predecessors
            .iter()
            .any(|&p| verdicts[p] == Freshness::Needed)
        {
            // Dependency invalidation cascades forward.
            Freshness::Needed
        } else {
            own_freshness(task.all_inputs(), &task.outputs)
        };

        debug!("Task '{}': {:?}", task.label, verdict);
        verdicts.push(verdict);
    }

    Ok(verdicts)
}

/// Timestamp comparison for one task, ignoring predecessors.
fn own_freshness<'a>(
    inputs: impl Iterator<Item = &'a std::path::PathBuf>,
    outputs: &[std::path::PathBuf],
) -> Freshness {
    let oldest_output = outputs.iter().map(|p| mtime(p)).min();

    let Some(Some(oldest_output)) = oldest_output else {
        // No outputs declared, or at least one is missing.
        return Freshness::Needed;
    };

    for input in inputs {
        match mtime(input) {
            // An unreadable input counts as newest-possible.
            None => return Freshness::Needed,
            Some(t) if t > oldest_output => return Freshness::Needed,
            Some(_) => {}
        }
    }

    Freshness::Satisfied
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).ok().and_then(|m| m.modified().ok())
}
