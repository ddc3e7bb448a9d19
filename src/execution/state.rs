//! Run State
//!
//! Single source of truth for task statuses during one invocation. The
//! DAG's topology is read-only after build; the statuses here are the
//! only mutable shared state, guarded by one mutex. Completion and
//! failure transitions are applied atomically together with the
//! dependent bookkeeping they trigger, so two dependents of the same
//! task can never observe an inconsistent predecessor count.

use std::sync::Mutex;

use crate::execution::backend::ExitStatus;
use crate::workflow::graph::{TaskGraph, TaskId};
use crate::workflow::staleness::Freshness;

/// Lifecycle of one task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting on predecessors.
    Pending,
    /// All predecessors settled; eligible for dispatch.
    Ready,
    /// Handed to the backend.
    Running,
    /// Payload exited successfully.
    Done,
    /// Payload failed, timed out, or was canceled.
    Failed(ExitStatus),
    /// Satisfied at build time; behaves as done, issues no job.
    Skipped,
    /// An ancestor failed; never dispatched.
    Blocked,
}

impl TaskStatus {
    /// True once the task can never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed(_) | TaskStatus::Skipped | TaskStatus::Blocked
        )
    }

    /// True if dependents may treat this task as satisfied.
    pub fn unblocks_dependents(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Skipped)
    }
}

struct Inner {
    statuses: Vec<TaskStatus>,
    /// Predecessors not yet done/skipped, per task.
    remaining: Vec<usize>,
    dependents: Vec<Vec<TaskId>>,
    running: usize,
}

/// Mutex-guarded status table for one run.
pub struct RunState {
    inner: Mutex<Inner>,
}

impl RunState {
    /// Seeds state from the graph and its staleness verdicts.
    ///
    /// Satisfied tasks are skipped outright; the returned ids are the
    /// initial ready set (needed tasks whose predecessors are all
    /// skipped or absent).
    pub fn new(graph: &TaskGraph, verdicts: &[Freshness]) -> (Self, Vec<TaskId>) {
        let predecessors: Vec<Vec<TaskId>> = graph
            .tasks()
            .iter()
            .map(|t| t.predecessors.clone())
            .collect();
        let skipped: Vec<bool> = verdicts.iter().map(|v| *v == Freshness::Satisfied).collect();
        Self::with_topology(predecessors, &skipped)
    }

    /// Builds state from raw topology; split out for tests.
    pub(crate) fn with_topology(
        predecessors: Vec<Vec<TaskId>>,
        skipped: &[bool],
    ) -> (Self, Vec<TaskId>) {
        let n = predecessors.len();
        let mut dependents = vec![Vec::new(); n];
        for (id, preds) in predecessors.iter().enumerate() {
            for &p in preds {
                dependents[p].push(id);
            }
        }

        let mut statuses = vec![TaskStatus::Pending; n];
        let mut remaining: Vec<usize> = predecessors.iter().map(|p| p.len()).collect();

        // Skipped tasks settle immediately; ids ascend along edges, so
        // one forward pass decrements every dependent correctly.
        for id in 0..n {
            if skipped[id] {
                statuses[id] = TaskStatus::Skipped;
                for &dep in &dependents[id] {
                    remaining[dep] -= 1;
                }
            }
        }

        let mut ready = Vec::new();
        for id in 0..n {
            if statuses[id] == TaskStatus::Pending && remaining[id] == 0 {
                statuses[id] = TaskStatus::Ready;
                ready.push(id);
            }
        }

        let state = Self {
            inner: Mutex::new(Inner {
                statuses,
                remaining,
                dependents,
                running: 0,
            }),
        };
        (state, ready)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panicked coordinator; the statuses
        // themselves are still sound.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Marks a ready task as dispatched.
    pub fn mark_running(&self, id: TaskId) {
        let mut inner = self.lock();
        debug_assert_eq!(inner.statuses[id], TaskStatus::Ready);
        inner.statuses[id] = TaskStatus::Running;
        inner.running += 1;
    }

    /// Terminal success; returns dependents that became ready.
    pub fn complete(&self, id: TaskId) -> Vec<TaskId> {
        let mut inner = self.lock();
        inner.statuses[id] = TaskStatus::Done;
        inner.running -= 1;

        let mut newly_ready = Vec::new();
        let dependents = inner.dependents[id].clone();
        for dep in dependents {
            inner.remaining[dep] -= 1;
            if inner.remaining[dep] == 0 && inner.statuses[dep] == TaskStatus::Pending {
                inner.statuses[dep] = TaskStatus::Ready;
                newly_ready.push(dep);
            }
        }
        newly_ready
    }

    /// Terminal failure; blocks every transitive dependent and returns
    /// the blocked ids.
    pub fn fail(&self, id: TaskId, status: ExitStatus) -> Vec<TaskId> {
        let mut inner = self.lock();
        // A task can fail without ever running (its submission was
        // rejected); only a running task holds a slot.
        if inner.statuses[id] == TaskStatus::Running {
            inner.running -= 1;
        }
        inner.statuses[id] = TaskStatus::Failed(status);

        let mut blocked = Vec::new();
        let mut frontier = inner.dependents[id].clone();
        while let Some(dep) = frontier.pop() {
            match inner.statuses[dep] {
                TaskStatus::Pending | TaskStatus::Ready => {
                    inner.statuses[dep] = TaskStatus::Blocked;
                    blocked.push(dep);
                    frontier.extend(inner.dependents[dep].iter().copied());
                }
                _ => {}
            }
        }
        blocked
    }

    /// Blocks every task not yet dispatched; used when a stop is
    /// requested. Returns the blocked ids.
    pub fn block_unstarted(&self) -> Vec<TaskId> {
        let mut inner = self.lock();
        let mut blocked = Vec::new();
        for id in 0..inner.statuses.len() {
            if matches!(inner.statuses[id], TaskStatus::Pending | TaskStatus::Ready) {
                inner.statuses[id] = TaskStatus::Blocked;
                blocked.push(id);
            }
        }
        blocked
    }

    /// Current status of one task.
    pub fn status(&self, id: TaskId) -> TaskStatus {
        self.lock().statuses[id]
    }

    /// Number of tasks currently running.
    pub fn running_count(&self) -> usize {
        self.lock().running
    }

    /// True when no task is pending, ready, or running.
    pub fn is_settled(&self) -> bool {
        let inner = self.lock();
        inner.statuses.iter().all(|s| s.is_terminal())
    }

    /// Snapshot of all statuses, in task id order.
    pub fn snapshot(&self) -> Vec<TaskStatus> {
        self.lock().statuses.clone()
    }
}
