//! Workflow Execution Engine
//!
//! The coordinator that drives one run to completion:
//! - seeds the ready queue from the staleness verdicts
//! - dispatches ready tasks to the backend, bounded by the concurrency cap
//! - applies terminal transitions and releases dependents as jobs finish
//! - blocks the transitive dependents of failures without touching
//!   unrelated branches
//! - on a stop request or infrastructure failure, cancels every running
//!   job and waits for each backend acknowledgment before returning
//!
//! A single coordinator thread owns all state transitions; workers only
//! wait on the backend and report back over a channel.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::execution::backend::{Backend, ExitStatus, JobHandle};
use crate::execution::state::{RunState, TaskStatus};
use crate::workflow::graph::{Task, TaskGraph, TaskId};
use crate::workflow::staleness::{self, Freshness};

/// How long the coordinator blocks on the completion channel before
/// re-checking the stop flag.
const COORDINATOR_TICK: Duration = Duration::from_millis(200);

/// Outcome of one run, keyed by task label.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunReport {
    /// Tasks whose payload exited successfully.
    pub completed: BTreeSet<String>,
    /// Tasks satisfied at build time; no job was issued.
    pub skipped: BTreeSet<String>,
    /// Tasks whose payload failed, timed out, or was canceled.
    pub failed: BTreeSet<String>,
    /// Tasks never dispatched because an ancestor failed.
    pub blocked: BTreeSet<String>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

impl RunReport {
    /// True iff no task failed and none was blocked.
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty()
    }
}

/// One worker's terminal verdict for a task.
type Completion = (TaskId, Result<ExitStatus, EngineError>);

/// Drives a task graph to completion against a backend.
pub struct Engine {
    graph: TaskGraph,
    backend: Arc<dyn Backend>,
    concurrency_cap: usize,
    stop: Arc<AtomicBool>,
}

impl Engine {
    /// Creates an engine; the cap defaults to the machine's core count.
    pub fn new(graph: TaskGraph, backend: Arc<dyn Backend>) -> Self {
        Self {
            graph,
            backend,
            concurrency_cap: num_cpus::get().max(1),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bounds the number of simultaneously running tasks.
    pub fn set_concurrency_cap(&mut self, cap: usize) {
        self.concurrency_cap = cap.max(1);
    }

    /// Flag that asks the run to stop; safe to set from another thread
    /// or a signal handler.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Executes the run.
    ///
    /// Returns `Ok` with the report even when tasks failed or the run
    /// was stopped; the report records the damage. Returns `Err` only
    /// for evaluation errors and infrastructure failures.
    pub fn run(&self) -> Result<RunReport, EngineError> {
        let started = Utc::now();

        let verdicts = staleness::evaluate(&self.graph)?;
        let (state, initial_ready) = RunState::new(&self.graph, &verdicts);

        let needed = verdicts.iter().filter(|v| **v == Freshness::Needed).count();
        info!(
            "Run of {} tasks: {} need work, {} up to date (cap {})",
            self.graph.len(),
            needed,
            self.graph.len() - needed,
            self.concurrency_cap
        );

        let mut ready: VecDeque<TaskId> = initial_ready.into();
        let (tx, rx): (Sender<Completion>, Receiver<Completion>) = channel();

        // In-flight handles, held by the coordinator for cancellation.
        let mut handles: Vec<(TaskId, Arc<dyn JobHandle>)> = Vec::new();
        let mut stopping = false;
        let mut fatal: Option<EngineError> = None;

        loop {
            if !stopping && (self.stop.load(Ordering::SeqCst) || fatal.is_some()) {
                stopping = true;
                ready.clear();
                let blocked = state.block_unstarted();
                if !blocked.is_empty() {
                    info!(
                        "Stop requested: {} undispatched task(s) blocked",
                        blocked.len()
                    );
                }
                for (id, handle) in &handles {
                    info!(
                        "Canceling '{}' ({})",
                        self.graph.task(*id).label,
                        handle.describe()
                    );
                    if let Err(e) = self.backend.cancel(handle.as_ref()) {
                        warn!("cancel of {} failed: {}", handle.describe(), e);
                    }
                }
            }

            while !stopping && state.running_count() < self.concurrency_cap {
                let Some(id) = ready.pop_front() else { break };
                match self.dispatch(id, &state, &tx) {
                    Ok(handle) => handles.push((id, handle)),
                    Err(e) => {
                        error!(
                            "dispatch of '{}' failed: {}",
                            self.graph.task(id).label,
                            e
                        );
                        state.fail(id, ExitStatus::Canceled);
                        fatal = Some(e);
                        break;
                    }
                }
            }

            if state.running_count() == 0 && (ready.is_empty() || stopping) {
                break;
            }

            let (id, result) = match rx.recv_timeout(COORDINATOR_TICK) {
                Ok(completion) => completion,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::Infrastructure(
                        "worker channel disconnected".to_string(),
                    ))
                }
            };

            handles.retain(|(held, _)| *held != id);
            let label = &self.graph.task(id).label;

            match result {
                Ok(status) if status.is_success() => {
                    info!("Task '{}' completed", label);
                    let newly_ready = state.complete(id);
                    if !stopping {
                        ready.extend(newly_ready);
                    }
                }
                Ok(status) => {
                    error!("Task '{}' failed: {}", label, status);
                    let blocked = state.fail(id, status);
                    for b in &blocked {
                        debug!("Task '{}' blocked", self.graph.task(*b).label);
                    }
                    if !blocked.is_empty() {
                        warn!(
                            "{} dependent task(s) of '{}' blocked",
                            blocked.len(),
                            label
                        );
                    }
                }
                Err(e) => {
                    error!("Backend lost while waiting on '{}': {}", label, e);
                    state.fail(id, ExitStatus::Canceled);
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }

        let report = self.report(&state, started);
        info!(
            "Run finished: {} completed, {} skipped, {} failed, {} blocked",
            report.completed.len(),
            report.skipped.len(),
            report.failed.len(),
            report.blocked.len()
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Submits one ready task and spawns its waiting worker.
    fn dispatch(
        &self,
        id: TaskId,
        state: &RunState,
        tx: &Sender<Completion>,
    ) -> Result<Arc<dyn JobHandle>, EngineError> {
        let task = self.graph.task(id);

        // Origination anchors are satisfied or fatal at evaluation
        // time, so everything that reaches dispatch carries a command
        // and a resource profile.
        let command = task.command.as_deref().ok_or_else(|| {
            EngineError::Infrastructure(format!("task '{}' has no command", task.label))
        })?;
        let resources = task.resources.as_ref().ok_or_else(|| {
            EngineError::Infrastructure(format!("task '{}' has no resources", task.label))
        })?;

        ensure_output_dirs(task)?;

        info!("Starting task '{}'", task.label);
        debug!("  command: {}", command);
        let handle = self.backend.submit(command, resources)?;
        state.mark_running(id);

        let backend = Arc::clone(&self.backend);
        let worker_handle = Arc::clone(&handle);
        let tx = tx.clone();
        thread::spawn(move || {
            let result = backend.wait(worker_handle.as_ref());
            // A send failure means the coordinator is gone; nothing
            // left to report to.
            let _ = tx.send((id, result));
        });

        Ok(handle)
    }

    fn report(&self, state: &RunState, started: DateTime<Utc>) -> RunReport {
        let mut report = RunReport {
            completed: BTreeSet::new(),
            skipped: BTreeSet::new(),
            failed: BTreeSet::new(),
            blocked: BTreeSet::new(),
            started,
            finished: Utc::now(),
        };

        for (id, status) in state.snapshot().into_iter().enumerate() {
            let label = self.graph.task(id).label.clone();
            match status {
                TaskStatus::Done => {
                    report.completed.insert(label);
                }
                TaskStatus::Skipped => {
                    report.skipped.insert(label);
                }
                TaskStatus::Failed(_) => {
                    report.failed.insert(label);
                }
                TaskStatus::Blocked => {
                    report.blocked.insert(label);
                }
                other => {
                    // Unreachable once the loop exits; counted as
                    // blocked so the report never overstates success.
                    warn!("task '{}' left in state {:?}", label, other);
                    report.blocked.insert(label);
                }
            }
        }

        report
    }
}

/// Builds the task graph for a pipeline and runs it in one call.
pub fn run_pipeline(
    pipeline: &crate::workflow::rule::Pipeline,
    resources: &crate::config::ResourceConfig,
    concurrency_cap: usize,
    backend: Arc<dyn Backend>,
) -> Result<RunReport, EngineError> {
    let graph = TaskGraph::build(pipeline, resources)?;
    let mut engine = Engine::new(graph, backend);
    engine.set_concurrency_cap(concurrency_cap);
    engine.run()
}

/// Creates parent directories for a task's outputs before dispatch.
fn ensure_output_dirs(task: &Task) -> Result<(), EngineError> {
    for output in &task.outputs {
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| EngineError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
                debug!("Created directory: {}", parent.display());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResourceConfig, ResourceProfile};
    use crate::execution::local::LocalBackend;
    use crate::workflow::rule::{Pipeline, Rule};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn resources_for(names: &[&str]) -> ResourceConfig {
        let mut config = ResourceConfig::new();
        for name in names {
            config.insert(*name, ResourceProfile::new(1, 1, 60));
        }
        config
    }

    /// Stub backend with a simulated runtime, per-command verdicts via
    /// marker substrings, and a high-water mark of concurrent jobs.
    struct StubBackend {
        delay: Duration,
        current: AtomicUsize,
        high_water: AtomicUsize,
        submitted: Mutex<Vec<String>>,
    }

    struct StubJob {
        command: String,
        canceled: AtomicBool,
    }

    impl JobHandle for StubJob {
        fn describe(&self) -> String {
            format!("stub({})", self.command)
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    impl StubBackend {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                current: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
                submitted: Mutex::new(Vec::new()),
            }
        }

        fn high_water(&self) -> usize {
            self.high_water.load(Ordering::SeqCst)
        }

        fn submitted(&self) -> Vec<String> {
            self.submitted.lock().unwrap().clone()
        }
    }

    impl Backend for StubBackend {
        fn submit(
            &self,
            command: &str,
            _resources: &ResourceProfile,
        ) -> Result<Arc<dyn JobHandle>, EngineError> {
            self.submitted.lock().unwrap().push(command.to_string());
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.high_water.fetch_max(now, Ordering::SeqCst);
            Ok(Arc::new(StubJob {
                command: command.to_string(),
                canceled: AtomicBool::new(false),
            }))
        }

        fn wait(&self, handle: &dyn JobHandle) -> Result<ExitStatus, EngineError> {
            let job = handle.as_any().downcast_ref::<StubJob>().unwrap();
            let deadline = std::time::Instant::now() + self.delay;
            while std::time::Instant::now() < deadline {
                if job.canceled.load(Ordering::SeqCst) {
                    self.current.fetch_sub(1, Ordering::SeqCst);
                    return Ok(ExitStatus::Canceled);
                }
                thread::sleep(Duration::from_millis(10));
            }
            self.current.fetch_sub(1, Ordering::SeqCst);

            if job.command.contains("__infra__") {
                return Err(EngineError::Infrastructure("backend lost".to_string()));
            }
            if job.command.contains("__fail__") {
                return Ok(ExitStatus::Code(1));
            }
            Ok(ExitStatus::Success)
        }

        fn cancel(&self, handle: &dyn JobHandle) -> Result<(), EngineError> {
            let job = handle.as_any().downcast_ref::<StubJob>().unwrap();
            job.canceled.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// n pre-existing inputs fanned out through one rule running the
    /// given command template.
    fn fan_out_pipeline(dir: &Path, n: usize, command: &str) -> (Pipeline, ResourceConfig) {
        let mut files = Vec::new();
        for i in 0..n {
            let path = dir.join(format!("sample{}.fastq", i));
            fs::write(&path, "reads").unwrap();
            files.push(path);
        }

        let mut pipeline = Pipeline::new();
        pipeline.add_rule(Rule::originate("fastqs", files)).unwrap();
        pipeline
            .add_rule(
                Rule::transform("process", "fastqs", command)
                    .with_pattern(r".*/(?P<sample>sample[0-9]+)\.fastq")
                    .with_output(format!("{}/{{sample[0]}}.out", dir.display())),
            )
            .unwrap();
        (pipeline, resources_for(&["process"]))
    }

    #[test]
    fn test_linear_chain_completes_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "data").unwrap();

        let mut pipeline = Pipeline::new();
        pipeline
            .add_rule(Rule::originate("inputs", vec![input]))
            .unwrap();
        pipeline
            .add_rule(
                Rule::transform("copy", "inputs", "cp {input} {output}")
                    .with_suffix(".txt")
                    .with_output(".copy"),
            )
            .unwrap();
        pipeline
            .add_rule(
                Rule::transform("finish", "copy", "cp {input} {output}")
                    .with_suffix(".copy")
                    .with_output(".final"),
            )
            .unwrap();
        let resources = resources_for(&["copy", "finish"]);

        let graph = TaskGraph::build(&pipeline, &resources).unwrap();
        let engine = Engine::new(graph, Arc::new(LocalBackend::new()));
        let report = engine.run().unwrap();

        assert!(report.success());
        assert_eq!(report.completed.len(), 2);
        assert!(dir.path().join("in.final").exists());

        // Second run over the unchanged tree must dispatch nothing.
        let graph = TaskGraph::build(&pipeline, &resources).unwrap();
        let stub = Arc::new(StubBackend::new(Duration::from_millis(1)));
        let engine = Engine::new(graph, Arc::clone(&stub) as Arc<dyn Backend>);
        let report = engine.run().unwrap();

        assert!(report.success());
        assert!(report.completed.is_empty());
        assert_eq!(report.skipped.len(), 3);
        assert!(stub.submitted().is_empty());
    }

    #[test]
    fn test_failure_isolation_between_chains() {
        let dir = tempdir().unwrap();
        let a_in = dir.path().join("a.txt");
        let b_in = dir.path().join("b.txt");
        fs::write(&a_in, "a").unwrap();
        fs::write(&b_in, "b").unwrap();

        let mut pipeline = Pipeline::new();
        pipeline
            .add_rule(Rule::originate("a_input", vec![a_in]))
            .unwrap();
        pipeline
            .add_rule(
                Rule::transform("a1", "a_input", "exit 1")
                    .with_suffix(".txt")
                    .with_output(".a1"),
            )
            .unwrap();
        pipeline
            .add_rule(
                Rule::transform("a2", "a1", "cp {input} {output}")
                    .with_suffix(".a1")
                    .with_output(".a2"),
            )
            .unwrap();
        pipeline
            .add_rule(Rule::originate("b_input", vec![b_in]))
            .unwrap();
        pipeline
            .add_rule(
                Rule::transform("b1", "b_input", "cp {input} {output}")
                    .with_suffix(".txt")
                    .with_output(".b1"),
            )
            .unwrap();
        pipeline
            .add_rule(
                Rule::transform("b2", "b1", "cp {input} {output}")
                    .with_suffix(".b1")
                    .with_output(".b2"),
            )
            .unwrap();

        let resources = resources_for(&["a1", "a2", "b1", "b2"]);
        let graph = TaskGraph::build(&pipeline, &resources).unwrap();
        let engine = Engine::new(graph, Arc::new(LocalBackend::new()));
        let report = engine.run().unwrap();

        assert!(!report.success());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.blocked.len(), 1);
        assert!(report.failed.iter().next().unwrap().starts_with("a1("));
        assert!(report.blocked.iter().next().unwrap().starts_with("a2("));
        // The independent chain ran to completion.
        assert!(dir.path().join("b.b2").exists());
        assert_eq!(report.completed.len(), 2);
    }

    #[test]
    fn test_concurrency_cap_is_never_exceeded() {
        let dir = tempdir().unwrap();
        let (pipeline, resources) = fan_out_pipeline(dir.path(), 5, "work {input}");

        let graph = TaskGraph::build(&pipeline, &resources).unwrap();
        let stub = Arc::new(StubBackend::new(Duration::from_millis(100)));
        let mut engine = Engine::new(graph, Arc::clone(&stub) as Arc<dyn Backend>);
        engine.set_concurrency_cap(2);

        let report = engine.run().unwrap();

        assert!(report.success());
        assert_eq!(report.completed.len(), 5);
        assert!(stub.high_water() <= 2, "high water {}", stub.high_water());
    }

    #[test]
    fn test_stop_cancels_running_and_blocks_rest() {
        let dir = tempdir().unwrap();
        let (pipeline, resources) = fan_out_pipeline(dir.path(), 5, "work {input}");

        let graph = TaskGraph::build(&pipeline, &resources).unwrap();
        let stub = Arc::new(StubBackend::new(Duration::from_secs(10)));
        let mut engine = Engine::new(graph, Arc::clone(&stub) as Arc<dyn Backend>);
        engine.set_concurrency_cap(2);

        let stop = engine.stop_handle();
        let runner = thread::spawn(move || engine.run());

        thread::sleep(Duration::from_millis(300));
        stop.store(true, Ordering::SeqCst);

        let report = runner.join().unwrap().unwrap();

        // The two running tasks were canceled; the other three never
        // reached the backend.
        assert_eq!(stub.submitted().len(), 2);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.blocked.len(), 3);
        assert!(report.completed.is_empty());
    }

    #[test]
    fn test_infrastructure_error_aborts_run() {
        let dir = tempdir().unwrap();
        let (pipeline, resources) = fan_out_pipeline(dir.path(), 3, "work __infra__ {input}");

        let graph = TaskGraph::build(&pipeline, &resources).unwrap();
        let stub = Arc::new(StubBackend::new(Duration::from_millis(50)));
        let mut engine = Engine::new(graph, Arc::clone(&stub) as Arc<dyn Backend>);
        engine.set_concurrency_cap(1);

        let result = engine.run();
        assert!(matches!(result, Err(EngineError::Infrastructure(_))));
    }

    #[test]
    fn test_dependent_never_runs_before_predecessor_done() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "data").unwrap();

        let mut pipeline = Pipeline::new();
        pipeline
            .add_rule(Rule::originate("inputs", vec![input]))
            .unwrap();
        pipeline
            .add_rule(
                Rule::transform("first", "inputs", "first {input} {output}")
                    .with_suffix(".txt")
                    .with_output(".mid"),
            )
            .unwrap();
        pipeline
            .add_rule(
                Rule::transform("second", "first", "second {input} {output}")
                    .with_suffix(".mid")
                    .with_output(".end"),
            )
            .unwrap();

        let resources = resources_for(&["first", "second"]);
        let graph = TaskGraph::build(&pipeline, &resources).unwrap();
        let stub = Arc::new(StubBackend::new(Duration::from_millis(50)));
        let engine = Engine::new(graph, Arc::clone(&stub) as Arc<dyn Backend>);

        let report = engine.run().unwrap();
        assert!(report.success());

        let submitted = stub.submitted();
        assert_eq!(submitted.len(), 2);
        assert!(submitted[0].starts_with("first"));
        assert!(submitted[1].starts_with("second"));
    }

    #[test]
    fn test_run_pipeline_convenience() {
        let dir = tempdir().unwrap();
        let (pipeline, resources) = fan_out_pipeline(dir.path(), 2, "work {input}");
        let stub = Arc::new(StubBackend::new(Duration::from_millis(10)));

        let report =
            run_pipeline(&pipeline, &resources, 2, Arc::clone(&stub) as Arc<dyn Backend>)
                .unwrap();

        assert!(report.success());
        assert_eq!(report.completed.len(), 2);
        assert_eq!(report.skipped.len(), 1); // the anchor
    }

    #[test]
    fn test_report_success_definition() {
        let report = RunReport {
            completed: BTreeSet::new(),
            skipped: BTreeSet::new(),
            failed: BTreeSet::new(),
            blocked: BTreeSet::new(),
            started: Utc::now(),
            finished: Utc::now(),
        };
        assert!(report.success());

        let mut failed = report.clone();
        failed.failed.insert("x".to_string());
        assert!(!failed.success());

        let mut blocked = report.clone();
        blocked.blocked.insert("y".to_string());
        assert!(!blocked.success());
    }
}
