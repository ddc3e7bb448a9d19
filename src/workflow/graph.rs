//! Task Graph Construction
//!
//! Expands an ordered list of declarative rules into a concrete DAG of
//! task instances. Rules are processed in declaration order and may only
//! reference rules declared before them, so the result is acyclic by
//! construction; a final validation pass asserts it anyway.
//!
//! Expansion per rule:
//!
//! - origination: one anchor task holding the pre-existing file set
//! - pattern filter: one task per matching predecessor output (fan-out)
//! - suffix filter: one task per predecessor task (one-to-one rename)
//! - no filter: one task joining every predecessor output (many-to-one)
//!
//! The graph's topology is immutable after build; only task statuses
//! change during a run.

use std::collections::HashMap;
use std::path::PathBuf;

use log::{debug, info};

use crate::config::{ResourceConfig, ResourceProfile};
use crate::error::EngineError;
use crate::workflow::pattern::{self, Bindings};
use crate::workflow::rule::{Filter, InputSelector, Pipeline, Rule};

/// Index of a task within its graph.
pub type TaskId = usize;

/// One concrete, parameter-bound unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    /// Position in the graph; edges always point to lower ids.
    pub id: TaskId,

    /// Owning rule name.
    pub rule: String,

    /// Human-readable identifier used in logs and the run report.
    pub label: String,

    /// Primary inputs (graph-edge inputs).
    pub inputs: Vec<PathBuf>,

    /// Extra inputs resolved from `add_inputs` templates; not edges.
    pub extra_inputs: Vec<PathBuf>,

    /// Declared outputs.
    pub outputs: Vec<PathBuf>,

    /// Resolved scalar extras passed to the payload.
    pub extras: Vec<String>,

    /// Concrete payload command; `None` for origination anchors.
    pub command: Option<String>,

    /// Resource request; `None` for origination anchors.
    pub resources: Option<ResourceProfile>,

    /// Predecessor task ids (input producers plus `follows` edges).
    pub predecessors: Vec<TaskId>,

    /// True if this task anchors pre-existing files.
    pub origin: bool,
}

impl Task {
    /// All paths whose modification times gate this task's staleness.
    pub fn all_inputs(&self) -> impl Iterator<Item = &PathBuf> {
        self.inputs.iter().chain(self.extra_inputs.iter())
    }
}

/// The immutable DAG of task instances for one run.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    dependents: Vec<Vec<TaskId>>,
}

impl TaskGraph {
    /// Builds the task graph for a pipeline.
    ///
    /// A single forward pass over the rules; every expanded rule's tasks
    /// are recorded under its name so later rules can reference them.
    pub fn build(pipeline: &Pipeline, resources: &ResourceConfig) -> Result<Self, EngineError> {
        if pipeline.is_empty() {
            return Err(EngineError::Graph("pipeline has no rules".to_string()));
        }

        let mut builder = GraphBuilder {
            tasks: Vec::new(),
            tasks_by_rule: HashMap::new(),
            producers: HashMap::new(),
        };

        for rule in &pipeline.rules {
            builder.expand_rule(rule, resources)?;
        }

        let mut dependents = vec![Vec::new(); builder.tasks.len()];
        for task in &builder.tasks {
            for &pred in &task.predecessors {
                // Acyclicity holds because rules only reference earlier
                // rules; a forward edge here is a builder bug.
                if pred >= task.id {
                    return Err(EngineError::Graph(format!(
                        "edge from task {} to non-earlier task {}",
                        task.id, pred
                    )));
                }
                dependents[pred].push(task.id);
            }
        }

        info!(
            "Built task graph: {} tasks from {} rules",
            builder.tasks.len(),
            pipeline.len()
        );

        Ok(Self {
            tasks: builder.tasks,
            dependents,
        })
    }

    /// All tasks in id order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// One task by id.
    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id]
    }

    /// Tasks that list `id` among their predecessors.
    pub fn dependents(&self, id: TaskId) -> &[TaskId] {
        &self.dependents[id]
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True if the graph holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks belonging to a rule.
    pub fn tasks_of_rule<'a>(&'a self, rule: &'a str) -> impl Iterator<Item = &'a Task> {
        self.tasks.iter().filter(move |t| t.rule == rule)
    }
}

struct GraphBuilder {
    tasks: Vec<Task>,
    tasks_by_rule: HashMap<String, Vec<TaskId>>,
    /// Output path -> producing task, for collision checks and for
    /// deciding whether an extra input must pre-exist.
    producers: HashMap<PathBuf, TaskId>,
}

impl GraphBuilder {
    fn expand_rule(&mut self, rule: &Rule, resources: &ResourceConfig) -> Result<(), EngineError> {
        let follows = self.resolve_follows(rule)?;

        match &rule.input {
            InputSelector::Paths(files) => self.expand_origination(rule, files, follows),
            InputSelector::OutputFrom(pred_rule) => {
                let profile = resources.get(&rule.name)?.clone();
                let candidates = self.predecessor_outputs(rule, pred_rule)?;

                match &rule.filter {
                    Some(Filter::Pattern {
                        pattern,
                        allow_unmatched,
                    }) => self.expand_pattern(
                        rule,
                        &candidates,
                        pattern,
                        *allow_unmatched,
                        &profile,
                        &follows,
                    ),
                    Some(Filter::Suffix { strip }) => {
                        self.expand_suffix(rule, &candidates, strip, &profile, &follows)
                    }
                    None => self.expand_join(rule, &candidates, &profile, &follows),
                }
            }
        }
    }

    /// Resolves `follows` names to every task of each followed rule.
    fn resolve_follows(&self, rule: &Rule) -> Result<Vec<TaskId>, EngineError> {
        let mut ids = Vec::new();
        for name in &rule.follows {
            let tasks = self.tasks_by_rule.get(name).ok_or_else(|| {
                EngineError::Graph(format!(
                    "rule '{}' follows '{}', which is not declared before it",
                    rule.name, name
                ))
            })?;
            ids.extend(tasks.iter().copied());
        }
        Ok(ids)
    }

    /// Enumerates (producer task, output path) pairs of a predecessor rule.
    fn predecessor_outputs(
        &self,
        rule: &Rule,
        pred_rule: &str,
    ) -> Result<Vec<(TaskId, PathBuf)>, EngineError> {
        let pred_tasks = self.tasks_by_rule.get(pred_rule).ok_or_else(|| {
            EngineError::Graph(format!(
                "rule '{}' takes input from '{}', which is not declared before it",
                rule.name, pred_rule
            ))
        })?;

        let mut candidates = Vec::new();
        for &id in pred_tasks {
            for output in &self.tasks[id].outputs {
                candidates.push((id, output.clone()));
            }
        }
        Ok(candidates)
    }

    fn expand_origination(
        &mut self,
        rule: &Rule,
        files: &[PathBuf],
        follows: Vec<TaskId>,
    ) -> Result<(), EngineError> {
        if rule.command.is_some() {
            return Err(EngineError::Graph(format!(
                "origination rule '{}' must not carry a command",
                rule.name
            )));
        }

        // The anchor performs no work; its files double as outputs so
        // downstream rules can enumerate and timestamp them.
        let task = Task {
            id: self.tasks.len(),
            rule: rule.name.clone(),
            label: rule.name.clone(),
            inputs: Vec::new(),
            extra_inputs: Vec::new(),
            outputs: files.to_vec(),
            extras: Vec::new(),
            command: None,
            resources: None,
            predecessors: follows,
            origin: true,
        };

        debug!("Rule '{}': origination anchor with {} files", rule.name, files.len());
        self.push_task(rule, task)
    }

    fn expand_pattern(
        &mut self,
        rule: &Rule,
        candidates: &[(TaskId, PathBuf)],
        pattern: &str,
        allow_unmatched: bool,
        profile: &ResourceProfile,
        follows: &[TaskId],
    ) -> Result<(), EngineError> {
        let regex = pattern::compile_pattern(pattern)?;
        let mut created = 0;

        for (producer, path) in candidates {
            let Some(bindings) = pattern::match_path(&regex, path) else {
                if allow_unmatched {
                    debug!("Rule '{}': '{}' does not match, passing over", rule.name, path.display());
                    continue;
                }
                return Err(EngineError::Graph(format!(
                    "rule '{}': input '{}' does not match pattern '{}'",
                    rule.name,
                    path.display(),
                    pattern
                )));
            };

            let output = PathBuf::from(pattern::render(&rule.output, &bindings)?);
            self.create_task(rule, vec![(*producer, path.clone())], output, &bindings, profile, follows)?;
            created += 1;
        }

        if created == 0 {
            return Err(EngineError::Graph(format!(
                "rule '{}': pattern '{}' matched none of {} candidate inputs",
                rule.name,
                pattern,
                candidates.len()
            )));
        }

        debug!("Rule '{}': pattern fan-out into {} tasks", rule.name, created);
        Ok(())
    }

    fn expand_suffix(
        &mut self,
        rule: &Rule,
        candidates: &[(TaskId, PathBuf)],
        strip: &str,
        profile: &ResourceProfile,
        follows: &[TaskId],
    ) -> Result<(), EngineError> {
        if candidates.is_empty() {
            return Err(EngineError::Graph(format!(
                "rule '{}': predecessor produced no outputs to rename",
                rule.name
            )));
        }

        for (producer, path) in candidates {
            let text = path.to_string_lossy();
            let Some(stem) = text.strip_suffix(strip) else {
                return Err(EngineError::Graph(format!(
                    "rule '{}': input '{}' does not end with suffix '{}'",
                    rule.name,
                    path.display(),
                    strip
                )));
            };

            let output = PathBuf::from(format!("{}{}", stem, rule.output));
            let bindings = Bindings::new();
            self.create_task(rule, vec![(*producer, path.clone())], output, &bindings, profile, follows)?;
        }

        Ok(())
    }

    /// Many-to-one join: one task consuming every predecessor output.
    fn expand_join(
        &mut self,
        rule: &Rule,
        candidates: &[(TaskId, PathBuf)],
        profile: &ResourceProfile,
        follows: &[TaskId],
    ) -> Result<(), EngineError> {
        if candidates.is_empty() {
            return Err(EngineError::Graph(format!(
                "rule '{}': predecessor produced no outputs to join",
                rule.name
            )));
        }

        let bindings = Bindings::new();
        let output = PathBuf::from(pattern::render(&rule.output, &bindings)?);

        let inputs: Vec<(TaskId, PathBuf)> = candidates.to_vec();
        self.create_task(rule, inputs, output, &bindings, profile, follows)?;

        debug!("Rule '{}': joined {} inputs into one task", rule.name, candidates.len());
        Ok(())
    }

    /// Materializes one task instance and registers its outputs.
    fn create_task(
        &mut self,
        rule: &Rule,
        edge_inputs: Vec<(TaskId, PathBuf)>,
        output: PathBuf,
        bindings: &Bindings,
        profile: &ResourceProfile,
        follows: &[TaskId],
    ) -> Result<(), EngineError> {
        let mut extra_inputs = Vec::new();
        for template in &rule.add_inputs {
            let path = PathBuf::from(pattern::render(template, bindings)?);
            // Extra inputs are not edges; if nothing in the graph makes
            // them, they must already be on disk.
            if !self.producers.contains_key(&path) && !path.exists() {
                return Err(EngineError::Graph(format!(
                    "rule '{}': additional input '{}' does not exist and no task produces it",
                    rule.name,
                    path.display()
                )));
            }
            extra_inputs.push(path);
        }

        let mut extras = Vec::new();
        for template in &rule.extras {
            extras.push(pattern::render(template, bindings)?);
        }

        let mut predecessors: Vec<TaskId> = edge_inputs.iter().map(|(p, _)| *p).collect();
        predecessors.extend_from_slice(follows);
        predecessors.sort_unstable();
        predecessors.dedup();

        let inputs: Vec<PathBuf> = edge_inputs.into_iter().map(|(_, p)| p).collect();

        let command = match &rule.command {
            Some(template) => Some(render_command(
                template,
                bindings,
                &inputs,
                &extra_inputs,
                std::slice::from_ref(&output),
                &extras,
            )?),
            None => {
                return Err(EngineError::Graph(format!(
                    "rule '{}' produces work but has no command",
                    rule.name
                )))
            }
        };

        let id = self.tasks.len();
        let task = Task {
            id,
            rule: rule.name.clone(),
            label: format!("{}({})", rule.name, output.display()),
            inputs,
            extra_inputs,
            outputs: vec![output],
            extras,
            command,
            resources: Some(profile.clone()),
            predecessors,
            origin: false,
        };

        self.push_task(rule, task)
    }

    fn push_task(&mut self, rule: &Rule, task: Task) -> Result<(), EngineError> {
        for output in &task.outputs {
            if let Some(&other) = self.producers.get(output) {
                // Two tasks writing the same file would race; reject at
                // build time rather than letting mtimes decide a winner.
                return Err(EngineError::Graph(format!(
                    "output '{}' is produced by both '{}' and '{}'",
                    output.display(),
                    self.tasks[other].label,
                    task.label
                )));
            }
            self.producers.insert(output.clone(), task.id);
        }

        self.tasks_by_rule
            .entry(rule.name.clone())
            .or_default()
            .push(task.id);
        self.tasks.push(task);
        Ok(())
    }
}

/// Substitutes engine placeholders and capture groups in a payload
/// command template.
///
/// `{input}`/`{inputs}` expand to the primary inputs followed by any
/// extra inputs, space-separated, matching how a stage receives its
/// argument tuple. `{output}`/`{outputs}` and `{extras}` behave alike.
fn render_command(
    template: &str,
    bindings: &Bindings,
    inputs: &[PathBuf],
    extra_inputs: &[PathBuf],
    outputs: &[PathBuf],
    extras: &[String],
) -> Result<String, EngineError> {
    let rendered = pattern::render(template, bindings)?;

    let all_inputs: Vec<String> = inputs
        .iter()
        .chain(extra_inputs.iter())
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    let all_outputs: Vec<String> = outputs
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();

    let inputs_str = all_inputs.join(" ");
    let outputs_str = all_outputs.join(" ");

    Ok(rendered
        .replace("{inputs}", &inputs_str)
        .replace("{input}", &inputs_str)
        .replace("{outputs}", &outputs_str)
        .replace("{output}", &outputs_str)
        .replace("{extras}", &extras.join(" ")))
}
