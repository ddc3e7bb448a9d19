//! Pattern Matching and Template Substitution
//!
//! The fan-out mechanism of the engine: a rule's filter pattern is a
//! regular expression with named capture groups. Every candidate file that
//! matches yields one independent set of bindings, and each binding set
//! materializes one task instance.
//!
//! Templates reference captured groups with `{group[0]}` placeholders:
//!
//! ```text
//! pattern:  .+/(?P<sample>[a-zA-Z0-9-]+)_R1.fastq
//! template: alignments/{sample[0]}/{sample[0]}.bam
//! ```
//!
//! Two groups are always bound implicitly: `path` (the candidate's parent
//! directory) and `basename` (its file stem).

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::EngineError;

/// Matches `{name[index]}` placeholders in output/input/extra templates.
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\[(\d+)\]\}").unwrap());

/// Capture-group bindings produced by matching one candidate path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    groups: HashMap<String, String>,
}

impl Bindings {
    /// Creates an empty binding set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the captured value for a group, if bound.
    pub fn get(&self, group: &str) -> Option<&str> {
        self.groups.get(group).map(|s| s.as_str())
    }

    /// Binds a group to a value, replacing any previous binding.
    pub fn insert(&mut self, group: impl Into<String>, value: impl Into<String>) {
        self.groups.insert(group.into(), value.into());
    }

    /// Returns true if no groups are bound.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Compiles a rule's filter pattern.
///
/// An invalid expression is a configuration error: it is reported before
/// the graph is built, never mid-run.
pub fn compile_pattern(pattern: &str) -> Result<Regex, EngineError> {
    Regex::new(pattern)
        .map_err(|e| EngineError::Configuration(format!("invalid pattern '{}': {}", pattern, e)))
}

/// Matches a candidate path against a compiled pattern.
///
/// Returns the bindings for every named group on success, or `None` when
/// the path does not match. The implicit `path` and `basename` groups are
/// bound from the candidate itself.
pub fn match_path(regex: &Regex, candidate: &Path) -> Option<Bindings> {
    let text = candidate.to_string_lossy();
    let caps = regex.captures(&text)?;

    let mut bindings = Bindings::new();

    bindings.insert(
        "path",
        candidate
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );
    bindings.insert(
        "basename",
        candidate
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );

    for name in regex.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            bindings.insert(name, m.as_str());
        }
    }

    Some(bindings)
}

/// Renders a `{group[0]}` template against a binding set.
///
/// Only index 0 is meaningful: each task instance carries exactly one
/// binding set. A placeholder naming an unbound group, or using a
/// non-zero index, fails with a template error.
pub fn render(template: &str, bindings: &Bindings) -> Result<String, EngineError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let whole = caps.get(0).unwrap();
        let group = &caps[1];
        let index = &caps[2];

        out.push_str(&template[last..whole.start()]);

        if index != "0" {
            return Err(EngineError::Template {
                template: template.to_string(),
                group: format!("{}[{}]", group, index),
            });
        }

        let value = bindings.get(group).ok_or_else(|| EngineError::Template {
            template: template.to_string(),
            group: group.to_string(),
        })?;

        out.push_str(value);
        last = whole.end();
    }

    out.push_str(&template[last..]);
    Ok(out)
}

/// Returns true if a template contains any `{group[index]}` placeholder.
pub fn has_placeholders(template: &str) -> bool {
    PLACEHOLDER.is_match(template)
}
