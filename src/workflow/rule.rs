//! Declarative Rule Model
//!
//! A pipeline is an ordered list of rules. Each rule is a template for
//! zero or more task instances:
//!
//! - an *origination* rule anchors pre-existing files (the raw FASTQ
//!   inputs of a sequencing run, for example) and performs no work
//! - a *transform* rule consumes the outputs of a previously declared
//!   rule, selected by a pattern or suffix filter, and renders its own
//!   outputs, extra inputs, and payload command from the captured groups
//!
//! Later rules may reference earlier ones by name only; the graph builder
//! rejects forward references.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Where a rule draws its inputs from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum InputSelector {
    /// A fixed set of pre-existing files (origination).
    Paths(Vec<PathBuf>),
    /// The outputs produced by a previously declared rule.
    OutputFrom(String),
}

/// How a rule selects and decomposes candidate inputs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    /// Named-capture regular expression; one task per matching candidate.
    Pattern {
        pattern: String,
        /// When true, candidates the pattern does not match are passed
        /// over silently instead of failing the build.
        #[serde(default)]
        allow_unmatched: bool,
    },
    /// One-to-one rename: strip a suffix, append the rule's output suffix.
    Suffix { strip: String },
}

/// A declarative stage template.
///
/// # Example
///
/// ```
/// use ruleflow::workflow::Rule;
///
/// let rule = Rule::transform("sort_bam", "align_bwa", "picard SortSam INPUT={input} OUTPUT={output}")
///     .with_suffix(".bam")
///     .with_output(".sort.bam");
/// ```
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Rule {
    /// Unique rule name; also the key for resource-profile lookup.
    pub name: String,

    /// Input selector (fixed file set or a predecessor rule's outputs).
    pub input: InputSelector,

    /// Optional pattern/suffix filter over candidate inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,

    /// Templates for extra non-edge inputs (mate reads, reference files).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_inputs: Vec<String>,

    /// Output template. For a `Suffix` filter this is the replacement
    /// suffix; otherwise a `{group[0]}` path template.
    #[serde(default)]
    pub output: String,

    /// Scalar parameter templates passed through to the payload.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,

    /// Ordering-only predecessors beyond the input reference.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub follows: Vec<String>,

    /// Payload command template; absent for origination rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl Rule {
    /// Creates an origination rule anchoring a fixed set of files.
    pub fn originate(name: impl Into<String>, files: Vec<PathBuf>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            input: InputSelector::Paths(files),
            filter: None,
            add_inputs: Vec::new(),
            output: String::new(),
            extras: Vec::new(),
            follows: Vec::new(),
            command: None,
        }
    }

    /// Creates a transform rule over a predecessor rule's outputs.
    pub fn transform(
        name: impl Into<String>,
        input_from: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into().trim().to_string(),
            input: InputSelector::OutputFrom(input_from.into()),
            filter: None,
            add_inputs: Vec::new(),
            output: String::new(),
            extras: Vec::new(),
            follows: Vec::new(),
            command: Some(command.into()),
        }
    }

    /// Sets a named-capture pattern filter.
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.filter = Some(Filter::Pattern {
            pattern: pattern.into(),
            allow_unmatched: false,
        });
        self
    }

    /// Allows candidates the pattern does not match to be passed over.
    pub fn allow_unmatched(mut self) -> Self {
        if let Some(Filter::Pattern {
            ref mut allow_unmatched,
            ..
        }) = self.filter
        {
            *allow_unmatched = true;
        }
        self
    }

    /// Sets a suffix filter (one-to-one rename).
    pub fn with_suffix(mut self, strip: impl Into<String>) -> Self {
        self.filter = Some(Filter::Suffix {
            strip: strip.into(),
        });
        self
    }

    /// Sets the output template (or replacement suffix).
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    /// Adds an extra-input template rendered from the binding set.
    pub fn with_add_input(mut self, template: impl Into<String>) -> Self {
        self.add_inputs.push(template.into());
        self
    }

    /// Adds a scalar extra-parameter template.
    pub fn with_extra(mut self, template: impl Into<String>) -> Self {
        self.extras.push(template.into());
        self
    }

    /// Adds an ordering-only predecessor rule.
    pub fn after(mut self, rule_name: impl Into<String>) -> Self {
        self.follows.push(rule_name.into());
        self
    }

    /// True if this rule anchors pre-existing files.
    pub fn is_origination(&self) -> bool {
        matches!(self.input, InputSelector::Paths(_))
    }
}

/// An ordered pipeline of rules.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Pipeline {
    /// Rules in declaration order.
    pub rules: Vec<Rule>,
}

impl Pipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule, rejecting duplicate names.
    pub fn add_rule(&mut self, rule: Rule) -> Result<(), EngineError> {
        if self.rules.iter().any(|r| r.name == rule.name) {
            return Err(EngineError::Configuration(format!(
                "rule '{}' declared twice",
                rule.name
            )));
        }
        self.rules.push(rule);
        Ok(())
    }

    /// Loads a pipeline declaration from a YAML file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parses a pipeline declaration from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        let rules: Vec<Rule> = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Configuration(format!("invalid pipeline: {}", e)))?;
        let mut pipeline = Self::new();
        for rule in rules {
            pipeline.add_rule(rule)?;
        }
        Ok(pipeline)
    }

    /// Gets a rule by name.
    pub fn get_rule(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Returns the number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if the pipeline has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_originate_rule() {
        let rule = Rule::originate(
            "original_fastqs",
            vec![PathBuf::from("reads/s1_R1.fastq")],
        );

        assert!(rule.is_origination());
        assert!(rule.command.is_none());
        assert_eq!(rule.name, "original_fastqs");
    }

    #[test]
    fn test_transform_rule_builder() {
        let rule = Rule::transform("sort_bam", "align_bwa", "picard SortSam INPUT={input}")
            .with_suffix(".bam")
            .with_output(".sort.bam")
            .after("index_bam");

        assert!(!rule.is_origination());
        assert_eq!(rule.input, InputSelector::OutputFrom("align_bwa".to_string()));
        assert_eq!(rule.filter, Some(Filter::Suffix { strip: ".bam".to_string() }));
        assert_eq!(rule.output, ".sort.bam");
        assert_eq!(rule.follows, vec!["index_bam"]);
    }

    #[test]
    fn test_pattern_filter_allow_unmatched() {
        let strict = Rule::transform("a", "b", "cmd").with_pattern(r"(?P<s>\w+)\.bam");
        let lax = Rule::transform("a", "b", "cmd")
            .with_pattern(r"(?P<s>\w+)\.bam")
            .allow_unmatched();

        match strict.filter.unwrap() {
            Filter::Pattern { allow_unmatched, .. } => assert!(!allow_unmatched),
            _ => panic!("expected pattern filter"),
        }
        match lax.filter.unwrap() {
            Filter::Pattern { allow_unmatched, .. } => assert!(allow_unmatched),
            _ => panic!("expected pattern filter"),
        }
    }

    #[test]
    fn test_pipeline_rejects_duplicate_names() {
        let mut pipeline = Pipeline::new();
        let rule = Rule::originate("fastqs", vec![]);

        assert!(pipeline.add_rule(rule.clone()).is_ok());
        assert!(pipeline.add_rule(rule).is_err());
        assert_eq!(pipeline.len(), 1);
    }

    #[test]
    fn test_pipeline_get_rule() {
        let mut pipeline = Pipeline::new();
        pipeline
            .add_rule(Rule::originate("fastqs", vec![]))
            .unwrap();

        assert!(pipeline.get_rule("fastqs").is_some());
        assert!(pipeline.get_rule("missing").is_none());
    }

    #[test]
    fn test_rule_yaml_roundtrip() {
        let rule = Rule::transform("align_bwa", "original_fastqs", "bwa mem {input} > {output}")
            .with_pattern(r".+/(?P<sample>[a-zA-Z0-9-]+)_R1\.fastq")
            .with_add_input("{path[0]}/{sample[0]}_R2.fastq")
            .with_extra("{sample[0]}")
            .with_output("alignments/{sample[0]}.bam");

        let yaml = serde_yaml::to_string(&rule).unwrap();
        let parsed: Rule = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(parsed.name, "align_bwa");
        assert_eq!(parsed.add_inputs.len(), 1);
        assert_eq!(parsed.extras, vec!["{sample[0]}"]);
    }

    #[test]
    fn test_pipeline_from_yaml() {
        let yaml = r#"
- name: fastqs
  input:
    paths: ["reads/s1.fastq"]
- name: trim
  input:
    output_from: fastqs
  filter:
    suffix:
      strip: ".fastq"
  output: ".trimmed.fastq"
  command: "trim {input} > {output}"
"#;
        let pipeline = Pipeline::from_yaml(yaml).unwrap();

        assert_eq!(pipeline.len(), 2);
        assert!(pipeline.get_rule("fastqs").unwrap().is_origination());
        assert_eq!(
            pipeline.get_rule("trim").unwrap().filter,
            Some(Filter::Suffix { strip: ".fastq".to_string() })
        );
    }

    #[test]
    fn test_pipeline_from_yaml_rejects_duplicates() {
        let yaml = r#"
- name: fastqs
  input:
    paths: []
- name: fastqs
  input:
    paths: []
"#;
        assert!(Pipeline::from_yaml(yaml).is_err());
    }
}
