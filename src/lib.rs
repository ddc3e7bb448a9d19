//! RuleFlow - Declarative Workflow Execution Engine
//!
//! A make-style pipeline runner for file-transforming workloads:
//! declare rules that pattern-match their inputs, let the engine expand
//! them into a task graph, and only the tasks whose outputs are missing
//! or stale are executed, locally or on a batch cluster.
//!
//! # Architecture
//!
//! The library is organized into two main modules:
//!
//! - [`workflow`]: Rule declarations, pattern matching, graph building,
//!   and staleness evaluation
//! - [`execution`]: The scheduling engine and its pluggable backends
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ruleflow::workflow::{Pipeline, Rule, TaskGraph};
//! use ruleflow::execution::{Engine, LocalBackend};
//! use ruleflow::config::ResourceConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut pipeline = Pipeline::new();
//!     pipeline.add_rule(Rule::originate("fastqs", vec!["reads/s1_R1.fastq".into()]))?;
//!     pipeline.add_rule(
//!         Rule::transform("align_bwa", "fastqs", "bwa mem ref.fa {inputs} > {output}")
//!             .with_pattern(r".*/(?P<sample>[A-Za-z0-9]+)_R1\.fastq")
//!             .with_add_input("{path[0]}/{sample[0]}_R2.fastq")
//!             .with_output("bam/{sample[0]}.bam"),
//!     )?;
//!
//!     let resources = ResourceConfig::load("resources.yaml")?;
//!     let graph = TaskGraph::build(&pipeline, &resources)?;
//!
//!     let mut engine = Engine::new(graph, Arc::new(LocalBackend::new()));
//!     engine.set_concurrency_cap(4);
//!     let report = engine.run()?;
//!     assert!(report.success());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod workflow;

// Re-export commonly used types
pub use config::{ResourceConfig, ResourceProfile};
pub use error::EngineError;
pub use execution::{Backend, ClusterBackend, Engine, ExitStatus, LocalBackend, RunReport};
pub use workflow::{Pipeline, Rule, TaskGraph};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "ruleflow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "ruleflow");
    }

    #[test]
    fn test_module_exports_rule() {
        let rule = Rule::transform("sort_bam", "align_bwa", "sort {input} > {output}")
            .with_suffix(".bam")
            .with_output(".sort.bam");
        assert_eq!(rule.name, "sort_bam");
        assert!(!rule.is_origination());
    }

    #[test]
    fn test_module_exports_pipeline() {
        let pipeline = Pipeline::new();
        assert!(pipeline.is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
