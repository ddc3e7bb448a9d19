//! Workflow Definition Module
//!
//! Provides data structures and utilities for declaring pipelines and
//! building them into runnable task graphs.
//!
//! # Structure
//!
//! - [`rule`]: Declarative rule and pipeline model
//! - [`pattern`]: Named-capture matching and template rendering
//! - [`graph`]: Rule expansion into the concrete task DAG
//! - [`staleness`]: Make-style up-to-date evaluation

pub mod graph;
pub mod pattern;
pub mod rule;
pub mod staleness;

pub use graph::{Task, TaskGraph, TaskId};
pub use pattern::{compile_pattern, has_placeholders, match_path, render, Bindings};
pub use rule::{Filter, InputSelector, Pipeline, Rule};
pub use staleness::{evaluate, Freshness};
