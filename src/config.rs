//! Per-Stage Resource Configuration
//!
//! Every non-origination rule must have a resource profile (cores, memory,
//! wall-clock limit) keyed by rule name. A missing entry is a fatal
//! configuration error, not a default: a cluster submission with made-up
//! resource figures is worse than no submission.
//!
//! # Example YAML
//!
//! ```yaml
//! align_bwa:
//!   cores: 8
//!   mem_gb: 32
//!   walltime: "08:00:00"
//! sort_bam:
//!   cores: 1
//!   mem_gb: 24
//!   walltime: 3600
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Headroom reserved below the requested memory when a payload runs on a
/// JVM: the managed heap ceiling must leave room for stack and native
/// allocations.
pub const JAVA_HEAP_HEADROOM_GB: u32 = 2;

/// Resource request attached to every dispatched task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResourceProfile {
    /// CPU cores to reserve.
    pub cores: u32,

    /// Memory reservation in gigabytes.
    pub mem_gb: u32,

    /// Wall-clock limit; accepted as seconds or `HH:MM:SS`.
    #[serde(
        serialize_with = "serialize_walltime",
        deserialize_with = "deserialize_walltime"
    )]
    pub walltime: Duration,
}

impl ResourceProfile {
    /// Creates a profile with a walltime given in seconds.
    pub fn new(cores: u32, mem_gb: u32, walltime_secs: u64) -> Self {
        Self {
            cores,
            mem_gb,
            walltime: Duration::from_secs(walltime_secs),
        }
    }

    /// Checks that every figure is usable.
    pub fn validate(&self, rule_name: &str) -> Result<(), EngineError> {
        if self.cores == 0 {
            return Err(EngineError::Configuration(format!(
                "rule '{}': cores must be positive",
                rule_name
            )));
        }
        if self.mem_gb == 0 {
            return Err(EngineError::Configuration(format!(
                "rule '{}': mem_gb must be positive",
                rule_name
            )));
        }
        if self.walltime.is_zero() {
            return Err(EngineError::Configuration(format!(
                "rule '{}': walltime must be positive",
                rule_name
            )));
        }
        Ok(())
    }

    /// Usable JVM heap in GB, after the fixed headroom; at least 1.
    pub fn java_heap_gb(&self) -> u32 {
        self.mem_gb.saturating_sub(JAVA_HEAP_HEADROOM_GB).max(1)
    }

    /// Walltime formatted as `HH:MM:SS` for batch-scheduler attributes.
    pub fn walltime_clock(&self) -> String {
        let total = self.walltime.as_secs();
        format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
    }
}

impl fmt::Display for ResourceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cores, {} GB, walltime {}",
            self.cores,
            self.mem_gb,
            self.walltime_clock()
        )
    }
}

/// Accepts `3600` or `"01:00:00"`.
fn deserialize_walltime<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Spec {
        Seconds(u64),
        Clock(String),
    }

    match Spec::deserialize(deserializer)? {
        Spec::Seconds(s) => Ok(Duration::from_secs(s)),
        Spec::Clock(text) => parse_clock(&text).map_err(de::Error::custom),
    }
}

fn serialize_walltime<S>(walltime: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(walltime.as_secs())
}

/// Parses `HH:MM:SS` into a duration.
fn parse_clock(text: &str) -> Result<Duration, String> {
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 3 {
        return Err(format!("invalid walltime '{}': expected HH:MM:SS or seconds", text));
    }

    let mut fields = [0u64; 3];
    for (i, part) in parts.iter().enumerate() {
        fields[i] = part
            .parse()
            .map_err(|_| format!("invalid walltime '{}': non-numeric field '{}'", text, part))?;
    }

    Ok(Duration::from_secs(fields[0] * 3600 + fields[1] * 60 + fields[2]))
}

/// Mapping from rule name to resource profile for one pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(transparent)]
pub struct ResourceConfig {
    profiles: HashMap<String, ResourceProfile>,
}

impl ResourceConfig {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a rule's profile.
    pub fn insert(&mut self, rule_name: impl Into<String>, profile: ResourceProfile) {
        self.profiles.insert(rule_name.into(), profile);
    }

    /// Looks up a rule's profile; absence is a fatal configuration error.
    pub fn get(&self, rule_name: &str) -> Result<&ResourceProfile, EngineError> {
        self.profiles.get(rule_name).ok_or_else(|| {
            EngineError::Configuration(format!(
                "no resource profile configured for rule '{}'",
                rule_name
            ))
        })
    }

    /// Validates every configured profile.
    pub fn validate(&self) -> Result<(), EngineError> {
        for (name, profile) in &self.profiles {
            profile.validate(name)?;
        }
        Ok(())
    }

    /// Loads a configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parses a configuration from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| {
            EngineError::Configuration(format!("invalid resource configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }
}
