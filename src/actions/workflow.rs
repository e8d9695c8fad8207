//! Workflow YAML model. Only the shapes the control plane needs are parsed:
//! the `on` trigger set, per-job `runs-on` labels, and timeouts. Everything
//! else in the document rides along untouched for the runner.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use crate::errors::{ForgeError, Result};
use crate::store::records::TriggerEvent;

/// `on:` accepts a single event, a list, or a map with per-event filters.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TriggerSpec {
    Single(String),
    List(Vec<String>),
    Map(BTreeMap<String, serde_yaml::Value>),
}

/// `runs-on:` accepts one label or a list of labels.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RunsOn {
    One(String),
    Many(Vec<String>),
}

impl RunsOn {
    pub fn labels(&self) -> Vec<String> {
        match self {
            RunsOn::One(label) => vec![label.to_ascii_lowercase()],
            RunsOn::Many(labels) => labels.iter().map(|l| l.to_ascii_lowercase()).collect(),
        }
    }
}

/// One job declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    #[serde(rename = "runs-on")]
    pub runs_on: RunsOn,
    #[serde(rename = "timeout-minutes")]
    pub timeout_minutes: Option<u64>,
    #[serde(default)]
    pub steps: Vec<serde_yaml::Value>,
}

/// A parsed workflow document.
#[derive(Debug, Clone, Deserialize)]
pub struct Workflow {
    pub name: Option<String>,
    #[serde(rename = "on")]
    pub on: TriggerSpec,
    pub jobs: BTreeMap<String, JobSpec>,
}

impl Workflow {
    /// Parse a workflow from its YAML source. A document without jobs is
    /// rejected; unknown trigger names are tolerated and simply never fire.
    pub fn parse(source: &str) -> Result<Self> {
        let workflow: Workflow = serde_yaml::from_str(source)
            .map_err(|e| ForgeError::InvalidInput(format!("workflow parse: {e}")))?;
        if workflow.jobs.is_empty() {
            return Err(ForgeError::InvalidInput(
                "workflow declares no jobs".into(),
            ));
        }
        Ok(workflow)
    }

    /// The recognized events this workflow fires on.
    pub fn triggers(&self) -> HashSet<TriggerEvent> {
        let names: Vec<&str> = match &self.on {
            TriggerSpec::Single(name) => vec![name.as_str()],
            TriggerSpec::List(names) => names.iter().map(String::as_str).collect(),
            TriggerSpec::Map(map) => map.keys().map(String::as_str).collect(),
        };
        names
            .into_iter()
            .filter_map(TriggerEvent::parse)
            .collect()
    }

    /// Whether a given event starts this workflow.
    pub fn fires_on(&self, event: TriggerEvent) -> bool {
        self.triggers().contains(&event)
    }

    /// Run-level timeout: the largest job timeout, or the given default.
    pub fn timeout_minutes(&self, default: u64) -> u64 {
        self.jobs
            .values()
            .filter_map(|job| job.timeout_minutes)
            .max()
            .unwrap_or(default)
    }
}
