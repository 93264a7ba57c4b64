//! The merged graph model and its serialized document form.
//!
//! A [`MergedGraph`] is the deduplicated union of every target's fragments:
//! an ordered list of environments, each owning its tools and exactly one
//! project with an ordered task list. The same types double as the executor
//! document; serialization is a straight serde pass with the executor's
//! PascalCase attribute vocabulary, `FormatVersion` 1.

use std::fs;
use std::io::{BufReader, BufWriter};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::fragment::Variable;

pub const FORMAT_VERSION: u32 = 1;

/// A deduplicated tool invocation shape: what to run and with what
/// parameters. The caption accumulates every target that contributed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tool {
    pub name: String,
    pub path: Utf8PathBuf,
    pub params: String,
    pub allow_remote: bool,
    pub output_file_masks: String,
    pub skip_if_project_failed: bool,
    /// Caption identifying the contributing target(s), e.g.
    /// `** For Game-Win64-Development + Editor-Win64-Development`.
    pub group_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_prefix: Option<String>,
}

/// One compilation action bound to a tool, with resolved dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Task {
    pub name: String,
    pub tool: String,
    pub source_file: Utf8PathBuf,
    pub working_dir: Utf8PathBuf,
    pub skip_if_project_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Canonical names of the tasks this one depends on, insertion-ordered
    /// and free of duplicates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// The ordered task list of one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Project {
    pub name: String,
    pub env: String,
    pub tasks: Vec<Task>,
}

/// A named group of build variables shared by one or more tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Environment {
    pub name: String,
    pub variables: Vec<Variable>,
    pub tools: Vec<Tool>,
    pub project: Project,
}

/// The union of all environments, tools and tasks across targets, ready to
/// hand to an executor. Built fresh per build call, never persisted beyond
/// the serialized task document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MergedGraph {
    pub format_version: u32,
    pub environments: Vec<Environment>,
}

impl Default for MergedGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MergedGraph {
    pub fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            environments: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }

    pub fn tool_count(&self) -> usize {
        self.environments.iter().map(|env| env.tools.len()).sum()
    }

    pub fn task_count(&self) -> usize {
        self.environments
            .iter()
            .map(|env| env.project.tasks.len())
            .sum()
    }

    /// Stamp every tool's output prefix with a combined-progress increment
    /// so an observer can render one progress bar across all merged
    /// targets.
    pub fn annotate_progress(&mut self) {
        let total = self.tool_count();
        if total == 0 {
            return;
        }

        for env in &mut self.environments {
            for tool in &mut env.tools {
                match &mut tool.output_prefix {
                    Some(prefix) => {
                        prefix.push_str(&format!(" [@progress increment 1/{total}]"));
                    }
                    None => {
                        tool.output_prefix =
                            Some(format!(" [@progress increment 1/{total} skipline]"));
                    }
                }
            }
        }
    }

    /// Serialize the graph to the executor's document form.
    pub fn write(&self, path: &Utf8Path) -> std::io::Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Read a serialized graph document back, as the local runner does.
    pub fn read(path: &Utf8Path) -> std::io::Result<Self> {
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}
