//! Decoder for the driver's exported fragment documents.
//!
//! A fragment is one exported file describing part of a target's
//! compilation graph: the variable bindings of its environment, the tool
//! invocations, and the tasks referencing them. The merge engine only ever
//! sees the strongly-typed [`RawFragment`]; the on-disk syntax is confined
//! to this module so a different driver document format stays a local,
//! swappable change.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{ClearExportedError, FragmentError};

/// File name suffix the driver uses for exported fragments.
pub const FRAGMENT_SUFFIX: &str = ".fragment.json";

/// One `Name=Value` binding of a fragment's environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Variable {
    pub name: String,
    pub value: String,
}

/// One tool invocation shape as exported by the driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ToolSpec {
    pub name: String,
    pub path: Utf8PathBuf,
    pub params: String,
    pub allow_remote: bool,
    pub output_file_masks: String,
    pub skip_if_project_failed: bool,
    #[serde(default)]
    pub output_prefix: Option<String>,
}

/// One compilation action as exported by the driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskSpec {
    pub name: String,
    pub tool: String,
    pub source_file: Utf8PathBuf,
    pub working_dir: Utf8PathBuf,
    pub skip_if_project_failed: bool,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A decoded fragment. The driver is required to emit tasks in topological
/// order; the merge engine treats a forward reference as fatal.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawFragment {
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

/// Read and decode a single fragment file.
pub fn read_fragment(path: &Utf8Path) -> Result<RawFragment, FragmentError> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Delete stale fragment exports left in `dir` by an earlier driver run.
/// Returns how many files were removed.
pub fn clear_exported(dir: &Utf8Path) -> Result<usize, ClearExportedError> {
    let pattern = dir.join(format!("*{FRAGMENT_SUFFIX}"));
    let mut removed = 0;

    for entry in glob::glob(pattern.as_str())? {
        fs::remove_file(entry?)?;
        removed += 1;
    }

    if removed > 0 {
        tracing::debug!("cleared {} stale fragment export(s) in {}", removed, dir);
    }

    Ok(removed)
}

/// Copy a consumed fragment next to the serialized task document so a
/// failed distributed run can be diagnosed from the snapshots alone.
pub fn snapshot_beside(fragment: &Utf8Path, task_file: &Utf8Path) -> std::io::Result<Utf8PathBuf> {
    let name = fragment.file_name().unwrap_or("fragment");
    let snapshot = Utf8PathBuf::from(format!("{task_file}.{name}"));
    fs::copy(fragment, &snapshot)?;
    Ok(snapshot)
}
