//! The build-graph merge engine.
//!
//! Takes one [`TargetGraph`] per target and fuses every exported fragment
//! into a single [`MergedGraph`], deduplicating identical tool invocations
//! and their tasks across targets. The merge is single-threaded and
//! deterministic: targets and fragments are processed exactly in the order
//! given, and the first target to contribute a tool owns its canonical
//! name; later duplicates are redirected onto it and their dependency
//! edges remapped.
//!
//! All dedup state lives in a [`MergeSession`] value created per call;
//! there are no process-wide tables, so concurrent merges are isolated by
//! construction.

use std::collections::{HashMap, HashSet};

use camino::Utf8Path;

use crate::error::MergeError;
use crate::fragment::{self, RawFragment, TaskSpec, ToolSpec, Variable};
use crate::graph::{Environment, MergedGraph, Project, Task, Tool};
use crate::target::TargetGraph;

/// Merge every target's fragments into one deduplicated graph.
///
/// Returns `Ok(None)` when no target exported any fragment, the
/// legitimate "everything was up to date" outcome of an incremental
/// build. Any malformed fragment or unresolvable reference
/// aborts the whole merge; a partial graph is never returned.
pub fn merge(targets: &[TargetGraph]) -> Result<Option<MergedGraph>, MergeError> {
    let mut session = MergeSession::new();

    for (job, target) in targets.iter().enumerate() {
        let mut carry_over: Vec<String> = Vec::new();

        for path in &target.fragments {
            let raw = fragment::read_fragment(path).map_err(|source| MergeError::Fragment {
                path: path.clone(),
                source,
            })?;

            carry_over = session.merge_fragment(job, target, path, &raw, &carry_over)?;
        }
    }

    Ok(session.finish())
}

/// All state of one merge call: the graph under construction plus the
/// dedup and remapping tables.
struct MergeSession {
    graph: MergedGraph,
    /// Sorted-joined variable string → index into `graph.environments`.
    env_by_key: HashMap<String, usize>,
    /// Tool dedup key → location of the canonical tool.
    tool_by_key: HashMap<String, (usize, usize)>,
    /// Job-qualified tool name → canonical tool name.
    tool_names: HashMap<String, String>,
    /// Job-qualified tool name → the dedup key it was declared with.
    tool_keys: HashMap<String, String>,
    /// Job-qualified task name → canonical task name.
    task_names: HashMap<String, String>,
    /// Canonical tool name → the canonical task bound to it.
    task_of_tool: HashMap<String, String>,
    fragments_seen: usize,
}

impl MergeSession {
    fn new() -> Self {
        Self {
            graph: MergedGraph::new(),
            env_by_key: HashMap::new(),
            tool_by_key: HashMap::new(),
            tool_names: HashMap::new(),
            tool_keys: HashMap::new(),
            task_names: HashMap::new(),
            task_of_tool: HashMap::new(),
            fragments_seen: 0,
        }
    }

    fn finish(self) -> Option<MergedGraph> {
        (self.fragments_seen > 0).then_some(self.graph)
    }

    /// Merge one fragment. Returns the carry-over set for the next
    /// fragment of the same target: the canonical names of every task this
    /// fragment emitted.
    fn merge_fragment(
        &mut self,
        job: usize,
        target: &TargetGraph,
        path: &Utf8Path,
        raw: &RawFragment,
        carry_over: &[String],
    ) -> Result<Vec<String>, MergeError> {
        self.fragments_seen += 1;

        let env_idx = self.environment_for(&raw.variables);

        // Tools created by this fragment, as opposed to reused ones. Only
        // tasks bound to a freshly created tool become new tasks.
        let mut fresh = HashSet::new();
        for tool in &raw.tools {
            self.merge_tool(job, target, env_idx, tool, &mut fresh)?;
        }

        let mut emitted = Vec::new();
        for task in &raw.tasks {
            self.merge_task(job, target, path, env_idx, task, &fresh, carry_over, &mut emitted)?;
        }

        Ok(emitted)
    }

    /// Find or create the environment matching a fragment's variable set.
    fn environment_for(&mut self, variables: &[Variable]) -> usize {
        let mut lines: Vec<String> = variables
            .iter()
            .map(|var| format!("{}={}", var.name, var.value))
            .collect();
        lines.sort();
        let key = lines.join("\n");

        if let Some(&idx) = self.env_by_key.get(&key) {
            return idx;
        }

        let name = format!("Env_{}", self.graph.environments.len());
        self.graph.environments.push(Environment {
            name: name.clone(),
            variables: variables.to_vec(),
            tools: Vec::new(),
            project: Project {
                name: name.clone(),
                env: name,
                tasks: Vec::new(),
            },
        });

        let idx = self.graph.environments.len() - 1;
        self.env_by_key.insert(key, idx);
        idx
    }

    fn merge_tool(
        &mut self,
        job: usize,
        target: &TargetGraph,
        env_idx: usize,
        spec: &ToolSpec,
        fresh: &mut HashSet<String>,
    ) -> Result<(), MergeError> {
        let key = dedup_key(spec);
        let job_name = job_qualified(&spec.name, job);

        // The driver may redeclare a tool across fragments of one target,
        // but only with the same invocation.
        if let Some(prior) = self.tool_keys.get(&job_name) {
            if *prior != key {
                return Err(MergeError::ToolRedeclared {
                    name: spec.name.clone(),
                    caption: target.caption.clone(),
                });
            }
        }

        match self.tool_by_key.get(&key).copied() {
            Some((env, idx)) => {
                let tool = &mut self.graph.environments[env].tools[idx];
                tool.group_prefix.push_str(&format!(" + {}", target.caption));

                let canonical = tool.name.clone();
                tracing::debug!(
                    "tool '{}' of {} deduplicated onto '{}'",
                    spec.name,
                    target.caption,
                    canonical,
                );
                self.tool_names.insert(job_name.clone(), canonical);
            }
            None => {
                let env = &mut self.graph.environments[env_idx];
                env.tools.push(Tool {
                    name: job_name.clone(),
                    path: spec.path.clone(),
                    params: spec.params.clone(),
                    allow_remote: spec.allow_remote,
                    output_file_masks: spec.output_file_masks.clone(),
                    skip_if_project_failed: spec.skip_if_project_failed,
                    group_prefix: format!("** For {}", target.caption),
                    output_prefix: spec.output_prefix.clone(),
                });

                self.tool_by_key
                    .insert(key.clone(), (env_idx, env.tools.len() - 1));
                self.tool_names.insert(job_name.clone(), job_name.clone());
                fresh.insert(job_name.clone());
            }
        }

        self.tool_keys.insert(job_name, key);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_task(
        &mut self,
        job: usize,
        target: &TargetGraph,
        fragment: &Utf8Path,
        env_idx: usize,
        spec: &TaskSpec,
        fresh: &HashSet<String>,
        carry_over: &[String],
        emitted: &mut Vec<String>,
    ) -> Result<(), MergeError> {
        let tool_job = job_qualified(&spec.tool, job);
        let canonical_tool =
            self.tool_names
                .get(&tool_job)
                .cloned()
                .ok_or_else(|| MergeError::UnknownTool {
                    tool: spec.tool.clone(),
                    task: spec.name.clone(),
                    fragment: fragment.to_owned(),
                })?;

        let task_job = job_qualified(&spec.name, job);
        if self.task_names.contains_key(&task_job) {
            return Err(MergeError::DuplicateTask {
                name: spec.name.clone(),
                caption: target.caption.clone(),
            });
        }

        if fresh.contains(&canonical_tool) {
            // A tool carries exactly one task; a second binding means the
            // fragment is malformed.
            if let Some(first) = self.task_of_tool.get(&canonical_tool) {
                return Err(MergeError::ToolBoundTwice {
                    tool: canonical_tool,
                    first: first.clone(),
                    second: task_job,
                    fragment: fragment.to_owned(),
                });
            }

            let depends_on = self.resolve_dependencies(job, spec, fragment, carry_over)?;

            self.task_names.insert(task_job.clone(), task_job.clone());
            self.task_of_tool
                .insert(canonical_tool.clone(), task_job.clone());

            self.graph.environments[env_idx].project.tasks.push(Task {
                name: task_job.clone(),
                tool: canonical_tool,
                source_file: spec.source_file.clone(),
                working_dir: spec.working_dir.clone(),
                skip_if_project_failed: spec.skip_if_project_failed,
                caption: spec.caption.clone(),
                depends_on,
            });

            emitted.push(task_job);
        } else {
            // The tool was deduplicated, so the task is too: later
            // references resolve through to the canonical task, which
            // keeps its original dependency set.
            let canonical_task = self
                .task_of_tool
                .get(&canonical_tool)
                .cloned()
                .ok_or_else(|| MergeError::ToolWithoutTask {
                    tool: canonical_tool.clone(),
                    task: task_job.clone(),
                })?;

            self.task_names.insert(task_job, canonical_task);
        }

        Ok(())
    }

    /// Resolve a new task's declared dependencies through the session
    /// tables and union them with the carry-over set from the previous
    /// fragment of the same target.
    fn resolve_dependencies(
        &self,
        job: usize,
        spec: &TaskSpec,
        fragment: &Utf8Path,
        carry_over: &[String],
    ) -> Result<Vec<String>, MergeError> {
        let mut resolved = Vec::new();

        for dep in &spec.depends_on {
            let dep_job = job_qualified(dep, job);
            let canonical = self.task_names.get(&dep_job).cloned().ok_or_else(|| {
                MergeError::UnresolvedDependency {
                    name: dep.clone(),
                    task: spec.name.clone(),
                    fragment: fragment.to_owned(),
                }
            })?;

            if !resolved.contains(&canonical) {
                resolved.push(canonical);
            }
        }

        for dep in carry_over {
            if !resolved.contains(dep) {
                resolved.push(dep.clone());
            }
        }

        Ok(resolved)
    }
}

/// Qualify a fragment-local name with its target index, so names from
/// different targets cannot collide before deduplication is applied.
fn job_qualified(name: &str, job: usize) -> String {
    format!("{name}_j{job}")
}

/// Compute a tool's dedup key.
///
/// Normally `path + " " + params`; the shared-PCH override takes
/// precedence, see [`shared_pch_key`].
fn dedup_key(spec: &ToolSpec) -> String {
    if let Some(key) = shared_pch_key(&spec.params) {
        tracing::info!(
            "detected shared PCH output, tool '{}' will use key '{}'",
            spec.name,
            key,
        );
        return key;
    }

    format!("{} {}", spec.path, spec.params)
}

const PCH_CREATE_SWITCH: &str = " /Yc\"";
const PCH_OUTPUT_SWITCH: &str = " /Fp\"";

/// Deliberate special case: multiple targets that separately decide to
/// build the *same* shared precompiled header must collapse to exactly one
/// tool and task, even though the rest of their parameters (include paths
/// and so on) differ per target. A tool qualifies when its parameters
/// carry the PCH-create switch and an output path under a `SharedPCHs`
/// directory; the key is then derived from the output path alone.
pub(crate) fn shared_pch_key(params: &str) -> Option<String> {
    let yc = params.find(PCH_CREATE_SWITCH)?;
    let fp = yc + params[yc..].find(PCH_OUTPUT_SWITCH)?;

    let start = fp + PCH_OUTPUT_SWITCH.len();
    let len = params[start..].find('"')?;
    let output = &params[start..start + len];

    let shared = output.contains("/SharedPCHs/") || output.contains("\\SharedPCHs\\");
    shared.then(|| format!("SharedPCH: {output}"))
}
