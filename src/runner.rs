//! The local parallel task runner.
//!
//! The fallback executor used when no distributed build service is
//! configured. It is a second consumer of the serialized task document:
//! the graph is read back from disk, checked for cycles, and executed on a
//! thread pool where every task starts as soon as its dependencies have
//! finished, each tool running as a subprocess with its environment's
//! variables applied.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use camino::Utf8Path;
use crossbeam_channel::unbounded;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::ExecError;
use crate::graph::MergedGraph;
use crate::process::{self, CancelToken, RunOutcome};

/// In-process parallel executor for a serialized task document.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor {
    /// Stop scheduling new tasks after the first failure. Without it only
    /// tasks flagged `SkipIfProjectFailed` are skipped once their project
    /// has a failure; everything else keeps running.
    pub stop_on_errors: bool,
}

impl LocalExecutor {
    pub fn new(stop_on_errors: bool) -> Self {
        Self { stop_on_errors }
    }

    /// Execute every task in the document. Returns an error when any task
    /// failed, the document is malformed, or the run was cancelled.
    pub fn execute(&self, task_file: &Utf8Path, cancel: &CancelToken) -> Result<(), ExecError> {
        let document = MergedGraph::read(task_file)?;
        let jobs = collect_jobs(task_file, &document)?;

        if jobs.is_empty() {
            return Ok(());
        }

        let (graph, indices) = build_graph(task_file, &jobs)?;

        // Toposort primarily to reject cycles before any task runs.
        if toposort(&graph, None).is_err() {
            return Err(ExecError::Document {
                path: task_file.to_owned(),
                reason: "task dependencies form a cycle".to_string(),
            });
        }

        let failed = run_jobs(&jobs, &graph, &indices, self.stop_on_errors, cancel);

        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        if failed > 0 {
            return Err(ExecError::Local { failed });
        }

        Ok(())
    }
}

/// One runnable unit: a task joined with its tool and the variables of
/// the environment its project belongs to.
struct Job<'a> {
    name: &'a str,
    caption: Option<&'a str>,
    env: usize,
    path: &'a Utf8Path,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    working_dir: &'a Utf8Path,
    skip_if_project_failed: bool,
    depends_on: &'a [String],
}

fn collect_jobs<'a>(
    task_file: &Utf8Path,
    document: &'a MergedGraph,
) -> Result<Vec<Job<'a>>, ExecError> {
    // Tools are resolved across the whole document: deduplication may
    // leave a task pointing at a tool owned by another environment.
    let mut tools = HashMap::new();
    for env in &document.environments {
        for tool in &env.tools {
            tools.insert(tool.name.as_str(), tool);
        }
    }

    let mut jobs = Vec::new();
    for (env_idx, env) in document.environments.iter().enumerate() {
        let envs: Vec<(String, String)> = env
            .variables
            .iter()
            .map(|var| (var.name.clone(), var.value.clone()))
            .collect();

        for task in &env.project.tasks {
            let tool = tools.get(task.tool.as_str()).ok_or_else(|| ExecError::Document {
                path: task_file.to_owned(),
                reason: format!(
                    "task '{}' references unknown tool '{}'",
                    task.name, task.tool
                ),
            })?;

            jobs.push(Job {
                name: &task.name,
                caption: task.caption.as_deref(),
                env: env_idx,
                path: &tool.path,
                args: split_params(&tool.params),
                envs: envs.clone(),
                working_dir: &task.working_dir,
                skip_if_project_failed: task.skip_if_project_failed,
                depends_on: &task.depends_on,
            });
        }
    }

    Ok(jobs)
}

fn build_graph(
    task_file: &Utf8Path,
    jobs: &[Job],
) -> Result<(DiGraph<usize, ()>, Vec<NodeIndex>), ExecError> {
    let mut graph = DiGraph::new();
    let mut by_name = HashMap::new();
    let mut indices = Vec::with_capacity(jobs.len());

    for (i, job) in jobs.iter().enumerate() {
        let index = graph.add_node(i);
        by_name.insert(job.name, index);
        indices.push(index);
    }

    for (i, job) in jobs.iter().enumerate() {
        for dep in job.depends_on {
            let &dep_index = by_name.get(dep.as_str()).ok_or_else(|| ExecError::Document {
                path: task_file.to_owned(),
                reason: format!("task '{}' depends on unknown task '{}'", job.name, dep),
            })?;
            graph.add_edge(dep_index, indices[i], ());
        }
    }

    Ok((graph, indices))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Succeeded,
    Failed,
    Skipped,
}

/// Parallel topological execution: a pool of workers, a result channel,
/// and a scheduler loop that unlocks dependents as results come in.
/// Returns the number of failed tasks.
fn run_jobs(
    jobs: &[Job],
    graph: &DiGraph<usize, ()>,
    indices: &[NodeIndex],
    stop_on_errors: bool,
    cancel: &CancelToken,
) -> usize {
    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for edge in graph.raw_edges() {
        dependents
            .entry(edge.source())
            .or_default()
            .push(edge.target());
    }

    let mut dependency_counts: HashMap<NodeIndex, usize> = indices
        .iter()
        .map(|&i| {
            (
                i,
                graph
                    .neighbors_directed(i, petgraph::Direction::Incoming)
                    .count(),
            )
        })
        .collect();

    let total = jobs.len();
    let mut completed = 0;
    let mut failures = 0;
    let mut failed_envs: HashSet<usize> = HashSet::new();

    let mp = MultiProgress::new();
    let main_pb = mp.add(ProgressBar::new(total as u64));
    main_pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .expect("invalid progress bar template")
            .progress_chars("=>-"),
    );
    main_pb.set_message("Running tasks...");

    let spinner_style = ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .expect("invalid progress bar template");

    let (result_sender, result_receiver) = unbounded::<(NodeIndex, Status)>();

    rayon::scope(|scope| {
        let spawn_task = |index: NodeIndex| {
            let job = &jobs[graph[index]];
            let sender = result_sender.clone();
            let mp = mp.clone();
            let style = spinner_style.clone();
            let cancel = cancel.clone();

            scope.spawn(move |_| {
                let task_pb = mp.add(ProgressBar::new_spinner());
                task_pb.set_style(style);
                task_pb.set_message(job.caption.unwrap_or(job.name).to_string());
                task_pb.enable_steady_tick(Duration::from_millis(100));

                let status = run_one(job, &cancel);

                task_pb.finish_and_clear();
                sender.send((index, status)).unwrap();
            });
        };

        // A ready task is either spawned or, when its project already
        // failed or scheduling has stopped, resolved as skipped through
        // the same channel so the bookkeeping has one path.
        let dispatch = |index: NodeIndex, failures: usize, failed_envs: &HashSet<usize>| {
            let job = &jobs[graph[index]];
            let give_up = cancel.is_cancelled()
                || (stop_on_errors && failures > 0)
                || (job.skip_if_project_failed && failed_envs.contains(&job.env));

            if give_up {
                tracing::debug!("skipping task '{}'", job.name);
                result_sender.send((index, Status::Skipped)).unwrap();
            } else {
                spawn_task(index);
            }
        };

        for &index in indices {
            if dependency_counts[&index] == 0 {
                dispatch(index, failures, &failed_envs);
            }
        }

        while completed < total {
            let (index, status) = result_receiver.recv().unwrap();
            completed += 1;
            main_pb.inc(1);

            if status == Status::Failed {
                failures += 1;
                failed_envs.insert(jobs[graph[index]].env);
            }

            if let Some(unlocked) = dependents.get(&index) {
                for &next in unlocked {
                    if let Some(count) = dependency_counts.get_mut(&next) {
                        *count -= 1;
                        if *count == 0 {
                            dispatch(next, failures, &failed_envs);
                        }
                    }
                }
            }
        }
    });

    main_pb.finish_with_message(if failures == 0 {
        "All tasks finished".to_string()
    } else {
        format!("{failures} task(s) failed")
    });

    failures
}

fn run_one(job: &Job, cancel: &CancelToken) -> Status {
    tracing::debug!("running task '{}'", job.name);

    match process::run(job.path, &job.args, job.working_dir, &job.envs, cancel) {
        Ok(RunOutcome::Completed(run)) if run.success() => Status::Succeeded,
        Ok(RunOutcome::Completed(run)) => {
            tracing::error!(
                "task '{}' failed with exit code {}\n{}",
                job.name,
                run.code,
                run.output,
            );
            Status::Failed
        }
        Ok(RunOutcome::Cancelled) => Status::Skipped,
        Err(err) => {
            tracing::error!("task '{}' couldn't start: {}", job.name, err);
            Status::Failed
        }
    }
}

/// Split a tool's parameter string into arguments, honoring double-quoted
/// spans so quoted paths survive with their spaces intact.
fn split_params(params: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for ch in params.chars() {
        match ch {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if !current.is_empty() {
        args.push(current);
    }

    args
}
