#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod error;
mod executor;
mod fragment;
mod graph;
mod ledger;
mod merge;
mod process;
#[cfg(feature = "local")]
mod runner;
mod target;

use std::fmt::Display;
use std::fs;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

pub use crate::error::*;
pub use crate::executor::{DistributedExecutor, ExecOptions, TransientSignature, execute};
pub use crate::fragment::{
    FRAGMENT_SUFFIX, RawFragment, TaskSpec, ToolSpec, Variable, clear_exported, read_fragment,
};
pub use crate::graph::{Environment, MergedGraph, Project, Task, Tool};
pub use crate::ledger::Ledger;
pub use crate::merge::merge;
pub use crate::process::{CancelToken, CapturedRun, RunOutcome};
#[cfg(feature = "local")]
pub use crate::runner::LocalExecutor;
pub use crate::target::{Driver, Manifest, TargetGraph, TargetSpec};

/// Initialize stderr logging filtered by `RUST_LOG`.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    style(f).blue()
}

/// The build orchestrator: drives the external driver once per target,
/// merges every exported fragment into one graph, executes it, and keeps
/// the ledger of verified products.
///
/// The ledger persists across [`build`](Self::build) calls for the
/// lifetime of the orchestrator; everything else is per call.
pub struct Orchestrator {
    driver: Box<dyn Driver>,
    ledger: Ledger,
    opts: ExecOptions,
    export_dir: Option<Utf8PathBuf>,
}

impl Orchestrator {
    pub fn config() -> Config {
        Config::new()
    }

    /// The accumulated record of everything built so far.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// A handle that cancels any build currently running on this
    /// orchestrator. Cancellation surfaces as [`ExecError::Cancelled`].
    pub fn cancel_token(&self) -> CancelToken {
        self.opts.cancel.clone()
    }

    /// Build every target and submit the combined graph as a single job.
    ///
    /// Fatal on the first driver failure, malformed fragment, exhausted
    /// executor retry, or missing product; there is no partial success.
    pub fn build(&self, targets: &[TargetSpec]) -> Result<(), YosegiError> {
        let s = Instant::now();
        eprintln!(
            "Running {} for {} target(s).",
            style("Yosegi").red(),
            style(targets.len()).blue(),
        );

        let graphs = self.prepare_targets(targets)?;
        let merged = merge::merge(&graphs)?;

        match &merged {
            Some(graph) => tracing::info!(
                "merged {} task(s) into {} environment(s)",
                graph.task_count(),
                graph.environments.len(),
            ),
            None => tracing::info!("no fragments exported, everything was up to date"),
        }

        self.consume_fragments(&graphs)?;

        executor::execute(
            merged.unwrap_or_default(),
            &graphs,
            self.driver.as_ref(),
            &self.ledger,
            &self.opts,
        )?;

        eprintln!("Build finished {}", as_overhead(s));
        Ok(())
    }

    /// Invoke the driver once per target, in order.
    fn prepare_targets(&self, targets: &[TargetSpec]) -> Result<Vec<TargetGraph>, YosegiError> {
        let bar = ProgressBar::new(targets.len() as u64).with_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("Error setting progress bar template")
                .progress_chars("#>-"),
        );

        let mut graphs = Vec::with_capacity(targets.len());
        for spec in targets {
            bar.set_message(spec.caption());

            // Fragments surviving from an earlier, interrupted run would
            // otherwise be picked up as this target's exports.
            if let Some(dir) = &self.export_dir {
                fragment::clear_exported(dir)?;
            }

            let graph = self
                .driver
                .prepare(spec)
                .map_err(|err| YosegiError::Driver(spec.caption(), err))?;

            tracing::info!(
                "driver prepared {} with {} fragment(s)",
                graph.caption,
                graph.fragments.len(),
            );
            graphs.push(graph);
            bar.inc(1);
        }

        bar.finish_with_message("Prepared targets");
        Ok(graphs)
    }

    /// Snapshot every consumed fragment beside the task document, then
    /// delete the original so the next export starts clean.
    fn consume_fragments(&self, graphs: &[TargetGraph]) -> Result<(), YosegiError> {
        for graph in graphs {
            for path in &graph.fragments {
                fragment::snapshot_beside(path, &self.opts.task_file)?;
                fs::remove_file(path)?;
            }
        }

        Ok(())
    }
}

/// A builder struct for creating an [`Orchestrator`] with the desired
/// settings.
pub struct Config {
    opts: ExecOptions,
    export_dir: Option<Utf8PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    fn new() -> Self {
        Self {
            opts: ExecOptions::default(),
            export_dir: None,
        }
    }

    /// Where the merged graph document is written for the executor.
    pub fn task_file(mut self, path: impl AsRef<Utf8Path>) -> Self {
        self.opts.task_file = path.as_ref().to_path_buf();
        self
    }

    /// The compilation working directory the executor and all build
    /// scripts run in.
    pub fn working_dir(mut self, path: impl AsRef<Utf8Path>) -> Self {
        self.opts.working_dir = path.as_ref().to_path_buf();
        self
    }

    /// Annotate merged tools so observers can render one combined
    /// progress bar across all targets.
    pub fn show_progress(mut self, show: bool) -> Self {
        self.opts.show_progress = show;
        self
    }

    /// Allow one whole-build retry after a permanent executor failure,
    /// deleting all declared products in between.
    pub fn retry_failed(mut self, retry: bool) -> Self {
        self.opts.retry_failed = retry;
        self
    }

    /// Submit builds to this distributed executor instead of the local
    /// runner.
    pub fn distributed(mut self, executor: DistributedExecutor) -> Self {
        self.opts.distributed = Some(executor);
        self
    }

    /// Replace the local fallback runner. Passing a configured runner is
    /// also how `stop_on_errors` is set for local builds.
    #[cfg(feature = "local")]
    pub fn local(mut self, runner: LocalExecutor) -> Self {
        self.opts.local = Some(runner);
        self
    }

    /// Directory the driver exports fragments into; stale exports found
    /// here are cleared before every driver invocation. Fragment paths
    /// handed back by the driver must point outside this directory (the
    /// driver copies its raw exports out), or the sweep ahead of the next
    /// target would eat them.
    pub fn export_dir(mut self, path: impl AsRef<Utf8Path>) -> Self {
        self.export_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Use an externally created cancellation token.
    pub fn cancel(mut self, cancel: CancelToken) -> Self {
        self.opts.cancel = cancel;
        self
    }

    pub fn finish(self, driver: impl Driver + 'static) -> Orchestrator {
        Orchestrator {
            driver: Box::new(driver),
            ledger: Ledger::new(),
            opts: self.opts,
            export_dir: self.export_dir,
        }
    }
}

#[cfg(all(test, feature = "local"))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    /// A driver whose targets each compile one file via `/bin/sh`.
    struct ScriptedDriver {
        dir: Utf8PathBuf,
        deploys: Arc<Mutex<Vec<Utf8PathBuf>>>,
    }

    impl ScriptedDriver {
        fn new(dir: &Utf8Path) -> Self {
            Self {
                dir: dir.to_path_buf(),
                deploys: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn product_of(&self, spec: &TargetSpec) -> Utf8PathBuf {
            self.dir.join(format!("{}.bin", spec.target))
        }
    }

    impl Driver for ScriptedDriver {
        fn prepare(&self, spec: &TargetSpec) -> anyhow::Result<TargetGraph> {
            let product = self.product_of(spec);
            let fragment = self.dir.join(format!("{}{FRAGMENT_SUFFIX}", spec.target));

            let body = json!({
                "Variables": [{ "Name": "PATH", "Value": "/usr/bin:/bin" }],
                "Tools": [{
                    "Name": "Compile",
                    "Path": "/bin/sh",
                    "Params": format!(r#"-c "echo built > {product}""#),
                    "AllowRemote": false,
                    "OutputFileMasks": format!("{}.bin", spec.target),
                    "SkipIfProjectFailed": false,
                }],
                "Tasks": [{
                    "Name": "CompileAction",
                    "Tool": "Compile",
                    "SourceFile": format!("{}.cpp", spec.target),
                    "WorkingDir": self.dir.as_str(),
                    "SkipIfProjectFailed": false,
                }],
            });
            fs::write(&fragment, serde_json::to_string(&body)?)?;

            let manifest = Manifest {
                build_products: vec![product],
                deploy_target_files: vec![self.dir.join(format!("{}.deploy", spec.target))],
                ..Manifest::default()
            };

            Ok(TargetGraph::new(spec.clone(), manifest).with_fragments([fragment]))
        }

        fn deploy(&self, file: &Utf8Path) -> anyhow::Result<()> {
            self.deploys.lock().unwrap().push(file.to_owned());
            Ok(())
        }
    }

    fn fixture() -> (tempfile::TempDir, Utf8PathBuf) {
        let guard = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(guard.path()).unwrap().to_path_buf();
        (guard, dir)
    }

    #[test]
    fn builds_two_targets_end_to_end_with_the_local_runner() {
        let (_guard, dir) = fixture();

        let driver = ScriptedDriver::new(&dir);
        let deploys = driver.deploys.clone();

        let orchestrator = Orchestrator::config()
            .task_file(dir.join("combined.buildset.json"))
            .working_dir(&dir)
            .export_dir(dir.join("exports"))
            .finish(driver);

        let targets = [
            TargetSpec::new("Game", "Linux", "Development"),
            TargetSpec::new("Editor", "Linux", "Development"),
        ];
        orchestrator.build(&targets).unwrap();

        // Products were compiled by the local runner and verified.
        let ledger = orchestrator.ledger();
        assert!(ledger.has(dir.join("Game.bin")));
        assert!(ledger.has(dir.join("Editor.bin")));

        // Both targets were deployed, in target order.
        assert_eq!(
            *deploys.lock().unwrap(),
            vec![dir.join("Game.deploy"), dir.join("Editor.deploy")]
        );

        // Fragments were consumed: snapshots beside the task file, the
        // originals deleted.
        assert!(!dir.join(format!("Game{FRAGMENT_SUFFIX}")).exists());
        assert!(
            dir.join(format!("combined.buildset.json.Game{FRAGMENT_SUFFIX}"))
                .exists()
        );
    }

    #[test]
    fn ledger_survives_across_builds() {
        let (_guard, dir) = fixture();

        let orchestrator = Orchestrator::config()
            .task_file(dir.join("combined.buildset.json"))
            .working_dir(&dir)
            .finish(ScriptedDriver::new(&dir));

        orchestrator
            .build(&[TargetSpec::new("Game", "Linux", "Development")])
            .unwrap();
        orchestrator
            .build(&[TargetSpec::new("Editor", "Linux", "Development")])
            .unwrap();

        let products = orchestrator.ledger().all();
        assert_eq!(products.len(), 2);
        assert!(orchestrator.ledger().has(dir.join("Game.bin")));
        assert!(orchestrator.ledger().has(dir.join("Editor.bin")));
    }

    #[test]
    fn driver_failure_is_fatal_and_names_the_target() {
        struct BrokenDriver;

        impl Driver for BrokenDriver {
            fn prepare(&self, _spec: &TargetSpec) -> anyhow::Result<TargetGraph> {
                anyhow::bail!("manifest generation failed")
            }

            fn deploy(&self, _file: &Utf8Path) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let (_guard, dir) = fixture();
        let orchestrator = Orchestrator::config()
            .task_file(dir.join("combined.buildset.json"))
            .working_dir(&dir)
            .finish(BrokenDriver);

        let result = orchestrator.build(&[TargetSpec::new("Game", "Linux", "Development")]);
        assert!(matches!(
            result,
            Err(YosegiError::Driver(ref caption, _)) if caption == "Game-Linux-Development"
        ));
        assert!(orchestrator.ledger().is_empty());
    }
}
