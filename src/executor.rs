//! The execution coordinator.
//!
//! Takes a merged graph and the target graphs it was built from, then
//! drives the build to completion: pre-build scripts, serialization,
//! executor submission with bounded retries, deploy steps, post-build
//! scripts, and product verification into the ledger. Everything here runs
//! sequentially on the calling thread; the parallelism lives inside the
//! executor subprocess, which is opaque to this module.

use std::fs;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ExecError;
use crate::graph::MergedGraph;
use crate::ledger::Ledger;
use crate::process::{self, CancelToken, RunOutcome};
#[cfg(feature = "local")]
use crate::runner::LocalExecutor;
use crate::target::{Driver, Manifest, TargetGraph};

/// How a distributed-executor failure is told apart from a transient
/// connection problem.
///
/// This mirrors one specific executor's observed behavior: certain exit
/// codes, combined with output that never reached a real per-project build
/// attempt, mean the submission never connected and can be retried
/// verbatim. A different backend replaces this value rather than the retry
/// loop.
#[derive(Debug, Clone)]
pub struct TransientSignature {
    /// Exit codes that may indicate a connection/timeout failure.
    pub exit_codes: Vec<i32>,
    /// Substring proving a real per-project build attempt happened; its
    /// presence makes the failure permanent.
    pub attempt_marker: String,
}

impl Default for TransientSignature {
    fn default() -> Self {
        Self {
            exit_codes: vec![2, 4],
            attempt_marker: "------Project:".to_string(),
        }
    }
}

impl TransientSignature {
    pub fn classifies(&self, code: i32, output: &str) -> bool {
        code != 0 && self.exit_codes.contains(&code) && !output.contains(&self.attempt_marker)
    }
}

/// The external distributed build service, invoked as a subprocess against
/// the serialized task document.
#[derive(Debug, Clone)]
pub struct DistributedExecutor {
    pub program: Utf8PathBuf,
    pub max_cpus: usize,
    pub stop_on_errors: bool,
    /// Budget for resubmitting after transient connection failures.
    pub connection_retries: u32,
    /// Wait before the first resubmission.
    pub retry_wait: Duration,
    /// Wait before every later resubmission.
    pub retry_wait_long: Duration,
    pub transient: TransientSignature,
}

impl DistributedExecutor {
    pub fn new(program: impl AsRef<Utf8Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            max_cpus: thread::available_parallelism().map_or(4, |n| n.get()),
            stop_on_errors: false,
            connection_retries: 4,
            retry_wait: Duration::from_secs(5),
            retry_wait_long: Duration::from_secs(60),
            transient: TransientSignature::default(),
        }
    }

    fn args(&self, task_file: &Utf8Path) -> Vec<String> {
        let mut args = vec![
            task_file.to_string(),
            "/Rebuild".to_string(),
            format!("/MaxCPUS={}", self.max_cpus),
        ];
        if self.stop_on_errors {
            args.push("/StopOnErrors".to_string());
        }
        args
    }
}

/// Options for one execution pass.
#[derive(Debug)]
pub struct ExecOptions {
    /// Where the merged graph is serialized for the executor.
    pub task_file: Utf8PathBuf,
    /// The project's compilation working directory; the executor and all
    /// scripts run here.
    pub working_dir: Utf8PathBuf,
    /// Annotate tool output prefixes with a combined progress fraction.
    pub show_progress: bool,
    /// Allow one whole-build retry after a permanent executor failure.
    pub retry_failed: bool,
    pub distributed: Option<DistributedExecutor>,
    #[cfg(feature = "local")]
    pub local: Option<LocalExecutor>,
    pub cancel: CancelToken,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            task_file: "yosegi.buildset.json".into(),
            working_dir: ".".into(),
            show_progress: false,
            retry_failed: false,
            distributed: None,
            #[cfg(feature = "local")]
            local: Some(LocalExecutor::default()),
            cancel: CancelToken::new(),
        }
    }
}

/// Execute a merged graph and settle every target's obligations.
///
/// An empty graph is a success that skips straight to the deploy step;
/// this covers incremental builds with nothing to compile and targets the
/// driver compiled directly. Any failure aborts the whole call before the
/// ledger is touched.
pub fn execute(
    mut graph: MergedGraph,
    targets: &[TargetGraph],
    driver: &dyn Driver,
    ledger: &Ledger,
    opts: &ExecOptions,
) -> Result<(), ExecError> {
    run_scripts(targets, opts, "pre-build", |manifest| {
        &manifest.pre_build_scripts
    })?;

    if !graph.is_empty() {
        if opts.show_progress {
            graph.annotate_progress();
        }

        graph.write(&opts.task_file)?;
        tracing::info!(
            "serialized {} task(s) across {} environment(s) to {}",
            graph.task_count(),
            graph.environments.len(),
            opts.task_file,
        );

        if let Some(executor) = &opts.distributed {
            run_distributed(executor, targets, opts)?;
        } else {
            run_local(opts)?;
        }
    } else {
        tracing::info!("incremental build, no tasks produced, skipping executor");
    }

    deploy(targets, driver)?;
    run_scripts(targets, opts, "post-build", |manifest| {
        &manifest.post_build_scripts
    })?;
    verify(targets, ledger)?;

    Ok(())
}

#[cfg(feature = "local")]
fn run_local(opts: &ExecOptions) -> Result<(), ExecError> {
    match &opts.local {
        Some(runner) => runner.execute(&opts.task_file, &opts.cancel),
        None => Err(ExecError::NoExecutor),
    }
}

#[cfg(not(feature = "local"))]
fn run_local(_opts: &ExecOptions) -> Result<(), ExecError> {
    Err(ExecError::NoExecutor)
}

enum Submission {
    Success,
    Failed { code: i32, log: String },
}

/// The outer retry loop: one whole-build retry when the caller enabled it,
/// with every declared build product deleted after each failed attempt so
/// the next run starts clean.
fn run_distributed(
    executor: &DistributedExecutor,
    targets: &[TargetGraph],
    opts: &ExecOptions,
) -> Result<(), ExecError> {
    let attempts = if opts.retry_failed { 2 } else { 1 };
    let args = executor.args(&opts.task_file);

    let mut attempt = 0;
    loop {
        attempt += 1;

        match submit(executor, &args, opts)? {
            Submission::Success => return Ok(()),
            Submission::Failed { code, log } => {
                tracing::warn!(
                    "{} failed on try {} (exit code {}), deleting products to force a rebuild",
                    executor.program,
                    attempt,
                    code,
                );
                for target in targets {
                    delete_build_products(&target.manifest);
                }

                if attempt >= attempts {
                    return Err(ExecError::Executor { code, log });
                }
            }
        }
    }
}

/// The inner connection-retry loop: transiently-classified failures
/// resubmit the very same task document until the budget runs out.
fn submit(
    executor: &DistributedExecutor,
    args: &[String],
    opts: &ExecOptions,
) -> Result<Submission, ExecError> {
    let mut budget = executor.connection_retries;
    let mut waited = false;

    loop {
        tracing::info!("running {} {}", executor.program, args.join(" "));
        let outcome = process::run(
            &executor.program,
            args,
            &opts.working_dir,
            &[],
            &opts.cancel,
        )?;

        let run = match outcome {
            RunOutcome::Cancelled => return Err(ExecError::Cancelled),
            RunOutcome::Completed(run) => run,
        };

        if run.success() {
            tracing::info!("{} done", executor.program);
            return Ok(Submission::Success);
        }

        if budget > 0 && executor.transient.classifies(run.code, &run.output) {
            tracing::warn!(
                "{} failure on the local connection timeout (exit code {}), resubmitting",
                executor.program,
                run.code,
            );
            thread::sleep(if waited {
                executor.retry_wait_long
            } else {
                executor.retry_wait
            });
            waited = true;
            budget -= 1;
            continue;
        }

        return Ok(Submission::Failed {
            code: run.code,
            log: tail(&run.output),
        });
    }
}

fn delete_build_products(manifest: &Manifest) {
    for product in &manifest.build_products {
        if product.exists() {
            if let Err(err) = fs::remove_file(product) {
                tracing::warn!("couldn't delete build product {}: {}", product, err);
            }
        }
    }
}

fn run_scripts<'a>(
    targets: &'a [TargetGraph],
    opts: &ExecOptions,
    phase: &str,
    select: impl Fn(&'a Manifest) -> &'a [Utf8PathBuf],
) -> Result<(), ExecError> {
    for target in targets {
        for script in select(&target.manifest) {
            tracing::info!("running {phase} script {script} for {}", target.caption);

            let outcome = process::run(script, &[], &opts.working_dir, &[], &opts.cancel)?;
            match outcome {
                RunOutcome::Cancelled => return Err(ExecError::Cancelled),
                RunOutcome::Completed(run) if !run.success() => {
                    return Err(ExecError::Script {
                        path: script.clone(),
                        code: run.code,
                    });
                }
                RunOutcome::Completed(_) => {}
            }
        }
    }

    Ok(())
}

fn deploy(targets: &[TargetGraph], driver: &dyn Driver) -> Result<(), ExecError> {
    for target in targets {
        if target.skips_link {
            continue;
        }

        for file in &target.manifest.deploy_target_files {
            tracing::info!("deploying {} for {}", file, target.caption);
            driver.deploy(file).map_err(|source| ExecError::Deploy {
                path: file.clone(),
                source,
            })?;
        }
    }

    Ok(())
}

fn verify(targets: &[TargetGraph], ledger: &Ledger) -> Result<(), ExecError> {
    let mut verified = 0;

    for target in targets {
        for product in &target.manifest.build_products {
            if !product.exists() {
                return Err(ExecError::ProductMissing {
                    path: product.clone(),
                });
            }
            ledger.add(product)?;
            verified += 1;
        }

        for library in &target.manifest.library_build_products {
            ledger.add_library(library);
        }
    }

    tracing::info!("verified {} build product(s)", verified);
    Ok(())
}

/// Keep executor logs in errors readable; the full output went to the log
/// stream already.
fn tail(output: &str) -> String {
    const LIMIT: usize = 4000;
    if output.len() <= LIMIT {
        return output.to_string();
    }

    let cut = output.len() - LIMIT;
    let start = (cut..output.len())
        .find(|&i| output.is_char_boundary(i))
        .unwrap_or(cut);
    format!("[...]\n{}", &output[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;

    use crate::target::TargetSpec;

    struct FakeDriver {
        deployed: Mutex<Vec<Utf8PathBuf>>,
    }

    impl FakeDriver {
        fn new() -> Self {
            Self {
                deployed: Mutex::new(Vec::new()),
            }
        }
    }

    impl Driver for FakeDriver {
        fn prepare(&self, _spec: &TargetSpec) -> anyhow::Result<TargetGraph> {
            anyhow::bail!("not used in these tests")
        }

        fn deploy(&self, file: &Utf8Path) -> anyhow::Result<()> {
            self.deployed.lock().unwrap().push(file.to_owned());
            Ok(())
        }
    }

    struct Fixture {
        _guard: tempfile::TempDir,
        dir: Utf8PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let guard = tempfile::tempdir().unwrap();
            let dir = Utf8Path::from_path(guard.path()).unwrap().to_path_buf();
            Self { _guard: guard, dir }
        }

        fn file(&self, name: &str, contents: &str) -> Utf8PathBuf {
            let path = self.dir.join(name);
            fs::write(&path, contents).unwrap();
            path
        }

        fn script(&self, name: &str, body: &str) -> Utf8PathBuf {
            let path = self.file(name, &format!("#!/bin/sh\n{body}\n"));
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn opts(&self) -> ExecOptions {
            ExecOptions {
                task_file: self.dir.join("combined.buildset.json"),
                working_dir: self.dir.clone(),
                distributed: None,
                #[cfg(feature = "local")]
                local: None,
                ..ExecOptions::default()
            }
        }

        fn executor(&self, body: &str) -> DistributedExecutor {
            DistributedExecutor {
                connection_retries: 2,
                retry_wait: Duration::ZERO,
                retry_wait_long: Duration::ZERO,
                ..DistributedExecutor::new(self.script("fake-executor.sh", body))
            }
        }
    }

    fn target(fx: &Fixture, name: &str, manifest: Manifest) -> TargetGraph {
        TargetGraph::new(TargetSpec::new(name, "Win64", "Development"), manifest)
    }

    fn one_tool_graph() -> MergedGraph {
        serde_json::from_str(
            r#"{
                "FormatVersion": 1,
                "Environments": [{
                    "Name": "Env_0",
                    "Variables": [],
                    "Tools": [{
                        "Name": "Tool0_j0", "Path": "/opt/cc", "Params": "-c a.cpp",
                        "AllowRemote": true, "OutputFileMasks": "a.o",
                        "SkipIfProjectFailed": false, "GroupPrefix": "** For T"
                    }],
                    "Project": {
                        "Name": "Env_0", "Env": "Env_0",
                        "Tasks": [{
                            "Name": "Action0_j0", "Tool": "Tool0_j0",
                            "SourceFile": "a.cpp", "WorkingDir": "/src",
                            "SkipIfProjectFailed": false
                        }]
                    }
                }]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn transient_signature_classification() {
        let signature = TransientSignature::default();
        assert!(signature.classifies(2, "could not connect"));
        assert!(signature.classifies(4, ""));
        assert!(!signature.classifies(2, "------Project: Game compiled"));
        assert!(!signature.classifies(1, ""));
        assert!(!signature.classifies(0, ""));
    }

    #[test]
    fn empty_graph_short_circuits_but_settles_obligations() {
        let fx = Fixture::new();
        let product = fx.file("app.exe", "bin");
        let deploy_file = fx.file("deploy.json", "{}");

        let manifest = Manifest {
            build_products: vec![product.clone()],
            library_build_products: vec![fx.dir.join("lib.a")],
            deploy_target_files: vec![deploy_file.clone()],
            ..Manifest::default()
        };
        let targets = vec![target(&fx, "Game", manifest)];

        let driver = FakeDriver::new();
        let ledger = Ledger::new();
        // No executor configured at all: an empty graph must still succeed.
        execute(MergedGraph::new(), &targets, &driver, &ledger, &fx.opts()).unwrap();

        assert_eq!(*driver.deployed.lock().unwrap(), vec![deploy_file]);
        assert!(ledger.has(&product));
        assert_eq!(ledger.libraries().len(), 1);
        assert!(!fx.opts().task_file.exists());
    }

    #[test]
    fn non_empty_graph_without_executors_is_a_configuration_error() {
        let fx = Fixture::new();
        let targets = vec![target(&fx, "Game", Manifest::default())];

        let result = execute(
            one_tool_graph(),
            &targets,
            &FakeDriver::new(),
            &Ledger::new(),
            &fx.opts(),
        );
        assert!(matches!(result, Err(ExecError::NoExecutor)));
    }

    #[test]
    fn skips_link_suppresses_deploy() {
        let fx = Fixture::new();
        let deploy_file = fx.file("deploy.json", "{}");
        let manifest = Manifest {
            deploy_target_files: vec![deploy_file],
            ..Manifest::default()
        };
        let targets =
            vec![target(&fx, "Game", manifest).with_skips_link(true)];

        let driver = FakeDriver::new();
        execute(
            MergedGraph::new(),
            &targets,
            &driver,
            &Ledger::new(),
            &fx.opts(),
        )
        .unwrap();

        assert!(driver.deployed.lock().unwrap().is_empty());
    }

    #[test]
    fn failing_pre_build_script_aborts_before_anything_else() {
        let fx = Fixture::new();
        let script = fx.script("pre.sh", "exit 7");
        let deploy_file = fx.file("deploy.json", "{}");

        let manifest = Manifest {
            pre_build_scripts: vec![script.clone()],
            deploy_target_files: vec![deploy_file],
            ..Manifest::default()
        };
        let targets = vec![target(&fx, "Game", manifest)];

        let driver = FakeDriver::new();
        let result = execute(
            MergedGraph::new(),
            &targets,
            &driver,
            &Ledger::new(),
            &fx.opts(),
        );

        assert!(matches!(
            result,
            Err(ExecError::Script { ref path, code: 7 }) if *path == script
        ));
        assert!(driver.deployed.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_product_after_success_is_fatal() {
        let fx = Fixture::new();
        let manifest = Manifest {
            build_products: vec![fx.dir.join("never-made.exe")],
            ..Manifest::default()
        };
        let targets = vec![target(&fx, "Game", manifest)];

        let ledger = Ledger::new();
        let result = execute(
            MergedGraph::new(),
            &targets,
            &FakeDriver::new(),
            &ledger,
            &fx.opts(),
        );

        assert!(matches!(result, Err(ExecError::ProductMissing { .. })));
        assert!(ledger.is_empty());
    }

    #[test]
    fn distributed_success_registers_products() {
        let fx = Fixture::new();
        let product = fx.file("app.exe", "bin");
        let manifest = Manifest {
            build_products: vec![product.clone()],
            ..Manifest::default()
        };
        let targets = vec![target(&fx, "Game", manifest)];

        let mut opts = fx.opts();
        opts.distributed = Some(fx.executor("exit 0"));

        let ledger = Ledger::new();
        execute(one_tool_graph(), &targets, &FakeDriver::new(), &ledger, &opts).unwrap();

        assert!(ledger.has(&product));
        assert!(opts.task_file.exists());
    }

    #[test]
    fn permanent_failure_deletes_products_and_propagates() {
        let fx = Fixture::new();
        let product = fx.file("app.exe", "bin");
        let manifest = Manifest {
            build_products: vec![product.clone()],
            ..Manifest::default()
        };
        let targets = vec![target(&fx, "Game", manifest)];

        let mut opts = fx.opts();
        // Exit code 5 is not in the transient set: no resubmission.
        opts.distributed = Some(fx.executor("exit 5"));

        let result = execute(
            one_tool_graph(),
            &targets,
            &FakeDriver::new(),
            &Ledger::new(),
            &opts,
        );

        assert!(matches!(result, Err(ExecError::Executor { code: 5, .. })));
        assert!(!product.exists());
    }

    #[test]
    fn retry_exhaustion_deletes_every_declared_product() {
        let fx = Fixture::new();
        let product_a = fx.file("game.exe", "bin");
        let product_b = fx.file("editor.exe", "bin");

        let targets = vec![
            target(
                &fx,
                "Game",
                Manifest {
                    build_products: vec![product_a.clone()],
                    ..Manifest::default()
                },
            ),
            target(
                &fx,
                "Editor",
                Manifest {
                    build_products: vec![product_b.clone()],
                    ..Manifest::default()
                },
            ),
        ];

        // Counts invocations, always exits with a transient-classified
        // code and no per-project marker in the output.
        let counter = fx.dir.join("count");
        let mut opts = fx.opts();
        opts.retry_failed = true;
        opts.distributed = Some(fx.executor(&format!(
            "echo . >> {counter}\nexit 2"
        )));

        let result = execute(
            one_tool_graph(),
            &targets,
            &FakeDriver::new(),
            &Ledger::new(),
            &opts,
        );

        assert!(matches!(result, Err(ExecError::Executor { code: 2, .. })));
        assert!(!product_a.exists());
        assert!(!product_b.exists());

        // 2 outer attempts, each with 1 + connection_retries submissions.
        let invocations = fs::read_to_string(&counter).unwrap().lines().count();
        assert_eq!(invocations, 2 * 3);
    }

    #[test]
    fn executor_receives_the_documented_arguments() {
        let fx = Fixture::new();
        let executor = DistributedExecutor {
            max_cpus: 16,
            stop_on_errors: true,
            ..DistributedExecutor::new("/opt/executor")
        };

        let args = executor.args(Utf8Path::new("/tmp/set.json"));
        assert_eq!(
            args,
            vec!["/tmp/set.json", "/Rebuild", "/MaxCPUS=16", "/StopOnErrors"]
        );
    }

    #[test]
    fn log_tail_is_bounded() {
        let long = "x".repeat(10_000);
        let tailed = tail(&long);
        assert!(tailed.len() < 5000);
        assert!(tailed.starts_with("[...]"));
        assert_eq!(tail("short"), "short");
    }
}
