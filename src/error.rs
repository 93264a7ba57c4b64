use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum YosegiError {
    #[error("Driver failed for target '{0}'.\n{1}")]
    Driver(String, #[source] anyhow::Error),

    #[error("Error while merging target graphs.\n{0}")]
    Merge(#[from] MergeError),

    #[error("Error while executing the merged graph.\n{0}")]
    Exec(#[from] ExecError),

    #[error("Error while clearing exported fragments.\n{0}")]
    ClearExported(#[from] ClearExportedError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors produced while decoding a single fragment file.
#[derive(Debug, Error)]
pub enum FragmentError {
    #[error("Couldn't read the fragment file.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't decode the fragment document.\n{0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ClearExportedError {
    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't delete stale fragment.\n{0}")]
    FileSystem(#[from] std::io::Error),
}

/// Fatal merge failures. A partial merge is never handed to an executor;
/// any of these aborts the whole build call.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Fragment '{path}': {source}")]
    Fragment {
        path: Utf8PathBuf,
        source: FragmentError,
    },

    #[error("Task '{task}' in fragment '{fragment}' depends on unknown task '{name}'")]
    UnresolvedDependency {
        name: String,
        task: String,
        fragment: Utf8PathBuf,
    },

    #[error("Task '{task}' in fragment '{fragment}' references undeclared tool '{tool}'")]
    UnknownTool {
        tool: String,
        task: String,
        fragment: Utf8PathBuf,
    },

    #[error("Target '{caption}' declares task '{name}' more than once")]
    DuplicateTask { name: String, caption: String },

    #[error("Target '{caption}' redeclares tool '{name}' with a different invocation")]
    ToolRedeclared { name: String, caption: String },

    #[error("Tool '{tool}' is bound by both '{first}' and '{second}' in fragment '{fragment}'")]
    ToolBoundTwice {
        tool: String,
        first: String,
        second: String,
        fragment: Utf8PathBuf,
    },

    #[error("Tool '{tool}' referenced by task '{task}' was never bound to a task")]
    ToolWithoutTask { tool: String, task: String },
}

/// Fatal execution failures. Transient distributed-executor failures are
/// absorbed by the retry loop and never surface here directly; once the
/// budgets are spent they escalate to [`ExecError::Executor`].
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Build script '{path}' failed with exit code {code}")]
    Script { path: Utf8PathBuf, code: i32 },

    #[error("No executor is available; configure a distributed executor or the local runner")]
    NoExecutor,

    #[error("Executor failed with exit code {code}.\n{log}")]
    Executor { code: i32, log: String },

    #[error("{failed} task(s) failed in the local runner")]
    Local { failed: usize },

    #[error("Task document '{path}' is invalid: {reason}")]
    Document { path: Utf8PathBuf, reason: String },

    #[error("The build was cancelled")]
    Cancelled,

    #[error("Deploy step failed for '{path}'.\n{source}")]
    Deploy {
        path: Utf8PathBuf,
        source: anyhow::Error,
    },

    #[error("Build product '{path}' was in the manifest but was not produced")]
    ProductMissing { path: Utf8PathBuf },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Refusing to register missing build product '{0}'")]
    Missing(Utf8PathBuf),
}
