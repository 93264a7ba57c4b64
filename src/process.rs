//! Subprocess primitive: run a tool, capture its output, get an exit code.
//!
//! The single entry point is [`run`], a cancellable blocking call. Instead
//! of exposing a poll loop to callers it returns a completed-or-cancelled
//! union; cancellation kills the child and reaps it before returning.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use camino::Utf8Path;

/// Cooperative cancellation flag shared between the caller and any number
/// of running builds. Cloning hands out another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Every in-flight [`run`] call holding a clone
    /// of this token will kill its child and return `Cancelled`.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// What a finished subprocess left behind.
#[derive(Debug)]
pub struct CapturedRun {
    /// Exit code; `-1` when the process died to a signal.
    pub code: i32,
    /// Combined stdout and stderr text.
    pub output: String,
}

impl CapturedRun {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Result of a cancellable subprocess run.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(CapturedRun),
    Cancelled,
}

/// How often a running child is checked against the cancellation flag.
const REAP_INTERVAL: Duration = Duration::from_millis(50);

/// Spawn `program` with `args` in `working_dir`, apply `envs` on top of
/// the inherited environment, and block until it exits or `cancel` fires.
pub fn run(
    program: &Utf8Path,
    args: &[String],
    working_dir: &Utf8Path,
    envs: &[(String, String)],
    cancel: &CancelToken,
) -> std::io::Result<RunOutcome> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // Drain both pipes on their own threads so the child can't dead-lock
    // on a full pipe while we wait on it.
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let status = loop {
        if cancel.is_cancelled() {
            child.kill().ok();
            child.wait().ok();
            return Ok(RunOutcome::Cancelled);
        }

        match child.try_wait()? {
            Some(status) => break status,
            None => thread::sleep(REAP_INTERVAL),
        }
    };

    let mut output = stdout.map(join_reader).unwrap_or_default();
    let err = stderr.map(join_reader).unwrap_or_default();
    if !err.is_empty() {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(&err);
    }

    Ok(RunOutcome::Completed(CapturedRun {
        code: status.code().unwrap_or(-1),
        output,
    }))
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();
        pipe.read_to_string(&mut buffer).ok();
        buffer
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}
