// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, Level};
use tokio::process::Command;

use crate::fs::RelativePath;
use crate::values::{throw, throw_kind, Failure, ThrowKind};

///
/// Controls how long the result of a Process is memoized in the Graph.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProcessCacheScope {
    // Cached in the Graph until invalidated, regardless of exit code.
    Always,
    // Cached in the Graph until invalidated only if the exit code was 0.
    Successful,
    // Re-run once per Session (more precisely: once per RunId).
    PerSession,
}

///
/// A process to be executed.
///
#[derive(Derivative, Clone, Debug, Eq)]
#[derivative(PartialEq, Hash)]
pub struct Process {
    ///
    /// The arguments to execute.
    ///
    /// The first argument should be an absolute or relative path to the binary to execute.
    ///
    /// No PATH lookup will be performed unless a PATH environment variable is specified.
    ///
    /// No shell expansion will take place.
    ///
    pub argv: Vec<String>,
    ///
    /// The environment variables to set for the execution.
    ///
    /// No other environment variables will be set.
    ///
    pub env: BTreeMap<String, String>,

    ///
    /// A directory relative to the build root to execute the process in. Defaults to the build
    /// root.
    ///
    pub working_directory: Option<RelativePath>,

    pub timeout: Option<Duration>,

    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    pub description: String,

    pub cache_scope: ProcessCacheScope,

    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    pub level: Level,
}

impl Process {
    ///
    /// Constructs a Process with default values for its optional fields.
    ///
    pub fn new(argv: Vec<String>) -> Process {
        Process {
            argv,
            env: BTreeMap::new(),
            working_directory: None,
            timeout: None,
            description: "".to_string(),
            cache_scope: ProcessCacheScope::Successful,
            level: Level::Info,
        }
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Process {
        self.env = env;
        self
    }

    pub fn working_directory(mut self, working_directory: Option<RelativePath>) -> Process {
        self.working_directory = working_directory;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Process {
        self.timeout = timeout;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Process {
        self.description = description.into();
        self
    }

    pub fn cache_scope(mut self, cache_scope: ProcessCacheScope) -> Process {
        self.cache_scope = cache_scope;
        self
    }

    pub fn level(mut self, level: Level) -> Process {
        self.level = level;
        self
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub stdout: Bytes,
    pub stderr: Bytes,
}

///
/// Runs the given Process as a child of this one, in the given build root.
///
/// The child is killed if the returned Future is dropped before it completes, or if the timeout
/// of the Process elapses.
///
pub(crate) async fn run_local(
    process: &Process,
    build_root: &Path,
) -> Result<ProcessResult, Failure> {
    let Some((binary, args)) = process.argv.split_first() else {
        return Err(throw(format!(
            "Process `{}` had an empty argv.",
            process.description
        )));
    };

    let cwd = match process.working_directory {
        Some(ref working_directory) => build_root.join(working_directory),
        None => build_root.to_path_buf(),
    };

    let mut command = Command::new(binary);
    command
        .args(args)
        .env_clear()
        .envs(&process.env)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Cancelling the Node drops the Child, which must then be killed.
        .kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|e| throw(format!("Failed to execute: {}\n\n{e}", process.description)))?;

    let output = match process.timeout {
        Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                debug!("Process {:?} timed out after {timeout:?}", process.argv);
                throw_kind(
                    ThrowKind::Timeout,
                    format!(
                        "Exceeded timeout of {:.1} seconds when executing local process: {}",
                        timeout.as_secs_f64(),
                        process.description
                    ),
                )
            })?,
        None => child.wait_with_output().await,
    }
    .map_err(|e| throw(format!("Failed to wait for {}: {e}", process.description)))?;

    Ok(ProcessResult {
        exit_code: exit_code(&output.status),
        stdout: Bytes::from(output.stdout),
        stderr: Bytes::from(output.stderr),
    })
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    // A process killed by a signal reports the negated signal number.
    status
        .code()
        .or_else(|| status.signal().map(|s| -s))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
