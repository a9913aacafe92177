//! Sandboxed execution of external processes.
//!
//! A [`Process`] declares everything an invocation may see and produce: its argument list, an
//! input tree, the directories to capture and its environment. A [`ProcessExecutor`] runs it in
//! an isolated sandbox and returns the captured outputs as a [`Digest`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::digest::Digest;
use crate::store::{Store, StoreError};

/// A single sandboxed invocation of an external program.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Process {
    pub argv: Vec<String>,
    pub input_digest: Digest,
    pub working_directory: Option<String>,
    pub output_directories: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub description: String,
}

impl Process {
    pub fn new<I, S, D>(argv: I, description: D) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        D: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            input_digest: Digest::empty(),
            working_directory: None,
            output_directories: Vec::new(),
            env: BTreeMap::new(),
            description: description.into(),
        }
    }

    /// Seed the sandbox with the tree identified by `digest`.
    pub fn input_digest(mut self, digest: Digest) -> Self {
        self.input_digest = digest;
        self
    }

    /// Run from this directory, relative to the sandbox root.
    pub fn working_directory<S: Into<String>>(mut self, dir: S) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Capture these directories, relative to the sandbox root, once the process succeeds.
    pub fn output_directories<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_directories = dirs.into_iter().map(Into::into).collect();
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The program and arguments joined for diagnostics.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// What a successful invocation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub output_digest: Digest,
}

impl ProcessOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Errors raised when running a [`Process`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    /// The program ran but exited unsuccessfully.
    #[error("'{command}' exited with {status}\n{stderr}", command = .argv.join(" "), status = exit_code(.code))]
    Failed {
        description: String,
        argv: Vec<String>,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("no program given for '{description}'")]
    EmptyArgv { description: String },
    #[error("failed to start '{program}' for '{description}'")]
    Spawn {
        description: String,
        program: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("failed to prepare sandbox for '{description}'")]
    Sandbox {
        description: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("failed to move files in or out of the sandbox for '{description}'")]
    Capture {
        description: String,
        #[source]
        source: StoreError,
    },
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (terminated by signal)".to_string(),
    }
}

/// Runs processes in isolated sandboxes.
///
/// Implementations must not share mutable filesystem state between invocations, and must only
/// report an output digest for processes that exited successfully.
#[async_trait::async_trait]
pub trait ProcessExecutor: Send + Sync {
    async fn run(&self, process: Process) -> Result<ProcessOutput, ProcessError>;
}

/// Runs each process in a fresh temporary directory on the local machine.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    store: Store,
    sandbox_parent: Option<PathBuf>,
}

impl LocalExecutor {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            sandbox_parent: None,
        }
    }

    /// Create sandboxes under `dir` instead of the system temporary directory.
    pub fn with_sandbox_parent<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.sandbox_parent = Some(dir.into());
        self
    }

    fn sandbox(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("source-checkout-");
        match &self.sandbox_parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        }
    }
}

#[async_trait::async_trait]
impl ProcessExecutor for LocalExecutor {
    #[instrument(skip_all, fields(description = %process.description))]
    async fn run(&self, process: Process) -> Result<ProcessOutput, ProcessError> {
        let description = process.description.clone();
        let (program, args) = process
            .argv
            .split_first()
            .ok_or_else(|| ProcessError::EmptyArgv {
                description: description.clone(),
            })?;

        let sandbox = self.sandbox().map_err(|e| ProcessError::Sandbox {
            description: description.clone(),
            source: Arc::new(e),
        })?;
        let capture_error = |source| ProcessError::Capture {
            description: description.clone(),
            source,
        };
        self.store
            .materialize(&process.input_digest, sandbox.path())
            .map_err(capture_error)?;

        let cwd = match &process.working_directory {
            Some(dir) => sandbox.path().join(dir),
            None => sandbox.path().to_path_buf(),
        };
        debug!(command = %process.command_line(), cwd = %cwd.display(), "spawn");
        let output = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&cwd)
            .env_clear()
            .envs(&process.env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProcessError::Spawn {
                description: description.clone(),
                program: program.clone(),
                source: Arc::new(e),
            })?;

        if !output.status.success() {
            return Err(ProcessError::Failed {
                description: description.clone(),
                argv: process.argv.clone(),
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let output_digest = if process.output_directories.is_empty() {
            Digest::empty()
        } else {
            self.store
                .snapshot(sandbox.path(), &process.output_directories)
                .map_err(capture_error)?
        };
        Ok(ProcessOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            output_digest,
        })
    }
}
