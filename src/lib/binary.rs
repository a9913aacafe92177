//! Locating and validating executables on a search path.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use crate::error::Error;
use crate::process::{Process, ProcessExecutor};

/// An ordered list of directories to search for executables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SearchPath(Vec<PathBuf>);

impl SearchPath {
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self(
            dirs.into_iter()
                .map(Into::into)
                .filter(|p: &PathBuf| !p.as_os_str().is_empty())
                .collect(),
        )
    }

    /// Split a platform search-path string such as the value of `PATH`.
    pub fn parse<S: AsRef<OsStr>>(value: S) -> Self {
        Self::new(std::env::split_paths(value.as_ref()))
    }

    /// Read `PATH` from the process environment. A missing variable gives an empty search path.
    pub fn from_env() -> Self {
        std::env::var_os("PATH")
            .map(Self::parse)
            .unwrap_or_default()
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for SearchPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dirs = self
            .0
            .iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>();
        write!(f, "{}", dirs.join(":"))
    }
}

/// Arguments whose successful execution shows that a candidate binary is usable. The probe must
/// not change anything outside its sandbox, so it is normally a version query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BinaryPathTest {
    pub args: Vec<String>,
}

impl BinaryPathTest {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The `--version` probe.
    pub fn version() -> Self {
        Self::new(["--version"])
    }
}

/// A request to find `binary_name` in `search_path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BinaryPathRequest {
    pub binary_name: String,
    pub search_path: SearchPath,
    pub test: BinaryPathTest,
}

impl BinaryPathRequest {
    pub fn new<S: Into<String>>(binary_name: S, search_path: SearchPath, test: BinaryPathTest) -> Self {
        Self {
            binary_name: binary_name.into(),
            search_path,
            test,
        }
    }

    /// Candidate paths in search order, without duplicates.
    fn candidates(&self) -> impl Iterator<Item = PathBuf> + '_ {
        let mut seen = HashSet::new();
        self.search_path
            .dirs()
            .iter()
            .map(|dir| dir.join(&self.binary_name))
            .filter(move |candidate| seen.insert(candidate.clone()))
    }
}

/// An executable that exists and passed its validation test.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedBinary {
    pub name: String,
    pub path: PathBuf,
    pub test: BinaryPathTest,
    /// Trimmed standard output of the validation test, e.g. `git version 2.43.0`.
    pub fingerprint: String,
}

impl ResolvedBinary {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Find the first candidate in search order that exists and passes the validation test.
///
/// Candidates that don't exist are skipped without running anything. A candidate whose probe
/// fails for any reason is skipped in favour of the next one.
#[instrument(skip_all, fields(binary = %request.binary_name))]
pub async fn resolve_binary(
    request: &BinaryPathRequest,
    executor: &dyn ProcessExecutor,
) -> Result<ResolvedBinary, Error> {
    for candidate in request.candidates() {
        if !candidate.is_file() {
            continue;
        }
        let Some(program) = candidate.to_str() else {
            warn!(candidate = %candidate.display(), "skipping candidate with a non UTF-8 path");
            continue;
        };
        debug!(candidate = program, "probing");
        let argv = std::iter::once(program.to_string()).chain(request.test.args.iter().cloned());
        let probe = Process::new(argv, format!("validate {program}"));
        match executor.run(probe).await {
            Ok(output) => {
                let resolved = ResolvedBinary {
                    name: request.binary_name.clone(),
                    path: candidate.clone(),
                    test: request.test.clone(),
                    fingerprint: output.stdout_lossy(),
                };
                debug!(path = %resolved.path.display(), fingerprint = %resolved.fingerprint, "resolved");
                return Ok(resolved);
            }
            Err(err) => {
                warn!(candidate = program, error = %err, "candidate failed validation");
            }
        }
    }
    Err(Error::BinaryNotFound {
        name: request.binary_name.clone(),
        search_paths: request.search_path.dirs().to_vec(),
    })
}
