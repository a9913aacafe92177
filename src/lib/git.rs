//! Shallow clones and revision checkouts driven through a resolved `git` binary.

use std::path::Path;

use tracing::{debug, instrument};

use crate::binary::{BinaryPathRequest, BinaryPathTest, ResolvedBinary, SearchPath};
use crate::digest::Digest;
use crate::error::Error;
use crate::process::{Process, ProcessError, ProcessExecutor};

/// Directory, relative to the sandbox root, that the shallow clone is written into.
pub const CLONE_DIR: &str = "known_clone";

/// The request used to find `git`: the first `git` on the search path that answers `--version`.
pub fn git_binary_request(search_path: SearchPath) -> BinaryPathRequest {
    BinaryPathRequest::new("git", search_path, BinaryPathTest::version())
}

/// A validated `git` executable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Git(ResolvedBinary);

impl Git {
    pub fn new(binary: ResolvedBinary) -> Self {
        Self(binary)
    }

    pub fn path(&self) -> &Path {
        self.0.path()
    }

    pub fn binary(&self) -> &ResolvedBinary {
        &self.0
    }

    /// What `git --version` reported.
    pub fn fingerprint(&self) -> &str {
        &self.0.fingerprint
    }

    fn program(&self) -> String {
        self.0.path.display().to_string()
    }

    /// The shallow clone of `repo` into [`CLONE_DIR`].
    pub fn clone_process(&self, repo: &RepositoryRequest) -> Process {
        Process::new(
            [
                self.program(),
                "clone".to_string(),
                "--depth=1".to_string(),
                repo.origin.clone(),
                CLONE_DIR.to_string(),
            ],
            format!("git clone {}", repo.origin),
        )
        .output_directories([CLONE_DIR])
        .env("GIT_TERMINAL_PROMPT", "0")
    }

    /// The checkout of `rev` inside a sandbox seeded with the fetched clone.
    pub fn checkout_process(&self, fetched: &RepositoryResult, rev: &RevisionSpec) -> Process {
        Process::new(
            [
                self.program(),
                "checkout".to_string(),
                // A spec starting with `-` is still a revision
                "--end-of-options".to_string(),
                rev.spec.clone(),
            ],
            format!("git checkout {}", rev.spec),
        )
        .input_digest(fetched.digest.clone())
        .working_directory(CLONE_DIR)
        .output_directories(["."])
        .env("GIT_TERMINAL_PROMPT", "0")
    }
}

/// Intent to fetch a remote repository. The origin is passed to `git` untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct RepositoryRequest {
    pub origin: String,
}

impl RepositoryRequest {
    pub fn new<S: Into<String>>(origin: S) -> Self {
        Self {
            origin: origin.into(),
        }
    }
}

/// The shallow clone of a [`RepositoryRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RepositoryResult {
    pub digest: Digest,
}

/// A tag, branch or commit. Not validated until the checkout runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RevisionSpec {
    pub spec: String,
}

impl RevisionSpec {
    pub fn new<S: Into<String>>(spec: S) -> Self {
        Self { spec: spec.into() }
    }
}

/// A revision of a repository. Equal requests are the same request, wherever they come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct CheckoutRequest {
    pub repo: RepositoryRequest,
    pub rev: RevisionSpec,
}

impl CheckoutRequest {
    pub fn new<O: Into<String>, R: Into<String>>(origin: O, rev: R) -> Self {
        Self {
            repo: RepositoryRequest::new(origin),
            rev: RevisionSpec::new(rev),
        }
    }
}

impl std::fmt::Display for CheckoutRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (rev: {})", self.repo.origin, self.rev.spec)
    }
}

/// The checked-out tree of a [`CheckoutRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CheckoutResult {
    pub digest: Digest,
}

fn stderr_of(err: ProcessError) -> Result<String, Error> {
    match err {
        ProcessError::Failed { stderr, .. } => Ok(stderr),
        other => Err(other.into()),
    }
}

/// Shallow-clone `repo`. A failing clone is reported as [`Error::FetchFailed`].
#[instrument(skip_all, fields(origin = %repo.origin))]
pub async fn clone_repo(
    git: &Git,
    repo: &RepositoryRequest,
    executor: &dyn ProcessExecutor,
) -> Result<RepositoryResult, Error> {
    match executor.run(git.clone_process(repo)).await {
        Ok(output) => {
            debug!(digest = %output.output_digest, "cloned");
            Ok(RepositoryResult {
                digest: output.output_digest,
            })
        }
        Err(err) => Err(Error::FetchFailed {
            origin: repo.origin.clone(),
            stderr: stderr_of(err)?,
        }),
    }
}

/// Check out `checkout.rev` in the already fetched clone. A failing checkout is reported as
/// [`Error::RevisionUnresolvable`]; the clone is never deepened.
#[instrument(skip_all, fields(origin = %checkout.repo.origin, rev = %checkout.rev.spec))]
pub async fn checkout_rev(
    git: &Git,
    checkout: &CheckoutRequest,
    fetched: &RepositoryResult,
    executor: &dyn ProcessExecutor,
) -> Result<CheckoutResult, Error> {
    match executor.run(git.checkout_process(fetched, &checkout.rev)).await {
        Ok(output) => {
            debug!(digest = %output.output_digest, "checked out");
            Ok(CheckoutResult {
                digest: output.output_digest,
            })
        }
        Err(err) => Err(Error::RevisionUnresolvable {
            origin: checkout.repo.origin.clone(),
            revision: checkout.rev.spec.clone(),
            stderr: stderr_of(err)?,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn git() -> Git {
        Git::new(ResolvedBinary {
            name: "git".to_string(),
            path: PathBuf::from("/usr/bin/git"),
            test: BinaryPathTest::version(),
            fingerprint: "git version 2.43.0".to_string(),
        })
    }

    #[test]
    fn clone_is_shallow_into_fixed_directory() {
        let process = git().clone_process(&RepositoryRequest::new("https://example.com/a.git"));
        assert_eq!(
            process.argv,
            vec![
                "/usr/bin/git",
                "clone",
                "--depth=1",
                "https://example.com/a.git",
                "known_clone"
            ]
        );
        assert_eq!(process.output_directories, vec![CLONE_DIR]);
        assert!(process.input_digest.is_empty());
    }

    #[test]
    fn checkout_runs_in_clone_seeded_from_fetch() {
        let fetched = RepositoryResult {
            digest: Digest::of_bytes(b"clone"),
        };
        let process = git().checkout_process(&fetched, &RevisionSpec::new("v1"));
        assert_eq!(
            process.argv,
            vec!["/usr/bin/git", "checkout", "--end-of-options", "v1"]
        );
        assert_eq!(process.input_digest, fetched.digest);
        assert_eq!(process.working_directory.as_deref(), Some(CLONE_DIR));
        assert_eq!(process.output_directories, vec!["."]);
    }

    #[test]
    fn option_like_revision_is_passed_as_a_revision() {
        let fetched = RepositoryResult {
            digest: Digest::of_bytes(b"clone"),
        };
        let process = git().checkout_process(&fetched, &RevisionSpec::new("--orphan=x"));
        assert_eq!(&process.argv[2..], ["--end-of-options", "--orphan=x"]);
    }

    #[test]
    fn equal_requests_are_equal_values() {
        let a = CheckoutRequest::new("https://example.com/a.git", "v1");
        let b = CheckoutRequest {
            repo: RepositoryRequest::new("https://example.com/a.git"),
            rev: RevisionSpec::new("v1"),
        };
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "https://example.com/a.git (rev: v1)");
    }
}
