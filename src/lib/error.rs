use std::path::PathBuf;

use crate::external::ExternalToolError;
use crate::process::ProcessError;
use crate::store::StoreError;

fn join_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "<empty>".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

/// The main error enum for this crate.
///
/// Errors are `Clone` so that a memoised failure can be handed to every caller waiting on the
/// same request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No search path entry held a usable binary.
    #[error("could not find '{name}' on the search path: {searched}", searched = join_paths(.search_paths))]
    BinaryNotFound {
        name: String,
        search_paths: Vec<PathBuf>,
    },

    /// The shallow clone of `origin` failed.
    #[error("failed to fetch repository '{origin}'\n{stderr}")]
    FetchFailed { origin: String, stderr: String },

    /// The checkout of `revision` failed within the fetched history.
    #[error("failed to check out revision '{revision}' of '{origin}'\n{stderr}")]
    RevisionUnresolvable {
        origin: String,
        revision: String,
        stderr: String,
    },

    /// The external tool packaging step failed.
    #[error("failed to resolve external tool: {0}")]
    ExternalToolResolutionFailed(#[from] ExternalToolError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    /// The pipeline stage at which the error was raised, for user-facing reports.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::BinaryNotFound { .. } => "binary resolution",
            Self::FetchFailed { .. } => "repository fetch",
            Self::RevisionUnresolvable { .. } => "revision checkout",
            Self::ExternalToolResolutionFailed(_) => "external tool packaging",
            Self::Process(_) => "sandbox",
            Self::Store(_) => "content store",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_not_found_lists_searched_entries() {
        let err = Error::BinaryNotFound {
            name: "git".to_string(),
            search_paths: vec![PathBuf::from("/usr/bin"), PathBuf::from("/opt/bin")],
        };
        let message = err.to_string();
        assert!(message.contains("'git'"));
        assert!(message.contains("/usr/bin:/opt/bin"));
        assert_eq!(err.stage(), "binary resolution");
    }

    #[test]
    fn fetch_failure_names_origin_and_diagnostics() {
        let err = Error::FetchFailed {
            origin: "https://example.com/nope.git".to_string(),
            stderr: "fatal: repository not found".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("https://example.com/nope.git"));
        assert!(message.contains("fatal: repository not found"));
    }
}
