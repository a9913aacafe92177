use std::path::PathBuf;
use std::process::ExitCode;

/// Categories of application errors that can be matched on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppErrorKind {
    /// Argument validation errors
    ArgValidation,
    /// Configuration file reading or parsing errors
    Config,
    /// A checkout or packaging request failed
    Pipeline,
    /// Writing a result out of the store failed
    Materialize,
    /// Output formatting errors
    Output,
    /// General IO errors
    IO,
}

/// Internal error type that contains all application error variants.
#[derive(Debug, thiserror::Error)]
pub enum AppErrorInner {
    #[error("Argument error: {0}")]
    ArgValidation(String),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("Failed to load configuration file {}: {err}", path.display())]
    Config {
        path: PathBuf,
        err: source_checkout::ConfigError,
    },
    #[error("{} failed: {err}", err.stage())]
    Pipeline { err: source_checkout::Error },
    #[error("failed to write {} to {}: {err}", digest, path.display())]
    Materialize {
        digest: source_checkout::Digest,
        path: PathBuf,
        err: source_checkout::StoreError,
    },
    #[error("failed to format output: {0}")]
    Output(String),
}

/// The main application-level error type. The kind is kept beside the inner error so that the
/// exit code can be derived without inspecting the message.
///
/// This type uses the newtype pattern to wrap a boxed inner error, reducing stack size.
#[derive(Debug)]
pub struct AppError(Box<AppErrorInner>, AppErrorKind);

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl AppError {
    /// Create a new AppError with the given inner error and kind
    pub fn new(inner: AppErrorInner, kind: AppErrorKind) -> Self {
        Self(Box::new(inner), kind)
    }

    /// Get the error kind for pattern matching
    pub fn error_kind(&self) -> &AppErrorKind {
        &self.1
    }

    /// Create an argument validation error
    pub fn arg_validation(msg: String) -> Self {
        Self::new(AppErrorInner::ArgValidation(msg), AppErrorKind::ArgValidation)
    }

    /// Create a configuration error
    pub fn config(path: PathBuf, err: source_checkout::ConfigError) -> Self {
        Self::new(AppErrorInner::Config { path, err }, AppErrorKind::Config)
    }

    /// Create a materialise error
    pub fn materialize(
        digest: source_checkout::Digest,
        path: PathBuf,
        err: source_checkout::StoreError,
    ) -> Self {
        Self::new(
            AppErrorInner::Materialize { digest, path, err },
            AppErrorKind::Materialize,
        )
    }

    /// Create an output formatting error
    pub fn output(msg: String) -> Self {
        Self::new(AppErrorInner::Output(msg), AppErrorKind::Output)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::new(AppErrorInner::IO(err), AppErrorKind::IO)
    }
}

impl From<source_checkout::Error> for AppError {
    fn from(err: source_checkout::Error) -> Self {
        Self::new(AppErrorInner::Pipeline { err }, AppErrorKind::Pipeline)
    }
}

impl From<AppError> for ExitCode {
    fn from(error: AppError) -> Self {
        ExitCode::from(match error.error_kind() {
            AppErrorKind::Pipeline => 1,
            AppErrorKind::ArgValidation | AppErrorKind::Config => 2,
            _ => 3,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_name_their_stage() {
        let err = AppError::from(source_checkout::Error::FetchFailed {
            origin: "https://example.com/a.git".to_string(),
            stderr: String::new(),
        });
        assert_eq!(err.error_kind(), &AppErrorKind::Pipeline);
        assert!(err.to_string().starts_with("repository fetch failed"));
    }

    #[test]
    fn io_errors_are_their_own_kind() {
        let err = AppError::from(std::io::Error::other("disk full"));
        assert_eq!(err.error_kind(), &AppErrorKind::IO);
    }
}
