//! The request pipeline: binary resolution, shallow clone and revision checkout, plus download
//! and unpacking of prebuilt tool archives.
//!
//! Every stage is memoised by request value. Equal requests made concurrently share one
//! in-flight computation and observe the same result, including the same error.
//!
//! Successful clones and checkouts are also recorded in the store's action cache, keyed by the
//! request and the `git` that served it, so a later pipeline on the same store returns the same
//! digest without running `git` again.

use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

use crate::binary::{SearchPath, resolve_binary};
use crate::digest::Digest;
use crate::error::Error;
use crate::external::{
    DownloadedExternalTool, Downloader, ExternalTool, ExternalToolError, ExternalToolRequest,
    HttpDownloader, PackagedTool, Platform,
};
use crate::git::{
    self, CheckoutRequest, CheckoutResult, Git, RepositoryRequest, RepositoryResult,
    git_binary_request,
};
use crate::memo::Memo;
use crate::process::{LocalExecutor, ProcessExecutor};
use crate::source::SourceToolRequest;
use crate::store::Store;

fn report<T>(result: &Result<T, Error>) {
    if let Err(err) = result {
        warn!(stage = "failed", failed_at = err.stage(), error = %err);
    }
}

/// The work recorded in the store's action cache.
#[derive(Debug, serde::Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Action<'a> {
    Clone {
        git: &'a str,
        request: &'a RepositoryRequest,
    },
    Checkout {
        git: &'a str,
        request: &'a CheckoutRequest,
        input: &'a Digest,
    },
}

/// Runs checkout and packaging requests against one store.
pub struct Pipeline {
    store: Store,
    search_path: SearchPath,
    reuse_actions: bool,
    executor: Arc<dyn ProcessExecutor>,
    downloader: Arc<dyn Downloader>,
    git: OnceCell<Result<Git, Error>>,
    repos: Memo<RepositoryRequest, Result<RepositoryResult, Error>>,
    checkouts: Memo<CheckoutRequest, Result<CheckoutResult, Error>>,
    downloads: Memo<ExternalToolRequest, Result<DownloadedExternalTool, Error>>,
}

impl Pipeline {
    /// A pipeline running processes locally and downloading over HTTP.
    pub fn new(store: Store, search_path: SearchPath) -> Self {
        let executor = LocalExecutor::new(store.clone());
        Self {
            executor: Arc::new(executor),
            downloader: Arc::new(HttpDownloader::default()),
            reuse_actions: true,
            git: OnceCell::new(),
            repos: Memo::new(),
            checkouts: Memo::new(),
            downloads: Memo::new(),
            store,
            search_path,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn ProcessExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = downloader;
        self
    }

    /// Whether to reuse clones and checkouts recorded by earlier pipelines. New results are
    /// recorded either way.
    pub fn with_action_cache(mut self, reuse: bool) -> Self {
        self.reuse_actions = reuse;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn search_path(&self) -> &SearchPath {
        &self.search_path
    }

    /// The `git` binary, resolved once per pipeline.
    pub async fn git(&self) -> Result<Git, Error> {
        self.git
            .get_or_init(|| async {
                info!(stage = "binary_resolving", search_path = %self.search_path);
                let request = git_binary_request(self.search_path.clone());
                let result = resolve_binary(&request, self.executor.as_ref())
                    .await
                    .map(Git::new);
                report(&result);
                result
            })
            .await
            .clone()
    }

    fn recorded(&self, action: &Action<'_>) -> Result<Option<Digest>, Error> {
        if !self.reuse_actions {
            return Ok(None);
        }
        Ok(self.store.lookup_action(action)?)
    }

    /// Shallow-clone a repository.
    #[instrument(skip_all, fields(origin = %repo.origin))]
    pub async fn fetch_repo(&self, repo: &RepositoryRequest) -> Result<RepositoryResult, Error> {
        self.repos
            .get_or_compute(repo, || async {
                let git = self.git().await?;
                let action = Action::Clone {
                    git: git.fingerprint(),
                    request: repo,
                };
                if let Some(digest) = self.recorded(&action)? {
                    info!(stage = "cloning", cached = true, %digest);
                    return Ok(RepositoryResult { digest });
                }
                info!(stage = "cloning");
                let result = git::clone_repo(&git, repo, self.executor.as_ref()).await;
                if let Ok(fetched) = &result {
                    self.store.record_action(&action, &fetched.digest)?;
                }
                report(&result);
                result
            })
            .await
    }

    /// Check out a revision. The repository is always fetched first.
    #[instrument(skip_all, fields(origin = %request.repo.origin, rev = %request.rev.spec))]
    pub async fn checkout(&self, request: &CheckoutRequest) -> Result<CheckoutResult, Error> {
        self.checkouts
            .get_or_compute(request, || async {
                let fetched = self.fetch_repo(&request.repo).await?;
                let git = self.git().await?;
                let action = Action::Checkout {
                    git: git.fingerprint(),
                    request,
                    input: &fetched.digest,
                };
                if let Some(digest) = self.recorded(&action)? {
                    info!(stage = "checked_out", cached = true, %digest);
                    return Ok(CheckoutResult { digest });
                }
                info!(stage = "checking_out");
                let result =
                    git::checkout_rev(&git, request, &fetched, self.executor.as_ref()).await;
                match &result {
                    Ok(checked_out) => {
                        self.store.record_action(&action, &checked_out.digest)?;
                        info!(stage = "checked_out", digest = %checked_out.digest);
                    }
                    Err(_) => report(&result),
                }
                result
            })
            .await
    }

    /// Check out the source of a tool at its configured revision.
    pub async fn fetch_source(&self, request: &SourceToolRequest) -> Result<CheckoutResult, Error> {
        info!(tool = request.tool().name(), "fetching source");
        self.checkout(&request.checkout_request()).await
    }

    /// Run several checkouts concurrently. Results are in request order.
    pub async fn checkout_all(&self, requests: &[CheckoutRequest]) -> Vec<Result<CheckoutResult, Error>> {
        join_all(requests.iter().map(|request| self.checkout(request))).await
    }

    /// Download, validate and unpack a tool archive.
    #[instrument(skip_all, fields(tool = %request.name, version = request.version(), platform = %request.platform()))]
    pub async fn download_tool(
        &self,
        request: &ExternalToolRequest,
    ) -> Result<DownloadedExternalTool, Error> {
        self.downloads
            .get_or_compute(request, || async {
                info!(url = %request.url, "downloading");
                let result = self.download_and_unpack(request).await;
                report(&result);
                result
            })
            .await
    }

    async fn download_and_unpack(
        &self,
        request: &ExternalToolRequest,
    ) -> Result<DownloadedExternalTool, Error> {
        let bytes = self.downloader.download(&request.url).await?;
        request.verify(&bytes)?;
        let digest = self.unpack(request, &bytes)?;
        Ok(DownloadedExternalTool {
            digest,
            exe: request.entry_point.clone(),
        })
    }

    fn unpack(&self, request: &ExternalToolRequest, bytes: &[u8]) -> Result<Digest, Error> {
        let extract_error = |e: std::io::Error| ExternalToolError::Extract {
            tool: request.name.clone(),
            version: request.version().to_string(),
            source: Arc::new(e),
        };
        let sandbox = tempfile::Builder::new()
            .prefix("source-checkout-")
            .tempdir()
            .map_err(extract_error)?;
        let items = crate::tar::extract_tar_from_bytes(bytes, sandbox.path()).map_err(extract_error)?;
        tracing::debug!(top_level = ?items.keys().collect::<Vec<_>>(), "unpacked");
        Ok(self.store.snapshot(sandbox.path(), &["."])?)
    }

    /// Download `tool` and check that its entry point is present. `version` defaults to the tool's
    /// default version.
    pub async fn package_tool(
        &self,
        tool: &dyn ExternalTool,
        version: Option<&str>,
        platform: Platform,
    ) -> Result<PackagedTool, Error> {
        let version = version.unwrap_or(tool.default_version());
        let request = tool.get_request(version, platform)?;
        let downloaded = self.download_tool(&request).await?;
        let has_entry_point = self
            .store
            .entries(&downloaded.digest)?
            .iter()
            .any(|entry| entry.is_file() && Path::new(&entry.path) == Path::new(&downloaded.exe));
        if !has_entry_point {
            let err = Error::from(ExternalToolError::MissingEntryPoint {
                tool: request.name.clone(),
                version: version.to_string(),
                entry_point: downloaded.exe,
            });
            report::<()>(&Err(err.clone()));
            return Err(err);
        }
        Ok(PackagedTool {
            name: request.name,
            version: version.to_string(),
            platform,
            digest: downloaded.digest,
            entry_point: downloaded.exe,
        })
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("store", &self.store)
            .field("search_path", &self.search_path)
            .field("reuse_actions", &self.reuse_actions)
            .field("repos", &self.repos)
            .field("checkouts", &self.checkouts)
            .field("downloads", &self.downloads)
            .finish()
    }
}
