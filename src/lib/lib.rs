//! Fetch pinned revisions of external tool sources as content-addressed trees.
//!
//! Tools describe where their source lives and which revision they want. This crate turns that
//! into a sandboxed shallow `git clone`, then a `git checkout` of the revision inside a sandbox
//! seeded with the clone, and returns the result as a [`Digest`] held in a local [`Store`].
//!
//! # Core Features
//!
//! - The `git` binary is located on an explicit [`SearchPath`] and validated with `--version`
//!   before it is used.
//! - Every stage is memoised by request value. Equal requests from different tools share one
//!   clone and one checkout, even when made concurrently.
//! - Failures are classified by stage: [`Error::BinaryNotFound`], [`Error::FetchFailed`] and
//!   [`Error::RevisionUnresolvable`].
//! - Successful clones and checkouts are recorded in the store's action cache, so later runs on
//!   the same store return the same digests.
//! - Prebuilt tool archives can be downloaded, checked against known sizes and SHA-256 sums and
//!   unpacked into the same store.
//!
//! # Usage
//!
//! ```rust,no_run
//! use source_checkout::{Config, Pipeline, SearchPath, Store};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::try_parse_toml(r#"
//! [source-tools]
//! spack = { version = "v0.16.0" }
//! "#)?;
//! let tools = config.source_tools()?;
//! let pipeline = Pipeline::new(Store::new("/tmp/source-checkout"), SearchPath::from_env());
//!
//! if let Some(spack) = tools.request("spack") {
//!     let checkout = pipeline.fetch_source(&spack).await?;
//!     pipeline.store().materialize(&checkout.digest, "spack-src".as_ref())?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Structure of the configuration document
//!
//! - `[source-tools]` maps a built-in tool name to a table with optional `origin` and `version`
//!   keys. A key that is set replaces the tool's default.
//! - `[external-tools]` maps a built-in tool name to a table with optional `version` and
//!   `known-versions` keys. `known-versions` replaces the built-in `version|platform|sha256|size`
//!   lines.
//! - `[settings]` may give `cache-dir` and `search-path`. The search path replaces `PATH` when
//!   looking for `git`.

mod binary;
mod config;
mod digest;
mod error;
mod external;
mod git;
mod memo;
mod pipeline;
mod process;
mod source;
mod store;
mod tar;
mod tools;

pub use binary::{BinaryPathRequest, BinaryPathTest, ResolvedBinary, SearchPath, resolve_binary};
pub use config::{CACHE_ENV_VAR, Config, ConfigError, Settings};
pub use digest::Digest;
pub use error::Error;
pub use external::{
    ConfiguredExternalTool, DownloadedExternalTool, Downloader, ExternalTool, ExternalToolError,
    ExternalToolOptions, ExternalToolRequest, HttpDownloader, KnownVersion, PackagedTool, Platform,
};
pub use git::{
    CLONE_DIR, CheckoutRequest, CheckoutResult, Git, RepositoryRequest, RepositoryResult,
    RevisionSpec, clone_repo, checkout_rev, git_binary_request,
};
pub use memo::Memo;
pub use pipeline::Pipeline;
pub use process::{LocalExecutor, Process, ProcessError, ProcessExecutor, ProcessOutput};
pub use source::{
    ConfiguredSourceTool, SourceTool, SourceToolDescriptor, SourceToolOptions, SourceToolRegistry,
    SourceToolRequest,
};
pub use store::{EntryKind, Store, StoreError, TreeEntry};
pub use tools::{Spack, external_tool, external_tools, source_tool_descriptors};
