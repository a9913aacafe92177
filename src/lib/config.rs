//! Operator configuration read from a TOML document.
//!
//! ```toml
//! [settings]
//! cache-dir = "/var/cache/source-checkout"
//! search-path = ["/usr/local/bin", "/usr/bin"]
//!
//! [source-tools]
//! spack = { origin = "https://github.com/spack/spack.git", version = "v0.17.0" }
//!
//! [external-tools]
//! spack = { version = "0.16.0", known-versions = ["0.16.0|linux|<sha256>|5512800"] }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::binary::SearchPath;
use crate::external::{ConfiguredExternalTool, ExternalTool, ExternalToolOptions};
use crate::source::{ConfiguredSourceTool, SourceToolOptions, SourceToolRegistry};
use crate::tools;

/// Environment variable naming the cache directory.
pub const CACHE_ENV_VAR: &str = "SOURCE_CHECKOUT_CACHE";

const SOURCE_TOOLS_TABLE: &str = "source-tools";
const EXTERNAL_TOOLS_TABLE: &str = "external-tools";
const SETTINGS_TABLE: &str = "settings";

/// Errors encountered when reading a configuration document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// None of the known tables is present.
    #[error(
        "expected a '[{SOURCE_TOOLS_TABLE}]', '[{EXTERNAL_TOOLS_TABLE}]' or '[{SETTINGS_TABLE}]' table"
    )]
    TableNotFound,

    /// A toml value was expected to be a table.
    #[error("expected value '{name}' to be a toml table")]
    ValueNotTable { name: String },

    /// An override names a tool that isn't built in.
    #[error("unknown {kind} '{name}': expected one of: {known}")]
    UnknownTool {
        kind: &'static str,
        name: String,
        known: String,
    },

    /// A toml deserialisation error occurred.
    #[error(transparent)]
    TomlInvalid(#[from] toml::de::Error),

    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("could not determine a cache directory for this platform")]
    NoCacheDir,
}

/// The `[settings]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Settings {
    pub cache_dir: Option<PathBuf>,
    /// Replaces `PATH` when resolving binaries.
    pub search_path: Option<Vec<PathBuf>>,
}

/// A parsed configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub settings: Settings,
    pub overrides: BTreeMap<String, SourceToolOptions>,
    pub external_overrides: BTreeMap<String, ExternalToolOptions>,
}

/// The per-tool tables under `[<name>]`.
fn tool_tables<T: DeserializeOwned>(
    table: &toml::Table,
    name: &str,
) -> Result<BTreeMap<String, T>, ConfigError> {
    match table.get(name) {
        Some(toml::Value::Table(tools)) => tools
            .iter()
            .map(|(tool, value)| match value {
                toml::Value::Table(_) => Ok((tool.to_owned(), value.clone().try_into::<T>()?)),
                _ => Err(ConfigError::ValueNotTable {
                    name: tool.to_owned(),
                }),
            })
            .collect(),
        Some(_) => Err(ConfigError::ValueNotTable {
            name: name.to_string(),
        }),
        None => Ok(BTreeMap::new()),
    }
}

fn unknown_tool<'a>(
    kind: &'static str,
    mut overrides: impl Iterator<Item = &'a String>,
    known: &[&str],
) -> Result<(), ConfigError> {
    match overrides.find(|name| !known.contains(&name.as_str())) {
        Some(name) => Err(ConfigError::UnknownTool {
            kind,
            name: name.clone(),
            known: known.join(", "),
        }),
        None => Ok(()),
    }
}

impl Config {
    /// Parse a configuration document. At least one known table must be present.
    pub fn try_parse_toml<S: AsRef<str>>(toml_str: S) -> Result<Self, ConfigError> {
        let table = toml_str.as_ref().parse::<toml::Table>()?;
        if ![SOURCE_TOOLS_TABLE, EXTERNAL_TOOLS_TABLE, SETTINGS_TABLE]
            .iter()
            .any(|name| table.contains_key(*name))
        {
            return Err(ConfigError::TableNotFound);
        }
        let settings = match table.get(SETTINGS_TABLE) {
            Some(settings @ toml::Value::Table(_)) => settings.clone().try_into::<Settings>()?,
            Some(_) => {
                return Err(ConfigError::ValueNotTable {
                    name: SETTINGS_TABLE.to_string(),
                });
            }
            None => Settings::default(),
        };
        Ok(Self {
            settings,
            overrides: tool_tables(&table, SOURCE_TOOLS_TABLE)?,
            external_overrides: tool_tables(&table, EXTERNAL_TOOLS_TABLE)?,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: Arc::new(e),
        })?;
        Self::try_parse_toml(document)
    }

    /// The built-in source tools with this configuration's overrides applied.
    pub fn source_tools(&self) -> Result<SourceToolRegistry, ConfigError> {
        let descriptors = tools::source_tool_descriptors();
        let known = descriptors.iter().map(|d| d.name.as_str()).collect::<Vec<_>>();
        unknown_tool("source tool", self.overrides.keys(), &known)?;
        let mut registry = SourceToolRegistry::new();
        for descriptor in descriptors {
            let options = self
                .overrides
                .get(&descriptor.name)
                .cloned()
                .unwrap_or_default();
            registry.register(ConfiguredSourceTool::new(descriptor).with_options(options));
        }
        Ok(registry)
    }

    /// The built-in external tools with this configuration's overrides applied.
    pub fn external_tools(&self) -> Result<Vec<Arc<dyn ExternalTool>>, ConfigError> {
        let built_in = tools::external_tools();
        let known = built_in.iter().map(|t| t.name()).collect::<Vec<_>>();
        unknown_tool("external tool", self.external_overrides.keys(), &known)?;
        Ok(built_in
            .iter()
            .map(|tool| {
                let options = self
                    .external_overrides
                    .get(tool.name())
                    .cloned()
                    .unwrap_or_default();
                Arc::new(ConfiguredExternalTool::new(tool.clone(), options)) as Arc<dyn ExternalTool>
            })
            .collect())
    }

    /// The configured search path, falling back to `PATH`.
    pub fn search_path(&self) -> SearchPath {
        match &self.settings.search_path {
            Some(dirs) => SearchPath::new(dirs.iter().cloned()),
            None => SearchPath::from_env(),
        }
    }

    /// Detect the cache directory: `arg`, then `SOURCE_CHECKOUT_CACHE`, then `[settings]`, then
    /// the platform cache directory.
    pub fn cache_dir(&self, arg: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = arg {
            return Ok(dir);
        }
        if let Some(dir) = std::env::var_os(CACHE_ENV_VAR) {
            return Ok(PathBuf::from(dir));
        }
        if let Some(dir) = &self.settings.cache_dir {
            return Ok(dir.clone());
        }
        directories::ProjectDirs::from("", "", "source-checkout")
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .ok_or(ConfigError::NoCacheDir)
    }
}
