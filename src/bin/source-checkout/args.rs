use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use source_checkout::{
    CheckoutRequest, Config, ConfiguredSourceTool, ExternalTool, Platform, SearchPath,
    SourceToolOptions, SourceToolRegistry, SourceToolRequest,
};

use crate::error::AppError;

// Shamelessly borrowed from https://github.com/crate-ci/clap-cargo/blob/0378657ffdf2b67bcd6f1ab56e04a1322b92dd0e/src/style.rs
use anstyle::AnsiColor::*;
use anstyle::Effects;
use anstyle::Style;

const HEADER: Style = Green.on_default().effects(Effects::BOLD);
const USAGE: Style = Green.on_default().effects(Effects::BOLD);
const LITERAL: Style = Cyan.on_default().effects(Effects::BOLD);
const PLACEHOLDER: Style = Cyan.on_default();
const ERROR: Style = Red.on_default().effects(Effects::BOLD);
const VALID: Style = Cyan.on_default().effects(Effects::BOLD);
const INVALID: Style = Yellow.on_default().effects(Effects::BOLD);

const APP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(HEADER)
    .usage(USAGE)
    .literal(LITERAL)
    .placeholder(PLACEHOLDER)
    .error(ERROR)
    .valid(VALID)
    .invalid(INVALID);

#[derive(Debug, Parser)]
#[command(name = "source-checkout")]
#[command(about = "Check out pinned revisions of external tool sources")]
#[command(long_about = None)]
#[command(version)]
#[command(styles = APP_STYLING)]
#[command(term_width = 80)]
pub struct Args {
    /// Path to a configuration file with `[source-tools]` and `[settings]` tables
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Cache directory to use. If omitted, check the `SOURCE_CHECKOUT_CACHE` environment variable,
    /// then the `cache-dir` setting, then the platform cache directory
    #[arg(long = "cache", short = 'c', value_name = "PATH", global = true)]
    cache_dir: Option<PathBuf>,

    /// Log debug detail to stderr
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Clone and check out again instead of reusing results recorded by earlier runs
    #[arg(long, global = true)]
    refresh: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Check out the source of a built-in tool
    Checkout {
        /// Name of the tool
        #[arg(long, short = 't', value_name = "NAME")]
        tool: String,

        /// Repository to fetch instead of the configured origin
        #[arg(long, value_name = "URL")]
        origin: Option<String>,

        /// Revision to check out instead of the configured version
        #[arg(long, value_name = "REV")]
        version: Option<String>,

        /// Directory to write the checked-out tree into
        #[arg(long, short = 'o', value_name = "PATH")]
        out_dir: Option<PathBuf>,
    },
    /// Check out a revision of any repository
    Clone {
        /// Repository to fetch
        #[arg(long, value_name = "URL")]
        origin: String,

        /// Tag, branch or commit to check out
        #[arg(long, value_name = "REV")]
        rev: String,

        /// Directory to write the checked-out tree into
        #[arg(long, short = 'o', value_name = "PATH")]
        out_dir: Option<PathBuf>,
    },
    /// List the built-in tools with their effective origin and version
    List {
        /// Output format
        #[arg(long, short = 'f', value_enum, value_name = "FORMAT")]
        format: Option<OutputFormat>,
    },
    /// Download and unpack the prebuilt archive of a tool
    Package {
        /// Name of the tool
        #[arg(long, short = 't', value_name = "NAME")]
        tool: String,

        /// Version to download instead of the tool's default
        #[arg(long, value_name = "VERSION")]
        version: Option<String>,

        /// Platform to download for. Defaults to the current platform
        #[arg(long, value_name = "PLATFORM")]
        platform: Option<String>,
    },
}

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum OutputFormat {
    /// Output in JSON format
    Json,
    /// Output in TOML format
    Toml,
}

#[derive(Debug)]
pub struct ValidatedArgs {
    pub search_path: SearchPath,
    pub refresh: bool,
    pub command: ValidatedCommand,
}

#[derive(Debug)]
pub enum ValidatedCommand {
    Checkout {
        tool: SourceToolRequest,
        out_dir: Option<PathBuf>,
        cache_dir: PathBuf,
    },
    Clone {
        request: CheckoutRequest,
        out_dir: Option<PathBuf>,
        cache_dir: PathBuf,
    },
    List {
        tools: SourceToolRegistry,
        format: Option<OutputFormat>,
    },
    Package {
        tool: Arc<dyn ExternalTool>,
        version: Option<String>,
        platform: Platform,
        cache_dir: PathBuf,
    },
}

impl ValidatedArgs {
    fn load_config(path: Option<PathBuf>) -> Result<Config, AppError> {
        match path {
            Some(path) => Config::load(&path).map_err(|e| AppError::config(path, e)),
            None => Ok(Config::default()),
        }
    }

    fn detect_cache_dir(config: &Config, arg: Option<PathBuf>) -> Result<PathBuf, AppError> {
        config
            .cache_dir(arg)
            .map_err(|e| AppError::arg_validation(e.to_string()))
    }

    /// If given, the output directory must already exist.
    fn validate_out_dir(out_dir: Option<PathBuf>) -> Result<Option<PathBuf>, AppError> {
        match out_dir {
            Some(dir) if !dir.is_dir() => Err(AppError::arg_validation(format!(
                "output directory does not exist: {}",
                dir.display()
            ))),
            Some(dir) => Ok(Some(dir.canonicalize()?)),
            None => Ok(None),
        }
    }
}

impl TryFrom<Args> for ValidatedArgs {
    type Error = AppError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let config_path = args.config.clone();
        let config = ValidatedArgs::load_config(args.config)?;
        let config_error = |e| match &config_path {
            Some(path) => AppError::config(path.clone(), e),
            None => AppError::arg_validation(format!("{e}")),
        };
        let registry = config.source_tools().map_err(config_error)?;
        let external_tools = config.external_tools().map_err(config_error)?;

        let command = match args.command {
            Command::Checkout {
                tool,
                origin,
                version,
                out_dir,
            } => {
                let descriptor = source_checkout::source_tool_descriptors()
                    .into_iter()
                    .find(|d| d.name == tool)
                    .ok_or_else(|| {
                        AppError::arg_validation(format!(
                            "unknown source tool '{tool}': expected one of: {}",
                            registry.names().join(", ")
                        ))
                    })?;
                let from_config = config.overrides.get(&tool).cloned().unwrap_or_default();
                let options = SourceToolOptions { origin, version }.or(from_config);
                ValidatedCommand::Checkout {
                    tool: SourceToolRequest::new(
                        ConfiguredSourceTool::new(descriptor).with_options(options),
                    ),
                    out_dir: ValidatedArgs::validate_out_dir(out_dir)?,
                    cache_dir: ValidatedArgs::detect_cache_dir(&config, args.cache_dir)?,
                }
            }
            Command::Clone {
                origin,
                rev,
                out_dir,
            } => ValidatedCommand::Clone {
                request: CheckoutRequest::new(origin, rev),
                out_dir: ValidatedArgs::validate_out_dir(out_dir)?,
                cache_dir: ValidatedArgs::detect_cache_dir(&config, args.cache_dir)?,
            },
            Command::List { format } => ValidatedCommand::List {
                tools: registry,
                format,
            },
            Command::Package {
                tool,
                version,
                platform,
            } => {
                let external = external_tools
                    .iter()
                    .find(|t| t.name() == tool)
                    .cloned()
                    .ok_or_else(|| {
                        AppError::arg_validation(format!(
                            "unknown external tool '{tool}': expected one of: {}",
                            external_tools
                                .iter()
                                .map(|t| t.name().to_string())
                                .collect::<Vec<_>>()
                                .join(", ")
                        ))
                    })?;
                let platform = match platform {
                    Some(p) => p
                        .parse::<Platform>()
                        .map_err(|e| AppError::arg_validation(e.to_string()))?,
                    None => Platform::current(),
                };
                ValidatedCommand::Package {
                    tool: external,
                    version,
                    platform,
                    cache_dir: ValidatedArgs::detect_cache_dir(&config, args.cache_dir)?,
                }
            }
        };
        Ok(ValidatedArgs {
            search_path: config.search_path(),
            refresh: args.refresh,
            command,
        })
    }
}

pub fn parse() -> Args {
    Args::parse()
}
