use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use source_checkout::{
    CheckoutRequest, CheckoutResult, Pipeline, SearchPath, SourceToolRegistry, Store,
};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod args;
mod error;
mod progress;

use args::{OutputFormat, ValidatedArgs, ValidatedCommand};
use error::AppError;

/// Log to stderr. `RUST_LOG` wins unless `-v` was given.
fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let fallback = || EnvFilter::new(format!("source_checkout={level}"));
    let env_filter = if verbose {
        fallback()
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback())
    };
    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .init();
}

#[derive(serde::Serialize)]
struct ListedTool<'a> {
    origin: &'a str,
    version: &'a str,
}

fn list(tools: &SourceToolRegistry, format: Option<OutputFormat>) -> Result<(), AppError> {
    let listed = tools
        .iter()
        .map(|tool| {
            (
                tool.name(),
                ListedTool {
                    origin: tool.origin(),
                    version: tool.version(),
                },
            )
        })
        .collect::<BTreeMap<_, _>>();
    match format {
        Some(OutputFormat::Json) => {
            let json = serde_json::to_string_pretty(&listed)
                .map_err(|e| AppError::output(e.to_string()))?;
            println!("{json}");
        }
        Some(OutputFormat::Toml) => {
            let toml = toml::to_string(&listed).map_err(|e| AppError::output(e.to_string()))?;
            print!("{toml}");
        }
        None => {
            for (name, tool) in &listed {
                println!("{name}: {} (rev: {})", tool.origin, tool.version);
            }
        }
    }
    Ok(())
}

/// Resolve `git` and fetch the repository, showing each stage on the spinner.
async fn fetch_stages(
    pipeline: &Pipeline,
    request: &CheckoutRequest,
    pb: &indicatif::ProgressBar,
) -> Result<(), source_checkout::Error> {
    pb.set_message("resolving git");
    pipeline.git().await?;
    pb.set_message(format!("cloning {}", request.repo.origin));
    pipeline.fetch_repo(&request.repo).await?;
    pb.set_message(format!("checking out {}", request.rev.spec));
    Ok(())
}

fn report_checkout(
    pipeline: &Pipeline,
    request: &CheckoutRequest,
    result: &CheckoutResult,
    out_dir: Option<&Path>,
) -> Result<(), AppError> {
    println!("✅ 🔗 Checked out {request}: {}", result.digest);
    if let Some(dir) = out_dir {
        pipeline
            .store()
            .materialize(&result.digest, dir)
            .map_err(|e| AppError::materialize(result.digest.clone(), dir.to_path_buf(), e))?;
        println!(
            "   written to {}",
            dir.join(source_checkout::CLONE_DIR).display()
        );
    }
    Ok(())
}

fn open_pipeline(
    cache_dir: PathBuf,
    search_path: SearchPath,
    refresh: bool,
) -> Result<Pipeline, AppError> {
    std::fs::create_dir_all(&cache_dir)?;
    Ok(Pipeline::new(Store::new(cache_dir), search_path).with_action_cache(!refresh))
}

async fn run(args: ValidatedArgs) -> Result<(), AppError> {
    match args.command {
        ValidatedCommand::List { tools, format } => list(&tools, format),
        ValidatedCommand::Checkout {
            tool,
            out_dir,
            cache_dir,
        } => {
            let pipeline = open_pipeline(cache_dir, args.search_path, args.refresh)?;
            let request = tool.checkout_request();
            let pb = progress::make_progress_spinner();
            let result = async {
                fetch_stages(&pipeline, &request, &pb).await?;
                pipeline.fetch_source(&tool).await
            }
            .await;
            pb.finish_and_clear();
            report_checkout(&pipeline, &request, &result?, out_dir.as_deref())
        }
        ValidatedCommand::Clone {
            request,
            out_dir,
            cache_dir,
        } => {
            let pipeline = open_pipeline(cache_dir, args.search_path, args.refresh)?;
            let pb = progress::make_progress_spinner();
            let result = async {
                fetch_stages(&pipeline, &request, &pb).await?;
                pipeline.checkout(&request).await
            }
            .await;
            pb.finish_and_clear();
            report_checkout(&pipeline, &request, &result?, out_dir.as_deref())
        }
        ValidatedCommand::Package {
            tool,
            version,
            platform,
            cache_dir,
        } => {
            let pipeline = open_pipeline(cache_dir, args.search_path, args.refresh)?;
            let pb = progress::make_progress_spinner();
            pb.set_message(format!("downloading {}", tool.name()));
            let result = pipeline
                .package_tool(tool.as_ref(), version.as_deref(), platform)
                .await;
            pb.finish_and_clear();
            let packaged = result?;
            println!(
                "✅ 📦 Packaged {} {} ({}): {}",
                packaged.name, packaged.version, packaged.platform, packaged.digest
            );
            println!("   entry point: {}", packaged.entry_point);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = args::parse();
    init_tracing(args.verbose);
    let outcome = match ValidatedArgs::try_from(args) {
        Ok(args) => run(args).await,
        Err(err) => Err(err),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("❌ {err}");
            err.into()
        }
    }
}
