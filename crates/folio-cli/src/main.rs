//! folio CLI: administrative surface for the digitization pipeline.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use folio::ingest::source::collect_image_files;
use folio::{load_config, Config, Folio, ImageInput, PipelineRunConfig, StepName};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "folio", version, about = "Digitization pipeline for historical books")]
struct Cli {
    /// Configuration file. Defaults to ~/.folio/folio.json when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage books.
    Book {
        #[command(subcommand)]
        action: BookAction,
    },

    /// Append scans to a book. Inputs are directories, files or URLs.
    Ingest {
        book: String,
        #[arg(required = true)]
        inputs: Vec<String>,
    },

    /// Replace every page of a book with a fresh ingest.
    Reimport {
        book: String,
        #[arg(required = true)]
        inputs: Vec<String>,
    },

    /// Recompute a book's page count and progress counters.
    Resync { book: String },

    /// Start the pipeline for an idle book.
    Start {
        book: String,
        /// Steps to run (comma-separated). Defaults to all.
        #[arg(long, value_delimiter = ',', value_parser = parse_step)]
        steps: Vec<StepName>,
        /// Target language for translation.
        #[arg(long, default_value = "English")]
        language: String,
    },

    /// Drive a running pipeline until it stops. Ctrl-C pauses it.
    Run { book: String },

    Pause { book: String },

    Resume { book: String },

    /// Return a pipeline to idle. Page results are kept.
    Reset { book: String },

    /// Show pipeline state, active job and counters.
    Status { book: String },
}

#[derive(Subcommand)]
enum BookAction {
    /// Create a book and print its id.
    Create { title: String },
    List,
}

fn parse_step(s: &str) -> Result<StepName, String> {
    StepName::parse(s).ok_or_else(|| {
        let known: Vec<&str> = StepName::ORDER.iter().map(|s| s.as_str()).collect();
        format!("unknown step '{}' (expected one of: {})", s, known.join(", "))
    })
}

fn resolve_config(path: Option<&Path>) -> CliResult<Config> {
    if let Some(path) = path {
        return Ok(load_config(path)?);
    }
    let default = default_config_path();
    if default.exists() {
        Ok(load_config(&default)?)
    } else {
        Ok(Config::with_defaults())
    }
}

fn default_config_path() -> PathBuf {
    PathBuf::from(folio::secrets::expand_home("~/.folio/folio.json"))
}

/// Expands directories into their image files, in name order.
fn image_inputs(raw: &[String]) -> Vec<ImageInput> {
    let mut inputs = Vec::new();
    for item in raw {
        let path = Path::new(item);
        if !item.contains("://") && path.is_dir() {
            inputs.extend(
                collect_image_files(path)
                    .into_iter()
                    .map(|p| ImageInput::Url(p.to_string_lossy().into_owned())),
            );
        } else {
            inputs.push(ImageInput::Url(item.clone()));
        }
    }
    inputs
}

fn print<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> CliResult<()> {
    let config = resolve_config(cli.config.as_deref())?;
    folio::telemetry::init_tracing(&config.logging)?;
    let app = Folio::from_config(config)?;

    match cli.command {
        Commands::Book { action } => match action {
            BookAction::Create { title } => print(&app.create_book(&title)?)?,
            BookAction::List => print(&app.books()?)?,
        },
        Commands::Ingest { book, inputs } => {
            let report = app.ingest(&book, image_inputs(&inputs)).await?;
            print(&report)?;
        }
        Commands::Reimport { book, inputs } => {
            let report = app.reimport(&book, image_inputs(&inputs)).await?;
            print(&report)?;
        }
        Commands::Resync { book } => print(&app.resync_page_count(&book)?)?,
        Commands::Start {
            book,
            steps,
            language,
        } => {
            let mut run_config = PipelineRunConfig {
                target_language: language,
                ..Default::default()
            };
            if !steps.is_empty() {
                run_config.steps = steps;
            }
            print(&app.start(&book, run_config)?)?;
        }
        Commands::Run { book } => {
            let cancel = CancellationToken::new();
            let handler_token = cancel.clone();
            if let Err(e) = ctrlc::set_handler(move || {
                tracing::info!("interrupt received, pausing after the current item");
                handler_token.cancel();
            }) {
                tracing::warn!(error = %e, "could not install Ctrl-C handler");
            }
            let outcome = app.run(&book, &cancel).await?;
            print(&outcome)?;
        }
        Commands::Pause { book } => print(&app.pause(&book)?)?,
        Commands::Resume { book } => print(&app.resume(&book)?)?,
        Commands::Reset { book } => print(&app.reset(&book)?)?,
        Commands::Status { book } => print(&app.status(&book)?)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
