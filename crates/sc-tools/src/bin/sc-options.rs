//! sc-options - Print or validate estimator options.
//!
//! Usage:
//!   sc-options                        # defaults as JSON
//!   sc-options --format toml > serve.toml
//!   sc-options --validate serve.toml
//!
//! Output formats: json (default), toml

use clap::{Parser, ValueEnum};
use sc_tools::{exit_with, init_logging, load_options, print_json, Response};
use servecap_core::EstimateOptions;
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sc-options")]
#[command(about = "Print default estimator options or validate an options file")]
#[command(version)]
struct Args {
    /// Options file to validate (.toml or .json)
    #[arg(long)]
    validate: Option<PathBuf>,

    /// Output format
    #[arg(short, long, default_value = "json")]
    format: OutputFormat,
}

#[derive(Clone, Debug, ValueEnum)]
enum OutputFormat {
    Json,
    Toml,
}

fn emit(options: &EstimateOptions, format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(&Response::new(options), true),
        OutputFormat::Toml => {
            let text = toml::to_string_pretty(options)?;
            io::stdout().write_all(text.as_bytes())?;
            Ok(())
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging();

    match &args.validate {
        Some(path) => {
            // load_options already runs validation on the parsed values
            let options = load_options(path).unwrap_or_else(|e| exit_with(&e));
            tracing::info!(path = %path.display(), "options are valid");
            emit(&options, &args.format)
        }
        None => emit(&EstimateOptions::default(), &args.format),
    }
}
