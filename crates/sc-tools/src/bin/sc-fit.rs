//! sc-fit - Worst-case fit of a model across GPU models.
//!
//! Usage:
//!   sc-fit --list                              # GPU capability table
//!   sc-fit --preset llama-3-70b --gpus 4       # every GPU model, 4-way tensor parallel
//!   sc-fit --preset llama-2-13b --check l4     # exit 1 unless it fits on an L4
//!
//! Output formats: table (default), json

use clap::{Parser, ValueEnum};
use sc_tools::{
    exit_with, fit_sweep, init_logging, load_model_config, parse_context, print_json, Amount,
    EstimateRequest, FitRow, Response, ToolError,
};
use servecap_core::{EstimateOptions, GpuModel, GpuSpec, PrecisionSpec};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sc-fit")]
#[command(about = "Check whether a model fits across GPU models")]
#[command(version)]
struct Args {
    /// Print the GPU capability table and exit
    #[arg(long)]
    list: bool,

    /// Model config file
    #[arg(short, long, conflicts_with = "preset")]
    config: Option<PathBuf>,

    /// Built-in model preset
    #[arg(short, long)]
    preset: Option<String>,

    /// Parameter count (e.g., 7b)
    #[arg(long)]
    params: Option<String>,

    /// GPUs per deployment (tensor-parallel degree)
    #[arg(long, default_value = "1")]
    gpus: usize,

    /// Weight storage dtype
    #[arg(long)]
    weight_dtype: Option<String>,

    /// KV cache dtype
    #[arg(long)]
    kv_dtype: Option<String>,

    /// Max context length to check (default: the model's)
    #[arg(long)]
    max_model_len: Option<String>,

    /// Check a single GPU model; exit with status 1 if it does not fit
    #[arg(long)]
    check: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    format: OutputFormat,
}

#[derive(Clone, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn build_request(args: &Args) -> Result<EstimateRequest, ToolError> {
    let mut precision = PrecisionSpec::default();
    if let Some(dtype) = &args.weight_dtype {
        precision.weight = dtype.parse()?;
    }
    if let Some(dtype) = &args.kv_dtype {
        precision.kv = dtype.parse()?;
    }
    let options = EstimateOptions {
        max_model_len: args.max_model_len.as_deref().map(parse_context).transpose()?,
        ..Default::default()
    };
    Ok(EstimateRequest {
        config: args.config.as_deref().map(load_model_config).transpose()?,
        preset: args.preset.clone(),
        num_params: args.params.clone().map(Amount::Text),
        gpus: Some(args.gpus),
        precision,
        options,
        ..Default::default()
    })
}

fn print_gpu_table(specs: &[GpuSpec]) {
    println!("GPU          | Memory  | Bandwidth  | PCIe | FP16 TFLOPs | FP8 TFLOPs");
    println!("{}", "─".repeat(70));
    for spec in specs {
        println!(
            "{:12} | {:>4.0} GiB | {:>6.0} GB/s | {:?} | {:>11.1} | {:>10.1}",
            spec.id,
            spec.memory_gib,
            spec.bandwidth_gbs,
            spec.pcie,
            spec.peaks.fp16_acc32,
            spec.peaks.fp8_acc32
        );
    }
}

fn print_fit_table(rows: &[FitRow]) {
    println!("GPU          | Fits | Required/GPU | Short by  | Batch | Decode tok/s");
    println!("{}", "─".repeat(70));
    for row in rows {
        let fits = if row.fits { "✓" } else { "✗" };
        let short = if row.fits {
            "-".to_string()
        } else {
            format!("{:.2} GiB", row.max_deficit_gb)
        };
        let tps = row
            .conservative_tps
            .map_or_else(|| "-".to_string(), |t| format!("{t:.0}"));
        println!(
            "{:12} |  {}   | {:>8.2} GiB | {:>9} | {:>5} | {:>12}",
            row.gpu, fits, row.worst_case_required_gb, short, row.effective_batch, tps
        );
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging();

    if args.list {
        let specs: Vec<GpuSpec> = GpuModel::ALL.iter().map(|m| m.spec()).collect();
        match args.format {
            OutputFormat::Json => print_json(&Response::new(&specs), true)?,
            OutputFormat::Table => print_gpu_table(&specs),
        }
        return Ok(());
    }

    let request = build_request(&args).unwrap_or_else(|e| exit_with(&e));
    let gpus = match &args.check {
        Some(id) => vec![id
            .parse::<GpuModel>()
            .unwrap_or_else(|e| exit_with(&ToolError::from(e)))],
        None => GpuModel::ALL.to_vec(),
    };
    let rows = fit_sweep(&request, &gpus).unwrap_or_else(|e| exit_with(&e));

    match args.format {
        OutputFormat::Json => print_json(&Response::new(&rows), true)?,
        OutputFormat::Table => print_fit_table(&rows),
    }

    if args.check.is_some() && !rows.iter().all(|row| row.fits) {
        std::process::exit(1);
    }
    Ok(())
}
