//! sc-estimate - Estimate memory, concurrency and throughput for serving a model.
//!
//! Usage:
//!   sc-estimate --preset llama-2-7b --params 7b --gpu rtx-4090
//!   sc-estimate --config config.json --gpu a100-80g --gpus 2 --users 32 --format pretty
//!   sc-estimate --preset mistral-7b --gpu l40s --mem 40g --weight-dtype int4 --crosscheck
//!
//! Output formats: json (default), pretty

use clap::{Parser, ValueEnum};
use sc_tools::{
    exit_with, format_report, init_logging, load_model_config, load_options, parse_context,
    print_json, Amount, EstimateRequest, Response, ToolError,
};
use servecap_core::crosscheck;
use servecap_core::{EstimateOptions, PerformanceReport, PrecisionSpec, Topology};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sc-estimate")]
#[command(about = "Estimate memory, concurrency and throughput for serving an LLM")]
#[command(version)]
struct Args {
    /// Model config file (Hugging Face config.json style)
    #[arg(short, long, conflicts_with = "preset")]
    config: Option<PathBuf>,

    /// Built-in model preset (llama-2-7b, llama-3-8b, mistral-7b, ...)
    #[arg(short, long)]
    preset: Option<String>,

    /// Parameter count (e.g., 7b, 70B, 7e9); derived from the config when omitted
    #[arg(long)]
    params: Option<String>,

    /// GPU model id (e.g., a100-80g, h100-sxm, rtx-4090)
    #[arg(short, long)]
    gpu: String,

    /// Available memory per GPU (e.g., 24g, 80GiB); repeat once per GPU
    #[arg(short, long)]
    mem: Vec<String>,

    /// Number of GPUs
    #[arg(long)]
    gpus: Option<usize>,

    /// Tensor-parallel degree (default: number of GPUs)
    #[arg(long)]
    tp: Option<u32>,

    /// Weight storage dtype
    #[arg(long)]
    weight_dtype: Option<String>,

    /// Activation dtype
    #[arg(long)]
    activation_dtype: Option<String>,

    /// KV cache dtype
    #[arg(long)]
    kv_dtype: Option<String>,

    /// Tensor math precision
    #[arg(long)]
    math: Option<String>,

    /// Accumulate type (fp16, fp32, int32)
    #[arg(long)]
    accumulate: Option<String>,

    /// Concurrent users
    #[arg(short, long)]
    users: Option<u64>,

    /// Average prompt length (e.g., 512, 2k)
    #[arg(long)]
    avg_prompt: Option<String>,

    /// Average output length
    #[arg(long)]
    avg_output: Option<String>,

    /// Prompt length for prefill
    #[arg(long)]
    prompt_len: Option<String>,

    /// Override of the model's max context length
    #[arg(long)]
    max_model_len: Option<String>,

    /// Fixed batch size; disables auto-batching
    #[arg(long)]
    batch: Option<u64>,

    /// Options file (.toml or .json); flags override its values
    #[arg(short, long)]
    options: Option<PathBuf>,

    /// Tensor peak override in TFLOPs
    #[arg(long)]
    peak_tflops: Option<f64>,

    /// Memory bandwidth override in GB/s
    #[arg(long)]
    bandwidth_gbs: Option<f64>,

    /// Compare fixed memory cost against the weights-plus-20% rule of thumb
    #[arg(long)]
    crosscheck: bool,

    /// Output format
    #[arg(short, long, default_value = "json")]
    format: OutputFormat,
}

#[derive(Clone, Debug, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

fn build_options(args: &Args) -> Result<EstimateOptions, ToolError> {
    let mut options = match &args.options {
        Some(path) => load_options(path)?,
        None => EstimateOptions::default(),
    };

    if let Some(users) = args.users {
        options.active_users = users;
    }
    if let Some(len) = &args.avg_prompt {
        options.avg_prompt_len = parse_context(len)?;
    }
    if let Some(len) = &args.avg_output {
        options.avg_output_len = parse_context(len)?;
    }
    if let Some(len) = &args.prompt_len {
        options.prompt_len = Some(parse_context(len)?);
    }
    if let Some(len) = &args.max_model_len {
        options.max_model_len = Some(parse_context(len)?);
    }
    if let Some(batch) = args.batch {
        options.auto_batch = false;
        options.batch_effective = Some(batch);
    }
    if args.peak_tflops.is_some() {
        options.tensor_peaks_override_tflops = args.peak_tflops;
    }
    if args.bandwidth_gbs.is_some() {
        options.gpu_bandwidth_override_gbs = args.bandwidth_gbs;
    }
    options.validate()?;
    Ok(options)
}

fn build_precision(args: &Args) -> Result<PrecisionSpec, ToolError> {
    let mut precision = PrecisionSpec::default();
    if let Some(dtype) = &args.weight_dtype {
        precision.weight = dtype.parse()?;
    }
    if let Some(dtype) = &args.activation_dtype {
        precision.activation = dtype.parse()?;
    }
    if let Some(dtype) = &args.kv_dtype {
        precision.kv = dtype.parse()?;
    }
    if let Some(dtype) = &args.math {
        precision.math = dtype.parse()?;
    }
    if let Some(acc) = &args.accumulate {
        precision.accumulate = acc.parse()?;
    }
    Ok(precision)
}

fn build_request(args: &Args) -> Result<EstimateRequest, ToolError> {
    Ok(EstimateRequest {
        config: args.config.as_deref().map(load_model_config).transpose()?,
        preset: args.preset.clone(),
        num_params: args.params.clone().map(Amount::Text),
        gpu: Some(args.gpu.clone()),
        gpu_memory: args.mem.iter().cloned().map(Amount::Text).collect(),
        gpus: args.gpus,
        tensor_parallel_degree: args.tp,
        precision: build_precision(args)?,
        options: build_options(args)?,
    })
}

fn crosscheck_notes(report: &PerformanceReport) -> Result<Vec<String>, ToolError> {
    let topology = Topology::new(
        report.topology.gpu_count as usize,
        report.topology.tensor_parallel_degree,
    )?;
    let check = crosscheck::compare(
        report.model.hyperparameters.num_params,
        report.model.precision.weight,
        &topology,
        &report.memory,
    );
    let gap = check
        .relative_gap
        .map_or_else(|| "-".to_string(), |g| format!("{:+.1}%", g * 100.0));
    Ok(vec![format!(
        "rule of thumb {:.2} GiB/GPU vs fixed cost {:.2} GiB/GPU (gap {gap})",
        check.rule_of_thumb_gb_per_gpu, check.fixed_gb_per_gpu
    )])
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging();

    let request = build_request(&args).unwrap_or_else(|e| exit_with(&e));
    let report = request.run().unwrap_or_else(|e| exit_with(&e));
    let notes = if args.crosscheck {
        crosscheck_notes(&report).unwrap_or_else(|e| exit_with(&e))
    } else {
        Vec::new()
    };

    match args.format {
        OutputFormat::Json => print_json(&Response::with_notes(&report, notes), true)?,
        OutputFormat::Pretty => {
            println!("{}", format_report(&report));
            for note in notes {
                println!("note: {note}");
            }
        }
    }
    Ok(())
}
