//! Shared utilities for the servecap command-line tools and MCP server.
//!
//! Holds the JSON response envelopes, size and count parsing, options and
//! config loading, and [`EstimateRequest`]: the one request shape that both
//! `sc-estimate` flags and MCP tool arguments are turned into.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use servecap_core::hyperparams::{self, PRESETS};
use servecap_core::{
    estimate, EstimateError, EstimateOptions, GpuModel, GpuTarget, Leg, PerformanceReport,
    PrecisionSpec, Topology, GIB,
};
use std::path::Path;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Errors
// ============================================================================

/// Failure of a tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Estimate(#[from] EstimateError),

    #[error("Invalid size '{0}': expected a number with an optional k/m/g/t suffix")]
    InvalidSize(String),

    #[error("Invalid count '{0}': expected a number such as 7b, 350m or 7e9")]
    InvalidCount(String),

    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Conflicting arguments: {0}")]
    Conflict(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::Estimate(err) => err.code(),
            ToolError::InvalidSize(_) | ToolError::InvalidCount(_) => "INVALID_SIZE",
            ToolError::MissingArgument(_) => "MISSING_FIELD",
            ToolError::Conflict(_) | ToolError::Parse { .. } => "INVALID_CONFIG",
            ToolError::Io { .. } => "IO_ERROR",
        }
    }

    pub fn suggestion(&self) -> Option<String> {
        match self {
            ToolError::Estimate(EstimateError::UnknownGpu(_)) => Some(
                "Run `sc-fit --list` for known GPU ids, or set both \
                 tensor_peaks_override_tflops and gpu_bandwidth_override_gbs"
                    .to_string(),
            ),
            ToolError::Estimate(EstimateError::UnknownPreset(_)) => {
                Some(format!("Use one of: {}", PRESETS.join(", ")))
            }
            ToolError::Estimate(EstimateError::Configuration { field }) => {
                Some(format!("Add '{field}' (or one of its aliases) to the model config"))
            }
            ToolError::Estimate(EstimateError::InvalidOption { .. }) => {
                Some("Run `sc-options` to see every option with its default".to_string())
            }
            ToolError::InvalidSize(_) => Some("Examples: 24g, 80GiB, 512m, 1073741824".to_string()),
            ToolError::MissingArgument("config or preset") => {
                Some(format!("Pass a config.json or a preset: {}", PRESETS.join(", ")))
            }
            _ => None,
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Standard response wrapper for JSON output.
#[derive(Serialize)]
pub struct Response<T: Serialize> {
    pub ok: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<Vec<String>>,
}

impl<T: Serialize> Response<T> {
    pub fn new(data: T) -> Self {
        Self {
            ok: true,
            data,
            notes: None,
        }
    }

    pub fn with_notes(data: T, notes: Vec<String>) -> Self {
        Self {
            ok: true,
            data,
            notes: (!notes.is_empty()).then_some(notes),
        }
    }
}

/// Standard error response.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: ErrorDetails,
}

#[derive(Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            ok: false,
            error: ErrorDetails {
                code: code.to_string(),
                message: message.to_string(),
                suggestion: None,
            },
        }
    }

    pub fn from_error(err: &ToolError) -> Self {
        let mut response = Self::new(err.code(), &err.to_string());
        response.error.suggestion = err.suggestion();
        response
    }
}

/// Print a success envelope on stdout.
pub fn print_json<T: Serialize>(value: &T, pretty: bool) -> anyhow::Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}

/// Print an error envelope on stderr and exit with status 1.
pub fn exit_with(err: &ToolError) -> ! {
    let response = ErrorResponse::from_error(err);
    let text = serde_json::to_string_pretty(&response).unwrap_or_else(|_| err.to_string());
    eprintln!("{text}");
    std::process::exit(1)
}

/// Install the stderr tracing subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// Parsing
// ============================================================================

/// Format bytes as a human-readable binary size.
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB_U: u64 = MIB * 1024;

    if bytes >= GIB_U {
        format!("{:.2} GiB", bytes as f64 / GIB_U as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Format a GiB figure, switching to MiB below 1 GiB.
pub fn format_gib(gib: f64) -> String {
    if gib < 1.0 {
        format!("{:.0} MiB", gib * 1024.0)
    } else {
        format!("{:.2} GiB", gib)
    }
}

/// Parse a token count (e.g., "32k", "128K", "1m", "4096").
pub fn parse_context(s: &str) -> Result<u64, ToolError> {
    let lower = s.trim().to_lowercase();
    let invalid = || ToolError::InvalidSize(s.to_string());
    let (num, scale) = if let Some(num) = lower.strip_suffix('k') {
        (num, 1024)
    } else if let Some(num) = lower.strip_suffix('m') {
        (num, 1024 * 1024)
    } else {
        (lower.as_str(), 1)
    };
    num.parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .ok_or_else(invalid)
}

/// Parse a memory size in bytes. Suffixes are binary: "24g" and "24GiB" are
/// both 24 * 2^30. A bare number is bytes.
pub fn parse_size(s: &str) -> Result<u64, ToolError> {
    let lower = s.trim().to_lowercase();
    let invalid = || ToolError::InvalidSize(s.to_string());

    let split = lower
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(lower.len());
    let (num, unit) = lower.split_at(split);
    let scale = match unit.trim().trim_end_matches("ib").trim_end_matches('b') {
        "" => 1.0,
        "k" => 1024.0,
        "m" => 1024.0 * 1024.0,
        "g" => GIB,
        "t" => GIB * 1024.0,
        _ => return Err(invalid()),
    };
    let value: f64 = num.parse().map_err(|_| invalid())?;
    let bytes = (value * scale).round();
    if bytes.is_finite() && bytes >= 0.0 && bytes <= u64::MAX as f64 {
        Ok(bytes as u64)
    } else {
        Err(invalid())
    }
}

/// Parse a parameter count ("7b", "1.3B", "350m", "7e9", "7000000000").
pub fn parse_param_count(s: &str) -> Result<f64, ToolError> {
    let lower = s.trim().to_lowercase();
    let (num, scale) = match lower.char_indices().last() {
        Some((i, 't')) => (&lower[..i], 1e12),
        Some((i, 'b')) => (&lower[..i], 1e9),
        Some((i, 'm')) => (&lower[..i], 1e6),
        Some((i, 'k')) => (&lower[..i], 1e3),
        _ => (lower.as_str(), 1.0),
    };
    match num.trim().parse::<f64>() {
        Ok(n) if n.is_finite() && n > 0.0 => Ok(n * scale),
        _ => Err(ToolError::InvalidCount(s.to_string())),
    }
}

// ============================================================================
// Loading
// ============================================================================

fn read(path: &Path) -> Result<String, ToolError> {
    std::fs::read_to_string(path).map_err(|source| ToolError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn parse_error(path: &Path, err: impl std::fmt::Display) -> ToolError {
    ToolError::Parse {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

/// Parse an options document; TOML when `toml` is true, JSON otherwise.
pub fn parse_options(text: &str, toml: bool) -> Result<EstimateOptions, String> {
    if toml {
        toml::from_str(text).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(text).map_err(|e| e.to_string())
    }
}

/// Load and validate an options file. `.toml` files are TOML; anything else is JSON.
pub fn load_options(path: &Path) -> Result<EstimateOptions, ToolError> {
    let text = read(path)?;
    let is_toml = path.extension().and_then(|e| e.to_str()) == Some("toml");
    let options = parse_options(&text, is_toml).map_err(|e| parse_error(path, e))?;
    options.validate()?;
    Ok(options)
}

/// Load a raw model config (e.g. a Hugging Face `config.json`).
pub fn load_model_config(path: &Path) -> Result<Map<String, Value>, ToolError> {
    let text = read(path)?;
    match serde_json::from_str::<Value>(&text).map_err(|e| parse_error(path, e))? {
        Value::Object(map) => Ok(map),
        _ => Err(parse_error(path, "expected a JSON object")),
    }
}

/// Strict GPU parse for user-facing surfaces.
///
/// Unknown ids are rejected unless both the peak and bandwidth overrides are
/// set, in which case the estimate has everything it needs.
pub fn strict_gpu(id: &str, options: &EstimateOptions) -> Result<GpuTarget, ToolError> {
    match id.parse::<GpuModel>() {
        Ok(model) => Ok(model.into()),
        Err(_)
            if options.tensor_peaks_override_tflops.is_some()
                && options.gpu_bandwidth_override_gbs.is_some() =>
        {
            Ok(GpuTarget::Unlisted(id.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A size or count given either as a number or as a string with a suffix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Amount {
    Number(f64),
    Text(String),
}

impl Amount {
    /// Bytes: numbers are taken as bytes, strings go through [`parse_size`].
    pub fn bytes(&self) -> Result<u64, ToolError> {
        match self {
            Amount::Number(n) if n.is_finite() && *n >= 0.0 => Ok(n.round() as u64),
            Amount::Number(n) => Err(ToolError::InvalidSize(n.to_string())),
            Amount::Text(s) => parse_size(s),
        }
    }

    /// Parameter count: strings go through [`parse_param_count`].
    pub fn count(&self) -> Result<f64, ToolError> {
        match self {
            Amount::Number(n) if n.is_finite() && *n > 0.0 => Ok(*n),
            Amount::Number(n) => Err(ToolError::InvalidCount(n.to_string())),
            Amount::Text(s) => parse_param_count(s),
        }
    }
}

/// Everything needed for one estimation, in surface-friendly form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EstimateRequest {
    /// Raw model config. Exclusive with `preset`.
    pub config: Option<Map<String, Value>>,
    pub preset: Option<String>,
    pub num_params: Option<Amount>,
    pub gpu: Option<String>,
    /// Available memory per GPU. A single entry is repeated `gpus` times;
    /// when empty, the GPU's full memory from the capability table is used.
    pub gpu_memory: Vec<Amount>,
    pub gpus: Option<usize>,
    /// Defaults to the number of GPUs.
    pub tensor_parallel_degree: Option<u32>,
    pub precision: PrecisionSpec,
    pub options: EstimateOptions,
}

impl EstimateRequest {
    pub fn model_config(&self) -> Result<Map<String, Value>, ToolError> {
        match (&self.config, &self.preset) {
            (Some(config), None) => Ok(config.clone()),
            (None, Some(name)) => Ok(hyperparams::preset(name)?),
            (Some(_), Some(_)) => Err(ToolError::Conflict(
                "give either a model config or a preset, not both".to_string(),
            )),
            (None, None) => Err(ToolError::MissingArgument("config or preset")),
        }
    }

    pub fn gpu_target(&self) -> Result<GpuTarget, ToolError> {
        let id = self.gpu.as_deref().ok_or(ToolError::MissingArgument("gpu"))?;
        strict_gpu(id, &self.options)
    }

    /// Per-GPU available bytes.
    pub fn available_memory(&self, gpu: &GpuTarget) -> Result<Vec<u64>, ToolError> {
        if let Some(count) = self.gpus {
            Topology::check_gpu_count(count)?;
        }
        let given = self
            .gpu_memory
            .iter()
            .map(Amount::bytes)
            .collect::<Result<Vec<_>, _>>()?;

        match (given.len(), self.gpus) {
            (0, count) => {
                let spec = gpu.spec().ok_or(ToolError::MissingArgument("gpu_memory"))?;
                Ok(vec![(spec.memory_gib * GIB) as u64; count.unwrap_or(1)])
            }
            (1, Some(count)) => Ok(vec![given[0]; count]),
            (len, Some(count)) if len != count => Err(ToolError::Conflict(format!(
                "{len} memory entries for {count} GPUs"
            ))),
            _ => Ok(given),
        }
    }

    pub fn run(&self) -> Result<PerformanceReport, ToolError> {
        let config = self.model_config()?;
        let num_params = self.num_params.as_ref().map(Amount::count).transpose()?;
        let gpu = self.gpu_target()?;
        let memory = self.available_memory(&gpu)?;
        let tp = match self.tensor_parallel_degree {
            Some(tp) => tp,
            None => u32::try_from(memory.len()).unwrap_or(u32::MAX),
        };
        Ok(estimate(
            &config,
            num_params,
            &self.precision,
            tp,
            &memory,
            &gpu,
            &self.options,
        )?)
    }
}

// ============================================================================
// Fit Sweep
// ============================================================================

/// Worst-case fit of one model on one GPU model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitRow {
    pub gpu: String,
    pub name: String,
    pub gpu_count: usize,
    pub memory_gib_per_gpu: f64,
    pub fits: bool,
    pub worst_case_required_gb: f64,
    pub max_deficit_gb: f64,
    pub capacity_by_kv: u64,
    pub effective_batch: u64,
    pub conservative_tps: Option<f64>,
    pub dominant_leg: Option<Leg>,
}

/// Run `request` against each GPU model at its full table memory.
pub fn fit_sweep(request: &EstimateRequest, gpus: &[GpuModel]) -> Result<Vec<FitRow>, ToolError> {
    gpus.iter()
        .map(|&model| {
            let spec = model.spec();
            let per_model = EstimateRequest {
                gpu: Some(model.id().to_string()),
                gpu_memory: Vec::new(),
                ..request.clone()
            };
            let report = per_model.run()?;
            let worst = &report.memory.worst_case;
            Ok(FitRow {
                gpu: spec.id.to_string(),
                name: spec.name.to_string(),
                gpu_count: report.topology.gpu_count as usize,
                memory_gib_per_gpu: spec.memory_gib,
                fits: worst.fits_everywhere(),
                worst_case_required_gb: worst.required_gb_per_gpu,
                max_deficit_gb: worst.deficit_gb_per_gpu.iter().copied().fold(0.0, f64::max),
                capacity_by_kv: report.memory.concurrency.binding_capacity,
                effective_batch: report.memory.concurrency.effective_batch,
                conservative_tps: report.decode.conservative_tps,
                dominant_leg: report.decode.dominant_leg,
            })
        })
        .collect()
}

// ============================================================================
// Pretty Output
// ============================================================================

fn or_dash(value: Option<f64>, unit: &str) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.2}{unit}"))
}

/// Human-readable summary of a report.
pub fn format_report(report: &PerformanceReport) -> String {
    let t = &report.topology;
    let m = &report.memory;
    let d = &report.decode;
    let p = &report.prefill;

    let mut lines = vec![];
    lines.push(format!(
        "Estimate: {} x {} (tp={}){}",
        t.gpu_count,
        t.gpu_model,
        t.tensor_parallel_degree,
        if t.gpu_known { "" } else { " [unlisted]" }
    ));
    lines.push("─".repeat(50));

    lines.push("\nMemory per GPU:".to_string());
    lines.push(format!("  Weights:        {}", format_gib(m.weights_gb_per_gpu)));
    lines.push(format!("  Fixed:          {}", format_gib(m.fixed_gb_per_gpu)));
    lines.push(format!(
        "  KV per token:   {}",
        format_bytes(report.model.kv_bytes_per_token.round() as u64)
    ));
    lines.push(format!("  KV per user:    {}", format_gib(m.kv_gb_per_avg_user)));
    lines.push(format!("  Resident KV:    {}", format_gib(m.resident_kv_gb_per_gpu)));
    lines.push(format!("  Required:       {}", format_gib(m.required_gb_per_gpu)));

    lines.push("\nConcurrency:".to_string());
    lines.push(format!("  Capacity by KV: {:?}", m.capacity_by_kv_per_gpu));
    lines.push(format!(
        "  Batch:          {} (limited by {:?})",
        m.concurrency.effective_batch, m.concurrency.limited_by
    ));

    lines.push("\nDecode:".to_string());
    lines.push(format!("  Compute:        {}", or_dash(d.compute_ms_per_token, " ms/tok")));
    lines.push(format!("  HBM:            {}", or_dash(d.hbm_ms_per_token, " ms/tok")));
    lines.push(format!("  Interconnect:   {}", or_dash(d.interconnect_ms_per_token, " ms/tok")));
    lines.push(format!("  Dominant:       {:?}", d.dominant_leg));
    lines.push(format!("  Throughput:     {}", or_dash(d.conservative_tps, " tok/s")));
    lines.push(format!("  Per stream:     {}", or_dash(d.tps_per_stream, " tok/s")));

    lines.push("\nPrefill:".to_string());
    lines.push(format!("  Prompt:         {} tokens", p.prompt_len));
    lines.push(format!("  Latency:        {}", or_dash(p.latency_seconds, " s")));
    lines.push(format!("  End to end:     {}", or_dash(report.end_to_end_latency_seconds, " s")));

    let worst = &m.worst_case;
    lines.push(format!("\nWorst case ({} tokens):", worst.max_context_len));
    lines.push(format!("  Required:       {}", format_gib(worst.required_gb_per_gpu)));
    for (g, (fits, deficit)) in worst
        .fits_available_per_gpu
        .iter()
        .zip(&worst.deficit_gb_per_gpu)
        .enumerate()
    {
        let mark = if *fits { "✓".to_string() } else { format!("✗ short {}", format_gib(*deficit)) };
        lines.push(format!("  GPU {g}:          {mark}"));
    }

    if !report.warnings.is_empty() {
        lines.push("\nWarnings:".to_string());
        for warning in &report.warnings {
            lines.push(format!("  - {warning}"));
        }
    }

    lines.join("\n")
}
