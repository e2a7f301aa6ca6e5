//! The immutable report returned by an estimation, and the warnings that
//! explain degenerate figures in it.

use crate::batch::BatchLimit;
use crate::decode::DecodeReport;
use crate::hardware::GpuTarget;
use crate::hyperparams::ModelHyperparameters;
use crate::memory::MemoryReport;
use crate::perf::{finite, EffectiveHardware};
use crate::prefill::PrefillReport;
use crate::precision::PrecisionSpec;
use crate::topology::Topology;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyReport {
    pub gpu_count: u32,
    pub tensor_parallel_degree: u32,
    pub single_gpu: bool,
    pub gpu_model: String,
    /// False when the GPU id is not in the capability table.
    pub gpu_known: bool,
    pub hardware: EffectiveHardware,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelReport {
    pub hyperparameters: ModelHyperparameters,
    pub precision: PrecisionSpec,
    pub uses_gqa: bool,
    pub gqa_ratio: f64,
    /// Per GPU, before block rounding and fragmentation.
    pub kv_bytes_per_token: f64,
}

/// Everything one estimation produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub topology: TopologyReport,
    pub model: ModelReport,
    pub memory: MemoryReport,
    pub decode: DecodeReport,
    pub prefill: PrefillReport,
    /// Prefill latency plus the time to decode `avg_output_len` tokens.
    pub end_to_end_latency_seconds: Option<f64>,
    pub warnings: Vec<String>,
}

impl PerformanceReport {
    /// True when one max-context request fits on every GPU.
    pub fn fits(&self) -> bool {
        self.memory.worst_case.fits_everywhere()
    }
}

/// Parts computed by the pipeline, consumed by [`assemble`].
pub struct ReportParts<'a> {
    pub hyperparameters: &'a ModelHyperparameters,
    pub precision: &'a PrecisionSpec,
    pub topology: &'a Topology,
    pub gpu: &'a GpuTarget,
    pub hardware: EffectiveHardware,
    pub memory: MemoryReport,
    pub decode: DecodeReport,
    pub prefill: PrefillReport,
}

pub fn assemble(parts: ReportParts<'_>) -> PerformanceReport {
    let warnings = collect_warnings(&parts);
    let ReportParts {
        hyperparameters,
        precision,
        topology,
        gpu,
        hardware,
        memory,
        decode,
        prefill,
    } = parts;

    let end_to_end_latency_seconds = match (prefill.latency_seconds, decode.decode_seconds) {
        (Some(prefill), Some(decode)) => finite(prefill + decode),
        _ => None,
    };

    PerformanceReport {
        topology: TopologyReport {
            gpu_count: topology.gpu_count,
            tensor_parallel_degree: topology.tensor_parallel_degree,
            single_gpu: topology.single_gpu(),
            gpu_model: gpu.id().to_string(),
            gpu_known: gpu.is_known(),
            hardware,
        },
        model: ModelReport {
            hyperparameters: hyperparameters.clone(),
            precision: *precision,
            uses_gqa: hyperparameters.uses_gqa(),
            gqa_ratio: hyperparameters.gqa_ratio(),
            kv_bytes_per_token: memory.kv_bytes_per_token,
        },
        memory,
        decode,
        prefill,
        end_to_end_latency_seconds,
        warnings,
    }
}

fn collect_warnings(parts: &ReportParts<'_>) -> Vec<String> {
    let mut warnings = Vec::new();
    let hw = &parts.hardware;
    let concurrency = &parts.memory.concurrency;

    match parts.gpu {
        GpuTarget::Unlisted(id) if hw.peak_tflops == 0.0 || hw.bandwidth_gbs == 0.0 => {
            warnings.push(format!(
                "GPU '{id}' is not in the capability table; set tensor_peaks_override_tflops \
                 and gpu_bandwidth_override_gbs for performance figures"
            ));
        }
        GpuTarget::Known(model) if hw.peak_tflops == 0.0 => {
            warnings.push(format!(
                "{model} has no tensor peak for {} math with {} accumulate; compute leg unavailable",
                parts.precision.math,
                parts.precision.accumulate.as_str()
            ));
        }
        _ => {}
    }

    if concurrency.binding_capacity == 0 {
        warnings.push(
            "no room for a single average request after fixed costs; batch forced to 1".to_string(),
        );
    } else if concurrency.limited_by == BatchLimit::SchedulerCap {
        warnings.push(format!(
            "scheduler cap of {} sequences binds below requested users and KV capacity",
            concurrency.effective_batch
        ));
    }

    let worst = &parts.memory.worst_case;
    if !worst.fits_everywhere() {
        let short: Vec<String> = worst
            .fits_available_per_gpu
            .iter()
            .enumerate()
            .filter(|(_, fits)| !**fits)
            .map(|(g, _)| g.to_string())
            .collect();
        warnings.push(format!(
            "one {}-token request does not fit on GPU {}",
            worst.max_context_len,
            short.join(", ")
        ));
    }

    if parts.prefill.prompt_capped {
        warnings.push(format!(
            "prompt length capped at max context of {} tokens",
            parts.prefill.prompt_len
        ));
    }

    for warning in &warnings {
        warn!("{warning}");
    }
    warnings
}
