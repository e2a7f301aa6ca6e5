//! Prefill-phase latency: the whole prompt of every batched request in one step.

use crate::hyperparams::ModelHyperparameters;
use crate::memory::KvBlockModel;
use crate::options::EstimateOptions;
use crate::perf::{
    activation_bytes_per_token, collective_bytes_per_token, collectives_per_token,
    dense_macs_per_token, safe_div, step_ms, EffectiveHardware, Leg, LegTimes,
};
use crate::precision::PrecisionSpec;
use crate::topology::Topology;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrefillReport {
    pub batch: u64,
    pub prompt_len: u64,
    /// The requested prompt was longer than the max context and was cut.
    pub prompt_capped: bool,
    pub flops_per_prompt: f64,
    pub hbm_bytes_per_prompt: f64,
    pub interconnect_bytes_per_prompt: f64,
    pub compute_seconds_prefill: Option<f64>,
    pub hbm_seconds_prefill: Option<f64>,
    pub interconnect_seconds_prefill: Option<f64>,
    pub dominant_leg: Option<Leg>,
    /// Time to first token for a full batch of prompts.
    pub latency_seconds: Option<f64>,
    pub prompt_tps: Option<f64>,
}

/// Prompt length for prefill, never above the max context length.
///
/// Returns the length and whether it was capped.
pub fn prompt_len(options: &EstimateOptions, max_context_len: u64) -> (u64, bool) {
    let requested = options.prompt_len.unwrap_or(options.avg_prompt_len);
    (requested.min(max_context_len), requested > max_context_len)
}

/// FLOPs per prompt per GPU. Causal attention over a prompt of `n` tokens
/// touches `n (n + 1) / 2` query/key pairs.
pub fn flops_per_prompt(hp: &ModelHyperparameters, prompt_len: u64, topology: &Topology) -> f64 {
    let n = prompt_len as f64;
    let d = hp.hidden_size as f64;
    let causal = 4.0 * d * n * (n + 1.0) / 2.0;
    2.0 * hp.num_layers as f64 * (dense_macs_per_token(hp) * n + causal) / topology.tp()
}

/// Run the prefill model for `batch` prompts arriving together.
#[allow(clippy::too_many_arguments)]
pub fn model(
    hp: &ModelHyperparameters,
    precision: &PrecisionSpec,
    topology: &Topology,
    kv: &KvBlockModel,
    hardware: &EffectiveHardware,
    batch: u64,
    max_context_len: u64,
    options: &EstimateOptions,
) -> PrefillReport {
    let (prompt_len, prompt_capped) = prompt_len(options, max_context_len);
    let n = prompt_len as f64;

    let flops = flops_per_prompt(hp, prompt_len, topology);
    let hbm_bytes = n * kv.bytes_per_token() + n * activation_bytes_per_token(hp, precision.activation, topology);
    let interconnect_bytes = n * collective_bytes_per_token(hp, precision.activation, topology);

    let legs = LegTimes {
        compute: hardware.compute_ms(flops),
        hbm: hardware.hbm_ms(hbm_bytes),
        interconnect: hardware.interconnect_ms(interconnect_bytes, collectives_per_token(hp)),
    };
    let seconds = |ms: Option<f64>| ms.map(|ms| ms / 1000.0);

    let latency_seconds = seconds(step_ms(batch, legs.serial(), hardware.step_floor_ms));
    let prompt_tps = latency_seconds.and_then(|s| safe_div(batch as f64 * n, s));
    let dominant_leg = legs.dominant();

    debug!(batch, prompt_len, ?dominant_leg, ?latency_seconds, "prefill model");

    PrefillReport {
        batch,
        prompt_len,
        prompt_capped,
        flops_per_prompt: flops,
        hbm_bytes_per_prompt: hbm_bytes,
        interconnect_bytes_per_prompt: interconnect_bytes,
        compute_seconds_prefill: seconds(legs.compute),
        hbm_seconds_prefill: seconds(legs.hbm),
        interconnect_seconds_prefill: seconds(legs.interconnect),
        dominant_leg,
        latency_seconds,
        prompt_tps,
    }
}
