//! Decode-phase throughput: one generated token per active sequence per step.

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

/// Decode throughput of the effective batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodeReport {
    pub batch: u64,
    /// Tokens attended to by each generated token.
    pub prefix_len: u64,
    pub flops_per_token: f64,
    pub hbm_bytes_per_token: f64,
    pub interconnect_bytes_per_token: f64,
    pub compute_ms_per_token: Option<f64>,
    pub hbm_ms_per_token: Option<f64>,
    pub interconnect_ms_per_token: Option<f64>,
    pub dominant_leg: Option<Leg>,
    pub step_floor_ms: f64,
    /// Legs charged back to back.
    pub step_ms: Option<f64>,
    pub conservative_tps: Option<f64>,
    /// Legs fully overlapped.
    pub optimistic_tps: Option<f64>,
    pub tps_per_stream: Option<f64>,
    /// Time to generate `avg_output_len` tokens for one stream.
    pub decode_seconds: Option<f64>,
}

/// FLOPs per generated token per GPU: dense projections plus attention
/// scores and weighted sum over the prefix.
pub fn flops_per_token(hp: &ModelHyperparameters, prefix_len: u64, topology: &Topology) -> f64 {
    let attention = 4.0 * hp.hidden_size as f64 * prefix_len as f64;
    2.0 * hp.num_layers as f64 * (dense_macs_per_token(hp) + attention) / topology.tp()
}

/// HBM bytes per generated token per GPU: read the prefix KV, write one
/// token of KV, and move activations.
pub fn hbm_bytes_per_token(
    hp: &ModelHyperparameters,
    precision: &PrecisionSpec,
    kv: &KvBlockModel,
    prefix_len: u64,
    topology: &Topology,
) -> f64 {
    let kv_token = kv.bytes_per_token();
    prefix_len as f64 * kv_token + kv_token + activation_bytes_per_token(hp, precision.activation, topology)
}

/// Run the decode model for `batch` concurrent sequences.
pub fn model(
    hp: &ModelHyperparameters,
    precision: &PrecisionSpec,
    topology: &Topology,
    kv: &KvBlockModel,
    hardware: &EffectiveHardware,
    batch: u64,
    options: &EstimateOptions,
) -> DecodeReport {
    let prefix_len = options.decode_prefix();
    let flops = flops_per_token(hp, prefix_len, topology);
    let hbm_bytes = hbm_bytes_per_token(hp, precision, kv, prefix_len, topology);
    let interconnect_bytes = collective_bytes_per_token(hp, precision.activation, topology);

    let legs = LegTimes {
        compute: hardware.compute_ms(flops),
        hbm: hardware.hbm_ms(hbm_bytes),
        interconnect: hardware.interconnect_ms(interconnect_bytes, collectives_per_token(hp)),
    };

    let floor = hardware.step_floor_ms;
    let step = step_ms(batch, legs.serial(), floor);
    let overlapped_step = step_ms(batch, legs.overlapped(), floor);
    let throughput = |step: Option<f64>| step.and_then(|s| safe_div(1000.0 * batch as f64, s));

    let conservative_tps = throughput(step);
    let tps_per_stream = conservative_tps.and_then(|tps| safe_div(tps, batch as f64));
    let decode_seconds = tps_per_stream.and_then(|per| safe_div(options.avg_output_len as f64, per));
    let dominant_leg = legs.dominant();

    debug!(
        batch,
        prefix_len,
        ?dominant_leg,
        ?conservative_tps,
        "decode model"
    );

    DecodeReport {
        batch,
        prefix_len,
        flops_per_token: flops,
        hbm_bytes_per_token: hbm_bytes,
        interconnect_bytes_per_token: interconnect_bytes,
        compute_ms_per_token: legs.compute,
        hbm_ms_per_token: legs.hbm,
        interconnect_ms_per_token: legs.interconnect,
        dominant_leg,
        step_floor_ms: floor,
        step_ms: step,
        conservative_tps,
        optimistic_tps: throughput(overlapped_step),
        tps_per_stream,
        decode_seconds,
    }
}
