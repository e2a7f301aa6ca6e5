//! Three-leg bottleneck model shared by the decode and prefill estimators.
//!
//! Each unit of work (one decode token, one prompt) is charged independently
//! on three legs: tensor compute, on-chip memory (HBM/GDDR) traffic and
//! inter-GPU interconnect traffic. Leg times are `None` when the hardware
//! throughput behind them is unknown or zero.

use crate::hardware::{host_bounce_gbs, GpuTarget, PcieGeneration};
use crate::hyperparams::ModelHyperparameters;
use crate::memory::GIB;
use crate::options::EstimateOptions;
use crate::precision::{DType, PrecisionSpec};
use crate::topology::Topology;
use serde::Serialize;

/// `num / den`, or `None` when the denominator is not positive or the result is not finite.
pub fn safe_div(num: f64, den: f64) -> Option<f64> {
    if den > 0.0 {
        finite(num / den)
    } else {
        None
    }
}

/// `Some(x)` unless `x` is NaN or infinite.
pub fn finite(x: f64) -> Option<f64> {
    x.is_finite().then_some(x)
}

// ============================================================================
// Legs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Compute,
    Hbm,
    Interconnect,
}

/// Time charged to each leg for one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LegTimes {
    pub compute: Option<f64>,
    pub hbm: Option<f64>,
    pub interconnect: Option<f64>,
}

impl LegTimes {
    fn legs(&self) -> [(Leg, Option<f64>); 3] {
        [
            (Leg::Compute, self.compute),
            (Leg::Hbm, self.hbm),
            (Leg::Interconnect, self.interconnect),
        ]
    }

    /// Leg with the largest known, non-zero time. Ties resolve in compute,
    /// hbm, interconnect order.
    pub fn dominant(&self) -> Option<Leg> {
        self.legs()
            .into_iter()
            .filter_map(|(leg, time)| time.filter(|&t| t > 0.0).map(|t| (leg, t)))
            .fold(None, |best: Option<(Leg, f64)>, (leg, t)| match best {
                Some((_, best_t)) if best_t >= t => best,
                _ => Some((leg, t)),
            })
            .map(|(leg, _)| leg)
    }

    /// Legs run back to back. `None` if any leg is unknown.
    pub fn serial(&self) -> Option<f64> {
        Some(self.compute? + self.hbm? + self.interconnect?)
    }

    /// Legs fully overlapped. `None` if any leg is unknown.
    pub fn overlapped(&self) -> Option<f64> {
        Some(self.compute?.max(self.hbm?).max(self.interconnect?))
    }
}

// ============================================================================
// Effective Hardware
// ============================================================================

/// Hardware throughput after utilization derating.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EffectiveHardware {
    pub peak_tflops: f64,
    pub bandwidth_gbs: f64,
    pub pcie_generation: PcieGeneration,
    /// Host-bounce bandwidth before interconnect utilization.
    pub interconnect_gbs: f64,
    pub compute_flops_per_s: f64,
    pub hbm_bytes_per_s: f64,
    pub interconnect_bytes_per_s: f64,
    pub collective_latency_ms: f64,
    pub step_floor_ms: f64,
    pub single_gpu: bool,
}

impl EffectiveHardware {
    /// Resolve peaks from the GPU table, with overrides taking precedence.
    ///
    /// Bandwidths are in GB/s and converted with 1 GB = 2^30 bytes, the same
    /// unit the memory report uses.
    pub fn new(
        gpu: &GpuTarget,
        precision: &PrecisionSpec,
        topology: &Topology,
        options: &EstimateOptions,
    ) -> Self {
        let spec = gpu.spec();
        let peak_tflops = options.tensor_peaks_override_tflops.unwrap_or_else(|| {
            spec.map_or(0.0, |s| s.peaks.lookup(precision.math, precision.accumulate))
        });
        let bandwidth_gbs = options
            .gpu_bandwidth_override_gbs
            .unwrap_or_else(|| spec.map_or(0.0, |s| s.bandwidth_gbs));
        let pcie_generation = options
            .interconnect
            .pcie_generation
            .or(spec.map(|s| s.pcie))
            .unwrap_or(PcieGeneration::Gen4);
        let interconnect_gbs =
            host_bounce_gbs(pcie_generation, &options.interconnect, topology.gpu_count);

        let util = &options.utilization;
        Self {
            peak_tflops,
            bandwidth_gbs,
            pcie_generation,
            interconnect_gbs,
            compute_flops_per_s: peak_tflops * util.compute_utilization * 1e12,
            hbm_bytes_per_s: bandwidth_gbs * util.hbm_utilization * GIB,
            interconnect_bytes_per_s: interconnect_gbs * util.interconnect_utilization * GIB,
            collective_latency_ms: options.collective_latency_us / 1000.0,
            step_floor_ms: options.step_floor_ms,
            single_gpu: topology.single_gpu(),
        }
    }

    pub fn compute_ms(&self, flops: f64) -> Option<f64> {
        safe_div(flops, self.compute_flops_per_s).map(|s| s * 1000.0)
    }

    pub fn hbm_ms(&self, bytes: f64) -> Option<f64> {
        safe_div(bytes, self.hbm_bytes_per_s).map(|s| s * 1000.0)
    }

    /// Transfer time plus a fixed latency per collective. Always 0 on a single GPU.
    pub fn interconnect_ms(&self, bytes: f64, collectives: f64) -> Option<f64> {
        if self.single_gpu {
            return Some(0.0);
        }
        safe_div(bytes, self.interconnect_bytes_per_s)
            .map(|s| s * 1000.0 + collectives * self.collective_latency_ms)
    }
}

/// Milliseconds of one scheduler step: `batch` units of work plus the floor.
pub fn step_ms(batch: u64, per_unit_ms: Option<f64>, floor_ms: f64) -> Option<f64> {
    per_unit_ms.and_then(|t| finite(batch as f64 * t + floor_ms))
}

// ============================================================================
// Traffic Shared by Both Phases
// ============================================================================

/// Tensor-parallel collectives per token: two all-reduces per layer
/// (after attention and after the FFN).
pub fn collectives_per_token(hp: &ModelHyperparameters) -> f64 {
    2.0 * hp.num_layers as f64
}

/// Interconnect bytes per token per GPU.
///
/// Each collective moves one hidden vector through a ring (`2 (t-1)/t` of
/// the payload), doubled again because every hop bounces through host memory.
pub fn collective_bytes_per_token(hp: &ModelHyperparameters, activation: DType, topology: &Topology) -> f64 {
    if topology.single_gpu() {
        return 0.0;
    }
    let t = topology.tp();
    let ring = 2.0 * (t - 1.0) / t;
    let no_peer_link = 2.0;
    collectives_per_token(hp) * hp.hidden_size as f64 * activation.bytes() * ring * no_peer_link
}

/// Activation read/write traffic per token per GPU.
pub fn activation_bytes_per_token(hp: &ModelHyperparameters, activation: DType, topology: &Topology) -> f64 {
    8.0 * (hp.hidden_size as f64 / topology.tp()) * activation.bytes() * hp.num_layers as f64
}

/// Dense projection MACs per token per layer: QKVO (`4 d^2`) and the FFN (`4 d ffn`).
pub(crate) fn dense_macs_per_token(hp: &ModelHyperparameters) -> f64 {
    let d = hp.hidden_size as f64;
    4.0 * d * d + 4.0 * d * hp.intermediate_size as f64
}
