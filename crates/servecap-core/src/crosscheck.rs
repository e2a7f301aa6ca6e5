//! Rule-of-thumb VRAM figure for sanity-checking the fixed-cost model.
//!
//! The common back-of-envelope estimate is "weights plus 20%". It is never
//! used for sizing; it exists so that a canonical estimate that drifts far
//! from it stands out.

use crate::memory::{gib, MemoryReport};
use crate::perf::safe_div;
use crate::precision::DType;
use crate::topology::Topology;
use serde::Serialize;

/// Framework overhead assumed by the rule of thumb.
pub const RULE_OF_THUMB_OVERHEAD: f64 = 1.2;

/// `num_params * bytes * 1.2 / tp`.
pub fn rule_of_thumb_bytes(num_params: f64, weight: DType, topology: &Topology) -> f64 {
    num_params * weight.bytes() * RULE_OF_THUMB_OVERHEAD / topology.tp()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Crosscheck {
    pub rule_of_thumb_gb_per_gpu: f64,
    pub fixed_gb_per_gpu: f64,
    /// `(fixed - rule_of_thumb) / fixed`
    pub relative_gap: Option<f64>,
}

/// Compare the per-GPU fixed cost of a memory report against the rule of thumb.
pub fn compare(num_params: f64, weight: DType, topology: &Topology, memory: &MemoryReport) -> Crosscheck {
    let rule_of_thumb_gb_per_gpu = gib(rule_of_thumb_bytes(num_params, weight, topology));
    let fixed = memory.fixed_gb_per_gpu;
    Crosscheck {
        rule_of_thumb_gb_per_gpu,
        fixed_gb_per_gpu: fixed,
        relative_gap: safe_div(fixed - rule_of_thumb_gb_per_gpu, fixed),
    }
}
