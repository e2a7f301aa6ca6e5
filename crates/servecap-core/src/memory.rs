//! Per-GPU memory accounting: weights, fixed costs and a paged KV cache.
//!
//! The KV cache is sized in blocks of `kv_block_size_tokens` tokens, the way
//! a paged-attention allocator hands memory to sequences, and inflated by a
//! fragmentation factor. Two figures come out of the same model:
//!
//! - the *current configuration*: fixed costs plus the resident KV of the
//!   auto-sized batch, and
//! - the *worst case*: one request at the model's maximum context length,
//!   compared against raw available memory with no headroom budgeting.

use crate::batch::ConcurrencyDecision;
use crate::hyperparams::ModelHyperparameters;
use crate::options::EstimateOptions;
use crate::perf::safe_div;
use crate::precision::DType;
use crate::topology::Topology;
use serde::Serialize;

pub const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub(crate) fn gib(bytes: f64) -> f64 {
    bytes / GIB
}

/// Multiplier on raw weight bytes for packing overhead.
pub fn quant_overhead(weight: DType, options: &EstimateOptions) -> f64 {
    if weight.is_packed_4bit() {
        options.quant_overhead_fp4
    } else {
        1.0
    }
}

/// Total weight bytes of the unsharded model.
pub fn weight_bytes(num_params: f64, weight: DType, quant_overhead: f64) -> f64 {
    num_params * weight.bytes() * quant_overhead
}

/// Max context length for the worst-case check: explicit option, then the
/// model config, then one average request.
pub fn max_context_len(hp: &ModelHyperparameters, options: &EstimateOptions) -> u64 {
    options
        .max_model_len
        .or(hp.max_context_len)
        .unwrap_or_else(|| options.avg_prompt_len.saturating_add(options.avg_output_len))
}

// ============================================================================
// KV Block Model
// ============================================================================

/// Block-granular KV cache geometry on one GPU.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KvBlockModel {
    pub block_size_tokens: u64,
    pub fragmentation_factor: f64,
    /// KV heads held by one GPU; fractional when a GQA model has fewer KV
    /// heads than the tensor-parallel degree.
    pub local_kv_heads: f64,
    pub bytes_per_block: f64,
}

impl KvBlockModel {
    pub fn new(
        hp: &ModelHyperparameters,
        kv: DType,
        topology: &Topology,
        options: &EstimateOptions,
    ) -> Self {
        let shards = if options.kv_sharded_across_tp {
            topology.tp()
        } else {
            1.0
        };
        let local_kv_heads = hp.num_key_value_heads as f64 / shards;
        // K and V
        let bytes_per_block = 2.0
            * local_kv_heads
            * hp.head_dim as f64
            * hp.num_layers as f64
            * kv.bytes()
            * options.kv_block_size_tokens as f64;
        Self {
            block_size_tokens: options.kv_block_size_tokens,
            fragmentation_factor: options.kv_fragmentation,
            local_kv_heads,
            bytes_per_block,
        }
    }

    pub fn bytes_per_token(&self) -> f64 {
        self.bytes_per_block / self.block_size_tokens as f64
    }

    /// Blocks a sequence of `tokens` occupies. A sequence always holds at least one block.
    pub fn blocks_for(&self, tokens: u64) -> u64 {
        tokens.div_ceil(self.block_size_tokens).max(1)
    }

    /// KV bytes of one sequence, block-rounded and fragmentation-inflated.
    pub fn sequence_bytes(&self, tokens: u64) -> f64 {
        self.blocks_for(tokens) as f64 * self.bytes_per_block * self.fragmentation_factor
    }
}

// ============================================================================
// Budget and Capacity
// ============================================================================

/// Fixed per-GPU costs against the available-memory vector.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryBudget {
    pub per_gpu_available_bytes: Vec<u64>,
    pub weights_per_shard_bytes: f64,
    pub runtime_overhead_bytes: f64,
    pub activation_reserve_bytes: f64,
    pub allocator_headroom: f64,
    /// (shard + runtime overhead + activation reserve) / headroom
    pub fixed_per_gpu_bytes: f64,
}

impl MemoryBudget {
    pub fn new(available: &[u64], weights_per_shard_bytes: f64, options: &EstimateOptions) -> Self {
        let runtime_overhead_bytes = options.runtime_overhead_gib * GIB;
        let activation_reserve_bytes = options.activation_reserve_gib * GIB;
        let unreserved = weights_per_shard_bytes + runtime_overhead_bytes + activation_reserve_bytes;
        Self {
            per_gpu_available_bytes: available.to_vec(),
            weights_per_shard_bytes,
            runtime_overhead_bytes,
            activation_reserve_bytes,
            allocator_headroom: options.allocator_headroom,
            fixed_per_gpu_bytes: unreserved / options.allocator_headroom,
        }
    }

    /// Fixed costs before the allocator headroom is applied.
    pub fn unreserved_bytes(&self) -> f64 {
        self.weights_per_shard_bytes + self.runtime_overhead_bytes + self.activation_reserve_bytes
    }

    /// Sequences of `kv_per_user` bytes each GPU can hold after fixed costs.
    pub fn capacity_by_kv(&self, kv_per_user: f64) -> Vec<u64> {
        self.per_gpu_available_bytes
            .iter()
            .map(|&available| sequence_capacity(available, self.fixed_per_gpu_bytes, kv_per_user))
            .collect()
    }
}

/// `floor(max(0, available - fixed) / kv_per_user)`; 0 when a sequence has no size.
pub fn sequence_capacity(available: u64, fixed: f64, kv_per_user: f64) -> u64 {
    let free = (available as f64 - fixed).max(0.0);
    safe_div(free, kv_per_user)
        .map(|n| n.floor() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Reports
// ============================================================================

/// Feasibility of a single request at max context, independent of batching.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorstCaseReport {
    pub max_context_len: u64,
    pub kv_gb: f64,
    pub required_gb_per_gpu: f64,
    #[serde(rename = "fits_available_perGPU")]
    pub fits_available_per_gpu: Vec<bool>,
    #[serde(rename = "deficit_gb_perGPU")]
    pub deficit_gb_per_gpu: Vec<f64>,
}

impl WorstCaseReport {
    pub fn fits_everywhere(&self) -> bool {
        self.fits_available_per_gpu.iter().all(|&fits| fits)
    }
}

/// Worst-case check: weights, runtime overhead, activation reserve and the
/// KV of one max-context request against each GPU's raw available bytes.
pub fn worst_case(budget: &MemoryBudget, kv: &KvBlockModel, max_context_len: u64) -> WorstCaseReport {
    let kv_bytes = kv.sequence_bytes(max_context_len);
    let required = budget.unreserved_bytes() + kv_bytes;

    let (fits, deficits): (Vec<bool>, Vec<f64>) = budget
        .per_gpu_available_bytes
        .iter()
        .map(|&available| {
            let deficit = (required - available as f64).max(0.0);
            (deficit == 0.0, gib(deficit))
        })
        .unzip();

    WorstCaseReport {
        max_context_len,
        kv_gb: gib(kv_bytes),
        required_gb_per_gpu: gib(required),
        fits_available_per_gpu: fits,
        deficit_gb_per_gpu: deficits,
    }
}

/// Memory picture of one estimation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryReport {
    pub total_weights_gb: f64,
    #[serde(rename = "perGPU_weights_gb")]
    pub weights_gb_per_gpu: f64,
    pub quant_overhead: f64,
    pub runtime_overhead_gb: f64,
    pub activation_reserve_gb: f64,
    pub allocator_headroom: f64,
    pub fixed_gb_per_gpu: f64,
    pub kv_block: KvBlockModel,
    pub kv_bytes_per_token: f64,
    pub kv_gb_per_avg_user: f64,
    pub available_gb_per_gpu: Vec<f64>,
    pub capacity_by_kv_per_gpu: Vec<u64>,
    pub concurrency: ConcurrencyDecision,
    pub resident_kv_gb_per_gpu: f64,
    #[serde(rename = "perGPU_required_gb")]
    pub required_gb_per_gpu: f64,
    /// `required / available` per GPU, capped at 1; the fraction of memory a
    /// serving engine should be allowed to claim.
    pub recommended_gpu_memory_fraction: Vec<f64>,
    pub worst_case: WorstCaseReport,
}

/// Inputs to [`report`] that are fixed before the batch is sized.
pub struct MemoryInputs<'a> {
    pub budget: &'a MemoryBudget,
    pub kv: &'a KvBlockModel,
    pub topology: &'a Topology,
    pub quant_overhead: f64,
    pub kv_per_user_bytes: f64,
    pub max_context_len: u64,
}

/// Assemble the memory report for the chosen batch.
pub fn report(
    inputs: MemoryInputs<'_>,
    decision: ConcurrencyDecision,
    options: &EstimateOptions,
) -> MemoryReport {
    let MemoryInputs {
        budget,
        kv,
        topology,
        quant_overhead,
        kv_per_user_bytes,
        max_context_len,
    } = inputs;

    let resident_tokens = options.avg_prompt_len.saturating_add(options.avg_generated_so_far);
    let resident_kv = decision.effective_batch as f64 * kv.sequence_bytes(resident_tokens);
    let required = budget.fixed_per_gpu_bytes + resident_kv;

    let recommended = budget
        .per_gpu_available_bytes
        .iter()
        .map(|&available| safe_div(required, available as f64).map_or(0.0, |f| f.min(1.0)))
        .collect();

    MemoryReport {
        total_weights_gb: gib(budget.weights_per_shard_bytes * topology.tp()),
        weights_gb_per_gpu: gib(budget.weights_per_shard_bytes),
        quant_overhead,
        runtime_overhead_gb: gib(budget.runtime_overhead_bytes),
        activation_reserve_gb: gib(budget.activation_reserve_bytes),
        allocator_headroom: budget.allocator_headroom,
        fixed_gb_per_gpu: gib(budget.fixed_per_gpu_bytes),
        kv_block: *kv,
        kv_bytes_per_token: kv.bytes_per_token(),
        kv_gb_per_avg_user: gib(kv_per_user_bytes),
        available_gb_per_gpu: budget
            .per_gpu_available_bytes
            .iter()
            .map(|&b| gib(b as f64))
            .collect(),
        capacity_by_kv_per_gpu: decision.capacity_by_kv_per_gpu.clone(),
        concurrency: decision,
        resident_kv_gb_per_gpu: gib(resident_kv),
        required_gb_per_gpu: gib(required),
        recommended_gpu_memory_fraction: recommended,
        worst_case: worst_case(budget, kv, max_context_len),
    }
}
