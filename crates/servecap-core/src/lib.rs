//! Capacity and performance estimation for serving dense transformer LLMs.
//!
//! Given a model architecture, numeric precisions, a GPU model and the memory
//! available on each GPU of a tensor-parallel group, [`estimate`] answers:
//! - how much memory the weights, fixed costs and KV cache take per GPU
//! - how many concurrent sequences fit, and what batch the server should run
//! - decode tokens/second and prefill latency, split into compute, HBM and
//!   interconnect legs with the dominant leg called out
//! - whether a single request at maximum context fits at all
//!
//! Estimation is a pure function of its inputs. Degenerate numerics (an
//! unknown peak, a zero bandwidth) become `None` fields and report warnings;
//! only malformed inputs are errors.
//!
//! # Example
//!
//! ```
//! use servecap_core::{estimate, hyperparams, EstimateOptions, GpuModel, PrecisionSpec, GIB};
//!
//! let config = hyperparams::preset("llama-2-7b").unwrap();
//! let report = estimate(
//!     &config,
//!     Some(7e9),
//!     &PrecisionSpec::default(),
//!     1,
//!     &[24 * GIB as u64],
//!     &GpuModel::Rtx4090.into(),
//!     &EstimateOptions::default(),
//! )
//! .unwrap();
//! assert!(report.fits());
//! assert!(report.decode.conservative_tps.is_some());
//! ```

pub mod batch;
pub mod crosscheck;
pub mod decode;
pub mod error;
pub mod hardware;
pub mod hyperparams;
pub mod memory;
pub mod options;
pub mod perf;
pub mod precision;
pub mod prefill;
pub mod report;
pub mod topology;

pub use batch::{BatchLimit, ConcurrencyDecision};
pub use error::{EstimateError, Result};
pub use hardware::{GpuModel, GpuSpec, GpuTarget, PcieGeneration};
pub use hyperparams::ModelHyperparameters;
pub use memory::{KvBlockModel, MemoryBudget, MemoryReport, WorstCaseReport, GIB};
pub use options::{EstimateOptions, InterconnectOptions, UtilizationOptions};
pub use perf::Leg;
pub use precision::{Accumulate, DType, PrecisionSpec};
pub use report::PerformanceReport;
pub use topology::Topology;

use serde_json::{Map, Value};
use tracing::debug;

/// Estimate memory, concurrency and throughput for one deployment.
///
/// # Arguments
/// * `config` - Raw model config map; alias keys are resolved
/// * `num_params` - Parameter count; derived from the config when `None`
/// * `precision` - Weight, activation, KV and math formats
/// * `tensor_parallel_degree` - GPUs each layer is sharded across
/// * `available_gpu_memory_bytes` - Memory available on each GPU, one entry per GPU
/// * `gpu` - GPU model, or an unlisted id
/// * `options` - Workload and tuning knobs
///
/// # Errors
/// - `Configuration` / `InvalidHyperparameter` from hyperparameter resolution
/// - `InvalidTopology` for an empty memory vector or a bad parallel degree
/// - `InvalidOption` for options outside their domain
pub fn estimate(
    config: &Map<String, Value>,
    num_params: Option<f64>,
    precision: &PrecisionSpec,
    tensor_parallel_degree: u32,
    available_gpu_memory_bytes: &[u64],
    gpu: &GpuTarget,
    options: &EstimateOptions,
) -> Result<PerformanceReport> {
    let hp = hyperparams::resolve(config, num_params)?;
    estimate_resolved(
        &hp,
        precision,
        tensor_parallel_degree,
        available_gpu_memory_bytes,
        gpu,
        options,
    )
}

/// [`estimate`] for an already resolved model.
pub fn estimate_resolved(
    hp: &ModelHyperparameters,
    precision: &PrecisionSpec,
    tensor_parallel_degree: u32,
    available_gpu_memory_bytes: &[u64],
    gpu: &GpuTarget,
    options: &EstimateOptions,
) -> Result<PerformanceReport> {
    hp.validate()?;
    let topology = Topology::new(available_gpu_memory_bytes.len(), tensor_parallel_degree)?;
    options.validate()?;

    // Memory
    let quant_overhead = memory::quant_overhead(precision.weight, options);
    let shard_bytes = memory::weight_bytes(hp.num_params, precision.weight, quant_overhead)
        / tensor_parallel_degree as f64;
    let kv = KvBlockModel::new(hp, precision.kv, &topology, options);
    let budget = MemoryBudget::new(available_gpu_memory_bytes, shard_bytes, options);
    let kv_per_user_bytes = kv.sequence_bytes(options.avg_prompt_len);
    let max_context_len = memory::max_context_len(hp, options);

    // Concurrency
    let decision = batch::decide(budget.capacity_by_kv(kv_per_user_bytes), options);
    let batch = decision.effective_batch;
    debug!(
        gpus = topology.gpu_count,
        tp = topology.tensor_parallel_degree,
        fixed_gb = memory::gib(budget.fixed_per_gpu_bytes),
        batch,
        "memory budget"
    );

    let memory = memory::report(
        memory::MemoryInputs {
            budget: &budget,
            kv: &kv,
            topology: &topology,
            quant_overhead,
            kv_per_user_bytes,
            max_context_len,
        },
        decision,
        options,
    );

    // Performance
    let hardware = perf::EffectiveHardware::new(gpu, precision, &topology, options);
    let decode = decode::model(hp, precision, &topology, &kv, &hardware, batch, options);
    let prefill = prefill::model(
        hp,
        precision,
        &topology,
        &kv,
        &hardware,
        batch,
        max_context_len,
        options,
    );

    Ok(report::assemble(report::ReportParts {
        hyperparameters: hp,
        precision,
        topology: &topology,
        gpu,
        hardware,
        memory,
        decode,
        prefill,
    }))
}
