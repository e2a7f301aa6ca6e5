//! Tunable knobs of an estimation.
//!
//! Every field has a default applied by construction: a partial TOML or JSON
//! document deserializes into a complete [`EstimateOptions`] with the missing
//! fields taken from [`Default`]. Unknown keys are rejected so that a typo in
//! an options file is an error rather than a silently ignored override.

use crate::error::{EstimateError, Result};
use crate::hardware::PcieGeneration;
use serde::{Deserialize, Serialize};

/// Options for a single call to [`crate::estimate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EstimateOptions {
    /// Prompt length used by the prefill model. Defaults to `avg_prompt_len`
    /// and is never allowed above the model's max context length.
    pub prompt_len: Option<u64>,
    /// Average prompt length, used for KV sizing.
    pub avg_prompt_len: u64,
    /// Average tokens already generated by an in-flight request.
    pub avg_generated_so_far: u64,
    /// Average tokens generated per request.
    pub avg_output_len: u64,
    /// Attention prefix length for decode FLOPs and KV reads.
    /// Defaults to `avg_prompt_len + avg_generated_so_far`.
    pub decode_prefix_len: Option<u64>,
    /// Desired concurrency.
    pub active_users: u64,
    /// Size the batch from KV capacity. When false, `batch_effective` is used.
    pub auto_batch: bool,
    /// Manual batch size. Setting it switches to manual batching regardless
    /// of `auto_batch`.
    pub batch_effective: Option<u64>,
    /// Hard scheduler cap on concurrent sequences.
    pub max_num_seqs_cap: Option<u64>,
    /// Override of the model's configured max context length.
    pub max_model_len: Option<u64>,
    pub kv_block_size_tokens: u64,
    pub kv_fragmentation: f64,
    /// Shard KV heads across the tensor-parallel group.
    pub kv_sharded_across_tp: bool,
    /// Runtime memory outside the serving framework (CUDA context, NCCL buffers).
    pub runtime_overhead_gib: f64,
    pub activation_reserve_gib: f64,
    /// Packing overhead for 4-bit weights (scales, zero points).
    pub quant_overhead_fp4: f64,
    /// Fraction of GPU memory usable by the allocator.
    pub allocator_headroom: f64,
    /// Scheduling and kernel launch floor added once per step.
    pub step_floor_ms: f64,
    /// Fixed latency per tensor-parallel collective.
    pub collective_latency_us: f64,
    pub gpu_bandwidth_override_gbs: Option<f64>,
    pub tensor_peaks_override_tflops: Option<f64>,
    pub interconnect: InterconnectOptions,
    pub utilization: UtilizationOptions,
}

impl Default for EstimateOptions {
    fn default() -> Self {
        Self {
            prompt_len: None,
            avg_prompt_len: 512,
            avg_generated_so_far: 128,
            avg_output_len: 256,
            decode_prefix_len: None,
            active_users: 1,
            auto_batch: true,
            batch_effective: None,
            max_num_seqs_cap: Some(256),
            max_model_len: None,
            kv_block_size_tokens: 16,
            kv_fragmentation: 1.05,
            kv_sharded_across_tp: true,
            runtime_overhead_gib: 0.5,
            activation_reserve_gib: 1.0,
            quant_overhead_fp4: 1.10,
            allocator_headroom: 0.9,
            step_floor_ms: 3.0,
            collective_latency_us: 25.0,
            gpu_bandwidth_override_gbs: None,
            tensor_peaks_override_tflops: None,
            interconnect: InterconnectOptions::default(),
            utilization: UtilizationOptions::default(),
        }
    }
}

/// PCIe host-bounce interconnect parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InterconnectOptions {
    /// Link generation. Defaults to the GPU's native generation.
    pub pcie_generation: Option<PcieGeneration>,
    /// Lanes per GPU link.
    pub pcie_width: u32,
    /// Sustained fraction of the raw link rate.
    pub pcie_efficiency: f64,
    /// Host DRAM bandwidth per CPU socket.
    pub host_ddr_bandwidth_gbs: f64,
    pub cpu_sockets: u32,
}

impl Default for InterconnectOptions {
    fn default() -> Self {
        Self {
            pcie_generation: None,
            pcie_width: 16,
            pcie_efficiency: 0.8,
            host_ddr_bandwidth_gbs: 100.0,
            cpu_sockets: 1,
        }
    }
}

/// Fractions of peak hardware throughput reachable in practice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UtilizationOptions {
    pub compute_utilization: f64,
    pub hbm_utilization: f64,
    pub interconnect_utilization: f64,
}

impl Default for UtilizationOptions {
    fn default() -> Self {
        Self {
            compute_utilization: 0.6,
            hbm_utilization: 0.8,
            interconnect_utilization: 0.7,
        }
    }
}

fn fraction(name: &'static str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(EstimateError::InvalidOption {
            name,
            reason: format!("{value} is outside (0, 1]"),
        })
    }
}

fn non_negative(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(EstimateError::InvalidOption {
            name,
            reason: format!("{value} must be a finite, non-negative number"),
        })
    }
}

fn at_least_one(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 1.0 {
        Ok(())
    } else {
        Err(EstimateError::InvalidOption {
            name,
            reason: format!("{value} must be >= 1"),
        })
    }
}

/// Largest token count accepted for any length option.
pub const MAX_TOKENS: u64 = u32::MAX as u64;

fn token_count(name: &'static str, value: Option<u64>) -> Result<()> {
    match value {
        Some(v) if v > MAX_TOKENS => Err(EstimateError::InvalidOption {
            name,
            reason: format!("{v} tokens exceeds the limit of {MAX_TOKENS}"),
        }),
        _ => Ok(()),
    }
}

impl EstimateOptions {
    /// Check every option against its domain.
    pub fn validate(&self) -> Result<()> {
        if self.active_users == 0 {
            return Err(EstimateError::InvalidOption {
                name: "active_users",
                reason: "at least one user is required".to_string(),
            });
        }
        if self.kv_block_size_tokens == 0 {
            return Err(EstimateError::InvalidOption {
                name: "kv_block_size_tokens",
                reason: "block size must be positive".to_string(),
            });
        }
        for (name, len) in [
            ("avg_prompt_len", Some(self.avg_prompt_len)),
            ("avg_generated_so_far", Some(self.avg_generated_so_far)),
            ("avg_output_len", Some(self.avg_output_len)),
            ("prompt_len", self.prompt_len),
            ("decode_prefix_len", self.decode_prefix_len),
            ("max_model_len", self.max_model_len),
        ] {
            token_count(name, len)?;
        }
        at_least_one("kv_fragmentation", self.kv_fragmentation)?;
        at_least_one("quant_overhead_fp4", self.quant_overhead_fp4)?;
        fraction("allocator_headroom", self.allocator_headroom)?;
        non_negative("runtime_overhead_gib", self.runtime_overhead_gib)?;
        non_negative("activation_reserve_gib", self.activation_reserve_gib)?;
        non_negative("step_floor_ms", self.step_floor_ms)?;
        non_negative("collective_latency_us", self.collective_latency_us)?;
        if let Some(bw) = self.gpu_bandwidth_override_gbs {
            non_negative("gpu_bandwidth_override_gbs", bw)?;
        }
        if let Some(peak) = self.tensor_peaks_override_tflops {
            non_negative("tensor_peaks_override_tflops", peak)?;
        }

        let ic = &self.interconnect;
        if ic.pcie_width == 0 || ic.cpu_sockets == 0 {
            return Err(EstimateError::InvalidOption {
                name: "interconnect",
                reason: "pcie_width and cpu_sockets must be positive".to_string(),
            });
        }
        fraction("interconnect.pcie_efficiency", ic.pcie_efficiency)?;
        non_negative("interconnect.host_ddr_bandwidth_gbs", ic.host_ddr_bandwidth_gbs)?;

        let u = &self.utilization;
        fraction("utilization.compute_utilization", u.compute_utilization)?;
        fraction("utilization.hbm_utilization", u.hbm_utilization)?;
        fraction("utilization.interconnect_utilization", u.interconnect_utilization)?;
        Ok(())
    }

    /// Prefix length attended to by a decode step.
    pub fn decode_prefix(&self) -> u64 {
        self.decode_prefix_len
            .unwrap_or_else(|| self.avg_prompt_len.saturating_add(self.avg_generated_so_far))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(EstimateOptions::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let opts: EstimateOptions =
            serde_json::from_str(r#"{"active_users": 8, "utilization": {"hbm_utilization": 0.5}}"#)
                .unwrap();
        assert_eq!(opts.active_users, 8);
        assert_eq!(opts.utilization.hbm_utilization, 0.5);
        assert_eq!(opts.utilization.compute_utilization, 0.6);
        assert_eq!(opts.kv_block_size_tokens, 16);
        assert_eq!(opts.interconnect.pcie_width, 16);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let parsed: std::result::Result<EstimateOptions, _> =
            serde_json::from_str(r#"{"avg_promt_len": 10}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_invalid_headroom() {
        let opts = EstimateOptions {
            allocator_headroom: 1.5,
            ..Default::default()
        };
        let err = opts.validate().unwrap_err();
        assert!(matches!(err, EstimateError::InvalidOption { name: "allocator_headroom", .. }));
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let opts = EstimateOptions {
            kv_block_size_tokens: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_decode_prefix_default_and_override() {
        let mut opts = EstimateOptions::default();
        assert_eq!(opts.decode_prefix(), 640);
        opts.decode_prefix_len = Some(100);
        assert_eq!(opts.decode_prefix(), 100);
    }

    #[test]
    fn test_oversized_token_lengths_rejected() {
        let opts: EstimateOptions =
            serde_json::from_str(r#"{"avg_prompt_len": 18446744073709551615}"#).unwrap();
        let err = opts.validate().unwrap_err();
        assert!(matches!(err, EstimateError::InvalidOption { name: "avg_prompt_len", .. }));

        let opts = EstimateOptions {
            max_model_len: Some(MAX_TOKENS + 1),
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = EstimateOptions {
            avg_prompt_len: MAX_TOKENS,
            avg_generated_so_far: MAX_TOKENS,
            ..Default::default()
        };
        assert!(opts.validate().is_ok());
        assert_eq!(opts.decode_prefix(), 2 * MAX_TOKENS);
    }

    #[test]
    fn test_decode_prefix_saturates() {
        let opts = EstimateOptions {
            avg_prompt_len: u64::MAX,
            avg_generated_so_far: 1,
            ..Default::default()
        };
        assert_eq!(opts.decode_prefix(), u64::MAX);
    }
}
