//! GPU capability tables and the PCIe host-bounce interconnect model.
//!
//! Peaks are dense (no structured sparsity) tensor-core throughputs from the
//! vendor datasheets. A combination a GPU cannot execute natively (fp8 on
//! Ampere, bf16 on Turing) has a peak of 0.

use crate::error::EstimateError;
use crate::options::InterconnectOptions;
use crate::precision::{Accumulate, DType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// PCIe
// ============================================================================

/// PCIe link generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PcieGeneration {
    Gen3,
    Gen4,
    Gen5,
}

impl PcieGeneration {
    /// Usable GB/s per lane per direction after line encoding.
    pub fn per_lane_gbs(self) -> f64 {
        match self {
            PcieGeneration::Gen3 => 0.985,
            PcieGeneration::Gen4 => 1.969,
            PcieGeneration::Gen5 => 3.938,
        }
    }
}

/// Sustained PCIe bandwidth of one GPU link in GB/s.
pub fn pcie_sustained_gbs(generation: PcieGeneration, lanes: u32, efficiency: f64) -> f64 {
    generation.per_lane_gbs() * lanes as f64 * efficiency
}

/// Effective GB/s for GPU-to-GPU traffic that bounces through host memory.
///
/// With no peer link every byte crosses PCIe twice (device to host, host to
/// device) and is written to and read from host DRAM once, so both the link
/// and each GPU's share of host DRAM bandwidth are halved. The slower of the
/// two bounds the transfer.
pub fn host_bounce_gbs(
    generation: PcieGeneration,
    interconnect: &InterconnectOptions,
    gpu_count: u32,
) -> f64 {
    let pcie = pcie_sustained_gbs(generation, interconnect.pcie_width, interconnect.pcie_efficiency);
    let host_per_gpu = interconnect.host_ddr_bandwidth_gbs * interconnect.cpu_sockets as f64
        / gpu_count.max(1) as f64;
    (pcie / 2.0).min(host_per_gpu / 2.0)
}

// ============================================================================
// Tensor Peaks
// ============================================================================

/// Dense tensor-core peaks in TFLOPs (TOPs for integer formats).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TensorPeaks {
    pub tf32: f64,
    pub fp16_acc16: f64,
    pub fp16_acc32: f64,
    pub bf16: f64,
    pub fp8_acc16: f64,
    pub fp8_acc32: f64,
    pub int8: f64,
    pub int4: f64,
    pub fp4: f64,
}

impl TensorPeaks {
    /// Peak for a math/accumulate pair, 0 when the pair is unsupported.
    pub fn lookup(&self, math: DType, accumulate: Accumulate) -> f64 {
        match (math, accumulate) {
            (DType::Fp32 | DType::Tf32, Accumulate::Fp32) => self.tf32,
            (DType::Fp16, Accumulate::Fp16) => self.fp16_acc16,
            (DType::Fp16, Accumulate::Fp32) => self.fp16_acc32,
            (DType::Bf16, Accumulate::Fp32) => self.bf16,
            (DType::Fp8, Accumulate::Fp16) => self.fp8_acc16,
            (DType::Fp8, Accumulate::Fp32) => self.fp8_acc32,
            (DType::Int8, Accumulate::Int32) => self.int8,
            (DType::Int4, Accumulate::Int32) => self.int4,
            (DType::Fp4, Accumulate::Fp32) => self.fp4,
            _ => 0.0,
        }
    }
}

const A100: TensorPeaks = TensorPeaks {
    tf32: 156.0,
    fp16_acc16: 312.0,
    fp16_acc32: 312.0,
    bf16: 312.0,
    fp8_acc16: 0.0,
    fp8_acc32: 0.0,
    int8: 624.0,
    int4: 1248.0,
    fp4: 0.0,
};

const H100_SXM: TensorPeaks = TensorPeaks {
    tf32: 494.7,
    fp16_acc16: 989.4,
    fp16_acc32: 989.4,
    bf16: 989.4,
    fp8_acc16: 1978.9,
    fp8_acc32: 1978.9,
    int8: 1978.9,
    int4: 0.0,
    fp4: 0.0,
};

const H100_PCIE: TensorPeaks = TensorPeaks {
    tf32: 378.0,
    fp16_acc16: 756.0,
    fp16_acc32: 756.0,
    bf16: 756.0,
    fp8_acc16: 1513.0,
    fp8_acc32: 1513.0,
    int8: 1513.0,
    int4: 0.0,
    fp4: 0.0,
};

const B200: TensorPeaks = TensorPeaks {
    tf32: 1100.0,
    fp16_acc16: 2250.0,
    fp16_acc32: 2250.0,
    bf16: 2250.0,
    fp8_acc16: 4500.0,
    fp8_acc32: 4500.0,
    int8: 4500.0,
    int4: 0.0,
    fp4: 9000.0,
};

const L40S: TensorPeaks = TensorPeaks {
    tf32: 183.0,
    fp16_acc16: 362.0,
    fp16_acc32: 362.0,
    bf16: 362.0,
    fp8_acc16: 733.0,
    fp8_acc32: 733.0,
    int8: 733.0,
    int4: 0.0,
    fp4: 0.0,
};

const L4: TensorPeaks = TensorPeaks {
    tf32: 60.0,
    fp16_acc16: 121.0,
    fp16_acc32: 121.0,
    bf16: 121.0,
    fp8_acc16: 242.0,
    fp8_acc32: 242.0,
    int8: 242.0,
    int4: 0.0,
    fp4: 0.0,
};

const A10: TensorPeaks = TensorPeaks {
    tf32: 62.5,
    fp16_acc16: 125.0,
    fp16_acc32: 125.0,
    bf16: 125.0,
    fp8_acc16: 0.0,
    fp8_acc32: 0.0,
    int8: 250.0,
    int4: 500.0,
    fp4: 0.0,
};

const A10G: TensorPeaks = TensorPeaks {
    tf32: 35.0,
    fp16_acc16: 70.0,
    fp16_acc32: 70.0,
    bf16: 70.0,
    fp8_acc16: 0.0,
    fp8_acc32: 0.0,
    int8: 140.0,
    int4: 280.0,
    fp4: 0.0,
};

// GeForce parts run fp16/fp8 with fp32 accumulate at half rate.
const RTX_3090: TensorPeaks = TensorPeaks {
    tf32: 35.6,
    fp16_acc16: 142.0,
    fp16_acc32: 71.0,
    bf16: 71.0,
    fp8_acc16: 0.0,
    fp8_acc32: 0.0,
    int8: 284.0,
    int4: 568.0,
    fp4: 0.0,
};

const RTX_4090: TensorPeaks = TensorPeaks {
    tf32: 82.6,
    fp16_acc16: 330.3,
    fp16_acc32: 165.2,
    bf16: 165.2,
    fp8_acc16: 660.6,
    fp8_acc32: 330.3,
    int8: 660.6,
    int4: 1321.2,
    fp4: 0.0,
};

const RTX_5090: TensorPeaks = TensorPeaks {
    tf32: 104.8,
    fp16_acc16: 419.0,
    fp16_acc32: 209.5,
    bf16: 209.5,
    fp8_acc16: 838.0,
    fp8_acc32: 419.0,
    int8: 838.0,
    int4: 0.0,
    fp4: 1676.0,
};

const RTX_A6000: TensorPeaks = TensorPeaks {
    tf32: 77.4,
    fp16_acc16: 154.8,
    fp16_acc32: 154.8,
    bf16: 154.8,
    fp8_acc16: 0.0,
    fp8_acc32: 0.0,
    int8: 309.7,
    int4: 619.3,
    fp4: 0.0,
};

const T4: TensorPeaks = TensorPeaks {
    tf32: 0.0,
    fp16_acc16: 65.0,
    fp16_acc32: 65.0,
    bf16: 0.0,
    fp8_acc16: 0.0,
    fp8_acc32: 0.0,
    int8: 130.0,
    int4: 260.0,
    fp4: 0.0,
};

const V100: TensorPeaks = TensorPeaks {
    tf32: 0.0,
    fp16_acc16: 125.0,
    fp16_acc32: 125.0,
    bf16: 0.0,
    fp8_acc16: 0.0,
    fp8_acc32: 0.0,
    int8: 0.0,
    int4: 0.0,
    fp4: 0.0,
};

// ============================================================================
// GPU Models
// ============================================================================

/// Capability record of one GPU model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GpuSpec {
    pub id: &'static str,
    pub name: &'static str,
    pub memory_gib: f64,
    pub bandwidth_gbs: f64,
    pub pcie: PcieGeneration,
    pub peaks: TensorPeaks,
}

/// Supported GPU models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuModel {
    A100Sxm40,
    A100Sxm80,
    H100Sxm,
    H100Pcie,
    H200,
    B200,
    L40s,
    L4,
    A10,
    A10g,
    Rtx3090,
    Rtx4090,
    Rtx5090,
    RtxA6000,
    T4,
    V100,
}

impl GpuModel {
    pub const ALL: [GpuModel; 16] = [
        GpuModel::A100Sxm40,
        GpuModel::A100Sxm80,
        GpuModel::H100Sxm,
        GpuModel::H100Pcie,
        GpuModel::H200,
        GpuModel::B200,
        GpuModel::L40s,
        GpuModel::L4,
        GpuModel::A10,
        GpuModel::A10g,
        GpuModel::Rtx3090,
        GpuModel::Rtx4090,
        GpuModel::Rtx5090,
        GpuModel::RtxA6000,
        GpuModel::T4,
        GpuModel::V100,
    ];

    pub fn spec(self) -> GpuSpec {
        use PcieGeneration::*;
        let (id, name, memory_gib, bandwidth_gbs, pcie, peaks) = match self {
            GpuModel::A100Sxm40 => ("a100-40g", "NVIDIA A100 40GB", 40.0, 1555.0, Gen4, A100),
            GpuModel::A100Sxm80 => ("a100-80g", "NVIDIA A100 80GB", 80.0, 2039.0, Gen4, A100),
            GpuModel::H100Sxm => ("h100-sxm", "NVIDIA H100 SXM", 80.0, 3350.0, Gen5, H100_SXM),
            GpuModel::H100Pcie => ("h100-pcie", "NVIDIA H100 PCIe", 80.0, 2000.0, Gen5, H100_PCIE),
            GpuModel::H200 => ("h200", "NVIDIA H200", 141.0, 4800.0, Gen5, H100_SXM),
            GpuModel::B200 => ("b200", "NVIDIA B200", 180.0, 8000.0, Gen5, B200),
            GpuModel::L40s => ("l40s", "NVIDIA L40S", 48.0, 864.0, Gen4, L40S),
            GpuModel::L4 => ("l4", "NVIDIA L4", 24.0, 300.0, Gen4, L4),
            GpuModel::A10 => ("a10", "NVIDIA A10", 24.0, 600.0, Gen4, A10),
            GpuModel::A10g => ("a10g", "NVIDIA A10G", 24.0, 600.0, Gen4, A10G),
            GpuModel::Rtx3090 => ("rtx-3090", "NVIDIA GeForce RTX 3090", 24.0, 936.0, Gen4, RTX_3090),
            GpuModel::Rtx4090 => ("rtx-4090", "NVIDIA GeForce RTX 4090", 24.0, 1008.0, Gen4, RTX_4090),
            GpuModel::Rtx5090 => ("rtx-5090", "NVIDIA GeForce RTX 5090", 32.0, 1792.0, Gen5, RTX_5090),
            GpuModel::RtxA6000 => ("rtx-a6000", "NVIDIA RTX A6000", 48.0, 768.0, Gen4, RTX_A6000),
            GpuModel::T4 => ("t4", "NVIDIA T4", 16.0, 320.0, Gen3, T4),
            GpuModel::V100 => ("v100", "NVIDIA V100 32GB", 32.0, 900.0, Gen3, V100),
        };
        GpuSpec {
            id,
            name,
            memory_gib,
            bandwidth_gbs,
            pcie,
            peaks,
        }
    }

    pub fn id(self) -> &'static str {
        self.spec().id
    }
}

impl fmt::Display for GpuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Lowercase, drop vendor words and punctuation: "NVIDIA A100-SXM4-80GB" -> "a100sxm480gb".
fn normalize_gpu_id(id: &str) -> String {
    let lower = id.to_lowercase();
    let stripped = ["nvidia", "geforce", "tesla"]
        .iter()
        .fold(lower, |acc, word| acc.replace(word, ""));
    stripped.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

impl FromStr for GpuModel {
    type Err = EstimateError;

    /// Strict parse: unrecognized ids are an error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let model = match normalize_gpu_id(s).as_str() {
            "a10040g" | "a10040gb" | "a100sxm40" | "a100sxm440gb" | "a100pcie40gb" => GpuModel::A100Sxm40,
            "a100" | "a10080g" | "a10080gb" | "a100sxm80" | "a100sxm480gb" | "a100pcie80gb" => {
                GpuModel::A100Sxm80
            }
            "h100" | "h100sxm" | "h100sxm5" | "h100sxm580gb" | "h10080gbhbm3" => GpuModel::H100Sxm,
            "h100pcie" | "h100pcie80gb" => GpuModel::H100Pcie,
            "h200" | "h200sxm" | "h200141gb" => GpuModel::H200,
            "b200" => GpuModel::B200,
            "l40s" => GpuModel::L40s,
            "l4" => GpuModel::L4,
            "a10" => GpuModel::A10,
            "a10g" => GpuModel::A10g,
            "rtx3090" | "3090" => GpuModel::Rtx3090,
            "rtx4090" | "4090" => GpuModel::Rtx4090,
            "rtx5090" | "5090" => GpuModel::Rtx5090,
            "rtxa6000" | "a6000" => GpuModel::RtxA6000,
            "t4" => GpuModel::T4,
            "v100" | "v100sxm2" | "v10032gb" => GpuModel::V100,
            _ => return Err(EstimateError::UnknownGpu(s.to_string())),
        };
        Ok(model)
    }
}

/// GPU an estimation targets: a model from the table, or an id the table
/// does not know. Unlisted GPUs have no capability record; performance legs
/// need explicit overrides to be computed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GpuTarget {
    Known(GpuModel),
    Unlisted(String),
}

impl GpuTarget {
    /// Lenient parse: unrecognized ids become [`GpuTarget::Unlisted`].
    pub fn parse(id: &str) -> Self {
        match id.parse::<GpuModel>() {
            Ok(model) => GpuTarget::Known(model),
            Err(_) => GpuTarget::Unlisted(id.to_string()),
        }
    }

    pub fn spec(&self) -> Option<GpuSpec> {
        match self {
            GpuTarget::Known(model) => Some(model.spec()),
            GpuTarget::Unlisted(_) => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, GpuTarget::Known(_))
    }

    pub fn id(&self) -> &str {
        match self {
            GpuTarget::Known(model) => model.id(),
            GpuTarget::Unlisted(id) => id,
        }
    }
}

impl From<GpuModel> for GpuTarget {
    fn from(model: GpuModel) -> Self {
        GpuTarget::Known(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vendor_strings() {
        assert_eq!("NVIDIA A100-SXM4-80GB".parse::<GpuModel>().unwrap(), GpuModel::A100Sxm80);
        assert_eq!("NVIDIA GeForce RTX 4090".parse::<GpuModel>().unwrap(), GpuModel::Rtx4090);
        assert_eq!("h100-pcie".parse::<GpuModel>().unwrap(), GpuModel::H100Pcie);
        assert_eq!("Tesla T4".parse::<GpuModel>().unwrap(), GpuModel::T4);
    }

    #[test]
    fn test_unknown_gpu_is_distinguishable() {
        assert!(matches!("mi300x".parse::<GpuModel>(), Err(EstimateError::UnknownGpu(_))));
        let target = GpuTarget::parse("mi300x");
        assert!(!target.is_known());
        assert_eq!(target.id(), "mi300x");
        assert!(target.spec().is_none());
    }

    #[test]
    fn test_ids_round_trip_through_parser() {
        for model in GpuModel::ALL {
            assert_eq!(model.id().parse::<GpuModel>().unwrap(), model);
        }
    }

    #[test]
    fn test_peak_lookup() {
        let a100 = GpuModel::A100Sxm80.spec();
        assert_eq!(a100.peaks.lookup(DType::Fp16, Accumulate::Fp32), 312.0);
        assert_eq!(a100.peaks.lookup(DType::Fp8, Accumulate::Fp32), 0.0);
        assert_eq!(a100.peaks.lookup(DType::Int8, Accumulate::Int32), 624.0);
        assert_eq!(a100.peaks.lookup(DType::Int8, Accumulate::Fp32), 0.0);

        let rtx = GpuModel::Rtx4090.spec();
        assert!(rtx.peaks.lookup(DType::Fp16, Accumulate::Fp16) > rtx.peaks.lookup(DType::Fp16, Accumulate::Fp32));
    }

    #[test]
    fn test_host_bounce_bandwidth() {
        let ic = InterconnectOptions::default();
        // Gen4 x16 at 80%: 25.2 GB/s sustained, halved.
        let pcie_half = pcie_sustained_gbs(PcieGeneration::Gen4, 16, 0.8) / 2.0;
        assert!((host_bounce_gbs(PcieGeneration::Gen4, &ic, 2) - pcie_half).abs() < 1e-9);

        // Eight GPUs on one socket: host DRAM share becomes the bound.
        let bw = host_bounce_gbs(PcieGeneration::Gen5, &ic, 8);
        assert!((bw - 100.0 / 8.0 / 2.0).abs() < 1e-9);

        let two_sockets = InterconnectOptions {
            cpu_sockets: 2,
            ..InterconnectOptions::default()
        };
        assert!(host_bounce_gbs(PcieGeneration::Gen5, &two_sockets, 8) > bw);
    }
}
