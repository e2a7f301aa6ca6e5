//! Numeric formats used for weights, activations, KV cache and tensor math.

use crate::error::EstimateError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Storage or math format with a known byte width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Fp32,
    Tf32,
    Fp16,
    Bf16,
    Fp8,
    Int8,
    Int4,
    Fp4,
}

impl DType {
    /// Bytes per element. 4-bit formats are packed two per byte.
    pub fn bytes(self) -> f64 {
        match self {
            DType::Fp32 | DType::Tf32 => 4.0,
            DType::Fp16 | DType::Bf16 => 2.0,
            DType::Fp8 | DType::Int8 => 1.0,
            DType::Int4 | DType::Fp4 => 0.5,
        }
    }

    /// Whether the format packs two values per byte and pays a scale/zero-point overhead.
    pub fn is_packed_4bit(self) -> bool {
        matches!(self, DType::Int4 | DType::Fp4)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::Fp32 => "fp32",
            DType::Tf32 => "tf32",
            DType::Fp16 => "fp16",
            DType::Bf16 => "bf16",
            DType::Fp8 => "fp8",
            DType::Int8 => "int8",
            DType::Int4 => "int4",
            DType::Fp4 => "fp4",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = EstimateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fp32" | "f32" | "float32" | "float" => Ok(DType::Fp32),
            "tf32" => Ok(DType::Tf32),
            "fp16" | "f16" | "float16" | "half" => Ok(DType::Fp16),
            "bf16" | "bfloat16" => Ok(DType::Bf16),
            "fp8" | "f8" | "float8" | "e4m3" | "e5m2" | "fp8_e4m3" | "fp8_e5m2" => Ok(DType::Fp8),
            "int8" | "i8" | "q8" | "w8a8" => Ok(DType::Int8),
            "int4" | "i4" | "q4" | "awq" | "gptq" => Ok(DType::Int4),
            "fp4" | "f4" | "nvfp4" | "mxfp4" => Ok(DType::Fp4),
            _ => Err(EstimateError::UnknownDtype(s.to_string())),
        }
    }
}

/// Accumulator format of a tensor-core matmul.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accumulate {
    Fp16,
    Fp32,
    Int32,
}

impl Accumulate {
    pub fn as_str(self) -> &'static str {
        match self {
            Accumulate::Fp16 => "fp16",
            Accumulate::Fp32 => "fp32",
            Accumulate::Int32 => "int32",
        }
    }
}

impl fmt::Display for Accumulate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Accumulate {
    type Err = EstimateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fp16" | "f16" | "half" => Ok(Accumulate::Fp16),
            "fp32" | "f32" | "float" => Ok(Accumulate::Fp32),
            "int32" | "i32" => Ok(Accumulate::Int32),
            _ => Err(EstimateError::UnknownAccumulate(s.to_string())),
        }
    }
}

/// Precision scheme of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecisionSpec {
    pub weight: DType,
    pub activation: DType,
    pub kv: DType,
    pub math: DType,
    pub accumulate: Accumulate,
}

impl Default for PrecisionSpec {
    fn default() -> Self {
        Self {
            weight: DType::Fp16,
            activation: DType::Fp16,
            kv: DType::Fp16,
            math: DType::Fp16,
            accumulate: Accumulate::Fp32,
        }
    }
}

impl PrecisionSpec {
    /// Same precision as `self` with different weight storage.
    pub fn with_weight(self, weight: DType) -> Self {
        Self { weight, ..self }
    }

    /// Same precision as `self` with a different KV cache format.
    pub fn with_kv(self, kv: DType) -> Self {
        Self { kv, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_widths() {
        assert_eq!(DType::Fp32.bytes(), 4.0);
        assert_eq!(DType::Bf16.bytes(), 2.0);
        assert_eq!(DType::Fp8.bytes(), 1.0);
        assert_eq!(DType::Int4.bytes(), 0.5);
        assert_eq!(DType::Fp4.bytes(), 0.5);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("bfloat16".parse::<DType>().unwrap(), DType::Bf16);
        assert_eq!("AWQ".parse::<DType>().unwrap(), DType::Int4);
        assert_eq!(" e4m3 ".parse::<DType>().unwrap(), DType::Fp8);
        assert!("fp12".parse::<DType>().is_err());
        assert_eq!("f32".parse::<Accumulate>().unwrap(), Accumulate::Fp32);
        assert!("bf16".parse::<Accumulate>().is_err());
    }

    #[test]
    fn test_packed_formats() {
        assert!(DType::Int4.is_packed_4bit());
        assert!(DType::Fp4.is_packed_4bit());
        assert!(!DType::Int8.is_packed_4bit());
    }

    #[test]
    fn test_partial_spec_deserializes_with_defaults() {
        let spec: PrecisionSpec = serde_json::from_str(r#"{"weight": "int4"}"#).unwrap();
        assert_eq!(spec.weight, DType::Int4);
        assert_eq!(spec.kv, DType::Fp16);
        assert_eq!(spec.accumulate, Accumulate::Fp32);
    }
}
