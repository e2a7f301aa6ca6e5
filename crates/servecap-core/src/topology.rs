//! Deployment topology.

use crate::error::{EstimateError, Result};
use serde::Serialize;

/// Largest deployment accepted.
pub const MAX_GPUS: usize = 65_536;

/// GPU count and tensor-parallel degree of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Topology {
    pub gpu_count: u32,
    pub tensor_parallel_degree: u32,
}

impl Topology {
    /// Validate a topology.
    ///
    /// # Errors
    /// - `InvalidTopology`: no GPUs, a zero tensor-parallel degree, or a
    ///   degree larger than the number of GPUs
    pub fn new(gpu_count: usize, tensor_parallel_degree: u32) -> Result<Self> {
        let gpu_count = Self::check_gpu_count(gpu_count)?;
        if tensor_parallel_degree == 0 {
            return Err(EstimateError::InvalidTopology(
                "tensor_parallel_degree must be >= 1".to_string(),
            ));
        }
        if tensor_parallel_degree > gpu_count {
            return Err(EstimateError::InvalidTopology(format!(
                "tensor_parallel_degree {tensor_parallel_degree} exceeds GPU count {gpu_count}"
            )));
        }
        Ok(Self {
            gpu_count,
            tensor_parallel_degree,
        })
    }

    /// Check a GPU count before anything is sized from it.
    ///
    /// # Errors
    /// - `InvalidTopology`: zero GPUs or more than [`MAX_GPUS`]
    pub fn check_gpu_count(gpu_count: usize) -> Result<u32> {
        if gpu_count == 0 {
            return Err(EstimateError::InvalidTopology(
                "at least one GPU memory entry is required".to_string(),
            ));
        }
        if gpu_count > MAX_GPUS {
            return Err(EstimateError::InvalidTopology(format!(
                "{gpu_count} GPUs exceeds the limit of {MAX_GPUS}"
            )));
        }
        // MAX_GPUS fits in u32
        Ok(gpu_count as u32)
    }

    /// No tensor-parallel collectives are needed.
    pub fn single_gpu(&self) -> bool {
        self.gpu_count == 1 || self.tensor_parallel_degree == 1
    }

    pub(crate) fn tp(&self) -> f64 {
        self.tensor_parallel_degree as f64
    }
}
