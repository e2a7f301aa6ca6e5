//! Auto-batch sizing under KV memory and scheduler constraints.

use crate::options::EstimateOptions;
use serde::Serialize;
use tracing::debug;

/// The constraint that set the effective batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchLimit {
    RequestedUsers,
    KvCapacity,
    SchedulerCap,
    ManualOverride,
}

/// Outcome of batch sizing.
///
/// # Invariants
/// - `effective_batch >= 1`, even when KV capacity is 0; the worst-case
///   check is what reports real infeasibility
/// - `effective_batch <= min(requested_users, binding_capacity, scheduler_cap)`
///   whenever that minimum is at least 1 (auto mode)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConcurrencyDecision {
    pub requested_users: u64,
    pub capacity_by_kv_per_gpu: Vec<u64>,
    /// Minimum across GPUs: a tensor-parallel group is as large as its most
    /// constrained member.
    pub binding_capacity: u64,
    pub scheduler_cap: Option<u64>,
    pub auto_batch: bool,
    pub effective_batch: u64,
    pub limited_by: BatchLimit,
}

/// Choose the effective batch.
///
/// Auto mode: `max(1, min(requested, min(capacity), cap))`.
/// Manual mode (`auto_batch = false`, or any `batch_effective` given):
/// `max(1, min(override, requested, cap))`, with the override defaulting to
/// the requested users.
pub fn decide(capacity_by_kv_per_gpu: Vec<u64>, options: &EstimateOptions) -> ConcurrencyDecision {
    let requested = options.active_users;
    let binding_capacity = capacity_by_kv_per_gpu.iter().copied().min().unwrap_or(0);
    let cap = options.max_num_seqs_cap.unwrap_or(u64::MAX);

    let auto = options.auto_batch && options.batch_effective.is_none();

    // Ties go to the earlier entry.
    let candidates = if auto {
        [
            (requested, BatchLimit::RequestedUsers),
            (binding_capacity, BatchLimit::KvCapacity),
            (cap, BatchLimit::SchedulerCap),
        ]
    } else {
        [
            (options.batch_effective.unwrap_or(requested), BatchLimit::ManualOverride),
            (requested, BatchLimit::RequestedUsers),
            (cap, BatchLimit::SchedulerCap),
        ]
    };
    let (bound, limited_by) = candidates
        .into_iter()
        .min_by_key(|(value, _)| *value)
        .unwrap_or((requested, BatchLimit::RequestedUsers));
    let effective_batch = bound.max(1);

    debug!(
        requested,
        binding_capacity,
        effective_batch,
        ?limited_by,
        "sized batch"
    );

    ConcurrencyDecision {
        requested_users: requested,
        capacity_by_kv_per_gpu,
        binding_capacity,
        scheduler_cap: options.max_num_seqs_cap,
        auto_batch: auto,
        effective_batch,
        limited_by,
    }
}
