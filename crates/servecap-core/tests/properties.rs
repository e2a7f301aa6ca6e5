//! Property tests over the estimator.

use proptest::prelude::*;
use serde_json::json;
use servecap_core::batch::decide;
use servecap_core::hyperparams::resolve;
use servecap_core::memory::weight_bytes;
use servecap_core::{
    estimate, DType, EstimateOptions, GpuModel, KvBlockModel, ModelHyperparameters, PrecisionSpec,
    Topology, GIB,
};

fn dtype() -> impl Strategy<Value = DType> {
    prop_oneof![
        Just(DType::Fp32),
        Just(DType::Fp16),
        Just(DType::Bf16),
        Just(DType::Fp8),
        Just(DType::Int8),
        Just(DType::Int4),
        Just(DType::Fp4),
    ]
}

fn model(heads: u64, kv_heads: u64, head_dim: u64, layers: u64) -> ModelHyperparameters {
    let config = json!({
        "hidden_size": heads * head_dim,
        "num_attention_heads": heads,
        "num_key_value_heads": kv_heads,
        "head_dim": head_dim,
        "num_hidden_layers": layers,
    });
    resolve(config.as_object().unwrap(), Some(1e9)).unwrap()
}

proptest! {
    #[test]
    fn test_batch_bounds(
        capacity in prop::collection::vec(0u64..500, 1..8),
        users in 1u64..1000,
        cap in prop::option::of(1u64..512),
    ) {
        let options = EstimateOptions {
            active_users: users,
            max_num_seqs_cap: cap,
            ..Default::default()
        };
        let d = decide(capacity.clone(), &options);
        let bound = users
            .min(*capacity.iter().min().unwrap())
            .min(cap.unwrap_or(u64::MAX));

        prop_assert!(d.effective_batch >= 1);
        if bound >= 1 {
            prop_assert_eq!(d.effective_batch, bound);
        } else {
            prop_assert_eq!(d.effective_batch, 1);
        }
    }

    #[test]
    fn test_capacity_monotonic_in_memory(
        base_gib in 1u64..160,
        extra_gib in 0u64..80,
        users in 1u64..300,
    ) {
        let config = servecap_core::hyperparams::preset("llama-3-8b").unwrap();
        let options = EstimateOptions { active_users: users, ..Default::default() };
        let run = |gib: u64| {
            estimate(
                &config,
                Some(8e9),
                &PrecisionSpec::default(),
                1,
                &[gib * GIB as u64],
                &GpuModel::H100Sxm.into(),
                &options,
            )
            .unwrap()
        };
        let small = run(base_gib);
        let large = run(base_gib + extra_gib);
        prop_assert!(large.memory.capacity_by_kv_per_gpu[0] >= small.memory.capacity_by_kv_per_gpu[0]);
        prop_assert!(large.memory.concurrency.effective_batch >= small.memory.concurrency.effective_batch);
    }

    #[test]
    fn test_weight_bytes_linear(params in 1e6f64..1e12, k in 1u32..8, dt in dtype()) {
        let one = weight_bytes(params, dt, 1.0);
        let many = weight_bytes(params * k as f64, dt, 1.0);
        prop_assert!((many - one * k as f64).abs() <= one * k as f64 * 1e-12);
        prop_assert_eq!(one, params * dt.bytes());
    }

    #[test]
    fn test_kv_block_linear_and_gqa_invariant(
        kv_heads in 1u64..16,
        group in 1u64..8,
        head_dim in prop_oneof![Just(64u64), Just(80), Just(128), Just(256)],
        layers in 1u64..96,
    ) {
        let topology = Topology::new(1, 1).unwrap();
        let options = EstimateOptions::default();
        let block = |hp: &ModelHyperparameters| {
            KvBlockModel::new(hp, DType::Fp16, &topology, &options).bytes_per_block
        };

        let base = block(&model(kv_heads * group, kv_heads, head_dim, layers));
        // attention heads do not matter, only KV heads
        prop_assert_eq!(base, block(&model(kv_heads * group * 2, kv_heads, head_dim, layers)));
        prop_assert_eq!(base * 2.0, block(&model(kv_heads * group * 2, kv_heads * 2, head_dim, layers)));
        prop_assert_eq!(base * 2.0, block(&model(kv_heads * group, kv_heads, head_dim * 2, layers)));
        prop_assert_eq!(base * 2.0, block(&model(kv_heads * group, kv_heads, head_dim, layers * 2)));
    }

    #[test]
    fn test_single_gpu_never_pays_interconnect(
        gpus in 1usize..8,
        users in 1u64..64,
        model_idx in 0usize..GpuModel::ALL.len(),
    ) {
        let config = servecap_core::hyperparams::preset("llama-2-7b").unwrap();
        let options = EstimateOptions { active_users: users, ..Default::default() };
        let r = estimate(
            &config,
            Some(7e9),
            &PrecisionSpec::default(),
            1,
            &vec![80 * GIB as u64; gpus],
            &GpuModel::ALL[model_idx].into(),
            &options,
        )
        .unwrap();
        prop_assert_eq!(r.decode.interconnect_ms_per_token, Some(0.0));
        prop_assert_eq!(r.prefill.interconnect_seconds_prefill, Some(0.0));
    }
}
