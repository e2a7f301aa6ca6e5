//! End-to-end estimation scenarios.

use serde_json::{json, Map, Value};
use servecap_core::crosscheck::{compare, RULE_OF_THUMB_OVERHEAD};
use servecap_core::hyperparams::preset;
use servecap_core::{
    estimate, BatchLimit, DType, EstimateError, EstimateOptions, GpuModel, GpuTarget, Leg,
    PerformanceReport, PrecisionSpec, Topology, GIB,
};

fn gib(n: u64) -> u64 {
    n * GIB as u64
}

fn llama2_7b() -> Map<String, Value> {
    preset("llama-2-7b").unwrap()
}

fn run(
    precision: PrecisionSpec,
    tp: u32,
    memory: &[u64],
    gpu: GpuTarget,
    options: &EstimateOptions,
) -> PerformanceReport {
    estimate(&llama2_7b(), Some(7e9), &precision, tp, memory, &gpu, options).unwrap()
}

fn close(actual: f64, expected: f64, tol: f64) -> bool {
    (actual - expected).abs() <= tol
}

// ============================================================================
// Memory Scenarios
// ============================================================================

#[test]
fn test_7b_fp16_on_24gib() {
    let r = run(
        PrecisionSpec::default(),
        1,
        &[gib(24)],
        GpuModel::Rtx4090.into(),
        &EstimateOptions::default(),
    );
    let m = &r.memory;
    assert!(close(m.weights_gb_per_gpu, 14e9 / GIB, 1e-9));
    assert!(close(m.fixed_gb_per_gpu, (14e9 / GIB + 1.5) / 0.9, 1e-9));
    assert_eq!(m.kv_bytes_per_token, 524_288.0);
    assert!(close(m.kv_gb_per_avg_user, 0.2625, 1e-12));
    assert_eq!(m.capacity_by_kv_per_gpu, vec![29]);

    // one user requested
    assert_eq!(m.concurrency.effective_batch, 1);
    assert_eq!(m.concurrency.limited_by, BatchLimit::RequestedUsers);
    // 640 resident tokens = 40 blocks of 8 MiB, inflated 5%
    assert!(close(m.resident_kv_gb_per_gpu, 0.328125, 1e-12));
    assert!(close(m.required_gb_per_gpu, m.fixed_gb_per_gpu + 0.328125, 1e-9));

    assert!(r.fits());
    assert!(r.warnings.is_empty(), "{:?}", r.warnings);
}

#[test]
fn test_many_users_bound_by_kv_capacity() {
    let options = EstimateOptions {
        active_users: 64,
        ..Default::default()
    };
    let r = run(PrecisionSpec::default(), 1, &[gib(24)], GpuModel::Rtx4090.into(), &options);
    assert_eq!(r.memory.concurrency.effective_batch, 29);
    assert_eq!(r.memory.concurrency.limited_by, BatchLimit::KvCapacity);
    assert_eq!(r.decode.batch, 29);
    assert_eq!(r.prefill.batch, 29);
    assert!(r.memory.recommended_gpu_memory_fraction[0] <= 1.0);
}

#[test]
fn test_fp4_weights_are_a_quarter_plus_packing() {
    let options = EstimateOptions::default();
    let fp16 = run(PrecisionSpec::default(), 1, &[gib(24)], GpuModel::Rtx4090.into(), &options);
    let fp4 = run(
        PrecisionSpec::default().with_weight(DType::Fp4),
        1,
        &[gib(24)],
        GpuModel::Rtx4090.into(),
        &options,
    );
    assert_eq!(fp4.memory.quant_overhead, 1.10);
    let ratio = fp4.memory.weights_gb_per_gpu / fp16.memory.weights_gb_per_gpu;
    assert!(close(ratio, 0.25 * 1.10, 1e-12));
    assert!(
        fp4.memory.capacity_by_kv_per_gpu[0] > fp16.memory.capacity_by_kv_per_gpu[0],
        "freed weight memory goes to KV"
    );
}

#[test]
fn test_fp8_kv_doubles_capacity() {
    let options = EstimateOptions {
        active_users: 100,
        ..Default::default()
    };
    let fp16 = run(PrecisionSpec::default(), 1, &[gib(24)], GpuModel::Rtx4090.into(), &options);
    let fp8 = run(
        PrecisionSpec::default().with_kv(DType::Fp8),
        1,
        &[gib(24)],
        GpuModel::Rtx4090.into(),
        &options,
    );
    // weights and fixed cost do not depend on the KV format
    assert_eq!(fp8.memory.fixed_gb_per_gpu, fp16.memory.fixed_gb_per_gpu);
    assert_eq!(fp8.memory.kv_bytes_per_token, 262_144.0);
    assert!(close(fp8.memory.kv_gb_per_avg_user, 0.13125, 1e-12));
    // 7.846 GiB free / 0.13125 GiB per user
    assert_eq!(fp8.memory.capacity_by_kv_per_gpu, vec![59]);
    assert_eq!(fp8.memory.concurrency.effective_batch, 59);
    assert!(fp8.memory.worst_case.kv_gb < fp16.memory.worst_case.kv_gb);
}

#[test]
fn test_1gib_is_infeasible_but_still_reported() {
    let r = run(
        PrecisionSpec::default(),
        1,
        &[gib(1)],
        GpuModel::Rtx4090.into(),
        &EstimateOptions::default(),
    );
    assert_eq!(r.memory.capacity_by_kv_per_gpu, vec![0]);
    assert_eq!(r.memory.concurrency.effective_batch, 1);
    assert!(!r.fits());
    assert_eq!(r.memory.worst_case.fits_available_per_gpu, vec![false]);
    assert!(r.memory.worst_case.deficit_gb_per_gpu[0] > 14.0);
    assert_eq!(r.memory.recommended_gpu_memory_fraction, vec![1.0]);
    assert!(r.decode.conservative_tps.is_some());
    assert!(r.warnings.iter().any(|w| w.contains("batch forced to 1")));
    assert!(r.warnings.iter().any(|w| w.contains("does not fit on GPU 0")));
}

#[test]
fn test_weakest_gpu_binds_capacity() {
    let r = run(
        PrecisionSpec::default(),
        2,
        &[gib(24), gib(16)],
        GpuModel::Rtx4090.into(),
        &EstimateOptions {
            active_users: 256,
            ..Default::default()
        },
    );
    let caps = &r.memory.capacity_by_kv_per_gpu;
    assert!(caps[0] > caps[1]);
    assert_eq!(r.memory.concurrency.binding_capacity, caps[1]);
    assert_eq!(r.memory.concurrency.effective_batch, caps[1]);
}

// ============================================================================
// Topology Scenarios
// ============================================================================

#[test]
fn test_tp2_versus_tp1() {
    let options = EstimateOptions::default();
    let tp1 = run(PrecisionSpec::default(), 1, &[gib(24)], GpuModel::L40s.into(), &options);
    let tp2 = run(
        PrecisionSpec::default(),
        2,
        &[gib(24), gib(24)],
        GpuModel::L40s.into(),
        &options,
    );

    assert!(close(tp2.memory.weights_gb_per_gpu * 2.0, tp1.memory.weights_gb_per_gpu, 1e-9));
    assert!(close(tp2.memory.kv_bytes_per_token * 2.0, tp1.memory.kv_bytes_per_token, 1e-9));
    assert!(tp2.memory.capacity_by_kv_per_gpu[0] > 2 * tp1.memory.capacity_by_kv_per_gpu[0]);

    assert!(tp1.topology.single_gpu);
    assert!(!tp2.topology.single_gpu);
    assert_eq!(tp1.decode.interconnect_ms_per_token, Some(0.0));
    assert!(tp2.decode.interconnect_ms_per_token.unwrap() > 0.0);
    assert!(tp2.prefill.interconnect_seconds_prefill.unwrap() > 0.0);
    assert!(tp2.decode.compute_ms_per_token.unwrap() < tp1.decode.compute_ms_per_token.unwrap());
}

#[test]
fn test_single_gpu_has_no_interconnect_leg() {
    // four GPUs without tensor parallelism still never talk to each other
    let r = run(
        PrecisionSpec::default(),
        1,
        &[gib(80); 4],
        GpuModel::A100Sxm80.into(),
        &EstimateOptions::default(),
    );
    assert!(r.topology.single_gpu);
    assert_eq!(r.decode.interconnect_ms_per_token, Some(0.0));
    assert_eq!(r.prefill.interconnect_seconds_prefill, Some(0.0));
    assert_eq!(r.decode.dominant_leg, Some(Leg::Hbm));
}

#[test]
fn test_identical_inputs_serialize_identically() {
    let options = EstimateOptions {
        active_users: 12,
        ..Default::default()
    };
    let a = run(PrecisionSpec::default(), 2, &[gib(24), gib(24)], GpuModel::A10.into(), &options);
    let b = run(PrecisionSpec::default(), 2, &[gib(24), gib(24)], GpuModel::A10.into(), &options);
    assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
}

#[test]
fn test_consumer_key_names() {
    let r = run(
        PrecisionSpec::default(),
        1,
        &[gib(24)],
        GpuModel::Rtx4090.into(),
        &EstimateOptions::default(),
    );
    let v = serde_json::to_value(&r).unwrap();
    assert!(v["memory"]["perGPU_weights_gb"].is_number());
    assert!(v["memory"]["perGPU_required_gb"].is_number());
    assert!(v["memory"]["worst_case"]["fits_available_perGPU"].is_array());
    assert!(v["memory"]["worst_case"]["deficit_gb_perGPU"].is_array());
    assert!(v["decode"]["interconnect_ms_per_token"].is_number());
    assert!(v["decode"]["conservative_tps"].is_number());
    assert!(v["prefill"]["interconnect_seconds_prefill"].is_number());
}

// ============================================================================
// Degenerate Hardware
// ============================================================================

#[test]
fn test_unlisted_gpu_keeps_memory_sizing() {
    let r = run(
        PrecisionSpec::default(),
        1,
        &[gib(192)],
        GpuTarget::parse("mi300x"),
        &EstimateOptions::default(),
    );
    assert!(!r.topology.gpu_known);
    assert_eq!(r.topology.gpu_model, "mi300x");
    assert!(r.memory.capacity_by_kv_per_gpu[0] > 0);
    assert_eq!(r.decode.conservative_tps, None);
    assert_eq!(r.prefill.latency_seconds, None);
    assert_eq!(r.end_to_end_latency_seconds, None);
    assert!(r.warnings.iter().any(|w| w.contains("mi300x")));

    let json = serde_json::to_value(&r).unwrap();
    assert!(json["decode"]["conservative_tps"].is_null());
}

#[test]
fn test_unlisted_gpu_with_overrides() {
    let options = EstimateOptions {
        tensor_peaks_override_tflops: Some(1300.0),
        gpu_bandwidth_override_gbs: Some(5300.0),
        ..Default::default()
    };
    let r = run(PrecisionSpec::default(), 1, &[gib(192)], GpuTarget::parse("mi300x"), &options);
    assert!(r.decode.conservative_tps.is_some());
    assert!(r.end_to_end_latency_seconds.is_some());
    assert!(r.warnings.is_empty(), "{:?}", r.warnings);
}

#[test]
fn test_unsupported_math_format_warns() {
    let precision = PrecisionSpec {
        math: DType::Fp8,
        ..PrecisionSpec::default()
    };
    let r = run(precision, 1, &[gib(80)], GpuModel::A100Sxm80.into(), &EstimateOptions::default());
    assert_eq!(r.decode.compute_ms_per_token, None);
    assert_eq!(r.decode.conservative_tps, None);
    assert!(r.warnings.iter().any(|w| w.contains("no tensor peak")));
}

#[test]
fn test_end_to_end_latency() {
    let r = run(
        PrecisionSpec::default(),
        1,
        &[gib(24)],
        GpuModel::Rtx4090.into(),
        &EstimateOptions::default(),
    );
    let expected = r.prefill.latency_seconds.unwrap() + r.decode.decode_seconds.unwrap();
    assert!(close(r.end_to_end_latency_seconds.unwrap(), expected, 1e-12));
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_missing_hidden_size() {
    let config = json!({"num_attention_heads": 32, "num_hidden_layers": 32});
    let err = estimate(
        config.as_object().unwrap(),
        Some(7e9),
        &PrecisionSpec::default(),
        1,
        &[gib(24)],
        &GpuModel::L4.into(),
        &EstimateOptions::default(),
    )
    .unwrap_err();
    assert_eq!(err, EstimateError::Configuration { field: "hidden_size" });
}

#[test]
fn test_kv_heads_exceeding_heads() {
    let config = json!({
        "hidden_size": 4096, "num_attention_heads": 8, "num_key_value_heads": 16,
        "num_hidden_layers": 32,
    });
    let err = estimate(
        config.as_object().unwrap(),
        Some(7e9),
        &PrecisionSpec::default(),
        1,
        &[gib(24)],
        &GpuModel::L4.into(),
        &EstimateOptions::default(),
    )
    .unwrap_err();
    assert_eq!(err.code(), "INVALID_CONFIG");
}

#[test]
fn test_bad_topology_and_options() {
    let config = llama2_7b();
    let gpu: GpuTarget = GpuModel::L4.into();
    let precision = PrecisionSpec::default();

    let err = estimate(&config, Some(7e9), &precision, 3, &[gib(24); 2], &gpu, &EstimateOptions::default())
        .unwrap_err();
    assert!(matches!(err, EstimateError::InvalidTopology(_)));

    let err = estimate(&config, Some(7e9), &precision, 0, &[gib(24)], &gpu, &EstimateOptions::default())
        .unwrap_err();
    assert!(matches!(err, EstimateError::InvalidTopology(_)));

    let options = EstimateOptions {
        allocator_headroom: 1.5,
        ..Default::default()
    };
    let err = estimate(&config, Some(7e9), &precision, 1, &[gib(24)], &gpu, &options).unwrap_err();
    assert_eq!(err.code(), "INVALID_OPTION");
}

#[test]
fn test_oversized_prompt_length_is_an_option_error() {
    let options: EstimateOptions =
        serde_json::from_value(json!({ "avg_prompt_len": u64::MAX })).unwrap();
    let err = estimate(
        &llama2_7b(),
        Some(7e9),
        &PrecisionSpec::default(),
        1,
        &[gib(24)],
        &GpuModel::L4.into(),
        &options,
    )
    .unwrap_err();
    assert_eq!(err.code(), "INVALID_OPTION");
}

// ============================================================================
// Rule-of-Thumb Crosscheck
// ============================================================================

#[test]
fn test_fixed_cost_tracks_rule_of_thumb() {
    // (preset, params, weight dtype, tp, fixed cost above the rule of thumb)
    //
    // fixed = (shard + 1.5 GiB) / 0.9 against 1.2 * shard: the constant
    // runtime and activation reserve dominate below ~18.75 GiB per GPU.
    let cases = [
        ("llama-2-7b", 7e9, DType::Fp16, 1, true),
        ("llama-2-7b", 7e9, DType::Int4, 1, true),
        ("mistral-7b", 7.2e9, DType::Fp8, 1, true),
        ("llama-2-13b", 13e9, DType::Fp16, 1, false),
        ("llama-3-70b", 70e9, DType::Fp16, 2, false),
        ("llama-3-70b", 70e9, DType::Fp8, 1, false),
    ];

    for (name, params, weight, tp, fixed_above) in cases {
        let memory = vec![gib(80); tp as usize];
        let precision = PrecisionSpec::default().with_weight(weight);
        let r = estimate(
            &preset(name).unwrap(),
            Some(params),
            &precision,
            tp,
            &memory,
            &GpuModel::H100Sxm.into(),
            &EstimateOptions::default(),
        )
        .unwrap();

        let topology = Topology::new(memory.len(), tp).unwrap();
        let check = compare(params, weight, &topology, &r.memory);
        let expected_rule = params * weight.bytes() * RULE_OF_THUMB_OVERHEAD / tp as f64 / GIB;
        assert!(close(check.rule_of_thumb_gb_per_gpu, expected_rule, 1e-9), "{name} {weight:?}");
        assert_eq!(check.fixed_gb_per_gpu, r.memory.fixed_gb_per_gpu);

        let gap = check.relative_gap.unwrap();
        assert!(gap.abs() < 0.35, "{name} {weight:?}: gap {gap}");
        assert_eq!(gap > 0.0, fixed_above, "{name} {weight:?}: gap {gap}");
    }
}
