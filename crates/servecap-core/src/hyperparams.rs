//! Transformer hyperparameters resolved from a loosely-structured config map.
//!
//! Model families spell the same architecture field differently
//! (`hidden_size`, `n_embd`, `d_model`, ...). [`FIELD_ALIASES`] lists, per
//! canonical field, the spellings tried in order; [`resolve`] walks that
//! table once and returns a fully validated [`ModelHyperparameters`].

use crate::error::{EstimateError, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

pub const HIDDEN_SIZE: &str = "hidden_size";
pub const NUM_ATTENTION_HEADS: &str = "num_attention_heads";
pub const NUM_KEY_VALUE_HEADS: &str = "num_key_value_heads";
pub const HEAD_DIM: &str = "head_dim";
pub const NUM_LAYERS: &str = "num_layers";
pub const INTERMEDIATE_SIZE: &str = "intermediate_size";
pub const VOCAB_SIZE: &str = "vocab_size";
pub const MAX_CONTEXT_LEN: &str = "max_context_len";
pub const NUM_PARAMS: &str = "num_params";

/// Canonical field -> key spellings, tried in order.
pub const FIELD_ALIASES: &[(&str, &[&str])] = &[
    (
        HIDDEN_SIZE,
        &["hidden_size", "n_embd", "d_model", "n_embed", "hidden_dim", "dim", "model_dim"],
    ),
    (
        NUM_ATTENTION_HEADS,
        &["num_attention_heads", "n_head", "num_heads", "n_heads", "num_attention_head"],
    ),
    (
        NUM_KEY_VALUE_HEADS,
        &[
            "num_key_value_heads",
            "num_kv_heads",
            "n_kv_heads",
            "n_head_kv",
            "multi_query_group_num",
            "num_query_groups",
        ],
    ),
    (HEAD_DIM, &["head_dim", "attention_head_size", "kv_channels", "d_head"]),
    (
        NUM_LAYERS,
        &["num_hidden_layers", "n_layer", "num_layers", "n_layers", "num_blocks"],
    ),
    (
        INTERMEDIATE_SIZE,
        &["intermediate_size", "ffn_dim", "n_inner", "ffn_hidden_size", "d_ff"],
    ),
    (VOCAB_SIZE, &["vocab_size", "padded_vocab_size", "n_vocab"]),
    (
        MAX_CONTEXT_LEN,
        &[
            "max_position_embeddings",
            "max_sequence_length",
            "max_seq_len",
            "seq_length",
            "n_positions",
            "n_ctx",
            "model_max_length",
        ],
    ),
];

fn aliases(field: &str) -> &'static [&'static str] {
    FIELD_ALIASES
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, keys)| *keys)
        .unwrap_or(&[])
}

/// Architecture of a dense transformer decoder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelHyperparameters {
    pub hidden_size: u64,
    pub num_attention_heads: u64,
    pub num_key_value_heads: u64,
    pub head_dim: u64,
    pub num_layers: u64,
    pub intermediate_size: u64,
    pub num_params: f64,
    pub vocab_size: Option<u64>,
    pub max_context_len: Option<u64>,
}

impl ModelHyperparameters {
    /// Check the invariants every estimator formula relies on.
    pub fn validate(&self) -> Result<()> {
        let dims = [
            (HIDDEN_SIZE, self.hidden_size),
            (NUM_ATTENTION_HEADS, self.num_attention_heads),
            (NUM_KEY_VALUE_HEADS, self.num_key_value_heads),
            (HEAD_DIM, self.head_dim),
            (NUM_LAYERS, self.num_layers),
            (INTERMEDIATE_SIZE, self.intermediate_size),
        ];
        for (field, value) in dims {
            if value == 0 {
                return Err(EstimateError::InvalidHyperparameter {
                    field,
                    reason: "must be positive".to_string(),
                });
            }
        }
        if self.num_key_value_heads > self.num_attention_heads {
            return Err(EstimateError::InvalidHyperparameter {
                field: NUM_KEY_VALUE_HEADS,
                reason: format!(
                    "{} KV heads exceeds {} attention heads",
                    self.num_key_value_heads, self.num_attention_heads
                ),
            });
        }
        if !(self.num_params.is_finite() && self.num_params > 0.0) {
            return Err(EstimateError::InvalidHyperparameter {
                field: NUM_PARAMS,
                reason: format!("{} is not a positive parameter count", self.num_params),
            });
        }
        Ok(())
    }

    /// Whether the model uses grouped-query (or multi-query) attention.
    pub fn uses_gqa(&self) -> bool {
        self.num_key_value_heads < self.num_attention_heads
    }

    /// Query heads per KV head.
    pub fn gqa_ratio(&self) -> f64 {
        self.num_attention_heads as f64 / self.num_key_value_heads as f64
    }

    /// Parameter count implied by the architecture, if the vocabulary is known.
    ///
    /// Counts embeddings, Q/K/V/O projections, a gated FFN (gate, up, down),
    /// two norms per layer, the final norm and an LM head unless tied.
    pub fn architecture_params(&self, tied_embeddings: bool) -> Option<f64> {
        let vocab = self.vocab_size? as f64;
        let d = self.hidden_size as f64;
        let q_width = (self.num_attention_heads * self.head_dim) as f64;
        let kv_width = (self.num_key_value_heads * self.head_dim) as f64;

        let attn = d * q_width + 2.0 * d * kv_width + q_width * d;
        let ffn = 3.0 * d * self.intermediate_size as f64;
        let per_layer = attn + ffn + 2.0 * d;
        let embed = vocab * d;
        let head = if tied_embeddings { 0.0 } else { vocab * d };
        Some(embed + self.num_layers as f64 * per_layer + d + head)
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Ordered lookup over the top-level map and an optional nested `text_config`.
struct Lookup<'a> {
    maps: Vec<&'a Map<String, Value>>,
}

impl<'a> Lookup<'a> {
    fn new(config: &'a Map<String, Value>) -> Self {
        let mut maps = vec![config];
        if let Some(nested) = config.get("text_config").and_then(Value::as_object) {
            maps.push(nested);
        }
        Self { maps }
    }

    /// First numeric value among the field's aliases.
    fn number(&self, field: &str) -> Option<f64> {
        self.maps.iter().find_map(|map| {
            aliases(field)
                .iter()
                .find_map(|key| map.get(*key).and_then(as_number))
        })
    }

    fn optional(&self, field: &'static str) -> Result<Option<u64>> {
        self.number(field).map(|value| to_count(field, value)).transpose()
    }

    fn required(&self, field: &'static str) -> Result<u64> {
        self.optional(field)?
            .ok_or(EstimateError::Configuration { field })
    }

    fn flag(&self, key: &str) -> bool {
        self.maps
            .iter()
            .find_map(|map| map.get(key).and_then(Value::as_bool))
            .unwrap_or(false)
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<u64>().ok().map(|n| n as f64),
        _ => None,
    }
}

fn to_count(field: &'static str, value: f64) -> Result<u64> {
    if value.is_finite() && value >= 1.0 && value.fract() == 0.0 {
        Ok(value as u64)
    } else {
        Err(EstimateError::InvalidHyperparameter {
            field,
            reason: format!("{value} is not a positive integer"),
        })
    }
}

/// Resolve hyperparameters from a raw config map.
///
/// # Arguments
/// * `config` - Raw architecture config (e.g. a Hugging Face `config.json`)
/// * `num_params` - Explicit parameter count; derived from the architecture when `None`
///
/// # Errors
/// - `Configuration`: hidden size, attention heads or layer count is absent,
///   or `num_params` is `None` and the config has no vocabulary size
/// - `InvalidHyperparameter`: a present value is not a positive integer, or
///   KV heads exceed attention heads
pub fn resolve(config: &Map<String, Value>, num_params: Option<f64>) -> Result<ModelHyperparameters> {
    let lookup = Lookup::new(config);

    let hidden_size = lookup.required(HIDDEN_SIZE)?;
    let num_attention_heads = lookup.required(NUM_ATTENTION_HEADS)?;
    let num_layers = lookup.required(NUM_LAYERS)?;

    let num_key_value_heads = match lookup.optional(NUM_KEY_VALUE_HEADS)? {
        Some(heads) => heads,
        None if lookup.flag("multi_query") => 1,
        None => num_attention_heads,
    };
    let head_dim = match lookup.optional(HEAD_DIM)? {
        Some(dim) => dim,
        None => hidden_size.div_ceil(num_attention_heads),
    };
    let intermediate_size = lookup
        .optional(INTERMEDIATE_SIZE)?
        .unwrap_or(4 * hidden_size);

    let mut hp = ModelHyperparameters {
        hidden_size,
        num_attention_heads,
        num_key_value_heads,
        head_dim,
        num_layers,
        intermediate_size,
        num_params: 0.0,
        vocab_size: lookup.optional(VOCAB_SIZE)?,
        max_context_len: lookup.optional(MAX_CONTEXT_LEN)?,
    };

    hp.num_params = match num_params {
        Some(params) => params,
        None => hp
            .architecture_params(lookup.flag("tie_word_embeddings"))
            .ok_or(EstimateError::Configuration { field: NUM_PARAMS })?,
    };

    hp.validate()?;
    debug!(
        hidden = hp.hidden_size,
        heads = hp.num_attention_heads,
        kv_heads = hp.num_key_value_heads,
        layers = hp.num_layers,
        params = hp.num_params,
        "resolved hyperparameters"
    );
    Ok(hp)
}

// ============================================================================
// Presets
// ============================================================================

/// Names accepted by [`preset`].
pub const PRESETS: &[&str] = &[
    "llama-2-7b",
    "llama-2-13b",
    "llama-3-8b",
    "llama-3-70b",
    "mistral-7b",
    "qwen2.5-7b",
    "falcon-7b",
];

/// Raw config map of a well-known dense model.
pub fn preset(name: &str) -> Result<Map<String, Value>> {
    let config = match name.to_lowercase().as_str() {
        "llama-2-7b" => json!({
            "hidden_size": 4096, "num_attention_heads": 32, "num_key_value_heads": 32,
            "num_hidden_layers": 32, "intermediate_size": 11008, "vocab_size": 32000,
            "max_position_embeddings": 4096,
        }),
        "llama-2-13b" => json!({
            "hidden_size": 5120, "num_attention_heads": 40, "num_key_value_heads": 40,
            "num_hidden_layers": 40, "intermediate_size": 13824, "vocab_size": 32000,
            "max_position_embeddings": 4096,
        }),
        "llama-3-8b" => json!({
            "hidden_size": 4096, "num_attention_heads": 32, "num_key_value_heads": 8,
            "num_hidden_layers": 32, "intermediate_size": 14336, "vocab_size": 128256,
            "max_position_embeddings": 8192,
        }),
        "llama-3-70b" => json!({
            "hidden_size": 8192, "num_attention_heads": 64, "num_key_value_heads": 8,
            "num_hidden_layers": 80, "intermediate_size": 28672, "vocab_size": 128256,
            "max_position_embeddings": 8192,
        }),
        "mistral-7b" => json!({
            "hidden_size": 4096, "num_attention_heads": 32, "num_key_value_heads": 8,
            "num_hidden_layers": 32, "intermediate_size": 14336, "vocab_size": 32000,
            "max_position_embeddings": 32768,
        }),
        "qwen2.5-7b" => json!({
            "hidden_size": 3584, "num_attention_heads": 28, "num_key_value_heads": 4,
            "num_hidden_layers": 28, "intermediate_size": 18944, "vocab_size": 152064,
            "max_position_embeddings": 32768,
        }),
        "falcon-7b" => json!({
            "hidden_size": 4544, "n_head": 71, "n_layer": 32, "multi_query": true,
            "vocab_size": 65024, "tie_word_embeddings": true,
        }),
        _ => return Err(EstimateError::UnknownPreset(name.to_string())),
    };
    Ok(config.as_object().cloned().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_resolve_canonical_keys() {
        let hp = resolve(&preset("llama-3-8b").unwrap(), None).unwrap();
        assert_eq!(hp.hidden_size, 4096);
        assert_eq!(hp.num_key_value_heads, 8);
        assert_eq!(hp.head_dim, 128);
        assert_eq!(hp.max_context_len, Some(8192));
        assert!(hp.uses_gqa());
        assert_eq!(hp.gqa_ratio(), 4.0);
        // ~8.03B parameters
        assert!((hp.num_params / 1e9 - 8.03).abs() < 0.05, "params {}", hp.num_params);
    }

    #[test]
    fn test_resolve_gpt2_style_aliases() {
        let config = map(json!({
            "n_embd": 768, "n_head": 12, "n_layer": 12, "n_positions": 1024,
            "vocab_size": 50257, "model_type": "gpt2", "activation_function": "gelu_new",
        }));
        let hp = resolve(&config, Some(124e6)).unwrap();
        assert_eq!(hp.hidden_size, 768);
        assert_eq!(hp.num_key_value_heads, 12);
        assert_eq!(hp.head_dim, 64);
        assert_eq!(hp.intermediate_size, 3072);
        assert_eq!(hp.max_context_len, Some(1024));
        assert_eq!(hp.num_params, 124e6);
    }

    #[test]
    fn test_head_dim_rounds_up() {
        let config = map(json!({"hidden_size": 100, "num_attention_heads": 3, "num_hidden_layers": 2}));
        let hp = resolve(&config, Some(1e6)).unwrap();
        assert_eq!(hp.head_dim, 34);
    }

    #[test]
    fn test_multi_query_flag() {
        let hp = resolve(&preset("falcon-7b").unwrap(), None).unwrap();
        assert_eq!(hp.num_key_value_heads, 1);
        assert_eq!(hp.head_dim, 64);
        assert_eq!(hp.intermediate_size, 4 * 4544);
    }

    #[test]
    fn test_nested_text_config() {
        let config = map(json!({
            "architectures": ["LlavaForConditionalGeneration"],
            "text_config": {"hidden_size": 4096, "num_attention_heads": 32, "num_hidden_layers": 32},
        }));
        let hp = resolve(&config, Some(7e9)).unwrap();
        assert_eq!(hp.hidden_size, 4096);
    }

    #[test]
    fn test_missing_mandatory_fields() {
        let config = map(json!({"num_attention_heads": 32, "num_hidden_layers": 32}));
        assert_eq!(
            resolve(&config, Some(7e9)).unwrap_err(),
            EstimateError::Configuration { field: HIDDEN_SIZE }
        );

        let config = map(json!({"hidden_size": 4096, "num_hidden_layers": 32}));
        assert_eq!(
            resolve(&config, Some(7e9)).unwrap_err(),
            EstimateError::Configuration { field: NUM_ATTENTION_HEADS }
        );

        let config = map(json!({"hidden_size": 4096, "num_attention_heads": 32}));
        assert_eq!(
            resolve(&config, Some(7e9)).unwrap_err(),
            EstimateError::Configuration { field: NUM_LAYERS }
        );
    }

    #[test]
    fn test_params_need_vocab_when_not_given() {
        let config = map(json!({"hidden_size": 4096, "num_attention_heads": 32, "num_hidden_layers": 32}));
        assert_eq!(
            resolve(&config, None).unwrap_err(),
            EstimateError::Configuration { field: NUM_PARAMS }
        );
    }

    #[test]
    fn test_invalid_values() {
        let config = map(json!({
            "hidden_size": 4096, "num_attention_heads": 8, "num_key_value_heads": 16,
            "num_hidden_layers": 32,
        }));
        assert!(matches!(
            resolve(&config, Some(7e9)),
            Err(EstimateError::InvalidHyperparameter { field: NUM_KEY_VALUE_HEADS, .. })
        ));

        let config = map(json!({"hidden_size": -1, "num_attention_heads": 8, "num_hidden_layers": 2}));
        assert!(matches!(
            resolve(&config, Some(7e9)),
            Err(EstimateError::InvalidHyperparameter { field: HIDDEN_SIZE, .. })
        ));
    }

    #[test]
    fn test_numeric_strings_and_non_numeric_values() {
        let config = map(json!({
            "hidden_size": "2048", "n_embd": 1, "num_attention_heads": 16,
            "num_hidden_layers": "n/a", "n_layer": 24,
        }));
        let hp = resolve(&config, Some(1e9)).unwrap();
        assert_eq!(hp.hidden_size, 2048);
        assert_eq!(hp.num_layers, 24);
    }

    #[test]
    fn test_all_presets_resolve() {
        for name in PRESETS {
            let hp = resolve(&preset(name).unwrap(), None).unwrap();
            assert!(hp.num_params > 1e9, "{name}");
        }
        assert!(matches!(preset("gpt-9"), Err(EstimateError::UnknownPreset(_))));
    }
}
