//! MCP (Model Context Protocol) server for servecap.
//!
//! Exposes the serving estimator as tools over JSON-RPC on stdio.
//!
//! Tools:
//! - servecap_estimate: Full memory, concurrency and throughput report
//! - servecap_fits: Worst-case fit of a model across GPU models
//! - servecap_gpus: GPU capability table

use sc_tools::{fit_sweep, init_logging, EstimateRequest, ErrorResponse, Response, ToolError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use servecap_core::hyperparams::PRESETS;
use servecap_core::{GpuModel, GpuSpec};
use std::io::{self, BufRead, Write};
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2024-11-05";

// ============================================================================
// JSON-RPC Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl JsonRpcResponse {
    fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
        }
    }
}

// ============================================================================
// MCP Protocol Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ServerInfo {
    name: String,
    version: String,
}

#[derive(Debug, Serialize)]
struct ServerCapabilities {
    tools: ToolsCapability,
}

#[derive(Debug, Serialize)]
struct ToolsCapability {
    #[serde(rename = "listChanged")]
    list_changed: bool,
}

#[derive(Debug, Serialize)]
struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    protocol_version: String,
    capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    server_info: ServerInfo,
}

#[derive(Debug, Serialize)]
struct Tool {
    name: String,
    description: String,
    #[serde(rename = "inputSchema")]
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct ToolListResult {
    tools: Vec<Tool>,
}

#[derive(Debug, Serialize)]
struct ToolCallResult {
    content: Vec<ToolContent>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    is_error: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ToolContent {
    #[serde(rename = "type")]
    content_type: String,
    text: String,
}

// ============================================================================
// Tool Implementations
// ============================================================================

fn parse_request(arguments: Value) -> Result<EstimateRequest, ToolError> {
    serde_json::from_value(arguments).map_err(|e| ToolError::Parse {
        path: "arguments".to_string(),
        message: e.to_string(),
    })
}

fn tool_estimate(arguments: Value) -> Result<Value, ToolError> {
    let request = parse_request(arguments)?;
    let report = request.run()?;
    info!(
        gpu = %report.topology.gpu_model,
        batch = report.memory.concurrency.effective_batch,
        "estimate complete"
    );
    serde_json::to_value(Response::new(&report)).map_err(json_error)
}

fn tool_fits(mut arguments: Value) -> Result<Value, ToolError> {
    // `candidates` is ours; everything else belongs to the estimate request.
    let candidates = arguments
        .as_object_mut()
        .and_then(|map| map.remove("candidates"));
    let gpus = match candidates {
        Some(Value::Array(ids)) => ids
            .iter()
            .map(|id| match id.as_str() {
                Some(id) => Ok(id.parse::<GpuModel>()?),
                None => Err(ToolError::Parse {
                    path: "candidates".to_string(),
                    message: format!("expected a GPU id string, got {id}"),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(ToolError::Parse {
                path: "candidates".to_string(),
                message: format!("expected an array of GPU ids, got {other}"),
            })
        }
        None => GpuModel::ALL.to_vec(),
    };

    let request = parse_request(arguments)?;
    let rows = fit_sweep(&request, &gpus)?;
    serde_json::to_value(Response::new(&rows)).map_err(json_error)
}

fn tool_gpus() -> Result<Value, ToolError> {
    let specs: Vec<GpuSpec> = GpuModel::ALL.iter().map(|m| m.spec()).collect();
    serde_json::to_value(Response::new(&specs)).map_err(json_error)
}

fn json_error(err: serde_json::Error) -> ToolError {
    ToolError::Parse {
        path: "response".to_string(),
        message: err.to_string(),
    }
}

// ============================================================================
// Tool Registry
// ============================================================================

fn request_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "preset": {
                "type": "string",
                "description": "Built-in model preset",
                "enum": PRESETS
            },
            "config": {
                "type": "object",
                "description": "Raw model config (Hugging Face config.json fields). Exclusive with preset"
            },
            "num_params": {
                "type": ["number", "string"],
                "description": "Parameter count, e.g. 7e9 or \"7b\". Derived from the config when omitted"
            },
            "gpu": {
                "type": "string",
                "description": "GPU model id, e.g. a100-80g, h100-sxm, rtx-4090"
            },
            "gpu_memory": {
                "type": "array",
                "items": { "type": ["number", "string"] },
                "description": "Available memory per GPU in bytes or with a suffix (\"24g\"). Defaults to the GPU's full memory"
            },
            "gpus": {
                "type": "integer",
                "description": "Number of GPUs",
                "minimum": 1
            },
            "tensor_parallel_degree": {
                "type": "integer",
                "description": "Tensor-parallel degree (default: number of GPUs)",
                "minimum": 1
            },
            "precision": {
                "type": "object",
                "description": "Dtypes: weight, activation, kv, math (fp32, fp16, bf16, fp8, int8, int4, fp4) and accumulate (fp16, fp32, int32)"
            },
            "options": {
                "type": "object",
                "description": "Estimator options; run sc-options for the full list with defaults"
            }
        }
    })
}

fn get_tools() -> Vec<Tool> {
    let mut fits_schema = request_schema();
    fits_schema["properties"]["candidates"] = json!({
        "type": "array",
        "items": { "type": "string" },
        "description": "GPU ids to check (default: every known GPU)"
    });

    vec![
        Tool {
            name: "servecap_estimate".to_string(),
            description: "Estimate memory, concurrency, decode throughput and prefill latency \
                          for serving an LLM on GPUs"
                .to_string(),
            input_schema: request_schema(),
        },
        Tool {
            name: "servecap_fits".to_string(),
            description: "Check whether one max-context request fits on each GPU model".to_string(),
            input_schema: fits_schema,
        },
        Tool {
            name: "servecap_gpus".to_string(),
            description: "List known GPUs with memory, bandwidth and tensor peaks".to_string(),
            input_schema: json!({ "type": "object", "properties": {} }),
        },
    ]
}

fn call_tool(name: &str, arguments: Value) -> Result<Value, ToolError> {
    match name {
        "servecap_estimate" => tool_estimate(arguments),
        "servecap_fits" => tool_fits(arguments),
        "servecap_gpus" => tool_gpus(),
        _ => Err(ToolError::Conflict(format!("unknown tool: {name}"))),
    }
}

// ============================================================================
// Request Handlers
// ============================================================================

fn handle_initialize() -> serde_json::Result<Value> {
    serde_json::to_value(InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: ServerCapabilities {
            tools: ToolsCapability { list_changed: false },
        },
        server_info: ServerInfo {
            name: "mcp-servecap-server".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    })
}

fn handle_tools_list() -> serde_json::Result<Value> {
    serde_json::to_value(ToolListResult { tools: get_tools() })
}

fn handle_tools_call(params: &Value) -> serde_json::Result<Value> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));

    let (envelope, is_error) = match call_tool(name, arguments) {
        Ok(result) => (result, None),
        Err(err) => {
            warn!(tool = name, code = err.code(), "tool call failed: {err}");
            (serde_json::to_value(ErrorResponse::from_error(&err))?, Some(true))
        }
    };

    serde_json::to_value(ToolCallResult {
        content: vec![ToolContent {
            content_type: "text".to_string(),
            text: serde_json::to_string_pretty(&envelope)?,
        }],
        is_error,
    })
}

fn handle_request(request: &JsonRpcRequest) -> Option<JsonRpcResponse> {
    debug!("Handling method: {}", request.method);

    let result = match request.method.as_str() {
        "initialize" => handle_initialize(),
        "tools/list" => handle_tools_list(),
        "tools/call" => handle_tools_call(&request.params),
        "ping" => Ok(json!({})),
        // Notifications get no response
        "initialized" | "notifications/initialized" | "notifications/cancelled" => return None,
        _ => {
            return Some(JsonRpcResponse::error(
                request.id.clone(),
                -32601,
                format!("Method not found: {}", request.method),
            ))
        }
    };

    Some(match result {
        Ok(value) => JsonRpcResponse::result(request.id.clone(), value),
        Err(e) => JsonRpcResponse::error(request.id.clone(), -32603, format!("Internal error: {e}")),
    })
}

// ============================================================================
// Main Loop
// ============================================================================

fn main() -> anyhow::Result<()> {
    init_logging();

    info!("Starting mcp-servecap-server v{}", env!("CARGO_PKG_VERSION"));

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut stdout_handle = stdout.lock();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        debug!("Received: {}", line);

        let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(request) => handle_request(&request),
            Err(e) => Some(JsonRpcResponse::error(None, -32700, format!("Parse error: {e}"))),
        };

        if let Some(response) = response {
            let response_json = serde_json::to_string(&response)?;
            debug!("Sending: {}", response_json);
            writeln!(stdout_handle, "{}", response_json)?;
            stdout_handle.flush()?;
        }
    }

    info!("Server shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(1)),
            method: method.to_string(),
            params,
        }
    }

    fn call(name: &str, arguments: Value) -> (Value, bool) {
        let response = handle_request(&request(
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
        ))
        .unwrap();
        let result = response.result.unwrap();
        let is_error = result.get("isError").and_then(Value::as_bool).unwrap_or(false);
        let text = result["content"][0]["text"].as_str().unwrap();
        (serde_json::from_str(text).unwrap(), is_error)
    }

    #[test]
    fn test_initialize_reports_server_info() {
        let response = handle_request(&request("initialize", json!({}))).unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "mcp-servecap-server");
    }

    #[test]
    fn test_tools_list_names() {
        let response = handle_request(&request("tools/list", Value::Null)).unwrap();
        let names: Vec<String> = response.result.unwrap()["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["servecap_estimate", "servecap_fits", "servecap_gpus"]);
    }

    #[test]
    fn test_notifications_get_no_response() {
        assert!(handle_request(&request("initialized", Value::Null)).is_none());
        assert!(handle_request(&request("notifications/cancelled", Value::Null)).is_none());
    }

    #[test]
    fn test_unknown_method() {
        let response = handle_request(&request("resources/list", Value::Null)).unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[test]
    fn test_estimate_tool() {
        let (envelope, is_error) = call(
            "servecap_estimate",
            json!({
                "preset": "llama-2-7b",
                "num_params": "7b",
                "gpu": "rtx-4090",
                "gpu_memory": ["24g"],
                "options": { "active_users": 4 }
            }),
        );
        assert!(!is_error);
        assert_eq!(envelope["ok"], true);
        assert_eq!(envelope["data"]["memory"]["concurrency"]["effective_batch"], 4);
    }

    #[test]
    fn test_estimate_tool_unknown_gpu() {
        let (envelope, is_error) = call(
            "servecap_estimate",
            json!({ "preset": "llama-2-7b", "gpu": "mi300x", "gpu_memory": ["192g"] }),
        );
        assert!(is_error);
        assert_eq!(envelope["ok"], false);
        assert_eq!(envelope["error"]["code"], "UNKNOWN_GPU");
        assert!(envelope["error"]["suggestion"].is_string());
    }

    #[test]
    fn test_estimate_tool_rejects_unknown_argument() {
        let (envelope, is_error) = call(
            "servecap_estimate",
            json!({ "preset": "llama-2-7b", "gpu": "l4", "vram": 24 }),
        );
        assert!(is_error);
        assert_eq!(envelope["error"]["code"], "INVALID_CONFIG");
    }

    #[test]
    fn test_estimate_tool_huge_gpu_count() {
        let (envelope, is_error) = call(
            "servecap_estimate",
            json!({ "preset": "llama-2-7b", "gpu": "l4", "gpus": u64::MAX }),
        );
        assert!(is_error);
        assert_eq!(envelope["error"]["code"], "INVALID_TOPOLOGY");

        let (envelope, is_error) = call(
            "servecap_fits",
            json!({ "preset": "llama-2-7b", "gpus": u64::MAX, "candidates": ["l4"] }),
        );
        assert!(is_error);
        assert_eq!(envelope["error"]["code"], "INVALID_TOPOLOGY");
    }

    #[test]
    fn test_fits_tool_with_candidates() {
        let (envelope, is_error) = call(
            "servecap_fits",
            json!({
                "preset": "llama-2-7b",
                "num_params": "7b",
                "candidates": ["l4", "h100-sxm"]
            }),
        );
        assert!(!is_error);
        let rows = envelope["data"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["fits"], true);
    }

    #[test]
    fn test_fits_tool_bad_candidates() {
        let (envelope, is_error) = call(
            "servecap_fits",
            json!({ "preset": "llama-2-7b", "candidates": "l4" }),
        );
        assert!(is_error);
        assert_eq!(envelope["error"]["code"], "INVALID_CONFIG");
    }

    #[test]
    fn test_gpus_tool() {
        let (envelope, is_error) = call("servecap_gpus", json!({}));
        assert!(!is_error);
        assert_eq!(envelope["data"].as_array().unwrap().len(), GpuModel::ALL.len());
    }

    #[test]
    fn test_unknown_tool() {
        let (_, is_error) = call("missing_tool", json!({}));
        assert!(is_error);
    }
}
