//! JSON-RPC 2.0 frames and method payloads exchanged with an instrument peer.
//!
//! One frame per line. Scan results carry one value per resolved position,
//! in the same order the trajectory planner produces for the request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use scope_core::{Extent, InstrumentKind, ScanDirection, Trace, Value};

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const UNKNOWN_DATASET: i64 = -32001;
pub const OUT_OF_RANGE: i64 = -32002;
pub const NOT_INITIALIZED: i64 = -32003;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Request {
    pub fn new(id: u64, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn ok(id: Option<u64>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<u64>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Peer-side imperfection applied to a frame. Never changes which positions
/// are visited, only the values reported for them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modification {
    #[default]
    None,
    TipDamage,
    FeedbackDegradation,
}

impl Modification {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Some(Modification::None),
            "tip_damage" => Some(Modification::TipDamage),
            "feedback_degradation" => Some(Modification::FeedbackDegradation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    pub instrument: InstrumentKind,
    pub dataset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    pub pitch: f64,
    pub extent: Extent,
    pub channels: Vec<String>,
    #[serde(default)]
    pub info: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointParams {
    pub channel: String,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointResult {
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineParams {
    pub direction: ScanDirection,
    pub coord: f64,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameParams {
    pub channels: Vec<String>,
    #[serde(default)]
    pub modification: Modification,
    #[serde(default)]
    pub direction: ScanDirection,
    #[serde(default)]
    pub trace: Trace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathParams {
    pub points: Vec<[f64; 2]>,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResult {
    pub channels: BTreeMap<String, Vec<Value>>,
}
