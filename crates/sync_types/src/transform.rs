use serde::{
    Deserialize,
    Serialize,
};
use serde_json::{
    json,
    Value as JsonValue,
};

use errors::ErrorBody;

/// One symbolic query reference sent to the user's get-queries endpoint for
/// rewriting into an authorized AST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformRequestEntry {
    pub id: String,
    pub name: String,
    pub args: JsonValue,
}

/// Wire form: `["transform", [entries...]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformRequest {
    pub entries: Vec<TransformRequestEntry>,
}

impl From<TransformRequest> for JsonValue {
    fn from(request: TransformRequest) -> JsonValue {
        json!(["transform", request.entries])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformedEntry {
    Error {
        error: String,
        id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<JsonValue>,
    },
    Transformed {
        id: String,
        name: String,
        ast: JsonValue,
    },
}

/// Parsed response from the get-queries endpoint: `["transformed", [...]]`
/// on success, `["transformFailed", body]` when the endpoint itself failed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformResponse {
    Transformed(Vec<TransformedEntry>),
    TransformFailed(ErrorBody),
}

impl TryFrom<JsonValue> for TransformResponse {
    type Error = anyhow::Error;

    fn try_from(value: JsonValue) -> anyhow::Result<Self> {
        let JsonValue::Array(mut parts) = value else {
            anyhow::bail!("Expected a [kind, body] tuple");
        };
        anyhow::ensure!(parts.len() == 2, "Expected a [kind, body] tuple");
        let body = parts.pop().expect("len checked");
        let JsonValue::String(kind) = parts.pop().expect("len checked") else {
            anyhow::bail!("Response kind must be a string");
        };
        let response = match kind.as_str() {
            "transformed" => TransformResponse::Transformed(
                serde_json::from_value(body)
                    .map_err(|e| anyhow::anyhow!("Invalid transformed body: {e}"))?,
            ),
            "transformFailed" => TransformResponse::TransformFailed(
                serde_json::from_value(body)
                    .map_err(|e| anyhow::anyhow!("Invalid transformFailed body: {e}"))?,
            ),
            _ => anyhow::bail!("Unknown transform response kind {kind:?}"),
        };
        Ok(response)
    }
}
