use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

/// Version of the push-endpoint body layout.
pub const PUSH_VERSION: u32 = 1;

/// A custom mutation as received from the client and forwarded to the user's
/// push endpoint. Per client, `id` starts at 1 and increases contiguously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", rename = "custom")]
pub struct Mutation {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub id: u64,
    pub name: String,
    pub args: JsonValue,
    pub timestamp: f64,
}

/// Body of the `push` WebSocket message and of the POST to the user's push
/// endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBody {
    #[serde(rename = "clientGroupID")]
    pub client_group_id: String,
    pub mutations: Vec<Mutation>,
    pub push_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    pub timestamp: f64,
    #[serde(rename = "requestID")]
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationId {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub id: u64,
}

/// Result of one mutation on the user server: empty object on success, or an
/// error with optional details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MutationResult {
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<JsonValue>,
    },
    Ok {},
}

impl MutationResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, MutationResult::Ok {})
    }

    /// The out-of-order marker halts processing of a client's mutations.
    pub fn is_ooo_mutation(&self) -> bool {
        matches!(self, MutationResult::Error { error, .. } if error == "oooMutation")
    }

    pub fn already_processed() -> Self {
        MutationResult::Ok {}
    }

    pub fn app_error(message: String) -> Self {
        MutationResult::Error {
            error: "app".to_owned(),
            details: Some(JsonValue::String(message)),
        }
    }

    pub fn ooo_mutation() -> Self {
        MutationResult::Error {
            error: "oooMutation".to_owned(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResponse {
    pub id: MutationId,
    pub result: MutationResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushOk {
    pub mutations: Vec<MutationResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushErrorKind {
    UnsupportedPushVersion,
    UnsupportedSchemaVersion,
    ForClient,
    Unknown,
}

/// Top-level failure of an entire push call. The `error` discriminant is an
/// open string union on the wire; unrecognized values classify as `Unknown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushError {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "mutationIDs", default, skip_serializing_if = "Option::is_none")]
    pub mutation_ids: Option<Vec<MutationId>>,
}

impl PushError {
    pub fn kind(&self) -> PushErrorKind {
        match self.error.as_str() {
            "unsupportedPushVersion" => PushErrorKind::UnsupportedPushVersion,
            "unsupportedSchemaVersion" => PushErrorKind::UnsupportedSchemaVersion,
            "forClient" => PushErrorKind::ForClient,
            _ => PushErrorKind::Unknown,
        }
    }
}

/// Parsed response from the user's push endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PushResult {
    Err(PushError),
    Ok(PushOk),
}

#[cfg(test)]
mod tests {
    use must_let::must_let;
    use serde_json::json;

    use super::{
        Mutation,
        MutationResult,
        PushErrorKind,
        PushResult,
    };

    #[test]
    fn test_mutation_wire_shape() {
        let mutation: Mutation = serde_json::from_value(json!({
            "type": "custom",
            "clientID": "c1",
            "id": 1,
            "name": "issues/create",
            "args": {"title": "hello"},
            "timestamp": 1234.5,
        }))
        .unwrap();
        assert_eq!(mutation.client_id, "c1");
        let round = serde_json::to_value(&mutation).unwrap();
        assert_eq!(round["type"], "custom");
        assert_eq!(round["clientID"], "c1");
    }

    #[test]
    fn test_push_result_parsing() {
        must_let!(let Ok(PushResult::Ok(ok)) = serde_json::from_value::<PushResult>(json!({
            "mutations": [
                {"id": {"clientID": "c1", "id": 1}, "result": {}},
                {"id": {"clientID": "c1", "id": 2}, "result": {"error": "oooMutation"}},
            ],
        })));
        assert!(ok.mutations[0].result.is_ok());
        assert!(ok.mutations[1].result.is_ooo_mutation());

        must_let!(let Ok(PushResult::Err(err)) = serde_json::from_value::<PushResult>(json!({
            "error": "unsupportedPushVersion",
        })));
        assert_eq!(err.kind(), PushErrorKind::UnsupportedPushVersion);

        must_let!(let Ok(PushResult::Err(err)) = serde_json::from_value::<PushResult>(json!({
            "error": "zeroPusher",
            "message": "exploded",
        })));
        assert_eq!(err.kind(), PushErrorKind::Unknown);
    }
}
