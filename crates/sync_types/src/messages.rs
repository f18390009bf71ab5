use errors::ErrorBody;
use serde::{
    de::DeserializeOwned,
    Deserialize,
    Serialize,
};
use serde_json::{
    json,
    Value as JsonValue,
};

use crate::push::PushBody;

/// Messages sent by the client over the WebSocket.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamMessage {
    InitConnection(InitConnectionBody),
    Ping,
    Push(PushBody),
    ChangeDesiredQueries(ChangeDesiredQueriesBody),
    DeleteClients(DeleteClientsBody),
    Inspect(InspectBody),
}

impl UpstreamMessage {
    /// The wire tag, also used as the `endpoint` metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamMessage::InitConnection(..) => "initConnection",
            UpstreamMessage::Ping => "ping",
            UpstreamMessage::Push(..) => "push",
            UpstreamMessage::ChangeDesiredQueries(..) => "changeDesiredQueries",
            UpstreamMessage::DeleteClients(..) => "deleteClients",
            UpstreamMessage::Inspect(..) => "inspect",
        }
    }
}

/// Messages sent by the server over the WebSocket.
#[derive(Debug, Clone, PartialEq)]
pub enum DownstreamMessage {
    Connected(ConnectedBody),
    Pong,
    PokeStart(PokeStartBody),
    PokePart(PokePartBody),
    PokeEnd(PokeEndBody),
    PushResponse(crate::push::PushOk),
    Error(ErrorBody),
    /// Padding frame sent right after `connected` to warm the connection.
    Warm { payload: String },
}

impl DownstreamMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            DownstreamMessage::Connected(..) => "connected",
            DownstreamMessage::Pong => "pong",
            DownstreamMessage::PokeStart(..) => "pokeStart",
            DownstreamMessage::PokePart(..) => "pokePart",
            DownstreamMessage::PokeEnd(..) => "pokeEnd",
            DownstreamMessage::PushResponse(..) => "pushResponse",
            DownstreamMessage::Error(..) => "error",
            DownstreamMessage::Warm { .. } => "warm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConnectionBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_queries_patch: Option<JsonValue>,
    /// Per-connection override of the configured push endpoint. Must match
    /// the server's URL allow-list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_push_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_push_params: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedBody {
    pub wsid: String,
    /// Milliseconds since the unix epoch on the server clock.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeStartBody {
    pub poke_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_cookie: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_versions: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokePartBody {
    pub poke_id: String,
    /// Opaque to the connection layer; produced by the view-syncer.
    #[serde(flatten)]
    pub part: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeEndBody {
    pub poke_id: String,
    pub cookie: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDesiredQueriesBody {
    pub desired_queries_patch: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteClientsBody {
    pub client_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_group_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectBody {
    pub op: String,
    #[serde(flatten)]
    pub args: JsonValue,
}

fn tuple(kind: &str, body: JsonValue) -> JsonValue {
    json!([kind, body])
}

fn parse_tuple(value: JsonValue) -> anyhow::Result<(String, JsonValue)> {
    let JsonValue::Array(mut parts) = value else {
        anyhow::bail!("Expected a [kind, body] tuple");
    };
    anyhow::ensure!(
        (1..=2).contains(&parts.len()),
        "Expected a [kind, body] tuple, got {} elements",
        parts.len()
    );
    let body = if parts.len() == 2 {
        parts.pop().expect("len checked")
    } else {
        json!({})
    };
    let JsonValue::String(kind) = parts.pop().expect("len checked") else {
        anyhow::bail!("Message kind must be a string");
    };
    Ok((kind, body))
}

fn from_body<T: DeserializeOwned>(kind: &str, body: JsonValue) -> anyhow::Result<T> {
    serde_json::from_value(body).map_err(|e| anyhow::anyhow!("Invalid {kind} body: {e}"))
}

impl TryFrom<JsonValue> for UpstreamMessage {
    type Error = anyhow::Error;

    fn try_from(value: JsonValue) -> anyhow::Result<Self> {
        let (kind, body) = parse_tuple(value)?;
        let message = match kind.as_str() {
            "initConnection" => UpstreamMessage::InitConnection(from_body(&kind, body)?),
            "ping" => UpstreamMessage::Ping,
            "push" => UpstreamMessage::Push(from_body(&kind, body)?),
            "changeDesiredQueries" => {
                UpstreamMessage::ChangeDesiredQueries(from_body(&kind, body)?)
            },
            "deleteClients" => UpstreamMessage::DeleteClients(from_body(&kind, body)?),
            "inspect" => UpstreamMessage::Inspect(from_body(&kind, body)?),
            _ => anyhow::bail!("Unknown message kind {kind:?}"),
        };
        Ok(message)
    }
}

impl From<UpstreamMessage> for JsonValue {
    fn from(message: UpstreamMessage) -> JsonValue {
        match message {
            UpstreamMessage::InitConnection(body) => {
                tuple("initConnection", serde_json::to_value(body).expect("serialize"))
            },
            UpstreamMessage::Ping => tuple("ping", json!({})),
            UpstreamMessage::Push(body) => {
                tuple("push", serde_json::to_value(body).expect("serialize"))
            },
            UpstreamMessage::ChangeDesiredQueries(body) => tuple(
                "changeDesiredQueries",
                serde_json::to_value(body).expect("serialize"),
            ),
            UpstreamMessage::DeleteClients(body) => {
                tuple("deleteClients", serde_json::to_value(body).expect("serialize"))
            },
            UpstreamMessage::Inspect(body) => {
                tuple("inspect", serde_json::to_value(body).expect("serialize"))
            },
        }
    }
}

impl TryFrom<JsonValue> for DownstreamMessage {
    type Error = anyhow::Error;

    fn try_from(value: JsonValue) -> anyhow::Result<Self> {
        let (kind, body) = parse_tuple(value)?;
        let message = match kind.as_str() {
            "connected" => DownstreamMessage::Connected(from_body(&kind, body)?),
            "pong" => DownstreamMessage::Pong,
            "pokeStart" => DownstreamMessage::PokeStart(from_body(&kind, body)?),
            "pokePart" => DownstreamMessage::PokePart(from_body(&kind, body)?),
            "pokeEnd" => DownstreamMessage::PokeEnd(from_body(&kind, body)?),
            "pushResponse" => DownstreamMessage::PushResponse(from_body(&kind, body)?),
            "error" => DownstreamMessage::Error(from_body(&kind, body)?),
            "warm" => {
                let payload = body
                    .get("payload")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_owned();
                DownstreamMessage::Warm { payload }
            },
            _ => anyhow::bail!("Unknown message kind {kind:?}"),
        };
        Ok(message)
    }
}

impl From<DownstreamMessage> for JsonValue {
    fn from(message: DownstreamMessage) -> JsonValue {
        match message {
            DownstreamMessage::Connected(body) => {
                tuple("connected", serde_json::to_value(body).expect("serialize"))
            },
            DownstreamMessage::Pong => tuple("pong", json!({})),
            DownstreamMessage::PokeStart(body) => {
                tuple("pokeStart", serde_json::to_value(body).expect("serialize"))
            },
            DownstreamMessage::PokePart(body) => {
                tuple("pokePart", serde_json::to_value(body).expect("serialize"))
            },
            DownstreamMessage::PokeEnd(body) => {
                tuple("pokeEnd", serde_json::to_value(body).expect("serialize"))
            },
            DownstreamMessage::PushResponse(body) => {
                tuple("pushResponse", serde_json::to_value(body).expect("serialize"))
            },
            DownstreamMessage::Error(body) => {
                tuple("error", serde_json::to_value(body).expect("serialize"))
            },
            DownstreamMessage::Warm { payload } => tuple("warm", json!({ "payload": payload })),
        }
    }
}
