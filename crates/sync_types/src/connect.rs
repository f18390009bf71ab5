use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::messages::InitConnectionBody;

/// Parameters of the WebSocket connect URL, plus the protocol version from
/// the request path.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    pub protocol_version: u32,
    pub client_id: String,
    pub client_group_id: String,
    /// Client wall-clock at connect time, for skew metrics.
    pub ts: u64,
    /// The client's last acked mutation id.
    pub lmid: u64,
    pub schema_version: Option<String>,
    pub base_cookie: Option<String>,
    pub wsid: String,
    pub user_id: Option<String>,
    pub debug_perf: bool,
}

impl ConnectParams {
    /// Parse the query pairs of a connect URL. Missing or malformed required
    /// parameters reject the connection before upgrade.
    pub fn parse<'a>(
        protocol_version: u32,
        query_pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> anyhow::Result<Self> {
        let params: BTreeMap<&str, &str> = query_pairs.into_iter().collect();
        let required = |name: &str| -> anyhow::Result<&str> {
            params
                .get(name)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("Missing required parameter {name}"))
        };
        let integer = |name: &str| -> anyhow::Result<u64> {
            required(name)?
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid integer parameter {name}: {e}"))
        };
        Ok(Self {
            protocol_version,
            client_id: required("clientID")?.to_owned(),
            client_group_id: required("clientGroupID")?.to_owned(),
            ts: integer("ts")?,
            lmid: integer("lmid")?,
            schema_version: params.get("schemaVersion").map(|s| (*s).to_owned()),
            base_cookie: params.get("baseCookie").map(|s| (*s).to_owned()),
            wsid: params.get("wsid").copied().unwrap_or_default().to_owned(),
            user_id: params.get("userID").map(|s| (*s).to_owned()),
            debug_perf: params.get("debugPerf").copied() == Some("true"),
        })
    }
}

/// The `Sec-WebSocket-Protocol` header carries a packed `initConnection`
/// message and an optional auth token, each base64url-encoded, as a
/// comma-separated list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitConnectionHeader {
    pub init_connection: Option<InitConnectionBody>,
    pub auth_token: Option<String>,
}

pub fn decode_init_connection_header(header: &str) -> anyhow::Result<InitConnectionHeader> {
    let mut segments = header.split(',').map(str::trim);
    let mut decoded = InitConnectionHeader::default();
    if let Some(first) = segments.next().filter(|s| !s.is_empty()) {
        let bytes = base64::decode_config(first, base64::URL_SAFE_NO_PAD)
            .map_err(|e| anyhow::anyhow!("Invalid initConnection encoding: {e}"))?;
        let value: JsonValue = serde_json::from_slice(&bytes)
            .map_err(|e| anyhow::anyhow!("Invalid initConnection payload: {e}"))?;
        // Accept either the bare body or the full ["initConnection", body]
        // tuple, which older clients send.
        let body = match crate::UpstreamMessage::try_from(value.clone()) {
            Ok(crate::UpstreamMessage::InitConnection(body)) => body,
            _ => serde_json::from_value(value)
                .map_err(|e| anyhow::anyhow!("Invalid initConnection payload: {e}"))?,
        };
        decoded.init_connection = Some(body);
    }
    if let Some(second) = segments.next().filter(|s| !s.is_empty()) {
        let bytes = base64::decode_config(second, base64::URL_SAFE_NO_PAD)
            .map_err(|e| anyhow::anyhow!("Invalid auth token encoding: {e}"))?;
        decoded.auth_token = Some(
            String::from_utf8(bytes)
                .map_err(|e| anyhow::anyhow!("Auth token is not UTF-8: {e}"))?,
        );
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        decode_init_connection_header,
        ConnectParams,
    };

    #[test]
    fn test_parse_connect_params() {
        let params = ConnectParams::parse(
            21,
            [
                ("clientID", "c1"),
                ("clientGroupID", "g1"),
                ("ts", "1722556800000"),
                ("lmid", "42"),
                ("wsid", "ws-7"),
                ("userID", "u1"),
                ("debugPerf", "true"),
            ],
        )
        .unwrap();
        assert_eq!(params.client_id, "c1");
        assert_eq!(params.lmid, 42);
        assert!(params.debug_perf);
        assert_eq!(params.schema_version, None);

        assert!(ConnectParams::parse(21, [("clientID", "c1")]).is_err());
        assert!(ConnectParams::parse(
            21,
            [
                ("clientID", "c1"),
                ("clientGroupID", "g1"),
                ("ts", "soon"),
                ("lmid", "42"),
            ],
        )
        .is_err());
    }

    #[test]
    fn test_decode_init_connection_header() {
        let body = json!({"userPushURL": "https://api.example.com/push"});
        let packed = base64::encode_config(
            serde_json::to_vec(&body).unwrap(),
            base64::URL_SAFE_NO_PAD,
        );
        let token = base64::encode_config("tok-1", base64::URL_SAFE_NO_PAD);
        let header = format!("{packed}, {token}");
        let decoded = decode_init_connection_header(&header).unwrap();
        assert_eq!(
            decoded.init_connection.unwrap().user_push_url.as_deref(),
            Some("https://api.example.com/push")
        );
        assert_eq!(decoded.auth_token.as_deref(), Some("tok-1"));

        assert_eq!(decode_init_connection_header("").unwrap(), Default::default());
    }
}
