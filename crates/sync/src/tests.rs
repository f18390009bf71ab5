use std::{
    collections::VecDeque,
    sync::Arc,
};

use async_trait::async_trait;
use common::{
    runtime::testing::TestRuntime,
    url_pattern::UrlAllowList,
};
use errors::{
    ErrorBodyAnyhowExt,
    ErrorKind,
};
use futures::stream::BoxStream;
use must_let::must_let;
use parking_lot::Mutex;
use serde_json::json;
use sync_types::{
    ChangeDesiredQueriesBody,
    ConnectParams,
    DeleteClientsBody,
    DownstreamMessage,
    InitConnectionBody,
    Mutation,
    PushBody,
    UpstreamMessage,
    PROTOCOL_VERSION,
    PUSH_VERSION,
};
use tokio::sync::{
    mpsc,
    oneshot,
};

use crate::{
    auth::AuthSession,
    connection::{
        Connection,
        ViewSyncer,
    },
    fetch::{
        FetchClient,
        HttpRequest,
        HttpResponse,
    },
    inspector::InspectorRegistry,
    pusher::{
        PusherConfig,
        PusherEvent,
        PusherService,
    },
};

struct ScriptedCall {
    /// When present, the call blocks until the test releases it.
    gate: Option<oneshot::Receiver<()>>,
    response: anyhow::Result<HttpResponse>,
}

struct MockFetch {
    calls: Mutex<Vec<HttpRequest>>,
    script: tokio::sync::Mutex<VecDeque<ScriptedCall>>,
}

impl MockFetch {
    fn new(script: Vec<ScriptedCall>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            script: tokio::sync::Mutex::new(script.into()),
        })
    }

    fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl FetchClient for MockFetch {
    async fn post_json(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        self.calls.lock().push(request);
        let call = self
            .script
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("Unscripted HTTP call"))?;
        if let Some(gate) = call.gate {
            let _ = gate.await;
        }
        call.response
    }
}

fn ok_response(body: serde_json::Value) -> anyhow::Result<HttpResponse> {
    Ok(HttpResponse {
        status: 200,
        body: body.to_string(),
    })
}

fn config() -> PusherConfig {
    PusherConfig {
        push_url: "https://api.example.com/push".to_owned(),
        api_key: Some("key-1".to_owned()),
        app_id: "app-1".to_owned(),
        upstream_schema: "zero_0".to_owned(),
        forward_cookies: false,
        allowed_push_urls: UrlAllowList::parse(["https://alt.example.com/push"]).unwrap(),
    }
}

fn mutation(client_id: &str, id: u64) -> Mutation {
    Mutation {
        client_id: client_id.to_owned(),
        id,
        name: "issues/create".to_owned(),
        args: json!({"n": id}),
        timestamp: 1000.0 + id as f64,
    }
}

fn push(client_group_id: &str, mutations: Vec<Mutation>) -> PushBody {
    PushBody {
        client_group_id: client_group_id.to_owned(),
        mutations,
        push_version: PUSH_VERSION,
        schema_version: Some("7".to_owned()),
        timestamp: 1000.0,
        request_id: "req-1".to_owned(),
    }
}

fn result_entry(client_id: &str, id: u64, result: serde_json::Value) -> serde_json::Value {
    json!({"id": {"clientID": client_id, "id": id}, "result": result})
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_pusher_combines_while_call_in_flight() {
    let rt = TestRuntime::new();
    let (gate_tx, gate_rx) = oneshot::channel();
    let fetch = MockFetch::new(vec![
        ScriptedCall {
            gate: Some(gate_rx),
            response: ok_response(json!({
                "mutations": [result_entry("c1", 1, json!({}))],
            })),
        },
        ScriptedCall {
            gate: None,
            response: ok_response(json!({
                "mutations": [
                    result_entry("c1", 2, json!({})),
                    result_entry("c1", 3, json!({})),
                    result_entry("c1", 4, json!({})),
                    result_entry("c2", 1, json!({})),
                ],
            })),
        },
    ]);
    let pusher = PusherService::new(rt, config(), fetch.clone());
    pusher.add_ref();
    let mut c1_rx = pusher.subscribe("c1");
    let mut c2_rx = pusher.subscribe("c2");

    pusher.enqueue(push("g1", vec![mutation("c1", 1)]), None, None, None);
    settle().await;
    // First call is in flight; everything below must combine into one more.
    pusher.enqueue(push("g1", vec![mutation("c1", 2)]), None, None, None);
    pusher.enqueue(push("g1", vec![mutation("c1", 3)]), None, None, None);
    pusher.enqueue(push("g1", vec![mutation("c1", 4)]), None, None, None);
    pusher.enqueue(push("g1", vec![mutation("c2", 1)]), None, None, None);
    settle().await;
    gate_tx.send(()).unwrap();
    settle().await;

    let calls = fetch.calls();
    assert_eq!(calls.len(), 2);
    let second: PushBody = serde_json::from_value(calls[1].body.clone()).unwrap();
    assert_eq!(second.mutations.len(), 4);
    // Per-client order preserved: c1's three mutations, then c2's one.
    let ids: Vec<_> = second
        .mutations
        .iter()
        .map(|m| (m.client_id.as_str(), m.id))
        .collect();
    assert_eq!(ids, vec![("c1", 2), ("c1", 3), ("c1", 4), ("c2", 1)]);
    // Reserved query parameters on the URL.
    assert!(calls[1].url.contains("schema=zero_0"));
    assert!(calls[1].url.contains("appID=app-1"));

    must_let!(let Ok(PusherEvent::Response(first)) = c1_rx.try_recv());
    assert_eq!(first.mutations.len(), 1);
    must_let!(let Ok(PusherEvent::Response(combined)) = c1_rx.try_recv());
    assert_eq!(combined.mutations.len(), 3);
    must_let!(let Ok(PusherEvent::Response(other)) = c2_rx.try_recv());
    assert_eq!(other.mutations.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pusher_out_of_order_mutation_response() {
    let rt = TestRuntime::new();
    let fetch = MockFetch::new(vec![ScriptedCall {
        gate: None,
        response: ok_response(json!({
            "mutations": [
                result_entry("c1", 1, json!({})),
                result_entry("c1", 2, json!({"error": "oooMutation"})),
                result_entry("c1", 3, json!({})),
            ],
        })),
    }]);
    let pusher = PusherService::new(rt, config(), fetch.clone());
    pusher.add_ref();
    let mut c1_rx = pusher.subscribe("c1");

    pusher.enqueue(
        push(
            "g1",
            vec![mutation("c1", 1), mutation("c1", 2), mutation("c1", 3)],
        ),
        None,
        None,
        None,
    );
    settle().await;

    // Only the successful prefix is streamed, then the client is failed.
    must_let!(let Ok(PusherEvent::Response(prefix)) = c1_rx.try_recv());
    assert_eq!(prefix.mutations.len(), 1);
    assert_eq!(prefix.mutations[0].id.id, 1);
    must_let!(let Ok(PusherEvent::Fatal(body)) = c1_rx.try_recv());
    assert_eq!(body.kind, ErrorKind::InvalidPush);
    assert_eq!(body.message, "mutation was out of order");
    assert!(c1_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_pusher_401_invalidates_auth() {
    let rt = TestRuntime::new();
    let fetch = MockFetch::new(vec![ScriptedCall {
        gate: None,
        response: Ok(HttpResponse {
            status: 401,
            body: "unauthorized".to_owned(),
        }),
    }]);
    let pusher = PusherService::new(rt, config(), fetch.clone());
    pusher.add_ref();
    let mut c1_rx = pusher.subscribe("c1");

    pusher.enqueue(
        push("g1", vec![mutation("c1", 1)]),
        Some("jwt-1".to_owned()),
        None,
        None,
    );
    settle().await;

    must_let!(let Ok(PusherEvent::Fatal(body)) = c1_rx.try_recv());
    assert_eq!(body.kind, ErrorKind::AuthInvalidated);
    // The rejected call carried the bearer token.
    let headers = &fetch.calls()[0].headers;
    assert!(headers
        .iter()
        .any(|(name, value)| name == "Authorization" && value == "Bearer jwt-1"));
}

#[tokio::test(start_paused = true)]
async fn test_pusher_5xx_is_not_fatal() {
    let rt = TestRuntime::new();
    let fetch = MockFetch::new(vec![ScriptedCall {
        gate: None,
        response: Ok(HttpResponse {
            status: 503,
            body: "overloaded".to_owned(),
        }),
    }]);
    let pusher = PusherService::new(rt, config(), fetch.clone());
    pusher.add_ref();
    let mut c1_rx = pusher.subscribe("c1");

    pusher.enqueue(push("g1", vec![mutation("c1", 1)]), None, None, None);
    settle().await;

    must_let!(let Ok(PusherEvent::Error(body)) = c1_rx.try_recv());
    assert_eq!(body.kind, ErrorKind::PushFailed);
    assert!(c1_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_pusher_custom_url_allow_list() {
    let rt = TestRuntime::new();
    let fetch = MockFetch::new(vec![ScriptedCall {
        gate: None,
        response: ok_response(json!({"mutations": []})),
    }]);
    let pusher = PusherService::new(rt, config(), fetch.clone());
    pusher.add_ref();
    let mut c1_rx = pusher.subscribe("c1");

    // Disallowed URL fails the mutations without any HTTP call.
    pusher.enqueue(
        push("g1", vec![mutation("c1", 1)]),
        None,
        None,
        Some("https://evil.example.com/push"),
    );
    settle().await;
    must_let!(let Ok(PusherEvent::Error(body)) = c1_rx.try_recv());
    assert_eq!(body.kind, ErrorKind::PushFailed);
    assert!(fetch.calls().is_empty());

    // Allowed URL goes through.
    pusher.enqueue(
        push("g1", vec![mutation("c1", 2)]),
        None,
        None,
        Some("https://alt.example.com/push"),
    );
    settle().await;
    assert_eq!(fetch.calls().len(), 1);
    assert!(fetch.calls()[0].url.starts_with("https://alt.example.com/push"));
}

#[tokio::test(start_paused = true)]
async fn test_transformer_success_and_infra_failure() {
    use sync_types::{
        TransformRequestEntry,
        TransformResponse,
        TransformedEntry,
    };

    use crate::transformer::{
        QueryTransformer,
        TransformerConfig,
    };

    let transformer_config = TransformerConfig {
        get_queries_url: "https://api.example.com/get-queries".to_owned(),
        api_key: None,
        app_id: "app-1".to_owned(),
        upstream_schema: "zero_0".to_owned(),
    };
    let entries = vec![TransformRequestEntry {
        id: "q1".to_owned(),
        name: "issues".to_owned(),
        args: json!([]),
    }];

    let fetch = MockFetch::new(vec![ScriptedCall {
        gate: None,
        response: ok_response(json!(["transformed", [
            {"id": "q1", "name": "issues", "ast": {"table": "issue"}},
        ]])),
    }]);
    let transformer = QueryTransformer::new(transformer_config.clone(), fetch.clone());
    must_let!(let Ok(Ok(TransformResponse::Transformed(transformed))) =
        transformer.transform(Some("jwt-1"), None, entries.clone()).await);
    must_let!(let TransformedEntry::Transformed { id, .. } = &transformed[0]);
    assert_eq!(id, "q1");
    // The request body is the ["transform", entries] tuple.
    let sent = &fetch.calls()[0];
    assert_eq!(sent.body[0], "transform");
    assert_eq!(sent.body[1][0]["id"], "q1");

    // The endpoint reporting its own failure passes the body through.
    let fetch = MockFetch::new(vec![ScriptedCall {
        gate: None,
        response: ok_response(json!(["transformFailed", {
            "kind": "TransformFailed",
            "message": "get-queries crashed",
            "origin": "server",
        }])),
    }]);
    let transformer = QueryTransformer::new(transformer_config.clone(), fetch);
    must_let!(let Ok(Ok(TransformResponse::TransformFailed(body))) =
        transformer.transform(None, None, entries.clone()).await);
    assert_eq!(body.kind, ErrorKind::TransformFailed);

    // Infrastructure failure maps to a zero-cache TransformFailed.
    let fetch = MockFetch::new(vec![ScriptedCall {
        gate: None,
        response: Ok(HttpResponse {
            status: 502,
            body: "bad gateway".to_owned(),
        }),
    }]);
    let transformer = QueryTransformer::new(transformer_config, fetch);
    must_let!(let Ok(Err(body)) = transformer.transform(None, None, entries).await);
    assert_eq!(body.kind, ErrorKind::TransformFailed);
}

struct StubViewSyncer {
    desired_query_changes: Mutex<Vec<ChangeDesiredQueriesBody>>,
    deleted_clients: Mutex<Vec<DeleteClientsBody>>,
}

impl StubViewSyncer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            desired_query_changes: Mutex::new(Vec::new()),
            deleted_clients: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ViewSyncer for StubViewSyncer {
    async fn init_connection(
        &self,
        _params: &ConnectParams,
        _body: InitConnectionBody,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<DownstreamMessage>>> {
        Ok(Box::pin(futures::stream::pending()))
    }

    async fn change_desired_queries(
        &self,
        _params: &ConnectParams,
        body: ChangeDesiredQueriesBody,
    ) -> anyhow::Result<()> {
        self.desired_query_changes.lock().push(body);
        Ok(())
    }

    async fn delete_clients(
        &self,
        _params: &ConnectParams,
        body: DeleteClientsBody,
    ) -> anyhow::Result<()> {
        self.deleted_clients.lock().push(body);
        Ok(())
    }
}

struct ConnectionTest {
    client_tx: mpsc::UnboundedSender<(UpstreamMessage, tokio::time::Instant)>,
    server_rx: mpsc::UnboundedReceiver<(DownstreamMessage, tokio::time::Instant)>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl ConnectionTest {
    fn new(protocol_version: u32, fetch: Arc<MockFetch>, auth_token: Option<&str>) -> Self {
        let rt = TestRuntime::new();
        let params = ConnectParams::parse(
            protocol_version,
            [
                ("clientID", "c1"),
                ("clientGroupID", "g1"),
                ("ts", "1722556800000"),
                ("lmid", "0"),
                ("wsid", "ws-1"),
                ("userID", "u1"),
            ],
        )
        .unwrap();
        let pusher = PusherService::new(rt.clone(), config(), fetch);
        let auth = Arc::new(tokio::sync::Mutex::new(AuthSession::new(None)));
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let mut connection = Connection::new(
            rt,
            params,
            auth,
            pusher,
            StubViewSyncer::new(),
            InspectorRegistry::init(),
            Some(InitConnectionBody {
                desired_queries_patch: None,
                user_push_url: None,
                user_push_params: None,
            }),
            auth_token.map(str::to_owned),
            None,
            client_rx,
            server_tx,
        );
        let handle = tokio::spawn(async move { connection.go().await });
        Self {
            client_tx,
            server_rx,
            handle,
        }
    }

    fn send(&self, message: UpstreamMessage) {
        self.client_tx
            .send((message, tokio::time::Instant::now()))
            .unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_connection_handshake_and_ping() {
    let fetch = MockFetch::new(vec![]);
    let mut t = ConnectionTest::new(PROTOCOL_VERSION, fetch, Some("tok-1"));
    settle().await;

    must_let!(let Ok((DownstreamMessage::Connected(connected), _)) = t.server_rx.try_recv());
    assert_eq!(connected.wsid, "ws-1");

    t.send(UpstreamMessage::Ping);
    settle().await;
    must_let!(let Ok((DownstreamMessage::Pong, _)) = t.server_rx.try_recv());

    drop(t.client_tx);
    settle().await;
    must_let!(let Ok(Ok(())) = t.handle.await);
}

#[tokio::test(start_paused = true)]
async fn test_connection_rejects_old_protocol() {
    let fetch = MockFetch::new(vec![]);
    let mut t = ConnectionTest::new(1, fetch, None);
    settle().await;

    assert!(t.server_rx.try_recv().is_err());
    must_let!(let Ok(Err(e)) = t.handle.await);
    assert_eq!(e.wire_error_body().kind, ErrorKind::VersionNotSupported);
}

#[tokio::test(start_paused = true)]
async fn test_connection_push_group_mismatch() {
    let fetch = MockFetch::new(vec![]);
    let mut t = ConnectionTest::new(PROTOCOL_VERSION, fetch.clone(), None);
    settle().await;
    must_let!(let Ok((DownstreamMessage::Connected(..), _)) = t.server_rx.try_recv());

    t.send(UpstreamMessage::Push(push("other-group", vec![mutation("c1", 1)])));
    settle().await;
    must_let!(let Ok((DownstreamMessage::Error(body), _)) = t.server_rx.try_recv());
    assert_eq!(body.kind, ErrorKind::InvalidPush);
    assert!(fetch.calls().is_empty());
    // The connection survives a bad push.
    t.send(UpstreamMessage::Ping);
    settle().await;
    must_let!(let Ok((DownstreamMessage::Pong, _)) = t.server_rx.try_recv());
}

#[tokio::test(start_paused = true)]
async fn test_connection_terminates_on_push_401() {
    let fetch = MockFetch::new(vec![ScriptedCall {
        gate: None,
        response: Ok(HttpResponse {
            status: 401,
            body: "unauthorized".to_owned(),
        }),
    }]);
    let mut t = ConnectionTest::new(PROTOCOL_VERSION, fetch, Some("tok-1"));
    settle().await;
    must_let!(let Ok((DownstreamMessage::Connected(..), _)) = t.server_rx.try_recv());

    t.send(UpstreamMessage::Push(push("g1", vec![mutation("c1", 1)])));
    settle().await;

    must_let!(let Ok((DownstreamMessage::Error(body), _)) = t.server_rx.try_recv());
    assert_eq!(body.kind, ErrorKind::AuthInvalidated);
    must_let!(let Ok(Err(e)) = t.handle.await);
    assert_eq!(e.wire_error_body().kind, ErrorKind::AuthInvalidated);
}
