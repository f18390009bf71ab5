//! The syncer worker: adopts sockets handed off by the dispatcher,
//! completes their WebSocket upgrades, and runs one `Connection` per
//! socket.
//!
//! Each socket runs three cooperating futures: a receive loop parsing
//! client frames, a send loop with heartbeat pings and a client timeout,
//! and the connection state machine. The first to fail tears the socket
//! down with a final error message and a close frame derived from the
//! error's wire body.

use std::sync::Arc;

use common::{
    errors::report_error,
    knobs::{
        SYNC_CLIENT_TIMEOUT,
        SYNC_HEARTBEAT_INTERVAL,
    },
    runtime::prod::ProdRuntime,
    ws::is_connection_closed_error,
};
use dispatcher::{
    handoff::recv_handoff,
    supervisor::inherited_handoff_channels,
    HandoffFrame,
    SerializedRequest,
};
use errors::{
    ErrorBody,
    ErrorBodyAnyhowExt,
    ProtocolError,
};
use futures::{
    try_join,
    SinkExt,
    StreamExt,
};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use sync::{
    Connection,
    FetchClient,
    InspectorRegistry,
    ReqwestFetchClient,
};
use sync_types::{
    decode_init_connection_header,
    ConnectParams,
    DownstreamMessage,
    InitConnectionHeader,
    UpstreamMessage,
};
use tokio::{
    net::TcpStream,
    signal::unix::{
        signal,
        SignalKind,
    },
    sync::mpsc,
    task::JoinSet,
    time::Instant,
};
use tokio_tungstenite::WebSocketStream;
use tungstenite::protocol::{
    Message,
    Role,
};

use crate::{
    client_groups::ClientGroups,
    config::ZeroConfig,
    view_syncer::BaselineViewSyncer,
    ws_util,
};

pub async fn run(config: ZeroConfig, index: usize) -> anyhow::Result<()> {
    let mut channels = inherited_handoff_channels()?;
    let mut channel = channels
        .remove(&0)
        .ok_or_else(|| anyhow::anyhow!("Syncer {index} inherited no dispatcher channel"))?;

    let rt = ProdRuntime::new();
    let fetch: Arc<dyn FetchClient> = Arc::new(ReqwestFetchClient::new()?);
    let groups = ClientGroups::new(rt.clone(), config.pusher_config(), fetch.clone(), None);
    let view_syncer = BaselineViewSyncer::new(&config, fetch);
    let inspector = InspectorRegistry::init();

    let (handoff_tx, mut handoff_rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || loop {
        match recv_handoff(&mut channel) {
            Ok(handoff) => {
                if handoff_tx.send(handoff).is_err() {
                    break;
                }
            },
            Err(e) => {
                tracing::info!("Handoff channel closed: {e:#}");
                break;
            },
        }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sockets = JoinSet::new();
    tracing::info!("Syncer {index} ready");
    loop {
        tokio::select! {
            handoff = handoff_rx.recv() => {
                let Some((fd, frame)) = handoff else { break };
                let rt = rt.clone();
                let groups = groups.clone();
                let view_syncer = view_syncer.clone();
                let inspector = inspector.clone();
                sockets.spawn(async move {
                    if let Err(mut e) =
                        serve_socket(rt, groups, view_syncer, inspector, fd, frame).await
                    {
                        report_error(&mut e);
                    }
                });
                while sockets.try_join_next().is_some() {}
            },
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
        }
    }
    // Drain: no new handoffs are read; in-flight connections finish.
    drop(handoff_rx);
    tracing::info!("Syncer {index} draining {} connections", sockets.len());
    while sockets.join_next().await.is_some() {}
    Ok(())
}

async fn serve_socket(
    rt: ProdRuntime,
    groups: Arc<ClientGroups>,
    view_syncer: Arc<BaselineViewSyncer>,
    inspector: Arc<InspectorRegistry>,
    fd: std::os::fd::OwnedFd,
    frame: HandoffFrame,
) -> anyhow::Result<()> {
    let std_stream = std::net::TcpStream::from(fd);
    std_stream.set_nonblocking(true)?;
    let mut stream = TcpStream::from_std(std_stream)?;

    let (params, init_header) = match parse_upgrade(&frame.message) {
        Ok(parsed) => parsed,
        Err(e) => {
            // Protocol-level problem on the upgrade path: finish the
            // handshake, then close 1002 with the clamped reason.
            ws_util::write_upgrade_response(&mut stream, &frame.message).await?;
            let reason = e.wire_error_body().message;
            ws_util::write_close(&mut stream, 1002, &reason).await?;
            return Err(e);
        },
    };
    ws_util::write_upgrade_response(&mut stream, &frame.message).await?;
    let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;

    let cookie_header = ws_util::header(&frame.message, "cookie").map(str::to_owned);
    let (auth, pusher) = groups.acquire(&params.client_group_id);
    let client_group_id = params.client_group_id.clone();
    let result = run_sync_socket(
        rt,
        ws,
        params,
        init_header,
        auth,
        pusher,
        view_syncer,
        inspector,
        cookie_header,
    )
    .await;
    groups.release(&client_group_id);
    result
}

fn parse_upgrade(
    request: &SerializedRequest,
) -> anyhow::Result<(ConnectParams, InitConnectionHeader)> {
    let url = url::Url::parse(&format!("http://localhost{}", request.uri)).map_err(|e| {
        ProtocolError::new(ErrorBody::new(
            errors::ErrorKind::InvalidConnectionRequest,
            format!("Unparseable connect URL: {e}"),
        ))
    })?;
    let segments: Vec<&str> = url.path().trim_matches('/').split('/').collect();
    let protocol_version = match segments.as_slice() {
        ["sync", version, "connect"] => version
            .strip_prefix('v')
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| {
                ProtocolError::new(ErrorBody::new(
                    errors::ErrorKind::InvalidConnectionRequest,
                    format!("Unparseable protocol version {version:?}"),
                ))
            })?,
        _ => {
            anyhow::bail!(ProtocolError::new(ErrorBody::new(
                errors::ErrorKind::InvalidConnectionRequest,
                format!("Unexpected connect path {:?}", url.path()),
            )))
        },
    };
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let params = ConnectParams::parse(
        protocol_version,
        pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
    )
    .map_err(|e| {
        ProtocolError::new(ErrorBody::new(
            errors::ErrorKind::InvalidConnectionRequest,
            format!("{e:#}"),
        ))
    })?;
    let init_header = match ws_util::header(request, "sec-websocket-protocol") {
        Some(value) => decode_init_connection_header(value).map_err(|e| {
            ProtocolError::new(ErrorBody::invalid_message(format!(
                "Invalid Sec-WebSocket-Protocol payload: {e:#}"
            )))
        })?,
        None => InitConnectionHeader::default(),
    };
    Ok((params, init_header))
}

/// The WebSocket layer runs three cooperating futures: `receive_messages`
/// parsing client frames, `send_messages` writing server frames and
/// heartbeats, and the connection state machine. Any of them failing tears
/// down the socket; clean exit of all three closes it gracefully.
async fn run_sync_socket(
    rt: ProdRuntime,
    ws: WebSocketStream<TcpStream>,
    params: ConnectParams,
    init_header: InitConnectionHeader,
    auth: Arc<tokio::sync::Mutex<sync::AuthSession>>,
    pusher: sync::PusherService<ProdRuntime>,
    view_syncer: Arc<BaselineViewSyncer>,
    inspector: Arc<InspectorRegistry>,
    cookie_header: Option<String>,
) -> anyhow::Result<()> {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let last_received = Mutex::new(Instant::now());
    let last_ping_sent = Mutex::new(Instant::now());

    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let receive_messages = async {
        while let Some(message) = ws_rx.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) if is_connection_closed_error(&e) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            *last_received.lock() = Instant::now();
            match message {
                Message::Text(text) => {
                    let parsed: UpstreamMessage = serde_json::from_str::<JsonValue>(text.as_str())
                        .map_err(anyhow::Error::from)
                        .and_then(UpstreamMessage::try_from)
                        .map_err(|e| {
                            ProtocolError::new(ErrorBody::invalid_message(format!(
                                "Invalid message on websocket: {e:#}"
                            )))
                        })?;
                    if client_tx.send((parsed, Instant::now())).is_err() {
                        break;
                    }
                },
                Message::Pong(..) => {
                    tracing::trace!("pong after {:?}", last_ping_sent.lock().elapsed());
                    continue;
                },
                // The library answers pings internally.
                Message::Ping(..) => continue,
                Message::Close(..) => break,
                _ => {
                    anyhow::bail!(ProtocolError::new(ErrorBody::invalid_message(
                        "Unexpected binary frame",
                    )))
                },
            }
        }
        drop(client_tx);
        Ok(())
    };

    let (server_tx, mut server_rx) = mpsc::unbounded_channel::<(DownstreamMessage, Instant)>();
    let send_messages = async {
        let mut ping_ticker = tokio::time::interval(*SYNC_HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = ping_ticker.tick() => {
                    let idle = last_received.lock().elapsed();
                    if idle > *SYNC_CLIENT_TIMEOUT {
                        anyhow::bail!("Client timed out after {idle:?} without traffic");
                    }
                    *last_ping_sent.lock() = Instant::now();
                    if ws_tx.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                },
                maybe_message = server_rx.recv() => {
                    let Some((message, _queued)) = maybe_message else { break };
                    let serialized = serde_json::to_string(&JsonValue::from(message))?;
                    if ws_tx.send(Message::text(serialized)).await.is_err() {
                        break;
                    }
                },
            }
        }
        Ok(())
    };

    let connection_go = async {
        let mut connection = Connection::new(
            rt,
            params,
            auth,
            pusher,
            view_syncer,
            inspector,
            init_header.init_connection,
            init_header.auth_token,
            cookie_header,
            client_rx,
            server_tx,
        );
        connection.go().await
    };

    let result = try_join!(receive_messages, send_messages, connection_go);
    let mut socket = ws_tx.reunite(ws_rx).expect("Mixed up WebSocket halves?");
    match result {
        Ok(..) => {
            let _ = socket.close(None).await;
            Ok(())
        },
        Err(e) => {
            // Best-effort final error message, then a close frame derived
            // from the error's wire body.
            let final_message = DownstreamMessage::Error(e.wire_error_body());
            let serialized = serde_json::to_string(&JsonValue::from(final_message))?;
            let _ = socket.send(Message::text(serialized)).await;
            let _ = socket.close(Some(e.close_frame())).await;
            Err(e)
        },
    }
}
