//! Per-WebSocket connection state machine inside a syncer worker.
//!
//! The socket itself (upgrade, frame parsing, heartbeats) lives in the
//! server crate; a `Connection` consumes parsed upstream messages from a
//! channel and produces downstream messages on another, so the protocol
//! logic runs identically under tests and under a live socket.

use std::sync::Arc;

use async_trait::async_trait;
use common::{
    knobs::{
        ZERO_WARM_FRAMES,
        ZERO_WARM_FRAME_BYTES,
        ZERO_WARM_FRAME_COUNT,
    },
    runtime::Runtime,
};
use errors::{
    ErrorBody,
    ProtocolError,
};
use futures::{
    stream::BoxStream,
    StreamExt,
};
use metrics::StatusTimer;
use rand::RngCore;
use sync_types::{
    ChangeDesiredQueriesBody,
    ConnectParams,
    ConnectedBody,
    DeleteClientsBody,
    DownstreamMessage,
    InitConnectionBody,
    InspectBody,
    PushBody,
    UpstreamMessage,
    MIN_SERVER_SUPPORTED_PROTOCOL_VERSION,
    PROTOCOL_VERSION,
};
use tokio::{
    sync::mpsc,
    time::Instant,
};

use crate::{
    auth::AuthSession,
    inspector::InspectorRegistry,
    metrics::{
        connect_timer,
        handle_message_timer,
    },
    pusher::{
        PusherEvent,
        PusherService,
    },
};

/// The poke-producing side of the worker. Its internals (IVM pipelines,
/// hydration) are outside this crate; connections only forward to it.
#[async_trait]
pub trait ViewSyncer: Send + Sync + 'static {
    /// Register the client and return its poke stream. The stream ends when
    /// the view-syncer retires the client, which closes the connection.
    async fn init_connection(
        &self,
        params: &ConnectParams,
        body: InitConnectionBody,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<DownstreamMessage>>>;

    async fn change_desired_queries(
        &self,
        params: &ConnectParams,
        body: ChangeDesiredQueriesBody,
    ) -> anyhow::Result<()>;

    async fn delete_clients(
        &self,
        params: &ConnectParams,
        body: DeleteClientsBody,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    AwaitingInit,
    Active,
    Closing,
    Closed,
}

enum Event {
    Client(Option<(UpstreamMessage, Instant)>),
    Pusher(Option<PusherEvent>),
    Poke(Option<anyhow::Result<DownstreamMessage>>),
}

pub struct Connection<RT: Runtime> {
    rt: RT,
    params: ConnectParams,
    state: ConnectionState,
    auth: Arc<tokio::sync::Mutex<AuthSession>>,
    pusher: PusherService<RT>,
    view_syncer: Arc<dyn ViewSyncer>,
    inspector: Arc<InspectorRegistry>,

    /// initConnection packed into the websocket subprotocol header, if the
    /// client sent one there instead of as a first message.
    header_init: Option<InitConnectionBody>,
    auth_token: Option<String>,
    cookie_header: Option<String>,
    user_push_url: Option<String>,

    rx: mpsc::UnboundedReceiver<(UpstreamMessage, Instant)>,
    tx: mpsc::UnboundedSender<(DownstreamMessage, Instant)>,
    pusher_events: mpsc::UnboundedReceiver<PusherEvent>,
    poke_stream: Option<BoxStream<'static, anyhow::Result<DownstreamMessage>>>,

    /// Serializes mutation dispatch per socket.
    mutation_lock: tokio::sync::Mutex<()>,
    connect_timer: Option<StatusTimer>,
}

impl<RT: Runtime> Connection<RT> {
    pub fn new(
        rt: RT,
        params: ConnectParams,
        auth: Arc<tokio::sync::Mutex<AuthSession>>,
        pusher: PusherService<RT>,
        view_syncer: Arc<dyn ViewSyncer>,
        inspector: Arc<InspectorRegistry>,
        header_init: Option<InitConnectionBody>,
        auth_token: Option<String>,
        cookie_header: Option<String>,
        rx: mpsc::UnboundedReceiver<(UpstreamMessage, Instant)>,
        tx: mpsc::UnboundedSender<(DownstreamMessage, Instant)>,
    ) -> Self {
        pusher.add_ref();
        let pusher_events = pusher.subscribe(&params.client_id);
        Self {
            rt,
            params,
            state: ConnectionState::New,
            auth,
            pusher,
            view_syncer,
            inspector,
            header_init,
            auth_token,
            cookie_header,
            user_push_url: None,
            rx,
            tx,
            pusher_events,
            poke_stream: None,
            mutation_lock: tokio::sync::Mutex::new(()),
            connect_timer: Some(connect_timer()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run the connection to completion. The caller maps the returned error
    /// (if any) onto a final `error` message and close frame.
    pub async fn go(&mut self) -> anyhow::Result<()> {
        let result = self.run().await;
        self.close();
        result
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        self.init().await?;
        loop {
            let event = {
                let rx = &mut self.rx;
                let pusher_events = &mut self.pusher_events;
                let poke_stream = &mut self.poke_stream;
                // No downstream yet: that branch just never resolves.
                let next_poke = async {
                    match poke_stream {
                        Some(stream) => stream.next().await,
                        None => futures::future::pending().await,
                    }
                };
                tokio::select! {
                    biased;
                    message = rx.recv() => Event::Client(message),
                    event = pusher_events.recv() => Event::Pusher(event),
                    poke = next_poke => Event::Poke(poke),
                }
            };
            match event {
                Event::Client(None) => return Ok(()),
                Event::Client(Some((message, received))) => {
                    let delay = self.rt.monotonic_now() - received;
                    crate::metrics::log_process_client_message_delay(delay);
                    let timer = handle_message_timer(&message);
                    self.handle_message(message).await?;
                    timer.finish();
                },
                Event::Pusher(None) => return Ok(()),
                Event::Pusher(Some(event)) => self.handle_pusher_event(event)?,
                Event::Poke(Some(Ok(message))) => self.send(message)?,
                Event::Poke(Some(Err(e))) => return Err(e),
                // Poke stream exhausted: the view-syncer is done with this
                // client.
                Event::Poke(None) => return Ok(()),
            }
        }
    }

    async fn init(&mut self) -> anyhow::Result<()> {
        assert_eq!(self.state, ConnectionState::New);
        self.state = ConnectionState::AwaitingInit;
        let version = self.params.protocol_version;
        if !(MIN_SERVER_SUPPORTED_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
            anyhow::bail!(ProtocolError::new(ErrorBody::version_not_supported(
                format!(
                    "Protocol version {version} is not supported (server speaks \
                     {MIN_SERVER_SUPPORTED_PROTOCOL_VERSION}..={PROTOCOL_VERSION})"
                ),
            )));
        }
        self.update_auth().await?;
        self.send(DownstreamMessage::Connected(ConnectedBody {
            wsid: self.params.wsid.clone(),
            timestamp: self.rt.unix_timestamp().as_millis() as u64,
        }))?;
        if let Some(timer) = self.connect_timer.take() {
            timer.finish();
        }
        if *ZERO_WARM_FRAMES {
            self.send_warm_frames()?;
        }
        if let Some(body) = self.header_init.take() {
            self.handle_init_connection(body).await?;
        }
        Ok(())
    }

    /// Present this connection's token to the group session. Runs before any
    /// message is dispatched downstream, which linearizes auth across the
    /// group's connections.
    async fn update_auth(&mut self) -> anyhow::Result<()> {
        let user_id = self.params.user_id.clone().unwrap_or_default();
        let mut session = self.auth.lock().await;
        match session.update(&user_id, self.auth_token.as_deref()).await? {
            Ok(()) => Ok(()),
            Err(body) => Err(ProtocolError::new(body).into()),
        }
    }

    fn send_warm_frames(&mut self) -> anyhow::Result<()> {
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        for _ in 0..*ZERO_WARM_FRAME_COUNT {
            let payload: String = self.rt.with_rng(|rng| {
                (0..*ZERO_WARM_FRAME_BYTES)
                    .map(|_| ALPHABET[(rng.next_u32() as usize) % ALPHABET.len()] as char)
                    .collect()
            });
            self.send(DownstreamMessage::Warm { payload })?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: UpstreamMessage) -> anyhow::Result<()> {
        match message {
            UpstreamMessage::Ping => self.send(DownstreamMessage::Pong),
            UpstreamMessage::Push(body) => self.handle_push(body).await,
            UpstreamMessage::ChangeDesiredQueries(body) => {
                self.view_syncer
                    .change_desired_queries(&self.params, body)
                    .await
            },
            UpstreamMessage::DeleteClients(body) => {
                self.view_syncer.delete_clients(&self.params, body).await
            },
            UpstreamMessage::InitConnection(body) => self.handle_init_connection(body).await,
            UpstreamMessage::Inspect(body) => self.handle_inspect(body).await,
        }
    }

    async fn handle_init_connection(&mut self, body: InitConnectionBody) -> anyhow::Result<()> {
        if let Some(url) = &body.user_push_url {
            self.user_push_url = Some(url.clone());
        }
        let stream = self
            .view_syncer
            .init_connection(&self.params, body)
            .await?;
        // Re-init replaces the previous downstream; the old stream's drop
        // cancels it.
        self.poke_stream = Some(stream);
        self.state = ConnectionState::Active;
        Ok(())
    }

    async fn handle_push(&mut self, body: PushBody) -> anyhow::Result<()> {
        if body.client_group_id != self.params.client_group_id {
            let error = ErrorBody::invalid_push(format!(
                "Push for client group {} arrived on a connection for {}",
                body.client_group_id, self.params.client_group_id
            ));
            return self.send(DownstreamMessage::Error(error));
        }
        let _guard = self.mutation_lock.lock().await;
        let jwt = self.auth.lock().await.raw_token().map(str::to_owned);
        self.pusher.enqueue(
            body,
            jwt,
            self.cookie_header.clone(),
            self.user_push_url.as_deref(),
        );
        Ok(())
    }

    async fn handle_inspect(&mut self, body: InspectBody) -> anyhow::Result<()> {
        let authenticated = self.auth.lock().await.auth().is_some();
        if !authenticated {
            return self.send(DownstreamMessage::Error(ErrorBody::unauthorized(
                "Inspector access requires an authenticated client group",
            )));
        }
        self.inspector.authenticate(&self.params.client_group_id);
        tracing::debug!(
            "Inspect op {:?} from client group {}",
            body.op,
            self.params.client_group_id
        );
        Ok(())
    }

    fn handle_pusher_event(&mut self, event: PusherEvent) -> anyhow::Result<()> {
        match event {
            PusherEvent::Response(ok) => self.send(DownstreamMessage::PushResponse(ok)),
            PusherEvent::Error(body) => self.send(DownstreamMessage::Error(body)),
            PusherEvent::Fatal(body) => {
                self.send(DownstreamMessage::Error(body.clone()))?;
                Err(ProtocolError::new(body).into())
            },
        }
    }

    fn send(&mut self, message: DownstreamMessage) -> anyhow::Result<()> {
        crate::metrics::log_message_out(&message);
        self.tx
            .send((message, self.rt.monotonic_now()))
            .map_err(|_| anyhow::anyhow!("Connection send channel closed"))
    }

    /// Idempotent teardown: cancels the poke stream and drops this
    /// connection's interest in the group's pusher.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;
        self.poke_stream = None;
        self.pusher.unsubscribe(&self.params.client_id);
        self.pusher.unref();
        self.state = ConnectionState::Closed;
    }
}

impl<RT: Runtime> Drop for Connection<RT> {
    fn drop(&mut self) {
        self.close();
    }
}
