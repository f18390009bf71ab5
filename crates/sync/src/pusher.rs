//! Per-client-group forwarder for custom mutations.
//!
//! A single worker loop drains the queue: it takes one task, combines it
//! with everything already enqueued behind it, and issues one HTTP POST per
//! distinct target URL. While a call is in flight, newly enqueued pushes
//! pile up and ride the next call, so a slow user endpoint coalesces
//! traffic instead of queueing latency per mutation.
//!
//! The service is ref-counted by the connections of its client group; when
//! the last one disconnects a stop sentinel is enqueued and the worker exits
//! after finishing what it already absorbed.

use std::{
    collections::HashMap,
    sync::Arc,
};

use common::{
    runtime::{
        Runtime,
        SpawnHandle,
    },
    url_pattern::UrlAllowList,
};
use errors::ErrorBody;
use parking_lot::Mutex;
use sync_types::{
    Mutation,
    MutationId,
    PushBody,
    PushErrorKind,
    PushOk,
    PushResult,
};
use tokio::sync::mpsc;

use crate::{
    fetch::{
        FetchClient,
        HttpRequest,
    },
    metrics::{
        log_push_combined_mutations,
        log_push_http_call,
    },
};

#[derive(Debug, Clone)]
pub struct PusherConfig {
    /// Default push endpoint, from server config.
    pub push_url: String,
    pub api_key: Option<String>,
    pub app_id: String,
    /// Name of the upstream schema, forwarded as the reserved `schema`
    /// query parameter.
    pub upstream_schema: String,
    pub forward_cookies: bool,
    pub allowed_push_urls: UrlAllowList,
}

/// What a connection receives back for its client.
#[derive(Debug, Clone, PartialEq)]
pub enum PusherEvent {
    /// Stream as a `pushResponse`.
    Response(PushOk),
    /// Stream as an `error` message; the connection survives.
    Error(ErrorBody),
    /// Stream as an `error` message and terminate the connection.
    Fatal(ErrorBody),
}

struct PushTask {
    url: String,
    jwt: Option<String>,
    cookie: Option<String>,
    push: PushBody,
}

enum QueueItem {
    Task(PushTask),
    Stop,
}

struct Inner<RT: Runtime> {
    rt: RT,
    config: PusherConfig,
    fetch: Arc<dyn FetchClient>,
    queue_tx: mpsc::UnboundedSender<QueueItem>,
    refs: Mutex<usize>,
    clients: Mutex<HashMap<String, mpsc::UnboundedSender<PusherEvent>>>,
    worker: Mutex<Option<Box<dyn SpawnHandle>>>,
}

pub struct PusherService<RT: Runtime> {
    inner: Arc<Inner<RT>>,
}

impl<RT: Runtime> Clone for PusherService<RT> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<RT: Runtime> PusherService<RT> {
    pub fn new(rt: RT, config: PusherConfig, fetch: Arc<dyn FetchClient>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            rt: rt.clone(),
            config,
            fetch,
            queue_tx,
            refs: Mutex::new(0),
            clients: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
        });
        let service = Self {
            inner: inner.clone(),
        };
        let worker = service.clone();
        let handle = rt.spawn("pusher", async move { worker.go(queue_rx).await });
        *inner.worker.lock() = Some(handle);
        service
    }

    /// Register the downstream for a connected client of this group.
    pub fn subscribe(&self, client_id: &str) -> mpsc::UnboundedReceiver<PusherEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.clients.lock().insert(client_id.to_owned(), tx);
        rx
    }

    pub fn unsubscribe(&self, client_id: &str) {
        self.inner.clients.lock().remove(client_id);
    }

    pub fn add_ref(&self) {
        *self.inner.refs.lock() += 1;
    }

    pub fn unref(&self) {
        let mut refs = self.inner.refs.lock();
        debug_assert!(*refs > 0, "unref() without a matching add_ref()");
        *refs = refs.saturating_sub(1);
        if *refs == 0 {
            let _ = self.inner.queue_tx.send(QueueItem::Stop);
        }
    }

    /// Queue a push for forwarding. The target URL is resolved here, before
    /// batching, so the allow-list verdict applies to the mutations actually
    /// carried in this push.
    pub fn enqueue(
        &self,
        push: PushBody,
        jwt: Option<String>,
        cookie: Option<String>,
        user_push_url: Option<&str>,
    ) {
        let url = match user_push_url {
            None => self.inner.config.push_url.clone(),
            Some(url) if self.inner.config.allowed_push_urls.matches(url) => url.to_owned(),
            Some(url) => {
                let mutation_ids: Vec<MutationId> = push
                    .mutations
                    .iter()
                    .map(|m| MutationId {
                        client_id: m.client_id.clone(),
                        id: m.id,
                    })
                    .collect();
                tracing::warn!(
                    "Rejecting push to non-allowed URL {url} ({} mutations)",
                    mutation_ids.len()
                );
                let body = ErrorBody::push_failed(format!(
                    "Push URL {url} is not allowed by this server; mutations {mutation_ids:?} \
                     were not applied"
                ));
                for client_id in affected_clients(&push.mutations) {
                    self.send_event(&client_id, PusherEvent::Error(body.clone()));
                }
                return;
            },
        };
        let task = PushTask {
            url,
            jwt,
            cookie,
            push,
        };
        if self.inner.queue_tx.send(QueueItem::Task(task)).is_err() {
            tracing::warn!("Push enqueued after pusher stopped; dropping");
        }
    }

    fn send_event(&self, client_id: &str, event: PusherEvent) {
        let clients = self.inner.clients.lock();
        match clients.get(client_id) {
            Some(tx) => {
                let _ = tx.send(event);
            },
            None => {
                tracing::debug!("Dropping pusher event for disconnected client {client_id}");
            },
        }
    }

    async fn go(self, mut queue_rx: mpsc::UnboundedReceiver<QueueItem>) {
        loop {
            let Some(first) = queue_rx.recv().await else {
                break;
            };
            let mut stop = false;
            let mut tasks = Vec::new();
            match first {
                QueueItem::Stop => stop = true,
                QueueItem::Task(task) => tasks.push(task),
            }
            // Drain everything already behind the first item and combine.
            while let Ok(item) = queue_rx.try_recv() {
                match item {
                    QueueItem::Stop => stop = true,
                    QueueItem::Task(task) => tasks.push(task),
                }
            }
            if !tasks.is_empty() {
                if let Err(mut e) = self.process_batch(tasks).await {
                    common::errors::report_error(&mut e);
                }
            }
            if stop {
                break;
            }
        }
        tracing::info!("Pusher worker exited");
    }

    async fn process_batch(&self, tasks: Vec<PushTask>) -> anyhow::Result<()> {
        // One POST per distinct target URL, in first-seen order.
        let mut groups: Vec<(String, Vec<PushTask>)> = Vec::new();
        for task in tasks {
            match groups.iter_mut().find(|(url, _)| *url == task.url) {
                Some((_, group)) => group.push(task),
                None => groups.push((task.url.clone(), vec![task])),
            }
        }
        for (url, group) in groups {
            self.process_group(url, group).await?;
        }
        Ok(())
    }

    async fn process_group(&self, url: String, group: Vec<PushTask>) -> anyhow::Result<()> {
        let first = group.first().expect("group is non-empty");
        let client_group_id = first.push.client_group_id.clone();
        let push_version = first.push.push_version;
        let schema_version = first.push.schema_version.clone();
        let jwt = first.jwt.clone();
        let cookie = first.cookie.clone();

        // Combined pushes: mutations grouped per client, original order
        // preserved within each client. A client group has one auth session
        // and one schema, so disagreement here is a programming error.
        let mut per_client: Vec<(String, Vec<Mutation>)> = Vec::new();
        for task in &group {
            anyhow::ensure!(
                task.push.client_group_id == client_group_id,
                "Combined pushes span client groups: {} vs {client_group_id}",
                task.push.client_group_id
            );
            anyhow::ensure!(
                task.push.push_version == push_version
                    && task.push.schema_version == schema_version
                    && task.jwt == jwt,
                "Combined pushes disagree on push metadata for group {client_group_id}"
            );
            for mutation in &task.push.mutations {
                match per_client
                    .iter_mut()
                    .find(|(client_id, _)| *client_id == mutation.client_id)
                {
                    Some((_, mutations)) => mutations.push(mutation.clone()),
                    None => {
                        per_client.push((mutation.client_id.clone(), vec![mutation.clone()]))
                    },
                }
            }
        }
        let affected: Vec<String> = per_client.iter().map(|(c, _)| c.clone()).collect();
        let mutations: Vec<Mutation> = per_client
            .into_iter()
            .flat_map(|(_, mutations)| mutations)
            .collect();
        log_push_combined_mutations(group.len(), mutations.len());

        let body = PushBody {
            client_group_id,
            mutations,
            push_version,
            schema_version,
            timestamp: self.inner.rt.unix_timestamp().as_millis() as f64,
            request_id: first.push.request_id.clone(),
        };

        let mut target = url::Url::parse(&url)
            .map_err(|e| anyhow::anyhow!("Push URL {url} failed to parse: {e}"))?;
        target
            .query_pairs_mut()
            .append_pair("schema", &self.inner.config.upstream_schema)
            .append_pair("appID", &self.inner.config.app_id);

        let mut headers = vec![("Content-Type".to_owned(), "application/json".to_owned())];
        if let Some(api_key) = &self.inner.config.api_key {
            headers.push(("X-Api-Key".to_owned(), api_key.clone()));
        }
        if let Some(jwt) = &jwt {
            headers.push(("Authorization".to_owned(), format!("Bearer {jwt}")));
        }
        if self.inner.config.forward_cookies {
            if let Some(cookie) = &cookie {
                headers.push(("Cookie".to_owned(), cookie.clone()));
            }
        }

        let request = HttpRequest {
            url: target.to_string(),
            headers,
            body: serde_json::to_value(&body)?,
        };
        let response = self.inner.fetch.post_json(request).await;
        let status = response.as_ref().map(|r| r.status).unwrap_or(0);
        log_push_http_call(status);

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                // Transport failure: surfaced per client, connection kept.
                let body =
                    ErrorBody::push_failed(format!("Failed to reach push endpoint: {e:#}"));
                self.fan_out(&affected, |_| PusherEvent::Error(body.clone()));
                return Ok(());
            },
        };
        if response.status == 401 {
            let body = ErrorBody::auth_invalidated(
                "Push endpoint rejected the client group's credentials",
            );
            self.fan_out(&affected, |_| PusherEvent::Fatal(body.clone()));
            return Ok(());
        }
        if !response.is_ok() {
            let body = ErrorBody::push_failed(format!(
                "Push endpoint returned HTTP {}",
                response.status
            ));
            self.fan_out(&affected, |_| PusherEvent::Error(body.clone()));
            return Ok(());
        }
        let parsed: PushResult = match serde_json::from_str(&response.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                let body =
                    ErrorBody::push_failed(format!("Unparseable push response: {e}"));
                self.fan_out(&affected, |_| PusherEvent::Error(body.clone()));
                return Ok(());
            },
        };
        match parsed {
            PushResult::Err(error) => {
                let event = match error.kind() {
                    PushErrorKind::UnsupportedPushVersion | PushErrorKind::UnsupportedSchemaVersion => {
                        PusherEvent::Fatal(ErrorBody::invalid_push(format!(
                            "Push endpoint does not support this push: {}",
                            error.error
                        )))
                    },
                    PushErrorKind::ForClient => {
                        let message = error
                            .message
                            .clone()
                            .or_else(|| error.cause.as_ref().map(|c| c.to_string()))
                            .unwrap_or_else(|| "Push rejected for client".to_owned());
                        PusherEvent::Fatal(ErrorBody::invalid_push(message))
                    },
                    PushErrorKind::Unknown => PusherEvent::Error(ErrorBody::push_failed(
                        format!("Push endpoint reported an error: {}", error.error),
                    )),
                };
                self.fan_out(&affected, |_| event.clone());
            },
            PushResult::Ok(ok) => self.dispatch_mutation_results(ok),
        }
        Ok(())
    }

    /// Dispatch per-mutation results to their clients. Within a client, an
    /// out-of-order marker fails the connection after streaming the
    /// successful prefix; anything behind the marker is logged only.
    fn dispatch_mutation_results(&self, ok: PushOk) {
        let mut per_client: Vec<(String, Vec<sync_types::MutationResponse>)> = Vec::new();
        for response in ok.mutations {
            match per_client
                .iter_mut()
                .find(|(client_id, _)| *client_id == response.id.client_id)
            {
                Some((_, responses)) => responses.push(response),
                None => per_client.push((response.id.client_id.clone(), vec![response])),
            }
        }
        for (client_id, responses) in per_client {
            let first_ooo = responses
                .iter()
                .position(|r| r.result.is_ooo_mutation());
            match first_ooo {
                None => {
                    self.send_event(&client_id, PusherEvent::Response(PushOk {
                        mutations: responses,
                    }));
                },
                Some(index) => {
                    for skipped in &responses[index + 1..] {
                        tracing::warn!(
                            "Discarding result for mutation {:?} behind an out-of-order error",
                            skipped.id
                        );
                    }
                    let prefix: Vec<_> = responses[..index].to_vec();
                    if !prefix.is_empty() {
                        self.send_event(
                            &client_id,
                            PusherEvent::Response(PushOk { mutations: prefix }),
                        );
                    }
                    self.send_event(
                        &client_id,
                        PusherEvent::Fatal(ErrorBody::invalid_push(
                            "mutation was out of order",
                        )),
                    );
                },
            }
        }
    }

    fn fan_out(&self, clients: &[String], event: impl Fn(&str) -> PusherEvent) {
        for client_id in clients {
            self.send_event(client_id, event(client_id));
        }
    }
}

fn affected_clients(mutations: &[Mutation]) -> Vec<String> {
    let mut clients = Vec::new();
    for mutation in mutations {
        if !clients.contains(&mutation.client_id) {
            clients.push(mutation.client_id.clone());
        }
    }
    clients
}
