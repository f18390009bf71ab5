//! Drives backfills to completion for every table whose columns still need
//! data loaded, while staying correct across concurrent schema evolution on
//! the main change stream.
//!
//! The manager is wired to the multiplexer twice: as a listener on all
//! messages (to react to schema changes and track watermark progress) and as
//! a producer (to emit synthetic backfill transactions stacked on top of the
//! current upstream watermark). Synthetic transactions commit at
//! `succ(current)`, so they interleave with upstream transactions without
//! ever reusing a watermark.

use std::{
    sync::Arc,
    time::Duration,
};

use common::{
    backoff::Backoff,
    knobs::{
        BACKFILL_INITIAL_RETRY_DELAY,
        BACKFILL_MAX_RETRY_DELAY,
    },
    running_state::RunningState,
    runtime::{
        Runtime,
        SpawnHandle,
    },
    watermark::Watermark,
};
use futures::{
    stream::BoxStream,
    StreamExt,
};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;

use crate::{
    message::{
        BackfillChunk,
        BackfillCompleted,
        BackfillRequest,
        ChangeStreamMessage,
        DataChange,
        TableId,
    },
    metrics::{
        log_backfill_canceled,
        log_backfill_completed,
        log_backfill_retry,
        log_backfill_started,
        log_backfill_yield,
    },
    multiplexer::ChangeStreamMultiplexer,
};

/// A backfill stream reported rows for a relation with no row-key columns.
/// Retryable: the schema may grow a key, at which point the retry succeeds.
#[derive(thiserror::Error, Debug)]
#[error("table {table} has rows but no row-key columns")]
pub struct MissingRowKeyError {
    pub table: TableId,
}

/// The snapshot cannot serve the requested columns under the current schema.
/// Not retried on a timer: the schema change that invalidated it will commit
/// on the main stream and relaunch the backfill naturally.
#[derive(thiserror::Error, Debug)]
#[error("backfill of {table} is incompatible with the current schema: {reason}")]
pub struct SchemaIncompatibilityError {
    pub table: TableId,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum BackfillEvent {
    Chunk(BackfillChunk),
    Completed(BackfillCompleted),
}

/// Capability producing the snapshot rows for one backfill request as a lazy
/// finite stream of chunks terminated by a completion marker.
pub trait BackfillStreamer: Send + Sync + 'static {
    fn stream(&self, request: &BackfillRequest) -> BoxStream<'static, anyhow::Result<BackfillEvent>>;
}

#[derive(Debug)]
struct RunningBackfill {
    /// Distinguishes this pass from its successors: the listener may clear
    /// this state (completion) and the scheduler may start the next pass
    /// before the finished driver's epilogue runs, so the driver only ever
    /// touches running state carrying its own id.
    id: u64,
    request: BackfillRequest,
    canceled_reason: Option<String>,
    /// Lower bound the backfill snapshot must meet. Set when a row-key
    /// change on the main stream invalidates data captured earlier.
    min_watermark: Option<Watermark>,
}

struct State {
    required: std::collections::BTreeMap<TableId, BackfillRequest>,
    running_backfill: Option<RunningBackfill>,
    next_backfill_id: u64,
    last_status_watermark: Option<Watermark>,
    awaiting: Vec<(Watermark, oneshot::Sender<()>)>,
    current_tx_watermark: Option<Watermark>,
    retry_timer_pending: bool,
    backoff: Backoff,
    driver: Option<Box<dyn SpawnHandle>>,
}

pub struct BackfillManager<RT: Runtime> {
    rt: RT,
    multiplexer: Arc<ChangeStreamMultiplexer<RT>>,
    streamer: Arc<dyn BackfillStreamer>,
    state: Arc<Mutex<State>>,
    running: RunningState<RT>,
}

impl<RT: Runtime> Clone for BackfillManager<RT> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            multiplexer: self.multiplexer.clone(),
            streamer: self.streamer.clone(),
            state: self.state.clone(),
            running: self.running.clone(),
        }
    }
}

impl<RT: Runtime> BackfillManager<RT> {
    pub fn new(
        rt: RT,
        multiplexer: Arc<ChangeStreamMultiplexer<RT>>,
        streamer: Arc<dyn BackfillStreamer>,
    ) -> Self {
        let manager = Self {
            rt: rt.clone(),
            multiplexer: multiplexer.clone(),
            streamer,
            state: Arc::new(Mutex::new(State {
                required: Default::default(),
                running_backfill: None,
                next_backfill_id: 0,
                last_status_watermark: None,
                awaiting: Vec::new(),
                current_tx_watermark: None,
                retry_timer_pending: false,
                backoff: Backoff::new(*BACKFILL_INITIAL_RETRY_DELAY, *BACKFILL_MAX_RETRY_DELAY),
                driver: None,
            })),
            running: RunningState::new(rt, "backfill-manager"),
        };
        let listener = manager.clone();
        multiplexer.add_listener(Arc::new(move |message| listener.handle_message(message)));
        manager
    }

    /// Seed the required set (tables pending at startup) and start the
    /// scheduler.
    pub fn run(&self, initial_requests: Vec<BackfillRequest>) {
        {
            let mut state = self.state.lock();
            for request in initial_requests {
                state.required.insert(request.table_id(), request);
            }
        }
        self.check_and_start();
    }

    /// Stop: the running backfill winds down at its next reservation point
    /// and the retry timer is cleared.
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock();
            if let Some(rb) = &mut state.running_backfill {
                rb.canceled_reason
                    .get_or_insert_with(|| "change stream canceled".to_owned());
            }
            state.awaiting.clear();
            state.retry_timer_pending = false;
            state.driver = None;
        }
        self.running.stop(None);
    }

    #[cfg(test)]
    pub(crate) fn required_backfills(&self) -> std::collections::BTreeMap<TableId, BackfillRequest> {
        self.state.lock().required.clone()
    }

    /// If nothing is running and no retry timer is pending, pick a required
    /// backfill uniformly at random and start it. Random selection keeps a
    /// pathological table from starving the rest of the queue.
    fn check_and_start(&self) {
        if !self.running.should_run() {
            return;
        }
        let (id, request) = {
            let mut state = self.state.lock();
            if state.running_backfill.is_some()
                || state.retry_timer_pending
                || state.required.is_empty()
            {
                return;
            }
            let index = self
                .rt
                .with_rng(|rng| (&mut *rng).random_range(0..state.required.len()));
            let request = state
                .required
                .values()
                .nth(index)
                .expect("index in range")
                .clone();
            let id = state.next_backfill_id;
            state.next_backfill_id += 1;
            state.running_backfill = Some(RunningBackfill {
                id,
                request: request.clone(),
                canceled_reason: None,
                min_watermark: None,
            });
            (id, request)
        };
        tracing::info!("Starting backfill of {}", request.table_id());
        log_backfill_started();
        let this = self.clone();
        let handle = self.rt.spawn("backfill", async move {
            this.drive_and_reschedule(id, request).await
        });
        self.state.lock().driver = Some(handle);
    }

    async fn drive_and_reschedule(&self, id: u64, request: BackfillRequest) {
        let table = request.table_id();
        let result = self.drive(id, request).await;
        let canceled_reason = {
            let mut state = self.state.lock();
            if state.running_backfill.as_ref().map(|rb| rb.id) == Some(id) {
                state.running_backfill.take().and_then(|rb| rb.canceled_reason)
            } else {
                // Completion already cleared this pass (and the scheduler may
                // have started the next one).
                None
            }
        };
        match result {
            Ok(()) => {
                if let Some(reason) = canceled_reason {
                    tracing::info!("Backfill of {table} canceled: {reason}");
                    // Invalidation-driven restart: relaunch right away, no
                    // backoff.
                    self.check_and_start();
                } else {
                    log_backfill_completed();
                    self.state.lock().backoff.reset();
                    self.check_and_start();
                }
            },
            Err(e) => {
                if !self.running.should_run() {
                    return;
                }
                if e.chain()
                    .any(|c| c.downcast_ref::<SchemaIncompatibilityError>().is_some())
                {
                    // The invalidating schema change will commit on the main
                    // stream and re-invoke the scheduler; no timer needed.
                    tracing::warn!("Backfill of {table} invalidated: {e:#}");
                    return;
                }
                let delay = {
                    let mut state = self.state.lock();
                    state.retry_timer_pending = true;
                    state.backoff.fail_unjittered()
                };
                tracing::warn!("Backfill of {table} failed, retrying in {delay:?}: {e:#}");
                log_backfill_retry();
                let this = self.clone();
                self.running.set_timeout("backfill-retry", delay, move || {
                    this.state.lock().retry_timer_pending = false;
                    this.check_and_start();
                });
            },
        }
    }

    async fn drive(&self, id: u64, request: BackfillRequest) -> anyhow::Result<()> {
        let mut stream = self.streamer.stream(&request);
        let mut open_tx: Option<Watermark> = None;
        while let Some(event) = stream.next().await {
            let event = event?;
            if !self.running.should_run() {
                break;
            }
            // Cooperative yield: if another producer is waiting on the
            // reservation, close out the current transaction first.
            if let Some(tx) = open_tx.take() {
                if self
                    .multiplexer
                    .waiter_delay()
                    .is_some_and(|d| d > Duration::ZERO)
                {
                    self.multiplexer
                        .push(ChangeStreamMessage::commit(tx.clone()))
                        .await?;
                    self.multiplexer.release(tx)?;
                    log_backfill_yield();
                } else {
                    open_tx = Some(tx);
                }
            }
            match event {
                BackfillEvent::Chunk(chunk) => {
                    if !chunk.rows.is_empty() && !request.has_row_key() {
                        return Err(MissingRowKeyError {
                            table: request.table_id(),
                        }
                        .into());
                    }
                    if open_tx.is_none() {
                        match self.begin_tx(id, Some(&chunk.watermark)).await? {
                            Some(tx) => open_tx = Some(tx),
                            None => return Ok(()),
                        }
                    }
                    self.multiplexer
                        .push(ChangeStreamMessage::Data(DataChange::Backfill(chunk)))
                        .await?;
                },
                BackfillEvent::Completed(completed) => {
                    // The completion is only valid once the main stream has
                    // caught up to the snapshot it was taken at.
                    self.change_stream_reached(&completed.watermark).await?;
                    if open_tx.is_none() {
                        match self.begin_tx(id, None).await? {
                            Some(tx) => open_tx = Some(tx),
                            None => return Ok(()),
                        }
                    }
                    self.multiplexer
                        .push(ChangeStreamMessage::Data(DataChange::BackfillCompleted(
                            completed,
                        )))
                        .await?;
                },
            }
        }
        if let Some(tx) = open_tx {
            self.multiplexer
                .push(ChangeStreamMessage::commit(tx.clone()))
                .await?;
            self.multiplexer.release(tx)?;
        }
        Ok(())
    }

    /// Reserve the stream and open a synthetic transaction at
    /// `succ(current)`. Returns `None` when the backfill was canceled while
    /// waiting, in which case the reservation has been released unchanged.
    async fn begin_tx(
        &self,
        id: u64,
        chunk_watermark: Option<&Watermark>,
    ) -> anyhow::Result<Option<Watermark>> {
        let current = self.multiplexer.reserve("backfill").await?;
        let canceled = {
            let mut state = self.state.lock();
            match &mut state.running_backfill {
                None => true,
                Some(rb) if rb.id != id => true,
                Some(rb) => {
                    if rb.canceled_reason.is_some() {
                        true
                    } else if let (Some(chunk), Some(min)) =
                        (chunk_watermark, &rb.min_watermark)
                    {
                        if chunk < min {
                            rb.canceled_reason = Some(format!(
                                "row key change at {min} postdates backfill watermark at {chunk}"
                            ));
                            log_backfill_canceled("row-key-change");
                            true
                        } else {
                            false
                        }
                    } else {
                        false
                    }
                },
            }
        };
        if canceled {
            self.multiplexer.release(current)?;
            return Ok(None);
        }
        let tx = current.succ();
        self.multiplexer
            .push(ChangeStreamMessage::begin(tx.clone()))
            .await?;
        Ok(Some(tx))
    }

    /// Resolve once the main stream has reported a commit or status at or
    /// beyond `watermark`.
    async fn change_stream_reached(&self, watermark: &Watermark) -> anyhow::Result<()> {
        let rx = {
            let mut state = self.state.lock();
            if state
                .last_status_watermark
                .as_ref()
                .is_some_and(|w| w >= watermark)
            {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.awaiting.push((watermark.clone(), tx));
            rx
        };
        rx.await.map_err(|_| {
            anyhow::anyhow!("Backfill manager stopped while awaiting watermark {watermark}")
        })
    }

    fn handle_message(&self, message: &ChangeStreamMessage) {
        let mut run_scheduler = false;
        {
            let mut state = self.state.lock();
            match message {
                ChangeStreamMessage::Begin { watermark } => {
                    state.current_tx_watermark = Some(watermark.clone());
                },
                ChangeStreamMessage::Commit { watermark } => {
                    state.current_tx_watermark = None;
                    advance_status(&mut state, watermark);
                    run_scheduler = true;
                },
                ChangeStreamMessage::Rollback => {
                    state.current_tx_watermark = None;
                },
                ChangeStreamMessage::Status(status) => {
                    advance_status(&mut state, &status.watermark);
                },
                ChangeStreamMessage::Data(change) => {
                    self.handle_data(&mut state, change);
                },
            }
        }
        if run_scheduler {
            self.check_and_start();
        }
    }

    fn handle_data(&self, state: &mut State, change: &DataChange) {
        match change {
            DataChange::CreateTable {
                table,
                backfill: Some(columns),
            } => {
                state.required.insert(
                    table.id(),
                    BackfillRequest {
                        table: table.clone(),
                        columns: columns.clone(),
                    },
                );
            },
            DataChange::AddColumn {
                table,
                column,
                spec: _,
                backfill: Some(backfill),
            } => {
                // The running backfill is not canceled: the new column
                // simply streams after the current pass completes.
                let id = table.id();
                match state.required.get_mut(&id) {
                    Some(request) => {
                        request.columns.insert(column.clone(), *backfill);
                    },
                    None => {
                        state.required.insert(
                            id,
                            BackfillRequest {
                                table: table.clone(),
                                columns: [(column.clone(), *backfill)].into_iter().collect(),
                            },
                        );
                    },
                }
            },
            DataChange::DropColumn { table, column } => {
                if let Some(request) = state.required.get_mut(table) {
                    request.columns.remove(column);
                    if request.columns.is_empty() {
                        state.required.remove(table);
                    }
                }
                cancel_running_if(state, "column-dropped", |rb| {
                    rb.request.table_id() == *table && rb.request.columns.contains_key(column)
                });
            },
            DataChange::UpdateColumn {
                table,
                old_name,
                new_name,
                spec,
            } if old_name != new_name => {
                if let Some(request) = state.required.get_mut(table) {
                    if request.columns.remove(old_name).is_some() {
                        request.columns.insert(new_name.clone(), *spec);
                    }
                }
                cancel_running_if(state, "column-renamed", |rb| {
                    rb.request.table_id() == *table && rb.request.columns.contains_key(old_name)
                });
            },
            DataChange::RenameTable { table, new } => {
                if let Some(mut request) = state.required.remove(table) {
                    request.table.schema = new.schema.clone();
                    request.table.name = new.name.clone();
                    state.required.insert(new.clone(), request);
                }
                cancel_running_if(state, "table-renamed", |rb| rb.request.table_id() == *table);
            },
            DataChange::UpdateTableMetadata { table, metadata } => {
                if let Some(request) = state.required.get_mut(table) {
                    request.table.metadata = Some(metadata.clone());
                }
                cancel_running_if(state, "table-metadata-updated", |rb| {
                    rb.request.table_id() == *table
                });
            },
            DataChange::DropTable { table } => {
                state.required.remove(table);
                cancel_running_if(state, "table-dropped", |rb| rb.request.table_id() == *table);
            },
            DataChange::Update {
                table,
                old_row_key: Some(..),
                ..
            } => {
                // A row-key change is delete-old + insert-new in the change
                // log. A snapshot taken before this transaction doesn't know
                // about the new row, so any backfill below the current
                // transaction's watermark must be thrown away. Cancellation
                // is lazy: the driver checks at its next reservation.
                let min = state.current_tx_watermark.clone();
                if let Some(rb) = &mut state.running_backfill {
                    if rb.request.table_id() == *table {
                        rb.min_watermark = min;
                    }
                }
            },
            DataChange::BackfillCompleted(completed) => {
                if let Some(request) = state.required.get_mut(&completed.table) {
                    for column in completed
                        .columns
                        .iter()
                        .chain(completed.row_key_columns.iter())
                    {
                        request.columns.remove(column);
                    }
                    if request.columns.is_empty() {
                        state.required.remove(&completed.table);
                    }
                }
                state.running_backfill = None;
            },
            _ => {},
        }
    }
}

fn advance_status(state: &mut State, watermark: &Watermark) {
    if state
        .last_status_watermark
        .as_ref()
        .is_none_or(|w| w < watermark)
    {
        state.last_status_watermark = Some(watermark.clone());
    }
    let awaiting = std::mem::take(&mut state.awaiting);
    for (target, tx) in awaiting {
        if target <= *watermark {
            let _ = tx.send(());
        } else {
            state.awaiting.push((target, tx));
        }
    }
}

fn cancel_running_if(
    state: &mut State,
    reason: &'static str,
    predicate: impl FnOnce(&RunningBackfill) -> bool,
) {
    if let Some(rb) = &mut state.running_backfill {
        if rb.canceled_reason.is_none() && predicate(rb) {
            rb.canceled_reason = Some(reason.replace('-', " "));
            log_backfill_canceled(reason);
        }
    }
}
