//! The replication-manager worker: exclusive owner of the replica file.
//! Wires the change-source producer and the backfill manager into one
//! multiplexed stream and applies its bookkeeping to the replica.
//!
//! The SQL-dialect change-source reader and the snapshot backfill streamer
//! are separate subsystems; their seams are the `ChangeSource` and
//! `BackfillStreamer` traits. The placeholders below keep the worker alive
//! (and the replica consistent) until those readers are linked in.

use std::sync::Arc;

use common::{
    runtime::{
        prod::ProdRuntime,
        Runtime,
    },
    watermark::Watermark,
};
use futures::{
    stream::BoxStream,
    StreamExt,
};
use replica::Replica;
use replication::{
    BackfillManager,
    BackfillRequest,
    BackfillStreamer,
    ChangeStreamMessage,
    ChangeStreamMultiplexer,
    DataChange,
    StatusMessage,
    TableId,
};
use serde_json::json;
use tokio::signal::unix::{
    signal,
    SignalKind,
};

use crate::config::ZeroConfig;

/// One unit of upstream progress as surfaced by the change-source reader.
pub enum UpstreamEvent {
    Transaction {
        commit_watermark: Watermark,
        changes: Vec<DataChange>,
    },
    Status(StatusMessage),
}

/// Seam for the upstream logical-replication reader.
pub trait ChangeSource: Send + Sync + 'static {
    fn subscribe(&self, from: Watermark) -> BoxStream<'static, anyhow::Result<UpstreamEvent>>;
}

/// Stand-in until the upstream reader is linked in: never yields.
struct PendingChangeSource;

impl ChangeSource for PendingChangeSource {
    fn subscribe(&self, _from: Watermark) -> BoxStream<'static, anyhow::Result<UpstreamEvent>> {
        futures::stream::pending().boxed()
    }
}

/// Stand-in snapshot streamer, matching the pending change source.
struct PendingBackfillStreamer;

impl BackfillStreamer for PendingBackfillStreamer {
    fn stream(
        &self,
        _request: &BackfillRequest,
    ) -> BoxStream<'static, anyhow::Result<replication::BackfillEvent>> {
        futures::stream::pending().boxed()
    }
}

pub async fn run(config: ZeroConfig) -> anyhow::Result<()> {
    let replica = Arc::new(Replica::open(&config.replica_path)?);
    if replica.newly_created() {
        replica.record_runtime_event("replica-created", &json!({"path": config.replica_path}))?;
    }
    let last_watermark: Watermark = replica
        .last_watermark()?
        .unwrap_or_else(|| "00".to_owned())
        .parse()?;
    tracing::info!("Change streamer resuming from watermark {last_watermark}");

    let rt = ProdRuntime::new();
    let multiplexer = Arc::new(ChangeStreamMultiplexer::new(rt.clone(), last_watermark.clone()));
    let manager = BackfillManager::new(
        rt.clone(),
        multiplexer.clone(),
        Arc::new(PendingBackfillStreamer),
    );
    manager.run(replica.pending_backfills()?);

    let source: Arc<dyn ChangeSource> = Arc::new(PendingChangeSource);
    let producer = {
        let multiplexer = multiplexer.clone();
        rt.spawn("change-source", async move {
            if let Err(e) = run_change_source(source, multiplexer.clone(), last_watermark).await {
                multiplexer.fail(e);
            }
        })
    };

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut source_stream = multiplexer.as_source();
    let mut replicator = Replicator::new(replica);
    loop {
        tokio::select! {
            message = source_stream.next() => {
                match message {
                    Some(Ok(message)) => replicator.apply(&message)?,
                    Some(Err(e)) => return Err(e),
                    None => break,
                }
            },
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
        }
    }
    manager.cancel();
    multiplexer.cancel();
    drop(producer);
    Ok(())
}

/// Pump upstream transactions into the multiplexer, reserving around each
/// one so backfill transactions interleave only at commit boundaries.
async fn run_change_source(
    source: Arc<dyn ChangeSource>,
    multiplexer: Arc<ChangeStreamMultiplexer<ProdRuntime>>,
    from: Watermark,
) -> anyhow::Result<()> {
    let mut stream = source.subscribe(from);
    while let Some(event) = stream.next().await {
        match event? {
            UpstreamEvent::Transaction {
                commit_watermark,
                changes,
            } => {
                multiplexer.reserve("change-source").await?;
                multiplexer
                    .push(ChangeStreamMessage::begin(commit_watermark.clone()))
                    .await?;
                for change in changes {
                    multiplexer.push(ChangeStreamMessage::Data(change)).await?;
                }
                multiplexer
                    .push(ChangeStreamMessage::commit(commit_watermark.clone()))
                    .await?;
                multiplexer.release(commit_watermark)?;
            },
            UpstreamEvent::Status(status) => multiplexer.push_status(status).await?,
        }
    }
    Ok(())
}

/// Applies the multiplexed stream's bookkeeping to the `_zero.*` tables.
/// The replicated user-table writes happen in the external replicator; this
/// side records the change log and the backfill/metadata markers the rest of
/// the system recovers from.
struct Replicator {
    replica: Arc<Replica>,
    current_tx: Option<(Watermark, u64)>,
}

impl Replicator {
    fn new(replica: Arc<Replica>) -> Self {
        Self {
            replica,
            current_tx: None,
        }
    }

    fn apply(&mut self, message: &ChangeStreamMessage) -> anyhow::Result<()> {
        match message {
            ChangeStreamMessage::Begin { watermark } => {
                self.current_tx = Some((watermark.clone(), 0));
            },
            ChangeStreamMessage::Commit { .. } | ChangeStreamMessage::Rollback => {
                self.current_tx = None;
            },
            ChangeStreamMessage::Status(..) => {},
            ChangeStreamMessage::Data(change) => {
                let (watermark, pos) = match &mut self.current_tx {
                    Some((watermark, pos)) => {
                        let entry = (watermark.clone(), *pos);
                        *pos += 1;
                        entry
                    },
                    None => anyhow::bail!("Data change outside a transaction"),
                };
                self.replica.append_change_log(
                    &watermark.to_string(),
                    pos,
                    change_table(change).as_ref(),
                    &serde_json::to_value(change)?,
                )?;
                self.apply_bookkeeping(change)?;
            },
        }
        Ok(())
    }

    fn apply_bookkeeping(&self, change: &DataChange) -> anyhow::Result<()> {
        match change {
            DataChange::CreateTable { table, backfill } => {
                if let Some(metadata) = &table.metadata {
                    self.replica.set_table_metadata(&table.id(), metadata)?;
                }
                if let Some(columns) = backfill {
                    for (column, spec) in columns {
                        self.replica
                            .set_column_backfill(&table.id(), column, spec.id, Some(""))?;
                    }
                }
            },
            DataChange::AddColumn {
                table,
                column,
                spec,
                backfill,
            } => {
                if backfill.is_some() {
                    self.replica
                        .set_column_backfill(&table.id(), column, spec.id, Some(""))?;
                }
            },
            DataChange::UpdateTableMetadata { table, metadata } => {
                self.replica.set_table_metadata(table, metadata)?;
            },
            // The remaining schema changes must re-key or remove the
            // persisted rows that seed the backfill manager after a restart,
            // matching what its in-memory required set does with the same
            // message.
            DataChange::DropColumn { table, column } => {
                self.replica.drop_column(table, column)?;
            },
            DataChange::UpdateColumn {
                table,
                old_name,
                new_name,
                ..
            } if old_name != new_name => {
                self.replica.rename_column(table, old_name, new_name)?;
            },
            DataChange::RenameTable { table, new } => {
                self.replica.rename_table(table, new)?;
            },
            DataChange::DropTable { table } => {
                self.replica.drop_table(table)?;
            },
            DataChange::BackfillCompleted(completed) => {
                for column in completed
                    .columns
                    .iter()
                    .chain(completed.row_key_columns.iter())
                {
                    self.replica
                        .clear_column_backfill(&completed.table, column)?;
                }
            },
            _ => {},
        }
        Ok(())
    }
}

fn change_table(change: &DataChange) -> Option<TableId> {
    match change {
        DataChange::Insert { table, .. }
        | DataChange::Update { table, .. }
        | DataChange::Delete { table, .. }
        | DataChange::Truncate { table }
        | DataChange::DropTable { table }
        | DataChange::RenameTable { table, .. }
        | DataChange::UpdateTableMetadata { table, .. }
        | DataChange::DropColumn { table, .. }
        | DataChange::UpdateColumn { table, .. }
        | DataChange::CreateIndex { table, .. }
        | DataChange::DropIndex { table, .. } => Some(table.clone()),
        DataChange::CreateTable { table, .. }
        | DataChange::AddColumn { table, .. }
        | DataChange::Relation { table } => Some(table.id()),
        DataChange::Backfill(chunk) => Some(chunk.table.clone()),
        DataChange::BackfillCompleted(completed) => Some(completed.table.clone()),
    }
}
