use std::{
    collections::VecDeque,
    sync::Arc,
    time::Duration,
};

use common::{
    runtime::testing::TestRuntime,
    watermark::Watermark,
};
use futures::{
    stream::BoxStream,
    StreamExt,
};
use maplit::btreemap;
use must_let::must_let;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{
    ReceiverStream,
    UnboundedReceiverStream,
};

use crate::{
    backfill::{
        BackfillEvent,
        BackfillManager,
        BackfillStreamer,
    },
    message::{
        BackfillChunk,
        BackfillCompleted,
        BackfillRequest,
        ChangeStreamMessage,
        ColumnSpec,
        DataChange,
        StatusMessage,
        TableId,
        TableMetadata,
        TableSpec,
    },
    multiplexer::ChangeStreamMultiplexer,
};

fn watermark(s: &str) -> Watermark {
    s.parse().unwrap()
}

fn table_spec(row_key: &[&str]) -> TableSpec {
    TableSpec {
        schema: "foo".to_owned(),
        name: "bar".to_owned(),
        metadata: Some(TableMetadata {
            row_key: row_key
                .iter()
                .map(|c| ((*c).to_owned(), json!("int8")))
                .collect(),
        }),
    }
}

fn request(row_key: &[&str], columns: &[(&str, u64)]) -> BackfillRequest {
    BackfillRequest {
        table: table_spec(row_key),
        columns: columns
            .iter()
            .map(|(name, id)| ((*name).to_owned(), ColumnSpec { id: *id }))
            .collect(),
    }
}

fn chunk(w: &str, columns: &[&str], rows: Vec<Vec<serde_json::Value>>) -> BackfillEvent {
    BackfillEvent::Chunk(BackfillChunk {
        table: TableId::new("foo", "bar"),
        columns: columns.iter().map(|c| (*c).to_owned()).collect(),
        watermark: watermark(w),
        rows,
    })
}

fn completed(w: &str, columns: &[&str], row_key: &[&str]) -> BackfillEvent {
    BackfillEvent::Completed(BackfillCompleted {
        table: TableId::new("foo", "bar"),
        watermark: watermark(w),
        columns: columns.iter().map(|c| (*c).to_owned()).collect(),
        row_key_columns: row_key.iter().map(|c| (*c).to_owned()).collect(),
    })
}

/// Each `stream()` call consumes the next scripted feed; the test side holds
/// the senders so it can gate the driver's progress. Calls past the scripted
/// feeds get a stream that never yields, parking the driver.
struct ScriptedStreamer {
    feeds: Mutex<VecDeque<mpsc::UnboundedReceiver<anyhow::Result<BackfillEvent>>>>,
    calls: Mutex<Vec<BackfillRequest>>,
}

impl ScriptedStreamer {
    fn new(
        num_feeds: usize,
    ) -> (
        Arc<Self>,
        Vec<mpsc::UnboundedSender<anyhow::Result<BackfillEvent>>>,
    ) {
        let mut feeds = VecDeque::new();
        let mut senders = Vec::new();
        for _ in 0..num_feeds {
            let (tx, rx) = mpsc::unbounded_channel();
            feeds.push_back(rx);
            senders.push(tx);
        }
        (
            Arc::new(Self {
                feeds: Mutex::new(feeds),
                calls: Mutex::new(Vec::new()),
            }),
            senders,
        )
    }

    fn calls(&self) -> Vec<BackfillRequest> {
        self.calls.lock().clone()
    }
}

impl BackfillStreamer for ScriptedStreamer {
    fn stream(
        &self,
        request: &BackfillRequest,
    ) -> BoxStream<'static, anyhow::Result<BackfillEvent>> {
        self.calls.lock().push(request.clone());
        match self.feeds.lock().pop_front() {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => futures::stream::pending().boxed(),
        }
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

type Source = ReceiverStream<anyhow::Result<ChangeStreamMessage>>;

/// Read whatever has reached the downstream subscription. The timeout rides
/// the paused clock, so this returns as soon as the stream goes idle.
async fn drain(source: &mut Source) -> Vec<ChangeStreamMessage> {
    let mut out = Vec::new();
    while let Ok(Some(Ok(message))) =
        tokio::time::timeout(Duration::from_millis(100), source.next()).await
    {
        out.push(message);
    }
    out
}

fn kind(message: &ChangeStreamMessage) -> &'static str {
    match message {
        ChangeStreamMessage::Begin { .. } => "begin",
        ChangeStreamMessage::Commit { .. } => "commit",
        ChangeStreamMessage::Data(DataChange::Backfill(..)) => "backfill",
        ChangeStreamMessage::Data(DataChange::BackfillCompleted(..)) => "backfill-completed",
        ChangeStreamMessage::Data(..) => "data",
        ChangeStreamMessage::Status(..) => "status",
        ChangeStreamMessage::Rollback => "rollback",
    }
}

struct BackfillTest {
    rt: TestRuntime,
    mux: Arc<ChangeStreamMultiplexer<TestRuntime>>,
    manager: BackfillManager<TestRuntime>,
    streamer: Arc<ScriptedStreamer>,
    senders: Vec<mpsc::UnboundedSender<anyhow::Result<BackfillEvent>>>,
}

impl BackfillTest {
    fn new(initial_watermark: &str, num_feeds: usize) -> Self {
        let rt = TestRuntime::new();
        let mux = Arc::new(ChangeStreamMultiplexer::new(
            rt.clone(),
            watermark(initial_watermark),
        ));
        let (streamer, senders) = ScriptedStreamer::new(num_feeds);
        let manager = BackfillManager::new(rt.clone(), mux.clone(), streamer.clone());
        Self {
            rt,
            mux,
            manager,
            streamer,
            senders,
        }
    }

    /// Run one upstream transaction through the multiplexer from a "main"
    /// producer, waiting its turn in the reservation queue.
    async fn main_tx(&self, commit_watermark: &str, changes: Vec<DataChange>) {
        let commit_watermark = watermark(commit_watermark);
        self.mux.reserve("main").await.unwrap();
        self.mux
            .push(ChangeStreamMessage::begin(commit_watermark.clone()))
            .await
            .unwrap();
        for change in changes {
            self.mux
                .push(ChangeStreamMessage::Data(change))
                .await
                .unwrap();
        }
        self.mux
            .push(ChangeStreamMessage::commit(commit_watermark.clone()))
            .await
            .unwrap();
        self.mux.release(commit_watermark).unwrap();
    }

    /// Spawn a main-stream transaction that first queues on the reservation
    /// and ages its waiter, so the running backfill driver yields at its
    /// next event.
    fn spawn_main_tx(
        &self,
        commit_watermark: &str,
        changes: Vec<DataChange>,
    ) -> tokio::task::JoinHandle<()> {
        let mux = self.mux.clone();
        let commit_watermark = watermark(commit_watermark);
        tokio::spawn(async move {
            mux.reserve("main").await.unwrap();
            mux.push(ChangeStreamMessage::begin(commit_watermark.clone()))
                .await
                .unwrap();
            for change in changes {
                mux.push(ChangeStreamMessage::Data(change)).await.unwrap();
            }
            mux.push(ChangeStreamMessage::commit(commit_watermark.clone()))
                .await
                .unwrap();
            mux.release(commit_watermark).unwrap();
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_simple_backfill_completion() {
    let mut t = BackfillTest::new("123", 1);
    let mut source = t.mux.as_source();

    t.manager
        .run(vec![request(&["id"], &[("a", 1), ("b", 2)])]);
    t.senders[0]
        .send(Ok(chunk(
            "130",
            &["a", "b"],
            vec![vec![json!(1), json!(2)], vec![json!(3), json!(4)]],
        )))
        .unwrap();
    t.senders[0]
        .send(Ok(completed("130", &["a", "b"], &["id"])))
        .unwrap();
    settle().await;

    // The completion is held until the main stream reaches watermark 130.
    t.mux
        .push_status(StatusMessage {
            watermark: watermark("130"),
            ack: false,
        })
        .await
        .unwrap();
    t.senders.clear();
    settle().await;

    must_let!(let Some(Ok(ChangeStreamMessage::Begin { watermark: begin })) = source.next().await);
    assert_eq!(begin, watermark("123.01"));
    must_let!(let Some(Ok(ChangeStreamMessage::Data(DataChange::Backfill(loaded)))) =
        source.next().await);
    assert_eq!(loaded.rows.len(), 2);
    must_let!(let Some(Ok(ChangeStreamMessage::Data(DataChange::BackfillCompleted(done)))) =
        source.next().await);
    assert_eq!(done.watermark, watermark("130"));
    must_let!(let Some(Ok(ChangeStreamMessage::Commit { watermark: commit })) =
        source.next().await);
    assert_eq!(commit, watermark("123.01"));

    assert!(t.manager.required_backfills().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_column_rename_cancels_and_retries() {
    let mut t = BackfillTest::new("123", 2);
    let mut source = t.mux.as_source();

    t.manager
        .run(vec![request(&["id"], &[("a", 123), ("b", 234)])]);
    t.senders[0]
        .send(Ok(chunk("130", &["a", "b"], vec![vec![json!(1), json!(2)]])))
        .unwrap();
    settle().await;

    let main_tx = t.spawn_main_tx(
        "140",
        vec![DataChange::UpdateColumn {
            table: TableId::new("foo", "bar"),
            old_name: "b".to_owned(),
            new_name: "d".to_owned(),
            spec: ColumnSpec { id: 234 },
        }],
    );
    settle().await;
    t.rt.advance_time(Duration::from_millis(1)).await;
    // The next chunk makes the driver notice the waiter and yield; the
    // rename then cancels the running pass at its next reservation.
    t.senders[0]
        .send(Ok(chunk("130", &["a", "b"], vec![vec![json!(5), json!(6)]])))
        .unwrap();
    settle().await;
    main_tx.await.unwrap();

    // Retry picks up the renamed column set on a fresh snapshot.
    t.senders[1]
        .send(Ok(completed("140", &["a", "d"], &["id"])))
        .unwrap();
    t.senders.clear();
    settle().await;

    let calls = t.streamer.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1].columns,
        btreemap! {
            "a".to_owned() => ColumnSpec { id: 123 },
            "d".to_owned() => ColumnSpec { id: 234 },
        }
    );
    assert!(t.manager.required_backfills().is_empty());

    // Downstream: the (yielded) first backfill tx, the rename tx, then the
    // retried backfill tx. The second chunk of the canceled pass never
    // appears.
    let kinds: Vec<_> = drain(&mut source).await.iter().map(kind).collect();
    assert_eq!(
        kinds,
        vec![
            "begin",
            "backfill",
            "commit",
            "begin",
            "data",
            "commit",
            "begin",
            "backfill-completed",
            "commit",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_row_key_change_invalidates_stale_snapshot() {
    let mut t = BackfillTest::new("120", 2);
    let mut source = t.mux.as_source();

    t.manager.run(vec![request(&["id"], &[("a", 1)])]);
    t.senders[0]
        .send(Ok(chunk("120", &["a"], vec![vec![json!(1)]])))
        .unwrap();
    settle().await;

    let main_tx = t.spawn_main_tx(
        "140",
        vec![DataChange::Update {
            table: TableId::new("foo", "bar"),
            row: json!({"id": 7, "a": 1}),
            old_row_key: Some(json!({"id": 3})),
        }],
    );
    settle().await;
    t.rt.advance_time(Duration::from_millis(1)).await;
    // This chunk's snapshot (130) predates the row-key change (140): the
    // driver must reject it at its next reservation.
    t.senders[0]
        .send(Ok(chunk("130", &["a"], vec![vec![json!(2)]])))
        .unwrap();
    settle().await;
    main_tx.await.unwrap();

    // The retry takes a snapshot past the invalidation point.
    t.senders[1]
        .send(Ok(chunk("145", &["a"], vec![vec![json!(3)]])))
        .unwrap();
    t.senders[1]
        .send(Ok(completed("145", &["a"], &["id"])))
        .unwrap();
    settle().await;
    t.mux
        .push_status(StatusMessage {
            watermark: watermark("145"),
            ack: false,
        })
        .await
        .unwrap();
    t.senders.clear();
    settle().await;

    assert_eq!(t.streamer.calls().len(), 2);
    assert!(t.manager.required_backfills().is_empty());

    let completed_watermarks: Vec<_> = drain(&mut source)
        .await
        .into_iter()
        .filter_map(|message| match message {
            ChangeStreamMessage::Data(DataChange::BackfillCompleted(done)) => {
                Some(done.watermark)
            },
            _ => None,
        })
        .collect();
    assert_eq!(completed_watermarks, vec![watermark("145")]);
}

#[tokio::test(start_paused = true)]
async fn test_missing_row_key_retries_after_schema_adds_key() {
    let mut t = BackfillTest::new("123", 2);
    let mut source = t.mux.as_source();

    // No row-key columns at all: streaming actual rows must fail.
    t.manager.run(vec![request(&[], &[("a", 1)])]);
    t.senders[0]
        .send(Ok(chunk("125", &["a"], vec![vec![json!(1)]])))
        .unwrap();
    settle().await;

    // The failure happened before reserving; nothing was pushed downstream.
    assert_eq!(t.streamer.calls().len(), 1);
    assert!(drain(&mut source).await.is_empty());

    // The schema grows a primary key, updating the request's metadata.
    t.main_tx(
        "130",
        vec![DataChange::UpdateTableMetadata {
            table: TableId::new("foo", "bar"),
            metadata: TableMetadata {
                row_key: btreemap! { "id".to_owned() => json!("int8") },
            },
        }],
    )
    .await;
    settle().await;

    // The retry timer (2s initial) fires and the second attempt succeeds.
    t.rt.advance_time(Duration::from_secs(2)).await;
    settle().await;
    t.senders[1]
        .send(Ok(chunk("131", &["a"], vec![vec![json!(1)]])))
        .unwrap();
    t.senders[1]
        .send(Ok(completed("131", &["a"], &["id"])))
        .unwrap();
    settle().await;
    t.mux
        .push_status(StatusMessage {
            watermark: watermark("131"),
            ack: false,
        })
        .await
        .unwrap();
    t.senders.clear();
    settle().await;

    let calls = t.streamer.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].has_row_key());
    assert!(t.manager.required_backfills().is_empty());

    let row_key_columns: Vec<_> = drain(&mut source)
        .await
        .into_iter()
        .filter_map(|message| match message {
            ChangeStreamMessage::Data(DataChange::BackfillCompleted(done)) => {
                Some(done.row_key_columns)
            },
            _ => None,
        })
        .collect();
    assert_eq!(row_key_columns, vec![vec!["id".to_owned()]]);
}

#[tokio::test(start_paused = true)]
async fn test_drop_last_column_drops_request_and_cancels() {
    let mut t = BackfillTest::new("123", 1);
    let mut source = t.mux.as_source();

    t.manager.run(vec![request(&["id"], &[("a", 1)])]);
    t.senders[0]
        .send(Ok(chunk("125", &["a"], vec![vec![json!(1)]])))
        .unwrap();
    settle().await;

    let main_tx = t.spawn_main_tx(
        "130",
        vec![DataChange::DropColumn {
            table: TableId::new("foo", "bar"),
            column: "a".to_owned(),
        }],
    );
    settle().await;
    t.rt.advance_time(Duration::from_millis(1)).await;
    t.senders[0]
        .send(Ok(chunk("125", &["a"], vec![vec![json!(2)]])))
        .unwrap();
    settle().await;
    main_tx.await.unwrap();
    t.senders.clear();
    settle().await;

    assert!(t.manager.required_backfills().is_empty());
    // Nothing left to backfill: no second streamer call.
    assert_eq!(t.streamer.calls().len(), 1);
    // The canceled pass committed only its first chunk.
    let kinds: Vec<_> = drain(&mut source).await.iter().map(kind).collect();
    assert_eq!(
        kinds,
        vec!["begin", "backfill", "commit", "begin", "data", "commit"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_add_column_merges_without_cancel() {
    let mut t = BackfillTest::new("123", 2);
    let mut source = t.mux.as_source();

    t.manager.run(vec![request(&["id"], &[("a", 1)])]);
    t.senders[0]
        .send(Ok(chunk("125", &["a"], vec![vec![json!(1)]])))
        .unwrap();
    settle().await;

    let main_tx = t.spawn_main_tx(
        "130",
        vec![DataChange::AddColumn {
            table: table_spec(&["id"]),
            column: "b".to_owned(),
            spec: ColumnSpec { id: 2 },
            backfill: Some(ColumnSpec { id: 2 }),
        }],
    );
    settle().await;
    t.rt.advance_time(Duration::from_millis(1)).await;
    // The completion makes the driver yield to the waiting add-column tx,
    // then finish the pass for column `a` — uncanceled.
    t.senders[0]
        .send(Ok(completed("125", &["a"], &["id"])))
        .unwrap();
    settle().await;
    main_tx.await.unwrap();
    settle().await;

    // End the first feed so its transaction commits; the second pass starts
    // for the merged column `b` and parks on the next (unscripted) feed.
    let first = t.senders.remove(0);
    drop(first);
    settle().await;

    let calls = t.streamer.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1].columns,
        btreemap! { "b".to_owned() => ColumnSpec { id: 2 } }
    );
    must_let!(let Some(req) = t.manager.required_backfills().get(&TableId::new("foo", "bar")).cloned());
    assert!(req.columns.contains_key("b"));

    let kinds: Vec<_> = drain(&mut source).await.iter().map(kind).collect();
    assert_eq!(
        kinds,
        vec![
            "begin",
            "backfill",
            "commit",
            "begin",
            "data",
            "commit",
            "begin",
            "backfill-completed",
            "commit",
        ]
    );
}
