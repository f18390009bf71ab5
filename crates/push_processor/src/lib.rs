//! The mutation executor that runs on the user's API server, behind the
//! push endpoint. It is the other half of the pusher's ordering contract:
//! per client, mutations commit in `id` order exactly once, enforced by the
//! last-mutation-id (LMID) counter in the `clients` table.
//!
//! Mutations are processed sequentially, never in parallel: a mutation's
//! effects may be read by the next one.

mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use sync_types::{
    Mutation,
    MutationId,
    MutationResponse,
    MutationResult,
    PushBody,
    PushOk,
};

pub use memory::MemoryPushDatabase;

/// One database transaction scoped to a single mutation.
#[async_trait]
pub trait PushTransaction: Send {
    /// Upsert the row for `(client_group_id, client_id)` with an initial
    /// LMID of 1, or increment it by 1 on conflict, returning the new value.
    async fn increment_last_mutation_id(
        &mut self,
        client_group_id: &str,
        client_id: &str,
    ) -> anyhow::Result<u64>;

    async fn commit(self: Box<Self>) -> anyhow::Result<()>;

    async fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PushDatabase: Send + Sync + 'static {
    async fn begin(&self) -> anyhow::Result<Box<dyn PushTransaction>>;
}

/// Hooks a mutator can register during dispatch; they run after the
/// transaction commits.
#[derive(Default)]
pub struct PostCommitTasks {
    tasks: Vec<BoxFuture<'static, ()>>,
}

impl PostCommitTasks {
    pub fn after(&mut self, task: BoxFuture<'static, ()>) {
        self.tasks.push(task);
    }
}

/// The user's mutator implementation: one named function per mutation kind.
#[async_trait]
pub trait Mutator: Send + Sync + 'static {
    async fn apply(
        &self,
        tx: &mut dyn PushTransaction,
        mutation: &Mutation,
        post_commit: &mut PostCommitTasks,
    ) -> anyhow::Result<()>;
}

/// Whether post-commit tasks are awaited inline or tracked for `close()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    Synchronous,
    Asynchronous,
}

pub struct PushProcessor {
    db: Arc<dyn PushDatabase>,
    mutator: Arc<dyn Mutator>,
    mode: TaskMode,
    pending: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl PushProcessor {
    pub fn new(db: Arc<dyn PushDatabase>, mutator: Arc<dyn Mutator>, mode: TaskMode) -> Self {
        Self {
            db,
            mutator,
            mode,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Process a received push sequentially. Stops at the first
    /// out-of-order mutation, whose error entry terminates the response.
    pub async fn process_push(&self, push: &PushBody) -> anyhow::Result<PushOk> {
        let mut responses = Vec::with_capacity(push.mutations.len());
        for mutation in &push.mutations {
            let id = MutationId {
                client_id: mutation.client_id.clone(),
                id: mutation.id,
            };
            let result = self
                .process_mutation(&push.client_group_id, mutation)
                .await?;
            let stop = result.is_ooo_mutation();
            responses.push(MutationResponse { id, result });
            if stop {
                break;
            }
        }
        Ok(PushOk {
            mutations: responses,
        })
    }

    async fn process_mutation(
        &self,
        client_group_id: &str,
        mutation: &Mutation,
    ) -> anyhow::Result<MutationResult> {
        let mut tx = self.db.begin().await?;
        let stored = tx
            .increment_last_mutation_id(client_group_id, &mutation.client_id)
            .await?;
        if mutation.id < stored {
            // Replay of an already-committed mutation: leave the LMID
            // untouched and answer with an empty result.
            tx.rollback().await?;
            return Ok(MutationResult::already_processed());
        }
        if mutation.id > stored {
            tx.rollback().await?;
            tracing::warn!(
                "Mutation {}:{} arrived out of order (expected {stored})",
                mutation.client_id,
                mutation.id
            );
            return Ok(MutationResult::ooo_mutation());
        }
        let mut post_commit = PostCommitTasks::default();
        match self
            .mutator
            .apply(tx.as_mut(), mutation, &mut post_commit)
            .await
        {
            Ok(()) => {
                tx.commit().await?;
                self.schedule_post_commit(post_commit).await;
                Ok(MutationResult::Ok {})
            },
            Err(app_error) => {
                // The mutator's writes are discarded, but the LMID must
                // still advance so the client does not retry forever:
                // replay the increment alone in a fresh transaction.
                tx.rollback().await?;
                let mut error_tx = self.db.begin().await?;
                let replayed = error_tx
                    .increment_last_mutation_id(client_group_id, &mutation.client_id)
                    .await?;
                anyhow::ensure!(
                    replayed == mutation.id,
                    "LMID moved ({replayed} != {}) while replaying a failed mutation",
                    mutation.id
                );
                error_tx.commit().await?;
                Ok(MutationResult::app_error(format!("{app_error:#}")))
            },
        }
    }

    async fn schedule_post_commit(&self, post_commit: PostCommitTasks) {
        match self.mode {
            TaskMode::Synchronous => {
                for task in post_commit.tasks {
                    task.await;
                }
            },
            TaskMode::Asynchronous => {
                let mut pending = self.pending.lock();
                for task in post_commit.tasks {
                    pending.push(tokio::spawn(task));
                }
            },
        }
    }

    /// Await all tracked post-commit tasks (asynchronous mode).
    pub async fn close(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for handle in pending {
            if let Err(e) = handle.await {
                tracing::error!("Post-commit task panicked: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    };

    use async_trait::async_trait;
    use futures::FutureExt;
    use must_let::must_let;
    use parking_lot::Mutex;
    use serde_json::json;
    use sync_types::{
        Mutation,
        MutationResult,
        PushBody,
        PUSH_VERSION,
    };

    use crate::{
        MemoryPushDatabase,
        Mutator,
        PostCommitTasks,
        PushProcessor,
        PushTransaction,
        TaskMode,
    };

    struct TestMutator {
        applied: Mutex<Vec<(String, u64)>>,
        fail_names: Vec<&'static str>,
    }

    impl TestMutator {
        fn new(fail_names: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                applied: Mutex::new(Vec::new()),
                fail_names,
            })
        }
    }

    #[async_trait]
    impl Mutator for TestMutator {
        async fn apply(
            &self,
            _tx: &mut dyn PushTransaction,
            mutation: &Mutation,
            _post_commit: &mut PostCommitTasks,
        ) -> anyhow::Result<()> {
            if self.fail_names.contains(&mutation.name.as_str()) {
                anyhow::bail!("mutator rejected {}", mutation.name);
            }
            self.applied
                .lock()
                .push((mutation.client_id.clone(), mutation.id));
            Ok(())
        }
    }

    fn mutation(client_id: &str, id: u64, name: &str) -> Mutation {
        Mutation {
            client_id: client_id.to_owned(),
            id,
            name: name.to_owned(),
            args: json!({}),
            timestamp: 0.0,
        }
    }

    fn push(mutations: Vec<Mutation>) -> PushBody {
        PushBody {
            client_group_id: "g1".to_owned(),
            mutations,
            push_version: PUSH_VERSION,
            schema_version: None,
            timestamp: 0.0,
            request_id: "req-1".to_owned(),
        }
    }

    #[tokio::test]
    async fn test_contiguous_ids_commit_in_order() -> anyhow::Result<()> {
        let db = Arc::new(MemoryPushDatabase::new());
        let mutator = TestMutator::new(vec![]);
        let processor = PushProcessor::new(db.clone(), mutator.clone(), TaskMode::Synchronous);

        let response = processor
            .process_push(&push(vec![
                mutation("c1", 1, "a"),
                mutation("c1", 2, "b"),
                mutation("c2", 1, "c"),
            ]))
            .await?;
        assert!(response.mutations.iter().all(|r| r.result.is_ok()));
        assert_eq!(
            *mutator.applied.lock(),
            vec![
                ("c1".to_owned(), 1),
                ("c1".to_owned(), 2),
                ("c2".to_owned(), 1),
            ]
        );
        assert_eq!(db.last_mutation_id("g1", "c1"), Some(2));
        assert_eq!(db.last_mutation_id("g1", "c2"), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() -> anyhow::Result<()> {
        let db = Arc::new(MemoryPushDatabase::new());
        let mutator = TestMutator::new(vec![]);
        let processor = PushProcessor::new(db.clone(), mutator.clone(), TaskMode::Synchronous);

        let first = processor
            .process_push(&push(vec![mutation("c1", 1, "a")]))
            .await?;
        must_let!(let MutationResult::Ok {} = &first.mutations[0].result);

        // The identical mutation replays silently and does not re-dispatch.
        let second = processor
            .process_push(&push(vec![mutation("c1", 1, "a")]))
            .await?;
        must_let!(let MutationResult::Ok {} = &second.mutations[0].result);
        assert_eq!(mutator.applied.lock().len(), 1);
        assert_eq!(db.last_mutation_id("g1", "c1"), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_gap_stops_processing() -> anyhow::Result<()> {
        let db = Arc::new(MemoryPushDatabase::new());
        let mutator = TestMutator::new(vec![]);
        let processor = PushProcessor::new(db.clone(), mutator.clone(), TaskMode::Synchronous);

        let response = processor
            .process_push(&push(vec![
                mutation("c1", 1, "a"),
                mutation("c1", 3, "b"),
                mutation("c1", 4, "c"),
            ]))
            .await?;
        // id 3 skips over 2: out of order, and nothing after it ran.
        assert_eq!(response.mutations.len(), 2);
        assert!(response.mutations[0].result.is_ok());
        assert!(response.mutations[1].result.is_ooo_mutation());
        assert_eq!(mutator.applied.lock().len(), 1);
        assert_eq!(db.last_mutation_id("g1", "c1"), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_mutator_error_still_advances_lmid() -> anyhow::Result<()> {
        let db = Arc::new(MemoryPushDatabase::new());
        let mutator = TestMutator::new(vec!["boom"]);
        let processor = PushProcessor::new(db.clone(), mutator.clone(), TaskMode::Synchronous);

        let response = processor
            .process_push(&push(vec![
                mutation("c1", 1, "boom"),
                mutation("c1", 2, "ok"),
            ]))
            .await?;
        must_let!(let MutationResult::Error { error, .. } = &response.mutations[0].result);
        assert_eq!(error, "app");
        // The failed mutation consumed id 1, so id 2 still applies.
        assert!(response.mutations[1].result.is_ok());
        assert_eq!(*mutator.applied.lock(), vec![("c1".to_owned(), 2)]);
        assert_eq!(db.last_mutation_id("g1", "c1"), Some(2));
        Ok(())
    }

    struct PostCommitMutator {
        ran: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Mutator for PostCommitMutator {
        async fn apply(
            &self,
            _tx: &mut dyn PushTransaction,
            _mutation: &Mutation,
            post_commit: &mut PostCommitTasks,
        ) -> anyhow::Result<()> {
            let ran = self.ran.clone();
            post_commit.after(
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                }
                .boxed(),
            );
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_post_commit_tasks_sync_and_async() -> anyhow::Result<()> {
        let ran = Arc::new(AtomicUsize::new(0));
        let db = Arc::new(MemoryPushDatabase::new());
        let processor = PushProcessor::new(
            db.clone(),
            Arc::new(PostCommitMutator { ran: ran.clone() }),
            TaskMode::Synchronous,
        );
        processor
            .process_push(&push(vec![mutation("c1", 1, "a")]))
            .await?;
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let processor = PushProcessor::new(
            db,
            Arc::new(PostCommitMutator { ran: ran.clone() }),
            TaskMode::Asynchronous,
        );
        processor
            .process_push(&push(vec![mutation("c1", 2, "a")]))
            .await?;
        // Tracked, not necessarily settled, until close().
        processor.close().await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        Ok(())
    }
}
