//! In-memory reference implementation of the client-table store, used by
//! tests and by the stock single-process deployment.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    PushDatabase,
    PushTransaction,
};

type ClientKey = (String, String);

#[derive(Default)]
pub struct MemoryPushDatabase {
    clients: Arc<Mutex<BTreeMap<ClientKey, u64>>>,
}

impl MemoryPushDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_mutation_id(&self, client_group_id: &str, client_id: &str) -> Option<u64> {
        self.clients
            .lock()
            .get(&(client_group_id.to_owned(), client_id.to_owned()))
            .copied()
    }
}

struct MemoryTransaction {
    clients: Arc<Mutex<BTreeMap<ClientKey, u64>>>,
    /// Writes staged by this transaction, applied on commit.
    staged: BTreeMap<ClientKey, u64>,
}

#[async_trait]
impl PushTransaction for MemoryTransaction {
    async fn increment_last_mutation_id(
        &mut self,
        client_group_id: &str,
        client_id: &str,
    ) -> anyhow::Result<u64> {
        let key = (client_group_id.to_owned(), client_id.to_owned());
        let current = match self.staged.get(&key) {
            Some(staged) => Some(*staged),
            None => self.clients.lock().get(&key).copied(),
        };
        let next = match current {
            None => 1,
            Some(current) => current + 1,
        };
        self.staged.insert(key, next);
        Ok(next)
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        let mut clients = self.clients.lock();
        for (key, value) in self.staged {
            clients.insert(key, value);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl PushDatabase for MemoryPushDatabase {
    async fn begin(&self) -> anyhow::Result<Box<dyn PushTransaction>> {
        Ok(Box::new(MemoryTransaction {
            clients: self.clients.clone(),
            staged: BTreeMap::new(),
        }))
    }
}
