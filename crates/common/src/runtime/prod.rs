use std::{
    future::Future,
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    future::BoxFuture,
    FutureExt,
};
use rand::RngCore;
use tokio::time::Instant;

use super::{
    JoinError,
    Runtime,
    SpawnHandle,
};

/// The production runtime: plain tokio.
#[derive(Clone)]
pub struct ProdRuntime {
    handle: tokio::runtime::Handle,
}

impl ProdRuntime {
    /// Capture the ambient tokio runtime. Panics outside of one.
    pub fn new() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

pub struct TokioSpawnHandle {
    name: &'static str,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TokioSpawnHandle {
    pub fn new(name: &'static str, handle: tokio::task::JoinHandle<()>) -> Self {
        Self {
            name,
            handle: Some(handle),
        }
    }
}

impl SpawnHandle for TokioSpawnHandle {
    fn shutdown(&mut self) {
        if let Some(ref handle) = self.handle {
            handle.abort();
        }
    }

    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        async move {
            let handle = self
                .handle
                .take()
                .unwrap_or_else(|| panic!("Joined task {} twice", self.name));
            handle.await.map_err(JoinError::from)
        }
        .boxed()
    }
}

#[async_trait]
impl Runtime for ProdRuntime {
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        let handle = self.handle.spawn(f);
        Box::new(TokioSpawnHandle {
            name,
            handle: Some(handle),
        })
    }

    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut dyn RngCore) -> R) -> R {
        f(&mut rand::rng())
    }
}
