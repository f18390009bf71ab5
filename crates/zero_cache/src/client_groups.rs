//! Client-group registry for a syncer worker. A group is created on its
//! first connection and destroyed when the last one releases it; the
//! `AuthSession` and `PusherService` live exactly as long as the group.

use std::{
    collections::HashMap,
    sync::Arc,
};

use common::runtime::prod::ProdRuntime;
use parking_lot::Mutex;
use sync::{
    AuthSession,
    FetchClient,
    PusherConfig,
    PusherService,
    TokenValidator,
};

struct ClientGroup {
    auth: Arc<tokio::sync::Mutex<AuthSession>>,
    pusher: PusherService<ProdRuntime>,
    connections: usize,
}

pub struct ClientGroups {
    rt: ProdRuntime,
    pusher_config: PusherConfig,
    fetch: Arc<dyn FetchClient>,
    validator: Option<Arc<dyn TokenValidator>>,
    groups: Mutex<HashMap<String, ClientGroup>>,
}

impl ClientGroups {
    pub fn new(
        rt: ProdRuntime,
        pusher_config: PusherConfig,
        fetch: Arc<dyn FetchClient>,
        validator: Option<Arc<dyn TokenValidator>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rt,
            pusher_config,
            fetch,
            validator,
            groups: Mutex::new(HashMap::new()),
        })
    }

    pub fn acquire(
        &self,
        client_group_id: &str,
    ) -> (Arc<tokio::sync::Mutex<AuthSession>>, PusherService<ProdRuntime>) {
        let mut groups = self.groups.lock();
        let group = groups
            .entry(client_group_id.to_owned())
            .or_insert_with(|| ClientGroup {
                auth: Arc::new(tokio::sync::Mutex::new(AuthSession::new(
                    self.validator.clone(),
                ))),
                pusher: PusherService::new(
                    self.rt.clone(),
                    self.pusher_config.clone(),
                    self.fetch.clone(),
                ),
                connections: 0,
            });
        group.connections += 1;
        (group.auth.clone(), group.pusher.clone())
    }

    pub fn release(&self, client_group_id: &str) {
        let mut groups = self.groups.lock();
        let remove = match groups.get_mut(client_group_id) {
            Some(group) => {
                group.connections = group.connections.saturating_sub(1);
                group.connections == 0
            },
            None => false,
        };
        if remove {
            groups.remove(client_group_id);
            tracing::debug!("Client group {client_group_id} released");
        }
    }
}
