//! Worker-wide registry of client groups that have authenticated for
//! inspector access.
//!
//! The set is shared by every connection's inspector delegate in the worker.
//! It lives behind an explicit constructor rather than ambient module state
//! so tests (and multi-tenant embeddings) can scope it.

use std::{
    collections::HashSet,
    sync::Arc,
};

use parking_lot::Mutex;

#[derive(Default)]
pub struct InspectorRegistry {
    authenticated: Mutex<HashSet<String>>,
}

impl InspectorRegistry {
    /// One per worker process, created at worker startup and handed to every
    /// connection.
    pub fn init() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn authenticate(&self, client_group_id: &str) {
        self.authenticated
            .lock()
            .insert(client_group_id.to_owned());
    }

    pub fn is_authenticated(&self, client_group_id: &str) -> bool {
        self.authenticated.lock().contains(client_group_id)
    }

    pub fn revoke(&self, client_group_id: &str) {
        self.authenticated.lock().remove(client_group_id);
    }
}

#[cfg(test)]
mod tests {
    use super::InspectorRegistry;

    #[test]
    fn test_registry_scoped_per_instance() {
        let a = InspectorRegistry::init();
        let b = InspectorRegistry::init();
        a.authenticate("g1");
        assert!(a.is_authenticated("g1"));
        assert!(!b.is_authenticated("g1"));
        a.revoke("g1");
        assert!(!a.is_authenticated("g1"));
    }
}
