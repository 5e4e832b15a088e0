//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the registry handle and the persistence gateway. Both are built
//! once in `main` and passed in explicitly, so tests can build a fresh pair
//! per case.

use std::sync::Arc;

use crate::services::registry::Registry;
use crate::services::store::CanvasStore;

/// Clone is required by Axum; all inner fields are cheap handles.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub store: Arc<dyn CanvasStore>,
}

impl AppState {
    #[must_use]
    pub fn new(registry: Registry, store: Arc<dyn CanvasStore>) -> Self {
        Self { registry, store }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use uuid::Uuid;

    use super::*;
    use crate::document::{CanvasId, DocumentState, Extents, Piece, PieceSettings, Transform};
    use crate::services::registry::RegistryConfig;
    use crate::services::store::{CanvasRecord, PersistenceError, ScopedWrite, UserId};

    /// One committed save.
    #[derive(Debug, Clone)]
    pub struct SavedDocument {
        pub canvas_id: CanvasId,
        pub identity: UserId,
        pub document: DocumentState,
    }

    #[derive(Default)]
    struct MemoryInner {
        canvases: HashMap<CanvasId, CanvasRecord>,
        shared: HashSet<(CanvasId, UserId)>,
        tickets: HashMap<String, UserId>,
        saves: Vec<SavedDocument>,
        rollbacks: usize,
        fail_saves: bool,
        fail_loads: bool,
        save_delay: Option<Duration>,
    }

    /// In-memory `CanvasStore` with failure injection.
    #[derive(Clone, Default)]
    pub struct MemoryStore {
        inner: Arc<Mutex<MemoryInner>>,
        committed: Arc<Notify>,
    }

    impl MemoryStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert_canvas(&self, canvas_id: CanvasId, owner: UserId, document: DocumentState) {
            let mut inner = self.inner.lock().expect("store mutex should lock");
            inner.canvases.insert(canvas_id, CanvasRecord { canvas_id, owner, document });
        }

        pub fn share(&self, canvas_id: CanvasId, user_id: UserId) {
            self.inner.lock().expect("store mutex should lock").shared.insert((canvas_id, user_id));
        }

        pub fn issue_ticket(&self, ticket: &str, user_id: UserId) {
            self.inner
                .lock()
                .expect("store mutex should lock")
                .tickets
                .insert(ticket.to_owned(), user_id);
        }

        pub fn set_fail_saves(&self, fail: bool) {
            self.inner.lock().expect("store mutex should lock").fail_saves = fail;
        }

        pub fn set_fail_loads(&self, fail: bool) {
            self.inner.lock().expect("store mutex should lock").fail_loads = fail;
        }

        /// Delay every save by `delay` (real time unless the clock is paused).
        pub fn set_save_delay(&self, delay: Duration) {
            self.inner.lock().expect("store mutex should lock").save_delay = Some(delay);
        }

        #[must_use]
        pub fn saves(&self) -> Vec<SavedDocument> {
            self.inner.lock().expect("store mutex should lock").saves.clone()
        }

        #[must_use]
        pub fn rollbacks(&self) -> usize {
            self.inner.lock().expect("store mutex should lock").rollbacks
        }

        /// Wait until at least `count` saves have been committed.
        pub async fn wait_for_saves(&self, count: usize, within: Duration) -> bool {
            let deadline = tokio::time::Instant::now() + within;
            loop {
                let committed = self.committed.notified();
                if self.saves().len() >= count {
                    return true;
                }
                if tokio::time::timeout_at(deadline, committed).await.is_err() {
                    return self.saves().len() >= count;
                }
            }
        }

        fn can_access(inner: &MemoryInner, canvas_id: CanvasId, user_id: UserId) -> bool {
            inner
                .canvases
                .get(&canvas_id)
                .is_some_and(|c| c.owner == user_id || inner.shared.contains(&(canvas_id, user_id)))
        }
    }

    struct MemoryWrite {
        store: MemoryStore,
        identity: UserId,
        pending: Vec<(CanvasId, DocumentState)>,
    }

    #[async_trait]
    impl CanvasStore for MemoryStore {
        async fn consume_ws_ticket(&self, ticket: &str) -> Result<Option<UserId>, PersistenceError> {
            Ok(self.inner.lock().expect("store mutex should lock").tickets.remove(ticket))
        }

        async fn load_canvas(
            &self,
            user_id: UserId,
            canvas_id: CanvasId,
        ) -> Result<Option<CanvasRecord>, PersistenceError> {
            let inner = self.inner.lock().expect("store mutex should lock");
            if inner.fail_loads {
                return Err(PersistenceError::Unavailable("injected failure".into()));
            }
            if !Self::can_access(&inner, canvas_id, user_id) {
                return Ok(None);
            }
            Ok(inner.canvases.get(&canvas_id).cloned())
        }

        async fn begin_scoped_write(&self, identity: UserId) -> Result<Box<dyn ScopedWrite>, PersistenceError> {
            Ok(Box::new(MemoryWrite { store: self.clone(), identity, pending: Vec::new() }))
        }
    }

    #[async_trait]
    impl ScopedWrite for MemoryWrite {
        async fn save(&mut self, canvas_id: CanvasId, document: &DocumentState) -> Result<(), PersistenceError> {
            let delay = self.store.inner.lock().expect("store mutex should lock").save_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let inner = self.store.inner.lock().expect("store mutex should lock");
            if inner.fail_saves {
                return Err(PersistenceError::Unavailable("injected failure".into()));
            }
            if !MemoryStore::can_access(&inner, canvas_id, self.identity) {
                return Err(PersistenceError::NotFound(canvas_id));
            }
            self.pending.push((canvas_id, document.clone()));
            Ok(())
        }

        async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
            {
                let mut inner = self.store.inner.lock().expect("store mutex should lock");
                for (canvas_id, document) in self.pending {
                    if let Some(record) = inner.canvases.get_mut(&canvas_id) {
                        record.document = document.clone();
                    }
                    inner.saves.push(SavedDocument { canvas_id, identity: self.identity, document });
                }
            }
            self.store.committed.notify_waiters();
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<(), PersistenceError> {
            self.store.inner.lock().expect("store mutex should lock").rollbacks += 1;
            Ok(())
        }
    }

    /// Registry config with small queues for tests.
    #[must_use]
    pub fn test_registry_config() -> RegistryConfig {
        RegistryConfig { participant_queue_capacity: 8, command_queue_capacity: 64, ..RegistryConfig::default() }
    }

    /// Build an `AppState` over `store` with a fresh registry.
    #[must_use]
    pub fn test_app_state(store: &MemoryStore) -> AppState {
        let store: Arc<dyn CanvasStore> = Arc::new(store.clone());
        AppState::new(Registry::spawn(Arc::clone(&store), test_registry_config()), store)
    }

    #[must_use]
    pub fn record(canvas_id: CanvasId, owner: UserId) -> CanvasRecord {
        CanvasRecord { canvas_id, owner, document: named_document("Untitled") }
    }

    #[must_use]
    pub fn named_document(name: &str) -> DocumentState {
        DocumentState { name: name.into(), background_color: "#ffffff".into(), ..DocumentState::default() }
    }

    #[must_use]
    pub fn dummy_piece(path: &str) -> Piece {
        Piece {
            settings: PieceSettings { size: 2, color: "#000000".into() },
            path: path.into(),
            transform: Transform::default(),
            extents: Extents { left_most: Some(0.0), right_most: Some(10.0), top_most: Some(0.0), bottom_most: Some(10.0) },
        }
    }

    #[must_use]
    pub fn new_user() -> UserId {
        Uuid::new_v4()
    }
}
