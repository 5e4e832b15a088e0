//! Persistence gateway: canvas lookup, ticket consumption, scoped writes.
//!
//! DESIGN
//! ======
//! Sessions never talk to Postgres directly. They go through `CanvasStore`,
//! which hands out a `ScopedWrite` bound to one identity: every save inside
//! it is checked against that identity's access to the canvas, and the whole
//! write commits or rolls back as one transaction.
//!
//! The same trait also produces the admission precondition for the
//! websocket route (ticket → identity, identity + canvas → record), so the
//! route and the engine can run against an in-memory store in tests.
//!
//! ERROR HANDLING
//! ==============
//! Errors are returned, never logged here. Callers decide whether a failure
//! is a rejected connection (route) or a retry-on-next-tick (autosave).

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::document::{CanvasId, DocumentState};

/// Verified identity of a user.
pub type UserId = Uuid;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode canvas data: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("stored canvas {canvas_id} is not a valid document: {source}")]
    CorruptCanvas {
        canvas_id: CanvasId,
        #[source]
        source: serde_json::Error,
    },
    #[error("canvas {0} not found or not writable")]
    NotFound(CanvasId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A canvas as loaded for admission: who owns it and what it contains.
#[derive(Debug, Clone)]
pub struct CanvasRecord {
    pub canvas_id: CanvasId,
    pub owner: UserId,
    pub document: DocumentState,
}

#[async_trait]
pub trait CanvasStore: Send + Sync {
    /// Consume a one-time websocket ticket, returning the identity it was
    /// issued to. Expired or unknown tickets yield `None`.
    async fn consume_ws_ticket(&self, ticket: &str) -> Result<Option<UserId>, PersistenceError>;

    /// Load a canvas the user owns or has been granted shared access to.
    async fn load_canvas(&self, user_id: UserId, canvas_id: CanvasId) -> Result<Option<CanvasRecord>, PersistenceError>;

    /// Open a write transaction scoped to `identity`.
    async fn begin_scoped_write(&self, identity: UserId) -> Result<Box<dyn ScopedWrite>, PersistenceError>;
}

#[async_trait]
pub trait ScopedWrite: Send {
    async fn save(&mut self, canvas_id: CanvasId, document: &DocumentState) -> Result<(), PersistenceError>;

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError>;

    async fn rollback(self: Box<Self>) -> Result<(), PersistenceError>;
}

/// Save one document inside its own scoped write. Rolls back if the save
/// fails; a rollback failure is secondary and only the save error is returned.
///
/// # Errors
///
/// Returns the first error from begin, save, or commit.
pub async fn save_document(
    store: &dyn CanvasStore,
    identity: UserId,
    canvas_id: CanvasId,
    document: &DocumentState,
) -> Result<(), PersistenceError> {
    let mut write = store.begin_scoped_write(identity).await?;
    if let Err(e) = write.save(canvas_id, document).await {
        if let Err(rollback) = write.rollback().await {
            tracing::debug!(error = %rollback, %canvas_id, "rollback after failed save also failed");
        }
        return Err(e);
    }
    write.commit().await
}

// =============================================================================
// POSTGRES
// =============================================================================

const ACCESS_CHECK: &str = "(c.user_uuid = $2 OR EXISTS (
        SELECT 1
        FROM canvas_shared_accesses csa
        WHERE csa.canvas_id = c.id AND csa.user_uuid = $2 AND csa.deleted_at IS NULL
    ))";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

struct PgScopedWrite {
    tx: Transaction<'static, Postgres>,
    identity: UserId,
}

#[async_trait]
impl CanvasStore for PgStore {
    async fn consume_ws_ticket(&self, ticket: &str) -> Result<Option<UserId>, PersistenceError> {
        let user_id = sqlx::query_scalar::<_, Uuid>(
            "DELETE FROM ws_tickets WHERE ticket = $1 AND expires_at > now() RETURNING user_id",
        )
        .bind(ticket)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user_id)
    }

    async fn load_canvas(&self, user_id: UserId, canvas_id: CanvasId) -> Result<Option<CanvasRecord>, PersistenceError> {
        let row = sqlx::query_as::<_, (Uuid, Option<serde_json::Value>)>(&format!(
            "SELECT c.user_uuid, c.canvas_data
             FROM canvases c
             WHERE c.id = $1 AND c.deleted_at IS NULL AND {ACCESS_CHECK}"
        ))
        .bind(canvas_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((owner, data)) = row else {
            return Ok(None);
        };
        let document = match data {
            None | Some(serde_json::Value::Null) => DocumentState::default(),
            Some(value) => serde_json::from_value(value)
                .map_err(|source| PersistenceError::CorruptCanvas { canvas_id, source })?,
        };
        Ok(Some(CanvasRecord { canvas_id, owner, document }))
    }

    async fn begin_scoped_write(&self, identity: UserId) -> Result<Box<dyn ScopedWrite>, PersistenceError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgScopedWrite { tx, identity }))
    }
}

#[async_trait]
impl ScopedWrite for PgScopedWrite {
    async fn save(&mut self, canvas_id: CanvasId, document: &DocumentState) -> Result<(), PersistenceError> {
        let data = serde_json::to_value(document).map_err(PersistenceError::Encode)?;
        let result = sqlx::query(&format!(
            "UPDATE canvases c
             SET canvas_data = $3, updated_at = now()
             WHERE c.id = $1 AND c.deleted_at IS NULL AND {ACCESS_CHECK}"
        ))
        .bind(canvas_id)
        .bind(self.identity)
        .bind(data)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound(canvas_id));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), PersistenceError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
