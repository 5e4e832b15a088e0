//! Session: the authoritative document of one live canvas, plus its autosave task.
//!
//! DESIGN
//! ======
//! A `Session` is a cheap, cloneable handle. The registry keeps one per live
//! canvas and every participant of that canvas holds a clone. The document
//! sits behind a per-session async mutex: participant edits and autosave
//! snapshots both take it, so no two writers ever overlap regardless of how
//! their tasks are scheduled. An edit keeps the guard until its broadcast is
//! queued with the registry, which makes fan-out order equal apply order.
//! The registry loop in turn never waits on a live session's guard.
//!
//! Each session runs its own background task, separate from the registry
//! loop, that wakes on a fixed autosave interval or on close. A slow store
//! therefore delays only this canvas's flush, never admission or fan-out.
//!
//! ERROR HANDLING
//! ==============
//! A failed flush is logged and counted. The in-memory document stays
//! authoritative and the next tick retries with the then-current state.
//! Retries are unlimited at the fixed interval; `consecutive_failures`
//! exposes how long the store has been failing. The close flush runs once,
//! and the task ends whether it succeeded or not.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::document::{Applied, CanvasId, DocumentState};
use crate::message::{Operation, WireMessage};
use crate::services::participant::ParticipantId;
use crate::services::registry::{Registry, RegistryError};
use crate::services::store::{self, CanvasStore, PersistenceError, UserId};

pub type SessionId = Uuid;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: SessionId,
    canvas_id: CanvasId,
    owner: UserId,
    document: Mutex<DocumentState>,
    closed: Notify,
    stats: SessionStats,
}

#[derive(Default)]
struct SessionStats {
    autosave_attempts: AtomicU64,
    autosave_failures: AtomicU64,
    consecutive_failures: AtomicU64,
    /// Milliseconds since Unix epoch; 0 until the first successful flush.
    last_saved_at: AtomicI64,
    stale_edits: AtomicU64,
}

/// Point-in-time copy of a session's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatsSnapshot {
    pub autosave_attempts: u64,
    pub autosave_failures: u64,
    pub consecutive_failures: u64,
    pub last_saved_at: Option<i64>,
    /// Edits that referenced a piece index outside the current document.
    pub stale_edits: u64,
}

// =============================================================================
// LIFECYCLE
// =============================================================================

impl Session {
    /// Create a session around `document` and start its autosave task.
    ///
    /// The returned handle resolves once the session has been closed and its
    /// final flush has finished.
    pub fn start(
        canvas_id: CanvasId,
        owner: UserId,
        document: DocumentState,
        store: Arc<dyn CanvasStore>,
        autosave_interval: Duration,
    ) -> (Self, JoinHandle<()>) {
        let session = Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                canvas_id,
                owner,
                document: Mutex::new(document),
                closed: Notify::new(),
                stats: SessionStats::default(),
            }),
        };
        let task = tokio::spawn(run_autosave(session.clone(), store, autosave_interval));
        info!(%canvas_id, session_id = %session.id(), "session started");
        (session, task)
    }

    /// Signal the autosave task to flush one last time and stop.
    pub fn close(&self) {
        // notify_one stores a permit, so a close issued mid-flush is not lost.
        self.inner.closed.notify_one();
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    #[must_use]
    pub fn canvas_id(&self) -> CanvasId {
        self.inner.canvas_id
    }

    #[must_use]
    pub fn owner(&self) -> UserId {
        self.inner.owner
    }

    /// Clone of the current document.
    pub async fn document(&self) -> DocumentState {
        self.inner.document.lock().await.clone()
    }

    #[must_use]
    pub fn stats(&self) -> SessionStatsSnapshot {
        let stats = &self.inner.stats;
        let last_saved_at = stats.last_saved_at.load(Ordering::Relaxed);
        SessionStatsSnapshot {
            autosave_attempts: stats.autosave_attempts.load(Ordering::Relaxed),
            autosave_failures: stats.autosave_failures.load(Ordering::Relaxed),
            consecutive_failures: stats.consecutive_failures.load(Ordering::Relaxed),
            last_saved_at: (last_saved_at > 0).then_some(last_saved_at),
            stale_edits: stats.stale_edits.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// EDITS
// =============================================================================

impl Session {
    /// Apply one decoded operation on behalf of `actor` and queue the result
    /// for every other participant. Returns the message that was queued, if
    /// any.
    ///
    /// The broadcast is handed to the registry while the document guard is
    /// still held. The registry's command queue is FIFO, so peers receive
    /// edits in exactly the order they were applied here.
    ///
    /// Piece edits are relayed as received. `update-canvas-data` relays the
    /// merged canvas fields instead of the raw request, because a non-owner's
    /// name change is dropped here. Stale index edits change nothing and are
    /// not relayed.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Closed` if the registry loop has stopped. The
    /// edit itself has already been applied at that point.
    pub async fn apply(
        &self,
        actor: UserId,
        origin: ParticipantId,
        message: WireMessage,
        op: Operation,
        registry: &Registry,
    ) -> Result<Option<WireMessage>, RegistryError> {
        let mut document = self.inner.document.lock().await;
        let Some(outbound) = self.apply_to(&mut document, actor, message, op) else {
            return Ok(None);
        };
        registry.broadcast(self.inner.canvas_id, origin, outbound.clone()).await?;
        Ok(Some(outbound))
    }

    fn apply_to(
        &self,
        document: &mut DocumentState,
        actor: UserId,
        message: WireMessage,
        op: Operation,
    ) -> Option<WireMessage> {
        let canvas_id = self.inner.canvas_id;
        let applied = match op {
            Operation::Get(_) => return Some(message),
            Operation::AddPiece(piece) => {
                document.add_piece(piece);
                Applied::Changed
            }
            Operation::UpdatePiece { index, piece } => document.update_piece(index, piece),
            Operation::RemovePiece { index } => document.remove_piece(index),
            Operation::UpdateCanvasData(patch) => {
                let may_rename = actor == self.inner.owner;
                if patch.name.is_some() && !may_rename {
                    debug!(%canvas_id, %actor, "ignoring canvas rename from non-owner");
                }
                document.update_canvas_data(&patch, may_rename);
                let merged = serde_json::to_value(document.canvas_data()).unwrap_or(Value::Null);
                return Some(message.with_data(merged));
            }
        };

        match applied {
            Applied::Changed => Some(message),
            Applied::OutOfRange { index, len } => {
                self.inner.stats.stale_edits.fetch_add(1, Ordering::Relaxed);
                warn!(%canvas_id, %actor, event = %message.event, index, len, "stale piece index; edit ignored");
                None
            }
        }
    }
}

// =============================================================================
// AUTOSAVE
// =============================================================================

async fn run_autosave(session: Session, store: Arc<dyn CanvasStore>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = session.inner.closed.notified() => {
                let _ = session.flush(store.as_ref()).await;
                break;
            }
            _ = ticker.tick() => {
                let _ = session.flush(store.as_ref()).await;
            }
        }
    }

    info!(canvas_id = %session.canvas_id(), session_id = %session.id(), "session closed");
}

impl Session {
    /// Persist a snapshot of the current document through one scoped write.
    ///
    /// The document lock is held only while cloning, never across store I/O.
    pub(crate) async fn flush(&self, store: &dyn CanvasStore) -> Result<(), PersistenceError> {
        let stats = &self.inner.stats;
        stats.autosave_attempts.fetch_add(1, Ordering::Relaxed);

        let snapshot = self.document().await;
        let result = store::save_document(store, self.inner.owner, self.inner.canvas_id, &snapshot).await;
        match &result {
            Ok(()) => {
                stats.consecutive_failures.store(0, Ordering::Relaxed);
                stats.last_saved_at.store(now_ms(), Ordering::Relaxed);
                debug!(canvas_id = %self.inner.canvas_id, pieces = snapshot.pieces().len(), "autosave flushed");
            }
            Err(e) => {
                stats.autosave_failures.fetch_add(1, Ordering::Relaxed);
                let consecutive = stats.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(error = %e, canvas_id = %self.inner.canvas_id, consecutive, "autosave failed; will retry next tick");
            }
        }
        result
    }
}

fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
