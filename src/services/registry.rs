//! Session registry: the single owner of the canvas → session directory.
//!
//! DESIGN
//! ======
//! `Registry` is a cloneable handle to one spawned control loop. Admit,
//! remove and broadcast are commands sent over a channel and handled one at
//! a time, so the directory and each session's membership are only ever
//! touched from that loop. Two joins racing for a canvas with no session
//! are serialized here and produce exactly one session.
//!
//! LIFECYCLE
//! =========
//! 1. Admit: reuse the live session, or start one. A new session is seeded
//!    from the store's current copy of the canvas, loaded by a spawned task
//!    so the loop keeps serving other canvases meanwhile; admits for the same
//!    canvas queue behind that load.
//! 2. Broadcast: fan a message out to every member except its originator.
//! 3. Remove: drop the member's queue sender (its writer drains and closes
//!    the connection). When the last member leaves, the session is closed,
//!    which triggers its final flush, and is moved to the retiring set.
//! 4. Retired: the session task reports that its final flush is done.
//!
//! A join that arrives while the previous session of the same canvas is still
//! retiring seeds the new session from the retiring session's document, not
//! from the store, which may not have that final flush yet. The caller's
//! snapshot is only used when the store load fails, since it may predate a
//! session that came and went after the caller loaded it.
//!
//! TRADE-OFFS
//! ==========
//! Fan-out uses `try_send`. When a participant's queue is full that one
//! delivery is dropped and counted; the loop never waits on a slow consumer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{
    Config, DEFAULT_AUTOSAVE_INTERVAL_SECS, DEFAULT_PARTICIPANT_QUEUE_CAPACITY, DEFAULT_REGISTRY_QUEUE_CAPACITY,
};
use crate::document::{CanvasId, DocumentState};
use crate::message::WireMessage;
use crate::services::participant::{Participant, ParticipantId};
use crate::services::session::{Session, SessionId, SessionStatsSnapshot};
use crate::services::store::{CanvasRecord, CanvasStore, UserId};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub participant_queue_capacity: usize,
    pub command_queue_capacity: usize,
    pub autosave_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            participant_queue_capacity: DEFAULT_PARTICIPANT_QUEUE_CAPACITY,
            command_queue_capacity: DEFAULT_REGISTRY_QUEUE_CAPACITY,
            autosave_interval: Duration::from_secs(DEFAULT_AUTOSAVE_INTERVAL_SECS),
        }
    }
}

impl From<&Config> for RegistryConfig {
    fn from(config: &Config) -> Self {
        Self {
            participant_queue_capacity: config.participant_queue_capacity,
            command_queue_capacity: config.registry_queue_capacity,
            autosave_interval: config.autosave_interval,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("registry is closed")]
    Closed,
    #[error("registry is shutting down")]
    ShuttingDown,
    #[error("canvas {0} no longer exists")]
    CanvasUnavailable(CanvasId),
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub sessions: Vec<SessionSummary>,
    /// Closed sessions whose final flush has not finished yet.
    pub retiring: usize,
    /// Broadcast deliveries dropped because a participant's queue was full.
    pub dropped_deliveries: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub canvas_id: CanvasId,
    pub session_id: SessionId,
    pub participants: usize,
    pub stats: SessionStatsSnapshot,
}

impl RegistryStats {
    /// Participant count of the live session for `canvas_id`, if any.
    #[must_use]
    pub fn participants(&self, canvas_id: CanvasId) -> Option<usize> {
        self.sessions
            .iter()
            .find(|s| s.canvas_id == canvas_id)
            .map(|s| s.participants)
    }
}

struct Admitted {
    participant_id: ParticipantId,
    session: Session,
    outbound: mpsc::Receiver<WireMessage>,
}

enum Command {
    Admit { user_id: UserId, snapshot: CanvasRecord, reply: oneshot::Sender<Result<Admitted, RegistryError>> },
    Remove { canvas_id: CanvasId, participant_id: ParticipantId, reply: oneshot::Sender<()> },
    Broadcast { canvas_id: CanvasId, from: ParticipantId, message: WireMessage },
    Retired { canvas_id: CanvasId, session_id: SessionId },
    Loaded { canvas_id: CanvasId, record: Option<CanvasRecord> },
    Lookup { canvas_id: CanvasId, reply: oneshot::Sender<Option<Session>> },
    Stats { reply: oneshot::Sender<RegistryStats> },
    Shutdown { reply: oneshot::Sender<()> },
}

// =============================================================================
// HANDLE
// =============================================================================

/// Handle to the registry control loop. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    tx: mpsc::Sender<Command>,
}

impl Registry {
    /// Spawn the control loop. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn spawn(store: Arc<dyn CanvasStore>, config: RegistryConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.command_queue_capacity.max(1));
        let control = ControlLoop {
            sessions: HashMap::new(),
            retiring: HashMap::new(),
            loading: HashMap::new(),
            store,
            config,
            commands: tx.downgrade(),
            dropped_deliveries: 0,
            shutdown_waiters: None,
        };
        tokio::spawn(control.run(rx));
        Self { tx }
    }

    /// Admit `user_id` to the canvas described by `snapshot`. The snapshot's
    /// document is a fallback for when the store cannot be read.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the loop has stopped, `ShuttingDown` after
    /// [`Registry::shutdown`], `CanvasUnavailable` if the canvas has been
    /// deleted since the caller loaded it.
    pub async fn admit(&self, user_id: UserId, snapshot: CanvasRecord) -> Result<Participant, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Admit { user_id, snapshot, reply }).await?;
        let admitted = rx.await.map_err(|_| RegistryError::Closed)??;
        Ok(Participant::new(admitted.participant_id, user_id, admitted.session, self.clone(), admitted.outbound))
    }

    /// Unregister a participant and wait until the registry has dropped its
    /// queue.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the loop has stopped.
    pub async fn remove(&self, canvas_id: CanvasId, participant_id: ParticipantId) -> Result<(), RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Remove { canvas_id, participant_id, reply }).await?;
        rx.await.map_err(|_| RegistryError::Closed)
    }

    /// Queue `message` for every member of the canvas's session except `from`.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the loop has stopped.
    pub async fn broadcast(&self, canvas_id: CanvasId, from: ParticipantId, message: WireMessage) -> Result<(), RegistryError> {
        self.send(Command::Broadcast { canvas_id, from, message }).await
    }

    /// The live session for `canvas_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the loop has stopped.
    pub async fn session(&self, canvas_id: CanvasId) -> Result<Option<Session>, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Lookup { canvas_id, reply }).await?;
        rx.await.map_err(|_| RegistryError::Closed)
    }

    /// # Errors
    ///
    /// Returns `Closed` if the loop has stopped.
    pub async fn stats(&self) -> Result<RegistryStats, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply }).await?;
        rx.await.map_err(|_| RegistryError::Closed)
    }

    /// Close every live session and wait for all final flushes. Later
    /// admissions are refused.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the loop has stopped.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| RegistryError::Closed)
    }

    async fn send(&self, command: Command) -> Result<(), RegistryError> {
        self.tx.send(command).await.map_err(|_| RegistryError::Closed)
    }
}

// =============================================================================
// CONTROL LOOP
// =============================================================================

struct LiveSession {
    session: Session,
    members: HashMap<ParticipantId, mpsc::Sender<WireMessage>>,
}

struct PendingAdmit {
    user_id: UserId,
    reply: oneshot::Sender<Result<Admitted, RegistryError>>,
}

struct ControlLoop {
    sessions: HashMap<CanvasId, LiveSession>,
    retiring: HashMap<CanvasId, Session>,
    /// Admits waiting for a canvas load to finish.
    loading: HashMap<CanvasId, Vec<PendingAdmit>>,
    store: Arc<dyn CanvasStore>,
    config: RegistryConfig,
    /// Weak so that the loop ends once every external handle is dropped.
    commands: mpsc::WeakSender<Command>,
    dropped_deliveries: u64,
    shutdown_waiters: Option<Vec<oneshot::Sender<()>>>,
}

impl ControlLoop {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }
        for (_, live) in self.sessions.drain() {
            live.session.close();
        }
        debug!("session registry stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Admit { user_id, snapshot, reply } => {
                if self.shutdown_waiters.is_some() {
                    let _ = reply.send(Err(RegistryError::ShuttingDown));
                } else {
                    self.admit(user_id, snapshot, reply).await;
                }
            }
            Command::Remove { canvas_id, participant_id, reply } => {
                self.remove(canvas_id, participant_id);
                let _ = reply.send(());
            }
            Command::Broadcast { canvas_id, from, message } => self.broadcast(canvas_id, from, &message),
            Command::Retired { canvas_id, session_id } => self.retired(canvas_id, session_id),
            Command::Loaded { canvas_id, record } => self.loaded(canvas_id, record),
            Command::Lookup { canvas_id, reply } => {
                let _ = reply.send(self.sessions.get(&canvas_id).map(|live| live.session.clone()));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { reply } => self.shutdown(reply),
        }
    }

    async fn admit(
        &mut self,
        user_id: UserId,
        snapshot: CanvasRecord,
        reply: oneshot::Sender<Result<Admitted, RegistryError>>,
    ) {
        let canvas_id = snapshot.canvas_id;
        if let Some(pending) = self.loading.get_mut(&canvas_id) {
            pending.push(PendingAdmit { user_id, reply });
            return;
        }

        if !self.sessions.contains_key(&canvas_id) {
            let Some(previous) = self.retiring.get(&canvas_id) else {
                self.load(snapshot, PendingAdmit { user_id, reply });
                return;
            };
            info!(%canvas_id, previous = %previous.id(), "seeding session from retiring session");
            // Retiring sessions have no readers left, so this guard is free.
            let owner = previous.owner();
            let document = previous.document().await;
            self.open_session(canvas_id, owner, document);
        }
        let _ = reply.send(self.join(canvas_id, user_id));
    }

    /// Load the canvas's current document off the loop and report back with
    /// `Command::Loaded`.
    fn load(&mut self, snapshot: CanvasRecord, first: PendingAdmit) {
        let canvas_id = snapshot.canvas_id;
        self.loading.insert(canvas_id, vec![first]);

        let store = Arc::clone(&self.store);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let record = match store.load_canvas(snapshot.owner, canvas_id).await {
                Ok(current) => current,
                Err(e) => {
                    warn!(error = %e, %canvas_id, "canvas reload failed; seeding from admission snapshot");
                    Some(snapshot)
                }
            };
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::Loaded { canvas_id, record }).await;
            }
        });
    }

    fn loaded(&mut self, canvas_id: CanvasId, record: Option<CanvasRecord>) {
        let Some(pending) = self.loading.remove(&canvas_id) else {
            return;
        };
        let refusal = match record {
            _ if self.shutdown_waiters.is_some() => RegistryError::ShuttingDown,
            None => {
                warn!(%canvas_id, waiting = pending.len(), "canvas disappeared before session start");
                RegistryError::CanvasUnavailable(canvas_id)
            }
            Some(record) => {
                self.open_session(canvas_id, record.owner, record.document);
                for admit in pending {
                    let _ = admit.reply.send(self.join(canvas_id, admit.user_id));
                }
                return;
            }
        };
        for admit in pending {
            let _ = admit.reply.send(Err(refusal.clone()));
        }
    }

    /// Add a member to the live session of `canvas_id`.
    fn join(&mut self, canvas_id: CanvasId, user_id: UserId) -> Result<Admitted, RegistryError> {
        let capacity = self.config.participant_queue_capacity.max(1);
        let live = self.sessions.get_mut(&canvas_id).ok_or(RegistryError::CanvasUnavailable(canvas_id))?;

        let participant_id = Uuid::new_v4();
        let (tx, outbound) = mpsc::channel(capacity);
        live.members.insert(participant_id, tx);
        info!(%canvas_id, %participant_id, %user_id, participants = live.members.len(), "participant joined");

        Ok(Admitted { participant_id, session: live.session.clone(), outbound })
    }

    fn open_session(&mut self, canvas_id: CanvasId, owner: UserId, document: DocumentState) {
        let (session, task) =
            Session::start(canvas_id, owner, document, Arc::clone(&self.store), self.config.autosave_interval);
        let session_id = session.id();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                warn!(error = %e, %canvas_id, "session task failed");
            }
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::Retired { canvas_id, session_id }).await;
            }
        });
        self.sessions.insert(canvas_id, LiveSession { session, members: HashMap::new() });
    }

    fn remove(&mut self, canvas_id: CanvasId, participant_id: ParticipantId) {
        let Some(live) = self.sessions.get_mut(&canvas_id) else {
            return;
        };
        if live.members.remove(&participant_id).is_none() {
            return;
        }
        info!(%canvas_id, %participant_id, remaining = live.members.len(), "participant left");

        if live.members.is_empty() {
            if let Some(live) = self.sessions.remove(&canvas_id) {
                live.session.close();
                self.retiring.insert(canvas_id, live.session);
            }
        }
    }

    fn broadcast(&mut self, canvas_id: CanvasId, from: ParticipantId, message: &WireMessage) {
        let Some(live) = self.sessions.get(&canvas_id) else {
            return;
        };

        for (participant_id, tx) in &live.members {
            if *participant_id == from {
                continue;
            }
            match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped_deliveries += 1;
                    debug!(%canvas_id, %participant_id, event = %message.event, "participant queue full; dropping delivery");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(%canvas_id, %participant_id, "participant queue closed; skipping delivery");
                }
            }
        }
    }

    fn retired(&mut self, canvas_id: CanvasId, session_id: SessionId) {
        if self
            .retiring
            .get(&canvas_id)
            .is_some_and(|s| s.id() == session_id)
        {
            self.retiring.remove(&canvas_id);
        }

        if self.retiring.is_empty() {
            if let Some(waiters) = self.shutdown_waiters.as_mut() {
                for waiter in waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
        }
    }

    fn shutdown(&mut self, reply: oneshot::Sender<()>) {
        info!(sessions = self.sessions.len(), "closing all sessions");
        for (canvas_id, live) in self.sessions.drain() {
            live.session.close();
            self.retiring.insert(canvas_id, live.session);
        }

        let waiters = self.shutdown_waiters.get_or_insert_with(Vec::new);
        if self.retiring.is_empty() {
            let _ = reply.send(());
        } else {
            waiters.push(reply);
        }
    }

    fn stats(&self) -> RegistryStats {
        let mut sessions = self
            .sessions
            .iter()
            .map(|(canvas_id, live)| SessionSummary {
                canvas_id: *canvas_id,
                session_id: live.session.id(),
                participants: live.members.len(),
                stats: live.session.stats(),
            })
            .collect::<Vec<_>>();
        sessions.sort_by_key(|s| s.canvas_id);
        RegistryStats { sessions, retiring: self.retiring.len(), dropped_deliveries: self.dropped_deliveries }
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
