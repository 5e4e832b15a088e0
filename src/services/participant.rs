//! Participant: one connection's presence in a session.
//!
//! DESIGN
//! ======
//! A participant drives two independent loops over its duplex connection:
//! - reader: decode the next inbound message, apply it to the session's
//!   document, hand the resulting broadcast to the registry
//! - writer: drain the participant's own bounded queue onto the connection,
//!   in enqueue order
//!
//! The connection is passed in as a text `Stream` + `Sink` pair so the same
//! loops run over an axum websocket in production and over plain channels
//! in tests.
//!
//! LIFECYCLE
//! =========
//! 1. `Registry::admit` returns the participant with its queue receiver.
//! 2. `run` spawns the writer and runs the reader in place.
//! 3. The reader ends on disconnect, transport error, or an undecodable
//!    envelope, then asks the registry to remove the participant.
//! 4. Removal drops the queue sender; the writer drains what is left,
//!    closes the connection and exits.

use std::fmt::Display;
use std::pin::pin;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::message::{Operation, ProtocolError, WireMessage};
use crate::services::registry::Registry;
use crate::services::session::Session;
use crate::services::store::UserId;

pub type ParticipantId = Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(String),
}

pub struct Participant {
    id: ParticipantId,
    user_id: UserId,
    session: Session,
    registry: Registry,
    outbound: mpsc::Receiver<WireMessage>,
}

impl Participant {
    pub(crate) fn new(
        id: ParticipantId,
        user_id: UserId,
        session: Session,
        registry: Registry,
        outbound: mpsc::Receiver<WireMessage>,
    ) -> Self {
        Self { id, user_id, session, registry, outbound }
    }

    #[must_use]
    pub fn id(&self) -> ParticipantId {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[cfg(test)]
    pub(crate) fn outbound_mut(&mut self) -> &mut mpsc::Receiver<WireMessage> {
        &mut self.outbound
    }

    /// Run both loops until the connection ends and the participant has been
    /// removed from its session.
    pub async fn run<S, K>(self, inbound: S, connection: K)
    where
        S: Stream<Item = Result<String, ConnectionError>> + Send,
        K: Sink<String> + Send + 'static,
        K::Error: Display,
    {
        let Self { id, user_id, session, registry, outbound } = self;
        let canvas_id = session.canvas_id();

        let writer = tokio::spawn(write_loop(id, outbound, connection));
        read_loop(id, user_id, &session, &registry, inbound).await;

        if let Err(e) = registry.remove(canvas_id, id).await {
            warn!(error = %e, %canvas_id, participant_id = %id, "remove failed");
        }
        if let Err(e) = writer.await {
            warn!(error = %e, participant_id = %id, "writer task failed");
        }
        info!(%canvas_id, participant_id = %id, "participant disconnected");
    }
}

// =============================================================================
// READ PATH
// =============================================================================

async fn read_loop<S>(id: ParticipantId, user_id: UserId, session: &Session, registry: &Registry, inbound: S)
where
    S: Stream<Item = Result<String, ConnectionError>>,
{
    let canvas_id = session.canvas_id();
    let mut inbound = pin!(inbound);
    while let Some(frame) = inbound.next().await {
        let text = match frame {
            Ok(text) => text,
            Err(e) => {
                debug!(error = %e, participant_id = %id, "connection read failed");
                break;
            }
        };
        match decode(&text) {
            Ok((message, op)) => handle_message(id, user_id, session, registry, message, op).await,
            Err(e) if e.is_fatal() => {
                warn!(error = %e, %canvas_id, participant_id = %id, "undecodable message; closing connection");
                break;
            }
            Err(e) => warn!(error = %e, %canvas_id, participant_id = %id, "dropping message"),
        }
    }
}

fn decode(text: &str) -> Result<(WireMessage, Operation), ProtocolError> {
    let message = WireMessage::decode(text)?;
    let op = Operation::decode(&message)?;
    Ok((message, op))
}

/// Apply one inbound operation; the session forwards the result to the
/// other members.
async fn handle_message(
    id: ParticipantId,
    user_id: UserId,
    session: &Session,
    registry: &Registry,
    message: WireMessage,
    op: Operation,
) {
    let canvas_id = session.canvas_id();
    debug!(%canvas_id, participant_id = %id, event = %op.kind(), "recv");
    if let Err(e) = session.apply(user_id, id, message, op, registry).await {
        warn!(error = %e, %canvas_id, participant_id = %id, "broadcast failed");
    }
}

// =============================================================================
// WRITE PATH
// =============================================================================

async fn write_loop<K>(id: ParticipantId, mut queue: mpsc::Receiver<WireMessage>, connection: K)
where
    K: Sink<String>,
    K::Error: Display,
{
    let mut connection = pin!(connection);
    while let Some(message) = queue.recv().await {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, participant_id = %id, "failed to serialize message");
                continue;
            }
        };
        if let Err(e) = connection.send(text).await {
            warn!(error = %e, participant_id = %id, event = %message.event, "write failed");
        }
    }

    if let Err(e) = connection.close().await {
        debug!(error = %e, participant_id = %id, "connection close failed");
    }
}

#[cfg(test)]
#[path = "participant_test.rs"]
mod tests;
