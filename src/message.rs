//! Wire message: the one message shape exchanged with participants.
//!
//! ARCHITECTURE
//! ============
//! Every websocket text frame carries one `WireMessage`:
//! `{ "event": ..., "email": ..., "data": ... }`. Inbound messages are
//! decoded in two steps. The envelope is parsed first; a frame that is not a
//! valid envelope means the peer is not speaking the protocol at all and
//! ends the connection. The envelope is then narrowed into the closed
//! `Operation` union, one payload type per event. A bad event name or a
//! payload of the wrong shape only drops that message.
//!
//! Outbound broadcasts reuse the same envelope so clients need a single
//! decoder.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{CanvasDataPatch, Piece};

// =============================================================================
// TYPES
// =============================================================================

/// Envelope exchanged in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub event: String,
    /// Acting user's email. Advisory, display only.
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub data: Value,
}

/// The five event kinds understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AddPiece,
    UpdatePiece,
    RemovePiece,
    UpdateCanvasData,
    Get,
}

/// Decoded inbound operation with its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    AddPiece(Piece),
    UpdatePiece { index: i64, piece: Piece },
    RemovePiece { index: i64 },
    UpdateCanvasData(CanvasDataPatch),
    /// Snapshot push; the payload is relayed untouched.
    Get(Value),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("invalid {event} payload: {source}")]
    InvalidPayload {
        event: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    /// Whether the error ends the connection rather than a single message.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidJson(_))
    }
}

// =============================================================================
// EVENT KIND
// =============================================================================

impl EventKind {
    pub const ALL: [EventKind; 5] =
        [Self::AddPiece, Self::UpdatePiece, Self::RemovePiece, Self::UpdateCanvasData, Self::Get];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AddPiece => "add-piece",
            Self::UpdatePiece => "update-piece",
            Self::RemovePiece => "remove-piece",
            Self::UpdateCanvasData => "update-canvas-data",
            Self::Get => "get",
        }
    }

    #[must_use]
    pub fn parse(event: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == event)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

impl WireMessage {
    #[must_use]
    pub fn new(kind: EventKind, email: impl Into<String>, data: Value) -> Self {
        Self { event: kind.as_str().to_owned(), email: email.into(), data }
    }

    /// Parse one inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidJson` if the text is not an envelope.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::InvalidJson)
    }

    /// Serialize for the wire.
    ///
    /// # Errors
    ///
    /// Returns the serializer error; only possible for non-finite floats in `data`.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

// =============================================================================
// OPERATION
// =============================================================================

#[derive(Deserialize)]
struct IndexedPiece {
    index: i64,
    #[serde(flatten)]
    piece: Piece,
}

#[derive(Deserialize)]
struct PieceIndex {
    index: i64,
}

impl Operation {
    /// Narrow an envelope into a typed operation.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEvent` for event names outside the protocol and
    /// `InvalidPayload` when `data` does not fit the event's payload shape.
    pub fn decode(message: &WireMessage) -> Result<Self, ProtocolError> {
        let kind = EventKind::parse(&message.event).ok_or_else(|| ProtocolError::UnknownEvent(message.event.clone()))?;
        let invalid = |source| ProtocolError::InvalidPayload { event: kind, source };

        let op = match kind {
            EventKind::AddPiece => Self::AddPiece(Piece::deserialize(&message.data).map_err(invalid)?),
            EventKind::UpdatePiece => {
                let IndexedPiece { index, piece } = IndexedPiece::deserialize(&message.data).map_err(invalid)?;
                Self::UpdatePiece { index, piece }
            }
            EventKind::RemovePiece => {
                let PieceIndex { index } = PieceIndex::deserialize(&message.data).map_err(invalid)?;
                Self::RemovePiece { index }
            }
            EventKind::UpdateCanvasData => {
                // Older clients wrap the fields in a `canvas_data` object.
                let fields = message.data.get("canvas_data").unwrap_or(&message.data);
                Self::UpdateCanvasData(CanvasDataPatch::deserialize(fields).map_err(invalid)?)
            }
            EventKind::Get => Self::Get(message.data.clone()),
        };
        Ok(op)
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::AddPiece(_) => EventKind::AddPiece,
            Self::UpdatePiece { .. } => EventKind::UpdatePiece,
            Self::RemovePiece { .. } => EventKind::RemovePiece,
            Self::UpdateCanvasData(_) => EventKind::UpdateCanvasData,
            Self::Get(_) => EventKind::Get,
        }
    }
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
