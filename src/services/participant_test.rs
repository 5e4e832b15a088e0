use super::*;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::mpsc as conn;
use serde_json::json;

use crate::message::EventKind;
use crate::services::store::{CanvasStore, UserId};
use crate::state::test_helpers::{MemoryStore, dummy_piece, named_document, new_user, record, test_registry_config};

const CANVAS: i64 = 1;
const WAIT: Duration = Duration::from_secs(2);

type Inbound = conn::UnboundedSender<Result<String, ConnectionError>>;

/// Registry over a store holding canvas `CANVAS` owned by `owner`.
fn registry(owner: UserId) -> Registry {
    let store = MemoryStore::new();
    store.insert_canvas(CANVAS, owner, named_document("Untitled"));
    let store: Arc<dyn CanvasStore> = Arc::new(store);
    Registry::spawn(store, test_registry_config())
}

fn add_piece_text(path: &str) -> String {
    let data = serde_json::to_value(dummy_piece(path)).expect("piece serializes");
    WireMessage::new(EventKind::AddPiece, "a@example.com", data)
        .encode()
        .expect("message encodes")
}

/// Run `participant` over in-memory channels; returns the inbound sender,
/// the outbound receiver and the run task.
fn connect(participant: Participant) -> (Inbound, conn::UnboundedReceiver<String>, tokio::task::JoinHandle<()>) {
    let (in_tx, in_rx) = conn::unbounded();
    let (out_tx, out_rx) = conn::unbounded();
    let task = tokio::spawn(participant.run(in_rx, out_tx));
    (in_tx, out_rx, task)
}

async fn next_queued(participant: &mut Participant) -> WireMessage {
    tokio::time::timeout(WAIT, participant.outbound_mut().recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("queue closed")
}

async fn next_written(rx: &mut conn::UnboundedReceiver<String>) -> Option<String> {
    tokio::time::timeout(WAIT, rx.next()).await.expect("timed out waiting for write")
}

/// Sink that fails its first send and forwards everything after.
struct FlakySink {
    failed: bool,
    delivered: conn::UnboundedSender<String>,
}

impl Sink<String> for FlakySink {
    type Error = String;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(mut self: Pin<&mut Self>, item: String) -> Result<(), String> {
        if !self.failed {
            self.failed = true;
            return Err("connection reset".into());
        }
        self.delivered.unbounded_send(item).map_err(|e| e.to_string())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
        self.delivered.close_channel();
        Poll::Ready(Ok(()))
    }
}

// =============================================================================
// read path
// =============================================================================

#[tokio::test]
async fn edit_is_applied_and_relayed_to_peers_only() {
    let owner = new_user();
    let registry = registry(owner);
    let mut peer = registry.admit(new_user(), record(CANVAS, owner)).await.unwrap();
    let author = registry.admit(owner, record(CANVAS, owner)).await.unwrap();
    let session = author.session().clone();
    let (in_tx, mut out_rx, task) = connect(author);

    in_tx.unbounded_send(Ok(add_piece_text("M0 0"))).unwrap();
    let relayed = next_queued(&mut peer).await;
    assert_eq!(relayed.event, "add-piece");
    assert_eq!(session.document().await.pieces().len(), 1);

    drop(in_tx);
    task.await.unwrap();
    assert_eq!(next_written(&mut out_rx).await, None, "author must not receive its own edit");
}

#[tokio::test]
async fn undecodable_envelope_ends_connection() {
    let owner = new_user();
    let registry = registry(owner);
    let participant = registry.admit(owner, record(CANVAS, owner)).await.unwrap();
    let (in_tx, mut out_rx, task) = connect(participant);

    in_tx.unbounded_send(Ok("{not json".into())).unwrap();
    tokio::time::timeout(WAIT, task).await.expect("reader should stop").unwrap();

    assert!(registry.session(CANVAS).await.unwrap().is_none());
    assert_eq!(next_written(&mut out_rx).await, None);
}

#[tokio::test]
async fn transport_error_ends_connection() {
    let owner = new_user();
    let registry = registry(owner);
    let participant = registry.admit(owner, record(CANVAS, owner)).await.unwrap();
    let (in_tx, _out_rx, task) = connect(participant);

    in_tx.unbounded_send(Err(ConnectionError::Transport("reset".into()))).unwrap();
    tokio::time::timeout(WAIT, task).await.expect("reader should stop").unwrap();
    assert!(registry.session(CANVAS).await.unwrap().is_none());
}

#[tokio::test]
async fn malformed_payload_is_dropped_and_connection_stays_open() {
    let owner = new_user();
    let registry = registry(owner);
    let mut peer = registry.admit(new_user(), record(CANVAS, owner)).await.unwrap();
    let author = registry.admit(owner, record(CANVAS, owner)).await.unwrap();
    let session = author.session().clone();
    let (in_tx, _out_rx, _task) = connect(author);

    in_tx.unbounded_send(Ok(r#"{"event":"add-piece","data":{"path":5}}"#.into())).unwrap();
    in_tx.unbounded_send(Ok(r#"{"event":"paint-bucket","data":{}}"#.into())).unwrap();
    in_tx.unbounded_send(Ok(add_piece_text("M1 1"))).unwrap();

    let relayed = next_queued(&mut peer).await;
    assert_eq!(relayed.data["path"], json!("M1 1"));
    assert_eq!(session.document().await.pieces().len(), 1);
    assert_eq!(registry.stats().await.unwrap().participants(CANVAS), Some(2));
}

// =============================================================================
// write path
// =============================================================================

#[tokio::test]
async fn writes_follow_enqueue_order() {
    let owner = new_user();
    let registry = registry(owner);
    let other = registry.admit(new_user(), record(CANVAS, owner)).await.unwrap();
    let reader = registry.admit(owner, record(CANVAS, owner)).await.unwrap();
    let (in_tx, mut out_rx, task) = connect(reader);

    for i in 0..5 {
        let message = WireMessage::new(EventKind::Get, "b@example.com", json!({ "seq": i }));
        registry.broadcast(CANVAS, other.id(), message).await.unwrap();
    }
    for i in 0..5 {
        let text = next_written(&mut out_rx).await.expect("connection open");
        let message = WireMessage::decode(&text).unwrap();
        assert_eq!(message.data, json!({ "seq": i }));
    }

    drop(in_tx);
    task.await.unwrap();
    assert_eq!(next_written(&mut out_rx).await, None, "connection closes after removal");
}

#[tokio::test]
async fn write_failure_does_not_stop_later_writes() {
    let owner = new_user();
    let registry = registry(owner);
    let other = registry.admit(new_user(), record(CANVAS, owner)).await.unwrap();
    let reader = registry.admit(owner, record(CANVAS, owner)).await.unwrap();

    let (_in_tx, in_rx) = conn::unbounded::<Result<String, ConnectionError>>();
    let (delivered, mut written) = conn::unbounded();
    let _task = tokio::spawn(reader.run(in_rx, FlakySink { failed: false, delivered }));

    for i in 0..3 {
        let message = WireMessage::new(EventKind::Get, "b@example.com", json!({ "seq": i }));
        registry.broadcast(CANVAS, other.id(), message).await.unwrap();
    }

    for expected in [1, 2] {
        let text = next_written(&mut written).await.expect("sink open");
        assert_eq!(WireMessage::decode(&text).unwrap().data, json!({ "seq": expected }));
    }
}
