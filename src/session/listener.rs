//! Socket reader and inbound dispatch
//!
//! The listener is the only reader of the socket. Responses go straight to
//! the router; the handshake, engine events and the terminal disconnect are
//! funneled through a mailbox to one dispatcher task, so stops are handled
//! strictly in wire order.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;

use super::Session;
use crate::wire::codec;
use crate::wire::types::Response;

/// Inbound messages the dispatcher cares about
pub(crate) enum Inbound {
    /// The engine's header-only connect handshake arrived
    Connected,
    /// A full `event` packet
    Event(Value),
    /// The socket is gone
    Disconnected,
}

pub(crate) async fn read_loop(
    read_half: OwnedReadHalf,
    session: Arc<Session>,
    tx: mpsc::UnboundedSender<Inbound>,
) {
    let mut reader = BufReader::new(read_half);

    loop {
        let packet = tokio::select! {
            _ = session.shutdown.cancelled() => break,
            result = codec::read_packet(&mut reader) => result,
        };

        let packet = match packet {
            Ok(packet) => packet,
            Err(err) => {
                tracing::debug!(%err, "listener stopped");
                let _ = tx.send(Inbound::Disconnected);
                break;
            }
        };

        if packet.is_handshake() {
            tracing::debug!(host = packet.header("Embedding-Host"), "engine handshake");
            let _ = tx.send(Inbound::Connected);
            continue;
        }
        if packet.body.trim().is_empty() {
            continue;
        }

        let json: Value = match serde_json::from_str(&packet.body) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(%err, "dropping malformed packet");
                continue;
            }
        };
        tracing::debug!("engine >>> {json}");

        let packet_type = json
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        match packet_type.as_str() {
            "response" => match serde_json::from_value::<Response>(json) {
                Ok(response) => session.router.deliver(response),
                Err(err) => tracing::warn!(%err, "dropping malformed response"),
            },
            "event" => {
                let _ = tx.send(Inbound::Event(json));
            }
            other => tracing::warn!(packet_type = other, "dropping packet of unknown type"),
        }
    }

    // Unblock anyone still waiting on a response.
    session.router.fail_all();
}

pub(crate) async fn dispatch_loop(session: Arc<Session>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(message) = rx.recv().await {
        match message {
            Inbound::Connected => {
                if let Err(err) = session.process_connect().await {
                    tracing::warn!(%err, "connect handshake failed");
                    session.terminate().await;
                    break;
                }
            }
            Inbound::Event(json) => session.handle_event(&json).await,
            Inbound::Disconnected => {
                session.terminate().await;
                break;
            }
        }
    }
}
