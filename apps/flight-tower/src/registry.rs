use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::FlightError;
use crate::ids::generate_connection_id;
use crate::protocol::{PeerInfo, ServerMessage};

pub const DEFAULT_NAME: &str = "Anonymous";
pub const MAX_NAME_CHARS: usize = 50;

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Ping,
    Close { code: u16, reason: String },
}

#[derive(Debug, Error)]
#[error("connection outbox closed")]
pub struct OutboxClosed;

/// Sending half of a connection. Pushes never block; the writer task owns
/// the socket and drains the queue in order.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    pub fn send(&self, message: ServerMessage) -> Result<(), OutboxClosed> {
        self.tx
            .send(Outbound::Message(message))
            .map_err(|_| OutboxClosed)
    }

    pub fn ping(&self) -> Result<(), OutboxClosed> {
        self.tx.send(Outbound::Ping).map_err(|_| OutboxClosed)
    }

    /// Queue a close frame and stop the reader loop.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
        self.cancel.cancel();
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed() && !self.cancel.is_cancelled()
    }

    /// Token cancelled when the tower force-closes this connection.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientMetadata {
    pub id: String,
    pub name: String,
    pub flight_code: Option<String>,
    pub source_address: String,
    pub user_agent: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl ClientMetadata {
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

struct ClientEntry {
    meta: ClientMetadata,
    outbox: Outbox,
    awaiting_pong: bool,
}

/// Live connections keyed by connection id.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: HashMap<String, ClientEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        source_address: String,
        user_agent: Option<String>,
        outbox: Outbox,
    ) -> String {
        let id = generate_connection_id();
        let meta = ClientMetadata {
            id: id.clone(),
            name: DEFAULT_NAME.to_string(),
            flight_code: None,
            source_address,
            user_agent,
            connected_at: Utc::now(),
        };
        self.clients.insert(
            id.clone(),
            ClientEntry {
                meta,
                outbox,
                awaiting_pong: false,
            },
        );
        id
    }

    pub fn set_name(&mut self, id: &str, name: &str) -> Result<(), FlightError> {
        if name.chars().count() > MAX_NAME_CHARS {
            return Err(FlightError::validation(format!(
                "Name must be at most {MAX_NAME_CHARS} characters"
            )));
        }
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(FlightError::validation("Name must not be empty"));
        }
        let entry = self
            .clients
            .get_mut(id)
            .ok_or_else(|| FlightError::NotFound("Client not registered".into()))?;
        entry.meta.name = trimmed.to_string();
        Ok(())
    }

    pub fn set_flight(&mut self, id: &str, code: Option<String>) {
        if let Some(entry) = self.clients.get_mut(id) {
            entry.meta.flight_code = code;
        }
    }

    /// Remove a connection. Flight membership must already be detached.
    pub fn unregister(&mut self, id: &str) -> Option<ClientMetadata> {
        self.clients.remove(id).map(|entry| entry.meta)
    }

    pub fn get(&self, id: &str) -> Option<&ClientMetadata> {
        self.clients.get(id).map(|entry| &entry.meta)
    }

    pub fn outbox(&self, id: &str) -> Option<&Outbox> {
        self.clients.get(id).map(|entry| &entry.outbox)
    }

    /// Registered and still able to receive frames.
    pub fn is_live(&self, id: &str) -> bool {
        self.clients
            .get(id)
            .map(|entry| entry.outbox.is_open())
            .unwrap_or(false)
    }

    /// Deliver one message; failures are logged and reported as `false`.
    pub fn send(&self, id: &str, message: ServerMessage) -> bool {
        let Some(entry) = self.clients.get(id) else {
            warn!(connection_id = %id, "dropping message for unknown connection");
            return false;
        };
        match entry.outbox.send(message) {
            Ok(()) => true,
            Err(err) => {
                warn!(connection_id = %id, error = %err, "failed to queue message");
                false
            }
        }
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientMetadata> {
        self.clients.values().map(|entry| &entry.meta)
    }

    pub fn ids(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn mark_alive(&mut self, id: &str) {
        if let Some(entry) = self.clients.get_mut(id) {
            entry.awaiting_pong = false;
        }
    }

    /// Returns whether the previous probe went unanswered, and arms a new one.
    pub(crate) fn arm_probe(&mut self, id: &str) -> Option<bool> {
        let entry = self.clients.get_mut(id)?;
        let missed = entry.awaiting_pong;
        entry.awaiting_pong = true;
        Some(missed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_client() -> (ConnectionRegistry, String, mpsc::UnboundedReceiver<Outbound>) {
        let mut registry = ConnectionRegistry::new();
        let (outbox, rx) = Outbox::channel();
        let id = registry.register("10.0.0.5".into(), Some("test-agent".into()), outbox);
        (registry, id, rx)
    }

    #[test_timeout::timeout]
    fn register_assigns_defaults() {
        let (registry, id, _rx) = registry_with_client();
        let meta = registry.get(&id).unwrap();
        assert_eq!(meta.name, DEFAULT_NAME);
        assert_eq!(meta.flight_code, None);
        assert_eq!(meta.source_address, "10.0.0.5");
        assert_eq!(meta.user_agent.as_deref(), Some("test-agent"));
        assert!(registry.is_live(&id));
    }

    #[test_timeout::timeout]
    fn set_name_trims_and_validates() {
        let (mut registry, id, _rx) = registry_with_client();
        registry.set_name(&id, "  Kite  ").unwrap();
        assert_eq!(registry.get(&id).unwrap().name, "Kite");

        assert!(matches!(
            registry.set_name(&id, "   "),
            Err(FlightError::Validation(_))
        ));
        assert!(matches!(
            registry.set_name(&id, &"a".repeat(MAX_NAME_CHARS + 1)),
            Err(FlightError::Validation(_))
        ));
        registry.set_name(&id, &"é".repeat(MAX_NAME_CHARS)).unwrap();
        assert_eq!(registry.get(&id).unwrap().name.chars().count(), MAX_NAME_CHARS);
    }

    #[test_timeout::timeout]
    fn length_limit_counts_surrounding_whitespace() {
        let (mut registry, id, _rx) = registry_with_client();
        let padded = format!("  {}", "a".repeat(MAX_NAME_CHARS));
        assert!(matches!(
            registry.set_name(&id, &padded),
            Err(FlightError::Validation(_))
        ));
        assert_eq!(registry.get(&id).unwrap().name, DEFAULT_NAME);

        let fits = format!(" {} ", "b".repeat(MAX_NAME_CHARS - 2));
        registry.set_name(&id, &fits).unwrap();
        assert_eq!(registry.get(&id).unwrap().name, "b".repeat(MAX_NAME_CHARS - 2));
    }

    #[test_timeout::timeout]
    fn send_reports_closed_receivers() {
        let (registry, id, rx) = registry_with_client();
        assert!(registry.send(&id, ServerMessage::PeerLeft));
        drop(rx);
        assert!(!registry.send(&id, ServerMessage::PeerLeft));
        assert!(!registry.is_live(&id));
        assert!(!registry.send("missing", ServerMessage::PeerLeft));
    }

    #[test_timeout::timeout]
    fn close_cancels_reader_and_queues_frame() {
        let (registry, id, mut rx) = registry_with_client();
        let outbox = registry.outbox(&id).unwrap().clone();
        let token = outbox.cancellation();
        outbox.close(1001, "bye");
        assert!(token.is_cancelled());
        assert!(!registry.is_live(&id));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close {
                code: 1001,
                reason: "bye".into()
            }
        );
    }

    #[test_timeout::timeout]
    fn probes_track_missed_answers() {
        let (mut registry, id, _rx) = registry_with_client();
        assert_eq!(registry.arm_probe(&id), Some(false));
        assert_eq!(registry.arm_probe(&id), Some(true));
        registry.mark_alive(&id);
        assert_eq!(registry.arm_probe(&id), Some(false));
        assert_eq!(registry.arm_probe("missing"), None);
    }
}
