use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::close_code;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::FlightError;
use crate::flights::{Flight, FlightTable};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{ClientMetadata, ConnectionRegistry, Outbox};

/// Owner of the connection registry and the flight table.
///
/// Every operation runs to completion, including the presence broadcast it
/// triggers, before the next one starts. Outbound frames are queued on
/// per-connection channels, so nothing here awaits.
pub struct Coordinator {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) flights: FlightTable,
    started_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TowerStats {
    pub connections: usize,
    pub flights: usize,
    pub paired_flights: usize,
    pub uptime_seconds: u64,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            flights: FlightTable::new(),
            started_at: Instant::now(),
        }
    }

    /// Add a connection and push the new presence snapshot. The caller
    /// tells the client its id before draining the outbox.
    pub fn register(
        &mut self,
        source_address: String,
        user_agent: Option<String>,
        outbox: Outbox,
    ) -> String {
        let id = self.registry.register(source_address, user_agent, outbox);

        counter!("flight_tower_connections_total", 1);
        gauge!("flight_tower_connections_active", self.registry.len() as f64);
        if let Some(meta) = self.registry.get(&id) {
            info!(
                connection_id = %id,
                source_address = %meta.source_address,
                user_agent = meta.user_agent.as_deref().unwrap_or("-"),
                "client registered"
            );
        }

        self.broadcast_presence();
        id
    }

    pub fn set_name(&mut self, id: &str, name: &str) -> Result<(), FlightError> {
        self.registry.set_name(id, name)?;
        debug!(connection_id = %id, "client renamed");
        self.broadcast_presence();
        Ok(())
    }

    /// Tear a connection down: leave its flight, drop it from the registry
    /// and refresh presence. Unknown ids are ignored, so repeated calls for
    /// the same connection are harmless.
    pub fn disconnect(&mut self, id: &str) -> bool {
        if self.registry.get(id).is_none() {
            return false;
        }
        self.detach(id);
        self.registry.unregister(id);
        gauge!("flight_tower_connections_active", self.registry.len() as f64);
        info!(connection_id = %id, "client disconnected");

        self.broadcast_presence();
        true
    }

    pub fn handle(&mut self, id: &str, message: ClientMessage) -> Result<(), FlightError> {
        debug!(connection_id = %id, kind = message.kind(), "dispatching client message");
        match message {
            ClientMessage::RegisterDetails { name } => self.set_name(id, &name),
            ClientMessage::CreateFlight => self.create_flight(id).map(|_| ()),
            ClientMessage::JoinFlight { flight_code } => self.join_flight(id, &flight_code),
            ClientMessage::LeaveFlight => {
                self.leave_flight(id);
                Ok(())
            }
            ClientMessage::InviteToFlight {
                invitee_id,
                flight_code,
            } => {
                self.invite(id, &invitee_id, &flight_code);
                Ok(())
            }
            ClientMessage::Signal { data } => {
                self.relay_signal(id, data);
                Ok(())
            }
        }
    }

    /// Surface a recoverable failure to the client that caused it.
    pub fn report(&self, id: &str, error: &FlightError) {
        counter!(
            "flight_tower_client_errors_total",
            1,
            "reason" => error.metric_label()
        );
        debug!(connection_id = %id, error = %error, "rejecting client request");
        self.send_error(id, error.to_string());
    }

    pub fn send_error(&self, id: &str, message: impl Into<String>) -> bool {
        self.registry.send(
            id,
            ServerMessage::Error {
                message: message.into(),
            },
        )
    }

    /// Queue a close frame for one connection and stop its reader.
    pub fn close(&self, id: &str, code: u16, reason: &str) -> bool {
        match self.registry.outbox(id) {
            Some(outbox) => {
                outbox.close(code, reason);
                true
            }
            None => false,
        }
    }

    pub fn mark_alive(&mut self, id: &str) {
        self.registry.mark_alive(id);
    }

    /// Tell every client the server is going away and close its socket.
    pub fn shutdown(&mut self, message: &str) -> usize {
        let ids = self.registry.ids();
        for id in &ids {
            self.registry.send(
                id,
                ServerMessage::ServerShutdown {
                    message: message.to_string(),
                },
            );
            self.close(id, close_code::AWAY, "server shutting down");
        }
        if !ids.is_empty() {
            warn!(connections = ids.len(), "closing all connections for shutdown");
        }
        ids.len()
    }

    pub fn client(&self, id: &str) -> Option<&ClientMetadata> {
        self.registry.get(id)
    }

    pub fn flight(&self, code: &str) -> Option<&Flight> {
        self.flights.get(code)
    }

    pub fn flight_of(&self, id: &str) -> Option<String> {
        self.registry.get(id).and_then(|meta| meta.flight_code.clone())
    }

    pub fn stats(&self) -> TowerStats {
        TowerStats {
            connections: self.registry.len(),
            flights: self.flights.len(),
            paired_flights: self.flights.paired(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Cloneable handle shared by socket tasks, the liveness monitor and the
/// HTTP side channel. One coarse lock serializes all state access.
#[derive(Clone, Default)]
pub struct Tower {
    inner: Arc<Mutex<Coordinator>>,
}

impl Tower {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one operation against the coordinator. Keep `op` synchronous.
    pub fn with<R>(&self, op: impl FnOnce(&mut Coordinator) -> R) -> R {
        let mut guard = self.inner.lock();
        op(&mut guard)
    }

    pub fn stats(&self) -> TowerStats {
        self.inner.lock().stats()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::Outbound;
    use tokio::sync::mpsc::UnboundedReceiver;

    pub(crate) struct TestClient {
        pub id: String,
        pub rx: UnboundedReceiver<Outbound>,
    }

    pub(crate) struct Harness {
        pub coord: Coordinator,
    }

    impl Harness {
        pub fn connect(&mut self, addr: &str) -> TestClient {
            let (outbox, rx) = Outbox::channel();
            let id = self.coord.register(addr.to_string(), None, outbox);
            TestClient { id, rx }
        }
    }

    pub(crate) fn harness() -> Harness {
        Harness {
            coord: Coordinator::new(),
        }
    }

    pub(crate) fn drain_outbound(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Queued server messages, skipping pings and close frames.
    pub(crate) fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerMessage> {
        drain_outbound(rx)
            .into_iter()
            .filter_map(|frame| match frame {
                Outbound::Message(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    #[test_timeout::timeout]
    fn register_pushes_presence_to_everyone() {
        let mut h = harness();
        let mut a = h.connect("10.0.0.5");
        drain(&mut a.rx);
        let mut b = h.connect("10.0.0.6");
        assert_eq!(
            drain(&mut a.rx),
            vec![ServerMessage::UsersOnNetworkUpdate {
                users: vec![h.coord.client(&b.id).unwrap().peer_info()]
            }]
        );
        assert_eq!(drain(&mut b.rx).len(), 1);
        assert_eq!(h.coord.client(&b.id).unwrap().name, "Anonymous");
    }

    #[test_timeout::timeout]
    fn disconnect_is_idempotent() {
        let mut h = harness();
        let mut a = h.connect("10.0.0.5");
        let mut b = h.connect("10.0.0.6");
        let code = h.coord.create_flight(&a.id).unwrap();
        h.coord.join_flight(&b.id, &code).unwrap();
        drain(&mut b.rx);

        assert!(h.coord.disconnect(&a.id));
        assert!(!h.coord.disconnect(&a.id));
        let to_b = drain(&mut b.rx);
        assert_eq!(
            to_b.iter().filter(|m| **m == ServerMessage::PeerLeft).count(),
            1
        );
        assert!(h.coord.client(&a.id).is_none());

        assert!(h.coord.disconnect(&b.id));
        assert!(h.coord.flight(&code).is_none());
        assert_eq!(h.coord.stats().flights, 0);
        drain(&mut a.rx);
    }

    #[test_timeout::timeout]
    fn handle_routes_errors_to_caller() {
        let mut h = harness();
        let mut a = h.connect("10.0.0.5");
        drain(&mut a.rx);
        let err = h
            .coord
            .handle(
                &a.id,
                ClientMessage::JoinFlight {
                    flight_code: "NOPE00".into(),
                },
            )
            .unwrap_err();
        h.coord.report(&a.id, &err);
        assert_eq!(
            drain(&mut a.rx),
            vec![ServerMessage::Error {
                message: "Flight not found".into()
            }]
        );
        assert!(h.coord.client(&a.id).is_some());
    }

    #[test_timeout::timeout]
    fn shutdown_notifies_and_closes_everyone() {
        let mut h = harness();
        let mut a = h.connect("10.0.0.5");
        drain(&mut a.rx);
        assert_eq!(h.coord.shutdown("maintenance"), 1);
        let frames = drain_outbound(&mut a.rx);
        assert_eq!(
            frames[0],
            Outbound::Message(ServerMessage::ServerShutdown {
                message: "maintenance".into()
            })
        );
        assert!(matches!(
            frames[1],
            Outbound::Close {
                code: close_code::AWAY,
                ..
            }
        ));
    }

    #[test_timeout::timeout]
    fn tower_handle_shares_state() {
        let tower = Tower::new();
        let (outbox, _rx) = Outbox::channel();
        let other = tower.clone();
        let id = tower.with(|coord| coord.register("10.0.0.5".into(), None, outbox));
        assert_eq!(other.stats().connections, 1);
        other.with(|coord| coord.disconnect(&id));
        assert_eq!(tower.stats().connections, 0);
    }
}
