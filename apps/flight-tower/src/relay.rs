use metrics::counter;
use tracing::{debug, info};

use crate::coordinator::Coordinator;
use crate::protocol::ServerMessage;

impl Coordinator {
    /// Forward an opaque negotiation payload to the other members of the
    /// sender's flight. Returns how many members it was queued for.
    pub fn relay_signal(&self, id: &str, data: serde_json::Value) -> usize {
        let Some(code) = self.registry.get(id).and_then(|meta| meta.flight_code.as_deref()) else {
            debug!(connection_id = %id, "dropping signal from client outside a flight");
            return 0;
        };
        let Some(flight) = self.flights.get(code) else {
            debug!(connection_id = %id, flight_code = %code, "dropping signal for closed flight");
            return 0;
        };

        let mut delivered = 0usize;
        for member in flight.members.iter().filter(|member| *member != id) {
            if !self.registry.is_live(member) {
                continue;
            }
            if self
                .registry
                .send(member, ServerMessage::Signal { data: data.clone() })
            {
                delivered += 1;
            }
        }
        if delivered > 0 {
            counter!("flight_tower_signals_relayed_total", delivered as u64);
        }
        delivered
    }

    /// Best-effort invitation to any live client. Unknown or closed targets
    /// are only logged.
    pub fn invite(&self, id: &str, invitee_id: &str, flight_code: &str) -> bool {
        let Some(sender) = self.registry.get(id) else {
            return false;
        };
        if !self.registry.is_live(invitee_id) {
            info!(
                connection_id = %id,
                invitee_id = %invitee_id,
                "invitation target not connected"
            );
            return false;
        }
        let delivered = self.registry.send(
            invitee_id,
            ServerMessage::FlightInvitation {
                flight_code: flight_code.to_string(),
                from_name: sender.name.clone(),
            },
        );
        if delivered {
            counter!("flight_tower_invitations_total", 1);
            debug!(
                connection_id = %id,
                invitee_id = %invitee_id,
                flight_code = %flight_code,
                "invitation relayed"
            );
        }
        delivered
    }
}
