use std::collections::HashMap;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::error::FlightError;
use crate::ids::{generate_unique_flight_code, FLIGHT_CODE_LEN};
use crate::network::connection_type;
use crate::protocol::ServerMessage;

pub const MAX_MEMBERS: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct Flight {
    pub code: String,
    /// Connection ids in join order; the creator comes first.
    pub members: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Flight {
    pub fn is_full(&self) -> bool {
        self.members.len() >= MAX_MEMBERS
    }

    pub fn creator(&self) -> Option<&str> {
        self.members.first().map(String::as_str)
    }
}

/// What remains of a flight after a member leaves.
#[derive(Debug, PartialEq, Eq)]
pub enum Departure {
    NotMember,
    Remaining(Vec<String>),
    Emptied,
}

#[derive(Default)]
pub struct FlightTable {
    flights: HashMap<String, Flight>,
}

impl FlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, creator: &str) -> Result<String, FlightError> {
        let code = generate_unique_flight_code(|candidate| self.flights.contains_key(candidate))
            .ok_or_else(|| FlightError::Capacity("No flight codes available".into()))?;
        self.flights.insert(
            code.clone(),
            Flight {
                code: code.clone(),
                members: vec![creator.to_string()],
                created_at: Utc::now(),
            },
        );
        Ok(code)
    }

    pub fn get(&self, code: &str) -> Option<&Flight> {
        self.flights.get(code)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.flights.contains_key(code)
    }

    pub fn add_member(&mut self, code: &str, member: &str) -> Result<&Flight, FlightError> {
        let flight = self
            .flights
            .get_mut(code)
            .ok_or_else(FlightError::flight_not_found)?;
        if flight.is_full() {
            return Err(FlightError::flight_full());
        }
        flight.members.push(member.to_string());
        Ok(flight)
    }

    /// Remove `member` from flight `code`, dropping the flight once empty.
    pub fn remove_member(&mut self, code: &str, member: &str) -> Departure {
        let Some(flight) = self.flights.get_mut(code) else {
            return Departure::NotMember;
        };
        let before = flight.members.len();
        flight.members.retain(|id| id != member);
        if flight.members.len() == before {
            return Departure::NotMember;
        }
        if flight.members.is_empty() {
            self.flights.remove(code);
            Departure::Emptied
        } else {
            Departure::Remaining(flight.members.clone())
        }
    }

    pub fn remove(&mut self, code: &str) -> Option<Flight> {
        self.flights.remove(code)
    }

    pub fn flights(&self) -> impl Iterator<Item = &Flight> {
        self.flights.values()
    }

    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }

    pub fn paired(&self) -> usize {
        self.flights.values().filter(|flight| flight.is_full()).count()
    }
}

impl Coordinator {
    pub fn create_flight(&mut self, id: &str) -> Result<String, FlightError> {
        let meta = self
            .registry
            .get(id)
            .ok_or_else(|| FlightError::NotFound("Client not registered".into()))?;
        if meta.flight_code.is_some() {
            return Err(FlightError::conflict("Already in a flight"));
        }

        let code = self.flights.open(id)?;
        self.registry.set_flight(id, Some(code.clone()));
        self.registry.send(
            id,
            ServerMessage::FlightCreated {
                flight_code: code.clone(),
            },
        );

        counter!("flight_tower_flights_created_total", 1);
        gauge!("flight_tower_flights_active", self.flights.len() as f64);
        info!(connection_id = %id, flight_code = %code, "flight created");

        self.broadcast_presence();
        Ok(code)
    }

    pub fn join_flight(&mut self, id: &str, code: &str) -> Result<(), FlightError> {
        if code.chars().count() != FLIGHT_CODE_LEN {
            return Err(FlightError::validation(format!(
                "Flight code must be {FLIGHT_CODE_LEN} characters"
            )));
        }
        let meta = self
            .registry
            .get(id)
            .ok_or_else(|| FlightError::NotFound("Client not registered".into()))?;
        if meta.flight_code.is_some() {
            return Err(FlightError::conflict("Already in a flight"));
        }

        let flight = self.flights.get(code).ok_or_else(FlightError::flight_not_found)?;
        if flight.is_full() {
            return Err(FlightError::flight_full());
        }
        let creator = flight.creator().map(str::to_string);
        match creator {
            Some(creator) if self.registry.is_live(&creator) => {}
            _ => {
                warn!(flight_code = %code, "creator of flight is gone, tearing down");
                self.teardown_stale_flight(code);
                return Err(FlightError::creator_gone());
            }
        }

        let members = self.flights.add_member(code, id)?.members.clone();
        self.registry.set_flight(id, Some(code.to_string()));

        let (first, second) = (&members[0], &members[1]);
        let (Some(first_meta), Some(second_meta)) =
            (self.registry.get(first), self.registry.get(second))
        else {
            return Err(FlightError::creator_gone());
        };
        let kind = connection_type(&first_meta.source_address, &second_meta.source_address);
        let first_info = first_meta.peer_info();
        let second_info = second_meta.peer_info();

        self.registry.send(
            first,
            ServerMessage::PeerJoined {
                flight_code: code.to_string(),
                connection_type: kind,
                peer: second_info,
            },
        );
        self.registry.send(
            second,
            ServerMessage::PeerJoined {
                flight_code: code.to_string(),
                connection_type: kind,
                peer: first_info,
            },
        );

        counter!("flight_tower_flights_paired_total", 1);
        info!(
            connection_id = %id,
            flight_code = %code,
            connection_type = ?kind,
            "flight paired"
        );

        self.broadcast_presence();
        Ok(())
    }

    /// Detach `id` from its flight, if any, and notify whoever remains.
    /// Presence is always recomputed.
    pub fn leave_flight(&mut self, id: &str) {
        self.detach(id);
        self.broadcast_presence();
    }

    pub(crate) fn detach(&mut self, id: &str) {
        let Some(code) = self.registry.get(id).and_then(|meta| meta.flight_code.clone()) else {
            return;
        };
        self.registry.set_flight(id, None);

        match self.flights.remove_member(&code, id) {
            Departure::Remaining(members) => {
                for member in &members {
                    self.registry.send(member, ServerMessage::PeerLeft);
                }
                info!(connection_id = %id, flight_code = %code, "member left flight");
            }
            Departure::Emptied => {
                info!(flight_code = %code, "flight closed");
            }
            Departure::NotMember => {
                debug!(connection_id = %id, flight_code = %code, "flight already gone");
            }
        }
        gauge!("flight_tower_flights_active", self.flights.len() as f64);
    }

    fn teardown_stale_flight(&mut self, code: &str) {
        if let Some(flight) = self.flights.remove(code) {
            for member in &flight.members {
                self.registry.set_flight(member, None);
            }
        }
        gauge!("flight_tower_flights_active", self.flights.len() as f64);
    }
}
