//! Flight tower: pairs exactly two clients into an ephemeral flight, relays
//! their WebRTC negotiation, and tells unpaired clients who else is nearby.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod flights;
pub mod http;
pub mod ids;
pub mod liveness;
pub mod network;
pub mod origin;
pub mod presence;
pub mod protocol;
pub mod registry;
mod relay;
pub mod server;
pub mod socket;
pub mod telemetry;

pub use config::{Cli, ServerConfig};
pub use coordinator::{Coordinator, Tower, TowerStats};
pub use error::FlightError;
pub use protocol::{ClientMessage, ConnectionType, PeerInfo, ServerMessage};
