use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crate::origin::OriginPolicy;
use crate::protocol::{DEFAULT_MAX_FRAME_BYTES, DEFAULT_TRANSPORT_MAX_BYTES};

#[derive(Debug, Parser)]
#[command(
    name = "flight-tower",
    author,
    version,
    about = "Pairs two clients into a flight and brokers their WebRTC handshake"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "FLIGHT_TOWER_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Origins allowed to open a WebSocket (comma separated).
    #[arg(
        long,
        env = "FLIGHT_TOWER_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = "https://flight.local"
    )]
    pub allowed_origins: Vec<String>,

    /// Also accept loopback origins and requests without an Origin header.
    #[arg(long, env = "FLIGHT_TOWER_PERMISSIVE_ORIGINS", default_value_t = false)]
    pub permissive_origins: bool,

    /// Use the first X-Forwarded-For hop as the client address.
    #[arg(long, env = "FLIGHT_TOWER_TRUST_PROXY", default_value_t = false)]
    pub trust_proxy: bool,

    /// Seconds between liveness probes.
    #[arg(long, env = "FLIGHT_TOWER_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Largest inbound frame, in bytes, that is processed.
    #[arg(long, env = "FLIGHT_TOWER_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    /// Largest frame the websocket layer reads at all; bigger frames close
    /// the connection.
    #[arg(long, env = "FLIGHT_TOWER_TRANSPORT_MAX_BYTES", default_value_t = DEFAULT_TRANSPORT_MAX_BYTES)]
    pub transport_max_bytes: usize,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, env = "FLIGHT_TOWER_OTEL_STDOUT", default_value_t = false)]
    pub otel_stdout: bool,

    /// Time allowed for connections to drain during shutdown.
    #[arg(long, env = "FLIGHT_TOWER_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub origin_policy: OriginPolicy,
    pub trust_proxy: bool,
    pub heartbeat_interval: Duration,
    pub max_frame_bytes: usize,
    pub transport_max_bytes: usize,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Ceiling handed to the websocket layer. Never below the application
    /// ceiling, so oversize frames are answered rather than dropped.
    pub fn transport_limit(&self) -> usize {
        self.transport_max_bytes.max(self.max_frame_bytes)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            origin_policy: OriginPolicy::strict(["https://flight.local"]),
            trust_proxy: false,
            heartbeat_interval: Duration::from_secs(30),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            transport_max_bytes: DEFAULT_TRANSPORT_MAX_BYTES,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        anyhow::ensure!(
            cli.heartbeat_interval_secs > 0,
            "heartbeat interval must be at least one second"
        );
        anyhow::ensure!(cli.max_frame_bytes > 0, "max frame size must be positive");
        anyhow::ensure!(
            cli.transport_max_bytes >= cli.max_frame_bytes,
            "transport ceiling must not be below the max frame size"
        );

        let origin_policy = if cli.permissive_origins {
            OriginPolicy::permissive(&cli.allowed_origins)
        } else {
            OriginPolicy::strict(&cli.allowed_origins)
        };

        Ok(ServerConfig {
            listen_addr,
            origin_policy,
            trust_proxy: cli.trust_proxy,
            heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
            max_frame_bytes: cli.max_frame_bytes,
            transport_max_bytes: cli.transport_max_bytes,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
