use anyhow::Result;
use clap::Parser;
use tracing::info;

use flight_tower::{server, telemetry::Telemetry, Cli, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = Telemetry::init(cli.otel_stdout)?;

    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        permissive_origins = config.origin_policy.is_permissive(),
        trust_proxy = config.trust_proxy,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        max_frame_bytes = config.max_frame_bytes,
        transport_max_bytes = config.transport_limit(),
        "starting flight-tower"
    );

    server::run(config, Some(telemetry.metrics_handle())).await
}
