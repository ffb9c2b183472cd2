use anyhow::Context;
use tracing::info;

fn main() -> anyhow::Result<()> {
    qecho::telemetry::init()?;

    let config = qecho::config::load()?;
    info!(?config, "configuration loaded");

    // The data plane is strictly serial: one thread owns the socket, the
    // endpoint, and all connection state.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    runtime.block_on(async move {
        let server = qecho::server::Server::bind(config)?;
        server.run().await
    })
}
