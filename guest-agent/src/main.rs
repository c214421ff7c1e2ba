//! Guest exec agent (C4): listens for a single framed command request per
//! connection and runs it with an optional pseudo-terminal, streaming
//! output back until the process exits.

mod connection;
mod env;
mod exec;

use tokio_vsock::VMADDR_CID_ANY;
use tokio_vsock::VsockAddr;
use tokio_vsock::VsockListener;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let transport = std::env::var("CLEANROOM_GUEST_TRANSPORT").unwrap_or_default();
    if transport.trim().eq_ignore_ascii_case("stdio") {
        run_stdio().await;
        return;
    }

    let port = match std::env::var("CLEANROOM_VSOCK_PORT") {
        Ok(raw) => match raw.parse::<u32>() {
            Ok(port) => port,
            Err(_) => {
                tracing::error!(raw = %raw, "invalid CLEANROOM_VSOCK_PORT, must be a decimal u32");
                std::process::exit(2);
            }
        },
        Err(_) => u32::from(cleanroom_wire::DEFAULT_GUEST_PORT),
    };

    run_vsock(port).await;
}

async fn run_stdio() {
    tracing::info!("guest agent listening on stdio");
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    connection::handle_connection(stdin, stdout).await;
}

async fn run_vsock(port: u32) {
    let addr = VsockAddr::new(VMADDR_CID_ANY, port);
    let listener = match VsockListener::bind(addr) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, port, "failed to bind vsock listener");
            std::process::exit(1);
        }
    };
    tracing::info!(port, "guest agent listening on vsock");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(?peer, "accepted vsock connection");
                let (reader, writer) = tokio::io::split(stream);
                connection::handle_connection(reader, writer).await;
            }
            Err(err) => {
                tracing::warn!(%err, "vsock accept failed");
            }
        }
    }
}
