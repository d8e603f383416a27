// Listener: accepts tunnel connections and spawns one tunnel task per
// connection. Carries no protocol state of its own.

use crate::config::Config;
use crate::tunnel;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Bind `config.server_address:config.server_port` and accept tunnel
/// connections until the process is asked to shut down.
///
/// Runs until `shutdown` resolves (typically ctrl-c); in-flight tunnels are
/// not waited on, matching the teardown semantics of an individual tunnel
/// dying (§5): dropping their tasks is enough, nothing further to flush.
pub async fn run(config: Config, shutdown: impl std::future::Future<Output = ()>) -> crate::Result<()> {
    let config = Arc::new(config);
    let addr = std::net::SocketAddr::new(config.server_address, config.server_port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening for tunnel connections");

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::info!(%peer, "accepted tunnel connection");
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    tunnel::run(stream, config).await;
                });
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown requested, no longer accepting new tunnels");
                return Ok(());
            }
        }
    }
}
