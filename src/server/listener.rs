use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::http::{Connection, Handler};

/// Binds `addr` and serves every connection with `handler` until the
/// listener itself fails.
pub async fn run(addr: &str, handler: Arc<dyn Handler>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", listener.local_addr()?);

    serve(listener, handler).await
}

/// Serves an already-bound listener; tests use this with port 0.
pub async fn serve(listener: TcpListener, handler: Arc<dyn Handler>) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!("Accepted connection from {}", peer);

        let handler = handler.clone();
        tokio::spawn(async move {
            let mut conn = Connection::new(socket, peer, handler);
            if let Err(e) = conn.run().await {
                tracing::error!("Connection error from {}: {}", peer, e);
            }
        });
    }
}
