use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::AppContext;
use super::http::serve_connection;

pub async fn start_listener(app: AppContext) -> Result<()> {
    let listen = app.settings.listen();
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(address = %listener.local_addr()?, "listen");
    serve(app, listener).await
}

/// Accept loop over an already-bound listener. One handling task per
/// connection; connection errors are logged and never take down the loop.
pub async fn serve(app: AppContext, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                debug!(error = %err, "accept failed");
                continue;
            }
        };
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(&app, stream, peer).await {
                debug!(peer = %peer, error = %err, "connection closed with error");
            }
        });
    }
}
