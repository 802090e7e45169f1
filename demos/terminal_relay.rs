use std::{env, sync::Arc};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tstream_hub::{config::Config, hub::Hub, transport};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().expect("Failed to read TSTREAM_* configuration");
    let hub = Arc::new(Hub::new(config));

    let closed = CancellationToken::new();
    {
        let hub = hub.clone();
        let closed = closed.clone();
        tokio::spawn(async move {
            hub.idle_scan_loop(closed).await;
        });
    }

    let port = env::var("PORT").unwrap_or_else(|_| "4000".to_string());
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                tracing::debug!("Accepted connection from {}", addr);
                let hub = hub.clone();
                tokio::spawn(async move {
                    serve(hub, stream).await;
                });
            }
        }
    }

    closed.cancel();
    hub.close().await;
    Ok(())
}

async fn serve(hub: Arc<Hub>, stream: TcpStream) {
    let socket = match tokio_tungstenite::accept_async(stream).await {
        Ok(socket) => socket,
        Err(err) => {
            tracing::error!("WebSocket upgrade failed: {}", err);
            return;
        }
    };
    if let Err(err) = hub.accept(transport::websocket(socket)).await {
        tracing::debug!("Connection finished: {}", err);
    }
}
