use std::fs;

use futures::StreamExt;
use mrkv::kv::{
    self,
    server::{Kv, KvServer},
};
use tarpc::server::{incoming::Incoming, BaseChannel};
use tarpc::tokio_serde::formats::Json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server = KvServer::new();
    let socket = kv::socket_path();
    let _ = fs::remove_file(&socket);
    let listener = tarpc::serde_transport::unix::listen(&socket, Json::default).await?;
    info!(socket = %socket.display(), "key/value server listening");

    listener
        .filter_map(|r| async { r.ok() })
        .map(BaseChannel::with_defaults)
        .execute(server.serve())
        .await;
    Ok(())
}
