use std::{env, fs, time::Duration};

use futures::StreamExt;
use mrkv::mr::{
    self,
    coordinator::{Coordinator, Scheduler},
};
use tarpc::server::{incoming::Incoming, BaseChannel};
use tarpc::tokio_serde::formats::Json;
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = env::args().collect::<Vec<String>>();
    if args.len() < 3 {
        println!("Usage: mrcoordinator <reduce task number> <input file>...");
        return Ok(());
    }
    let n_reduce = args[1].parse::<usize>()?;
    let files = args[2..].to_vec();

    info!(n_map = files.len(), n_reduce, "starting coordinator");
    let coordinator = Coordinator::new(files, n_reduce);

    let socket = mr::socket_path();
    // A socket left behind by an earlier run would make the bind fail.
    let _ = fs::remove_file(&socket);
    let listener = tarpc::serde_transport::unix::listen(&socket, Json::default).await?;
    tokio::spawn(
        listener
            .filter_map(|r| async { r.ok() })
            .map(BaseChannel::with_defaults)
            .execute(coordinator.clone().serve()),
    );
    info!(socket = %socket.display(), "serving, waiting for workers");

    while !coordinator.done() {
        sleep(Duration::from_millis(500)).await;
    }
    info!("all reduce tasks completed, shutting down");
    let _ = fs::remove_file(&socket);
    Ok(())
}
