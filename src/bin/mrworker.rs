use std::env;

use anyhow::Context as _;
use mrkv::mr::{
    self,
    coordinator::SchedulerClient,
    function::wc,
    worker::{MapFn, ReduceFn, Worker},
};
use tarpc::{client, tokio_serde::formats::Json};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = env::args().collect::<Vec<String>>();
    let app = args.get(1).map(String::as_str).unwrap_or("wc");
    let (mapf, reducef) = match app {
        "wc" => (wc::map as MapFn, wc::reduce as ReduceFn),
        other => anyhow::bail!("unknown application {}", other),
    };

    let transport = tarpc::serde_transport::unix::connect(mr::socket_path(), Json::default)
        .await
        .context("cannot reach the coordinator, is it running?")?;
    let client = SchedulerClient::new(client::Config::default(), transport).spawn();

    info!(app, "worker connected");
    let worker = Worker::new(client, env::current_dir()?, mapf, reducef);
    worker.run().await
}
