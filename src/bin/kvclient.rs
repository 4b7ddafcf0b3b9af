use std::env;

use mrkv::kv::clerk::Clerk;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = env::args().collect::<Vec<String>>();
    let mut clerk = Clerk::connect().await?;
    match args.get(1).map(String::as_str) {
        Some("get") if args.len() == 3 => println!("{}", clerk.get(&args[2]).await),
        Some("put") if args.len() == 4 => clerk.put(&args[2], &args[3]).await,
        Some("append") if args.len() == 4 => println!("{}", clerk.append(&args[2], &args[3]).await),
        _ => println!("Usage: kvclient get <key> | put <key> <value> | append <key> <value>"),
    }
    Ok(())
}
