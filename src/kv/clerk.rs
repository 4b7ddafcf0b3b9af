use std::time::Duration;

use tarpc::tokio_serde::formats::Json;
use tarpc::{client, context};
use tokio::time::sleep;
use tracing::debug;

use crate::kv::server::KvClient;

/// How long to wait before resending a request that got no reply.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Client shim for the key/value service. Tags every request with a
/// `(client_id, message_id)` pair and resends the same arguments until a
/// reply arrives, so the server can execute each mutation at most once no
/// matter how often the network makes it look like more.
///
/// The clerk is strictly sequential: one outstanding request at a time, and
/// `message_id` never goes backward. The server's dedup discipline depends
/// on both.
pub struct Clerk {
    client: KvClient,
    client_id: u64,
    message_id: u64,
}

impl Clerk {
    pub fn new(client: KvClient) -> Self {
        Self {
            client,
            // Random 64-bit id; collisions between clerks are not a
            // practical concern at this entropy.
            client_id: rand::random(),
            message_id: 0,
        }
    }

    /// Dial the per-user server socket.
    pub async fn connect() -> anyhow::Result<Self> {
        let transport =
            tarpc::serde_transport::unix::connect(crate::kv::socket_path(), Json::default).await?;
        Ok(Self::new(
            KvClient::new(client::Config::default(), transport).spawn(),
        ))
    }

    pub async fn get(&mut self, key: &str) -> String {
        self.message_id += 1;
        let message_id = self.message_id;
        loop {
            match self
                .client
                .get(context::current(), key.to_owned(), self.client_id, message_id)
                .await
            {
                Ok(value) => {
                    self.release(message_id);
                    return value;
                }
                Err(error) => {
                    debug!(%error, key, "get got no reply, resending");
                    sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Overwrite `key`. The prior value the server reports is discarded.
    pub async fn put(&mut self, key: &str, value: &str) {
        self.message_id += 1;
        let message_id = self.message_id;
        loop {
            match self
                .client
                .put(
                    context::current(),
                    key.to_owned(),
                    value.to_owned(),
                    self.client_id,
                    message_id,
                )
                .await
            {
                Ok(_) => {
                    self.release(message_id);
                    return;
                }
                Err(error) => {
                    debug!(%error, key, "put got no reply, resending");
                    sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Append to `key`, returning the value it held before the append.
    pub async fn append(&mut self, key: &str, value: &str) -> String {
        self.message_id += 1;
        let message_id = self.message_id;
        loop {
            match self
                .client
                .append(
                    context::current(),
                    key.to_owned(),
                    value.to_owned(),
                    self.client_id,
                    message_id,
                )
                .await
            {
                Ok(old) => {
                    self.release(message_id);
                    return old;
                }
                Err(error) => {
                    debug!(%error, key, "append got no reply, resending");
                    sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Fire-and-forget hint that lets the server drop our dedup entry.
    /// Losing it only costs the server memory; the entry is replaced by our
    /// next mutation anyway.
    fn release(&self, message_id: u64) {
        let client = self.client.clone();
        let client_id = self.client_id;
        tokio::spawn(async move {
            let _ = client
                .complete_op(context::current(), client_id, message_id)
                .await;
        });
    }
}
