use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{ready, Ready};
use tarpc::context;
use tracing::{debug, warn};

/// The most recent mutating request a client has executed, kept so a retry of
/// that exact request can be answered without touching the store again.
#[derive(Debug)]
struct DedupEntry {
    message_id: u64,
    /// Value at the key before the mutation; this is what the reply carried,
    /// and the one thing the server cannot reconstruct after applying it.
    prior_value: String,
}

#[derive(Debug, Default)]
struct KvState {
    store: HashMap<String, String>,
    /// At most one entry per client: the client is strictly sequential, so
    /// only its latest mutating message can ever be retried.
    dedup: HashMap<u64, DedupEntry>,
}

/// Single-node key/value store with at-most-once execution of mutations.
/// Every operation runs under one lock, so results are linearizable in
/// lock-acquisition order; nothing inside the critical section does I/O.
#[derive(Debug, Clone, Default)]
pub struct KvServer {
    state: Arc<Mutex<KvState>>,
}

impl KvServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a key, "" if absent. Reads take no part in de-duplication.
    pub fn get(&self, key: &str) -> String {
        let state = self.state.lock().unwrap();
        state.store.get(key).cloned().unwrap_or_default()
    }

    /// Overwrite `key` with `value`, returning the prior value.
    pub fn put(&self, key: String, value: String, client_id: u64, message_id: u64) -> String {
        self.mutate(client_id, message_id, key, value, |_old, new| new)
    }

    /// Append `value` to `key`, returning the prior value.
    pub fn append(&self, key: String, value: String, client_id: u64, message_id: u64) -> String {
        self.mutate(client_id, message_id, key, value, |old, new| {
            let mut appended = old.to_owned();
            appended.push_str(&new);
            appended
        })
    }

    /// Shared discipline for the mutating operations: replay a duplicate,
    /// drop a stale id, apply a fresh one exactly once.
    fn mutate(
        &self,
        client_id: u64,
        message_id: u64,
        key: String,
        value: String,
        apply: impl FnOnce(&str, String) -> String,
    ) -> String {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        match state.dedup.get(&client_id) {
            Some(entry) if entry.message_id == message_id => {
                debug!(client_id, message_id, "duplicate mutation, replaying stored reply");
                return entry.prior_value.clone();
            }
            Some(entry) if message_id < entry.message_id => {
                // A conforming client never regresses its message id, so this
                // request is not one the dedup table can answer; whatever
                // produced it must not be applied over newer state.
                warn!(
                    client_id,
                    message_id,
                    last = entry.message_id,
                    "stale mutation dropped"
                );
                return String::new();
            }
            _ => {}
        }
        let old = state.store.get(&key).cloned().unwrap_or_default();
        let new = apply(&old, value);
        state.store.insert(key, new);
        state.dedup.insert(
            client_id,
            DedupEntry {
                message_id,
                prior_value: old.clone(),
            },
        );
        old
    }

    /// The client has seen the reply for `message_id` and promises never to
    /// retry it or anything older; its dedup entry can be reclaimed. A hint
    /// only: losing it costs memory, not correctness. The id comparison keeps
    /// a delayed hint from discarding the entry of a newer mutation.
    pub fn complete_op(&self, client_id: u64, message_id: u64) {
        let mut state = self.state.lock().unwrap();
        let acknowledged = state
            .dedup
            .get(&client_id)
            .map_or(false, |entry| entry.message_id <= message_id);
        if acknowledged {
            state.dedup.remove(&client_id);
            debug!(client_id, message_id, "dedup entry reclaimed");
        }
    }
}

/// RPC surface the clerks drive.
#[tarpc::service]
pub trait Kv {
    /// Read a key, "" if absent.
    async fn get(key: String, client_id: u64, message_id: u64) -> String;
    /// Overwrite a key, returning the value it held before.
    async fn put(key: String, value: String, client_id: u64, message_id: u64) -> String;
    /// Append to a key, returning the value it held before.
    async fn append(key: String, value: String, client_id: u64, message_id: u64) -> String;
    /// Reclaim the caller's dedup entry once a reply has been received.
    async fn complete_op(client_id: u64, message_id: u64);
}

#[tarpc::server]
impl Kv for KvServer {
    type GetFut = Ready<String>;
    type PutFut = Ready<String>;
    type AppendFut = Ready<String>;
    type CompleteOpFut = Ready<()>;

    fn get(self, _: context::Context, key: String, _client_id: u64, _message_id: u64) -> Self::GetFut {
        ready(KvServer::get(&self, &key))
    }

    fn put(
        self,
        _: context::Context,
        key: String,
        value: String,
        client_id: u64,
        message_id: u64,
    ) -> Self::PutFut {
        ready(KvServer::put(&self, key, value, client_id, message_id))
    }

    fn append(
        self,
        _: context::Context,
        key: String,
        value: String,
        client_id: u64,
        message_id: u64,
    ) -> Self::AppendFut {
        ready(KvServer::append(&self, key, value, client_id, message_id))
    }

    fn complete_op(self, _: context::Context, client_id: u64, message_id: u64) -> Self::CompleteOpFut {
        KvServer::complete_op(&self, client_id, message_id);
        ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_read_as_empty() {
        let kv = KvServer::new();
        assert_eq!(KvServer::get(&kv, "nope"), "");
    }

    #[test]
    fn duplicate_put_replays_the_stored_reply() {
        let kv = KvServer::new();
        assert_eq!(KvServer::put(&kv, "k".into(), "v1".into(), 7, 1), "");
        // The reply was lost and the client retried the same message.
        assert_eq!(KvServer::put(&kv, "k".into(), "v1".into(), 7, 1), "");
        assert_eq!(KvServer::get(&kv, "k"), "v1");
    }

    #[test]
    fn duplicate_append_is_applied_once() {
        let kv = KvServer::new();
        assert_eq!(KvServer::append(&kv, "k".into(), "A".into(), 7, 1), "");
        assert_eq!(KvServer::append(&kv, "k".into(), "A".into(), 7, 1), "");
        assert_eq!(KvServer::get(&kv, "k"), "A");
    }

    #[test]
    fn append_returns_the_prior_value() {
        let kv = KvServer::new();
        assert_eq!(KvServer::append(&kv, "k".into(), "A".into(), 7, 1), "");
        assert_eq!(KvServer::append(&kv, "k".into(), "B".into(), 7, 2), "A");
        assert_eq!(KvServer::get(&kv, "k"), "AB");
    }

    #[test]
    fn clients_have_independent_dedup_state() {
        let kv = KvServer::new();
        assert_eq!(KvServer::put(&kv, "k".into(), "x".into(), 1, 1), "");
        assert_eq!(KvServer::append(&kv, "k".into(), "y".into(), 2, 1), "x");
        assert_eq!(KvServer::get(&kv, "k"), "xy");
    }

    #[test]
    fn reads_do_not_disturb_dedup_state() {
        let kv = KvServer::new();
        assert_eq!(KvServer::put(&kv, "k".into(), "v1".into(), 7, 1), "");
        let _ = KvServer::get(&kv, "k");
        // A late retry of the put still hits the dedup entry.
        assert_eq!(KvServer::put(&kv, "k".into(), "v1".into(), 7, 1), "");
        assert_eq!(KvServer::get(&kv, "k"), "v1");
    }

    #[test]
    fn stale_message_ids_are_never_applied() {
        let kv = KvServer::new();
        assert_eq!(KvServer::append(&kv, "k".into(), "A".into(), 7, 1), "");
        assert_eq!(KvServer::append(&kv, "k".into(), "B".into(), 7, 2), "A");
        // A regressed id violates the client contract; it must not mutate.
        KvServer::append(&kv, "k".into(), "X".into(), 7, 1);
        assert_eq!(KvServer::get(&kv, "k"), "AB");
    }

    #[test]
    fn complete_op_frees_the_entry_without_changing_results() {
        let kv = KvServer::new();
        assert_eq!(KvServer::put(&kv, "k".into(), "v1".into(), 7, 1), "");
        KvServer::complete_op(&kv, 7, 1);
        assert_eq!(KvServer::put(&kv, "k".into(), "v2".into(), 7, 2), "v1");
        assert_eq!(KvServer::get(&kv, "k"), "v2");
    }

    #[test]
    fn delayed_complete_op_spares_newer_state() {
        let kv = KvServer::new();
        assert_eq!(KvServer::put(&kv, "k".into(), "v1".into(), 7, 1), "");
        assert_eq!(KvServer::append(&kv, "k".into(), "y".into(), 7, 2), "v1");
        // The hint for message 1 arrives after message 2 already executed.
        KvServer::complete_op(&kv, 7, 1);
        // A retry of message 2 must still hit the dedup entry.
        assert_eq!(KvServer::append(&kv, "k".into(), "y".into(), 7, 2), "v1");
        assert_eq!(KvServer::get(&kv, "k"), "v1y");
    }
}
