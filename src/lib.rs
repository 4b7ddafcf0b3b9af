//! Two small distributed subsystems sharing one RPC style: a MapReduce
//! coordinator/worker pair with crash recovery via timeouts, and a
//! single-node linearizable key/value service with at-most-once semantics
//! for mutating operations under an unreliable network.

use std::path::PathBuf;

pub mod kv;
pub mod mr;

/// A per-user socket path in `/var/tmp`, so co-tenant runs on a shared
/// machine do not collide.
pub(crate) fn user_socket(prefix: &str) -> PathBuf {
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/var/tmp/{}-{}.sock", prefix, uid))
}
