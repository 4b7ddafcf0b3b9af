use std::fmt::Write as _;
use std::fs::{self, File};
use std::hash::Hasher;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use fnv::FnvHasher;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tarpc::context;
use tempfile::NamedTempFile;
use tokio::time::sleep;
use tracing::{error, info};

use crate::mr::coordinator::{SchedulerClient, TaskAssignment, TaskKind};

/// A single record emitted by a map function and consumed by a reduce
/// function.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: String, value: String) -> Self {
        Self { key, value }
    }
}

/// User-provided map function: `(input filename, contents)` to records.
pub type MapFn = fn(&str, &str) -> Vec<KeyValue>;
/// User-provided reduce function: `(key, all values for that key)` to output.
pub type ReduceFn = fn(&str, &[String]) -> String;

/// How long to wait before asking again when nothing is available.
const BACKOFF: Duration = Duration::from_millis(500);

/// A task body ready to run on the blocking pool.
type Job = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Pulls one task at a time from the coordinator and executes it. Holds no
/// shared state; any number of workers may run against one coordinator.
pub struct Worker {
    client: SchedulerClient,
    dir: PathBuf,
    mapf: MapFn,
    reducef: ReduceFn,
}

impl Worker {
    pub fn new(
        client: SchedulerClient,
        dir: impl Into<PathBuf>,
        mapf: MapFn,
        reducef: ReduceFn,
    ) -> Self {
        Self {
            client,
            dir: dir.into(),
            mapf,
            reducef,
        }
    }

    /// Pull and execute tasks until the coordinator goes away, which is how
    /// workers learn the job is over. A local failure is logged and never
    /// reported; the coordinator will time the task out and hand it to
    /// someone else.
    pub async fn run(&self) -> anyhow::Result<()> {
        loop {
            let assignment = match self.client.request_task(context::current()).await {
                Ok(assignment) => assignment,
                Err(error) => {
                    info!(%error, "coordinator unreachable, worker exiting");
                    return Ok(());
                }
            };
            let (kind, index, job): (TaskKind, usize, Job) = match assignment {
                TaskAssignment::Map {
                    index,
                    input,
                    n_reduce,
                } => {
                    let dir = self.dir.clone();
                    let mapf = self.mapf;
                    (
                        TaskKind::Map,
                        index,
                        Box::new(move || do_map(&dir, mapf, index, &input, n_reduce)),
                    )
                }
                TaskAssignment::Reduce { index, n_map } => {
                    let dir = self.dir.clone();
                    let reducef = self.reducef;
                    (
                        TaskKind::Reduce,
                        index,
                        Box::new(move || do_reduce(&dir, reducef, index, n_map)),
                    )
                }
                TaskAssignment::None => {
                    sleep(BACKOFF).await;
                    continue;
                }
            };
            // Task bodies block on file I/O and sorting, so they run off the
            // runtime threads.
            let outcome = tokio::task::spawn_blocking(job)
                .await
                .map_err(anyhow::Error::new)
                .and_then(|result| result);
            if let Err(error) = outcome {
                error!(%error, ?kind, index, "task failed");
                sleep(BACKOFF).await;
                continue;
            }
            if let Err(error) = self.client.report_task(context::current(), kind, index).await {
                info!(%error, "coordinator unreachable, worker exiting");
                return Ok(());
            }
        }
    }
}

/// Stable assignment of a key to one of `n_reduce` buckets. Every worker
/// process must agree on this mapping, so the hash cannot be seeded per
/// process the way `DefaultHasher` is.
pub fn partition(key: &str, n_reduce: usize) -> usize {
    let mut hasher = FnvHasher::default();
    hasher.write(key.as_bytes());
    (hasher.finish() % n_reduce as u64) as usize
}

/// Run one map task: read the input split, partition the emitted records by
/// key, and publish bucket `j` as `mr-<index>-<j>`, one JSON record per line.
fn do_map(dir: &Path, mapf: MapFn, index: usize, input: &str, n_reduce: usize) -> anyhow::Result<()> {
    let contents =
        fs::read_to_string(input).with_context(|| format!("cannot read input {}", input))?;
    let records = mapf(input, &contents);

    let mut buckets: Vec<Vec<KeyValue>> = vec![Vec::new(); n_reduce];
    for record in records {
        let bucket = partition(&record.key, n_reduce);
        buckets[bucket].push(record);
    }

    for (j, bucket) in buckets.iter().enumerate() {
        let mut encoded = String::new();
        for record in bucket {
            encoded.push_str(&serde_json::to_string(record)?);
            encoded.push('\n');
        }
        publish(dir, &format!("mr-{}-{}", index, j), encoded.as_bytes())?;
    }
    info!(index, "map task finished");
    Ok(())
}

/// Run one reduce task: gather bucket `index` of every map task's output,
/// sort and group by key, reduce each group, and publish `mr-out-<index>`.
fn do_reduce(dir: &Path, reducef: ReduceFn, index: usize, n_map: usize) -> anyhow::Result<()> {
    let mut records: Vec<KeyValue> = Vec::new();
    for i in 0..n_map {
        let path = dir.join(format!("mr-{}-{}", i, index));
        let file = File::open(&path)
            .with_context(|| format!("cannot open intermediate file {}", path.display()))?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
    }
    records.par_sort();

    let mut out = String::new();
    let mut start = 0;
    while start < records.len() {
        let mut end = start + 1;
        while end < records.len() && records[end].key == records[start].key {
            end += 1;
        }
        let values: Vec<String> = records[start..end].iter().map(|r| r.value.clone()).collect();
        let reduced = reducef(&records[start].key, &values);
        writeln!(out, "{} {}", records[start].key, reduced)?;
        start = end;
    }
    publish(dir, &format!("mr-out-{}", index), out.as_bytes())?;
    info!(index, "reduce task finished");
    Ok(())
}

/// Write to a temporary file in `dir` and rename into place, so the final
/// name is never observed with partial contents. Duplicate workers publishing
/// the same name overwrite each other with equivalent data.
fn publish(dir: &Path, name: &str, contents: &[u8]) -> anyhow::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.persist(dir.join(name))
        .with_context(|| format!("cannot publish {}", name))?;
    Ok(())
}
