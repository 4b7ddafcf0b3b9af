use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{ready, Ready};
use serde::{Deserialize, Serialize};
use tarpc::context;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long a dispatched task may run before it becomes eligible for
/// reassignment to another worker.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Map,
    Reduce,
}

/// What the coordinator hands a worker asking for work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskAssignment {
    Map {
        index: usize,
        input: String,
        n_reduce: usize,
    },
    Reduce {
        index: usize,
        n_map: usize,
    },
    /// Nothing available right now; back off and ask again.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskStatus {
    Idle,
    InProgress,
    Completed,
}

#[derive(Debug)]
struct Task {
    /// Source file for map tasks; reduce tasks derive their inputs from the
    /// task index alone.
    input: Option<String>,
    status: TaskStatus,
    /// Instant of the most recent dispatch, `None` while idle.
    assigned_at: Option<Instant>,
}

impl Task {
    fn new(input: Option<String>) -> Self {
        Self {
            input,
            status: TaskStatus::Idle,
            assigned_at: None,
        }
    }
}

#[derive(Debug)]
struct TaskTable {
    map_tasks: Vec<Task>,
    reduce_tasks: Vec<Task>,
    map_remaining: usize,
    reduce_remaining: usize,
}

impl TaskTable {
    fn task_mut(&mut self, kind: TaskKind, index: usize) -> Option<&mut Task> {
        match kind {
            TaskKind::Map => self.map_tasks.get_mut(index),
            TaskKind::Reduce => self.reduce_tasks.get_mut(index),
        }
    }
}

/// Owns the authoritative task table. All mutation happens under one lock, so
/// dispatching a task and updating the remaining counters are atomic with
/// respect to `done()`.
#[derive(Debug, Clone)]
pub struct Coordinator {
    table: Arc<Mutex<TaskTable>>,
}

impl Coordinator {
    /// One map task per input file, `n_reduce` reduce tasks, all idle.
    pub fn new(files: Vec<String>, n_reduce: usize) -> Self {
        let map_remaining = files.len();
        let map_tasks = files.into_iter().map(|f| Task::new(Some(f))).collect();
        let reduce_tasks = (0..n_reduce).map(|_| Task::new(None)).collect();
        Self {
            table: Arc::new(Mutex::new(TaskTable {
                map_tasks,
                reduce_tasks,
                map_remaining,
                reduce_remaining: n_reduce,
            })),
        }
    }

    /// Hand out the first idle task in index order, maps strictly before
    /// reduces. No reduce task is dispatched while any map task is not yet
    /// completed.
    pub fn assign_task(&self) -> TaskAssignment {
        let mut table = self.table.lock().unwrap();
        let kind = if table.map_remaining > 0 {
            TaskKind::Map
        } else if table.reduce_remaining > 0 {
            TaskKind::Reduce
        } else {
            return TaskAssignment::None;
        };
        let n_map = table.map_tasks.len();
        let n_reduce = table.reduce_tasks.len();
        let tasks = match kind {
            TaskKind::Map => &mut table.map_tasks,
            TaskKind::Reduce => &mut table.reduce_tasks,
        };
        let index = match tasks.iter().position(|t| t.status == TaskStatus::Idle) {
            Some(index) => index,
            // Everything in the current phase is in flight; the caller backs
            // off until a report or a timeout frees something up.
            None => return TaskAssignment::None,
        };
        let now = Instant::now();
        let task = &mut tasks[index];
        task.status = TaskStatus::InProgress;
        task.assigned_at = Some(now);
        let input = task.input.clone().unwrap_or_default();
        drop(table);

        self.arm_reassignment(kind, index, now);
        info!(?kind, index, "dispatched task");
        match kind {
            TaskKind::Map => TaskAssignment::Map {
                index,
                input,
                n_reduce,
            },
            TaskKind::Reduce => TaskAssignment::Reduce { index, n_map },
        }
    }

    /// After `TASK_TIMEOUT`, put the task back to idle unless a timely report
    /// arrived. The instant comparison pins the timer to the dispatch it was
    /// armed for, so it never reclaims a newer assignment of the same task.
    fn arm_reassignment(&self, kind: TaskKind, index: usize, assigned_at: Instant) {
        let table = Arc::clone(&self.table);
        tokio::spawn(async move {
            tokio::time::sleep_until(assigned_at + TASK_TIMEOUT).await;
            let mut table = table.lock().unwrap();
            let task = match table.task_mut(kind, index) {
                Some(task) => task,
                None => return,
            };
            if task.status == TaskStatus::InProgress && task.assigned_at == Some(assigned_at) {
                warn!(?kind, index, "worker missed the deadline, task back to idle");
                task.status = TaskStatus::Idle;
                task.assigned_at = None;
            }
        });
    }

    /// Record a completion report. Only accepted within `TASK_TIMEOUT` of the
    /// task's current dispatch; anything late, stale, or malformed is dropped
    /// silently so a reassigned task never regresses.
    pub fn record_completion(&self, kind: TaskKind, index: usize) {
        let mut table = self.table.lock().unwrap();
        {
            let task = match table.task_mut(kind, index) {
                Some(task) => task,
                None => {
                    warn!(?kind, index, "completion report for unknown task");
                    return;
                }
            };
            let timely = match (task.status, task.assigned_at) {
                (TaskStatus::InProgress, Some(at)) => at.elapsed() <= TASK_TIMEOUT,
                _ => false,
            };
            if !timely {
                info!(?kind, index, "discarding late completion report");
                return;
            }
            task.status = TaskStatus::Completed;
            task.assigned_at = None;
        }
        match kind {
            TaskKind::Map => table.map_remaining -= 1,
            TaskKind::Reduce => table.reduce_remaining -= 1,
        }
        debug!(?kind, index, "task completed");
    }

    /// True once every reduce task has completed, which by phase ordering
    /// implies every map task has as well.
    pub fn done(&self) -> bool {
        self.table.lock().unwrap().reduce_remaining == 0
    }
}

/// RPC surface the workers drive.
#[tarpc::service]
pub trait Scheduler {
    /// Ask for work. `TaskAssignment::None` means back off and retry.
    async fn request_task() -> TaskAssignment;
    /// Report a finished task. Late reports are discarded server-side.
    async fn report_task(kind: TaskKind, index: usize);
}

#[tarpc::server]
impl Scheduler for Coordinator {
    type RequestTaskFut = Ready<TaskAssignment>;
    type ReportTaskFut = Ready<()>;

    fn request_task(self, _: context::Context) -> Self::RequestTaskFut {
        ready(self.assign_task())
    }

    fn report_task(self, _: context::Context, kind: TaskKind, index: usize) -> Self::ReportTaskFut {
        self.record_completion(kind, index);
        ready(())
    }
}
