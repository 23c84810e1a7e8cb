//! Ordered task queue drained by one thread.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::context::RunContext;
use crate::task::{Task, TaskEnv, TaskKind};

const WAIT_STEP: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "errors", rename_all = "lowercase")]
pub enum KeyOutcome {
    /// The end-of-processing marker ran.
    Finished,
    Failed(Vec<String>),
    Incomplete,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<(String, Task)>,
    executing: bool,
    closed: bool,
    failures: HashMap<String, Vec<String>>,
    finished: HashMap<String, bool>,
}

pub struct TaskScheduler {
    ctx: RunContext,
    queue: Mutex<Queue>,
    ready: Condvar,
}

impl TaskScheduler {
    pub fn new(ctx: RunContext) -> Self {
        Self {
            ctx,
            queue: Mutex::new(Queue::default()),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a task. Tasks for a key that already failed are dropped.
    pub fn add_task(&self, task: Task, key: &str) {
        let mut queue = self.lock();
        if queue.failures.contains_key(key) {
            debug!(bank = key, task = %task.label(), "dropping task after earlier failure");
            return;
        }
        queue.pending.push_back((key.to_string(), task));
        self.ready.notify_one();
    }

    /// Drains the queue until [`close`](Self::close) is called and nothing is
    /// left, or the run is aborted.
    pub fn run(&self, env: &TaskEnv<'_>) {
        loop {
            let (key, mut task) = {
                let mut queue = self.lock();
                loop {
                    if self.ctx.is_aborted() {
                        if !queue.pending.is_empty() {
                            warn!(skipped = queue.pending.len(), "abort requested, dropping queued tasks");
                            queue.pending.clear();
                        }
                        return;
                    }
                    if let Some(item) = queue.pending.pop_front() {
                        queue.executing = true;
                        break item;
                    }
                    if queue.closed {
                        return;
                    }
                    queue = match self.ready.wait_timeout(queue, WAIT_STEP) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            };

            let ok = task.execute(env);
            let mut queue = self.lock();
            queue.executing = false;
            if ok {
                if task.kind == TaskKind::EndOfProcessing {
                    queue.finished.insert(key, true);
                }
                continue;
            }
            let message = task.error().unwrap_or("task failed").to_string();
            error!(bank = %key, task = %task.label(), "{message}");
            self.ctx.record_error();
            let before = queue.pending.len();
            queue.pending.retain(|(pending_key, _)| *pending_key != key);
            let discarded = before - queue.pending.len();
            if discarded > 0 {
                info!(bank = %key, discarded, "discarding remaining tasks");
            }
            queue.failures.entry(key).or_default().push(message);
        }
    }

    /// True once the queue is empty and no task is running. An aborted run
    /// terminates as soon as the running task returns.
    pub fn terminate(&self) -> bool {
        let queue = self.lock();
        !queue.executing && (queue.pending.is_empty() || self.ctx.is_aborted())
    }

    /// Lets [`run`](Self::run) return once the queue is drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn outcome(&self, key: &str) -> KeyOutcome {
        let queue = self.lock();
        if let Some(errors) = queue.failures.get(key) {
            return KeyOutcome::Failed(errors.clone());
        }
        if queue.finished.get(key).copied().unwrap_or(false) {
            KeyOutcome::Finished
        } else {
            KeyOutcome::Incomplete
        }
    }

    /// Kinds still waiting for `key`, in queue order.
    pub fn queued(&self, key: &str) -> Vec<TaskKind> {
        self.lock()
            .pending
            .iter()
            .filter(|(pending_key, _)| pending_key == key)
            .map(|(_, task)| task.kind)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::thread;

    use super::*;
    use crate::domain::BankType;
    use crate::task::{BankInfo, TaskParams, ToolTable};

    fn bank(root: &Path) -> BankInfo {
        BankInfo {
            name: "b".to_string(),
            description: String::new(),
            provider: String::new(),
            bank_type: BankType::Protein,
            offline_dir: root.join("offline"),
            work_dir: root.join("work"),
        }
    }

    #[test]
    fn failure_discards_the_rest_of_the_key() {
        let temp = tempfile::tempdir().unwrap();
        let info = bank(temp.path());
        let ctx = RunContext::new();
        let scheduler = TaskScheduler::new(ctx.clone());
        let tools = ToolTable::default();

        // Decompress without an input fails.
        scheduler.add_task(Task::new(TaskKind::Decompress, &info, TaskParams::default()), "b");
        scheduler.add_task(Task::new(TaskKind::EndOfProcessing, &info, TaskParams::default()), "b");
        scheduler.add_task(Task::new(TaskKind::EndOfProcessing, &info, TaskParams::default()), "c");
        scheduler.close();
        scheduler.run(&TaskEnv { ctx: &ctx, tools: &tools });

        assert!(scheduler.terminate());
        assert!(ctx.has_error());
        assert!(matches!(scheduler.outcome("b"), KeyOutcome::Failed(ref errors) if errors.len() == 1));
        assert_eq!(scheduler.outcome("c"), KeyOutcome::Finished);

        scheduler.add_task(Task::new(TaskKind::EndOfProcessing, &info, TaskParams::default()), "b");
        assert!(scheduler.queued("b").is_empty());
    }

    #[test]
    fn drain_thread_waits_for_work() {
        let temp = tempfile::tempdir().unwrap();
        let info = bank(temp.path());
        let ctx = RunContext::new();
        let scheduler = TaskScheduler::new(ctx.clone());
        let tools = ToolTable::default();

        thread::scope(|scope| {
            scope.spawn(|| scheduler.run(&TaskEnv { ctx: &ctx, tools: &tools }));
            scheduler.add_task(Task::new(TaskKind::EndOfProcessing, &info, TaskParams::default()), "b");
            while !scheduler.terminate() {
                thread::sleep(Duration::from_millis(10));
            }
            scheduler.close();
        });
        assert_eq!(scheduler.outcome("b"), KeyOutcome::Finished);
    }

    #[test]
    fn abort_stops_new_tasks() {
        let temp = tempfile::tempdir().unwrap();
        let info = bank(temp.path());
        let ctx = RunContext::new();
        let scheduler = TaskScheduler::new(ctx.clone());
        let tools = ToolTable::default();
        scheduler.add_task(Task::new(TaskKind::EndOfProcessing, &info, TaskParams::default()), "b");
        ctx.abort();
        scheduler.run(&TaskEnv { ctx: &ctx, tools: &tools });
        assert!(scheduler.terminate());
        assert_eq!(scheduler.outcome("b"), KeyOutcome::Incomplete);
    }
}
