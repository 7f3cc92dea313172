//! Asynchronous task queue drained by one worker per engine.
//!
//! Tasks run sequentially on a dedicated thread, each under the engine
//! lock. A task that fails or panics is logged and counted; the worker
//! moves on to the next one. Submission blocks on a full queue for at most
//! the configured timeout and reports the outcome, so nothing is dropped
//! silently.

use crate::engine::EngineShared;
use crate::error::SubmitError;
use crate::instances::InstanceId;
use crate::session::Session;
use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, warn};

/// Unit of deferred work run on the engine's worker.
pub type Task = Box<dyn FnOnce(&Session<'_>) -> anyhow::Result<()> + Send>;

/// Outcome counters of one worker.
#[derive(Debug, Default)]
pub struct TaskStats {
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TaskStatsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
}

impl TaskStats {
    pub fn snapshot(&self) -> TaskStatsSnapshot {
        TaskStatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct TaskQueue {
    sender: Sender<Task>,
    worker: JoinHandle<()>,
    worker_id: ThreadId,
}

impl TaskQueue {
    pub(crate) fn spawn(
        engine: Weak<EngineShared>,
        instance: InstanceId,
        stats: Arc<TaskStats>,
        capacity: usize,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = channel::bounded::<Task>(capacity);
        let worker = thread::Builder::new()
            .name(format!("luabridge-worker-{instance}"))
            .spawn(move || drain(&engine, instance, &receiver, &stats))?;
        let worker_id = worker.thread().id();
        Ok(Self {
            sender,
            worker,
            worker_id,
        })
    }

    pub(crate) fn sender(&self) -> Sender<Task> {
        self.sender.clone()
    }

    /// Stop accepting tasks. With `wait`, block until the queue drains;
    /// otherwise the worker is detached and drains on its own. Never waits
    /// when called from the worker itself.
    pub(crate) fn shutdown(self, wait: bool) {
        let Self {
            sender,
            worker,
            worker_id,
        } = self;
        drop(sender);
        if !wait || thread::current().id() == worker_id {
            return;
        }
        if worker.join().is_err() {
            warn!("task worker exited by panic");
        }
    }
}

pub(crate) fn submit(sender: &Sender<Task>, task: Task, timeout: Duration) -> Result<(), SubmitError> {
    sender.send_timeout(task, timeout).map_err(|err| match err {
        SendTimeoutError::Timeout(_) => SubmitError::Timeout(timeout),
        SendTimeoutError::Disconnected(_) => SubmitError::Disconnected,
    })
}

fn drain(
    engine: &Weak<EngineShared>,
    instance: InstanceId,
    receiver: &Receiver<Task>,
    stats: &TaskStats,
) {
    debug!(instance = %instance, "task worker started");
    for task in receiver {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        run_one(&engine, instance, stats, task);
    }
    debug!(instance = %instance, "task worker stopped");
}

fn run_one(engine: &EngineShared, instance: InstanceId, stats: &TaskStats, task: Task) {
    let session = Session::new(engine);
    let mark = session.mark();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(&session)));
    session.restore(mark);

    match outcome {
        Ok(Ok(())) => {
            stats.completed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(err)) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            let error = format!("{err:#}");
            warn!(instance = %instance, error = %error, "task failed");
        }
        Err(payload) => {
            stats.panicked.fetch_add(1, Ordering::Relaxed);
            warn!(instance = %instance, panic = panic_message(payload.as_ref()), "task panicked");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Task {
        Box::new(|_: &Session<'_>| -> anyhow::Result<()> { Ok(()) })
    }

    #[test]
    fn snapshot_reads_counters() {
        let stats = TaskStats::default();
        stats.completed.fetch_add(2, Ordering::Relaxed);
        stats.panicked.fetch_add(1, Ordering::Relaxed);
        assert_eq!(
            stats.snapshot(),
            TaskStatsSnapshot {
                completed: 2,
                failed: 0,
                panicked: 1,
            }
        );
    }

    #[test]
    fn submit_times_out_on_full_queue() {
        let (sender, _receiver) = channel::bounded::<Task>(1);
        let timeout = Duration::from_millis(10);
        submit(&sender, noop(), timeout).unwrap();
        assert_eq!(
            submit(&sender, noop(), timeout),
            Err(SubmitError::Timeout(timeout))
        );
    }

    #[test]
    fn submit_after_receiver_gone_is_disconnected() {
        let (sender, receiver) = channel::bounded::<Task>(1);
        drop(receiver);
        assert_eq!(
            submit(&sender, noop(), Duration::from_millis(10)),
            Err(SubmitError::Disconnected)
        );
    }

    #[test]
    fn panic_messages() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
