use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::job::Job;
use crate::registry::Handler;

/// A fault recorded by a unit of work, shaped for a `FAIL` report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskFault {
    pub errtype: String,
    pub message: String,
    pub backtrace: Vec<String>,
}

impl TaskFault {
    fn from_handler_error(error: &(dyn std::error::Error + Send + Sync)) -> Self {
        Self {
            errtype: "HandlerError".to_owned(),
            message: error.to_string(),
            backtrace: capture_backtrace(),
        }
    }

    fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_owned()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "handler panicked".to_owned()
        };

        Self {
            errtype: "HandlerPanic".to_owned(),
            message,
            backtrace: capture_backtrace(),
        }
    }
}

fn capture_backtrace() -> Vec<String> {
    Backtrace::force_capture()
        .to_string()
        .lines()
        .map(str::to_owned)
        .collect()
}

#[derive(Clone, Debug)]
enum TaskState {
    Pending,
    Done,
    Faulted(TaskFault),
    Cancelled,
}

/// Terminal observation of a unit of work, as seen by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Fault(TaskFault),
    Cancelled,
    TimedOut,
}

#[derive(Debug)]
struct TaskCell {
    state: Mutex<TaskState>,
    completed: Condvar,
    cancel_requested: AtomicBool,
}

/// Cancellable, pollable handle to one dispatched unit of work. The unit
/// writes its terminal state exactly once; the engine only ever reads.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    cell: Arc<TaskCell>,
}

impl TaskHandle {
    fn new() -> Self {
        Self {
            cell: Arc::new(TaskCell {
                state: Mutex::new(TaskState::Pending),
                completed: Condvar::new(),
                cancel_requested: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_done(&self) -> bool {
        !matches!(
            *self.cell.state.lock().expect("task state lock poisoned"),
            TaskState::Pending
        )
    }

    /// Bounded wait for the terminal state; `TimedOut` when the unit is still
    /// running once the timeout elapses.
    pub fn await_outcome(&self, timeout: Duration) -> TaskOutcome {
        let state = self.cell.state.lock().expect("task state lock poisoned");
        let (state, _timeout) = self
            .cell
            .completed
            .wait_timeout_while(state, timeout, |state| {
                matches!(*state, TaskState::Pending)
            })
            .expect("task state lock poisoned");

        match &*state {
            TaskState::Pending => TaskOutcome::TimedOut,
            TaskState::Done => TaskOutcome::Success,
            TaskState::Faulted(fault) => TaskOutcome::Fault(fault.clone()),
            TaskState::Cancelled => TaskOutcome::Cancelled,
        }
    }

    /// Cooperative interruption request: a unit that has not started yet is
    /// skipped; a running handler is not stopped.
    pub fn cancel(&self) {
        self.cell.cancel_requested.store(true, Ordering::SeqCst);
    }

    fn complete(&self, state: TaskState) {
        *self.cell.state.lock().expect("task state lock poisoned") = state;
        self.cell.completed.notify_all();
    }
}

/// Executor for handler invocations. The engine enforces the concurrency
/// bound through admission control at fetch time; the pool itself spawns one
/// thread per unit and does not cap.
#[derive(Debug, Default)]
pub struct WorkerPool {
    units: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&mut self, job: Job, handler: Handler) -> TaskHandle {
        self.reap();

        let handle = TaskHandle::new();
        let unit_handle = handle.clone();
        self.units
            .push(thread::spawn(move || execute_unit(&unit_handle, &job, &handler)));
        handle
    }

    /// Joins every unit that has already exited, keeping only live ones. A
    /// long-lived run must not accumulate one handle per job ever executed.
    pub fn reap(&mut self) {
        let mut live = Vec::with_capacity(self.units.len());
        for unit in self.units.drain(..) {
            if unit.is_finished() {
                let _ = unit.join();
            } else {
                live.push(unit);
            }
        }
        self.units = live;
    }

    /// Joins finished units and detaches the rest; a stuck handler must not
    /// block shutdown.
    pub fn shutdown(&mut self) {
        self.reap();
        self.units.clear();
    }
}

fn execute_unit(handle: &TaskHandle, job: &Job, handler: &Handler) {
    if handle.cell.cancel_requested.load(Ordering::SeqCst) {
        handle.complete(TaskState::Cancelled);
        return;
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| handler(job)));
    let state = match result {
        Ok(Ok(())) => TaskState::Done,
        Ok(Err(error)) => TaskState::Faulted(TaskFault::from_handler_error(&*error)),
        Err(payload) => TaskState::Faulted(TaskFault::from_panic(&*payload)),
    };
    handle.complete(state);
}
