use crate::executor::{Call, Callback, Executor};

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

lazy_static::lazy_static! {
  static ref NEXT_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

pub(crate) fn next_task_id() -> u64 {
  NEXT_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Lifecycle of a dispatched task.
///
/// `Queued -> Running -> {Completed | Canceled}` and `Queued -> Canceled`.
/// Nothing leaves `Completed` or `Canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
  Queued = 0,
  Running = 1,
  Completed = 2,
  Canceled = 3,
}

impl TaskState {
  fn from_u8(raw: u8) -> Self {
    match raw {
      0 => TaskState::Queued,
      1 => TaskState::Running,
      2 => TaskState::Completed,
      _ => TaskState::Canceled,
    }
  }

  pub fn is_terminal(self) -> bool {
    matches!(self, TaskState::Completed | TaskState::Canceled)
  }
}

/// A `TaskState` that only moves through compare-and-swap transitions.
pub(crate) struct AtomicTaskState(AtomicU8);

impl AtomicTaskState {
  pub(crate) fn new(state: TaskState) -> Self {
    Self(AtomicU8::new(state as u8))
  }

  pub(crate) fn load(&self) -> TaskState {
    TaskState::from_u8(self.0.load(AtomicOrdering::SeqCst))
  }

  pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> bool {
    self
      .0
      .compare_exchange(from as u8, to as u8, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
      .is_ok()
  }

  /// Moves any non-terminal state to `Canceled`, returning the state it left.
  pub(crate) fn cancel(&self) -> Option<TaskState> {
    let mut current = self.load();
    while !current.is_terminal() {
      match self.0.compare_exchange(
        current as u8,
        TaskState::Canceled as u8,
        AtomicOrdering::SeqCst,
        AtomicOrdering::SeqCst,
      ) {
        Ok(_) => return Some(current),
        Err(observed) => current = TaskState::from_u8(observed),
      }
    }
    None
  }
}

impl fmt::Debug for AtomicTaskState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("AtomicTaskState").field(&self.load()).finish()
  }
}

pub(crate) type BoxedCallback<X> =
  Box<dyn Callback<<X as Executor>::Response, <X as Executor>::Error>>;

/// How a task's run ended, as seen by the worker that ran it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
  Succeeded,
  Failed,
  Canceled,
  Panicked,
}

/// Internal representation of a submitted request.
pub(crate) struct Task<X: Executor> {
  pub(crate) task_id: u64,
  request: X::Request,
  callback: Mutex<Option<BoxedCallback<X>>>,
  state: AtomicTaskState,
  call: Mutex<Option<Arc<X::Call>>>,
}

impl<X: Executor> fmt::Debug for Task<X> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Task")
      .field("task_id", &self.task_id)
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}

impl<X: Executor> Task<X> {
  pub(crate) fn new(task_id: u64, request: X::Request, callback: BoxedCallback<X>) -> Self {
    Self {
      task_id,
      request,
      callback: Mutex::new(Some(callback)),
      state: AtomicTaskState::new(TaskState::Queued),
      call: Mutex::new(None),
    }
  }

  pub(crate) fn state(&self) -> TaskState {
    self.state.load()
  }

  /// `Queued -> Running`. Callers hold the dispatcher's queue lock.
  pub(crate) fn start(&self) -> bool {
    self.state.transition(TaskState::Queued, TaskState::Running)
  }

  /// Marks the task canceled and drops its callback so nothing can deliver to it.
  /// Returns the state the task was in, or `None` if it was already terminal.
  pub(crate) fn cancel(&self) -> Option<TaskState> {
    let previous = self.state.cancel()?;
    self.callback.lock().take();
    Some(previous)
  }

  /// Relays cancellation into the executor call if it has started.
  pub(crate) fn forward_cancel(&self) {
    let call = self.call.lock().clone();
    match call {
      Some(call) if call.is_started() => {
        debug!(task_id = self.task_id, "Forwarding cancellation to in-flight call.");
        call.cancel();
      }
      Some(_) => trace!(task_id = self.task_id, "Call prepared but not started; nothing to forward."),
      None => trace!(task_id = self.task_id, "No executor call yet; nothing to forward."),
    }
  }

  /// Runs the task to its callback decision. Never panics; panics from the executor
  /// or the callback are caught and reported as `Panicked`.
  pub(crate) fn run(&self, executor: &X) -> TaskOutcome {
    if self.state() == TaskState::Canceled {
      debug!(task_id = self.task_id, "Task canceled before execution; skipping executor.");
      return TaskOutcome::Canceled;
    }

    let call = match panic::catch_unwind(AssertUnwindSafe(|| executor.call(&self.request))) {
      Ok(call) => Arc::new(call),
      Err(_) => {
        error!(task_id = self.task_id, "Executor panicked while preparing the call.");
        return self.finish_panicked();
      }
    };
    *self.call.lock() = Some(call.clone());

    // A cancel that landed before the call was published could not reach it.
    if self.state() == TaskState::Canceled {
      debug!(task_id = self.task_id, "Task canceled while preparing the call; skipping executor.");
      self.call.lock().take();
      return TaskOutcome::Canceled;
    }

    trace!(task_id = self.task_id, "Executing call.");
    let result = panic::catch_unwind(AssertUnwindSafe(|| call.execute()));
    self.call.lock().take();

    let result = match result {
      Ok(result) => result,
      Err(_) => {
        error!(task_id = self.task_id, "Executor panicked during execution.");
        return self.finish_panicked();
      }
    };

    if !self.state.transition(TaskState::Running, TaskState::Completed) {
      debug!(task_id = self.task_id, "Call returned after cancellation; result suppressed.");
      return TaskOutcome::Canceled;
    }

    let Some(callback) = self.callback.lock().take() else {
      return if result.is_ok() { TaskOutcome::Succeeded } else { TaskOutcome::Failed };
    };

    let (outcome, delivery) = match result {
      Ok(response) => (
        TaskOutcome::Succeeded,
        panic::catch_unwind(AssertUnwindSafe(move || callback.on_success(response))),
      ),
      Err(err) => (
        TaskOutcome::Failed,
        panic::catch_unwind(AssertUnwindSafe(move || callback.on_failure(err))),
      ),
    };
    if delivery.is_err() {
      error!(task_id = self.task_id, ?outcome, "Callback panicked while handling the result.");
    }
    outcome
  }

  fn finish_panicked(&self) -> TaskOutcome {
    self.call.lock().take();
    if self.state.transition(TaskState::Running, TaskState::Completed) {
      // No value to hand over; the callback is dropped unused.
      self.callback.lock().take();
      TaskOutcome::Panicked
    } else {
      TaskOutcome::Canceled
    }
  }
}
