use crate::error::DispatchError;
use crate::task::TaskState;

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;

/// What a handle needs from the task it is bound to.
pub(crate) trait TaskControl: Send + Sync {
  fn task_id(&self) -> u64;
  fn state(&self) -> TaskState;
  fn cancel(&self);
}

/// A handle to a task submitted to a [`Dispatcher`](crate::Dispatcher).
///
/// Cheap to clone. `cancel` is idempotent and may be called from any thread at any
/// point in the task's life.
#[derive(Clone)]
pub struct TaskHandle {
  pub(crate) control: Arc<dyn TaskControl>,
}

impl fmt::Debug for TaskHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskHandle")
      .field("task_id", &self.control.task_id())
      .field("state", &self.control.state())
      .finish()
  }
}

impl TaskHandle {
  /// Returns the unique ID of this task.
  pub fn id(&self) -> u64 {
    self.control.task_id()
  }

  pub fn state(&self) -> TaskState {
    self.control.state()
  }

  pub fn is_canceled(&self) -> bool {
    self.control.state() == TaskState::Canceled
  }

  /// Requests cancellation.
  ///
  /// A queued task is dropped from the admission queue and never runs. A running task
  /// has its callback suppressed, and the executor call is asked to stop if it has
  /// started. The call may still run to completion; its result is discarded.
  pub fn cancel(&self) {
    tracing::debug!(task_id = %self.id(), "TaskHandle: Cancellation requested.");
    self.control.cancel();
  }
}

/// The receiving side of [`Dispatcher::submit_awaitable`](crate::Dispatcher::submit_awaitable).
pub struct ResultReceiver<T, E> {
  pub(crate) handle: TaskHandle,
  pub(crate) rx: oneshot::Receiver<Result<T, E>>,
}

impl<T, E> fmt::Debug for ResultReceiver<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResultReceiver").field("handle", &self.handle).finish_non_exhaustive()
  }
}

impl<T, E> ResultReceiver<T, E> {
  pub fn handle(&self) -> &TaskHandle {
    &self.handle
  }

  /// Awaits the executor's result.
  ///
  /// # Errors
  /// Returns `DispatchError::TaskCanceled` if the task was canceled or discarded at
  /// shutdown, and `DispatchError::ResultChannelClosed` if it ended without a result
  /// (the executor panicked).
  pub async fn await_result(self) -> Result<Result<T, E>, DispatchError> {
    let handle = self.handle;
    self.rx.await.map_err(|_| Self::missing_result(&handle))
  }

  /// Blocking variant of [`await_result`](Self::await_result) for synchronous callers.
  /// Must not be called from inside an async context.
  pub fn wait(self) -> Result<Result<T, E>, DispatchError> {
    let handle = self.handle;
    self.rx.blocking_recv().map_err(|_| Self::missing_result(&handle))
  }

  fn missing_result(handle: &TaskHandle) -> DispatchError {
    if handle.is_canceled() {
      DispatchError::TaskCanceled
    } else {
      tracing::warn!(task_id = %handle.id(), "Result channel closed without a result.");
      DispatchError::ResultChannelClosed
    }
  }
}
