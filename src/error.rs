use thiserror::Error;

/// Errors raised by the dispatcher itself.
///
/// Transport failures are not part of this enum: they belong to the executor and are
/// delivered to the task's callback untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
  #[error("Request rejected at submission: {0}")]
  InvalidSubmission(String),

  #[error("Invalid dispatcher configuration: {0}")]
  InvalidConfig(String),

  #[error("Dispatcher is shutting down or already shut down, cannot accept new tasks")]
  DispatcherShuttingDown,

  #[error("Worker pool error: {0}")]
  WorkerPool(String),

  #[error("Task result channel closed before a result was delivered")]
  ResultChannelClosed,

  #[error("Task was canceled")]
  TaskCanceled,
}
