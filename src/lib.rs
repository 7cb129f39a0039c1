//! A bounded-concurrency dispatcher for blocking network calls.
//!
//! Requests are admitted up to a fixed concurrency limit and run on worker threads
//! through an [`Executor`]. Overflow waits in submission order. Results reach the caller
//! through a [`Callback`], and any task can be canceled through its [`TaskHandle`]:
//! queued tasks never run, running tasks have their result suppressed and their call
//! asked to stop.

mod config;
mod dispatcher;
mod error;
mod executor;
mod handle;
mod notifier;
mod task;
mod task_queue;
mod worker_pool;

pub use config::{DispatcherConfig, DEFAULT_CONCURRENCY_LIMIT, DEFAULT_WORKER_KEEP_ALIVE};
pub use dispatcher::{Dispatcher, ShutdownMode};
pub use error::DispatchError;
pub use executor::{callback_fn, Call, Callback, Executor, FnCallback};
pub use handle::{ResultReceiver, TaskHandle};
pub use notifier::{TaskCompletionInfo, TaskCompletionStatus};
pub use task::TaskState;
