use crate::config::DispatcherConfig;
use crate::error::DispatchError;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::{Builder as RuntimeBuilder, Handle as TokioHandle, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Threads of execution for running tasks.
///
/// Jobs go to tokio's blocking pool, which spawns a thread when none is idle, caps the
/// count at the configured ceiling and retires threads that sit idle past the keep-alive.
/// With an owned runtime the ceiling equals the dispatcher's worker budget, so the pool
/// never has to queue a job the dispatcher has admitted. With a borrowed handle the
/// host runtime's settings apply.
pub(crate) struct WorkerPool {
  pool_name: Arc<String>,
  handle: TokioHandle,
  runtime: Mutex<Option<Runtime>>,
  shutdown_token: CancellationToken,
}

impl fmt::Debug for WorkerPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerPool")
      .field("pool_name", &self.pool_name)
      .field("owns_runtime", &self.runtime.lock().is_some())
      .field("shutting_down", &self.shutdown_token.is_cancelled())
      .finish()
  }
}

impl WorkerPool {
  /// Builds a pool backed by a dedicated runtime sized from `config`.
  pub(crate) fn new(config: &DispatcherConfig) -> Result<Self, DispatchError> {
    let thread_prefix = config.name.clone();
    let thread_counter = AtomicUsize::new(1);
    // One async worker is enough: it only drives the notification task. Calls run on
    // the blocking pool, whose ceiling and keep-alive carry the sizing policy.
    let runtime = RuntimeBuilder::new_multi_thread()
      .worker_threads(1)
      .max_blocking_threads(config.effective_max_workers())
      .thread_keep_alive(config.worker_keep_alive)
      .thread_name_fn(move || {
        let n = thread_counter.fetch_add(1, AtomicOrdering::Relaxed);
        format!("{}-thread-{}", thread_prefix, n)
      })
      .enable_time()
      .build()
      .map_err(|e| DispatchError::WorkerPool(format!("failed to build worker runtime: {e}")))?;

    info!(
      pool_name = %config.name,
      max_workers = config.effective_max_workers(),
      keep_alive = ?config.worker_keep_alive,
      "Worker pool started with a dedicated runtime."
    );

    Ok(Self {
      pool_name: Arc::new(config.name.clone()),
      handle: runtime.handle().clone(),
      runtime: Mutex::new(Some(runtime)),
      shutdown_token: CancellationToken::new(),
    })
  }

  /// Builds a pool that runs jobs on an existing runtime.
  pub(crate) fn with_handle(pool_name: &str, handle: TokioHandle) -> Self {
    debug!(%pool_name, "Worker pool attached to an existing runtime.");
    Self {
      pool_name: Arc::new(pool_name.to_string()),
      handle,
      runtime: Mutex::new(None),
      shutdown_token: CancellationToken::new(),
    }
  }

  pub(crate) fn handle(&self) -> &TokioHandle {
    &self.handle
  }

  #[cfg(test)]
  pub(crate) fn is_shutting_down(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  /// Hands `job` to a worker thread. Fails only once the pool is shutting down.
  pub(crate) fn execute<F>(&self, job: F) -> Result<(), DispatchError>
  where
    F: FnOnce() + Send + 'static,
  {
    // Promotion calls this while holding the dispatcher's queue lock, so it must stay
    // non-blocking: a token check and a hand-off, nothing else.
    if self.shutdown_token.is_cancelled() {
      warn!(pool_name = %self.pool_name, "Worker pool is shutting down; rejecting job.");
      return Err(DispatchError::DispatcherShuttingDown);
    }
    // The join handle is not needed: jobs report through the dispatcher.
    drop(self.handle.spawn_blocking(job));
    trace!(pool_name = %self.pool_name, "Job handed to worker thread.");
    Ok(())
  }

  /// Stops accepting jobs. An owned runtime is released without waiting, so threads
  /// still inside a call finish it on their own.
  pub(crate) fn shutdown(&self) {
    if !self.shutdown_token.is_cancelled() {
      info!(pool_name = %self.pool_name, "Worker pool shutting down.");
      self.shutdown_token.cancel();
    }
    // `shutdown_background` never blocks, so this is safe from `Drop`, from async code and
    // from one of the pool's own worker threads.
    if let Some(runtime) = self.runtime.lock().take() {
      runtime.shutdown_background();
    }
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    self.shutdown();
  }
}
