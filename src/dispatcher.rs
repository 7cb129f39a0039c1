use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::executor::{Callback, Executor};
use crate::handle::{ResultReceiver, TaskControl, TaskHandle};
use crate::notifier::{CompletionNotifier, TaskCompletionInfo};
use crate::task::{next_task_id, BoxedCallback, Task, TaskOutcome, TaskState};
use crate::task_queue::DispatchQueues;
use crate::worker_pool::WorkerPool;

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn};

/// Defines how the dispatcher should behave upon shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Waits for running tasks to finish and deliver their results.
  /// Waiting tasks are discarded without a callback.
  Graceful,
  /// Cancels running tasks as well and returns without waiting for them.
  /// Waiting tasks are discarded without a callback.
  ForcefulCancel,
}

struct DispatcherShared<X: Executor> {
  name: Arc<String>,
  concurrency_limit: usize,
  executor: X,
  queues: Mutex<DispatchQueues<X>>,
  pool: WorkerPool,
  notifier: CompletionNotifier,
  shutdown_token: CancellationToken,
  idle: Notify,
}

/// Admits requests under a fixed concurrency cap, runs them on worker threads through
/// the [`Executor`] and reports each outcome to the task's [`Callback`].
///
/// Requests over the cap wait in submission order and are promoted one at a time as
/// running tasks finish, however they finish.
pub struct Dispatcher<X: Executor> {
  shared: Arc<DispatcherShared<X>>,
}

impl<X: Executor> fmt::Debug for Dispatcher<X> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Dispatcher")
      .field("name", &self.shared.name)
      .field("concurrency_limit", &self.shared.concurrency_limit)
      .field("queues", &*self.shared.queues.lock())
      .field("pool", &self.shared.pool)
      .finish_non_exhaustive()
  }
}

impl<X: Executor> Dispatcher<X> {
  /// Creates a dispatcher with its own worker runtime.
  pub fn new(executor: X, config: DispatcherConfig) -> Result<Self, DispatchError> {
    config.validate()?;
    let pool = WorkerPool::new(&config)?;
    Ok(Self::from_parts(executor, &config, pool))
  }

  /// Creates a dispatcher whose workers run on the blocking pool of an existing runtime.
  pub fn with_handle(executor: X, config: DispatcherConfig, tokio_handle: TokioHandle) -> Result<Self, DispatchError> {
    config.validate()?;
    let pool = WorkerPool::with_handle(&config.name, tokio_handle);
    Ok(Self::from_parts(executor, &config, pool))
  }

  fn from_parts(executor: X, config: &DispatcherConfig, pool: WorkerPool) -> Self {
    let name = Arc::new(config.name.clone());
    let notifier = CompletionNotifier::new(name.clone(), pool.handle().clone());
    info!(
      dispatcher = %name,
      concurrency_limit = config.concurrency_limit,
      "Dispatcher created."
    );
    Self {
      shared: Arc::new(DispatcherShared {
        name,
        concurrency_limit: config.concurrency_limit,
        executor,
        queues: Mutex::new(DispatchQueues::new()),
        pool,
        notifier,
        shutdown_token: CancellationToken::new(),
        idle: Notify::new(),
      }),
    }
  }

  pub fn name(&self) -> &str {
    &self.shared.name
  }

  pub fn concurrency_limit(&self) -> usize {
    self.shared.concurrency_limit
  }

  pub fn executor(&self) -> &X {
    &self.shared.executor
  }

  pub fn running_count(&self) -> usize {
    self.shared.queues.lock().running_len()
  }

  /// Returns the current number of tasks in the admission queue.
  pub fn waiting_count(&self) -> usize {
    self.shared.queues.lock().waiting_len()
  }

  /// IDs of running tasks, oldest admission first.
  pub fn running_ids(&self) -> Vec<u64> {
    self.shared.queues.lock().running_ids()
  }

  /// IDs of waiting tasks, in the order they will be promoted.
  pub fn waiting_ids(&self) -> Vec<u64> {
    self.shared.queues.lock().waiting_ids()
  }

  pub fn is_shutting_down(&self) -> bool {
    self.shared.shutdown_token.is_cancelled()
  }

  /// Registers a handler called once for every task that reaches a terminal state,
  /// including canceled tasks. Handlers run on the dispatcher's runtime, in completion order.
  pub fn add_completion_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.shared.notifier.add_handler(handler);
  }

  /// Submits `request`. It starts at once if a slot is free, otherwise it waits behind
  /// every task submitted before it.
  ///
  /// # Errors
  /// `InvalidSubmission` if the executor rejects the request, `DispatcherShuttingDown`
  /// once shutdown has begun. Neither touches the queues.
  pub fn submit<C>(&self, request: X::Request, callback: C) -> Result<TaskHandle, DispatchError>
  where
    C: Callback<X::Response, X::Error>,
  {
    self.shared.submit_task(request, Box::new(callback))
  }

  /// Like [`submit`](Self::submit), but the outcome is read from the returned receiver.
  pub fn submit_awaitable(
    &self,
    request: X::Request,
  ) -> Result<ResultReceiver<X::Response, X::Error>, DispatchError> {
    let (tx, rx) = oneshot::channel::<Result<X::Response, X::Error>>();
    let handle = self.submit(request, tx)?;
    Ok(ResultReceiver { handle, rx })
  }

  pub async fn shutdown(&self, mode: ShutdownMode) {
    self.shared.begin_shutdown(mode);
    if mode == ShutdownMode::Graceful {
      info!(dispatcher = %self.shared.name, "Graceful shutdown: waiting for running tasks.");
      self.shared.wait_idle().await;
    }
    self.shared.notifier.shutdown().await;
    self.shared.pool.shutdown();
    info!(dispatcher = %self.shared.name, "Dispatcher shutdown completed.");
  }
}

impl<X: Executor> Drop for Dispatcher<X> {
  fn drop(&mut self) {
    // An explicit `shutdown()` may already have run; `begin_shutdown` is only needed when
    // this drop is the first shutdown signal.
    if !self.shared.shutdown_token.is_cancelled() {
      info!(
        dispatcher = %self.shared.name,
        "Dispatcher dropped. Initiating implicit shutdown; running calls finish on their own."
      );
      // 1. Close admission and discard waiting tasks. Running tasks are left alone:
      //    `drop` must not block, so nobody waits for them here.
      self.shared.begin_shutdown(ShutdownMode::Graceful);
    }
    // 2. Let the notification worker drain what is already queued and stop.
    self.shared.notifier.signal_shutdown();
    // 3. Refuse further jobs and release an owned runtime without waiting. Workers still
    //    inside a call finish it, deliver their callback and find `waiting` empty.
    self.shared.pool.shutdown();
  }
}

impl<X: Executor> DispatcherShared<X> {
  fn submit_task(self: &Arc<Self>, request: X::Request, callback: BoxedCallback<X>) -> Result<TaskHandle, DispatchError> {
    if let Err(reason) = self.executor.validate(&request) {
      warn!(dispatcher = %self.name, %reason, "Submit: request rejected.");
      return Err(DispatchError::InvalidSubmission(reason));
    }

    let task = Arc::new(Task::new(next_task_id(), request, callback));
    let task_id = task.task_id;
    {
      let mut queues = self.queues.lock();
      // Checked under the queue lock: `begin_shutdown` cancels the token before it takes
      // this lock to drain `waiting`, so a submission either lands before the drain or
      // sees the token here. Nothing can be queued behind a finished drain.
      if self.shutdown_token.is_cancelled() {
        warn!(dispatcher = %self.name, task_id, "Submit: dispatcher is shutting down.");
        return Err(DispatchError::DispatcherShuttingDown);
      }
      if queues.running_len() < self.concurrency_limit {
        self.admit_locked(&mut queues, task.clone())?;
        debug!(dispatcher = %self.name, task_id, running = queues.running_len(), "Task admitted.");
      } else {
        queues.push_waiting(task.clone());
        debug!(dispatcher = %self.name, task_id, waiting = queues.waiting_len(), "Concurrency limit reached; task queued.");
      }
    }

    Ok(TaskHandle {
      control: Arc::new(TaskRef {
        task,
        shared: Arc::downgrade(self),
      }),
    })
  }

  /// `Queued -> Running`, joins the running set and goes to a worker.
  /// Returns `Ok(false)` if the task was no longer queued.
  fn admit_locked(self: &Arc<Self>, queues: &mut DispatchQueues<X>, task: Arc<Task<X>>) -> Result<bool, DispatchError> {
    if !task.start() {
      trace!(dispatcher = %self.name, task_id = task.task_id, "Task left the queued state; not admitting.");
      return Ok(false);
    }
    queues.push_running(task.clone());

    let shared = self.clone();
    let job_task = task.clone();
    if let Err(e) = self.pool.execute(move || shared.run_task(job_task)) {
      queues.remove_running(task.task_id);
      task.cancel();
      return Err(e);
    }
    Ok(true)
  }

  fn run_task(self: Arc<Self>, task: Arc<Task<X>>) {
    let span = info_span!("dispatched_task", dispatcher = %self.name, task_id = task.task_id);
    let _entered = span.enter();

    let outcome = task.run(&self.executor);
    debug!(?outcome, "Task reached its callback decision.");
    self.notifier.notify(task.task_id, outcome);
    self.complete(&task);
  }

  /// Frees `task`'s slot and promotes from the admission queue, in one critical section.
  fn complete(self: &Arc<Self>, task: &Task<X>) {
    let mut queues = self.queues.lock();
    if queues.remove_running(task.task_id).is_none() {
      warn!(dispatcher = %self.name, task_id = task.task_id, "Finished task was not in the running set.");
    }

    while queues.running_len() < self.concurrency_limit {
      let Some(next) = queues.pop_waiting() else {
        break;
      };
      let next_id = next.task_id;
      match self.admit_locked(&mut queues, next) {
        Ok(true) => debug!(dispatcher = %self.name, task_id = next_id, "Promoted waiting task."),
        Ok(false) => {}
        Err(e) => {
          warn!(dispatcher = %self.name, task_id = next_id, error = %e, "Could not promote waiting task; discarding it.");
          self.notifier.notify(next_id, TaskOutcome::Canceled);
        }
      }
    }

    if queues.is_idle() {
      self.idle.notify_waiters();
    }
  }

  fn cancel_task(&self, task: &Task<X>) {
    let previous = {
      let mut queues = self.queues.lock();
      let previous = task.cancel();
      if previous == Some(TaskState::Queued) {
        queues.remove_waiting(task.task_id);
      }
      previous
    };

    match previous {
      Some(TaskState::Queued) => {
        debug!(dispatcher = %self.name, task_id = task.task_id, "Canceled waiting task.");
        self.notifier.notify(task.task_id, TaskOutcome::Canceled);
      }
      Some(_) => {
        debug!(dispatcher = %self.name, task_id = task.task_id, "Canceled running task.");
        task.forward_cancel();
      }
      None => trace!(dispatcher = %self.name, task_id = task.task_id, "Cancel on finished task ignored."),
    }
  }

  fn begin_shutdown(&self, mode: ShutdownMode) {
    if self.shutdown_token.is_cancelled() {
      info!(dispatcher = %self.name, "Shutdown already in progress.");
    } else {
      info!(dispatcher = %self.name, "Initiating dispatcher shutdown (mode: {:?}).", mode);
      // Must happen before the drain below: `submit_task` checks the token under the
      // same lock, so once the drain holds the lock no new task can reach `waiting`.
      self.shutdown_token.cancel();
    }

    // Collect under the lock, act outside it. Canceling a running task forwards into the
    // executor call, which should not happen while admission is blocked.
    let (discarded, running) = {
      let mut queues = self.queues.lock();
      let discarded = queues.drain_waiting();
      let running = if mode == ShutdownMode::ForcefulCancel {
        queues.running_tasks()
      } else {
        Vec::new()
      };
      // With nothing running, a graceful `shutdown()` has nothing to wait for.
      if queues.is_idle() {
        self.idle.notify_waiters();
      }
      (discarded, running)
    };

    // Discarded tasks never started, so no callback is owed. They are reported as canceled
    // to completion handlers. A concurrent `cancel()` may have won already.
    for task in discarded {
      if task.cancel().is_some() {
        debug!(dispatcher = %self.name, task_id = task.task_id, "Discarded waiting task at shutdown.");
        self.notifier.notify(task.task_id, TaskOutcome::Canceled);
      }
    }
    // Forceful mode only. The calls may still run to completion; their results are
    // suppressed by the canceled state and their slots are reclaimed as usual.
    for task in running {
      if task.cancel().is_some() {
        debug!(dispatcher = %self.name, task_id = task.task_id, "Forcefully canceling running task.");
        task.forward_cancel();
      }
    }
  }

  async fn wait_idle(&self) {
    loop {
      let notified = self.idle.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      let idle = self.queues.lock().is_idle();
      if idle {
        return;
      }
      notified.await;
    }
  }
}

/// Binds a [`TaskHandle`] to its task without keeping the dispatcher alive.
struct TaskRef<X: Executor> {
  task: Arc<Task<X>>,
  shared: Weak<DispatcherShared<X>>,
}

impl<X: Executor> TaskControl for TaskRef<X> {
  fn task_id(&self) -> u64 {
    self.task.task_id
  }

  fn state(&self) -> TaskState {
    self.task.state()
  }

  fn cancel(&self) {
    match self.shared.upgrade() {
      Some(shared) => shared.cancel_task(&self.task),
      None => {
        if self.task.cancel() == Some(TaskState::Running) {
          self.task.forward_cancel();
        }
      }
    }
  }
}
