use crate::task::TaskOutcome;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, Instrument};

// --- Public Event Structs for Handlers ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  Succeeded,
  Failed,
  Canceled,
  Panicked,
}

impl From<TaskOutcome> for TaskCompletionStatus {
  fn from(outcome: TaskOutcome) -> Self {
    match outcome {
      TaskOutcome::Succeeded => TaskCompletionStatus::Succeeded,
      TaskOutcome::Failed => TaskCompletionStatus::Failed,
      TaskOutcome::Canceled => TaskCompletionStatus::Canceled,
      TaskOutcome::Panicked => TaskCompletionStatus::Panicked,
    }
  }
}

#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
  pub task_id: u64,
  pub dispatcher_name: Arc<String>,
  pub status: TaskCompletionStatus,
  pub completion_time: SystemTime,
}

type CompletionHandler = Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>;

#[derive(Debug)]
struct InternalCompletionMessage {
  task_id: u64,
  status: TaskCompletionStatus,
  completion_time: SystemTime,
}

struct NotifierWorkerState {
  rx: Option<UnboundedReceiver<InternalCompletionMessage>>,
  join_handle: Option<JoinHandle<()>>,
}

/// Fans task completions out to registered handlers.
///
/// Messages are queued from worker threads and delivered in order by a single tokio task,
/// started lazily when the first handler is registered. Until then nothing is queued.
pub(crate) struct CompletionNotifier {
  dispatcher_name: Arc<String>,
  handlers: Arc<RwLock<Vec<CompletionHandler>>>,
  tx: UnboundedSender<InternalCompletionMessage>,
  active: AtomicBool,
  worker: Mutex<NotifierWorkerState>,
  tokio_handle: TokioHandle,
  shutdown_token: CancellationToken,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionNotifier")
      .field("dispatcher_name", &self.dispatcher_name)
      .field("handler_count", &self.handlers.read().len())
      .field("active", &self.active.load(AtomicOrdering::Relaxed))
      .finish_non_exhaustive()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(dispatcher_name: Arc<String>, tokio_handle: TokioHandle) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      dispatcher_name,
      handlers: Arc::new(RwLock::new(Vec::new())),
      tx,
      active: AtomicBool::new(false),
      worker: Mutex::new(NotifierWorkerState {
        rx: Some(rx),
        join_handle: None,
      }),
      tokio_handle,
      shutdown_token: CancellationToken::new(),
    }
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    let total = {
      let mut handlers = self.handlers.write();
      handlers.push(Arc::new(handler));
      handlers.len()
    };
    self.ensure_worker_started();
    info!(dispatcher = %self.dispatcher_name, "Added completion handler. Total handlers: {}", total);
  }

  fn ensure_worker_started(&self) {
    let mut worker = self.worker.lock();
    let Some(rx) = worker.rx.take() else {
      return;
    };
    debug!(dispatcher = %self.dispatcher_name, "Starting notification worker.");
    let join_handle = self.tokio_handle.spawn(
      Self::run_notification_loop(rx, self.handlers.clone(), self.dispatcher_name.clone(), self.shutdown_token.clone())
        .instrument(info_span!("notification_worker", dispatcher = %self.dispatcher_name)),
    );
    worker.join_handle = Some(join_handle);
    self.active.store(true, AtomicOrdering::SeqCst);
  }

  pub(crate) fn notify(&self, task_id: u64, outcome: TaskOutcome) {
    if !self.active.load(AtomicOrdering::SeqCst) {
      return;
    }
    let message = InternalCompletionMessage {
      task_id,
      status: outcome.into(),
      completion_time: SystemTime::now(),
    };
    if self.tx.send(message).is_err() {
      trace!(dispatcher = %self.dispatcher_name, task_id, "Notification worker gone; completion not delivered.");
    }
  }

  async fn run_notification_loop(
    mut rx: UnboundedReceiver<InternalCompletionMessage>,
    handlers: Arc<RwLock<Vec<CompletionHandler>>>,
    dispatcher_name: Arc<String>,
    shutdown_token: CancellationToken,
  ) {
    let deliver = |message: InternalCompletionMessage| {
      let info = TaskCompletionInfo {
        task_id: message.task_id,
        dispatcher_name: dispatcher_name.clone(),
        status: message.status,
        completion_time: message.completion_time,
      };
      // Snapshot so a handler may register another handler without deadlocking.
      let snapshot: Vec<CompletionHandler> = handlers.read().clone();
      trace!(task_id = info.task_id, status = ?info.status, "Dispatching notification to {} handlers.", snapshot.len());
      for handler in snapshot {
        let info = info.clone();
        if panic::catch_unwind(AssertUnwindSafe(|| handler(info))).is_err() {
          error!(task_id = message.task_id, "A completion handler panicked.");
        }
      }
    };

    loop {
      tokio::select! {
        biased;

        received = rx.recv() => match received {
          Some(message) => deliver(message),
          None => break,
        },

        _ = shutdown_token.cancelled() => {
          while let Ok(message) = rx.try_recv() {
            deliver(message);
          }
          break;
        }
      }
    }

    debug!("Notification worker stopped.");
  }

  /// Stops the notification worker after it has drained what is already queued.
  pub(crate) async fn shutdown(&self) {
    self.shutdown_token.cancel();
    let join_handle = self.worker.lock().join_handle.take();
    if let Some(join_handle) = join_handle {
      if let Err(e) = join_handle.await {
        error!(dispatcher = %self.dispatcher_name, "Error joining notification worker: {:?}", e);
      }
    }
  }

  /// Non-blocking variant used from `Drop`.
  pub(crate) fn signal_shutdown(&self) {
    self.shutdown_token.cancel();
  }
}
