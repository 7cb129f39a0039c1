//! The capability the dispatcher consumes to perform network operations, and the
//! callback sink results are delivered to.

use std::fmt;

/// Performs network operations on behalf of the dispatcher.
///
/// The dispatcher never builds requests or decodes responses itself. It asks the
/// executor for a [`Call`] bound to one request and runs that call on a worker thread.
pub trait Executor: Send + Sync + 'static {
  type Request: Send + Sync + 'static;
  type Response: Send + 'static;
  type Error: Send + 'static;
  type Call: Call<Response = Self::Response, Error = Self::Error>;

  /// Prepares a call for `request`. Must not perform any I/O.
  fn call(&self, request: &Self::Request) -> Self::Call;

  /// Admission check run synchronously inside `submit`, before any queue is touched.
  fn validate(&self, _request: &Self::Request) -> Result<(), String> {
    Ok(())
  }
}

/// A single in-flight network operation.
///
/// `execute` blocks the calling worker for the whole operation. `cancel` may be called
/// from any other thread while `execute` is running and is advisory: the call is free to
/// finish with a result anyway.
pub trait Call: Send + Sync + 'static {
  type Response;
  type Error;

  fn execute(&self) -> Result<Self::Response, Self::Error>;

  fn cancel(&self);

  /// Whether `execute` has begun. Cancellation is only forwarded to started calls.
  fn is_started(&self) -> bool;
}

/// Receives the outcome of a task. At most one method is invoked, at most once.
pub trait Callback<T, E>: Send + 'static {
  fn on_success(self: Box<Self>, response: T);

  fn on_failure(self: Box<Self>, error: E);
}

/// A callback assembled from two closures. See [`callback_fn`].
pub struct FnCallback<S, F> {
  on_success: S,
  on_failure: F,
}

impl<S, F> fmt::Debug for FnCallback<S, F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FnCallback").finish_non_exhaustive()
  }
}

/// Builds a [`Callback`] from a success closure and a failure closure.
pub fn callback_fn<T, E, S, F>(on_success: S, on_failure: F) -> FnCallback<S, F>
where
  S: FnOnce(T) + Send + 'static,
  F: FnOnce(E) + Send + 'static,
{
  FnCallback { on_success, on_failure }
}

impl<T, E, S, F> Callback<T, E> for FnCallback<S, F>
where
  S: FnOnce(T) + Send + 'static,
  F: FnOnce(E) + Send + 'static,
{
  fn on_success(self: Box<Self>, response: T) {
    (self.on_success)(response)
  }

  fn on_failure(self: Box<Self>, error: E) {
    (self.on_failure)(error)
  }
}

/// Lets a oneshot sender stand in for a callback; used by `submit_awaitable`.
impl<T, E> Callback<T, E> for tokio::sync::oneshot::Sender<Result<T, E>>
where
  T: Send + 'static,
  E: Send + 'static,
{
  fn on_success(self: Box<Self>, response: T) {
    if (*self).send(Ok(response)).is_err() {
      tracing::trace!("Result receiver dropped before success was delivered.");
    }
  }

  fn on_failure(self: Box<Self>, error: E) {
    if (*self).send(Err(error)).is_err() {
      tracing::trace!("Result receiver dropped before failure was delivered.");
    }
  }
}
