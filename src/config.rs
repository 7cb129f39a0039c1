use crate::error::DispatchError;

use std::time::Duration;

/// Connection cap used when nothing else is configured.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 2;

/// How long an idle worker thread lingers before it is retired.
pub const DEFAULT_WORKER_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Settings fixed at dispatcher construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
  pub name: String,
  pub concurrency_limit: usize,
  /// Ceiling on worker threads. `None` sizes the pool to `concurrency_limit`.
  pub max_workers: Option<usize>,
  pub worker_keep_alive: Duration,
}

impl Default for DispatcherConfig {
  fn default() -> Self {
    Self {
      name: "network-dispatcher".to_string(),
      concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
      max_workers: None,
      worker_keep_alive: DEFAULT_WORKER_KEEP_ALIVE,
    }
  }
}

impl DispatcherConfig {
  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
    self.concurrency_limit = limit;
    self
  }

  pub fn with_max_workers(mut self, max_workers: usize) -> Self {
    self.max_workers = Some(max_workers);
    self
  }

  pub fn with_worker_keep_alive(mut self, keep_alive: Duration) -> Self {
    self.worker_keep_alive = keep_alive;
    self
  }

  pub fn effective_max_workers(&self) -> usize {
    self.max_workers.unwrap_or(self.concurrency_limit)
  }

  pub fn validate(&self) -> Result<(), DispatchError> {
    if self.concurrency_limit == 0 {
      return Err(DispatchError::InvalidConfig(
        "concurrency_limit must be at least 1".to_string(),
      ));
    }
    if self.effective_max_workers() < self.concurrency_limit {
      return Err(DispatchError::InvalidConfig(format!(
        "max_workers ({}) must not be below concurrency_limit ({})",
        self.effective_max_workers(),
        self.concurrency_limit
      )));
    }
    Ok(())
  }
}
