use crate::executor::Executor;
use crate::task::Task;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// The running set and the admission queue.
///
/// Both live behind the dispatcher's single mutex. Nothing here is synchronized on its
/// own, so every method assumes the caller holds that lock.
pub(crate) struct DispatchQueues<X: Executor> {
  running: VecDeque<Arc<Task<X>>>,
  waiting: VecDeque<Arc<Task<X>>>,
}

impl<X: Executor> fmt::Debug for DispatchQueues<X> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DispatchQueues")
      .field("running", &self.running_ids())
      .field("waiting", &self.waiting_ids())
      .finish()
  }
}

impl<X: Executor> DispatchQueues<X> {
  pub(crate) fn new() -> Self {
    Self {
      running: VecDeque::new(),
      waiting: VecDeque::new(),
    }
  }

  pub(crate) fn running_len(&self) -> usize {
    self.running.len()
  }

  pub(crate) fn waiting_len(&self) -> usize {
    self.waiting.len()
  }

  pub(crate) fn running_ids(&self) -> Vec<u64> {
    self.running.iter().map(|t| t.task_id).collect()
  }

  pub(crate) fn waiting_ids(&self) -> Vec<u64> {
    self.waiting.iter().map(|t| t.task_id).collect()
  }

  pub(crate) fn push_running(&mut self, task: Arc<Task<X>>) {
    debug_assert!(!self.contains(task.task_id), "task {} already queued", task.task_id);
    self.running.push_back(task);
  }

  pub(crate) fn push_waiting(&mut self, task: Arc<Task<X>>) {
    debug_assert!(!self.contains(task.task_id), "task {} already queued", task.task_id);
    self.waiting.push_back(task);
  }

  pub(crate) fn pop_waiting(&mut self) -> Option<Arc<Task<X>>> {
    self.waiting.pop_front()
  }

  pub(crate) fn remove_running(&mut self, task_id: u64) -> Option<Arc<Task<X>>> {
    let idx = self.running.iter().position(|t| t.task_id == task_id)?;
    self.running.remove(idx)
  }

  pub(crate) fn remove_waiting(&mut self, task_id: u64) -> Option<Arc<Task<X>>> {
    let idx = self.waiting.iter().position(|t| t.task_id == task_id)?;
    self.waiting.remove(idx)
  }

  pub(crate) fn running_tasks(&self) -> Vec<Arc<Task<X>>> {
    self.running.iter().cloned().collect()
  }

  pub(crate) fn drain_waiting(&mut self) -> Vec<Arc<Task<X>>> {
    self.waiting.drain(..).collect()
  }

  pub(crate) fn is_idle(&self) -> bool {
    self.running.is_empty() && self.waiting.is_empty()
  }

  fn contains(&self, task_id: u64) -> bool {
    self.running.iter().chain(self.waiting.iter()).any(|t| t.task_id == task_id)
  }
}
