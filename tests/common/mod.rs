#![allow(dead_code)]

use net_dispatch::{callback_fn, Call, Callback, Executor};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

pub type Outcome = Result<String, String>;

/// Executor whose calls block until the test releases them by name.
///
/// Requests are plain names. An empty name is rejected at submission. Names starting
/// with `panic` make `execute` panic. In auto mode calls finish by themselves after a
/// short random delay.
pub struct ScriptedExecutor {
  auto: bool,
  gates: Arc<Mutex<HashMap<String, mpsc::Sender<Outcome>>>>,
  started_tx: UnboundedSender<String>,
  canceled: Arc<Mutex<Vec<String>>>,
  calls_made: Arc<AtomicUsize>,
  in_flight: Arc<AtomicUsize>,
  max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedExecutor {
  pub fn gated() -> (Self, UnboundedReceiver<String>) {
    Self::build(false)
  }

  pub fn auto() -> (Self, UnboundedReceiver<String>) {
    Self::build(true)
  }

  fn build(auto: bool) -> (Self, UnboundedReceiver<String>) {
    let (started_tx, started_rx) = unbounded_channel();
    (
      Self {
        auto,
        gates: Arc::new(Mutex::new(HashMap::new())),
        started_tx,
        canceled: Arc::new(Mutex::new(Vec::new())),
        calls_made: Arc::new(AtomicUsize::new(0)),
        in_flight: Arc::new(AtomicUsize::new(0)),
        max_in_flight: Arc::new(AtomicUsize::new(0)),
      },
      started_rx,
    )
  }

  /// Lets the call for `name` return `outcome`. Panics if no such call is pending.
  pub fn release(&self, name: &str, outcome: Outcome) {
    let gate = self
      .gates
      .lock()
      .unwrap()
      .remove(name)
      .unwrap_or_else(|| panic!("no pending call named {name}"));
    gate.send(outcome).unwrap();
  }

  pub fn canceled_calls(&self) -> Vec<String> {
    self.canceled.lock().unwrap().clone()
  }

  pub fn calls_made(&self) -> usize {
    self.calls_made.load(Ordering::SeqCst)
  }

  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }
}

impl Executor for ScriptedExecutor {
  type Request = String;
  type Response = String;
  type Error = String;
  type Call = ScriptedCall;

  fn call(&self, request: &String) -> ScriptedCall {
    self.calls_made.fetch_add(1, Ordering::SeqCst);
    let gate = if self.auto {
      None
    } else {
      let (tx, rx) = mpsc::channel();
      self.gates.lock().unwrap().insert(request.clone(), tx);
      Some(rx)
    };
    ScriptedCall {
      name: request.clone(),
      gate: Mutex::new(gate),
      started: AtomicBool::new(false),
      started_tx: self.started_tx.clone(),
      canceled: self.canceled.clone(),
      in_flight: self.in_flight.clone(),
      max_in_flight: self.max_in_flight.clone(),
    }
  }

  fn validate(&self, request: &String) -> Result<(), String> {
    if request.is_empty() {
      Err("request is empty".to_string())
    } else {
      Ok(())
    }
  }
}

pub struct ScriptedCall {
  name: String,
  gate: Mutex<Option<mpsc::Receiver<Outcome>>>,
  started: AtomicBool,
  started_tx: UnboundedSender<String>,
  canceled: Arc<Mutex<Vec<String>>>,
  in_flight: Arc<AtomicUsize>,
  max_in_flight: Arc<AtomicUsize>,
}

impl Call for ScriptedCall {
  type Response = String;
  type Error = String;

  fn execute(&self) -> Outcome {
    self.started.store(true, Ordering::SeqCst);
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    let _ = self.started_tx.send(self.name.clone());

    let outcome = if self.name.starts_with("panic") {
      self.in_flight.fetch_sub(1, Ordering::SeqCst);
      panic!("scripted executor panic for {}", self.name);
    } else {
      match self.gate.lock().unwrap().take() {
        Some(rx) => rx.recv().unwrap_or_else(|_| Err("gate dropped".to_string())),
        None => {
          let delay = rand::rng().random_range(0..3u64);
          std::thread::sleep(Duration::from_millis(delay));
          Ok(format!("{}:ok", self.name))
        }
      }
    };
    self.in_flight.fetch_sub(1, Ordering::SeqCst);
    outcome
  }

  fn cancel(&self) {
    self.canceled.lock().unwrap().push(self.name.clone());
  }

  fn is_started(&self) -> bool {
    self.started.load(Ordering::SeqCst)
  }
}

/// A callback that reports `(name, outcome)` on `tx`.
pub fn recording_callback(name: &str, tx: &UnboundedSender<(String, Outcome)>) -> impl Callback<String, String> {
  let ok_tx = tx.clone();
  let err_tx = tx.clone();
  let ok_name = name.to_string();
  let err_name = name.to_string();
  callback_fn(
    move |resp: String| {
      let _ = ok_tx.send((ok_name, Ok(resp)));
    },
    move |err: String| {
      let _ = err_tx.send((err_name, Err(err)));
    },
  )
}

/// Polls `rx` from synchronous test code.
pub fn recv_within<T>(rx: &mut UnboundedReceiver<T>, timeout: Duration) -> Option<T> {
  let deadline = Instant::now() + timeout;
  loop {
    if let Ok(value) = rx.try_recv() {
      return Some(value);
    }
    if Instant::now() >= deadline {
      return None;
    }
    std::thread::sleep(Duration::from_millis(2));
  }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if condition() {
      return true;
    }
    std::thread::sleep(Duration::from_millis(2));
  }
  condition()
}

pub const WAIT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(150);

pub fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,net_dispatch=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}
