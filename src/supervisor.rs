use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use teloxide::utils::command::BotCommands;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::client::{BotApi, BotIdentity};
use crate::error::{ClientError, ProbeError, StartError};
use crate::router::{Command, Router};
use crate::shutdown::ShutdownSignal;

/// Lifecycle of the polling loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorState {
  Stopped,
  Starting,
  Polling,
  Retrying { attempt: u32, delay: Duration },
  ShuttingDown,
  /// Retries exhausted. Only `stop()` moves on from here.
  Failed { attempts: u32 },
}

impl SupervisorState {
  pub fn name(&self) -> &'static str {
    match self {
      SupervisorState::Stopped => "stopped",
      SupervisorState::Starting => "starting",
      SupervisorState::Polling => "polling",
      SupervisorState::Retrying { .. } => "retrying",
      SupervisorState::ShuttingDown => "shutting_down",
      SupervisorState::Failed { .. } => "failed",
    }
  }
}

#[derive(Clone, Debug)]
pub struct SupervisorSettings {
  pub max_retries: u32,
  pub backoff_base: Duration,
  pub backoff_ceiling: Duration,
  /// Long-poll timeout once polling is established.
  pub poll_timeout: Duration,
  pub shutdown_timeout: Duration,
  /// Upper bound for the best-effort stale update clearing.
  pub clear_timeout: Duration,
  pub drop_pending_updates: bool,
}

impl Default for SupervisorSettings {
  fn default() -> Self {
    Self {
      max_retries: 5,
      backoff_base: Duration::from_secs(5),
      backoff_ceiling: Duration::from_secs(60),
      poll_timeout: Duration::from_secs(20),
      shutdown_timeout: Duration::from_secs(10),
      clear_timeout: Duration::from_secs(5),
      drop_pending_updates: true,
    }
  }
}

/// Retry counter plus exponential backoff delay.
#[derive(Clone, Debug)]
pub struct RetryTracker {
  attempts: u32,
  delay: Duration,
  base: Duration,
  ceiling: Duration,
  max_attempts: u32,
}

impl RetryTracker {
  pub fn new(max_attempts: u32, base: Duration, ceiling: Duration) -> Self {
    Self {
      attempts: 0,
      delay: base,
      base,
      ceiling,
      max_attempts,
    }
  }

  pub fn attempts(&self) -> u32 {
    self.attempts
  }

  /// Delay the next failure will wait.
  pub fn current_delay(&self) -> Duration {
    self.delay
  }

  pub fn is_exhausted(&self) -> bool {
    self.attempts >= self.max_attempts
  }

  /// Count a failure. Returns how long to wait before the next attempt, or
  /// `None` once the maximum number of attempts is reached.
  pub fn record_failure(&mut self) -> Option<Duration> {
    self.attempts = self.attempts.saturating_add(1);
    if self.is_exhausted() {
      return None;
    }
    let delay = self.delay;
    self.delay = self
      .delay
      .checked_mul(2)
      .unwrap_or(self.ceiling)
      .min(self.ceiling);
    Some(delay)
  }

  pub fn reset(&mut self) {
    self.attempts = 0;
    self.delay = self.base;
  }
}

/// State shared between the supervisor, its polling task and status readers.
/// Only the supervisor and its task write to it.
struct Shared {
  state: watch::Sender<SupervisorState>,
  api: RwLock<Option<Arc<dyn BotApi>>>,
  identity: RwLock<Option<BotIdentity>>,
  retries: AtomicU32,
  loop_running: AtomicBool,
  updater_attached: AtomicBool,
  fatal: AtomicBool,
  created_at: Instant,
}

impl Shared {
  fn set_state(&self, state: SupervisorState) {
    debug!(state = state.name(), "Supervisor state changed");
    self.state.send_replace(state);
  }

  fn release(&self) {
    self.api.write().take();
    self.updater_attached.store(false, Ordering::SeqCst);
    self.loop_running.store(false, Ordering::SeqCst);
  }
}

/// Point-in-time view of the supervisor for status endpoints.
#[derive(Clone, Debug, Serialize)]
pub struct SupervisorSnapshot {
  pub state: &'static str,
  pub retry_attempt: u32,
  pub retry_delay_secs: Option<u64>,
  pub started: bool,
  pub bot_running: bool,
  pub polling_task_running: bool,
  pub updater_running: bool,
  pub fatal: bool,
  pub uptime_secs: u64,
  pub bot: Option<BotIdentity>,
}

/// Read-only handle on a [`Supervisor`]. Cheap to clone.
#[derive(Clone)]
pub struct SupervisorHandle {
  shared: Arc<Shared>,
}

impl SupervisorHandle {
  pub fn state(&self) -> SupervisorState {
    self.shared.state.borrow().clone()
  }

  pub fn identity(&self) -> Option<BotIdentity> {
    self.shared.identity.read().clone()
  }

  /// `start()` has completed and the client has not been released.
  pub fn is_started(&self) -> bool {
    self.shared.identity.read().is_some() && self.shared.api.read().is_some()
  }

  pub fn retry_attempts(&self) -> u32 {
    self.shared.retries.load(Ordering::SeqCst)
  }

  pub fn is_loop_running(&self) -> bool {
    self.shared.loop_running.load(Ordering::SeqCst)
  }

  pub fn is_updater_attached(&self) -> bool {
    self.shared.updater_attached.load(Ordering::SeqCst)
  }

  /// Sticky once polling gave up.
  pub fn is_fatal(&self) -> bool {
    self.shared.fatal.load(Ordering::SeqCst)
  }

  pub fn uptime(&self) -> Duration {
    self.shared.created_at.elapsed()
  }

  pub fn snapshot(&self) -> SupervisorSnapshot {
    let state = self.state();
    let retry_delay_secs = match &state {
      SupervisorState::Retrying { delay, .. } => Some(delay.as_secs()),
      _ => None,
    };
    SupervisorSnapshot {
      state: state.name(),
      retry_attempt: self.retry_attempts(),
      retry_delay_secs,
      started: self.is_started(),
      bot_running: self.is_started() && !self.is_fatal(),
      polling_task_running: self.is_loop_running(),
      updater_running: self.is_updater_attached(),
      fatal: self.is_fatal(),
      uptime_secs: self.uptime().as_secs(),
      bot: self.identity(),
    }
  }

  /// Resolves once the state satisfies `pred`.
  pub async fn wait_until<P>(&self, pred: P) -> SupervisorState
  where
    P: Fn(&SupervisorState) -> bool,
  {
    let mut rx = self.shared.state.subscribe();
    // The sender lives inside `shared`, which we hold, so this only errors
    // in theory.
    let reached = match rx.wait_for(|s| pred(s)).await {
      Ok(state) => state.clone(),
      Err(_) => self.state(),
    };
    reached
  }

  /// Resolves if polling gives up for good.
  pub async fn failed(&self) {
    if self.is_fatal() {
      return;
    }
    self
      .wait_until(|s| matches!(s, SupervisorState::Failed { .. }))
      .await;
  }

  /// Ask the bot client who it is, bounded by `limit`.
  pub async fn probe(&self, limit: Duration) -> Result<BotIdentity, ProbeError> {
    if self.is_fatal() {
      return Err(ProbeError::Failed);
    }
    let api = self.shared.api.read().clone();
    let api = match api {
      Some(api) if self.shared.identity.read().is_some() => api,
      _ => return Err(ProbeError::NotStarted),
    };
    match timeout(limit, api.get_me()).await {
      Ok(Ok(me)) => Ok(me),
      Ok(Err(e)) => Err(ProbeError::Client(e)),
      Err(_) => Err(ProbeError::Client(ClientError::Timeout)),
    }
  }
}

/// Owns the polling task: the only thing allowed to start or stop it.
pub struct Supervisor {
  settings: SupervisorSettings,
  shared: Arc<Shared>,
  shutdown: ShutdownSignal,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
  pub fn new(settings: SupervisorSettings, shutdown: ShutdownSignal) -> Self {
    let (state, _) = watch::channel(SupervisorState::Stopped);
    Self {
      settings,
      shared: Arc::new(Shared {
        state,
        api: RwLock::new(None),
        identity: RwLock::new(None),
        retries: AtomicU32::new(0),
        loop_running: AtomicBool::new(false),
        updater_attached: AtomicBool::new(false),
        fatal: AtomicBool::new(false),
        created_at: Instant::now(),
      }),
      shutdown,
      task: Mutex::new(None),
    }
  }

  pub fn handle(&self) -> SupervisorHandle {
    SupervisorHandle {
      shared: Arc::clone(&self.shared),
    }
  }

  pub fn shutdown_signal(&self) -> &ShutdownSignal {
    &self.shutdown
  }

  /// Build and initialize the bot client, then spawn the polling task.
  ///
  /// `connect` builds the client; its failure, like a failing `getMe`, is
  /// fatal and leaves the supervisor `Stopped`.
  pub async fn start<F>(&self, connect: F, router: Router) -> Result<(), StartError>
  where
    F: FnOnce() -> Result<Arc<dyn BotApi>, ClientError>,
  {
    if self.task.lock().is_some() || self.shared.api.read().is_some() {
      return Err(StartError::AlreadyStarted);
    }
    if self.shutdown.is_triggered() {
      return Err(StartError::ShutDown);
    }
    self.shared.set_state(SupervisorState::Starting);

    let api = match connect() {
      Ok(api) => api,
      Err(e) => {
        self.shared.set_state(SupervisorState::Stopped);
        return Err(StartError::Construction(e));
      }
    };
    let identity = match api.get_me().await {
      Ok(me) => me,
      Err(e) => {
        self.shared.set_state(SupervisorState::Stopped);
        return Err(StartError::Initialize(e));
      }
    };
    info!(username = %identity.username, id = identity.id, "Bot initialized");

    if let Err(e) = api.set_commands(Command::bot_commands()).await {
      warn!(error = %e, "Could not register command list");
    }

    *self.shared.api.write() = Some(Arc::clone(&api));
    *self.shared.identity.write() = Some(identity.clone());
    self.shared.loop_running.store(true, Ordering::SeqCst);

    let worker = PollWorker {
      shared: Arc::clone(&self.shared),
      api,
      router,
      settings: self.settings.clone(),
      shutdown: self.shutdown.clone(),
      username: identity.username,
    };
    *self.task.lock() = Some(tokio::spawn(worker.run()));
    Ok(())
  }

  /// Trigger shutdown, wait (bounded) for the polling task and the handlers
  /// it is draining, then release the client. Safe to call more than once.
  pub async fn stop(&self) {
    self.shutdown.trigger();

    let task = self.task.lock().take();
    if task.is_none() && self.shared.api.read().is_none() {
      if self.shared.state.borrow().clone() != SupervisorState::Stopped {
        self.shared.set_state(SupervisorState::Stopped);
      }
      return;
    }

    info!("Stopping bot");
    self.shared.set_state(SupervisorState::ShuttingDown);

    if let Some(mut task) = task {
      match timeout(self.settings.shutdown_timeout, &mut task).await {
        Ok(Ok(())) => debug!("Polling task finished"),
        Ok(Err(e)) => warn!(error = %e, "Polling task ended abnormally"),
        Err(_) => {
          warn!(
            timeout = ?self.settings.shutdown_timeout,
            "Polling task did not finish in time, aborting it and its handlers"
          );
          task.abort();
        }
      }
    }

    self.shared.release();
    self.shared.set_state(SupervisorState::Stopped);
    info!("Bot stopped");
  }
}

enum PollExit {
  Shutdown,
  Error(ClientError),
}

/// The body of the polling task.
struct PollWorker {
  shared: Arc<Shared>,
  api: Arc<dyn BotApi>,
  router: Router,
  settings: SupervisorSettings,
  shutdown: ShutdownSignal,
  username: String,
}

impl PollWorker {
  /// Never overwrite `ShuttingDown`/`Stopped` written by `stop()`.
  fn set_state(&self, state: SupervisorState) {
    if !self.shutdown.is_triggered() {
      self.shared.set_state(state);
    }
  }

  async fn run(self) {
    let mut retry = RetryTracker::new(
      self.settings.max_retries,
      self.settings.backoff_base,
      self.settings.backoff_ceiling,
    );
    // Survives retries: updates below it were already dispatched.
    let mut offset = 0;
    // Dropping the set aborts whatever is still running.
    let mut handlers = JoinSet::new();

    loop {
      if self.shutdown.is_triggered() {
        break;
      }

      tokio::select! {
        _ = self.shutdown.wait() => break,
        _ = self.clear_stale_updates() => {}
      }

      let e = match self.poll(&mut retry, &mut offset, &mut handlers).await {
        PollExit::Shutdown => break,
        PollExit::Error(e) => e,
      };
      self.shared.updater_attached.store(false, Ordering::SeqCst);

      let delay = retry.record_failure();
      self.shared.retries.store(retry.attempts(), Ordering::SeqCst);
      let Some(delay) = delay else {
        error!(attempts = retry.attempts(), error = %e, "Polling failed too many times, giving up");
        self.shared.fatal.store(true, Ordering::SeqCst);
        self.set_state(SupervisorState::Failed {
          attempts: retry.attempts(),
        });
        break;
      };

      if e.is_conflict() {
        warn!(
          attempt = retry.attempts(),
          delay = ?delay,
          error = %e,
          "Another instance is polling with this token, retrying"
        );
      } else {
        error!(attempt = retry.attempts(), delay = ?delay, error = %e, "Polling failed, retrying");
      }
      self.set_state(SupervisorState::Retrying {
        attempt: retry.attempts(),
        delay,
      });

      tokio::select! {
        _ = self.shutdown.wait() => break,
        _ = sleep(delay) => {}
      }
    }

    self.shared.updater_attached.store(false, Ordering::SeqCst);
    if !handlers.is_empty() {
      info!(in_flight = handlers.len(), "Draining handlers");
    }
    while let Some(res) = handlers.join_next().await {
      log_handler_exit(res);
    }
    self.shared.loop_running.store(false, Ordering::SeqCst);
    info!("Polling loop exited");
  }

  async fn clear_stale_updates(&self) {
    if !self.settings.drop_pending_updates {
      return;
    }
    match timeout(self.settings.clear_timeout, self.api.drop_pending_updates()).await {
      Ok(Ok(())) => debug!("Dropped pending updates"),
      Ok(Err(e)) => warn!(error = %e, "Could not drop pending updates"),
      Err(_) => warn!("Timed out dropping pending updates"),
    }
  }

  /// Poll until shutdown or an error. The first round is a zero-timeout
  /// handshake so a conflict or bad network shows up immediately.
  async fn poll(
    &self,
    retry: &mut RetryTracker,
    offset: &mut i32,
    handlers: &mut JoinSet<()>,
  ) -> PollExit {
    let mut attached = false;

    loop {
      let wait = if attached {
        self.settings.poll_timeout
      } else {
        Duration::ZERO
      };
      let fetched = tokio::select! {
        biased;
        _ = self.shutdown.wait() => return PollExit::Shutdown,
        res = self.api.fetch_updates(*offset, wait) => res,
      };
      let updates = match fetched {
        Ok(updates) => updates,
        Err(e) => return PollExit::Error(e),
      };

      if !attached {
        attached = true;
        if retry.attempts() > 0 {
          info!(failed_attempts = retry.attempts(), "Polling recovered");
        }
        retry.reset();
        self.shared.retries.store(0, Ordering::SeqCst);
        self.shared.updater_attached.store(true, Ordering::SeqCst);
        self.set_state(SupervisorState::Polling);
        info!(username = %self.username, "Polling started");
      }

      while let Some(res) = handlers.try_join_next() {
        log_handler_exit(res);
      }
      for update in updates {
        *offset = (*offset).max(update.id.0 as i32 + 1);
        let router = self.router.clone();
        let api = Arc::clone(&self.api);
        let username = self.username.clone();
        handlers.spawn(async move {
          router.handle_update(update, api.as_ref(), &username).await;
        });
      }
    }
  }
}

fn log_handler_exit(res: Result<(), tokio::task::JoinError>) {
  if let Err(e) = res {
    if e.is_panic() {
      error!(error = %e, "Update handler panicked");
    }
  }
}
