//! Connection supervision with bounded exponential-backoff reconnection.
//!
//! A [`Supervisor`] owns one link's lifecycle:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Disconnected -> Reconnecting -> Connected
//!                                                               \-> Failed
//! ```
//!
//! The initial connect is not retried: its error goes straight back to the
//! caller. Once connected, an unsolicited disconnect emits `disconnected`
//! and starts reconnecting. Each attempt waits the policy's backoff
//! (1 s, 2 s, 4 s, 8 s, 16 s by default), emits `reconnecting`, and reopens
//! the link. Success emits `connected` and resets the attempt counter;
//! running out of attempts emits `failed`, which is terminal.
//!
//! [`Supervisor::disconnect`] cancels the supervisor first, so a backoff
//! wait in flight is abandoned, no further attempt is made, and no further
//! status is emitted.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ridelink_types::ConnectionStatus;

use crate::error::{Error, Result};
use crate::transport::DisconnectHandler;

/// Policy for automatic reconnection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnection attempts (None = unlimited).
    pub max_attempts: Option<u32>,
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy with unlimited retry attempts.
    pub fn unlimited() -> Self {
        Self {
            max_attempts: None,
            ..Default::default()
        }
    }

    /// Never reconnect: the first link loss is terminal.
    pub fn never() -> Self {
        Self {
            max_attempts: Some(0),
            ..Default::default()
        }
    }

    /// Set maximum number of reconnection attempts.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set delay before the first reconnection attempt.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay between attempts.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before the attempt with zero-based index `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        if !delay_ms.is_finite() {
            return self.max_delay;
        }
        let delay = Duration::from_millis(delay_ms as u64);

        delay.min(self.max_delay)
    }

    /// Validate the policy and return an error if invalid.
    ///
    /// Checks that:
    /// - `backoff_multiplier` is >= 1.0
    /// - `initial_delay` is > 0
    /// - `max_delay` >= `initial_delay`
    pub fn validate(&self) -> Result<()> {
        if !(self.backoff_multiplier >= 1.0) {
            return Err(Error::InvalidConfig(
                "backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.initial_delay.is_zero() {
            return Err(Error::InvalidConfig(
                "initial_delay must be > 0".to_string(),
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::InvalidConfig(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle state of a supervised link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// Not started, or manually disconnected.
    Idle,
    /// Initial connect in progress.
    Connecting,
    /// Link is up.
    Connected,
    /// Link was lost; reconnection is about to start.
    Disconnected,
    /// Waiting for or performing a reconnect attempt.
    Reconnecting,
    /// Reconnection gave up. Terminal.
    Failed,
}

/// A link the supervisor can (re)establish.
///
/// `open` must bring the link to a fully usable state, including any
/// subscriptions, and must start from fresh per-link state every time it is
/// called. `on_disconnect` is to be invoked when the link is lost without
/// `close` having been called.
#[async_trait]
pub trait Link: Send + Sync {
    /// Establish the link.
    async fn open(&self, on_disconnect: DisconnectHandler) -> Result<()>;

    /// Tear the link down.
    async fn close(&self) -> Result<()>;
}

/// Callback receiving the statuses a supervisor emits.
pub type StatusSink = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Per-connection reconnect state machine.
pub struct Supervisor<L: Link> {
    link: Arc<L>,
    policy: ReconnectPolicy,
    on_status: StatusSink,
    state: Mutex<SupervisorState>,
    attempts: AtomicU32,
    /// Incremented on every open; disconnect signals from older links are
    /// ignored.
    generation: AtomicU64,
    cancel: CancellationToken,
    /// Held while a status is emitted, so cancellation cannot interleave.
    emit_lock: Mutex<()>,
    signals: mpsc::UnboundedSender<u64>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<L: Link + 'static> std::fmt::Debug for Supervisor<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<L: Link + 'static> Supervisor<L> {
    /// Create a supervisor for `link`. Nothing happens until [`start`](Self::start).
    pub fn new(link: L, policy: ReconnectPolicy, on_status: StatusSink) -> Arc<Self> {
        let (signals, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            link: Arc::new(link),
            policy,
            on_status,
            state: Mutex::new(SupervisorState::Idle),
            attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            emit_lock: Mutex::new(()),
            signals,
            receiver: Mutex::new(Some(receiver)),
            task: Mutex::new(None),
        })
    }

    /// The supervised link.
    pub fn link(&self) -> &Arc<L> {
        &self.link
    }

    /// The reconnect policy.
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reconnection attempts made since the link was last up.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Whether [`disconnect`](Self::disconnect) or [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Move to `to` unless cancelled. Returns whether the move happened.
    fn transition(&self, to: SupervisorState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancel.is_cancelled() {
            return false;
        }
        debug!("{:?} -> {:?}", *state, to);
        *state = to;
        true
    }

    fn emit(&self, status: ConnectionStatus) {
        let _guard = self.emit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancel.is_cancelled() {
            return;
        }
        if catch_unwind(AssertUnwindSafe(|| (self.on_status)(status))).is_err() {
            error!("Status listener panicked while handling '{}'", status);
        }
    }

    fn disconnect_handler(&self, generation: u64) -> DisconnectHandler {
        let signals = self.signals.clone();
        Arc::new(move || {
            let _ = signals.send(generation);
        })
    }

    async fn open_link(&self) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.link.open(self.disconnect_handler(generation)).await
    }

    /// Establish the link for the first time.
    ///
    /// A failure is returned as-is and not retried; the supervisor goes
    /// back to `Idle`. On success `connected` is emitted and link loss is
    /// watched from then on.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if *state != SupervisorState::Idle {
                return Ok(());
            }
            *state = SupervisorState::Connecting;
        }

        if let Err(e) = self.open_link().await {
            self.transition(SupervisorState::Idle);
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            if let Err(e) = self.link.close().await {
                debug!("Close after cancelled start failed: {}", e);
            }
            return Err(Error::Cancelled);
        }

        self.attempts.store(0, Ordering::SeqCst);
        self.transition(SupervisorState::Connected);
        self.emit(ConnectionStatus::Connected);

        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(receiver) = receiver {
            let this = Arc::clone(self);
            let handle = tokio::spawn(async move { this.run(receiver).await });
            *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
        Ok(())
    }

    /// Watch for link loss until cancelled or failed.
    async fn run(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<u64>) {
        loop {
            let generation = tokio::select! {
                _ = self.cancel.cancelled() => break,
                signal = receiver.recv() => match signal {
                    Some(generation) => generation,
                    None => break,
                },
            };

            // Signals from a previous link, or repeats while already
            // recovering, are coalesced into the one being handled.
            if generation != self.generation.load(Ordering::SeqCst)
                || self.state() != SupervisorState::Connected
            {
                debug!("Ignoring stale disconnect signal (link {})", generation);
                continue;
            }

            if !self.transition(SupervisorState::Disconnected) {
                break;
            }
            warn!("Link lost, reconnecting");
            self.emit(ConnectionStatus::Disconnected);

            if !self.reconnect().await {
                break;
            }
        }
        debug!("Supervisor task finished");
    }

    /// Reconnect loop. Returns `true` once the link is back up, `false` if
    /// cancelled or out of attempts.
    async fn reconnect(&self) -> bool {
        if !self.transition(SupervisorState::Reconnecting) {
            return false;
        }

        loop {
            if self.cancel.is_cancelled() {
                info!("Reconnection cancelled");
                return false;
            }

            // Check if we've exceeded max attempts
            let made = self.attempts.load(Ordering::SeqCst);
            if let Some(max) = self.policy.max_attempts
                && made >= max
            {
                warn!("Giving up after {} reconnection attempts", made);
                if self.transition(SupervisorState::Failed) {
                    self.emit(ConnectionStatus::Failed);
                }
                return false;
            }

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = self.policy.delay_for_attempt(attempt - 1);
            info!("Reconnection attempt {} in {:?}", attempt, delay);

            // Wait before attempting (cancellation ends the wait early)
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Reconnection cancelled");
                    return false;
                }
                _ = sleep(delay) => {}
            }

            // Check for cancellation after sleep
            if self.cancel.is_cancelled() {
                return false;
            }
            self.emit(ConnectionStatus::Reconnecting);

            match self.open_link().await {
                Ok(()) => {
                    if self.cancel.is_cancelled() {
                        if let Err(e) = self.link.close().await {
                            debug!("Close after cancelled reconnect failed: {}", e);
                        }
                        return false;
                    }
                    info!("Reconnected successfully after {} attempts", attempt);
                    self.attempts.store(0, Ordering::SeqCst);
                    if !self.transition(SupervisorState::Connected) {
                        return false;
                    }
                    self.emit(ConnectionStatus::Connected);
                    return true;
                }
                Err(e) => {
                    warn!("Reconnection attempt {} failed: {}", attempt, e);
                }
            }
        }
    }

    /// Stop supervising without closing the link.
    ///
    /// Any backoff wait is abandoned and no status is emitted after this
    /// returns. Returns `false` if already cancelled.
    pub fn cancel(&self) -> bool {
        let _emit = self.emit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        *state = SupervisorState::Idle;
        true
    }

    /// Manually disconnect: cancel supervision, then close the link.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.cancel() {
            return Ok(());
        }
        info!("Disconnecting (manual)");
        self.link.close().await
    }
}

impl<L: Link> Drop for Supervisor<L> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
