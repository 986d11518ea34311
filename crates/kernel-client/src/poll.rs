//! A scheduled background task with backoff on failure and standby while the
//! host is hidden.
//!
//! Each [`Poll`] owns one tokio task. The task runs the factory on a timer:
//! on success the next tick is `interval` away, on failure the delay grows
//! by `factor` up to `max`. [`Poll::refresh`] runs the factory right away
//! whatever the current delay is.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::error::ClientError;

/// Retry schedule shared by polling and reconnects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub interval: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Backoff {
    pub fn new(interval: Duration, max: Duration) -> Self {
        Self {
            interval,
            factor: 2.0,
            max,
        }
    }

    /// Delay before retry number `attempt` (0-based): `interval * factor^attempt`,
    /// capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.factor.max(1.0);
        let scaled = self.interval.as_secs_f64() * factor.powi(attempt.min(64) as i32);
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            self.max.max(self.interval)
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

/// When ticks should skip their work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Standby {
    #[default]
    Never,
    WhenHidden,
}

/// Host-controlled visibility flag.
///
/// Clones share the same flag. A process without a notion of visibility
/// simply never hides.
#[derive(Debug, Clone)]
pub struct Visibility {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Visibility {
    fn default() -> Self {
        Self::new()
    }
}

impl Visibility {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_hidden(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.tx.send_replace(hidden);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Where a poll is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Constructed,
    Started,
    Resolved,
    Rejected,
    /// First success after one or more failures.
    Reconnected,
    Refreshed,
    Standby,
    Stopped,
    Disposed,
}

/// Snapshot published after every state change.
#[derive(Debug, Clone)]
pub struct PollTick {
    pub phase: Phase,
    /// Delay until the next scheduled tick.
    pub interval: Duration,
    /// Consecutive failures so far.
    pub failures: u32,
    /// The last failure, while the poll is failing.
    pub error: Option<Arc<ClientError>>,
}

impl PollTick {
    /// Whether backoff has reached its ceiling.
    pub fn at_max(&self, backoff: &Backoff) -> bool {
        self.failures > 0 && self.interval >= backoff.max
    }
}

/// Options for [`Poll::new`].
#[derive(Debug, Clone)]
pub struct PollOptions {
    pub name: &'static str,
    pub frequency: Backoff,
    pub standby: Standby,
    pub visibility: Visibility,
    /// Start ticking immediately on construction.
    pub auto_start: bool,
}

type Waiter = oneshot::Sender<Result<(), Arc<ClientError>>>;

enum PollCommand {
    Start,
    Stop,
    Refresh(Waiter),
}

/// Handle to a running poll. Dropping it disposes the poll.
pub struct Poll {
    commands: mpsc::UnboundedSender<PollCommand>,
    state: watch::Receiver<PollTick>,
    frequency: Backoff,
}

impl Poll {
    pub fn new<F, Fut>(options: PollOptions, factory: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ClientError>> + Send + 'static,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(PollTick {
            phase: Phase::Constructed,
            interval: options.frequency.interval,
            failures: 0,
            error: None,
        });
        let frequency = options.frequency;
        if options.auto_start {
            let _ = commands.send(PollCommand::Start);
        }

        let runner = Runner {
            name: options.name,
            frequency,
            standby: options.standby,
            visibility: options.visibility,
            factory,
            state: state_tx,
            failures: 0,
            running: false,
            next_at: None,
        };
        tokio::spawn(runner.run(rx));

        Self {
            commands,
            state,
            frequency,
        }
    }

    pub fn start(&self) {
        let _ = self.commands.send(PollCommand::Start);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(PollCommand::Stop);
    }

    /// Run the factory now and wait for that run to settle.
    pub async fn refresh(&self) -> Result<(), Arc<ClientError>> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(PollCommand::Refresh(tx)).is_err() {
            return Err(Arc::new(ClientError::Disposed));
        }
        rx.await.unwrap_or_else(|_| Err(Arc::new(ClientError::Disposed)))
    }

    pub fn tick(&self) -> PollTick {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollTick> {
        self.state.clone()
    }

    pub fn frequency(&self) -> Backoff {
        self.frequency
    }
}

struct Runner<F> {
    name: &'static str,
    frequency: Backoff,
    standby: Standby,
    visibility: Visibility,
    factory: F,
    state: watch::Sender<PollTick>,
    failures: u32,
    running: bool,
    next_at: Option<Instant>,
}

impl<F, Fut> Runner<F>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ClientError>> + Send + 'static,
{
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PollCommand>) {
        let mut hidden = self.visibility.subscribe();
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(PollCommand::Start) => {
                        if !self.running {
                            self.running = true;
                            self.next_at = Some(Instant::now());
                            self.publish(Phase::Started, Duration::ZERO, None);
                        }
                    }
                    Some(PollCommand::Stop) => {
                        self.running = false;
                        self.next_at = None;
                        self.publish(Phase::Stopped, self.frequency.interval, None);
                    }
                    Some(PollCommand::Refresh(waiter)) => {
                        let outcome = self.execute(true).await;
                        let _ = waiter.send(outcome);
                    }
                    None => break,
                },
                _ = sleep_until(self.next_at) => {
                    self.next_at = None;
                    if self.standby == Standby::WhenHidden && self.visibility.is_hidden() {
                        self.next_at = Some(Instant::now() + self.frequency.interval);
                        self.publish(Phase::Standby, self.frequency.interval, None);
                    } else {
                        let _ = self.execute(false).await;
                    }
                }
                changed = hidden.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now_hidden = *hidden.borrow_and_update();
                    if !now_hidden && self.running && self.state.borrow().phase == Phase::Standby {
                        debug!("[poll] {} visible again, ticking now", self.name);
                        self.next_at = Some(Instant::now());
                    }
                }
            }
        }
        self.publish(Phase::Disposed, self.frequency.interval, None);
        debug!("[poll] {} disposed", self.name);
    }

    async fn execute(&mut self, refreshed: bool) -> Result<(), Arc<ClientError>> {
        match (self.factory)().await {
            Ok(()) => {
                let phase = if refreshed {
                    Phase::Refreshed
                } else if self.failures > 0 {
                    Phase::Reconnected
                } else {
                    Phase::Resolved
                };
                self.failures = 0;
                self.schedule(self.frequency.interval);
                self.publish(phase, self.frequency.interval, None);
                Ok(())
            }
            Err(err) => {
                let err = Arc::new(err);
                if matches!(*err, ClientError::Validation { .. }) {
                    warn!("[poll] {} stopped: {}", self.name, err);
                    self.running = false;
                    self.next_at = None;
                    self.failures += 1;
                    self.publish(Phase::Stopped, self.frequency.interval, Some(err.clone()));
                    return Err(err);
                }
                let delay = self.frequency.delay(self.failures);
                self.failures += 1;
                debug!(
                    "[poll] {} failed ({} in a row), retrying in {:?}: {}",
                    self.name, self.failures, delay, err
                );
                self.schedule(delay);
                self.publish(Phase::Rejected, delay, Some(err.clone()));
                Err(err)
            }
        }
    }

    fn schedule(&mut self, delay: Duration) {
        if self.running {
            self.next_at = Some(Instant::now() + delay);
        }
    }

    fn publish(&self, phase: Phase, interval: Duration, error: Option<Arc<ClientError>>) {
        self.state.send_replace(PollTick {
            phase,
            interval,
            failures: self.failures,
            error,
        });
    }
}

pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
