//! Periodic action that never overlaps itself and stops gracefully.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::panic_message;

/// Type-erased tick action.
type TickFn =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Type alias for the per-tick error callback.
type ErrorHandler = Arc<dyn Fn(&TickError) + Send + Sync>;

/// Completion of the background loop, awaitable by every `stop` caller.
type LoopHandle = Shared<BoxFuture<'static, ()>>;

/// Failure of a single tick. The timer keeps running after it.
#[derive(Error, Debug)]
pub enum TickError {
    #[error("tick {tick} failed: {source}")]
    Failed {
        tick: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("tick {tick} panicked: {message}")]
    Panicked { tick: u64, message: String },
}

impl TickError {
    pub fn tick(&self) -> u64 {
        match self {
            Self::Failed { tick, .. } | Self::Panicked { tick, .. } => *tick,
        }
    }
}

/// Error returned by [`PeriodicGuardedTimer::start`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("timer '{0}' is already running")]
    AlreadyRunning(String),

    #[error("timer '{0}' has been stopped and cannot be restarted")]
    Stopped(String),

    #[error("timer '{0}' must be started inside a tokio runtime")]
    NoRuntime(String),
}

/// Lifecycle of a [`PeriodicGuardedTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Created,
    Running,
    Stopped,
}

enum Lifecycle {
    Created,
    Running(LoopHandle),
    Stopped(Option<LoopHandle>),
}

/// State shared between the timer and its background loop.
struct TimerCore {
    name: String,
    interval: Duration,
    action: TickFn,
    on_error: Option<ErrorHandler>,
    run_on_start: bool,
    tick_guard: tokio::sync::Mutex<()>,
    ticks: AtomicU64,
}

impl TimerCore {
    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            timer = %self.name,
            interval_ms = self.interval.as_millis() as u64,
            run_on_start = self.run_on_start,
            "Timer started"
        );

        if self.run_on_start && !cancel.is_cancelled() {
            self.tick(&cancel).await;
        }

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // Consume immediate first tick

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if cancel.is_cancelled() {
                break;
            }
            self.tick(&cancel).await;
        }

        debug!(timer = %self.name, "Timer loop exited");
    }

    async fn tick(&self, cancel: &CancellationToken) {
        let _guard = self.tick_guard.lock().await;
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(timer = %self.name, tick, "Executing tick");

        let err = match AssertUnwindSafe((self.action)(cancel.clone()))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => return,
            Ok(Err(source)) => TickError::Failed { tick, source },
            Err(panic) => TickError::Panicked {
                tick,
                message: panic_message(panic.as_ref()),
            },
        };

        error!(timer = %self.name, tick, error = %err, "Tick failed");
        if let Some(on_error) = &self.on_error {
            on_error(&err);
        }
    }
}

/// Runs an async action every `interval` on a background task.
///
/// Ticks never overlap: the loop awaits each action before waiting for the
/// next tick, and the action runs under a per-timer lock. A failing or
/// panicking tick is logged, handed to `on_error`, and the timer carries on.
/// [`stop`](Self::stop) waits for an in-flight tick to finish.
///
/// ```rust,ignore
/// let timer = PeriodicGuardedTimer::builder(Duration::from_secs(30), |_cancel| async {
///     flush_metrics().await
/// })
/// .name("metrics-flush")
/// .build();
///
/// timer.start()?;
/// // ...
/// timer.stop().await;
/// ```
pub struct PeriodicGuardedTimer {
    core: Arc<TimerCore>,
    cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl PeriodicGuardedTimer {
    /// Create a timer with default settings.
    pub fn new<F, Fut>(interval: Duration, action: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::builder(interval, action).build()
    }

    pub fn builder<F, Fut>(interval: Duration, action: F) -> TimerBuilder
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        TimerBuilder::new(interval, action)
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn interval(&self) -> Duration {
        self.core.interval
    }

    /// A timer whose cancellation token fired (through `stop` or a parent
    /// token) reports `Stopped` even if `stop` was never called.
    pub fn state(&self) -> TimerState {
        if self.cancel.is_cancelled() {
            return TimerState::Stopped;
        }
        match *self.lifecycle.lock() {
            Lifecycle::Created => TimerState::Created,
            Lifecycle::Running(_) => TimerState::Running,
            Lifecycle::Stopped(_) => TimerState::Stopped,
        }
    }

    /// Number of ticks started so far, including failed ones.
    pub fn tick_count(&self) -> u64 {
        self.core.ticks.load(Ordering::SeqCst)
    }

    /// Spawn the background loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), TimerError> {
        let mut lifecycle = self.lifecycle.lock();
        if self.cancel.is_cancelled() {
            return Err(TimerError::Stopped(self.name().to_string()));
        }
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running(_) => {
                return Err(TimerError::AlreadyRunning(self.name().to_string()))
            }
            Lifecycle::Stopped(_) => return Err(TimerError::Stopped(self.name().to_string())),
        }

        let runtime =
            Handle::try_current().map_err(|_| TimerError::NoRuntime(self.name().to_string()))?;

        let name = self.core.name.clone();
        let handle = runtime.spawn(self.core.clone().run_loop(self.cancel.clone()));
        let done: LoopHandle = handle
            .map(move |result| {
                if let Err(e) = result {
                    error!(timer = %name, error = %e, "Timer loop terminated abnormally");
                }
            })
            .boxed()
            .shared();

        *lifecycle = Lifecycle::Running(done);
        Ok(())
    }

    /// Stop the loop and wait until no tick is in flight.
    ///
    /// Idempotent. A timer stopped before it was started simply becomes
    /// `Stopped`. A parent token passed to the builder is not cancelled.
    pub async fn stop(&self) {
        let done = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped(None)) {
                Lifecycle::Created | Lifecycle::Stopped(None) => None,
                Lifecycle::Running(done) | Lifecycle::Stopped(Some(done)) => {
                    *lifecycle = Lifecycle::Stopped(Some(done.clone()));
                    Some(done)
                }
            }
        };

        self.cancel.cancel();
        if let Some(done) = done {
            done.await;
        }
        info!(timer = %self.core.name, ticks = self.tick_count(), "Timer stopped");
    }
}

impl Drop for PeriodicGuardedTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Builder for configuring a [`PeriodicGuardedTimer`].
pub struct TimerBuilder {
    interval: Duration,
    action: TickFn,
    name: String,
    on_error: Option<ErrorHandler>,
    parent: Option<CancellationToken>,
    run_on_start: bool,
}

impl TimerBuilder {
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn new<F, Fut>(interval: Duration, action: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        assert!(!interval.is_zero(), "timer interval must be greater than zero");
        Self {
            interval,
            action: Arc::new(move |cancel| action(cancel).boxed()),
            name: "timer".to_string(),
            on_error: None,
            parent: None,
            run_on_start: false,
        }
    }

    /// Name used in logs and errors. Defaults to `"timer"`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Called with every tick failure, after it has been logged.
    pub fn on_error(mut self, handler: impl Fn(&TickError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Also stop when `parent` is cancelled.
    ///
    /// The timer works on a child token; stopping the timer leaves `parent`
    /// untouched.
    pub fn cancellation(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Run the action once immediately on start. Defaults to false.
    pub fn run_on_start(mut self, run: bool) -> Self {
        self.run_on_start = run;
        self
    }

    pub fn build(self) -> PeriodicGuardedTimer {
        let cancel = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        PeriodicGuardedTimer {
            core: Arc::new(TimerCore {
                name: self.name,
                interval: self.interval,
                action: self.action,
                on_error: self.on_error,
                run_on_start: self.run_on_start,
                tick_guard: tokio::sync::Mutex::new(()),
                ticks: AtomicU64::new(0),
            }),
            cancel,
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }
}
