//! Single-run lifecycle engine shared by the pipeline flavors.
//!
//! The engine owns the run state machine and the lifecycle hooks:
//!
//! ```text
//! NotStarted -> Running -> Succeeded | Failed | Cancelled -> Ended
//! ```
//!
//! Hooks are observer lists. They can only be registered while the engine is
//! `NotStarted`; registering later is a programming error and panics.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::outcome::{Outcome, RunError};

/// Lifecycle state of a [`RunnerEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Terminal. Reached after the `on_ended` hooks have fired.
    Ended,
}

/// Step position handed to `on_stepping` / `on_stepped` hooks.
#[derive(Debug, Clone, Copy)]
pub struct StepInfo<'a> {
    pub index: usize,
    pub name: &'a str,
}

type Hook = Arc<dyn Fn() + Send + Sync>;
type StepHook = Arc<dyn Fn(&StepInfo<'_>) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&RunError) + Send + Sync>;
type EndHook<S> = Arc<dyn Fn(&Outcome<S>) + Send + Sync>;

/// Registered lifecycle hooks, snapshotted when a run starts.
pub struct Hooks<S> {
    starting: Vec<Hook>,
    stepping: Vec<StepHook>,
    stepped: Vec<StepHook>,
    exception: Vec<ErrorHook>,
    cancellation: Vec<Hook>,
    ended: Vec<EndHook<S>>,
}

impl<S> Default for Hooks<S> {
    fn default() -> Self {
        Self {
            starting: Vec::new(),
            stepping: Vec::new(),
            stepped: Vec::new(),
            exception: Vec::new(),
            cancellation: Vec::new(),
            ended: Vec::new(),
        }
    }
}

impl<S> Clone for Hooks<S> {
    fn clone(&self) -> Self {
        Self {
            starting: self.starting.clone(),
            stepping: self.stepping.clone(),
            stepped: self.stepped.clone(),
            exception: self.exception.clone(),
            cancellation: self.cancellation.clone(),
            ended: self.ended.clone(),
        }
    }
}

impl<S> Hooks<S> {
    /// Notify observers that a step is about to run.
    pub fn stepping(&self, info: &StepInfo<'_>) {
        for hook in &self.stepping {
            hook(info);
        }
    }

    /// Notify observers that a step has completed.
    pub fn stepped(&self, info: &StepInfo<'_>) {
        for hook in &self.stepped {
            hook(info);
        }
    }
}

/// Governs a single run: state transitions, timing, panic capture and hooks.
pub struct RunnerEngine<S> {
    name: String,
    state: Mutex<RunState>,
    hooks: Mutex<Hooks<S>>,
    elapsed: Mutex<Option<Duration>>,
}

impl<S> RunnerEngine<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RunState::NotStarted),
            hooks: Mutex::new(Hooks::default()),
            elapsed: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    /// Wall-clock duration of the run, once it has finished.
    pub fn elapsed(&self) -> Option<Duration> {
        *self.elapsed.lock()
    }

    /// Panic unless the engine is still `NotStarted`.
    ///
    /// # Panics
    ///
    /// Panics once a run has begun.
    pub fn assert_not_started(&self, what: &str) {
        let state = self.state();
        assert!(
            state == RunState::NotStarted,
            "cannot register {} on '{}': run already started (state: {:?})",
            what,
            self.name,
            state
        );
    }

    fn register(&self, what: &str, f: impl FnOnce(&mut Hooks<S>)) -> &Self {
        let mut hooks = self.hooks.lock();
        self.assert_not_started(what);
        f(&mut hooks);
        self
    }

    /// Called once when the run enters `Running`.
    pub fn on_starting(&self, hook: impl Fn() + Send + Sync + 'static) -> &Self {
        self.register("an on_starting hook", |h| h.starting.push(Arc::new(hook)))
    }

    /// Called before each step.
    pub fn on_stepping(&self, hook: impl Fn(&StepInfo<'_>) + Send + Sync + 'static) -> &Self {
        self.register("an on_stepping hook", |h| h.stepping.push(Arc::new(hook)))
    }

    /// Called after each step that completed.
    pub fn on_stepped(&self, hook: impl Fn(&StepInfo<'_>) + Send + Sync + 'static) -> &Self {
        self.register("an on_stepped hook", |h| h.stepped.push(Arc::new(hook)))
    }

    /// Called when the run fails for any reason other than cancellation.
    pub fn on_exception(&self, hook: impl Fn(&RunError) + Send + Sync + 'static) -> &Self {
        self.register("an on_exception hook", |h| h.exception.push(Arc::new(hook)))
    }

    /// Called when the run stopped because of cancellation.
    pub fn on_cancellation_requested(&self, hook: impl Fn() + Send + Sync + 'static) -> &Self {
        self.register("an on_cancellation_requested hook", |h| {
            h.cancellation.push(Arc::new(hook))
        })
    }

    /// Called exactly once with the final outcome, whatever the path.
    pub fn on_ended(&self, hook: impl Fn(&Outcome<S>) + Send + Sync + 'static) -> &Self {
        self.register("an on_ended hook", |h| h.ended.push(Arc::new(hook)))
    }

    /// Execute `work` as the single run of this engine.
    ///
    /// A second call does not run `work` again and returns
    /// [`RunError::AlreadyStarted`].
    pub async fn run<F, Fut>(&self, work: F) -> Outcome<S>
    where
        F: FnOnce(Hooks<S>) -> Fut,
        Fut: Future<Output = Outcome<S>>,
    {
        {
            let mut state = self.state.lock();
            if *state != RunState::NotStarted {
                warn!(pipeline = %self.name, state = ?*state, "Run requested twice");
                return Outcome::failed(
                    RunError::AlreadyStarted {
                        pipeline: self.name.clone(),
                    },
                    None,
                );
            }
            *state = RunState::Running;
        }

        let hooks = self.hooks.lock().clone();
        debug!(pipeline = %self.name, "Run starting");
        for hook in &hooks.starting {
            hook();
        }

        let started = Instant::now();
        let outcome = match AssertUnwindSafe(work(hooks.clone())).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Outcome::failed(
                RunError::Panicked {
                    message: panic_message(panic.as_ref()),
                },
                None,
            ),
        };
        let elapsed = started.elapsed();
        *self.elapsed.lock() = Some(elapsed);

        let terminal = match outcome.error() {
            None => {
                info!(
                    pipeline = %self.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Run succeeded"
                );
                RunState::Succeeded
            }
            Some(RunError::Cancelled) => {
                warn!(
                    pipeline = %self.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Run cancelled"
                );
                for hook in &hooks.cancellation {
                    hook();
                }
                RunState::Cancelled
            }
            Some(err) => {
                error!(
                    pipeline = %self.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %err,
                    "Run failed"
                );
                for hook in &hooks.exception {
                    hook(err);
                }
                RunState::Failed
            }
        };
        *self.state.lock() = terminal;

        for hook in &hooks.ended {
            hook(&outcome);
        }
        *self.state.lock() = RunState::Ended;

        outcome
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
