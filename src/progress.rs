//! Weighted progress reporting over a sequence of named steps.

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Receives progress updates.
pub trait ProgressSink: Send + Sync {
    /// `current` out of `max` units are done or under way.
    fn report(&self, description: &str, max: u32, current: u32);

    /// The reporting run is over.
    fn ended(&self, description: Option<&str>);
}

impl<T: ProgressSink + ?Sized> ProgressSink for Arc<T> {
    fn report(&self, description: &str, max: u32, current: u32) {
        (**self).report(description, max, current);
    }

    fn ended(&self, description: Option<&str>) {
        (**self).ended(description);
    }
}

/// A sink that discards all updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _description: &str, _max: u32, _current: u32) {}

    fn ended(&self, _description: Option<&str>) {}
}

/// A sink that logs every update through `tracing`.
#[derive(Debug, Clone)]
pub struct TracingProgress {
    name: String,
}

impl TracingProgress {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ProgressSink for TracingProgress {
    fn report(&self, description: &str, max: u32, current: u32) {
        info!(progress = %self.name, description, current, max, "Progress");
    }

    fn ended(&self, description: Option<&str>) {
        info!(progress = %self.name, description, "Progress ended");
    }
}

/// Sink handed to each step for its own fine-grained progress.
pub type SubProgress = Arc<dyn ProgressSink>;

/// Type alias for a weighted step's action.
type WeightedAction<S> =
    Box<dyn Fn(S, SubProgress) -> BoxFuture<'static, anyhow::Result<S>> + Send + Sync>;

/// A named step contributing `weight` units to the total.
pub struct WeightedStep<S> {
    action: WeightedAction<S>,
    description: String,
    weight: u32,
}

impl<S> WeightedStep<S> {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }
}

/// Serializable view of a registered step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub description: String,
    pub weight: u32,
}

/// Error returned by [`WeightedProgressRunner::run`].
#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("step '{description}' (#{index}) failed: {source}")]
    StepFailed {
        description: String,
        index: usize,
        #[source]
        source: anyhow::Error,
    },
}

/// Runs weighted steps in order against an evolving state.
///
/// The primary sink gets one `report` per step *before* the step starts,
/// with `current` already including that step's weight, and one `ended`
/// call once the run is over. The sub sink is passed to every step and never
/// read by the runner.
///
/// Step errors are not captured into an outcome: they come back as
/// [`ProgressError`] from [`run`](Self::run).
pub struct WeightedProgressRunner<S> {
    initial: S,
    primary: SubProgress,
    sub: SubProgress,
    steps: Vec<WeightedStep<S>>,
}

impl<S: Send + 'static> WeightedProgressRunner<S> {
    pub fn new(initial: S, primary: impl ProgressSink + 'static) -> Self {
        Self {
            initial,
            primary: Arc::new(primary),
            sub: Arc::new(NoopProgress),
            steps: Vec::new(),
        }
    }

    /// Set the sink handed to steps. Defaults to [`NoopProgress`].
    pub fn with_sub_progress(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.sub = Arc::new(sink);
        self
    }

    /// Register a step.
    ///
    /// # Panics
    ///
    /// Panics if `weight` is 0 or the total weight would overflow `u32`.
    pub fn add_step<F, Fut>(
        mut self,
        description: impl Into<String>,
        weight: u32,
        action: F,
    ) -> Self
    where
        F: Fn(S, SubProgress) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
    {
        let description = description.into();
        assert!(
            weight >= 1,
            "step '{}' must have a weight of at least 1",
            description
        );
        assert!(
            self.total_weight().checked_add(weight).is_some(),
            "step '{}' pushes the total weight past {}",
            description,
            u32::MAX
        );
        self.steps.push(WeightedStep {
            action: Box::new(move |state, sub| action(state, sub).boxed()),
            description,
            weight,
        });
        self
    }

    /// Sum of all registered weights.
    pub fn total_weight(&self) -> u32 {
        self.steps.iter().map(|s| s.weight).sum()
    }

    pub fn steps(&self) -> &[WeightedStep<S>] {
        &self.steps
    }

    pub fn plan(&self) -> Vec<PlannedStep> {
        self.steps
            .iter()
            .map(|s| PlannedStep {
                description: s.description.clone(),
                weight: s.weight,
            })
            .collect()
    }

    /// Run every step in order and return the final state.
    ///
    /// Cancellation is checked before each step; when observed the state
    /// produced so far is returned as `Ok`. The primary sink's `ended` fires
    /// once on every exit, including a panicking step.
    pub async fn run(self, cancel: &CancellationToken) -> Result<S, ProgressError> {
        let max = self.total_weight();
        let mut current = 0u32;
        let mut state = self.initial;
        let _ended = EndedGuard(&self.primary);

        for (index, step) in self.steps.into_iter().enumerate() {
            if cancel.is_cancelled() {
                debug!(index, step = %step.description, "Cancellation observed before step");
                break;
            }

            current += step.weight;
            self.primary.report(&step.description, max, current);

            state = (step.action)(state, self.sub.clone())
                .await
                .map_err(|source| ProgressError::StepFailed {
                    description: step.description,
                    index,
                    source,
                })?;
        }

        Ok(state)
    }
}

/// Calls `ended` on the primary sink when the run is left.
struct EndedGuard<'a>(&'a SubProgress);

impl Drop for EndedGuard<'_> {
    fn drop(&mut self) {
        self.0.ended(None);
    }
}
