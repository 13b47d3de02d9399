//! Sequential pipeline builder and executor.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{panic_message, RunState, RunnerEngine, StepInfo};
use crate::outcome::{CarriesFailure, Outcome, RunError};
use crate::step::{FnStep, Step, StepError};

/// Type alias for the function producing a pipeline's initial state.
type StartFn<S> =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<S, StepError>> + Send + Sync>;

/// Type alias for failure detectors used to short-circuit a run.
type FailureDetector<S> = Arc<dyn Fn(&S) -> Option<String> + Send + Sync>;

/// Name reported for the start function in short-circuit errors.
const START_STEP: &str = "start";

/// Serializable representation of a pipeline's structure.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineGraph {
    pub name: String,
    pub state: RunState,
    pub steps: Vec<StepNode>,
}

impl PipelineGraph {
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// A step in the pipeline graph.
#[derive(Debug, Clone, Serialize)]
pub struct StepNode {
    pub name: String,
    pub index: usize,
}

/// An ordered chain of async steps threading a state value.
///
/// Build it with [`start_with`](Self::start_with) and [`then`](Self::then),
/// then call [`run`](Self::run) once. Registration methods take `&self` so a
/// pipeline can be shared, but they panic once the run has begun.
///
/// ```rust,ignore
/// let pipeline = SequentialPipeline::start_with("import", |_cancel| async { Ok(Vec::new()) });
/// pipeline
///     .then_fn("fetch", |rows, _cancel| async move { fetch(rows).await })
///     .then_fn("store", |rows, _cancel| async move { store(rows).await });
///
/// let outcome = pipeline.run(&CancellationToken::new()).await;
/// ```
///
/// Each step receives a clone of the current state so a failing step still
/// leaves the last good state in the returned [`Outcome`].
pub struct SequentialPipeline<S> {
    engine: RunnerEngine<S>,
    start: StartFn<S>,
    steps: Mutex<Vec<Arc<dyn Step<S>>>>,
    detector: Mutex<Option<FailureDetector<S>>>,
}

/// A pipeline whose steps run for effect only.
pub type StatelessPipeline = SequentialPipeline<()>;

impl<S> SequentialPipeline<S>
where
    S: Clone + Send + 'static,
{
    /// Create a pipeline whose initial state comes from `start`.
    pub fn start_with<F, Fut>(name: impl Into<String>, start: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, StepError>> + Send + 'static,
    {
        let start: StartFn<S> = Arc::new(move |cancel| start(cancel).boxed());
        Self {
            engine: RunnerEngine::new(name),
            start,
            steps: Mutex::new(Vec::new()),
            detector: Mutex::new(None),
        }
    }

    /// Append a step.
    ///
    /// # Panics
    ///
    /// Panics if the pipeline has already started running.
    pub fn then(&self, step: impl Step<S> + 'static) -> &Self {
        let mut steps = self.steps.lock();
        self.engine.assert_not_started("a step");
        steps.push(Arc::new(step));
        self
    }

    /// Append an async closure as a named step.
    pub fn then_fn<F, Fut>(&self, name: impl Into<String>, f: F) -> &Self
    where
        F: Fn(S, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, StepError>> + Send + 'static,
    {
        self.then(FnStep::new(name, f))
    }

    /// Stop the run as soon as a state satisfies `detector`.
    pub fn short_circuit_when(
        &self,
        detector: impl Fn(&S) -> Option<String> + Send + Sync + 'static,
    ) -> &Self {
        let mut slot = self.detector.lock();
        self.engine.assert_not_started("a failure detector");
        *slot = Some(Arc::new(detector));
        self
    }

    /// Stop the run as soon as a state reports its own failure.
    pub fn short_circuit_on_failure(&self) -> &Self
    where
        S: CarriesFailure,
    {
        self.short_circuit_when(|state: &S| state.failure())
    }

    pub fn on_starting(&self, hook: impl Fn() + Send + Sync + 'static) -> &Self {
        self.engine.on_starting(hook);
        self
    }

    pub fn on_stepping(&self, hook: impl Fn(&StepInfo<'_>) + Send + Sync + 'static) -> &Self {
        self.engine.on_stepping(hook);
        self
    }

    pub fn on_stepped(&self, hook: impl Fn(&StepInfo<'_>) + Send + Sync + 'static) -> &Self {
        self.engine.on_stepped(hook);
        self
    }

    pub fn on_exception(&self, hook: impl Fn(&RunError) + Send + Sync + 'static) -> &Self {
        self.engine.on_exception(hook);
        self
    }

    pub fn on_cancellation_requested(&self, hook: impl Fn() + Send + Sync + 'static) -> &Self {
        self.engine.on_cancellation_requested(hook);
        self
    }

    pub fn on_ended(&self, hook: impl Fn(&Outcome<S>) + Send + Sync + 'static) -> &Self {
        self.engine.on_ended(hook);
        self
    }

    pub fn name(&self) -> &str {
        self.engine.name()
    }

    pub fn state(&self) -> RunState {
        self.engine.state()
    }

    pub fn engine(&self) -> &RunnerEngine<S> {
        &self.engine
    }

    pub fn step_count(&self) -> usize {
        self.steps.lock().len()
    }

    /// Export the registered steps for diagnostics.
    pub fn describe(&self) -> PipelineGraph {
        let steps = self
            .steps
            .lock()
            .iter()
            .enumerate()
            .map(|(index, step)| StepNode {
                name: step.name().to_string(),
                index,
            })
            .collect();

        PipelineGraph {
            name: self.name().to_string(),
            state: self.state(),
            steps,
        }
    }

    /// Execute the pipeline.
    ///
    /// `cancel` is checked before every step; a step already running is
    /// never interrupted. Step failures come back as a failed [`Outcome`],
    /// never as a panic or an `Err`.
    pub async fn run(&self, cancel: &CancellationToken) -> Outcome<S> {
        let cancel = cancel.clone();
        self.engine
            .run(|hooks| async move {
                let steps = self.steps.lock().clone();
                let detector = self.detector.lock().clone();
                let pipeline = self.name();

                let mut state = match (self.start)(cancel.clone()).await {
                    Ok(state) => state,
                    Err(StepError::Cancelled) => return Outcome::cancelled(None),
                    Err(StepError::Failed(e)) => {
                        return Outcome::failed(RunError::StartFailed(e), None)
                    }
                };
                if let Some(outcome) = short_circuit(detector.as_ref(), START_STEP, &state) {
                    return outcome.with_state(state);
                }

                for (index, step) in steps.iter().enumerate() {
                    if cancel.is_cancelled() {
                        debug!(pipeline, index, "Cancellation observed before step");
                        return Outcome::cancelled(Some(state));
                    }

                    let info = StepInfo {
                        index,
                        name: step.name(),
                    };
                    hooks.stepping(&info);
                    debug!(pipeline, step = info.name, index, "Executing step");

                    let attempt = AssertUnwindSafe(step.execute(state.clone(), &cancel))
                        .catch_unwind()
                        .await;
                    state = match attempt {
                        Ok(Ok(next)) => next,
                        Ok(Err(StepError::Cancelled)) => return Outcome::cancelled(Some(state)),
                        Ok(Err(StepError::Failed(source))) => {
                            return Outcome::failed(
                                RunError::StepFailed {
                                    step: info.name.to_string(),
                                    index,
                                    source,
                                },
                                Some(state),
                            )
                        }
                        Err(panic) => {
                            return Outcome::failed(
                                RunError::Panicked {
                                    message: panic_message(panic.as_ref()),
                                },
                                Some(state),
                            )
                        }
                    };
                    hooks.stepped(&info);

                    if let Some(outcome) = short_circuit(detector.as_ref(), info.name, &state) {
                        return outcome.with_state(state);
                    }
                }

                Outcome::Succeeded(state)
            })
            .await
    }
}

impl SequentialPipeline<()> {
    /// Append an async action that does not touch any state.
    pub fn then_action<F, Fut>(&self, name: impl Into<String>, action: F) -> &Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.then_fn(name, move |(), cancel| action(cancel))
    }
}

/// Pending short-circuit, waiting for the state it should carry.
struct ShortCircuit(RunError);

impl ShortCircuit {
    fn with_state<S>(self, state: S) -> Outcome<S> {
        Outcome::failed(self.0, Some(state))
    }
}

fn short_circuit<S>(
    detector: Option<&FailureDetector<S>>,
    step: &str,
    state: &S,
) -> Option<ShortCircuit> {
    let reason = detector.and_then(|detect| detect(state))?;
    debug!(step, reason = %reason, "State carries a failure, stopping");
    Some(ShortCircuit(RunError::ShortCircuited {
        step: step.to_string(),
        reason,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_describe_lists_steps() {
        let pipeline = SequentialPipeline::start_with("numbers", |_| async { Ok(0u32) });
        pipeline
            .then_fn("add_one", |n, _| async move { Ok(n + 1) })
            .then_fn("double", |n, _| async move { Ok(n * 2) });

        let graph = pipeline.describe();
        assert_eq!(graph.name, "numbers");
        assert_eq!(graph.state, RunState::NotStarted);
        let names: Vec<_> = graph.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["add_one", "double"]);

        let json = graph.to_json().unwrap();
        assert_eq!(json["state"], "not_started");
        assert_eq!(json["steps"][1]["index"], 1);
    }

    #[tokio::test]
    async fn test_start_failure() {
        let pipeline = SequentialPipeline::start_with("broken", |_| async {
            Err::<u32, _>(StepError::msg("no seed"))
        });
        pipeline.then_fn("never", |n, _| async move { Ok(n) });

        let outcome = pipeline.run(&CancellationToken::new()).await;
        assert!(matches!(outcome.error(), Some(RunError::StartFailed(_))));
        assert!(outcome.value().is_none());
    }

    #[tokio::test]
    async fn test_stateless_actions_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = StatelessPipeline::start_with("effects", |_| async { Ok(()) });

        for name in ["a", "b", "c"] {
            let log = log.clone();
            pipeline.then_action(name, move |_| {
                let log = log.clone();
                async move {
                    log.lock().push(name);
                    Ok(())
                }
            });
        }

        let outcome = pipeline.run(&CancellationToken::new()).await;
        assert!(outcome.succeeded());
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }
}
