//! Step trait and error types.

use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error returned by a step execution.
#[derive(Error, Debug)]
pub enum StepError {
    /// The step failed. Failures are never retried.
    #[error("{0}")]
    Failed(#[from] anyhow::Error),

    /// The step observed the cancellation signal and gave up mid-step.
    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    /// Create a failure from any error.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(err.into())
    }

    /// Create a failure from a message.
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Failed(anyhow::Error::msg(message))
    }

    /// Returns true if the step gave up because of cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A single step in a pipeline that transforms the state it receives.
///
/// Long-running steps should watch `cancel` themselves; the pipeline only
/// checks it between steps.
#[async_trait]
pub trait Step<S>: Send + Sync {
    /// The name of this step for logging and diagnostics.
    fn name(&self) -> &str;

    /// Execute the step with the current state.
    async fn execute(&self, state: S, cancel: &CancellationToken) -> Result<S, StepError>;
}

/// Adapter turning an async closure into a [`Step`].
pub struct FnStep<S, F> {
    name: String,
    f: F,
    _phantom: PhantomData<fn(S) -> S>,
}

impl<S, F, Fut> FnStep<S, F>
where
    F: Fn(S, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<S, StepError>> + Send,
{
    /// Wrap `f` as a named step.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<S, F, Fut> Step<S> for FnStep<S, F>
where
    S: Send + 'static,
    F: Fn(S, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<S, StepError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, state: S, cancel: &CancellationToken) -> Result<S, StepError> {
        (self.f)(state, cancel.clone()).await
    }
}
