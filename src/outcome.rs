//! Run outcome and error taxonomy.

use thiserror::Error;

/// Error carried by a failed [`Outcome`].
#[derive(Error, Debug)]
pub enum RunError {
    /// The start function of a pipeline failed.
    #[error("start failed: {0}")]
    StartFailed(#[source] anyhow::Error),

    /// A registered step failed.
    #[error("step '{step}' (#{index}) failed: {source}")]
    StepFailed {
        step: String,
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    /// Cancellation was observed at a step boundary or reported by a step.
    #[error("run cancelled")]
    Cancelled,

    /// A step produced a state that itself reports a failure.
    #[error("step '{step}' short-circuited: {reason}")]
    ShortCircuited { step: String, reason: String },

    /// The work panicked.
    #[error("run panicked: {message}")]
    Panicked { message: String },

    /// The engine has already been run once.
    #[error("'{pipeline}' has already been run")]
    AlreadyStarted { pipeline: String },
}

impl RunError {
    /// Returns true for [`RunError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result of a single run.
///
/// A failed outcome always carries an error, a succeeded one never does.
/// Failures keep the last good state when there was one.
#[derive(Debug)]
#[must_use]
pub enum Outcome<T> {
    /// The run completed every step.
    Succeeded(T),
    /// The run stopped early.
    Failed {
        error: RunError,
        state: Option<T>,
    },
}

impl<T> Outcome<T> {
    /// Create a failed outcome.
    pub fn failed(error: RunError, state: Option<T>) -> Self {
        Self::Failed { error, state }
    }

    /// Create a cancelled outcome carrying the last good state.
    pub fn cancelled(state: Option<T>) -> Self {
        Self::Failed {
            error: RunError::Cancelled,
            state,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error(), Some(RunError::Cancelled))
    }

    pub fn error(&self) -> Option<&RunError> {
        match self {
            Self::Succeeded(_) => None,
            Self::Failed { error, .. } => Some(error),
        }
    }

    /// The final state on success, or the last good state on failure.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Succeeded(value) => Some(value),
            Self::Failed { state, .. } => state.as_ref(),
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Succeeded(value) => Some(value),
            Self::Failed { state, .. } => state,
        }
    }

    /// Convert into a plain `Result`, dropping any partial state.
    pub fn into_result(self) -> Result<T, RunError> {
        match self {
            Self::Succeeded(value) => Ok(value),
            Self::Failed { error, .. } => Err(error),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Succeeded(value) => Outcome::Succeeded(f(value)),
            Self::Failed { error, state } => Outcome::Failed {
                error,
                state: state.map(f),
            },
        }
    }
}

/// A state value that can report a failure of its own.
///
/// Pipelines built with `short_circuit_on_failure` stop as soon as a step
/// produces a state for which [`CarriesFailure::failure`] returns `Some`.
pub trait CarriesFailure {
    /// Describe the failure this value carries, if any.
    fn failure(&self) -> Option<String>;
}

impl<T, E: std::fmt::Display> CarriesFailure for Result<T, E> {
    fn failure(&self) -> Option<String> {
        self.as_ref().err().map(|e| e.to_string())
    }
}

impl<T> CarriesFailure for Outcome<T> {
    fn failure(&self) -> Option<String> {
        self.error().map(|e| e.to_string())
    }
}
