//! # Stepwise
//!
//! Small async orchestration primitives.
//!
//! - **[`SequentialPipeline`]** - ordered async steps threading a state value,
//!   with lifecycle hooks, cooperative cancellation and failure capture
//! - **[`WeightedProgressRunner`]** - named, weighted steps reporting progress
//!   to a sink, with a sub-progress sink handed to each step
//! - **[`AsyncMutex`]** - async mutual exclusion for critical sections
//! - **[`PeriodicGuardedTimer`]** - periodic background action that never
//!   overlaps itself and stops gracefully
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stepwise::{SequentialPipeline, StepError};
//! use tokio_util::sync::CancellationToken;
//!
//! let pipeline = SequentialPipeline::start_with("orders", |_| async { Ok(load_orders().await?) });
//! pipeline
//!     .then_fn("validate", |orders, _| async move { validate(orders) })
//!     .then_fn("persist", |orders, _| async move { persist(orders).await })
//!     .on_ended(|outcome| tracing::info!(ok = outcome.succeeded(), "orders done"));
//!
//! let outcome = pipeline.run(&CancellationToken::new()).await;
//! ```
//!
//! ## Progress
//!
//! ```rust,ignore
//! use stepwise::{TracingProgress, WeightedProgressRunner};
//!
//! let state = WeightedProgressRunner::new(Build::default(), TracingProgress::new("build"))
//!     .add_step("fetch sources", 1, |b, _sub| async move { b.fetch().await })
//!     .add_step("compile", 5, |b, sub| async move { b.compile(sub).await })
//!     .run(&cancel)
//!     .await?;
//! ```
//!
//! Pipelines turn step failures into an [`Outcome`]; the progress runner
//! returns them as an `Err` instead.

pub mod engine;
pub mod mutex;
pub mod outcome;
pub mod pipeline;
pub mod progress;
pub mod step;
pub mod timer;

pub use engine::{RunState, RunnerEngine, StepInfo};
pub use mutex::{AsyncMutex, MutexError};
pub use outcome::{CarriesFailure, Outcome, RunError};
pub use pipeline::{PipelineGraph, SequentialPipeline, StatelessPipeline, StepNode};
pub use progress::{
    NoopProgress, PlannedStep, ProgressError, ProgressSink, SubProgress, TracingProgress,
    WeightedProgressRunner, WeightedStep,
};
pub use step::{FnStep, Step, StepError};
pub use timer::{PeriodicGuardedTimer, TickError, TimerBuilder, TimerError, TimerState};

pub use tokio_util::sync::CancellationToken;
