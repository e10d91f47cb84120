//! Incremental build scheduler.
//!
//! A [`Scheduler`] walks an immutable [`weft_core::PipGraph`] in dependency order. Each pip
//! first computes its weak fingerprint and looks for a stored execution whose observed path
//! set still evaluates to the recorded strong fingerprint. On a hit the outputs are replayed
//! from the content store and verified; on a miss the pip runs through a [`PipExecutor`],
//! its access reports are reconciled with its declarations and a clean result is published
//! to the cache.
//!
//! Execution slots are bounded by [`SchedulerConfig::max_parallelism`] and gated by the
//! [`weft_resource::ResourceManager`], which may cancel or suspend running pips under memory
//! pressure. Every pip ends in a terminal [`PipState`]; the [`BuildReport`] collects them.

mod config;
mod engine;
mod error;
mod executor;
mod hub;
mod report;
mod scheduler;
mod state;

pub use config::SchedulerConfig;
pub use error::{PipFailure, SetupError, ViolationKindName};
pub use executor::{ExecutionOutcome, ExecutionRequest, PipExecutor, ProcessPipExecutor};
pub use hub::{AccessMessage, AccessReportHub, AccessReportReceiver, AccessReporter, HubError};
pub use report::{BuildCounters, BuildReport, PipOutcome, SkipReason};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerServices};
pub use state::{InvalidTransition, PipState, PipStateTable};
