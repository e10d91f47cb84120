//! Machine resource tracking for the build scheduler.
//!
//! The [`ResourceManager`] consumes periodic [`MachinePerfInfo`] samples, classifies them into a
//! [`ResourcePressure`] level and reacts by cancelling or suspending the most recently started
//! pips through their [`PipControl`]. Dispatch consults [`ResourceManager::can_dispatch`] before
//! starting new work.

mod control;
mod manager;
mod perf;
mod pressure;

pub use control::{CancelReason, PipControl};
pub use manager::{
    ManageMemoryMode, ResourceAction, ResourceActionKind, ResourceEvent, ResourceManager,
    ResourceRegistration, ResourceReport,
};
pub use perf::{scheduler_rss_bytes, MachinePerfInfo, PerformanceSampler, SysinfoSampler};
pub use pressure::{ResourcePressure, ResourceThresholds};
