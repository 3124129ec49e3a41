//! The two scheduling stages and the state they share

pub mod analysis;
pub mod unpacking;
pub mod workload;

pub use analysis::{AnalysisHooks, AnalysisScheduler, AnalysisSettings};
pub use unpacking::{PostUnpackHook, UnpackStats, UnpackingScheduler, UnpackingSettings};
pub use workload::{AdmissionGate, SchedulerState, Sleeper, ThreadSleeper, WorkloadCounter, throttle_exceeded};
