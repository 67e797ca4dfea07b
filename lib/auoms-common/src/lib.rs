//! Shared ambient-stack plumbing used across the auoms crates: configuration,
//! synchronization primitives, the `EventWriter` contract, name/cmdline
//! resolution seams, and process/self metrics.

pub mod config;
pub mod kernel_info;
pub mod limits;
pub mod metrics;
pub mod proc_metrics;
pub mod rate_limit;
pub mod redactor;
pub mod resolver;
pub mod sync;
pub mod writer;

pub use config::Config;
pub use sync::Gate;
pub use writer::{EventWriter, WriteOutcome};
