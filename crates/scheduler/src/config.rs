//! Scheduler configuration.
//!
//! Split into focused submodules:
//! - `types`: the [`SchedulerConfig`] struct, serde defaults and derived values
//! - `loading`: TOML parsing and `KILN_*` environment overrides
//! - `validation`: sanity checks run after loading

mod loading;
mod types;
mod validation;

pub use types::SchedulerConfig;
