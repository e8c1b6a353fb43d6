//! The dispatch thread.
//!
//! Split into focused submodules:
//! - `core`: the [`DispatchThread`] struct, its backends and thread startup
//! - `execution`: the run loop, commit/pull under the lock and slot servicing
//! - `direct`: in-thread compilation when worker processes are disabled

mod core;
mod direct;
mod execution;
#[cfg(test)]
mod tests;

pub(crate) use self::core::{Backend, DispatchThread};
