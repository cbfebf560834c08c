//! Common test infrastructure
//!
//! Every fixture owns its own temporary database directory, so tests can run
//! in parallel without sharing state. Tests should only import from this
//! module, not from internal submodules.

mod fixtures;
mod tasks;

#[allow(unused_imports)]
pub use fixtures::{body_text, TestApp, TestScheduler};
#[allow(unused_imports)]
pub use tasks::*;
