//! Concurrency primitives shared by the harness crates.
//!
//! The only abstraction of interest is [`ctx::Ctx`]: a cancellation token with a
//! deadline, which every blocking call of the harness accepts.

pub mod ctx;
mod signal;
pub mod testonly;
pub mod time;
