//! Concrete `AgentRuntime` implementations.
//!
//! `ProcessRuntime` drives the external agent CLI over its line-delimited
//! JSON protocol. `MockRuntime` replays pre-programmed event scripts for
//! deterministic tests.

pub mod mock;
pub mod process;
pub mod wire;

pub use mock::{MockRuntime, MockScript};
pub use process::ProcessRuntime;
