//! Priority-ordered hook pipeline.
//!
//! Hooks are side-effecting observers attached to lifecycle events. They
//! run independently of the policy engine's verdict: a hook can stop its
//! own pipeline early but can never block a tool call, and a failing hook
//! never takes the other hooks down with it.

pub mod error;
pub mod hook;
pub mod pipeline;

pub use error::HookError;
pub use hook::{Hook, HookContext};
pub use pipeline::HookPipeline;
