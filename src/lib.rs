//! OpenCode compatibility shim for stateless Codex and Claude upstreams.

pub mod claude_tools;
pub mod codex;
pub mod codex_instructions;
pub mod config;
pub mod error;
pub mod input;
pub mod models;
pub mod proxy;
pub mod reasoning;
pub mod safety_net;

pub use error::{Result, ShimError};
