//! Agent chat core: drives a locally installed coding agent over its
//! streaming JSON protocol and exposes the conversation over HTTP.

pub mod checkpoints;
pub mod cli;
pub mod config;
pub mod conversations;
pub mod events;
pub mod mcp_config;
pub mod orchestrator;
pub mod permissions;
pub mod router;
pub mod session_state;
pub mod supervisor;
pub mod tool_calls;

pub use orchestrator::{ChatSession, TurnRequest};
pub use router::build_router;
