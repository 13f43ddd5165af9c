//! Stream protocol spoken between the chat core and a coding-agent process.
//!
//! The agent reads and writes newline-delimited JSON on its standard streams.
//! [`LineCodec`] reassembles raw stdout chunks into JSON values,
//! [`AgentMessage::classify`] turns those values into a closed set of typed
//! messages, and [`outbound`] builds everything the core writes back.

pub mod codec;
pub mod inbound;
pub mod outbound;

pub use codec::{CodecError, LineCodec};
pub use inbound::{
    AccountInfo, AgentMessage, AssistantContent, AssistantMessage, CanUseTool, ControlRequest,
    ControlRequestBody, ControlResponse, ResultMessage, SystemMessage, Usage, UserContent,
    UserMessage,
};
pub use outbound::{OutboundMessage, PermissionBehavior, PermissionDecision};
