//! OpenClaw gateway wire protocol
//!
//! The gateway speaks JSON text frames over a WebSocket. Every frame is an
//! object discriminated by a `type` field: `req` for client requests, `res`
//! for their responses, and `event` for server pushes. Requests and
//! responses correlate by `id`; events are fire-and-forget.
//!
//! [`schema`] defines the frame envelope, [`types`] the method params and
//! event payloads the bridge actually uses.

pub mod schema;
pub mod types;

pub use schema::{EventFrame, GatewayFrame, ProtocolError, RequestFrame, ResponseFrame};
pub use types::{
    chat_states, events, extract_text_content, methods, AgentEventPayload, ChatEventPayload,
    ChatSendAck, ChatSendParams, ClientInfo, ConnectAuth, ConnectParams, HelloPayload,
    CONNECT_REQUEST_ID, PROTOCOL_VERSION,
};
