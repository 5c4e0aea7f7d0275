//! Notification channel used to push out-of-band messages to a bound
//! MCP-client handle.
//!
//! A broadcast channel an `ActiveSession` can be bound to so the relay
//! handler can push `caller_tools_config` and `caller_tool_request`
//! notifications without blocking on a direct socket write. The WebSocket
//! transport itself is external framing — `server.rs` is the façade that
//! wires a real transport onto this channel.

pub mod event;

pub use event::EventBroadcaster;
