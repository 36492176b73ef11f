//! MCP (Model Context Protocol) peer implementation for metronome.
//!
//! Implements MCP over JSON-RPC 2.0 on a single duplex byte stream. Unlike a
//! plain request/response server, both sides of the stream can originate
//! requests: the client calls tools, and the server calls back with
//! `sampling/createMessage` while a fire is in flight. The [`peer::McpPeer`]
//! multiplexes both directions over one transport.
//!
//! # Architecture
//!
//! - **types**: JSON-RPC 2.0 and MCP protocol types, including sampling
//! - **transport**: split reader/writer halves (stdio, in-memory channels)
//! - **peer**: duplex peer with a pending-request registry keyed by id
//! - **error**: unified error type with JSON-RPC code mapping

pub mod error;
pub mod peer;
pub mod transport;
pub mod types;

pub use error::McpError;
pub use peer::{McpPeer, RequestHandler, SamplingClient};
pub use transport::{ChannelTransport, StdioTransport, TransportRead, TransportWrite};
pub use types::*;
