//! Client-facing transport.
//!
//! Provides:
//! - `BufferAggregator` - Fans buffer frames out to WebSocket clients, local or proxied
//! - `router` - The axum HTTP API and `/buffers` WebSocket endpoint
//! - `WsUpstreamConnector` - HQ's pooled connections to remote buffer endpoints

pub mod aggregator;
pub mod auth;
pub mod protocol;
pub mod routes;
pub mod upstream;
pub mod websocket;

pub use aggregator::{AggregatorConfig, AggregatorError, BufferAggregator, ClientId, ClientSender};
pub use auth::AuthConfig;
pub use protocol::{
    BUFFER_MAGIC, ClientControl, FrameError, Outbound, ServerMessage, decode_frame, encode_frame,
};
pub use routes::{ApiError, AppState, ServerMode, router};
pub use upstream::{UpstreamConnector, UpstreamEvent, UpstreamLink, WsUpstreamConnector, buffers_url};
