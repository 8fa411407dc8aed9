// WebSocket surface: handshake gate, connection lifecycle, per-socket loop.

pub mod gatekeeper;
pub mod handler;
pub mod lifecycle;

pub use gatekeeper::{Admission, Gatekeeper, HandshakeError, HandshakeParams};
pub use handler::{router, HeartbeatConfig, WsState, MAX_FRAME_BYTES};
