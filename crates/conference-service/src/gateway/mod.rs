//! Signaling gateway: one WebSocket per client, JSON request/response plus
//! pushed events.

pub mod hub;
pub mod protocol;
pub mod server;
pub mod session;

pub use hub::ConnectionHub;
pub use protocol::{parse_request, ClientRequest, ServerMessage};
pub use server::{signaling_router, GatewayState};
pub use session::{SessionState, SignalingSession};
