//! Binary WebSocket API.
//!
//! Frames are `opcode (u8) || protobuf payload`. Only ping and handshake
//! are serviced before the handshake completes; every other request is
//! correlated by `request_id` and answered with exactly one response or
//! error frame.

pub mod cache;
pub mod errors;
pub mod handlers;
pub mod opcodes;
pub mod proto;
pub mod registry;
pub mod server;
pub mod session;
pub mod subs;

pub use cache::{BlockFingerprint, InflightCache};
pub use errors::{ErrorKind, WsErrorCode};
pub use handlers::build_registry;
pub use opcodes::Opcode;
pub use registry::{HandlerError, HandlerOutcome, OpcodeRegistry, RequestHandler};
pub use server::{WsServer, WsServerConfig};
pub use session::{ClientSession, FrameAction, OutFrame, SessionConfig};
pub use subs::{ClientId, ClientSink, SubscriptionManager, Topic};
