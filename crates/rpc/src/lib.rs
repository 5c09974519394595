//! Generic async JSON-RPC 2.0 message pump.
//!
//! This crate carries the protocol-agnostic half of the runtime: the
//! [`Message`] data model, the Content-Length framed codec, the in-process
//! channel transport, and the [`MainLoop`] dispatcher that correlates
//! requests with responses, routes notifications in wire order, and
//! delivers cancellation both ways.
//!
//! Protocol semantics (capability negotiation, document sync, …) live in
//! `tether-lsp`; everything here only knows about ids, methods, and JSON
//! payloads.

pub mod cancel;
pub mod endpoint;
pub mod frame;
pub mod message;
pub mod router;
pub mod trace;
pub mod transport;

pub use cancel::CancelParams;
pub use endpoint::{LoopOutcome, MainLoop, MainLoopError, Peer, RequestCx, RequestError, RpcService};
pub use frame::{FrameError, FramedTransport};
pub use message::{
	AnyNotification, AnyRequest, AnyResponse, ErrorCode, Message, RequestId, ResponseError,
};
pub use router::Router;
pub use trace::{Direction, TraceEntry, TraceFormat, TraceLevel, TraceSink, Tracer};
pub use transport::{ChannelTransport, MessageTransport, TransportError};

/// Convenience alias used across the workspace for raw JSON payloads.
pub type JsonValue = serde_json::Value;
