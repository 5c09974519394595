//! Message transport abstraction.
//!
//! The dispatcher is written against [`MessageTransport`], not byte streams:
//! framed stdio/pipe transports implement it on top of the codec in
//! [`crate::frame`], while host-provided message ports that already carry
//! parsed JSON (the IPC case) implement it with no framing at all.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::frame::FrameError;
use crate::message::Message;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
	#[error(transparent)]
	Frame(#[from] FrameError),
	/// Inbound bytes framed correctly but were not valid JSON.
	///
	/// Surfaced to the dispatcher as a ParseError (-32700); the stream itself
	/// is still synchronized on a frame boundary.
	#[error("malformed json payload: {0}")]
	Parse(#[source] serde_json::Error),
	#[error("failed to serialize message: {0}")]
	Serialize(#[source] serde_json::Error),
	#[error("peer endpoint dropped")]
	Closed,
}

impl TransportError {
	/// Parse errors leave the frame boundary intact; everything else tears
	/// the connection down.
	pub fn is_recoverable(&self) -> bool {
		matches!(self, TransportError::Parse(_))
	}
}

#[async_trait]
pub trait MessageTransport: Send {
	/// Receives the next message; `Ok(None)` means clean end-of-stream.
	async fn recv(&mut self) -> Result<Option<Message>, TransportError>;
	async fn send(&mut self, message: Message) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: MessageTransport + ?Sized> MessageTransport for Box<T> {
	async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
		(**self).recv().await
	}

	async fn send(&mut self, message: Message) -> Result<(), TransportError> {
		(**self).send(message).await
	}
}

/// In-process transport carrying already-parsed messages over channels.
///
/// Used for the IPC case and for wiring two endpoints together in tests;
/// the `Content-Length` framing header is unnecessary here.
pub struct ChannelTransport {
	rx: mpsc::UnboundedReceiver<Message>,
	tx: mpsc::UnboundedSender<Message>,
}

impl ChannelTransport {
	/// Creates a connected pair of endpoints.
	pub fn pair() -> (ChannelTransport, ChannelTransport) {
		let (a_tx, a_rx) = mpsc::unbounded_channel();
		let (b_tx, b_rx) = mpsc::unbounded_channel();
		(
			ChannelTransport { rx: a_rx, tx: b_tx },
			ChannelTransport { rx: b_rx, tx: a_tx },
		)
	}

	/// Builds a transport from raw channel halves (host message ports).
	pub fn from_parts(rx: mpsc::UnboundedReceiver<Message>, tx: mpsc::UnboundedSender<Message>) -> Self {
		Self { rx, tx }
	}
}

#[async_trait]
impl MessageTransport for ChannelTransport {
	async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
		Ok(self.rx.recv().await)
	}

	async fn send(&mut self, message: Message) -> Result<(), TransportError> {
		self.tx.send(message).map_err(|_| TransportError::Closed)
	}
}
