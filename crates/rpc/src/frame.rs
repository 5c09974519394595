//! Content-Length framed codec.
//!
//! Each message on the wire is one or more `Name: Value\r\n` header lines,
//! a terminating empty `\r\n` line, then exactly `Content-Length` bytes of
//! JSON. Only `Content-Length` is required; unknown headers are ignored. A
//! `Content-Type` header may name a charset, which must be `utf-8` (or the
//! legacy spelling `utf8`).

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{Envelope, Message, Version};
use crate::transport::{MessageTransport, TransportError};

pub(crate) const CONTENT_LENGTH: &str = "content-length";
pub(crate) const CONTENT_TYPE: &str = "content-type";

/// Errors raised by the framing layer.
///
/// Frame errors are fatal to the byte stream: once the header grammar is
/// violated there is no way to resynchronize on a message boundary.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),
	#[error("stream ended inside a message frame")]
	UnexpectedEof,
	#[error("malformed header line: {0:?}")]
	BadHeader(String),
	#[error("missing Content-Length header")]
	MissingContentLength,
	#[error("invalid Content-Length value: {0:?}")]
	BadContentLength(String),
	#[error("unsupported content charset: {0:?}")]
	UnsupportedCharset(String),
}

/// Framed message transport over a byte-stream pair.
pub struct FramedTransport<R, W> {
	reader: R,
	writer: W,
	/// Scratch buffer reused across frames.
	buf: Vec<u8>,
}

impl<R, W> FramedTransport<R, W>
where
	R: AsyncBufRead + Unpin + Send,
	W: AsyncWrite + Unpin + Send,
{
	pub fn new(reader: R, writer: W) -> Self {
		Self {
			reader,
			writer,
			buf: Vec::new(),
		}
	}

	/// Reads one frame, blocking until `Content-Length` bytes are available.
	///
	/// Returns `Ok(None)` on a clean EOF at a message boundary. EOF anywhere
	/// inside a frame (including after a partial header block) is
	/// [`FrameError::UnexpectedEof`].
	async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
		let mut content_length: Option<usize> = None;
		let mut line = String::new();
		let mut first = true;

		loop {
			line.clear();
			let n = self.reader.read_line(&mut line).await?;
			if n == 0 {
				if first && content_length.is_none() {
					return Ok(None);
				}
				return Err(FrameError::UnexpectedEof);
			}
			first = false;

			let trimmed = line.strip_suffix("\r\n").or_else(|| line.strip_suffix('\n')).unwrap_or(&line);
			if trimmed.is_empty() {
				break;
			}

			let Some((name, value)) = trimmed.split_once(':') else {
				return Err(FrameError::BadHeader(trimmed.to_string()));
			};
			let name = name.trim().to_ascii_lowercase();
			let value = value.trim();
			match name.as_str() {
				CONTENT_LENGTH => {
					let len: usize = value
						.parse()
						.map_err(|_| FrameError::BadContentLength(value.to_string()))?;
					content_length = Some(len);
				}
				CONTENT_TYPE => check_content_type(value)?,
				// Unknown headers are ignored.
				_ => {}
			}
		}

		let len = content_length.ok_or(FrameError::MissingContentLength)?;
		self.buf.resize(len, 0);
		self.reader
			.read_exact(&mut self.buf)
			.await
			.map_err(|e| match e.kind() {
				std::io::ErrorKind::UnexpectedEof => FrameError::UnexpectedEof,
				_ => FrameError::Io(e),
			})?;
		Ok(Some(std::mem::take(&mut self.buf)))
	}

	async fn write_frame(&mut self, body: &[u8]) -> Result<(), FrameError> {
		// The header block and body go out as one write so a frame is never
		// interleaved with another writer on the same stream.
		let mut out = Vec::with_capacity(body.len() + 32);
		out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
		out.extend_from_slice(body);
		self.writer.write_all(&out).await?;
		self.writer.flush().await?;
		Ok(())
	}
}

fn check_content_type(value: &str) -> Result<(), FrameError> {
	for param in value.split(';').skip(1) {
		if let Some((key, charset)) = param.split_once('=') {
			if key.trim().eq_ignore_ascii_case("charset") {
				let charset = charset.trim().trim_matches('"');
				if !charset.eq_ignore_ascii_case("utf-8") && !charset.eq_ignore_ascii_case("utf8") {
					return Err(FrameError::UnsupportedCharset(charset.to_string()));
				}
			}
		}
	}
	Ok(())
}

#[async_trait]
impl<R, W> MessageTransport for FramedTransport<R, W>
where
	R: AsyncBufRead + Unpin + Send,
	W: AsyncWrite + Unpin + Send,
{
	async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
		let Some(body) = self.read_frame().await? else {
			return Ok(None);
		};
		let env: Envelope = serde_json::from_slice(&body).map_err(TransportError::Parse)?;
		Ok(Some(env.message))
	}

	async fn send(&mut self, message: Message) -> Result<(), TransportError> {
		let env = Envelope {
			jsonrpc: Version,
			message,
		};
		let body = serde_json::to_vec(&env).map_err(TransportError::Serialize)?;
		self.write_frame(&body).await?;
		Ok(())
	}
}
