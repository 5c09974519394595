//! Byte-stream transports.
//!
//! Three wirings: stdio (two half-duplex streams), pipe (domain socket),
//! and in-process IPC message ports that skip the framing header entirely.
//! How a server process comes to exist is the embedder's business; this
//! module only wraps the streams it exposes.

use tokio::io::BufReader;

pub use tether_rpc::{ChannelTransport, FramedTransport, MessageTransport, TransportError};

/// Framed transport over this process's stdio.
pub fn stdio() -> FramedTransport<BufReader<tokio::io::Stdin>, tokio::io::Stdout> {
	FramedTransport::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
}

/// Framed transport over an arbitrary read/write pair (e.g. a spawned
/// child's pipes).
pub fn from_streams<R, W>(reader: R, writer: W) -> FramedTransport<BufReader<R>, W>
where
	R: tokio::io::AsyncRead + Unpin + Send,
	W: tokio::io::AsyncWrite + Unpin + Send,
{
	FramedTransport::new(BufReader::new(reader), writer)
}

/// Connects to a named pipe (Unix domain socket) and frames it.
#[cfg(unix)]
pub async fn connect_pipe(
	path: impl AsRef<std::path::Path>,
) -> std::io::Result<FramedTransport<BufReader<tokio::net::unix::OwnedReadHalf>, tokio::net::unix::OwnedWriteHalf>> {
	let stream = tokio::net::UnixStream::connect(path).await?;
	let (reader, writer) = stream.into_split();
	Ok(FramedTransport::new(BufReader::new(reader), writer))
}

/// Accepts one connection on a named pipe and frames it.
#[cfg(unix)]
pub async fn accept_pipe(
	path: impl AsRef<std::path::Path>,
) -> std::io::Result<FramedTransport<BufReader<tokio::net::unix::OwnedReadHalf>, tokio::net::unix::OwnedWriteHalf>> {
	let listener = tokio::net::UnixListener::bind(path)?;
	let (stream, _addr) = listener.accept().await?;
	let (reader, writer) = stream.into_split();
	Ok(FramedTransport::new(BufReader::new(reader), writer))
}

/// Connected in-process message ports carrying parsed messages; no
/// framing on this path.
pub fn ipc_pair() -> (ChannelTransport, ChannelTransport) {
	ChannelTransport::pair()
}
