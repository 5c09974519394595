//! JSON-RPC 2.0 message data model.
//!
//! Payloads are opaque [`JsonValue`]s named by method string; typing them is
//! the caller's business. The [`Message`] enum deserializes untagged, so one
//! codec path handles requests, responses, and notifications alike.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::JsonValue;

/// Request id assigned by the sender: an integer or a string.
///
/// Ids are unique for the lifetime of a connection. Notifications carry no
/// id at all.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
	Int(i64),
	Str(String),
}

impl fmt::Display for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RequestId::Int(n) => n.fmt(f),
			RequestId::Str(s) => s.fmt(f),
		}
	}
}

impl From<i64> for RequestId {
	fn from(n: i64) -> Self {
		RequestId::Int(n)
	}
}

impl From<String> for RequestId {
	fn from(s: String) -> Self {
		RequestId::Str(s)
	}
}

/// A request expecting a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyRequest {
	pub id: RequestId,
	pub method: String,
	#[serde(default, skip_serializing_if = "JsonValue::is_null")]
	pub params: JsonValue,
}

/// A notification; fire-and-forget, no id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyNotification {
	pub method: String,
	#[serde(default, skip_serializing_if = "JsonValue::is_null")]
	pub params: JsonValue,
}

impl AnyNotification {
	pub fn new(method: impl Into<String>, params: JsonValue) -> Self {
		Self {
			method: method.into(),
			params,
		}
	}
}

/// A response carrying either a result or an error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyResponse {
	pub id: RequestId,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<JsonValue>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<ResponseError>,
}

impl AnyResponse {
	pub fn new_ok(id: RequestId, result: JsonValue) -> Self {
		Self {
			id,
			result: Some(result),
			error: None,
		}
	}

	pub fn new_err(id: RequestId, error: ResponseError) -> Self {
		Self {
			id,
			result: None,
			error: Some(error),
		}
	}
}

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("jsonrpc error {code}: {message}")]
pub struct ResponseError {
	pub code: i64,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<JsonValue>,
}

impl ResponseError {
	pub fn new(code: i64, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
			data: None,
		}
	}

	pub fn method_not_found(method: &str) -> Self {
		Self::new(ErrorCode::METHOD_NOT_FOUND, format!("method not found: {method}"))
	}

	pub fn request_cancelled() -> Self {
		Self::new(ErrorCode::REQUEST_CANCELLED, "request cancelled")
	}

	/// True for the error codes a requester must not log as failures.
	pub fn is_benign(&self) -> bool {
		self.code == ErrorCode::REQUEST_CANCELLED || self.code == ErrorCode::CONTENT_MODIFIED
	}
}

/// JSON-RPC and LSP-reserved error codes.
pub struct ErrorCode;

impl ErrorCode {
	pub const PARSE_ERROR: i64 = -32700;
	pub const INVALID_REQUEST: i64 = -32600;
	pub const METHOD_NOT_FOUND: i64 = -32601;
	pub const INVALID_PARAMS: i64 = -32602;
	pub const INTERNAL_ERROR: i64 = -32603;

	/// Application-defined protocol errors live in this reserved range.
	pub const SERVER_ERROR_START: i64 = -32099;
	pub const SERVER_ERROR_END: i64 = -32000;

	pub const REQUEST_CANCELLED: i64 = -32800;
	pub const CONTENT_MODIFIED: i64 = -32801;
}

/// Any message that can appear on the wire.
///
/// Deserialization is untagged; the `id`/`method`/`result`/`error` field
/// combination disambiguates. Requests are tried first: untagged matching
/// ignores unknown fields, so a request would otherwise satisfy the
/// response shape through its `id` alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
	Request(AnyRequest),
	Response(AnyResponse),
	Notification(AnyNotification),
}

impl Message {
	/// Method name for requests and notifications, `None` for responses.
	pub fn method(&self) -> Option<&str> {
		match self {
			Message::Request(r) => Some(&r.method),
			Message::Notification(n) => Some(&n.method),
			Message::Response(_) => None,
		}
	}
}

impl From<AnyRequest> for Message {
	fn from(r: AnyRequest) -> Self {
		Message::Request(r)
	}
}

impl From<AnyResponse> for Message {
	fn from(r: AnyResponse) -> Self {
		Message::Response(r)
	}
}

impl From<AnyNotification> for Message {
	fn from(n: AnyNotification) -> Self {
		Message::Notification(n)
	}
}

/// Wire envelope adding the `jsonrpc: "2.0"` marker around [`Message`].
///
/// Kept separate so in-memory message passing does not carry the constant
/// field around.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Envelope {
	pub jsonrpc: Version,
	#[serde(flatten)]
	pub message: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Version;

impl Serialize for Version {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str("2.0")
	}
}

impl<'de> Deserialize<'de> for Version {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		// String, not &str: the flattened envelope buffers its content.
		let s = String::deserialize(deserializer)?;
		if s == "2.0" {
			Ok(Version)
		} else {
			Err(serde::de::Error::custom(format!("unsupported jsonrpc version {s:?}")))
		}
	}
}
