//! Wire tracer.
//!
//! When enabled, a copy of every inbound and outbound message is published
//! to the trace sink. `Messages` reports method/id headlines only;
//! `Verbose` includes the payload. This is protocol tracing for the user
//! (the `$/setTrace` facility), distinct from the crate's own `tracing`
//! diagnostics.

use std::sync::Arc;

use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TraceLevel {
	#[default]
	Off,
	Messages,
	Verbose,
}

impl TraceLevel {
	pub fn from_name(name: &str) -> Option<Self> {
		match name {
			"off" => Some(TraceLevel::Off),
			"messages" => Some(TraceLevel::Messages),
			"verbose" => Some(TraceLevel::Verbose),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceFormat {
	#[default]
	Text,
	Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	Send,
	Receive,
}

impl Direction {
	fn label(self) -> &'static str {
		match self {
			Direction::Send => "send",
			Direction::Receive => "receive",
		}
	}
}

/// One rendered trace line handed to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
	pub direction: Direction,
	pub text: String,
}

pub type TraceSink = Arc<dyn Fn(TraceEntry) + Send + Sync>;

/// Message tracer owned by the dispatcher.
#[derive(Clone)]
pub struct Tracer {
	level: TraceLevel,
	format: TraceFormat,
	sink: Option<TraceSink>,
}

impl Default for Tracer {
	fn default() -> Self {
		Self::disabled()
	}
}

impl Tracer {
	pub fn disabled() -> Self {
		Self {
			level: TraceLevel::Off,
			format: TraceFormat::Text,
			sink: None,
		}
	}

	pub fn new(level: TraceLevel, format: TraceFormat, sink: TraceSink) -> Self {
		Self {
			level,
			format,
			sink: Some(sink),
		}
	}

	pub fn set_level(&mut self, level: TraceLevel) {
		self.level = level;
	}

	pub fn level(&self) -> TraceLevel {
		self.level
	}

	/// Publishes a copy of `message` to the sink if tracing is enabled.
	pub fn record(&self, direction: Direction, message: &Message) {
		if self.level == TraceLevel::Off {
			return;
		}
		let Some(sink) = &self.sink else { return };

		let text = match self.format {
			TraceFormat::Text => self.render_text(direction, message),
			TraceFormat::Json => serde_json::to_string(message).unwrap_or_default(),
		};
		sink(TraceEntry { direction, text });
	}

	fn render_text(&self, direction: Direction, message: &Message) -> String {
		let headline = match message {
			Message::Request(r) => format!("{} request {:?} #{}", direction.label(), r.method, r.id),
			Message::Response(r) => match &r.error {
				Some(err) => format!("{} error response #{}: {}", direction.label(), r.id, err.message),
				None => format!("{} response #{}", direction.label(), r.id),
			},
			Message::Notification(n) => format!("{} notification {:?}", direction.label(), n.method),
		};
		if self.level == TraceLevel::Verbose {
			let payload = match message {
				Message::Request(r) => &r.params,
				Message::Notification(n) => &n.params,
				Message::Response(r) => r.result.as_ref().unwrap_or(&serde_json::Value::Null),
			};
			let body = serde_json::to_string_pretty(payload).unwrap_or_default();
			format!("{headline}\n{body}")
		} else {
			headline
		}
	}
}
