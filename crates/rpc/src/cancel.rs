//! Request cancellation plumbing.
//!
//! Cancellation is a first-class protocol facility: cancelling the token
//! attached to an outgoing request publishes a `$/cancelRequest`
//! notification, and an inbound `$/cancelRequest` trips the cancellation
//! token handed to the matching request handler. It is advisory on both
//! sides; a peer that cancels must still accept either a normal result or a
//! `RequestCancelled` error.

use serde::{Deserialize, Serialize};

use crate::message::{AnyNotification, RequestId};

/// Method name of the cancellation notification.
pub const CANCEL_METHOD: &str = "$/cancelRequest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelParams {
	pub id: RequestId,
}

/// Builds the `$/cancelRequest` notification for `id`.
pub fn cancel_notification(id: RequestId) -> AnyNotification {
	AnyNotification::new(
		CANCEL_METHOD,
		serde_json::to_value(CancelParams { id }).unwrap_or_default(),
	)
}

/// Parses a `$/cancelRequest` notification, if that is what `notif` is.
pub fn parse_cancel(notif: &AnyNotification) -> Option<RequestId> {
	if notif.method != CANCEL_METHOD {
		return None;
	}
	serde_json::from_value::<CancelParams>(notif.params.clone())
		.ok()
		.map(|p| p.id)
}
