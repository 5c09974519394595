//! `workspace/applyEdit` handling.
//!
//! Versioned document edits are gated against the tracker before anything
//! reaches the host: one stale version fails the whole request with no
//! partial application. Only then does the host's apply routine run, and
//! its verdict is what goes back to the server.

use std::sync::Arc;

use lsp_types::{
	ApplyWorkspaceEditParams, ApplyWorkspaceEditResponse, DocumentChangeOperation,
	DocumentChanges, TextDocumentEdit,
};
use tracing::debug;

use crate::host::Host;
use crate::sync::DocumentTracker;

/// A version the server saw that no longer matches the tracked document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stale document version for {uri}: edit against {expected}, tracker has {actual}")]
pub struct VersionMismatch {
	pub uri: String,
	pub expected: i32,
	pub actual: i32,
	/// Index of the offending change in the edit's change list.
	pub index: u32,
}

fn check_edit(edit: &TextDocumentEdit, index: u32, documents: &DocumentTracker) -> Result<(), VersionMismatch> {
	// Only explicit non-negative versions participate in the gate.
	let Some(expected) = edit.text_document.version else {
		return Ok(());
	};
	if expected < 0 {
		return Ok(());
	}
	let Some(actual) = documents.version(&edit.text_document.uri) else {
		// Not tracked: nothing to compare against.
		return Ok(());
	};
	if actual != expected {
		return Err(VersionMismatch {
			uri: edit.text_document.uri.to_string(),
			expected,
			actual,
			index,
		});
	}
	Ok(())
}

/// Validates every versioned change in `params` against the tracker.
pub fn check_versions(params: &ApplyWorkspaceEditParams, documents: &DocumentTracker) -> Result<(), VersionMismatch> {
	let Some(document_changes) = &params.edit.document_changes else {
		return Ok(());
	};
	match document_changes {
		DocumentChanges::Edits(edits) => {
			for (index, edit) in edits.iter().enumerate() {
				check_edit(edit, index as u32, documents)?;
			}
		}
		DocumentChanges::Operations(ops) => {
			for (index, op) in ops.iter().enumerate() {
				if let DocumentChangeOperation::Edit(edit) = op {
					check_edit(edit, index as u32, documents)?;
				}
			}
		}
	}
	Ok(())
}

/// Full `workspace/applyEdit` flow: version gate, then the host.
pub async fn handle_apply_edit(
	params: ApplyWorkspaceEditParams,
	documents: &DocumentTracker,
	host: &Arc<dyn Host>,
) -> ApplyWorkspaceEditResponse {
	if let Err(mismatch) = check_versions(&params, documents) {
		debug!(uri = %mismatch.uri, expected = mismatch.expected, actual = mismatch.actual, "apply_edit.stale_version");
		return ApplyWorkspaceEditResponse {
			applied: false,
			failure_reason: Some(mismatch.to_string()),
			failed_change: Some(mismatch.index),
		};
	}

	let applied = host.apply_edit(params).await;
	ApplyWorkspaceEditResponse {
		applied,
		failure_reason: None,
		failed_change: None,
	}
}
