//! Capability negotiation helpers.
//!
//! Servers may advertise `textDocumentSync` as a bare kind number (the
//! legacy shorthand) or as a full options struct; everything downstream
//! works with the canonical [`TextDocumentSyncOptions`] form.

use lsp_types::{
	SaveOptions, TextDocumentSyncCapability, TextDocumentSyncKind, TextDocumentSyncOptions,
	TextDocumentSyncSaveOptions,
};

/// Normalizes the server's sync capability into canonical options.
///
/// The number shorthand historically implies open/close notifications and
/// saves without text; kind `None` (0) means no sync at all.
pub fn normalize_text_document_sync(cap: Option<&TextDocumentSyncCapability>) -> TextDocumentSyncOptions {
	match cap {
		None => TextDocumentSyncOptions::default(),
		Some(TextDocumentSyncCapability::Kind(kind)) => {
			if *kind == TextDocumentSyncKind::NONE {
				return TextDocumentSyncOptions::default();
			}
			TextDocumentSyncOptions {
				open_close: Some(true),
				change: Some(*kind),
				will_save: None,
				will_save_wait_until: None,
				save: Some(TextDocumentSyncSaveOptions::SaveOptions(SaveOptions {
					include_text: Some(false),
				})),
			}
		}
		Some(TextDocumentSyncCapability::Options(options)) => options.clone(),
	}
}

/// Whether saves are advertised, and with text or not. `None` means no
/// save notifications at all.
pub fn save_options_include_text(options: &TextDocumentSyncOptions) -> Option<bool> {
	match &options.save {
		None | Some(TextDocumentSyncSaveOptions::Supported(false)) => None,
		Some(TextDocumentSyncSaveOptions::Supported(true)) => Some(false),
		Some(TextDocumentSyncSaveOptions::SaveOptions(save)) => {
			Some(save.include_text.unwrap_or(false))
		}
	}
}
