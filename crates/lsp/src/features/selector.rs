//! Document selector matching.
//!
//! A selector is a list of filters `{language?, scheme?, pattern?}`; a
//! document matches the selector when any filter matches, and a filter
//! matches when every present field does. A registration without a
//! selector matches every document.

use globset::{Glob, GlobMatcher};
use lsp_types::{DocumentFilter, DocumentSelector, Uri};

/// Scheme of `uri`, e.g. `file`.
pub fn uri_scheme(uri: &Uri) -> &str {
	let s = uri.as_str();
	s.split_once(':').map(|(scheme, _)| scheme).unwrap_or("")
}

/// Path portion of `uri` (no scheme, authority, query, or fragment).
pub fn uri_path(uri: &Uri) -> &str {
	let s = uri.as_str();
	let after_scheme = s.split_once(':').map(|(_, rest)| rest).unwrap_or(s);
	let path = match after_scheme.strip_prefix("//") {
		// Authority present: path starts at the next slash.
		Some(rest) => rest.find('/').map(|i| &rest[i..]).unwrap_or(""),
		None => after_scheme,
	};
	path.split(['?', '#']).next().unwrap_or(path)
}

fn compile(pattern: &str) -> Option<GlobMatcher> {
	Glob::new(pattern).ok().map(|g| g.compile_matcher())
}

fn filter_matches(filter: &DocumentFilter, uri: &Uri, language_id: &str) -> bool {
	if let Some(language) = &filter.language {
		if language != language_id {
			return false;
		}
	}
	if let Some(scheme) = &filter.scheme {
		if scheme != uri_scheme(uri) {
			return false;
		}
	}
	if let Some(pattern) = &filter.pattern {
		let Some(matcher) = compile(pattern) else {
			return false;
		};
		let path = uri_path(uri);
		// Patterns are usually workspace-relative; try the absolute path
		// and the path without its leading slash.
		if !matcher.is_match(path) && !matcher.is_match(path.trim_start_matches('/')) {
			return false;
		}
	}
	filter.language.is_some() || filter.scheme.is_some() || filter.pattern.is_some()
}

/// True when `selector` covers the document. `None` covers everything.
pub fn matches_document(selector: Option<&DocumentSelector>, uri: &Uri, language_id: &str) -> bool {
	match selector {
		None => true,
		Some(filters) => filters.iter().any(|f| filter_matches(f, uri, language_id)),
	}
}
