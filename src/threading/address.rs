//! Canonical forms for sender addresses and subject lines.

use std::sync::LazyLock;

use regex::Regex;

static ANGLE_ADDR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<([^>]+)>").unwrap());

static SUBJECT_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:re|fwd|fw):\s*").unwrap());

/// Extract a canonical email address from a free-form sender string.
///
/// `"Bob <bob@Example.com>"` becomes `"bob@example.com"`; input without an
/// angle-bracketed address is trimmed and lower-cased as-is. Always returns
/// a string, possibly empty.
pub fn normalize_address(raw: &str) -> String {
    match ANGLE_ADDR.captures(raw).and_then(|c| c.get(1)) {
        Some(addr) => addr.as_str().to_lowercase(),
        None => raw.trim().to_lowercase(),
    }
}

/// Canonicalize a subject line for conversation matching.
///
/// Strips one leading `Re:` / `Fwd:` / `FW:` marker (case-insensitive),
/// then trims and lower-cases. Nested markers (`Re: Re: …`) keep their
/// inner marker — an accepted limitation, kept to match how replies are
/// threaded in the wild where clients stack at most one marker per hop.
pub fn normalize_subject(raw: &str) -> String {
    SUBJECT_MARKER.replace(raw.trim(), "").trim().to_lowercase()
}
