//! Small helpers shared across the engine.

/// Truncate a string to at most `max_bytes` bytes without splitting a
/// multi-byte UTF-8 codepoint.
///
/// Outgoing lines are capped at the wire limit; naive byte truncation
/// could cut an emoji in half and produce invalid UTF-8.
#[inline]
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
