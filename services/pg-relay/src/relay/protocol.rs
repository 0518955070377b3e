//! Minimal PostgreSQL frontend message inspection.
//!
//! Only the start of a Simple Query message is recognised:
//!
//! ```text
//! 'Q' | int32 length | query text | '\0'
//! ```
//!
//! Messages are inspected one receive chunk at a time. A message that spans
//! several chunks is only seen through its first chunk.

/// Simple Query message tag.
pub const MSG_QUERY: u8 = b'Q';

/// Tag byte plus the 4-byte length field.
pub const QUERY_HEADER_LEN: usize = 5;

/// Result of inspecting one client chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkInspection<'a> {
    /// Simple Query; the text up to its terminator.
    Query(&'a [u8]),
    /// Starts with the query tag but is shorter than the header.
    Truncated,
    /// Any other message.
    Other,
}

/// Inspect a post-handshake client chunk for a Simple Query.
pub fn inspect_client_chunk(chunk: &[u8]) -> ChunkInspection<'_> {
    match chunk.first() {
        Some(&MSG_QUERY) if chunk.len() < QUERY_HEADER_LEN => ChunkInspection::Truncated,
        Some(&MSG_QUERY) => ChunkInspection::Query(terminated(&chunk[QUERY_HEADER_LEN..])),
        _ => ChunkInspection::Other,
    }
}

/// Text up to the first NUL, or all of it when no NUL is present.
fn terminated(text: &[u8]) -> &[u8] {
    match text.iter().position(|&b| b == 0) {
        Some(end) => &text[..end],
        None => text,
    }
}
