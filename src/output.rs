//! Output-capping helpers shared by the bash executor and the search
//! primitives.

/// Cap `bytes` at `limit`, retaining the tail and reporting whether anything
/// was dropped. The elision marker itself is not counted against `limit`.
#[must_use]
pub fn cap_tail(bytes: &[u8], limit: usize) -> (Vec<u8>, bool) {
    if bytes.len() <= limit {
        return (bytes.to_vec(), false);
    }
    let dropped = bytes.len() - limit;
    let mut out = format!("... [{dropped} bytes elided] ...\n").into_bytes();
    out.extend_from_slice(&bytes[bytes.len() - limit..]);
    (out, true)
}
