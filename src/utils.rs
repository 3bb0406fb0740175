use rand::RngCore;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

/// Returns `n` bytes from the thread-local CSPRNG, hex encoded.
pub fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Absolute distance between two millisecond timestamps.
pub fn millis_apart(a: u64, b: u64) -> Duration {
    Duration::from_millis(a.abs_diff(b))
}

/// Maps an arbitrary identifier onto a safe single path component.
///
/// Anything outside `[A-Za-z0-9._-]` becomes `_`, and leading dots are
/// replaced so the result can never be `.`/`..` or a hidden file.
pub fn sanitize_file_component(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    while out.starts_with('.') {
        out.replace_range(0..1, "_");
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}
