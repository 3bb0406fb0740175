//! Security utilities for protecting sensitive key material
//!
//! This module provides:
//! - A zeroizing wrapper for fixed-size secrets (session keys, shared secrets)
//! - Constant-time comparison for secret-dependent equality checks

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Fixed-size secret bytes that are wiped when dropped.
///
/// # Security
/// - Automatically zeroizes memory when dropped
/// - Equality is constant-time
/// - Debug output never shows the contents
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> SecretBytes<N> {
    /// Wrap raw bytes. The caller should wipe its own copy.
    pub fn new(bytes: [u8; N]) -> Self {
        Self { bytes }
    }

    /// Copy from a slice, failing on a length mismatch.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != N {
            return None;
        }
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(slice);
        Some(Self { bytes })
    }

    /// Get a reference to the inner bytes
    ///
    /// # Security Warning
    /// The caller must ensure this reference is not used to leak the value
    pub fn expose_secret(&self) -> &[u8; N] {
        &self.bytes
    }
}

impl<const N: usize> PartialEq for SecretBytes<N> {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.bytes, &other.bytes)
    }
}

impl<const N: usize> Eq for SecretBytes<N> {}

// Prevent debug output from leaking sensitive data
impl<const N: usize> std::fmt::Debug for SecretBytes<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes<{}>([REDACTED])", N)
    }
}

/// Constant-time byte slice comparison
///
/// Returns true if slices are equal, false otherwise. Slices of different
/// lengths compare unequal immediately; the length is not secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }

    result == 0
}

/// Constant-time comparison of two strings' bytes.
pub fn constant_time_eq_str(a: &str, b: &str) -> bool {
    constant_time_eq(a.as_bytes(), b.as_bytes())
}
