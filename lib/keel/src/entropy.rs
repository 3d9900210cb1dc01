//! OS entropy access for authentication nonces and connection tickets.
//!
//! Everything here goes through the operating system CSPRNG. There is no
//! fallback; if the OS random source fails, the caller's operation fails.

use rand::rngs::OsRng;
use rand::RngCore;

/// Fills the provided buffer with cryptographically secure random bytes.
pub fn random_bytes(out: &mut [u8]) {
    OsRng.fill_bytes(out);
}

/// Returns a random 32-bit value from the OS CSPRNG.
pub fn random_u32() -> u32 {
    OsRng.next_u32()
}

/// Fills the buffer from the OS CSPRNG, reporting failure instead of
/// panicking. Callers refuse the operation when this returns false.
pub fn try_random_bytes(out: &mut [u8]) -> bool {
    OsRng.try_fill_bytes(out).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes_fills_buffer() {
        // 32 zero bytes surviving two independent draws would mean the
        // RNG is not actually producing output.
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        random_bytes(&mut a);
        random_bytes(&mut b);

        assert_ne!(a, [0u8; 32]);
        assert_ne!(a, b);
    }
}
