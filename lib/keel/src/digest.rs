//! Session-password digest used during the connection handshake.

use md5::{Digest, Md5};

/// Length of the handshake hash in bytes.
pub const HASH_LEN: usize = 16;

/// Computes the authentication hash for a handshake: the MD5 digest of
/// the server-issued nonce followed by the session password. An empty
/// password hashes the bare nonce.
pub fn session_hash(nonce: &[u8], password: &str) -> [u8; HASH_LEN] {
    let mut md5 = Md5::new();
    md5.update(nonce);
    md5.update(password.as_bytes());
    let digest = md5.finalize();

    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&digest);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_password_hashes_nonce_only() {
        let nonce = [7u8; 16];

        let mut md5 = Md5::new();
        md5.update(&nonce);
        let expected = md5.finalize();

        assert_eq!(session_hash(&nonce, ""), expected[..]);
    }

    #[test]
    fn test_password_changes_hash() {
        let nonce = [7u8; 16];

        assert_ne!(session_hash(&nonce, "swordfish"), session_hash(&nonce, "tuna"));
        assert_eq!(
            session_hash(&nonce, "swordfish"),
            session_hash(&nonce, "swordfish")
        );
    }

    #[test]
    fn test_nonce_changes_hash() {
        assert_ne!(
            session_hash(&[1u8; 16], "swordfish"),
            session_hash(&[2u8; 16], "swordfish")
        );
    }
}
