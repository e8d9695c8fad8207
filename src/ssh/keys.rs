//! Public key acceptance policy, fingerprinting, and key registration.
//!
//! DSS keys, SHA-1 `ssh-rsa` signatures, and certificate/security-key types
//! are rejected; everything else a modern OpenSSH client offers is accepted.

use chrono::Utc;
use russh::keys::ssh_key::{Algorithm, HashAlg, PublicKey};

use crate::errors::{ForgeError, Result};
use crate::store::records::{SshKeyRecord, UserId};

/// Public key algorithms advertised to clients.
pub const ACCEPTED_KEY_ALGORITHMS: &[&str] = &[
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "rsa-sha2-256",
    "rsa-sha2-512",
];

/// Whether the key's algorithm is acceptable for authentication.
///
/// RSA keys are accepted at the key level; the SHA-2 signature requirement is
/// enforced during the transport's signature negotiation, which never offers
/// SHA-1. DSS and the certificate/security-key algorithms fail here.
pub fn is_accepted_algorithm(algorithm: &Algorithm) -> bool {
    matches!(
        algorithm,
        Algorithm::Ed25519 | Algorithm::Ecdsa { .. } | Algorithm::Rsa { .. }
    )
}

/// SHA-256 fingerprint in the OpenSSH presentation (`SHA256:` + base64).
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Strip control characters from a key comment before storage.
pub fn sanitize_comment(comment: &str) -> String {
    comment.chars().filter(|c| !c.is_control()).collect()
}

/// Parse an OpenSSH `authorized_keys`-style line into a storable record for
/// `user_id`. The id is assigned by the store on insert.
pub fn parse_openssh_key(user_id: UserId, line: &str) -> Result<SshKeyRecord> {
    let key = PublicKey::from_openssh(line.trim())
        .map_err(|e| ForgeError::InvalidInput(format!("unparseable public key: {e}")))?;
    let algorithm = key.algorithm();
    if !is_accepted_algorithm(&algorithm) {
        return Err(ForgeError::InvalidInput(format!(
            "key algorithm not accepted: {}",
            algorithm.as_str()
        )));
    }
    let blob = key
        .to_bytes()
        .map_err(|e| ForgeError::InvalidInput(format!("unencodable public key: {e}")))?;
    Ok(SshKeyRecord {
        id: 0,
        user_id,
        fingerprint: fingerprint(&key),
        algorithm: algorithm.as_str().to_string(),
        blob,
        comment: sanitize_comment(key.comment()),
        created_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Throwaway test key, generated for these tests only.
    const ED25519_LINE: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAzv2vNKpnjtQe+5vHpj5F3uPTxwmULePBT620chPGyF demo@example";

    /// Ed25519, ECDSA, and RSA are accepted; DSA is not.
    #[test]
    fn algorithm_gate() {
        assert!(is_accepted_algorithm(&Algorithm::Ed25519));
        assert!(is_accepted_algorithm(&Algorithm::Rsa { hash: None }));
        assert!(!is_accepted_algorithm(&Algorithm::Dsa));
    }

    /// A valid OpenSSH line parses into a record with an SHA256 fingerprint.
    #[test]
    fn parses_openssh_line() {
        let record = parse_openssh_key(7, ED25519_LINE).unwrap();
        assert_eq!(record.user_id, 7);
        assert_eq!(record.algorithm, "ssh-ed25519");
        assert!(record.fingerprint.starts_with("SHA256:"));
        assert_eq!(record.comment, "demo@example");
        assert!(!record.blob.is_empty());
    }

    /// Garbage input is InvalidInput, not a panic.
    #[test]
    fn rejects_garbage() {
        assert!(parse_openssh_key(1, "not a key").is_err());
        assert!(parse_openssh_key(1, "").is_err());
    }

    /// Control characters are stripped from comments before storage.
    #[test]
    fn comment_sanitization() {
        assert_eq!(sanitize_comment("lap\ttop\n"), "laptop");
        assert_eq!(sanitize_comment("work\u{7f}station"), "workstation");
        assert_eq!(sanitize_comment("plain"), "plain");
    }
}
