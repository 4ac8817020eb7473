//! PKCE (RFC 7636), S256 only.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// A generated verifier/challenge pair; the method is always S256.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// The secret verifier, sent with the token exchange
    pub verifier: String,
    /// The derived challenge, sent with the authorization request
    pub challenge: String,
}

/// Generate a fresh PKCE pair with a 64-character verifier
pub fn generate() -> PkceChallenge {
    let verifier: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect();
    let challenge = challenge_for(&verifier);
    PkceChallenge {
        verifier,
        challenge,
    }
}

/// Derive the S256 challenge for a verifier
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Verify a presented verifier against the stored challenge, in constant
/// time.
pub fn verify(verifier: &str, challenge: &str) -> bool {
    let derived = challenge_for(verifier);
    derived.as_bytes().ct_eq(challenge.as_bytes()).into()
}
