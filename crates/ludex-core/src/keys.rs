//! Ed25519 extension identity keys, signing, and verification.
//!
//! Every extension instance holds a keypair. The private half never leaves
//! the extension; the server only ever stores the hex-encoded public key it
//! received at registration time and verifies request signatures against it.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// An extension identity keypair (Ed25519).
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self { signing }
    }

    /// Rebuild a keypair from existing secret key bytes (32 bytes).
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(bytes);
        Self { signing }
    }

    /// The signing key (private). Handle with care.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    /// The verifying key (public). Safe to share.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// The public key as raw bytes (32 bytes).
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key().to_bytes()
    }

    /// The public key as lowercase hex, the form submitted at registration.
    pub fn public_key_hex(&self) -> String {
        self.public_key_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Sign a message with an Ed25519 signing key. Returns the 64-byte signature.
pub fn sign(signing_key: &SigningKey, message: &[u8]) -> [u8; 64] {
    let sig = signing_key.sign(message);
    sig.to_bytes()
}

/// Verify an Ed25519 signature.
///
/// Accepts untrusted slices for both key and signature: any malformed input
/// (wrong length, non-canonical key point) yields `false` rather than an
/// error, so callers can treat the result as a single authorization bit.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let sig = Signature::from_bytes(&sig_bytes);
    verifying_key.verify(message, &sig).is_ok()
}
