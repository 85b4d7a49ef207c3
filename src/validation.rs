// Validation primitives: ed25519 identity keys, signature checks, and the
// three-way verdict every inbound message receives.
// Crypto here is reference-grade only (not hardened).

use crate::consensus::error::ConfigError;
use crate::consensus::types::{identity_from_pubkey, IdentityChainId, PublicKey};
use ed25519_dalek::{Keypair, PublicKey as DalekPublicKey, SecretKey, Signature, Signer, Verifier};
use hex::{decode as hex_decode, encode as hex_encode};

/// Outcome of validating a message against current node state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validity {
    /// Valid now; may be executed.
    Valid,
    /// Valid but a dependency is missing (commit, ack, earlier height); retry later.
    Hold,
    /// Permanently invalid.
    Invalid,
}

impl Validity {
    /// Wire-compatible code: 1, 0, -1.
    pub fn code(self) -> i8 {
        match self {
            Validity::Valid => 1,
            Validity::Hold => 0,
            Validity::Invalid => -1,
        }
    }
}

/// Signing key bound to an identity chain.
pub struct NodeKey {
    keypair: Keypair,
    identity: IdentityChainId,
}

impl NodeKey {
    pub fn from_secret(secret: &[u8; 32]) -> Result<Self, ConfigError> {
        let secret = SecretKey::from_bytes(secret).map_err(|_| ConfigError::BadSecret)?;
        let public: DalekPublicKey = (&secret).into();
        let identity = identity_from_pubkey(&public.to_bytes());
        Ok(Self {
            keypair: Keypair { secret, public },
            identity,
        })
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, ConfigError> {
        let bytes = hex_decode(secret_hex.trim()).map_err(|_| ConfigError::BadSecret)?;
        let secret: [u8; 32] = bytes.try_into().map_err(|_| ConfigError::BadSecret)?;
        Self::from_secret(&secret)
    }

    pub fn identity(&self) -> IdentityChainId {
        self.identity
    }

    pub fn public(&self) -> PublicKey {
        self.keypair.public.to_bytes()
    }

    /// Hex-encoded ed25519 signature over `bytes`.
    pub fn sign(&self, bytes: &[u8]) -> String {
        sig_to_hex(&self.keypair.sign(bytes))
    }
}

pub fn verify_signature(pubkey: &PublicKey, bytes: &[u8], sig_hex: &str) -> bool {
    let pk = match DalekPublicKey::from_bytes(pubkey) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let Some(sig) = sig_from_hex(sig_hex) else {
        return false;
    };
    pk.verify(bytes, &sig).is_ok()
}

fn sig_to_hex(sig: &Signature) -> String {
    hex_encode(sig.to_bytes())
}

fn sig_from_hex(sig_hex: &str) -> Option<Signature> {
    let bytes = hex_decode(sig_hex).ok()?;
    if bytes.len() != 64 {
        return None;
    }
    let mut arr = [0u8; 64];
    arr.copy_from_slice(&bytes);
    Signature::from_bytes(&arr).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip_and_tamper() {
        let key = NodeKey::from_secret(&[7u8; 32]).expect("key");
        let sig = key.sign(b"directory block 12");
        assert!(verify_signature(&key.public(), b"directory block 12", &sig));
        assert!(!verify_signature(&key.public(), b"directory block 13", &sig));
    }

    #[test]
    fn identity_is_derived_from_public_key() {
        let key = NodeKey::from_secret(&[3u8; 32]).expect("key");
        assert_eq!(key.identity(), identity_from_pubkey(&key.public()));
    }

    #[test]
    fn garbage_signature_is_rejected() {
        let key = NodeKey::from_secret(&[9u8; 32]).expect("key");
        assert!(!verify_signature(&key.public(), b"x", "zz"));
        assert!(!verify_signature(&key.public(), b"x", &"00".repeat(10)));
    }

    #[test]
    fn secret_hex_must_be_32_bytes() {
        assert!(NodeKey::from_secret_hex("abcd").is_err());
        assert!(NodeKey::from_secret_hex(&"11".repeat(32)).is_ok());
    }
}
