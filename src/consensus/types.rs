use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type Hash = [u8; 32];
pub type PublicKey = [u8; 32];

/// Identity chain of a server; derived from its signing key.
pub type IdentityChainId = Hash;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

pub const ZERO_HASH: Hash = [0u8; 32];

pub const ADMIN_CHAIN_ID: Hash = fixed_chain_id(0x0a);
pub const EC_CHAIN_ID: Hash = fixed_chain_id(0x0c);
pub const FACTOID_CHAIN_ID: Hash = fixed_chain_id(0x0f);

/// Minutes per block period.
pub const MINUTES_PER_BLOCK: u8 = 10;

const fn fixed_chain_id(tag: u8) -> Hash {
    let mut id = [0u8; 32];
    id[31] = tag;
    id
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub chain_id: IdentityChainId,
    pub pubkey: PublicKey,
    pub name: String,
}

impl Server {
    pub fn new(pubkey: PublicKey, name: impl Into<String>) -> Self {
        Self {
            chain_id: identity_from_pubkey(&pubkey),
            pubkey,
            name: name.into(),
        }
    }
}

pub fn identity_from_pubkey(pubkey: &PublicKey) -> IdentityChainId {
    sha256(pubkey)
}

pub fn sha256(bytes: &[u8]) -> Hash {
    let mut h = Sha256::new();
    h.update(bytes);
    h.finalize().into()
}

/// sha256(a ‖ b)
pub fn sha256_pair(a: &Hash, b: &Hash) -> Hash {
    let mut h = Sha256::new();
    h.update(a);
    h.update(b);
    h.finalize().into()
}

pub fn merkle_root_hashes(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return ZERO_HASH;
    }
    let mut level: Vec<Hash> = hashes.to_vec();
    while level.len() > 1 {
        let mut next: Vec<Hash> = Vec::with_capacity(level.len().div_ceil(2));
        let mut i = 0;
        while i < level.len() {
            let a = level[i];
            let b = if i + 1 < level.len() { level[i + 1] } else { level[i] };
            next.push(sha256_pair(&a, &b));
            i += 2;
        }
        level = next;
    }
    level[0]
}

/// Short hex prefix for log fields.
pub fn short(hash: &Hash) -> String {
    hex::encode(&hash[..4])
}

pub(crate) fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Length-prefixed byte field.
pub(crate) fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merkle_root_of_single_leaf_is_leaf() {
        let leaf = sha256(b"leaf");
        assert_eq!(merkle_root_hashes(&[leaf]), leaf);
    }

    #[test]
    fn merkle_root_duplicates_odd_tail() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        let c = sha256(b"c");
        let left = sha256_pair(&a, &b);
        let right = sha256_pair(&c, &c);
        assert_eq!(merkle_root_hashes(&[a, b, c]), sha256_pair(&left, &right));
    }

    #[test]
    fn fixed_chain_ids_are_distinct() {
        assert_ne!(ADMIN_CHAIN_ID, EC_CHAIN_ID);
        assert_ne!(EC_CHAIN_ID, FACTOID_CHAIN_ID);
        assert_eq!(FACTOID_CHAIN_ID[31], 0x0f);
    }
}
