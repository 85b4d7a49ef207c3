use crate::consensus::types::{put_u32, put_u64, sha256, sha256_pair, Hash, IdentityChainId};
use crate::validation::{verify_signature, NodeKey};
use serde::{Deserialize, Serialize};

/// Ordering certificate issued by a lane's leader.
///
/// `serial_hash` chains every ack in a lane: the first ack carries the
/// message hash itself, each later one `sha256(prev_serial ‖ message_hash)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub db_height: u32,
    pub vm_index: usize,
    pub minute: u8,
    pub message_hash: Hash,
    /// Zero-based position in the lane.
    pub height: u32,
    pub serial_hash: Hash,
    pub leader_chain_id: IdentityChainId,
    pub timestamp: u64,
    pub signature: String,
}

impl Ack {
    /// Unsigned ack for the next slot after `prev` in the same lane.
    pub fn next(
        prev: Option<&Ack>,
        db_height: u32,
        vm_index: usize,
        minute: u8,
        message_hash: Hash,
        leader_chain_id: IdentityChainId,
        timestamp: u64,
    ) -> Self {
        let (height, serial_hash) = match prev {
            Some(p) => (
                p.height.saturating_add(1),
                next_serial_hash(Some(&p.serial_hash), &message_hash),
            ),
            None => (0, next_serial_hash(None, &message_hash)),
        };
        Self {
            db_height,
            vm_index,
            minute,
            message_hash,
            height,
            serial_hash,
            leader_chain_id,
            timestamp,
            signature: String::new(),
        }
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 4 + 1 + 32 + 4 + 32 + 32 + 8);
        put_u32(&mut out, self.db_height);
        put_u32(&mut out, self.vm_index as u32);
        out.push(self.minute);
        out.extend_from_slice(&self.message_hash);
        put_u32(&mut out, self.height);
        out.extend_from_slice(&self.serial_hash);
        out.extend_from_slice(&self.leader_chain_id);
        put_u64(&mut out, self.timestamp);
        out
    }

    pub fn hash(&self) -> Hash {
        sha256(&self.signing_bytes())
    }

    pub fn sign(&mut self, key: &NodeKey) {
        self.signature = key.sign(&self.signing_bytes());
    }

    pub fn verify(&self, pubkey: &[u8; 32]) -> bool {
        verify_signature(pubkey, &self.signing_bytes(), &self.signature)
    }

    /// True if this ack is the direct successor of `prev` in its lane.
    pub fn follows(&self, prev: Option<&Ack>) -> bool {
        match prev {
            None => self.height == 0 && self.serial_hash == self.message_hash,
            Some(p) => {
                self.height == p.height.saturating_add(1)
                    && self.serial_hash == sha256_pair(&p.serial_hash, &self.message_hash)
            }
        }
    }
}

pub fn next_serial_hash(prev: Option<&Hash>, message_hash: &Hash) -> Hash {
    match prev {
        Some(p) => sha256_pair(p, message_hash),
        None => *message_hash,
    }
}

/// Index of the first ack whose serial hash does not follow from the chain
/// before it, or `None` if the whole chain checks out.
pub fn first_broken_link(acks: &[Ack]) -> Option<usize> {
    let mut prev: Option<&Hash> = None;
    for (i, ack) in acks.iter().enumerate() {
        if ack.height as usize != i || ack.serial_hash != next_serial_hash(prev, &ack.message_hash) {
            return Some(i);
        }
        prev = Some(&ack.serial_hash);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: u8) -> Vec<Ack> {
        let mut out: Vec<Ack> = Vec::new();
        for i in 0..n {
            let ack = Ack::next(out.last(), 5, 0, 0, sha256(&[i]), [9u8; 32], 1000 + i as u64);
            out.push(ack);
        }
        out
    }

    #[test]
    fn serial_chain_recomputes() {
        let acks = chain(6);
        assert_eq!(acks[0].serial_hash, acks[0].message_hash);
        assert_eq!(first_broken_link(&acks), None);
        for w in acks.windows(2) {
            assert!(w[1].follows(Some(&w[0])));
        }
    }

    #[test]
    fn tampering_breaks_every_later_serial() {
        let acks = chain(6);
        let mut tampered = acks.clone();
        tampered[2].message_hash = sha256(b"forged");
        assert_eq!(first_broken_link(&tampered), Some(2));

        // Recomputing forward from the forged hash yields a different serial
        // for every later position.
        let mut prev = tampered[1].serial_hash;
        for i in 2..tampered.len() {
            let recomputed = next_serial_hash(Some(&prev), &tampered[i].message_hash);
            assert_ne!(recomputed, acks[i].serial_hash);
            prev = recomputed;
        }
    }

    #[test]
    fn signed_ack_verifies() {
        let key = NodeKey::from_secret(&[4u8; 32]).expect("key");
        let mut ack = Ack::next(None, 1, 0, 3, sha256(b"m"), key.identity(), 77);
        ack.sign(&key);
        assert!(ack.verify(&key.public()));
        ack.minute = 4;
        assert!(!ack.verify(&key.public()));
    }
}
