use crate::consensus::ack::Ack;
use crate::consensus::blocks::{
    AdminBlock, CommitChain, CommitEntry, DirectoryBlock, Entry, EntryBlock, EntryCreditBlock,
    FactoidBlock, FactoidTransaction,
};
use crate::consensus::types::{
    put_bytes, put_u32, put_u64, sha256, Hash, IdentityChainId, PublicKey, ADMIN_CHAIN_ID,
    FACTOID_CHAIN_ID, ZERO_HASH,
};
use crate::validation::{verify_signature, NodeKey};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eom {
    pub db_height: u32,
    pub minute: u8,
    pub vm_index: usize,
    pub chain_id: IdentityChainId,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryBlockSignature {
    /// Height of the process list carrying the signature; it signs the
    /// directory block one below.
    pub db_height: u32,
    pub directory_block_key_mr: Hash,
    pub vm_index: usize,
    pub server_identity: IdentityChainId,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealEntry {
    pub entry: Entry,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerKind {
    Federated,
    Audit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddServer {
    pub kind: ServerKind,
    pub pubkey: PublicKey,
    pub signer: IdentityChainId,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyChange {
    SigningKey(PublicKey),
    BitcoinAnchorKey { priority: u8, key_type: u8, key: [u8; 20] },
    MatryoshkaHash(Hash),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeServerKey {
    pub identity: IdentityChainId,
    pub change: KeyChange,
    pub signer: IdentityChainId,
    pub signature: String,
}

/// A complete height shipped between nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbStateMsg {
    pub directory_block: DirectoryBlock,
    pub admin_block: AdminBlock,
    pub factoid_block: FactoidBlock,
    pub entry_credit_block: EntryCreditBlock,
    pub entry_blocks: Vec<EntryBlock>,
    pub entries: Vec<Entry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbStateMissing {
    pub from_height: u32,
    pub to_height: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingMsgResponse {
    pub ack: Ack,
    pub message: Box<Message>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFault {
    pub db_height: u32,
    pub vm_index: usize,
    pub accused: IdentityChainId,
    pub signer: IdentityChainId,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Eom(Eom),
    DirectoryBlockSignature(DirectoryBlockSignature),
    Ack(Ack),
    CommitChain(CommitChain),
    CommitEntry(CommitEntry),
    RevealEntry(RevealEntry),
    FactoidTransaction(FactoidTransaction),
    AddServer(AddServer),
    ChangeServerKey(ChangeServerKey),
    DbState(Box<DbStateMsg>),
    DbStateMissing(DbStateMissing),
    MissingMsgResponse(MissingMsgResponse),
    ServerFault(ServerFault),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub timestamp: u64,
    pub vm_index: usize,
    /// Originated on this node (never crossed the network).
    #[serde(skip)]
    pub local: bool,
    pub leader_chain_id: IdentityChainId,
    pub minute: u8,
    pub payload: Payload,
}

/// Lane for a routing hash: byte sum modulo lane count.
pub fn vm_index_for(hash: &Hash, lanes: usize) -> usize {
    if lanes == 0 {
        return 0;
    }
    hash.iter().map(|b| *b as usize).sum::<usize>() % lanes
}

impl Message {
    pub fn new(payload: Payload, timestamp: u64) -> Self {
        Self {
            timestamp,
            vm_index: 0,
            local: false,
            leader_chain_id: ZERO_HASH,
            minute: 0,
            payload,
        }
    }

    pub fn local(payload: Payload, timestamp: u64) -> Self {
        let mut msg = Self::new(payload, timestamp);
        msg.local = true;
        msg
    }

    /// Minute tick from the local timer; height, minute and lane are filled in
    /// by the consensus core before signing.
    pub fn local_eom(timestamp: u64) -> Self {
        Self::local(
            Payload::Eom(Eom {
                db_height: 0,
                minute: 0,
                vm_index: 0,
                chain_id: ZERO_HASH,
                signature: String::new(),
            }),
            timestamp,
        )
    }

    pub fn signed_eom(key: &NodeKey, db_height: u32, minute: u8, vm_index: usize, timestamp: u64) -> Self {
        let mut msg = Self::new(
            Payload::Eom(Eom {
                db_height,
                minute,
                vm_index,
                chain_id: key.identity(),
                signature: String::new(),
            }),
            timestamp,
        );
        msg.vm_index = vm_index;
        msg.minute = minute;
        msg.sign(key);
        msg
    }

    pub fn signed_dbsig(
        key: &NodeKey,
        db_height: u32,
        directory_block_key_mr: Hash,
        vm_index: usize,
        timestamp: u64,
    ) -> Self {
        let mut msg = Self::new(
            Payload::DirectoryBlockSignature(DirectoryBlockSignature {
                db_height,
                directory_block_key_mr,
                vm_index,
                server_identity: key.identity(),
                signature: String::new(),
            }),
            timestamp,
        );
        msg.vm_index = vm_index;
        msg.sign(key);
        msg
    }

    pub fn kind(&self) -> &'static str {
        match &self.payload {
            Payload::Eom(_) => "eom",
            Payload::DirectoryBlockSignature(_) => "dbsig",
            Payload::Ack(_) => "ack",
            Payload::CommitChain(_) => "commit-chain",
            Payload::CommitEntry(_) => "commit-entry",
            Payload::RevealEntry(_) => "reveal-entry",
            Payload::FactoidTransaction(_) => "factoid-tx",
            Payload::AddServer(_) => "add-server",
            Payload::ChangeServerKey(_) => "change-server-key",
            Payload::DbState(_) => "dbstate",
            Payload::DbStateMissing(_) => "dbstate-missing",
            Payload::MissingMsgResponse(_) => "missing-msg-response",
            Payload::ServerFault(_) => "server-fault",
        }
    }

    fn tag(&self) -> u8 {
        match &self.payload {
            Payload::Eom(_) => 0,
            Payload::Ack(_) => 1,
            Payload::FactoidTransaction(_) => 2,
            Payload::CommitChain(_) => 3,
            Payload::CommitEntry(_) => 4,
            Payload::DirectoryBlockSignature(_) => 5,
            Payload::RevealEntry(_) => 6,
            Payload::AddServer(_) => 7,
            Payload::ChangeServerKey(_) => 8,
            Payload::DbState(_) => 9,
            Payload::DbStateMissing(_) => 10,
            Payload::MissingMsgResponse(_) => 11,
            Payload::ServerFault(_) => 12,
        }
    }

    /// Messages that are ordered through a process list lane.
    pub fn is_process_list_message(&self) -> bool {
        matches!(
            self.payload,
            Payload::Eom(_)
                | Payload::DirectoryBlockSignature(_)
                | Payload::CommitChain(_)
                | Payload::CommitEntry(_)
                | Payload::RevealEntry(_)
                | Payload::FactoidTransaction(_)
                | Payload::AddServer(_)
                | Payload::ChangeServerKey(_)
        )
    }

    /// Bytes covered by both the message hash and any signature; signature
    /// fields are left out.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.tag()];
        put_u64(&mut out, self.timestamp);
        match &self.payload {
            Payload::Eom(e) => {
                put_u32(&mut out, e.db_height);
                out.push(e.minute);
                put_u32(&mut out, e.vm_index as u32);
                out.extend_from_slice(&e.chain_id);
            }
            Payload::DirectoryBlockSignature(d) => {
                put_u32(&mut out, d.db_height);
                out.extend_from_slice(&d.directory_block_key_mr);
                put_u32(&mut out, d.vm_index as u32);
                out.extend_from_slice(&d.server_identity);
            }
            Payload::Ack(a) => out.extend_from_slice(&a.signing_bytes()),
            Payload::CommitChain(c) => {
                out.extend_from_slice(&c.signing_bytes());
                out.extend_from_slice(&c.ec_pubkey);
            }
            Payload::CommitEntry(c) => {
                out.extend_from_slice(&c.signing_bytes());
                out.extend_from_slice(&c.ec_pubkey);
            }
            Payload::RevealEntry(r) => out.extend_from_slice(&r.entry.marshal()),
            Payload::FactoidTransaction(tx) => tx.marshal_into(&mut out),
            Payload::AddServer(a) => {
                out.push(match a.kind {
                    ServerKind::Federated => 0,
                    ServerKind::Audit => 1,
                });
                out.extend_from_slice(&a.pubkey);
                out.extend_from_slice(&a.signer);
            }
            Payload::ChangeServerKey(c) => {
                out.extend_from_slice(&c.identity);
                match &c.change {
                    KeyChange::SigningKey(k) => {
                        out.push(0);
                        out.extend_from_slice(k);
                    }
                    KeyChange::BitcoinAnchorKey {
                        priority,
                        key_type,
                        key,
                    } => {
                        out.push(1);
                        out.push(*priority);
                        out.push(*key_type);
                        out.extend_from_slice(key);
                    }
                    KeyChange::MatryoshkaHash(h) => {
                        out.push(2);
                        out.extend_from_slice(h);
                    }
                }
                out.extend_from_slice(&c.signer);
            }
            Payload::DbState(d) => {
                out.extend_from_slice(&d.directory_block.key_mr());
                put_bytes(&mut out, &d.directory_block.marshal());
            }
            Payload::DbStateMissing(m) => {
                put_u32(&mut out, m.from_height);
                put_u32(&mut out, m.to_height);
            }
            Payload::MissingMsgResponse(r) => {
                out.extend_from_slice(&r.ack.signing_bytes());
                out.extend_from_slice(&r.message.hash());
            }
            Payload::ServerFault(f) => {
                put_u32(&mut out, f.db_height);
                put_u32(&mut out, f.vm_index as u32);
                out.extend_from_slice(&f.accused);
                out.extend_from_slice(&f.signer);
            }
        }
        out
    }

    pub fn hash(&self) -> Hash {
        sha256(&self.signing_bytes())
    }

    /// Height the message claims to belong to, if it names one.
    pub fn db_height(&self) -> Option<u32> {
        match &self.payload {
            Payload::Eom(e) => Some(e.db_height),
            Payload::DirectoryBlockSignature(d) => Some(d.db_height),
            Payload::Ack(a) => Some(a.db_height),
            Payload::DbState(d) => Some(d.directory_block.db_height()),
            Payload::MissingMsgResponse(r) => Some(r.ack.db_height),
            Payload::ServerFault(f) => Some(f.db_height),
            _ => None,
        }
    }

    /// Lane this message is ordered in for a process list with `lanes` lanes.
    pub fn compute_vm_index(&self, lanes: usize) -> usize {
        match &self.payload {
            Payload::Eom(e) => e.vm_index,
            Payload::DirectoryBlockSignature(d) => d.vm_index,
            Payload::Ack(a) => a.vm_index,
            Payload::CommitChain(c) => vm_index_for(&c.entry_hash, lanes),
            Payload::CommitEntry(c) => vm_index_for(&c.entry_hash, lanes),
            Payload::RevealEntry(r) => vm_index_for(&r.entry.hash(), lanes),
            Payload::FactoidTransaction(_) => vm_index_for(&FACTOID_CHAIN_ID, lanes),
            Payload::AddServer(_) | Payload::ChangeServerKey(_) => vm_index_for(&ADMIN_CHAIN_ID, lanes),
            _ => self.vm_index,
        }
    }

    /// Identity that signed the message, for kinds carrying a server signature.
    pub fn signer(&self) -> Option<IdentityChainId> {
        match &self.payload {
            Payload::Eom(e) => Some(e.chain_id),
            Payload::DirectoryBlockSignature(d) => Some(d.server_identity),
            Payload::Ack(a) => Some(a.leader_chain_id),
            Payload::AddServer(a) => Some(a.signer),
            Payload::ChangeServerKey(c) => Some(c.signer),
            Payload::ServerFault(f) => Some(f.signer),
            _ => None,
        }
    }

    fn signature(&self) -> Option<&str> {
        match &self.payload {
            Payload::Eom(e) => Some(&e.signature),
            Payload::DirectoryBlockSignature(d) => Some(&d.signature),
            Payload::Ack(a) => Some(&a.signature),
            Payload::AddServer(a) => Some(&a.signature),
            Payload::ChangeServerKey(c) => Some(&c.signature),
            Payload::ServerFault(f) => Some(&f.signature),
            _ => None,
        }
    }

    /// Signs server-signed kinds in place; other kinds are left untouched.
    pub fn sign(&mut self, key: &NodeKey) {
        if let Payload::Ack(a) = &mut self.payload {
            a.sign(key);
            return;
        }
        let sig = key.sign(&self.signing_bytes());
        match &mut self.payload {
            Payload::Eom(e) => e.signature = sig,
            Payload::DirectoryBlockSignature(d) => d.signature = sig,
            Payload::AddServer(a) => a.signature = sig,
            Payload::ChangeServerKey(c) => c.signature = sig,
            Payload::ServerFault(f) => f.signature = sig,
            _ => {}
        }
    }

    pub fn verify_server_signature(&self, pubkey: &PublicKey) -> bool {
        if let Payload::Ack(a) = &self.payload {
            return a.verify(pubkey);
        }
        match self.signature() {
            Some(sig) => verify_signature(pubkey, &self.signing_bytes(), sig),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_signature_and_envelope_routing() {
        let key = NodeKey::from_secret(&[1u8; 32]).expect("key");
        let mut a = Message::signed_eom(&key, 3, 4, 0, 1_000);
        let b = a.clone();
        a.vm_index = 7;
        a.local = true;
        if let Payload::Eom(e) = &mut a.payload {
            e.signature = "00".into();
        }
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn local_flag_does_not_cross_the_wire() {
        let tick = Message::local_eom(42);
        let json = serde_json::to_string(&tick).expect("encode");
        let received: Message = serde_json::from_str(&json).expect("decode");
        assert!(!received.local);
        assert_eq!(received.hash(), tick.hash());
    }

    #[test]
    fn hash_covers_timestamp() {
        let entry = Entry::new_chain(vec![b"x".to_vec()], b"y".to_vec());
        let a = Message::new(Payload::RevealEntry(RevealEntry { entry: entry.clone() }), 1);
        let b = Message::new(Payload::RevealEntry(RevealEntry { entry }), 2);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn eom_signature_verifies_against_signer() {
        let key = NodeKey::from_secret(&[2u8; 32]).expect("key");
        let other = NodeKey::from_secret(&[3u8; 32]).expect("key");
        let msg = Message::signed_eom(&key, 1, 0, 0, 5);
        assert_eq!(msg.signer(), Some(key.identity()));
        assert!(msg.verify_server_signature(&key.public()));
        assert!(!msg.verify_server_signature(&other.public()));
    }

    #[test]
    fn lanes_follow_routing_hash() {
        let tx = FactoidTransaction {
            milli_timestamp: 9,
            inputs: vec![],
            outputs: vec![],
            ec_outputs: vec![],
            signatures: vec![],
        };
        let msg = Message::new(Payload::FactoidTransaction(tx), 9);
        assert_eq!(msg.compute_vm_index(4), 0x0f % 4);
        assert_eq!(vm_index_for(&[1u8; 32], 5), 32 % 5);
        assert_eq!(vm_index_for(&[1u8; 32], 0), 0);
    }

    #[test]
    fn only_ordered_kinds_are_process_list_messages() {
        let req = Message::new(
            Payload::DbStateMissing(DbStateMissing {
                from_height: 1,
                to_height: 2,
            }),
            0,
        );
        assert!(!req.is_process_list_message());
        assert!(Message::local_eom(0).is_process_list_message());
    }
}
