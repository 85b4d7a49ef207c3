//! Sub-block bodies assembled per directory-block height.
//!
//! The consensus core only hashes the marshaled bytes; it never parses them
//! back. Every block exposes `marshal()`, `full_hash()` (hash of the whole
//! marshaled block) and `key_mr()` (header hash combined with the body Merkle
//! root).

use crate::consensus::error::BlockError;
use crate::consensus::types::{
    merkle_root_hashes, put_bytes, put_u32, put_u64, sha256, sha256_pair, Hash, PublicKey,
    ADMIN_CHAIN_ID, EC_CHAIN_ID, FACTOID_CHAIN_ID, ZERO_HASH,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Directory block
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DBlockHeader {
    pub db_height: u32,
    pub prev_full_hash: Hash,
    pub prev_key_mr: Hash,
    pub body_mr: Hash,
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DBEntry {
    pub chain_id: Hash,
    pub key_mr: Hash,
}

/// Slots 0..=2 are the admin, entry-credit and factoid blocks; the rest are
/// entry-block keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryBlock {
    pub header: DBlockHeader,
    pub entries: Vec<DBEntry>,
}

pub const ADMIN_SLOT: usize = 0;
pub const EC_SLOT: usize = 1;
pub const FACTOID_SLOT: usize = 2;

impl DirectoryBlock {
    pub fn new(db_height: u32) -> Self {
        let slot = |chain_id| DBEntry {
            chain_id,
            key_mr: ZERO_HASH,
        };
        Self {
            header: DBlockHeader {
                db_height,
                prev_full_hash: ZERO_HASH,
                prev_key_mr: ZERO_HASH,
                body_mr: ZERO_HASH,
                timestamp: 0,
            },
            entries: vec![slot(ADMIN_CHAIN_ID), slot(EC_CHAIN_ID), slot(FACTOID_CHAIN_ID)],
        }
    }

    pub fn db_height(&self) -> u32 {
        self.header.db_height
    }

    pub fn set_sub_block(&mut self, slot: usize, key_mr: Hash) {
        if let Some(entry) = self.entries.get_mut(slot) {
            entry.key_mr = key_mr;
        }
    }

    /// Adds (or replaces) the entry-block key for `chain_id`.
    pub fn add_entry(&mut self, chain_id: Hash, key_mr: Hash) {
        let start = FACTOID_SLOT + 1;
        if self.entries.len() > start {
            if let Some(existing) = self.entries[start..]
                .iter_mut()
                .find(|e| e.chain_id == chain_id)
            {
                existing.key_mr = key_mr;
                return;
            }
        }
        self.entries.push(DBEntry { chain_id, key_mr });
    }

    pub fn entry_block_keys(&self) -> &[DBEntry] {
        let start = (FACTOID_SLOT + 1).min(self.entries.len());
        &self.entries[start..]
    }

    /// Recomputes and stores the body Merkle root.
    pub fn build_body_mr(&mut self) -> Result<Hash, BlockError> {
        if self.entries.len() <= FACTOID_SLOT {
            return Err(BlockError::MissingFixedEntries {
                height: self.header.db_height,
                found: self.entries.len(),
            });
        }
        let leaves: Vec<Hash> = self
            .entries
            .iter()
            .map(|e| sha256_pair(&e.chain_id, &e.key_mr))
            .collect();
        self.header.body_mr = merkle_root_hashes(&leaves);
        Ok(self.header.body_mr)
    }

    pub fn header_bytes(&self) -> Vec<u8> {
        let h = &self.header;
        let mut out = Vec::with_capacity(4 + 32 * 3 + 8 + 4);
        put_u32(&mut out, h.db_height);
        out.extend_from_slice(&h.prev_full_hash);
        out.extend_from_slice(&h.prev_key_mr);
        out.extend_from_slice(&h.body_mr);
        put_u64(&mut out, h.timestamp);
        put_u32(&mut out, self.entries.len() as u32);
        out
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = self.header_bytes();
        for e in &self.entries {
            out.extend_from_slice(&e.chain_id);
            out.extend_from_slice(&e.key_mr);
        }
        out
    }

    pub fn key_mr(&self) -> Hash {
        sha256_pair(&sha256(&self.header_bytes()), &self.header.body_mr)
    }

    pub fn full_hash(&self) -> Hash {
        sha256(&self.marshal())
    }
}

// ---------------------------------------------------------------------------
// Admin block
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminEntry {
    AddFederatedServer { chain_id: Hash, db_height: u32 },
    AddAuditServer { chain_id: Hash, db_height: u32 },
    RemoveFederatedServer { chain_id: Hash, db_height: u32 },
    AddFederatedServerSigningKey { chain_id: Hash, pubkey: PublicKey },
    AddFederatedServerBitcoinAnchorKey {
        chain_id: Hash,
        priority: u8,
        key_type: u8,
        key: [u8; 20],
    },
    AddMatryoshkaHash { chain_id: Hash, mhash: Hash },
}

impl AdminEntry {
    fn marshal_into(&self, out: &mut Vec<u8>) {
        match self {
            AdminEntry::AddFederatedServer { chain_id, db_height } => {
                out.push(0x05);
                out.extend_from_slice(chain_id);
                put_u32(out, *db_height);
            }
            AdminEntry::AddAuditServer { chain_id, db_height } => {
                out.push(0x08);
                out.extend_from_slice(chain_id);
                put_u32(out, *db_height);
            }
            AdminEntry::RemoveFederatedServer { chain_id, db_height } => {
                out.push(0x06);
                out.extend_from_slice(chain_id);
                put_u32(out, *db_height);
            }
            AdminEntry::AddFederatedServerSigningKey { chain_id, pubkey } => {
                out.push(0x09);
                out.extend_from_slice(chain_id);
                out.extend_from_slice(pubkey);
            }
            AdminEntry::AddFederatedServerBitcoinAnchorKey {
                chain_id,
                priority,
                key_type,
                key,
            } => {
                out.push(0x0a);
                out.extend_from_slice(chain_id);
                out.push(*priority);
                out.push(*key_type);
                out.extend_from_slice(key);
            }
            AdminEntry::AddMatryoshkaHash { chain_id, mhash } => {
                out.push(0x03);
                out.extend_from_slice(chain_id);
                out.extend_from_slice(mhash);
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ABlockHeader {
    pub db_height: u32,
    pub prev_full_hash: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminBlock {
    pub header: ABlockHeader,
    pub entries: Vec<AdminEntry>,
}

impl AdminBlock {
    pub fn new(db_height: u32) -> Self {
        Self {
            header: ABlockHeader {
                db_height,
                prev_full_hash: ZERO_HASH,
            },
            entries: Vec::new(),
        }
    }

    pub fn add_fed_server(&mut self, chain_id: Hash) {
        let db_height = self.header.db_height;
        self.entries
            .push(AdminEntry::AddFederatedServer { chain_id, db_height });
    }

    pub fn add_audit_server(&mut self, chain_id: Hash) {
        let db_height = self.header.db_height;
        self.entries
            .push(AdminEntry::AddAuditServer { chain_id, db_height });
    }

    pub fn remove_fed_server(&mut self, chain_id: Hash) {
        let db_height = self.header.db_height;
        self.entries
            .push(AdminEntry::RemoveFederatedServer { chain_id, db_height });
    }

    pub fn add_signing_key(&mut self, chain_id: Hash, pubkey: PublicKey) {
        self.entries
            .push(AdminEntry::AddFederatedServerSigningKey { chain_id, pubkey });
    }

    pub fn add_bitcoin_anchor_key(&mut self, chain_id: Hash, priority: u8, key_type: u8, key: [u8; 20]) {
        self.entries.push(AdminEntry::AddFederatedServerBitcoinAnchorKey {
            chain_id,
            priority,
            key_type,
            key,
        });
    }

    pub fn add_matryoshka_hash(&mut self, chain_id: Hash, mhash: Hash) {
        self.entries
            .push(AdminEntry::AddMatryoshkaHash { chain_id, mhash });
    }

    fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 32 + 4);
        put_u32(&mut out, self.header.db_height);
        out.extend_from_slice(&self.header.prev_full_hash);
        put_u32(&mut out, self.entries.len() as u32);
        out
    }

    fn body_mr(&self) -> Hash {
        let leaves: Vec<Hash> = self
            .entries
            .iter()
            .map(|e| {
                let mut b = Vec::new();
                e.marshal_into(&mut b);
                sha256(&b)
            })
            .collect();
        merkle_root_hashes(&leaves)
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = self.header_bytes();
        for e in &self.entries {
            e.marshal_into(&mut out);
        }
        out
    }

    pub fn key_mr(&self) -> Hash {
        sha256_pair(&sha256(&self.header_bytes()), &self.body_mr())
    }

    pub fn full_hash(&self) -> Hash {
        sha256(&self.marshal())
    }
}

// ---------------------------------------------------------------------------
// Factoid block
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIo {
    pub address: Hash,
    pub amount: u64,
}

/// Factoid address controlled by `pubkey`.
pub fn factoid_address(pubkey: &PublicKey) -> Hash {
    sha256(pubkey)
}

/// Spends input `i` of a transaction: the key hashes to that input's address
/// and signs `signing_bytes`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSignature {
    pub pubkey: PublicKey,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoidTransaction {
    pub milli_timestamp: u64,
    pub inputs: Vec<TxIo>,
    pub outputs: Vec<TxIo>,
    /// Factoshis converted to entry credits at the block's exchange rate.
    pub ec_outputs: Vec<TxIo>,
    /// One per input, in input order. Not covered by the transaction hash.
    #[serde(default)]
    pub signatures: Vec<InputSignature>,
}

impl FactoidTransaction {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.marshal_into(&mut out);
        out
    }

    /// Amount drawn from each distinct input address.
    pub fn input_totals(&self) -> BTreeMap<Hash, u64> {
        let mut totals = BTreeMap::new();
        for input in &self.inputs {
            let t: &mut u64 = totals.entry(input.address).or_insert(0);
            *t = t.saturating_add(input.amount);
        }
        totals
    }

    pub fn marshal_into(&self, out: &mut Vec<u8>) {
        put_u64(out, self.milli_timestamp);
        for list in [&self.inputs, &self.outputs, &self.ec_outputs] {
            put_u32(out, list.len() as u32);
            for io in list.iter() {
                out.extend_from_slice(&io.address);
                put_u64(out, io.amount);
            }
        }
    }

    pub fn hash(&self) -> Hash {
        sha256(&self.signing_bytes())
    }

    pub fn total_inputs(&self) -> u64 {
        self.inputs.iter().map(|i| i.amount).fold(0, u64::saturating_add)
    }

    pub fn total_outputs(&self) -> u64 {
        self.outputs
            .iter()
            .chain(self.ec_outputs.iter())
            .map(|o| o.amount)
            .fold(0, u64::saturating_add)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoidBlock {
    pub db_height: u32,
    pub prev_key_mr: Hash,
    pub prev_full_hash: Hash,
    pub exchange_rate: u64,
    pub transactions: Vec<FactoidTransaction>,
    /// Transaction count at the close of each minute.
    pub period_marks: [u32; 10],
}

impl FactoidBlock {
    pub fn new(db_height: u32, exchange_rate: u64) -> Self {
        Self {
            db_height,
            prev_key_mr: ZERO_HASH,
            prev_full_hash: ZERO_HASH,
            exchange_rate,
            transactions: Vec::new(),
            period_marks: [0; 10],
        }
    }

    pub fn add_transaction(&mut self, tx: FactoidTransaction) {
        self.transactions.push(tx);
    }

    pub fn end_of_period(&mut self, minute: u8) {
        if let Some(mark) = self.period_marks.get_mut(minute as usize) {
            *mark = self.transactions.len() as u32;
        }
    }

    fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 64 + 8 + 4);
        put_u32(&mut out, self.db_height);
        out.extend_from_slice(&self.prev_key_mr);
        out.extend_from_slice(&self.prev_full_hash);
        put_u64(&mut out, self.exchange_rate);
        put_u32(&mut out, self.transactions.len() as u32);
        out
    }

    fn body_mr(&self) -> Hash {
        let leaves: Vec<Hash> = self.transactions.iter().map(|t| t.hash()).collect();
        merkle_root_hashes(&leaves)
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = self.header_bytes();
        for tx in &self.transactions {
            tx.marshal_into(&mut out);
        }
        for mark in &self.period_marks {
            put_u32(&mut out, *mark);
        }
        out
    }

    pub fn key_mr(&self) -> Hash {
        sha256_pair(&sha256(&self.header_bytes()), &self.body_mr())
    }

    pub fn full_hash(&self) -> Hash {
        sha256(&self.marshal())
    }
}

// ---------------------------------------------------------------------------
// Entry credit block
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub milli_time: u64,
    pub entry_hash: Hash,
    pub credits: u8,
    pub ec_pubkey: PublicKey,
    pub signature: String,
}

impl CommitEntry {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 32 + 1);
        put_u64(&mut out, self.milli_time);
        out.extend_from_slice(&self.entry_hash);
        out.push(self.credits);
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitChain {
    pub milli_time: u64,
    pub chain_id_hash: Hash,
    pub entry_hash: Hash,
    pub credits: u8,
    pub ec_pubkey: PublicKey,
    pub signature: String,
}

impl CommitChain {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 64 + 1);
        put_u64(&mut out, self.milli_time);
        out.extend_from_slice(&self.chain_id_hash);
        out.extend_from_slice(&self.entry_hash);
        out.push(self.credits);
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncreaseBalance {
    pub ec_pubkey: PublicKey,
    pub txid: Hash,
    pub index: u64,
    pub num_ec: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcEntry {
    CommitChain(CommitChain),
    CommitEntry(CommitEntry),
    IncreaseBalance(IncreaseBalance),
    MinuteNumber(u8),
}

impl EcEntry {
    fn marshal_into(&self, out: &mut Vec<u8>) {
        match self {
            EcEntry::CommitChain(c) => {
                out.push(0x02);
                out.extend_from_slice(&c.signing_bytes());
                out.extend_from_slice(&c.ec_pubkey);
                put_bytes(out, c.signature.as_bytes());
            }
            EcEntry::CommitEntry(c) => {
                out.push(0x03);
                out.extend_from_slice(&c.signing_bytes());
                out.extend_from_slice(&c.ec_pubkey);
                put_bytes(out, c.signature.as_bytes());
            }
            EcEntry::IncreaseBalance(b) => {
                out.push(0x04);
                out.extend_from_slice(&b.ec_pubkey);
                out.extend_from_slice(&b.txid);
                put_u64(out, b.index);
                put_u64(out, b.num_ec);
            }
            EcEntry::MinuteNumber(m) => {
                out.push(0x01);
                out.push(*m);
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ECBlockHeader {
    pub db_height: u32,
    pub prev_header_hash: Hash,
    pub prev_full_hash: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryCreditBlock {
    pub header: ECBlockHeader,
    pub body: Vec<EcEntry>,
}

impl EntryCreditBlock {
    pub fn new(db_height: u32) -> Self {
        Self {
            header: ECBlockHeader {
                db_height,
                prev_header_hash: ZERO_HASH,
                prev_full_hash: ZERO_HASH,
            },
            body: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, entry: EcEntry) {
        self.body.push(entry);
    }

    fn body_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for e in &self.body {
            e.marshal_into(&mut out);
        }
        out
    }

    fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 32 * 3 + 4);
        put_u32(&mut out, self.header.db_height);
        out.extend_from_slice(&self.header.prev_header_hash);
        out.extend_from_slice(&self.header.prev_full_hash);
        out.extend_from_slice(&sha256(&self.body_bytes()));
        put_u32(&mut out, self.body.len() as u32);
        out
    }

    pub fn header_hash(&self) -> Hash {
        sha256(&self.header_bytes())
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = self.header_bytes();
        out.extend_from_slice(&self.body_bytes());
        out
    }

    pub fn full_hash(&self) -> Hash {
        sha256(&self.marshal())
    }
}

// ---------------------------------------------------------------------------
// Entries and entry blocks
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub chain_id: Hash,
    pub ext_ids: Vec<Vec<u8>>,
    pub content: Vec<u8>,
}

impl Entry {
    /// First entry of a new chain; the chain id is derived from the external ids.
    pub fn new_chain(ext_ids: Vec<Vec<u8>>, content: Vec<u8>) -> Self {
        let mut material = Vec::with_capacity(32 * ext_ids.len());
        for id in &ext_ids {
            material.extend_from_slice(&sha256(id));
        }
        Self {
            chain_id: sha256(&material),
            ext_ids,
            content,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.chain_id);
        put_u32(&mut out, self.ext_ids.len() as u32);
        for id in &self.ext_ids {
            put_bytes(&mut out, id);
        }
        put_bytes(&mut out, &self.content);
        out
    }

    pub fn hash(&self) -> Hash {
        sha256(&self.marshal())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EbEntry {
    Entry(Hash),
    MinuteMarker(u8),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EBlockHeader {
    pub chain_id: Hash,
    pub db_height: u32,
    pub eb_sequence: u32,
    pub prev_key_mr: Hash,
    pub prev_full_hash: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryBlock {
    pub header: EBlockHeader,
    pub body: Vec<EbEntry>,
}

impl EntryBlock {
    pub fn new(chain_id: Hash, db_height: u32) -> Self {
        Self {
            header: EBlockHeader {
                chain_id,
                db_height,
                eb_sequence: 0,
                prev_key_mr: ZERO_HASH,
                prev_full_hash: ZERO_HASH,
            },
            body: Vec::new(),
        }
    }

    /// Next block of an existing chain.
    pub fn following(prev: &EntryBlock, db_height: u32) -> Self {
        Self {
            header: EBlockHeader {
                chain_id: prev.header.chain_id,
                db_height,
                eb_sequence: prev.header.eb_sequence.saturating_add(1),
                prev_key_mr: prev.key_mr(),
                prev_full_hash: prev.full_hash(),
            },
            body: Vec::new(),
        }
    }

    pub fn chain_id(&self) -> Hash {
        self.header.chain_id
    }

    pub fn add_entry(&mut self, entry: &Entry) {
        self.body.push(EbEntry::Entry(entry.hash()));
    }

    /// Consecutive markers collapse into the latest one.
    pub fn add_end_of_minute_marker(&mut self, minute: u8) {
        if let Some(EbEntry::MinuteMarker(m)) = self.body.last_mut() {
            *m = minute;
            return;
        }
        self.body.push(EbEntry::MinuteMarker(minute));
    }

    pub fn entry_hashes(&self) -> impl Iterator<Item = &Hash> {
        self.body.iter().filter_map(|e| match e {
            EbEntry::Entry(h) => Some(h),
            EbEntry::MinuteMarker(_) => None,
        })
    }

    fn leaf(e: &EbEntry) -> Hash {
        match e {
            EbEntry::Entry(h) => *h,
            EbEntry::MinuteMarker(m) => {
                let mut marker = ZERO_HASH;
                marker[31] = *m;
                marker
            }
        }
    }

    fn header_bytes(&self) -> Vec<u8> {
        let h = &self.header;
        let mut out = Vec::with_capacity(32 * 3 + 12);
        out.extend_from_slice(&h.chain_id);
        put_u32(&mut out, h.db_height);
        put_u32(&mut out, h.eb_sequence);
        out.extend_from_slice(&h.prev_key_mr);
        out.extend_from_slice(&h.prev_full_hash);
        put_u32(&mut out, self.body.len() as u32);
        out
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = self.header_bytes();
        for e in &self.body {
            out.extend_from_slice(&Self::leaf(e));
        }
        out
    }

    pub fn key_mr(&self) -> Hash {
        let leaves: Vec<Hash> = self.body.iter().map(Self::leaf).collect();
        sha256_pair(&sha256(&self.header_bytes()), &merkle_root_hashes(&leaves))
    }

    pub fn full_hash(&self) -> Hash {
        sha256(&self.marshal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_mr_requires_fixed_slots() {
        let mut db = DirectoryBlock::new(4);
        db.entries.truncate(2);
        assert!(db.build_body_mr().is_err());
    }

    #[test]
    fn key_mr_changes_with_entry_blocks() {
        let mut db = DirectoryBlock::new(4);
        db.build_body_mr().expect("mr");
        let before = db.key_mr();
        db.add_entry([5u8; 32], [6u8; 32]);
        db.build_body_mr().expect("mr");
        assert_ne!(before, db.key_mr());
        assert_eq!(db.entry_block_keys().len(), 1);
    }

    #[test]
    fn add_entry_replaces_existing_chain() {
        let mut db = DirectoryBlock::new(1);
        db.add_entry([5u8; 32], [6u8; 32]);
        db.add_entry([5u8; 32], [7u8; 32]);
        assert_eq!(db.entry_block_keys().len(), 1);
        assert_eq!(db.entry_block_keys()[0].key_mr, [7u8; 32]);
    }

    #[test]
    fn minute_markers_collapse() {
        let entry = Entry::new_chain(vec![b"a".to_vec()], b"body".to_vec());
        let mut eb = EntryBlock::new(entry.chain_id, 3);
        eb.add_entry(&entry);
        eb.add_end_of_minute_marker(1);
        eb.add_end_of_minute_marker(2);
        assert_eq!(eb.body, vec![EbEntry::Entry(entry.hash()), EbEntry::MinuteMarker(2)]);
        assert_eq!(eb.entry_hashes().count(), 1);
    }

    #[test]
    fn following_block_links_to_previous() {
        let entry = Entry::new_chain(vec![b"c".to_vec()], Vec::new());
        let mut first = EntryBlock::new(entry.chain_id, 1);
        first.add_entry(&entry);
        let next = EntryBlock::following(&first, 2);
        assert_eq!(next.header.eb_sequence, 1);
        assert_eq!(next.header.prev_key_mr, first.key_mr());
        assert_eq!(next.chain_id(), first.chain_id());
    }

    #[test]
    fn factoid_period_marks_record_counts() {
        let mut fb = FactoidBlock::new(2, 1000);
        fb.add_transaction(FactoidTransaction {
            milli_timestamp: 1,
            inputs: vec![],
            outputs: vec![],
            ec_outputs: vec![],
            signatures: vec![],
        });
        fb.end_of_period(0);
        fb.end_of_period(12);
        assert_eq!(fb.period_marks[0], 1);
        assert_eq!(fb.period_marks[1], 0);
    }
}
