mod common;

use common::{key, GenesisBuilder, Harness};
use fedchain_core::consensus::blocks::{CommitChain, CommitEntry, Entry};
use fedchain_core::consensus::messages::{Message, Payload, RevealEntry};
use fedchain_core::consensus::storage::Storage;
use fedchain_core::consensus::types::sha256;
use fedchain_core::replay::HORIZON_MS;
use fedchain_core::validation::NodeKey;
use std::time::Duration;

fn ec_key() -> NodeKey {
    key(7)
}

fn setup() -> Harness {
    let genesis = GenesisBuilder::new(&[&key(1)])
        .entry_credits(ec_key().public(), 20)
        .build();
    let mut h = Harness::start(&genesis, key(1));
    h.go_live();
    h
}

fn commit_chain(entry: &Entry, credits: u8, ts: u64) -> Message {
    let ec = ec_key();
    let mut c = CommitChain {
        milli_time: ts,
        chain_id_hash: sha256(&entry.chain_id),
        entry_hash: entry.hash(),
        credits,
        ec_pubkey: ec.public(),
        signature: String::new(),
    };
    c.signature = ec.sign(&c.signing_bytes());
    Message::new(Payload::CommitChain(c), ts)
}

fn reveal(entry: &Entry, ts: u64) -> Message {
    Message::new(
        Payload::RevealEntry(RevealEntry {
            entry: entry.clone(),
        }),
        ts,
    )
}

#[test]
fn commit_then_reveal_creates_a_chain() {
    let mut h = setup();
    let entry = Entry::new_chain(vec![b"fedchain".to_vec()], b"hello".to_vec());
    let ec = ec_key().public();
    assert_eq!(h.state.ledger().ec_balance(&ec), 20);

    let now = h.now();
    h.submit(commit_chain(&entry, 11, now));
    assert_eq!(h.state.pending_commits(&entry.hash()), 1);
    assert_eq!(h.state.ledger().ec_balance(&ec), 9);

    h.submit(reveal(&entry, now + 1));
    assert_eq!(h.state.pending_commits(&entry.hash()), 0);
    let pl = h.state.process_list(1).expect("process list");
    assert!(pl.new_eblocks.contains_key(&entry.chain_id));
    assert!(pl.new_entries.contains_key(&entry.hash()));

    // A second reveal has no commit left to consume.
    let again = reveal(&entry, now + 2);
    h.submit(again.clone());
    assert!(h.state.is_held(&again.hash()));

    h.close_block();
    assert_eq!(h.state.leader_height(), 2);
    let store = h.store.lock().expect("store");
    assert!(store.fetch_entry(&entry.hash()).expect("read").is_some());
    let head = store
        .fetch_eblock_head(&entry.chain_id)
        .expect("read")
        .expect("chain head");
    assert_eq!(head.header.db_height, 1);
    drop(store);
    assert_eq!(h.state.ledger().ec_balance(&ec), 9);
}

#[test]
fn commit_beyond_balance_is_held() {
    let mut h = setup();
    let entry = Entry::new_chain(vec![b"big".to_vec()], b"x".to_vec());
    let now = h.now();
    let msg = commit_chain(&entry, 30, now);
    h.submit(msg.clone());
    assert!(h.state.is_held(&msg.hash()));
    assert_eq!(h.state.pending_commits(&entry.hash()), 0);
}

#[test]
fn commit_with_bad_signature_is_rejected() {
    let mut h = setup();
    let entry = Entry::new_chain(vec![b"forged".to_vec()], b"x".to_vec());
    let now = h.now();
    let mut msg = commit_chain(&entry, 5, now);
    if let Payload::CommitChain(c) = &mut msg.payload {
        c.credits = 1;
    }
    h.submit(msg);
    assert_eq!(h.invalid().len(), 1);
    assert_eq!(h.state.pending_commits(&entry.hash()), 0);
}

#[test]
fn entry_commit_for_unknown_chain_is_rejected_at_reveal() {
    let mut h = setup();
    let entry = Entry {
        chain_id: sha256(b"no such chain"),
        ext_ids: vec![],
        content: b"orphan".to_vec(),
    };
    let ec = ec_key();
    let now = h.now();
    let mut c = CommitEntry {
        milli_time: now,
        entry_hash: entry.hash(),
        credits: 1,
        ec_pubkey: ec.public(),
        signature: String::new(),
    };
    c.signature = ec.sign(&c.signing_bytes());
    h.submit(Message::new(Payload::CommitEntry(c), now));
    assert_eq!(h.state.pending_commits(&entry.hash()), 1);

    h.submit(reveal(&entry, now + 1));
    assert_eq!(h.invalid().len(), 1);
    assert_eq!(h.state.pending_commits(&entry.hash()), 1);
}

#[test]
fn unrevealed_commit_expires_with_the_replay_horizon() {
    let mut h = setup();
    let entry = Entry::new_chain(vec![b"never".to_vec()], b"revealed".to_vec());
    let now = h.now();
    h.submit(commit_chain(&entry, 2, now));
    assert_eq!(h.state.pending_commits(&entry.hash()), 1);

    h.tick_eom();
    assert_eq!(h.state.pending_commits(&entry.hash()), 1);

    h.clock.advance(Duration::from_millis(HORIZON_MS + 1_000));
    h.tick_eom();
    assert_eq!(h.state.current_minute(), 2);
    assert_eq!(h.state.pending_commits(&entry.hash()), 0);
}
