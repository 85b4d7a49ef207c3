mod common;

use common::{key, relay, GenesisBuilder, Harness};
use fedchain_core::consensus::messages::Payload;

// Federated order is [A, B]: at minute m, A leads lane m % 2 and B the other.
fn pair() -> (Harness, Harness) {
    let genesis = GenesisBuilder::new(&[&key(1), &key(2)]).build();
    let mut a = Harness::start(&genesis, key(1));
    let mut b = Harness::start(&genesis, key(2));
    a.go_live();
    b.go_live();
    assert_eq!(a.state.leader_vm_index(), 0);
    assert_eq!(b.state.leader_vm_index(), 1);
    (a, b)
}

#[test]
fn outbound_eom_is_not_marked_local() {
    let (mut a, _b) = pair();
    a.tick_eom();
    let eoms: Vec<_> = a
        .outbound()
        .into_iter()
        .filter(|m| matches!(m.payload, Payload::Eom(_)))
        .collect();
    assert_eq!(eoms.len(), 1);
    assert!(!eoms[0].local);
    assert_eq!(eoms[0].leader_chain_id, key(1).identity());
}

#[test]
fn minute_waits_for_every_lane() {
    let (mut a, mut b) = pair();
    a.tick_eom();
    relay(&mut a, &mut b);
    assert_eq!(a.state.current_minute(), 0);
    assert_eq!(b.state.current_minute(), 0);

    b.tick_eom();
    relay(&mut a, &mut b);
    assert_eq!(a.state.current_minute(), 1);
    assert_eq!(b.state.current_minute(), 1);
    // Lanes rotate with the minute.
    assert_eq!(a.state.leader_vm_index(), 1);
    assert_eq!(b.state.leader_vm_index(), 0);
}

#[test]
fn two_servers_close_one_block_and_save_it_after_both_signatures() {
    let (mut a, mut b) = pair();

    for minute in 0..9u8 {
        a.tick_eom();
        relay(&mut a, &mut b);
        b.tick_eom();
        relay(&mut a, &mut b);
        assert_eq!(a.state.current_minute(), minute + 1);
        assert_eq!(b.state.current_minute(), minute + 1);
        assert_eq!(a.state.leader_height(), 1);
        assert_eq!(b.state.leader_height(), 1);
    }

    a.tick_eom();
    relay(&mut a, &mut b);
    assert_eq!(b.state.leader_height(), 1);
    b.tick_eom();

    // B has closed height 1 and signed it; A has not seen the last EOM yet.
    assert_eq!(b.state.leader_height(), 2);
    assert_eq!(a.state.leader_height(), 1);
    let pending = b.state.dbstates().get(1).expect("closed height");
    assert!(pending.locked);
    assert!(!pending.ready_to_save);
    assert!(!pending.saved);
    assert_eq!(b.batches_committed(), 1);

    relay(&mut a, &mut b);

    for h in [&a, &b] {
        assert_eq!(h.state.leader_height(), 2);
        assert_eq!(h.state.current_minute(), 0);
        assert_eq!(h.state.dbstates().highest(), Some(1));
        let saved = h.state.dbstates().get(1).expect("height 1");
        assert!(saved.saved);
        assert_eq!(h.batches_committed(), 2);
        assert!(!h.state.catchup_pending());
        assert!(h.invalid().is_empty());
    }
    let key_mr = |h: &Harness| {
        h.state
            .dbstates()
            .get(1)
            .map(|s| s.directory_block.key_mr())
            .expect("height 1")
    };
    assert_eq!(key_mr(&a), key_mr(&b));

    // Both signatures sit in the next height's lanes.
    let pl = a.state.process_list(2).expect("next process list");
    for vm in &pl.vms {
        let first = vm.list[0].as_ref().expect("dbsig");
        assert!(matches!(first.msg.payload, Payload::DirectoryBlockSignature(_)));
    }
}
