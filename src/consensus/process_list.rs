use crate::consensus::ack::Ack;
use crate::consensus::blocks::{AdminBlock, DirectoryBlock, Entry, EntryBlock, EntryCreditBlock, FactoidBlock};
use crate::consensus::messages::Message;
use crate::consensus::types::{Hash, IdentityChainId, Server};
use std::collections::{BTreeMap, HashMap, HashSet};

/// One admitted slot of a lane.
#[derive(Clone, Debug)]
pub struct LaneEntry {
    pub ack: Ack,
    pub msg: Message,
    pub processed: bool,
}

/// How far past the end of a lane an ack may land.
pub const MAX_ACK_LEAD: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Duplicate,
    Conflict,
    /// Position is more than `MAX_ACK_LEAD` beyond the lane's end.
    TooFar,
}

/// A single ordering lane. `list` is sparse: acks may arrive out of order and
/// land at their own height; execution stops at the first gap.
#[derive(Clone, Debug, Default)]
pub struct VirtualServer {
    pub list: Vec<Option<LaneEntry>>,
    /// Number of entries executed so far.
    pub height: usize,
    pub leader_minute: u8,
    /// Closed for the current minute.
    pub eom: bool,
}

impl VirtualServer {
    pub fn accepts(&self, position: u32) -> bool {
        (position as usize) < self.list.len().saturating_add(MAX_ACK_LEAD)
    }

    pub fn add(&mut self, ack: Ack, msg: Message) -> AddOutcome {
        if !self.accepts(ack.height) {
            return AddOutcome::TooFar;
        }
        let at = ack.height as usize;
        if self.list.len() <= at {
            self.list.resize_with(at + 1, || None);
        }
        match &self.list[at] {
            Some(existing) if existing.ack.message_hash == ack.message_hash => AddOutcome::Duplicate,
            Some(_) => AddOutcome::Conflict,
            None => {
                self.list[at] = Some(LaneEntry {
                    ack,
                    msg,
                    processed: false,
                });
                AddOutcome::Added
            }
        }
    }

    /// Last ack in the lane, used to extend the serial chain.
    pub fn last_ack(&self) -> Option<&Ack> {
        self.list.last().and_then(|e| e.as_ref()).map(|e| &e.ack)
    }

    pub fn caught_up(&self) -> bool {
        self.height == self.list.len()
    }

    /// Positions at or above the cursor that have no entry yet.
    pub fn gaps(&self) -> Vec<usize> {
        (self.height..self.list.len())
            .filter(|i| self.list[*i].is_none())
            .collect()
    }
}

/// Per-height ordering structure and the block bodies it is building.
#[derive(Clone, Debug)]
pub struct ProcessList {
    pub db_height: u32,
    pub fed_servers: Vec<Server>,
    pub audit_servers: Vec<Server>,
    pub vms: Vec<VirtualServer>,
    pub directory_block: DirectoryBlock,
    pub admin_block: AdminBlock,
    pub entry_credit_block: EntryCreditBlock,
    pub factoid_block: FactoidBlock,
    pub new_eblocks: BTreeMap<Hash, EntryBlock>,
    pub new_entries: BTreeMap<Hash, Entry>,
    /// accused -> reporters
    pub faults: HashMap<IdentityChainId, HashSet<IdentityChainId>>,
    /// Latest EOM timestamp seen; stamps the directory block header.
    pub last_eom_ts: u64,
}

impl ProcessList {
    pub fn new(db_height: u32, fed_servers: Vec<Server>, audit_servers: Vec<Server>, exchange_rate: u64) -> Self {
        let lanes = fed_servers.len().max(1);
        Self {
            db_height,
            vms: vec![VirtualServer::default(); lanes],
            fed_servers,
            audit_servers,
            directory_block: DirectoryBlock::new(db_height),
            admin_block: AdminBlock::new(db_height),
            entry_credit_block: EntryCreditBlock::new(db_height),
            factoid_block: FactoidBlock::new(db_height, exchange_rate),
            new_eblocks: BTreeMap::new(),
            new_entries: BTreeMap::new(),
            faults: HashMap::new(),
            last_eom_ts: 0,
        }
    }

    pub fn lanes(&self) -> usize {
        self.vms.len()
    }

    pub fn fed_count(&self) -> usize {
        self.fed_servers.len()
    }

    pub fn fed_index(&self, id: &IdentityChainId) -> Option<usize> {
        self.fed_servers.iter().position(|s| &s.chain_id == id)
    }

    /// Federated server `i` leads lane `(i + minute) mod lanes`.
    pub fn lane_for(&self, id: &IdentityChainId, minute: u8) -> Option<usize> {
        let i = self.fed_index(id)?;
        Some((i + minute as usize) % self.lanes())
    }

    pub fn leader_for(&self, vm_index: usize, minute: u8) -> Option<&Server> {
        let lanes = self.lanes();
        if vm_index >= lanes || self.fed_servers.is_empty() {
            return None;
        }
        let m = minute as usize % lanes;
        let i = (vm_index + lanes - m) % lanes;
        self.fed_servers.get(i)
    }

    pub fn add_to_lane(&mut self, ack: Ack, msg: Message) -> Option<AddOutcome> {
        let vm = self.vms.get_mut(ack.vm_index)?;
        Some(vm.add(ack, msg))
    }

    /// Records one fault report per reporter; returns the distinct reporter count.
    pub fn add_fault(&mut self, accused: IdentityChainId, reporter: IdentityChainId) -> usize {
        let reporters = self.faults.entry(accused).or_default();
        reporters.insert(reporter);
        reporters.len()
    }

    pub fn fault_count(&self, id: &IdentityChainId) -> usize {
        self.faults.get(id).map(|r| r.len()).unwrap_or(0)
    }
}

/// Process lists by height, created on first reference.
#[derive(Debug, Default)]
pub struct ProcessListSet {
    lists: BTreeMap<u32, ProcessList>,
}

impl ProcessListSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, height: u32) -> Option<&ProcessList> {
        self.lists.get(&height)
    }

    pub fn get_mut(&mut self, height: u32) -> Option<&mut ProcessList> {
        self.lists.get_mut(&height)
    }

    pub fn get_or_create(
        &mut self,
        height: u32,
        fed_servers: &[Server],
        audit_servers: &[Server],
        exchange_rate: u64,
    ) -> &mut ProcessList {
        self.lists.entry(height).or_insert_with(|| {
            ProcessList::new(height, fed_servers.to_vec(), audit_servers.to_vec(), exchange_rate)
        })
    }

    /// Drops lists below `height`.
    pub fn retire_below(&mut self, height: u32) -> usize {
        let keep = self.lists.split_off(&height);
        let dropped = self.lists.len();
        self.lists = keep;
        dropped
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::messages::Payload;
    use crate::consensus::blocks::FactoidTransaction;
    use crate::consensus::types::sha256;

    fn servers(n: u8) -> Vec<Server> {
        (0..n).map(|i| Server::new([i + 1; 32], format!("fed{}", i))).collect()
    }

    fn tx_msg(ts: u64) -> Message {
        Message::new(
            Payload::FactoidTransaction(FactoidTransaction {
                milli_timestamp: ts,
                inputs: vec![],
                outputs: vec![],
                ec_outputs: vec![],
                signatures: vec![],
            }),
            ts,
        )
    }

    fn ack_at(height: u32, msg: &Message) -> Ack {
        let mut ack = Ack::next(None, 1, 0, 0, msg.hash(), [0u8; 32], 0);
        ack.height = height;
        ack
    }

    #[test]
    fn rotation_covers_every_lane() {
        let pl = ProcessList::new(1, servers(3), vec![], 1000);
        for minute in 0..10u8 {
            let mut lanes: Vec<usize> = pl
                .fed_servers
                .iter()
                .map(|s| pl.lane_for(&s.chain_id, minute).expect("fed"))
                .collect();
            lanes.sort();
            assert_eq!(lanes, vec![0, 1, 2]);
            for s in &pl.fed_servers {
                let lane = pl.lane_for(&s.chain_id, minute).expect("fed");
                assert_eq!(pl.leader_for(lane, minute).map(|l| l.chain_id), Some(s.chain_id));
            }
        }
    }

    #[test]
    fn out_of_order_adds_land_at_ack_height() {
        let mut vm = VirtualServer::default();
        let m0 = tx_msg(1);
        let m2 = tx_msg(3);
        assert_eq!(vm.add(ack_at(2, &m2), m2.clone()), AddOutcome::Added);
        assert_eq!(vm.list.len(), 3);
        assert_eq!(vm.gaps(), vec![0, 1]);
        assert_eq!(vm.add(ack_at(0, &m0), m0.clone()), AddOutcome::Added);
        assert_eq!(vm.gaps(), vec![1]);
        assert_eq!(vm.add(ack_at(0, &m0), m0), AddOutcome::Duplicate);
        assert_eq!(vm.add(ack_at(2, &tx_msg(9)), tx_msg(9)), AddOutcome::Conflict);
        assert_eq!(
            vm.list[2].as_ref().map(|e| e.ack.message_hash),
            Some(m2.hash())
        );
    }

    #[test]
    fn ack_far_past_the_lane_end_is_refused() {
        let mut vm = VirtualServer::default();
        let m = tx_msg(4);
        let far = ack_at(MAX_ACK_LEAD as u32, &m);
        assert!(!vm.accepts(far.height));
        assert_eq!(vm.add(far, m.clone()), AddOutcome::TooFar);
        assert!(vm.list.is_empty());
        let edge = ack_at(MAX_ACK_LEAD as u32 - 1, &m);
        assert_eq!(vm.add(edge, m), AddOutcome::Added);
        assert_eq!(vm.list.len(), MAX_ACK_LEAD);
    }

    #[test]
    fn faults_count_once_per_reporter() {
        let mut pl = ProcessList::new(1, servers(3), vec![], 1000);
        let accused = sha256(b"a");
        assert_eq!(pl.add_fault(accused, sha256(b"r1")), 1);
        assert_eq!(pl.add_fault(accused, sha256(b"r1")), 1);
        assert_eq!(pl.add_fault(accused, sha256(b"r2")), 2);
        assert_eq!(pl.fault_count(&accused), 2);
    }

    #[test]
    fn retire_drops_lower_heights() {
        let mut set = ProcessListSet::new();
        for h in 1..=5 {
            set.get_or_create(h, &servers(1), &[], 1000);
        }
        assert_eq!(set.retire_below(4), 3);
        assert!(set.get(3).is_none());
        assert!(set.get(4).is_some());
        assert_eq!(set.len(), 2);
    }
}
