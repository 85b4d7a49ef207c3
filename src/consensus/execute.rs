//! Leader/follower dispatch of inbound messages and the process-list effects
//! of the non-round message kinds.

use crate::consensus::ack::Ack;
use crate::consensus::blocks::{
    factoid_address, CommitChain, CommitEntry, DirectoryBlock, EcEntry, Entry, EntryBlock,
    FactoidTransaction, IncreaseBalance,
};
use crate::consensus::dbstate::DbState;
use crate::consensus::error::FatalError;
use crate::consensus::messages::{
    AddServer, ChangeServerKey, KeyChange, Message, Payload, ServerKind,
};
use crate::consensus::process_list::AddOutcome;
use crate::consensus::state::ConsensusState;
use crate::consensus::types::{identity_from_pubkey, short, Hash, PublicKey};
use crate::replay::{HORIZON_MS, INTERNAL_REPLAY};
use crate::validation::{verify_signature, Validity};
use tracing::{debug, info, trace, warn};

/// A paid commit waiting for its reveal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Commit {
    Chain(CommitChain),
    Entry(CommitEntry),
}

impl Commit {
    pub fn entry_hash(&self) -> Hash {
        match self {
            Commit::Chain(c) => c.entry_hash,
            Commit::Entry(c) => c.entry_hash,
        }
    }

    pub fn credits(&self) -> u8 {
        match self {
            Commit::Chain(c) => c.credits,
            Commit::Entry(c) => c.credits,
        }
    }

    pub fn milli_time(&self) -> u64 {
        match self {
            Commit::Chain(c) => c.milli_time,
            Commit::Entry(c) => c.milli_time,
        }
    }

    pub fn ec_pubkey(&self) -> PublicKey {
        match self {
            Commit::Chain(c) => c.ec_pubkey,
            Commit::Entry(c) => c.ec_pubkey,
        }
    }

    fn signature_valid(&self) -> bool {
        match self {
            Commit::Chain(c) => verify_signature(&c.ec_pubkey, &c.signing_bytes(), &c.signature),
            Commit::Entry(c) => verify_signature(&c.ec_pubkey, &c.signing_bytes(), &c.signature),
        }
    }
}

/// What `execute_msg` did with a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Execution {
    /// Acked by this node and admitted to its lane.
    Leader,
    /// Handled on the follower path (admitted under a received ack, or a
    /// directly executed kind).
    Follower,
    /// Parked until a dependency shows up.
    Held,
    /// Failed validation; forwarded to the invalid queue.
    Rejected,
    /// Replay hit or a local tick with nothing to do.
    Dropped,
}

impl ConsensusState {
    /// Drains the reprocess backlog, then at most one ack and one message.
    pub fn process_queues(&mut self) -> Result<bool, FatalError> {
        let mut progress = false;
        while let Some(msg) = self.reprocess.pop_front() {
            self.execute_msg(msg)?;
            progress = true;
        }
        if let Ok(ack) = self.ack_rx.try_recv() {
            self.execute_msg(ack)?;
            progress = true;
        }
        if let Ok(msg) = self.msg_rx.try_recv() {
            let gossip = (!msg.local && msg.is_process_list_message()).then(|| msg.clone());
            let outcome = self.execute_msg(msg)?;
            if let Some(m) = gossip {
                if matches!(outcome, Execution::Follower | Execution::Held) {
                    self.send_outbound(m);
                }
            }
            progress = true;
        }
        Ok(progress)
    }

    pub fn execute_msg(&mut self, mut msg: Message) -> Result<Execution, FatalError> {
        if msg.local && matches!(msg.payload, Payload::Eom(_)) {
            match self.stamp_local_eom(msg) {
                Some(stamped) => msg = stamped,
                None => return Ok(Execution::Dropped),
            }
        }

        let hash = msg.hash();
        let now = self.now_ms();
        if self
            .replay
            .valid(INTERNAL_REPLAY, &hash, msg.timestamp, now)
            .is_none()
        {
            self.holding.remove(&hash);
            trace!(kind = msg.kind(), hash = %short(&hash), "replay hit, dropped");
            return Ok(Execution::Dropped);
        }
        if let Some(h) = msg.db_height() {
            self.highest_seen = self.highest_seen.max(h);
        }

        let lanes = self.ensure_pl(self.leader_height).lanes();
        msg.vm_index = msg.compute_vm_index(lanes);

        match self.validate(&msg) {
            Validity::Valid => {
                if msg.is_process_list_message() && self.leader_eligible(&msg) {
                    self.leader_execute(msg);
                    self.drain_progress()?;
                    Ok(Execution::Leader)
                } else {
                    self.follower_execute(msg)
                }
            }
            Validity::Hold => {
                trace!(kind = msg.kind(), hash = %short(&hash), "held");
                self.holding.insert(hash, msg);
                Ok(Execution::Held)
            }
            Validity::Invalid => {
                debug!(kind = msg.kind(), hash = %short(&hash), "invalid message");
                self.holding.remove(&hash);
                if self.invalid.send(msg).is_err() {
                    trace!("invalid queue closed");
                }
                Ok(Execution::Rejected)
            }
        }
    }

    pub(crate) fn leader_eligible(&self, msg: &Message) -> bool {
        if !self.run_leader || !self.leader || self.saving || self.catchup_pending {
            return false;
        }
        let Some(vm) = self
            .process_lists
            .get(self.leader_height)
            .and_then(|pl| pl.vms.get(self.leader_vm_index))
        else {
            return false;
        };
        vm.caught_up() && !vm.eom && (msg.local || msg.vm_index == self.leader_vm_index)
    }

    /// Signs an ack for `msg`, sends both out and admits the message to this
    /// node's lane.
    pub(crate) fn leader_execute(&mut self, mut msg: Message) {
        let hash = msg.hash();
        let now = self.now_ms();
        let (height, vm_index, minute) = (self.leader_height, self.leader_vm_index, self.current_minute);
        let identity = self.key.identity();
        let prev = self
            .ensure_pl(height)
            .vms
            .get(vm_index)
            .and_then(|vm| vm.last_ack().cloned());
        let mut ack = Ack::next(prev.as_ref(), height, vm_index, minute, hash, identity, now);
        ack.sign(&self.key);

        msg.vm_index = vm_index;
        msg.minute = minute;
        msg.leader_chain_id = identity;
        // Peers must not mistake a stamped timer EOM for their own tick.
        msg.local = false;
        debug!(
            kind = msg.kind(),
            hash = %short(&hash),
            height,
            vm = vm_index,
            position = ack.height,
            "leader executed"
        );
        self.send_outbound(msg.clone());
        self.send_outbound(Message::new(Payload::Ack(ack.clone()), now));
        self.add_to_process_list(ack, msg);
    }

    pub(crate) fn follower_execute(&mut self, msg: Message) -> Result<Execution, FatalError> {
        match &msg.payload {
            Payload::Ack(_) => Ok(self.execute_ack(msg)),
            Payload::DbState(_) => Ok(self.execute_dbstate(msg)),
            Payload::DbStateMissing(_) => self.answer_dbstate_missing(msg),
            Payload::MissingMsgResponse(_) => Ok(self.execute_missing_msg_response(msg)),
            Payload::ServerFault(_) => Ok(self.execute_server_fault(msg)),
            _ => {
                let hash = msg.hash();
                match self.acks.get(&hash).cloned() {
                    Some(ack) => {
                        self.add_to_process_list(ack, msg);
                        Ok(Execution::Follower)
                    }
                    None => {
                        trace!(kind = msg.kind(), hash = %short(&hash), "waiting for ack");
                        self.holding.insert(hash, msg);
                        Ok(Execution::Held)
                    }
                }
            }
        }
    }

    /// Places a message at its ack's position and records it as seen.
    pub(crate) fn add_to_process_list(&mut self, ack: Ack, msg: Message) {
        let hash = msg.hash();
        let ts = msg.timestamp;
        self.holding.remove(&hash);
        self.acks.remove(&hash);
        let (height, vm, position) = (ack.db_height, ack.vm_index, ack.height);
        match self.ensure_pl(height).add_to_lane(ack, msg) {
            Some(AddOutcome::Added) => {
                self.replay.mark_seen(INTERNAL_REPLAY, &hash, ts);
                trace!(height, vm, position, hash = %short(&hash), "admitted");
            }
            Some(AddOutcome::Duplicate) => trace!(height, vm, position, "already admitted"),
            Some(AddOutcome::Conflict) => {
                warn!(height, vm, position, hash = %short(&hash), "conflicting ack for occupied position")
            }
            Some(AddOutcome::TooFar) => warn!(height, vm, position, "ack position too far ahead, dropped"),
            None => warn!(height, vm, "ack names a lane outside the process list"),
        }
    }

    fn execute_ack(&mut self, msg: Message) -> Execution {
        let hash = msg.hash();
        let ts = msg.timestamp;
        let Payload::Ack(ack) = msg.payload else {
            return Execution::Dropped;
        };
        self.replay.mark_seen(INTERNAL_REPLAY, &hash, ts);
        match self.holding.remove(&ack.message_hash) {
            Some(held) => self.add_to_process_list(ack, held),
            None => {
                self.acks.insert(ack.message_hash, ack);
            }
        }
        Execution::Follower
    }

    fn execute_dbstate(&mut self, msg: Message) -> Execution {
        let hash = msg.hash();
        let ts = msg.timestamp;
        let Payload::DbState(d) = msg.payload else {
            return Execution::Dropped;
        };
        let height = d.directory_block.db_height();
        self.replay.mark_seen(INTERNAL_REPLAY, &hash, ts);
        if self.add_db_state(DbState::from_network(*d)) {
            info!(height, "dbstate received");
        }
        if height >= self.leader_height {
            self.jump_to_height(height + 1);
        }
        Execution::Follower
    }

    fn answer_dbstate_missing(&mut self, msg: Message) -> Result<Execution, FatalError> {
        let Payload::DbStateMissing(req) = &msg.payload else {
            return Ok(Execution::Dropped);
        };
        let last = req
            .to_height
            .min(req.from_height.saturating_add(self.cfg.max_catchup_heights.saturating_sub(1)));
        let now = self.now_ms();
        let mut replies = Vec::new();
        {
            let store = self
                .store
                .lock()
                .map_err(|_| FatalError::Poisoned("storage"))?;
            for height in req.from_height..=last {
                match store.fetch_height(height).map_err(FatalError::storage(height))? {
                    Some(stored) => replies.push(Message::new(Payload::DbState(Box::new(stored.into())), now)),
                    None => break,
                }
            }
        }
        debug!(from = req.from_height, to = last, sent = replies.len(), "answered dbstate request");
        self.replay.mark_seen(INTERNAL_REPLAY, &msg.hash(), msg.timestamp);
        for reply in replies {
            self.send_outbound(reply);
        }
        Ok(Execution::Follower)
    }

    fn execute_missing_msg_response(&mut self, msg: Message) -> Execution {
        let hash = msg.hash();
        let ts = msg.timestamp;
        let Payload::MissingMsgResponse(resp) = msg.payload else {
            return Execution::Dropped;
        };
        self.replay.mark_seen(INTERNAL_REPLAY, &hash, ts);
        self.add_to_process_list(resp.ack, *resp.message);
        Execution::Follower
    }

    fn execute_server_fault(&mut self, msg: Message) -> Execution {
        let hash = msg.hash();
        let ts = msg.timestamp;
        let Payload::ServerFault(fault) = msg.payload else {
            return Execution::Dropped;
        };
        self.replay.mark_seen(INTERNAL_REPLAY, &hash, ts);
        let pl = self.ensure_pl(fault.db_height);
        let count = pl.add_fault(fault.accused, fault.signer);
        let fed = pl.fed_count();
        if count * 2 > fed {
            warn!(
                height = fault.db_height,
                server = %short(&fault.accused),
                reports = count,
                "majority of federated servers report a fault"
            );
        } else {
            debug!(server = %short(&fault.accused), reports = count, "server fault recorded");
        }
        Execution::Follower
    }

    /// Three-way verdict against current state.
    pub(crate) fn validate(&mut self, msg: &Message) -> Validity {
        match &msg.payload {
            Payload::Eom(e) => {
                if e.db_height < self.leader_height {
                    return Validity::Invalid;
                }
                if !self.signed_by_fed(msg) {
                    return Validity::Invalid;
                }
                if e.db_height > self.leader_height {
                    return Validity::Hold;
                }
                Validity::Valid
            }
            Payload::DirectoryBlockSignature(d) => {
                if d.db_height == 0 || !self.signed_by_fed(msg) {
                    return Validity::Invalid;
                }
                let signed = d.db_height - 1;
                match self.dbstates.get(signed) {
                    None if signed < self.dbstates.base() => Validity::Invalid,
                    None => Validity::Hold,
                    Some(s) if s.is_new => Validity::Hold,
                    Some(s) if s.directory_block.key_mr() != d.directory_block_key_mr => Validity::Invalid,
                    Some(_) => Validity::Valid,
                }
            }
            Payload::Ack(ack) => self.validate_ack(ack),
            Payload::CommitChain(c) => self.validate_commit(&Commit::Chain(c.clone())),
            Payload::CommitEntry(c) => self.validate_commit(&Commit::Entry(c.clone())),
            Payload::RevealEntry(r) => self.validate_reveal(&r.entry),
            Payload::FactoidTransaction(tx) => self.validate_factoid_tx(tx),
            Payload::AddServer(a) => {
                if !self.signed_by_fed(msg) || self.server_key(&identity_from_pubkey(&a.pubkey)).is_some() {
                    return Validity::Invalid;
                }
                Validity::Valid
            }
            Payload::ChangeServerKey(c) => {
                if !self.signed_by_fed(msg) || self.server_key(&c.identity).is_none() {
                    return Validity::Invalid;
                }
                Validity::Valid
            }
            Payload::DbState(d) => {
                let height = d.directory_block.db_height();
                if height < self.dbstates.base() {
                    return Validity::Invalid;
                }
                if self.dbstates.get(height).map(|s| s.saved).unwrap_or(false) {
                    return Validity::Invalid;
                }
                let mut check: DirectoryBlock = d.directory_block.clone();
                match check.build_body_mr() {
                    Ok(mr) if mr == d.directory_block.header.body_mr => Validity::Valid,
                    _ => Validity::Invalid,
                }
            }
            Payload::DbStateMissing(req) => {
                if req.from_height > req.to_height {
                    return Validity::Invalid;
                }
                Validity::Valid
            }
            Payload::MissingMsgResponse(resp) => {
                if resp.ack.message_hash != resp.message.hash() {
                    return Validity::Invalid;
                }
                self.validate_ack(&resp.ack)
            }
            Payload::ServerFault(f) => {
                if !self.signed_by_fed(msg) || self.fed_key(&f.accused).is_none() {
                    return Validity::Invalid;
                }
                Validity::Valid
            }
        }
    }

    fn signed_by_fed(&self, msg: &Message) -> bool {
        let Some(signer) = msg.signer() else {
            return false;
        };
        match self.fed_key(&signer) {
            Some(pk) => msg.verify_server_signature(&pk),
            None => false,
        }
    }

    fn validate_ack(&mut self, ack: &Ack) -> Validity {
        if ack.db_height < self.leader_height {
            return Validity::Invalid;
        }
        if ack.db_height > self.leader_height.saturating_add(1) {
            return Validity::Hold;
        }
        let pl = self.ensure_pl(ack.db_height);
        if !pl.vms.get(ack.vm_index).map(|vm| vm.accepts(ack.height)).unwrap_or(false) {
            return Validity::Invalid;
        }
        let Some(leader) = pl.leader_for(ack.vm_index, ack.minute) else {
            return Validity::Invalid;
        };
        if leader.chain_id != ack.leader_chain_id || !ack.verify(&leader.pubkey) {
            return Validity::Invalid;
        }
        Validity::Valid
    }

    fn validate_commit(&self, commit: &Commit) -> Validity {
        if commit.credits() == 0 || !commit.signature_valid() {
            return Validity::Invalid;
        }
        if self.ledger.ec_balance(&commit.ec_pubkey()) < commit.credits() as i64 {
            return Validity::Hold;
        }
        Validity::Valid
    }

    fn validate_reveal(&mut self, entry: &Entry) -> Validity {
        let Some(front) = self.commits.get(&entry.hash()).and_then(|q| q.front()) else {
            return Validity::Hold;
        };
        if matches!(front, Commit::Entry(_)) {
            match self.chain_head(self.leader_height, &entry.chain_id) {
                Ok(Some(_)) => {}
                Ok(None) => return Validity::Invalid,
                Err(e) => {
                    warn!(error = %e, "chain lookup failed while validating reveal");
                    return Validity::Hold;
                }
            }
        }
        Validity::Valid
    }

    fn validate_factoid_tx(&self, tx: &FactoidTransaction) -> Validity {
        if tx.total_inputs() < tx.total_outputs() || tx.signatures.len() != tx.inputs.len() {
            return Validity::Invalid;
        }
        let signed = tx.signing_bytes();
        let authorized = tx.inputs.iter().zip(&tx.signatures).all(|(input, sig)| {
            factoid_address(&sig.pubkey) == input.address
                && verify_signature(&sig.pubkey, &signed, &sig.signature)
        });
        if !authorized {
            return Validity::Invalid;
        }
        // An address may appear in several inputs; its balance covers the sum.
        for (address, total) in tx.input_totals() {
            if self.ledger.factoid_balance(&address) < i64::try_from(total).unwrap_or(i64::MAX) {
                return Validity::Invalid;
            }
        }
        Validity::Valid
    }

    pub(crate) fn put_commit(&mut self, commit: Commit) {
        self.commits
            .entry(commit.entry_hash())
            .or_default()
            .push_back(commit);
    }

    /// Oldest unconsumed commit for `entry_hash`.
    pub(crate) fn next_commit(&mut self, entry_hash: &Hash) -> Option<Commit> {
        let queue = self.commits.get_mut(entry_hash)?;
        let commit = queue.pop_front();
        if queue.is_empty() {
            self.commits.remove(entry_hash);
        }
        commit
    }

    /// Drops acks for heights already left behind and commits too old to
    /// ever be revealed.
    pub(crate) fn prune_pending(&mut self) {
        let height = self.leader_height;
        let acks = self.acks.len();
        self.acks.retain(|_, ack| ack.db_height >= height);

        let now = self.now_ms();
        let mut expired = 0;
        self.commits.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|c| now.saturating_sub(c.milli_time()) <= HORIZON_MS);
            expired += before - queue.len();
            !queue.is_empty()
        });
        let dropped = acks - self.acks.len();
        if dropped > 0 || expired > 0 {
            debug!(height, acks = dropped, commits = expired, "pruned pending acks and commits");
        }
    }

    /// Latest entry block of `chain_id` as of `height`: the open one in the
    /// process list, then any unsaved state, then storage.
    pub(crate) fn chain_head(&self, height: u32, chain_id: &Hash) -> Result<Option<EntryBlock>, FatalError> {
        if let Some(eb) = self
            .process_lists
            .get(height)
            .and_then(|pl| pl.new_eblocks.get(chain_id))
        {
            return Ok(Some(eb.clone()));
        }
        let pending = self
            .dbstates
            .iter()
            .filter(|s| s.height() < height)
            .flat_map(|s| s.entry_blocks.iter())
            .filter(|eb| &eb.chain_id() == chain_id)
            .max_by_key(|eb| eb.header.db_height);
        if let Some(eb) = pending {
            return Ok(Some(eb.clone()));
        }
        let store = self
            .store
            .lock()
            .map_err(|_| FatalError::Poisoned("storage"))?;
        store.fetch_eblock_head(chain_id).map_err(FatalError::storage(height))
    }

    pub(crate) fn process_commit(&mut self, height: u32, commit: Commit) {
        let entry = match &commit {
            Commit::Chain(c) => EcEntry::CommitChain(c.clone()),
            Commit::Entry(c) => EcEntry::CommitEntry(c.clone()),
        };
        self.ensure_pl(height).entry_credit_block.add_entry(entry);
        self.ledger
            .adjust_ec(&commit.ec_pubkey(), -(commit.credits() as i64));
        trace!(entry = %short(&commit.entry_hash()), "commit recorded");
        self.put_commit(commit);
    }

    /// Consumes the oldest commit and adds the entry to its chain's block.
    /// Returns false while no commit is available.
    pub(crate) fn process_reveal(&mut self, height: u32, entry: &Entry) -> Result<bool, FatalError> {
        let entry_hash = entry.hash();
        let Some(commit) = self.next_commit(&entry_hash) else {
            return Ok(false);
        };
        let chain = entry.chain_id;
        let open = self
            .process_lists
            .get(height)
            .map(|pl| pl.new_eblocks.contains_key(&chain))
            .unwrap_or(false);
        if !open {
            let block = match self.chain_head(height, &chain)? {
                Some(prev) => EntryBlock::following(&prev, height),
                None if matches!(commit, Commit::Chain(_)) => EntryBlock::new(chain, height),
                None => {
                    warn!(chain = %short(&chain), entry = %short(&entry_hash), "reveal for unknown chain dropped");
                    return Ok(true);
                }
            };
            self.ensure_pl(height).new_eblocks.insert(chain, block);
        }
        let pl = self.ensure_pl(height);
        if let Some(eb) = pl.new_eblocks.get_mut(&chain) {
            eb.add_entry(entry);
        }
        pl.new_entries.insert(entry_hash, entry.clone());
        debug!(chain = %short(&chain), entry = %short(&entry_hash), "entry revealed");
        Ok(true)
    }

    pub(crate) fn process_factoid_tx(&mut self, height: u32, tx: &FactoidTransaction) {
        let txid = tx.hash();
        for input in &tx.inputs {
            self.ledger.adjust_factoid(&input.address, -(input.amount as i64));
        }
        for output in &tx.outputs {
            self.ledger.adjust_factoid(&output.address, output.amount as i64);
        }
        let pl = self.ensure_pl(height);
        let rate = pl.factoid_block.exchange_rate.max(1);
        pl.factoid_block.add_transaction(tx.clone());
        let mut credited = Vec::with_capacity(tx.ec_outputs.len());
        for (i, out) in tx.ec_outputs.iter().enumerate() {
            let num_ec = out.amount / rate;
            pl.entry_credit_block
                .add_entry(EcEntry::IncreaseBalance(IncreaseBalance {
                    ec_pubkey: out.address,
                    txid,
                    index: i as u64,
                    num_ec,
                }));
            credited.push((out.address, num_ec));
        }
        for (key, num_ec) in credited {
            self.ledger.adjust_ec(&key, num_ec as i64);
        }
        trace!(tx = %short(&txid), "factoid transaction applied");
    }

    pub(crate) fn process_add_server(&mut self, height: u32, add: &AddServer) {
        let chain_id = identity_from_pubkey(&add.pubkey);
        let admin = &mut self.ensure_pl(height).admin_block;
        match add.kind {
            ServerKind::Federated => admin.add_fed_server(chain_id),
            ServerKind::Audit => admin.add_audit_server(chain_id),
        }
        admin.add_signing_key(chain_id, add.pubkey);
        info!(server = %short(&chain_id), kind = ?add.kind, "server addition queued");
    }

    pub(crate) fn process_change_server_key(&mut self, height: u32, change: &ChangeServerKey) {
        let admin = &mut self.ensure_pl(height).admin_block;
        match &change.change {
            KeyChange::SigningKey(k) => admin.add_signing_key(change.identity, *k),
            KeyChange::BitcoinAnchorKey {
                priority,
                key_type,
                key,
            } => admin.add_bitcoin_anchor_key(change.identity, *priority, *key_type, *key),
            KeyChange::MatryoshkaHash(h) => admin.add_matryoshka_hash(change.identity, *h),
        }
        debug!(server = %short(&change.identity), "server key change queued");
    }
}
