// Minute/block round machine: lane execution, EOM and DBSig bookkeeping,
// block close and catch-up requests.

use crate::consensus::blocks::EcEntry;
use crate::consensus::dbstate::DbState;
use crate::consensus::error::FatalError;
use crate::consensus::execute::Commit;
use crate::consensus::messages::{DbStateMissing, DirectoryBlockSignature, Eom, Message, Payload};
use crate::consensus::state::ConsensusState;
use crate::consensus::types::{short, MINUTES_PER_BLOCK};
use tracing::{debug, info, trace, warn};

impl ConsensusState {
    /// Enables leadership once the configured start delay has passed.
    pub(crate) fn check_start_delay(&mut self) {
        if self.run_leader {
            return;
        }
        let now = self.now_ms();
        if now.saturating_sub(self.start_ms) < self.cfg.start_delay_ms {
            return;
        }
        self.run_leader = true;
        self.refresh_leader(self.current_minute);
        self.new_minute();
        info!(
            height = self.leader_height,
            leader = self.leader,
            vm = self.leader_vm_index,
            "leadership enabled"
        );
    }

    pub(crate) fn refresh_leader(&mut self, minute: u8) {
        let identity = self.key.identity();
        let height = self.leader_height;
        match self.ensure_pl(height).lane_for(&identity, minute) {
            Some(vm) => {
                self.leader = true;
                self.leader_vm_index = vm;
            }
            None => self.leader = false,
        }
    }

    /// Requeues every held message for another validation pass.
    pub(crate) fn new_minute(&mut self) {
        self.prune_pending();
        let held = std::mem::take(&mut self.holding);
        if !held.is_empty() {
            trace!(count = held.len(), "requeueing held messages");
        }
        self.reprocess.extend(held.into_values());
    }

    /// Fills in and signs a timer EOM for this node's lane. `None` when the
    /// node has nothing to close this minute.
    pub(crate) fn stamp_local_eom(&mut self, tick: Message) -> Option<Message> {
        if !self.run_leader || !self.leader || self.saving {
            return None;
        }
        let mut eom = Message::signed_eom(
            &self.key,
            self.leader_height,
            self.current_minute,
            self.leader_vm_index,
            tick.timestamp,
        );
        eom.local = true;
        if !self.leader_eligible(&eom) {
            trace!(minute = self.current_minute, "lane not ready for eom");
            return None;
        }
        Some(eom)
    }

    /// Executes every lane of the current height from its cursor up to the
    /// first gap or blocking entry.
    pub(crate) fn process_leader_list(&mut self) -> Result<bool, FatalError> {
        let height = self.leader_height;
        let lanes = self.ensure_pl(height).lanes();
        let mut progress = false;
        for v in 0..lanes {
            loop {
                if self.leader_height != height {
                    return Ok(progress);
                }
                let Some(vm) = self
                    .process_lists
                    .get_mut(height)
                    .and_then(|pl| pl.vms.get_mut(v))
                else {
                    break;
                };
                let i = vm.height;
                let Some(Some(entry)) = vm.list.get(i) else {
                    break;
                };
                let prev = match i {
                    0 => None,
                    _ => vm.list.get(i - 1).and_then(|e| e.as_ref()).map(|e| &e.ack),
                };
                let intact = entry.ack.message_hash == entry.msg.hash() && entry.ack.follows(prev);
                if !intact {
                    warn!(height, vm = v, position = i, "ack chain broken, slot cleared");
                    vm.list[i] = None;
                    break;
                }
                let msg = entry.msg.clone();
                let processed = entry.processed;

                if !self.process_entry(height, v, i, &msg, processed)? {
                    break;
                }
                if let Some(vm) = self
                    .process_lists
                    .get_mut(height)
                    .and_then(|pl| pl.vms.get_mut(v))
                {
                    if let Some(Some(e)) = vm.list.get_mut(i) {
                        e.processed = true;
                    }
                    vm.height = i + 1;
                }
                progress = true;
            }
        }
        Ok(progress)
    }

    /// True when the entry is done and the cursor may move past it.
    fn process_entry(
        &mut self,
        height: u32,
        v: usize,
        i: usize,
        msg: &Message,
        processed: bool,
    ) -> Result<bool, FatalError> {
        match &msg.payload {
            Payload::Eom(e) => Ok(self.process_eom(height, v, i, e, msg.timestamp, processed)),
            Payload::DirectoryBlockSignature(d) => Ok(self.process_dbsig(d)),
            Payload::CommitChain(c) => {
                self.process_commit(height, Commit::Chain(c.clone()));
                Ok(true)
            }
            Payload::CommitEntry(c) => {
                self.process_commit(height, Commit::Entry(c.clone()));
                Ok(true)
            }
            Payload::RevealEntry(r) => self.process_reveal(height, &r.entry),
            Payload::FactoidTransaction(tx) => {
                self.process_factoid_tx(height, tx);
                Ok(true)
            }
            Payload::AddServer(a) => {
                self.process_add_server(height, a);
                Ok(true)
            }
            Payload::ChangeServerKey(c) => {
                self.process_change_server_key(height, c);
                Ok(true)
            }
            _ => {
                warn!(kind = msg.kind(), height, vm = v, "unordered message kind in lane, skipped");
                Ok(true)
            }
        }
    }

    fn process_eom(&mut self, height: u32, v: usize, i: usize, eom: &Eom, ts: u64, processed: bool) -> bool {
        if eom.db_height < self.leader_height {
            return true;
        }
        if eom.db_height > self.leader_height {
            return false;
        }
        if eom.minute < self.current_minute {
            return true;
        }
        if eom.minute > self.current_minute || processed {
            return false;
        }

        if !self.eom {
            self.eom = true;
            self.eom_done = false;
            self.eom_processed = 0;
        }
        let (closed_lane, fed) = {
            let pl = self.ensure_pl(height);
            let mut closed_lane = false;
            if let Some(vm) = pl.vms.get_mut(v) {
                if !vm.eom {
                    vm.leader_minute = vm.leader_minute.saturating_add(1);
                    vm.eom = true;
                    closed_lane = true;
                }
                if let Some(Some(e)) = vm.list.get_mut(i) {
                    e.processed = true;
                }
            }
            pl.last_eom_ts = pl.last_eom_ts.max(ts);
            (closed_lane, pl.fed_count())
        };
        if closed_lane {
            self.eom_processed += 1;
        }
        debug!(height, minute = eom.minute, vm = v, count = self.eom_processed, "eom processed");

        if self.eom_processed >= fed && !self.eom_done {
            self.eom_done = true;
            let minute = eom.minute;
            let pl = self.ensure_pl(height);
            pl.factoid_block.end_of_period(minute);
            for eb in pl.new_eblocks.values_mut() {
                eb.add_end_of_minute_marker(minute + 1);
            }
            pl.entry_credit_block.add_entry(EcEntry::MinuteNumber(minute + 1));
        }
        false
    }

    fn process_dbsig(&mut self, sig: &DirectoryBlockSignature) -> bool {
        if sig.db_height != self.leader_height {
            return true;
        }
        if self.dbsig_signers.insert(sig.server_identity) {
            self.dbsig_processed += 1;
            debug!(
                height = sig.db_height,
                signer = %short(&sig.server_identity),
                count = self.dbsig_processed,
                "dbsig processed"
            );
        }
        if self.dbsig_processed < self.fed_count() {
            return false;
        }
        let Some(signed) = sig.db_height.checked_sub(1) else {
            return true;
        };
        if signed < self.dbstates.base() {
            return true;
        }
        match self.dbstates.get_mut(signed) {
            Some(s) if s.saved => true,
            Some(s) => {
                s.ready_to_save = true;
                false
            }
            None => false,
        }
    }

    /// Closes the current minute; after the last minute, closes the block.
    pub(crate) fn advance_minute(&mut self) -> Result<(), FatalError> {
        let height = self.leader_height;
        for vm in self.ensure_pl(height).vms.iter_mut() {
            vm.eom = false;
        }
        self.current_minute += 1;
        self.eom = false;
        self.eom_done = false;
        self.eom_processed = 0;
        if self.current_minute < MINUTES_PER_BLOCK {
            debug!(height, minute = self.current_minute, "minute advanced");
            self.refresh_leader(self.current_minute);
            self.new_minute();
            return Ok(());
        }
        self.current_minute = 0;
        self.close_block()
    }

    fn close_block(&mut self) -> Result<(), FatalError> {
        let height = self.leader_height;
        let pl = self.ensure_pl(height);
        let mut directory_block = pl.directory_block.clone();
        directory_block.header.timestamp = pl.last_eom_ts;
        let state = DbState {
            is_new: true,
            locked: false,
            ready_to_save: false,
            saved: false,
            directory_block,
            admin_block: pl.admin_block.clone(),
            factoid_block: pl.factoid_block.clone(),
            entry_credit_block: pl.entry_credit_block.clone(),
            entry_blocks: pl.new_eblocks.values().cloned().collect(),
            entries: pl.new_entries.values().cloned().collect(),
        };
        self.add_db_state(state);
        self.fixup_links(height)?;
        self.process_blocks(height)?;

        self.leader_height = height + 1;
        self.dbsig_processed = 0;
        self.dbsig_signers.clear();
        self.saving = true;
        self.refresh_leader(0);

        let key_mr = self
            .dbstates
            .get(height)
            .filter(|s| !s.is_new)
            .map(|s| s.directory_block.key_mr());
        if let Some(key_mr) = key_mr {
            if self.run_leader && self.leader {
                let dbsig = Message::signed_dbsig(
                    &self.key,
                    height + 1,
                    key_mr,
                    self.leader_vm_index,
                    self.now_ms(),
                );
                self.leader_execute(dbsig);
            }
            info!(height, key_mr = %short(&key_mr), "block closed");
        } else {
            warn!(height, "closed block could not be linked");
        }
        self.save_db_state(height)?;
        Ok(())
    }

    /// Moves the round to a height learned from the network. Leadership waits
    /// until the height below is locked.
    pub(crate) fn jump_to_height(&mut self, height: u32) {
        info!(from = self.leader_height, to = height, "advancing to network height");
        self.leader_height = height;
        self.current_minute = 0;
        self.eom = false;
        self.eom_done = false;
        self.eom_processed = 0;
        self.dbsig_processed = 0;
        self.dbsig_signers.clear();
        self.saving = true;
        self.refresh_leader(0);
        self.new_minute();
    }

    /// Asks peers for heights this node is missing: everything below the
    /// highest height seen that is not yet locked here.
    pub(crate) fn catchup(&mut self) {
        let locked = self.dbstates.highest_locked().unwrap_or(0);
        let need = self
            .highest_seen
            .saturating_sub(1)
            .max(self.leader_height.saturating_sub(1));
        if need <= locked {
            if self.catchup_pending {
                debug!(height = self.leader_height, "caught up");
            }
            self.catchup_pending = false;
            return;
        }
        let now = self.now_ms();
        if let Some(last) = self.last_catchup_ms {
            if now.saturating_sub(last) < self.cfg.catchup_interval_ms {
                return;
            }
        }
        let from = locked + 1;
        let to = need.min(from.saturating_add(self.cfg.max_catchup_heights.saturating_sub(1)));
        info!(from, to, seen = self.highest_seen, "requesting missing heights");
        self.send_outbound(Message::new(
            Payload::DbStateMissing(DbStateMissing {
                from_height: from,
                to_height: to,
            }),
            now,
        ));
        self.last_catchup_ms = Some(now);
        self.catchup_pending = true;
    }
}
