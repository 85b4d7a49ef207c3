//! Per-height block bundles and the pipeline that links, applies and saves them.
//!
//! Each height moves through three stages in order: `fixup_links` (local
//! states only), `process_blocks` (sets `locked`), `save_db_state` (sets
//! `saved`, needs `ready_to_save`). Stages are idempotent and run strictly in
//! ascending height; an empty slot stops the pass.

use crate::consensus::blocks::{
    AdminBlock, AdminEntry, DirectoryBlock, EcEntry, Entry, EntryBlock, EntryCreditBlock,
    FactoidBlock, FactoidTransaction, IncreaseBalance, TxIo, ADMIN_SLOT, EC_SLOT, FACTOID_SLOT,
};
use crate::consensus::error::FatalError;
use crate::consensus::messages::DbStateMsg;
use crate::consensus::state::{ConsensusState, ServerKeys};
use crate::consensus::storage::StoredHeight;
use crate::consensus::types::{short, Hash, PublicKey, Server, ZERO_HASH};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct DbState {
    /// Built locally and not yet linked to its predecessor.
    pub is_new: bool,
    pub locked: bool,
    pub ready_to_save: bool,
    pub saved: bool,
    pub directory_block: DirectoryBlock,
    pub admin_block: AdminBlock,
    pub factoid_block: FactoidBlock,
    pub entry_credit_block: EntryCreditBlock,
    pub entry_blocks: Vec<EntryBlock>,
    pub entries: Vec<Entry>,
}

impl DbState {
    pub fn height(&self) -> u32 {
        self.directory_block.db_height()
    }

    pub fn genesis(
        factoid_balances: &[(Hash, u64)],
        ec_balances: &[(PublicKey, u64)],
        exchange_rate: u64,
    ) -> Self {
        let mut fb = FactoidBlock::new(0, exchange_rate);
        if !factoid_balances.is_empty() {
            fb.add_transaction(FactoidTransaction {
                milli_timestamp: 0,
                inputs: Vec::new(),
                outputs: factoid_balances
                    .iter()
                    .map(|(address, amount)| TxIo {
                        address: *address,
                        amount: *amount,
                    })
                    .collect(),
                ec_outputs: Vec::new(),
                signatures: Vec::new(),
            });
        }
        let mut ec = EntryCreditBlock::new(0);
        for (i, (key, num_ec)) in ec_balances.iter().enumerate() {
            ec.add_entry(EcEntry::IncreaseBalance(IncreaseBalance {
                ec_pubkey: *key,
                txid: ZERO_HASH,
                index: i as u64,
                num_ec: *num_ec,
            }));
        }
        Self {
            is_new: true,
            locked: false,
            ready_to_save: true,
            saved: false,
            directory_block: DirectoryBlock::new(0),
            admin_block: AdminBlock::new(0),
            factoid_block: fb,
            entry_credit_block: ec,
            entry_blocks: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// A height received from the network: already linked and signed off.
    pub fn from_network(msg: DbStateMsg) -> Self {
        Self {
            is_new: false,
            locked: false,
            ready_to_save: true,
            saved: false,
            directory_block: msg.directory_block,
            admin_block: msg.admin_block,
            factoid_block: msg.factoid_block,
            entry_credit_block: msg.entry_credit_block,
            entry_blocks: msg.entry_blocks,
            entries: msg.entries,
        }
    }

    /// A height reloaded from storage.
    pub fn restored(stored: StoredHeight) -> Self {
        Self {
            is_new: false,
            locked: true,
            ready_to_save: true,
            saved: true,
            directory_block: stored.directory_block,
            admin_block: stored.admin_block,
            factoid_block: stored.factoid_block,
            entry_credit_block: stored.entry_credit_block,
            entry_blocks: stored.entry_blocks,
            entries: stored.entries,
        }
    }
}

impl From<StoredHeight> for DbStateMsg {
    fn from(s: StoredHeight) -> Self {
        DbStateMsg {
            directory_block: s.directory_block,
            admin_block: s.admin_block,
            factoid_block: s.factoid_block,
            entry_credit_block: s.entry_credit_block,
            entry_blocks: s.entry_blocks,
            entries: s.entries,
        }
    }
}

/// Sparse window of states; slot `i` holds height `base + i`.
#[derive(Debug)]
pub struct DbStateList {
    base: u32,
    complete: u32,
    keep: usize,
    states: Vec<Option<DbState>>,
}

impl DbStateList {
    pub fn new(keep: usize) -> Self {
        Self::starting_at(0, keep)
    }

    pub fn starting_at(base: u32, keep: usize) -> Self {
        Self {
            base,
            complete: base,
            keep: keep.max(1),
            states: Vec::new(),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Highest height whose blocks have been applied.
    pub fn complete(&self) -> u32 {
        self.complete
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn index(&self, height: u32) -> Option<usize> {
        height.checked_sub(self.base).map(|i| i as usize)
    }

    pub fn get(&self, height: u32) -> Option<&DbState> {
        self.states.get(self.index(height)?)?.as_ref()
    }

    pub fn get_mut(&mut self, height: u32) -> Option<&mut DbState> {
        let i = self.index(height)?;
        self.states.get_mut(i)?.as_mut()
    }

    /// Stores a state in its slot. Heights below the window or slots already
    /// holding a saved state are left alone.
    pub fn put(&mut self, state: DbState) -> bool {
        let Some(i) = self.index(state.height()) else {
            return false;
        };
        if self.states.len() <= i {
            self.states.resize_with(i + 1, || None);
        }
        if matches!(&self.states[i], Some(s) if s.saved) {
            return false;
        }
        self.states[i] = Some(state);
        true
    }

    pub(crate) fn mark_locked(&mut self, height: u32) {
        if let Some(s) = self.get_mut(height) {
            s.locked = true;
        }
        self.complete = self.complete.max(height);
    }

    /// Drops leading saved states beyond the retention count.
    pub fn trim(&mut self) -> usize {
        let leading_saved = self
            .states
            .iter()
            .take_while(|s| matches!(s, Some(s) if s.saved))
            .count();
        if leading_saved <= self.keep {
            return 0;
        }
        let drop = leading_saved - self.keep;
        self.states.drain(..drop);
        self.base += drop as u32;
        drop
    }

    fn highest_where(&self, pred: impl Fn(&DbState) -> bool) -> Option<u32> {
        self.states
            .iter()
            .rev()
            .flatten()
            .find(|s| pred(s))
            .map(|s| s.height())
    }

    pub fn highest_locked(&self) -> Option<u32> {
        self.highest_where(|s| s.locked)
    }

    pub fn highest_saved(&self) -> Option<u32> {
        self.highest_where(|s| s.saved)
    }

    pub fn highest(&self) -> Option<u32> {
        self.highest_where(|_| true)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DbState> {
        self.states.iter().flatten()
    }
}

impl ConsensusState {
    /// Adds a state to the window. A network copy of a locally locked height
    /// with the same key MR marks the local state ready to save.
    pub(crate) fn add_db_state(&mut self, state: DbState) -> bool {
        let height = state.height();
        if let Some(existing) = self.dbstates.get_mut(height) {
            if !state.is_new
                && existing.locked
                && !existing.saved
                && existing.directory_block.key_mr() == state.directory_block.key_mr()
            {
                existing.ready_to_save = true;
                return true;
            }
            debug!(height, "dbstate already present");
            return false;
        }
        let added = self.dbstates.put(state);
        if added {
            debug!(height, "dbstate added");
        }
        added
    }

    pub(crate) fn fixup_links(&mut self, height: u32) -> Result<bool, FatalError> {
        match self.dbstates.get(height) {
            Some(s) if s.is_new => {}
            _ => return Ok(false),
        }
        let prev = if height > 0 {
            let Some(p) = self.dbstates.get(height - 1) else {
                return Ok(false);
            };
            Some((
                p.directory_block.key_mr(),
                p.directory_block.full_hash(),
                p.admin_block.full_hash(),
                p.entry_credit_block.header_hash(),
                p.entry_credit_block.full_hash(),
                p.factoid_block.key_mr(),
                p.factoid_block.full_hash(),
            ))
        } else {
            None
        };

        let Some(s) = self.dbstates.get_mut(height) else {
            return Ok(false);
        };
        if let Some((d_kmr, d_full, a_full, ec_head, ec_full, f_kmr, f_full)) = prev {
            s.directory_block.header.prev_key_mr = d_kmr;
            s.directory_block.header.prev_full_hash = d_full;
            s.admin_block.header.prev_full_hash = a_full;
            s.entry_credit_block.header.prev_header_hash = ec_head;
            s.entry_credit_block.header.prev_full_hash = ec_full;
            s.factoid_block.prev_key_mr = f_kmr;
            s.factoid_block.prev_full_hash = f_full;
        }
        s.directory_block
            .set_sub_block(ADMIN_SLOT, s.admin_block.key_mr());
        s.directory_block
            .set_sub_block(EC_SLOT, s.entry_credit_block.header_hash());
        s.directory_block
            .set_sub_block(FACTOID_SLOT, s.factoid_block.key_mr());
        for eb in &s.entry_blocks {
            s.directory_block.add_entry(eb.chain_id(), eb.key_mr());
        }
        s.directory_block
            .build_body_mr()
            .map_err(|source| FatalError::Integrity { height, source })?;
        s.is_new = false;
        debug!(height, key_mr = %short(&s.directory_block.key_mr()), "dbstate linked");
        Ok(true)
    }

    pub(crate) fn process_blocks(&mut self, height: u32) -> Result<bool, FatalError> {
        let admin = match self.dbstates.get(height) {
            Some(s) if !s.locked && !s.is_new => s.admin_block.clone(),
            _ => return Ok(false),
        };
        if height > self.dbstates.base() {
            match self.dbstates.get(height - 1) {
                Some(p) if p.locked => {}
                _ => return Ok(false),
            }
        }

        self.apply_admin_block(&admin);
        self.ledger.discard();
        if let Some(s) = self.dbstates.get(height) {
            self.ledger.apply_factoid_block(&s.factoid_block);
            self.ledger.apply_ec_block(&s.entry_credit_block);
        }
        self.ledger.process_end_of_block();
        self.dbstates.mark_locked(height);
        info!(height, "dbstate locked");
        Ok(true)
    }

    pub(crate) fn save_db_state(&mut self, height: u32) -> Result<bool, FatalError> {
        match self.dbstates.get(height) {
            Some(s) if !s.saved && s.ready_to_save && s.locked => {}
            _ => return Ok(false),
        }
        if height > self.dbstates.base() {
            match self.dbstates.get(height - 1) {
                Some(p) if p.saved => {}
                _ => return Ok(false),
            }
        }

        let trim_now = self.cfg.trim_interval > 0
            && (height as u64 + self.key.identity()[0] as u64) % self.cfg.trim_interval == 0;
        let Some(s) = self.dbstates.get(height) else {
            return Ok(false);
        };
        let key_mr = s.directory_block.key_mr();
        {
            let mut store = self
                .store
                .lock()
                .map_err(|_| FatalError::Poisoned("storage"))?;
            let fail = FatalError::storage;
            if trim_now {
                store.trim().map_err(fail(height))?;
                debug!(height, "storage trimmed");
            }
            store.start_multi_batch();
            store.process_ablock_multi_batch(&s.admin_block).map_err(fail(height))?;
            store.process_fblock_multi_batch(&s.factoid_block).map_err(fail(height))?;
            store
                .process_ecblock_multi_batch(&s.entry_credit_block)
                .map_err(fail(height))?;
            for eb in &s.entry_blocks {
                store.process_eblock_multi_batch(eb).map_err(fail(height))?;
            }
            for e in &s.entries {
                store.insert_entry(e).map_err(fail(height))?;
            }
            store
                .process_dblock_multi_batch(&s.directory_block)
                .map_err(fail(height))?;
            store.execute_multi_batch().map_err(fail(height))?;

            if store.fetch_dblock_by_key_mr(&key_mr).map_err(fail(height))?.is_none() {
                return Err(FatalError::MissingAfterSave {
                    height,
                    key_mr: hex::encode(key_mr),
                });
            }
        }
        if let Some(s) = self.dbstates.get_mut(height) {
            s.saved = true;
        }
        info!(height, key_mr = %short(&key_mr), "dbstate saved");
        Ok(true)
    }

    /// One pass over the window in ascending height.
    pub(crate) fn update_dbstates(&mut self) -> Result<bool, FatalError> {
        let mut progress = false;
        let base = self.dbstates.base();
        let top = base + self.dbstates.len() as u32;
        for height in base..top {
            if self.dbstates.get(height).is_none() {
                break;
            }
            progress |= self.fixup_links(height)?;
            progress |= self.process_blocks(height)?;
            progress |= self.save_db_state(height)?;
        }
        if self.dbstates.trim() > 0 {
            let retired = self.process_lists.retire_below(self.dbstates.base());
            debug!(base = self.dbstates.base(), retired, "dbstate window trimmed");
        }
        Ok(progress)
    }

    /// Applies server-set and key changes to the live state.
    pub(crate) fn apply_admin_block(&mut self, admin: &AdminBlock) {
        for entry in &admin.entries {
            match entry {
                AdminEntry::AddFederatedServer { chain_id, .. } => {
                    if self.fed_servers.iter().any(|s| &s.chain_id == chain_id) {
                        continue;
                    }
                    let server = match self.audit_servers.iter().position(|s| &s.chain_id == chain_id) {
                        Some(pos) => self.audit_servers.remove(pos),
                        None => placeholder_server(chain_id),
                    };
                    info!(server = %short(chain_id), "federated server added");
                    self.fed_servers.push(server);
                }
                AdminEntry::AddAuditServer { chain_id, .. } => {
                    let known = self
                        .fed_servers
                        .iter()
                        .chain(self.audit_servers.iter())
                        .any(|s| &s.chain_id == chain_id);
                    if !known {
                        info!(server = %short(chain_id), "audit server added");
                        self.audit_servers.push(placeholder_server(chain_id));
                    }
                }
                AdminEntry::RemoveFederatedServer { chain_id, .. } => {
                    if self.fed_servers.len() > 1 {
                        self.fed_servers.retain(|s| &s.chain_id != chain_id);
                    } else {
                        warn!(server = %short(chain_id), "refusing to remove last federated server");
                    }
                }
                AdminEntry::AddFederatedServerSigningKey { chain_id, pubkey } => {
                    for s in self
                        .fed_servers
                        .iter_mut()
                        .chain(self.audit_servers.iter_mut())
                        .filter(|s| &s.chain_id == chain_id)
                    {
                        s.pubkey = *pubkey;
                    }
                }
                AdminEntry::AddFederatedServerBitcoinAnchorKey {
                    chain_id,
                    priority,
                    key_type,
                    key,
                } => {
                    let keys: &mut ServerKeys = self.key_registry.entry(*chain_id).or_default();
                    keys.bitcoin_anchor_keys.retain(|(p, _, _)| p != priority);
                    keys.bitcoin_anchor_keys.push((*priority, *key_type, *key));
                }
                AdminEntry::AddMatryoshkaHash { chain_id, mhash } => {
                    self.key_registry.entry(*chain_id).or_default().matryoshka_hash = Some(*mhash);
                }
            }
        }
    }
}

fn placeholder_server(chain_id: &Hash) -> Server {
    Server {
        chain_id: *chain_id,
        pubkey: ZERO_HASH,
        name: short(chain_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_at(height: u32) -> DbState {
        let mut s = DbState::genesis(&[], &[], 1000);
        s.directory_block = DirectoryBlock::new(height);
        s
    }

    #[test]
    fn put_respects_window() {
        let mut list = DbStateList::starting_at(5, 2);
        assert!(!list.put(state_at(4)));
        assert!(list.put(state_at(7)));
        assert_eq!(list.len(), 3);
        assert!(list.get(5).is_none());
        assert!(list.get(7).is_some());
        assert_eq!(list.highest(), Some(7));
    }

    #[test]
    fn saved_slots_are_not_overwritten() {
        let mut list = DbStateList::new(2);
        let mut s = state_at(0);
        s.saved = true;
        assert!(list.put(s));
        assert!(!list.put(state_at(0)));
        assert!(list.get(0).map(|s| s.saved).unwrap_or(false));
    }

    #[test]
    fn trim_keeps_recent_saved_states() {
        let mut list = DbStateList::new(2);
        for h in 0..5 {
            let mut s = state_at(h);
            s.saved = h < 4;
            list.put(s);
        }
        assert_eq!(list.trim(), 2);
        assert_eq!(list.base(), 2);
        assert!(list.get(1).is_none());
        assert!(list.get(2).is_some());
        assert_eq!(list.trim(), 0);
    }

    #[test]
    fn mark_locked_advances_complete() {
        let mut list = DbStateList::new(2);
        list.put(state_at(0));
        list.put(state_at(1));
        list.mark_locked(1);
        list.mark_locked(0);
        assert_eq!(list.complete(), 1);
        assert_eq!(list.highest_locked(), Some(1));
        assert_eq!(list.highest_saved(), None);
    }
}
