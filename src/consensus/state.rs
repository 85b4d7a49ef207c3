use crate::clock::Clock;
use crate::consensus::ack::Ack;
use crate::consensus::config::{ConsensusConfig, GenesisConfig};
use crate::consensus::dbstate::{DbState, DbStateList};
use crate::consensus::error::{ConfigError, FatalError, StartError};
use crate::consensus::execute::Commit;
use crate::consensus::messages::Message;
use crate::consensus::process_list::{ProcessList, ProcessListSet};
use crate::consensus::storage::SharedStore;
use crate::consensus::types::{short, Hash, IdentityChainId, PublicKey, Server};
use crate::ledger::BalanceLedger;
use crate::replay::ReplayWindow;
use crate::validation::NodeKey;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use tracing::{debug, info};

/// Keys registered for a server beyond its signing key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerKeys {
    pub bitcoin_anchor_keys: Vec<(u8, u8, [u8; 20])>,
    pub matryoshka_hash: Option<Hash>,
}

/// The producer and consumer ends of the core's queues.
pub struct QueueHandles {
    pub ack_tx: SyncSender<Message>,
    pub msg_tx: SyncSender<Message>,
    /// Messages and acks for the network.
    pub outbound_rx: Receiver<Message>,
    /// Messages that failed validation.
    pub invalid_rx: Receiver<Message>,
}

/// Everything one node knows about consensus. `step` must not be called
/// concurrently; the replay window is the only piece shared outward.
pub struct ConsensusState {
    pub(crate) cfg: ConsensusConfig,
    pub(crate) network_id: String,
    pub(crate) key: NodeKey,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) store: SharedStore,
    pub(crate) replay: Arc<ReplayWindow>,
    pub(crate) ledger: BalanceLedger,
    pub(crate) process_lists: ProcessListSet,
    pub(crate) dbstates: DbStateList,
    pub(crate) fed_servers: Vec<Server>,
    pub(crate) audit_servers: Vec<Server>,
    pub(crate) key_registry: HashMap<IdentityChainId, ServerKeys>,

    pub(crate) leader_height: u32,
    pub(crate) current_minute: u8,
    pub(crate) eom: bool,
    pub(crate) eom_done: bool,
    pub(crate) eom_processed: usize,
    pub(crate) saving: bool,
    pub(crate) dbsig_processed: usize,
    pub(crate) dbsig_signers: HashSet<IdentityChainId>,
    pub(crate) run_leader: bool,
    pub(crate) leader: bool,
    pub(crate) leader_vm_index: usize,
    pub(crate) start_ms: u64,

    pub(crate) highest_seen: u32,
    pub(crate) last_catchup_ms: Option<u64>,
    pub(crate) catchup_pending: bool,

    pub(crate) holding: BTreeMap<Hash, Message>,
    /// Acks waiting for their message, by message hash.
    pub(crate) acks: HashMap<Hash, Ack>,
    pub(crate) commits: HashMap<Hash, VecDeque<Commit>>,
    pub(crate) reprocess: VecDeque<Message>,

    pub(crate) ack_rx: Receiver<Message>,
    pub(crate) msg_rx: Receiver<Message>,
    pub(crate) outbound: Sender<Message>,
    pub(crate) invalid: Sender<Message>,
}

impl ConsensusState {
    pub fn new(
        genesis: &GenesisConfig,
        key: NodeKey,
        store: SharedStore,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, QueueHandles), StartError> {
        let fed_servers = genesis.fed_servers()?;
        let audit_servers = genesis.audit_servers()?;
        let identity = key.identity();
        let known = fed_servers
            .iter()
            .chain(audit_servers.iter())
            .any(|s| s.chain_id == identity);
        if !known {
            return Err(ConfigError::UnknownNode.into());
        }
        let cfg = genesis.consensus.clone();

        let (ack_tx, ack_rx) = mpsc::sync_channel(cfg.ack_queue_capacity);
        let (msg_tx, msg_rx) = mpsc::sync_channel(cfg.msg_queue_capacity);
        let (outbound, outbound_rx) = mpsc::channel();
        let (invalid, invalid_rx) = mpsc::channel();
        let start_ms = clock.now_ms();

        let mut state = Self {
            ledger: BalanceLedger::new(cfg.factoshis_per_ec),
            dbstates: DbStateList::new(cfg.dbstate_keep),
            cfg,
            network_id: genesis.network_id.clone(),
            key,
            clock,
            store,
            replay: Arc::new(ReplayWindow::new()),
            process_lists: ProcessListSet::new(),
            fed_servers,
            audit_servers,
            key_registry: HashMap::new(),
            leader_height: 1,
            current_minute: 0,
            eom: false,
            eom_done: false,
            eom_processed: 0,
            saving: false,
            dbsig_processed: 0,
            dbsig_signers: HashSet::new(),
            run_leader: false,
            leader: false,
            leader_vm_index: 0,
            start_ms,
            highest_seen: 0,
            last_catchup_ms: None,
            catchup_pending: false,
            holding: BTreeMap::new(),
            acks: HashMap::new(),
            commits: HashMap::new(),
            reprocess: VecDeque::new(),
            ack_rx,
            msg_rx,
            outbound,
            invalid,
        };
        state.restore_from_store(genesis)?;
        state.refresh_leader(0);
        info!(
            network = %state.network_id,
            identity = %short(&identity),
            height = state.leader_height,
            "consensus state ready"
        );
        Ok((
            state,
            QueueHandles {
                ack_tx,
                msg_tx,
                outbound_rx,
                invalid_rx,
            },
        ))
    }

    /// Reloads every saved height, or writes the genesis height on a fresh store.
    fn restore_from_store(&mut self, genesis: &GenesisConfig) -> Result<(), StartError> {
        let store = self.store.clone();
        let top = {
            let guard = store.lock().map_err(|_| FatalError::Poisoned("storage"))?;
            guard.highest_saved_height().map_err(FatalError::storage(0))?
        };

        let Some(top) = top else {
            let state = DbState::genesis(
                &genesis.factoid_balances()?,
                &genesis.entry_credit_balances()?,
                self.cfg.factoshis_per_ec,
            );
            self.add_db_state(state);
            self.update_dbstates()?;
            if !self.dbstates.get(0).map(|s| s.saved).unwrap_or(false) {
                return Err(FatalError::Corrupt("genesis height was not saved".into()).into());
            }
            self.leader_height = 1;
            return Ok(());
        };

        let guard = store.lock().map_err(|_| FatalError::Poisoned("storage"))?;
        let mut prev_key_mr: Option<Hash> = None;
        let mut last = None;
        for height in 0..=top {
            let stored = guard
                .fetch_height(height)
                .map_err(FatalError::storage(height))?
                .ok_or_else(|| FatalError::Corrupt(format!("height {} missing from storage", height)))?;
            if let Some(prev) = prev_key_mr {
                if stored.directory_block.header.prev_key_mr != prev {
                    return Err(FatalError::Corrupt(format!(
                        "directory block {} does not link to {}",
                        height,
                        short(&prev)
                    ))
                    .into());
                }
            }
            self.apply_admin_block(&stored.admin_block);
            self.ledger.apply_factoid_block(&stored.factoid_block);
            self.ledger.apply_ec_block(&stored.entry_credit_block);
            self.ledger.process_end_of_block();
            prev_key_mr = Some(stored.directory_block.key_mr());
            last = Some(stored);
        }
        drop(guard);

        self.dbstates = DbStateList::starting_at(top, self.cfg.dbstate_keep);
        if let Some(stored) = last {
            self.dbstates.put(DbState::restored(stored));
            self.dbstates.mark_locked(top);
        }
        self.leader_height = top + 1;
        info!(height = top, "restored chain from storage");
        Ok(())
    }

    /// One cooperative consensus step.
    pub fn step(&mut self) -> Result<bool, FatalError> {
        self.check_start_delay();
        let mut progress = self.process_queues()?;
        progress |= self.drain_progress()?;
        self.catchup();
        Ok(progress)
    }

    /// Runs `update_state` until it reports no progress or the budget is spent.
    pub(crate) fn drain_progress(&mut self) -> Result<bool, FatalError> {
        let mut progress = false;
        for _ in 0..self.cfg.progress_budget {
            if !self.update_state()? {
                break;
            }
            progress = true;
        }
        Ok(progress)
    }

    pub(crate) fn update_state(&mut self) -> Result<bool, FatalError> {
        let mut progress = false;
        if self.saving {
            let prev_locked = match self.leader_height.checked_sub(1) {
                None => true,
                Some(h) if h < self.dbstates.base() => true,
                Some(h) => self.dbstates.get(h).map(|s| s.locked).unwrap_or(false),
            };
            if prev_locked {
                self.saving = false;
                self.new_minute();
                progress = true;
            }
        }
        progress |= self.process_leader_list()?;
        progress |= self.update_dbstates()?;
        if self.run_leader && self.eom && self.eom_processed >= self.fed_count() {
            self.advance_minute()?;
            progress = true;
        }
        Ok(progress)
    }

    pub(crate) fn ensure_pl(&mut self, height: u32) -> &mut ProcessList {
        self.process_lists.get_or_create(
            height,
            &self.fed_servers,
            &self.audit_servers,
            self.ledger.exchange_rate(),
        )
    }

    pub(crate) fn fed_count(&self) -> usize {
        self.process_lists
            .get(self.leader_height)
            .map(|pl| pl.fed_count())
            .unwrap_or(self.fed_servers.len())
    }

    pub(crate) fn fed_key(&self, id: &IdentityChainId) -> Option<PublicKey> {
        self.fed_servers
            .iter()
            .find(|s| &s.chain_id == id)
            .map(|s| s.pubkey)
    }

    pub(crate) fn server_key(&self, id: &IdentityChainId) -> Option<PublicKey> {
        self.fed_servers
            .iter()
            .chain(self.audit_servers.iter())
            .find(|s| &s.chain_id == id)
            .map(|s| s.pubkey)
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn send_outbound(&self, msg: Message) {
        if self.outbound.send(msg).is_err() {
            debug!("outbound queue closed");
        }
    }

    pub fn identity(&self) -> IdentityChainId {
        self.key.identity()
    }

    pub fn leader_height(&self) -> u32 {
        self.leader_height
    }

    pub fn current_minute(&self) -> u8 {
        self.current_minute
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub fn leader_vm_index(&self) -> usize {
        self.leader_vm_index
    }

    pub fn is_running_leader(&self) -> bool {
        self.run_leader
    }

    pub fn is_saving(&self) -> bool {
        self.saving
    }

    pub fn catchup_pending(&self) -> bool {
        self.catchup_pending
    }

    pub fn dbstates(&self) -> &DbStateList {
        &self.dbstates
    }

    pub fn process_list(&self, height: u32) -> Option<&ProcessList> {
        self.process_lists.get(height)
    }

    pub fn ledger(&self) -> &BalanceLedger {
        &self.ledger
    }

    pub fn replay(&self) -> Arc<ReplayWindow> {
        Arc::clone(&self.replay)
    }

    pub fn fed_servers(&self) -> &[Server] {
        &self.fed_servers
    }

    pub fn audit_servers(&self) -> &[Server] {
        &self.audit_servers
    }

    pub fn server_keys(&self, id: &IdentityChainId) -> Option<&ServerKeys> {
        self.key_registry.get(id)
    }

    pub fn holding_len(&self) -> usize {
        self.holding.len()
    }

    pub fn is_held(&self, hash: &Hash) -> bool {
        self.holding.contains_key(hash)
    }

    /// Acks held while their message is missing.
    pub fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    pub fn pending_commits(&self, entry_hash: &Hash) -> usize {
        self.commits.get(entry_hash).map(|q| q.len()).unwrap_or(0)
    }

    /// Takes effect when the current block is applied.
    pub fn schedule_exchange_rate(&mut self, factoshis_per_ec: u64) {
        self.ledger.schedule_exchange_rate(factoshis_per_ec);
    }
}
