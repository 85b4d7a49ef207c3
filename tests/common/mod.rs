#![allow(dead_code)]

use fedchain_core::clock::ManualClock;
use fedchain_core::consensus::config::{BalanceConfig, ConsensusConfig, GenesisConfig, ServerConfig};
use fedchain_core::consensus::messages::{Message, Payload};
use fedchain_core::consensus::storage::{MemoryStore, SharedStore};
use fedchain_core::validation::NodeKey;
use fedchain_core::{ConsensusState, QueueHandles};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const T0: u64 = 1_700_000_000_000;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub fn key(seed: u8) -> NodeKey {
    NodeKey::from_secret(&[seed; 32]).expect("key")
}

fn server(key: &NodeKey, name: &str) -> ServerConfig {
    ServerConfig {
        pubkey_hex: hex::encode(key.public()),
        name: name.to_string(),
    }
}

pub struct GenesisBuilder {
    genesis: GenesisConfig,
}

impl GenesisBuilder {
    pub fn new(fed: &[&NodeKey]) -> Self {
        Self {
            genesis: GenesisConfig {
                network_id: "test".to_string(),
                federated_servers: fed
                    .iter()
                    .enumerate()
                    .map(|(i, k)| server(k, &format!("fed{}", i)))
                    .collect(),
                audit_servers: Vec::new(),
                factoid_balances: Vec::new(),
                entry_credit_balances: Vec::new(),
                consensus: ConsensusConfig::default(),
            },
        }
    }

    pub fn audit(mut self, key: &NodeKey) -> Self {
        let name = format!("audit{}", self.genesis.audit_servers.len());
        self.genesis.audit_servers.push(server(key, &name));
        self
    }

    pub fn factoids(mut self, address: [u8; 32], amount: u64) -> Self {
        self.genesis.factoid_balances.push(BalanceConfig {
            address_hex: hex::encode(address),
            amount,
        });
        self
    }

    pub fn entry_credits(mut self, ec_pubkey: [u8; 32], amount: u64) -> Self {
        self.genesis.entry_credit_balances.push(BalanceConfig {
            address_hex: hex::encode(ec_pubkey),
            amount,
        });
        self
    }

    pub fn build(self) -> GenesisConfig {
        self.genesis
    }
}

pub struct Harness {
    pub state: ConsensusState,
    pub queues: QueueHandles,
    pub clock: ManualClock,
    pub store: Arc<Mutex<MemoryStore>>,
}

impl Harness {
    pub fn start(genesis: &GenesisConfig, key: NodeKey) -> Self {
        Self::start_with_store(genesis, key, MemoryStore::shared())
    }

    pub fn start_with_store(genesis: &GenesisConfig, key: NodeKey, store: Arc<Mutex<MemoryStore>>) -> Self {
        init_tracing();
        let clock = ManualClock::new(T0);
        let shared: SharedStore = store.clone();
        let (state, queues) =
            ConsensusState::new(genesis, key, shared, Arc::new(clock.clone())).expect("start");
        Self {
            state,
            queues,
            clock,
            store,
        }
    }

    pub fn now(&self) -> u64 {
        use fedchain_core::clock::Clock;
        self.clock.now_ms()
    }

    /// Moves past the start delay so the node may lead.
    pub fn go_live(&mut self) {
        let delay = ConsensusConfig::default().start_delay_ms;
        self.clock.advance(Duration::from_millis(delay + 1));
        self.step();
    }

    pub fn step(&mut self) {
        self.state.step().expect("step");
    }

    pub fn submit(&mut self, msg: Message) {
        self.queues.msg_tx.send(msg).expect("msg queue");
        self.step();
    }

    pub fn submit_ack(&mut self, msg: Message) {
        self.queues.ack_tx.send(msg).expect("ack queue");
        self.step();
    }

    pub fn tick_eom(&mut self) {
        self.clock.advance(Duration::from_millis(100));
        let now = self.now();
        self.submit(Message::local_eom(now));
    }

    /// Ticks ten minutes, closing the current block.
    pub fn close_block(&mut self) {
        for _ in 0..10 {
            self.tick_eom();
        }
    }

    pub fn outbound(&self) -> Vec<Message> {
        self.queues.outbound_rx.try_iter().collect()
    }

    pub fn invalid(&self) -> Vec<Message> {
        self.queues.invalid_rx.try_iter().collect()
    }

    pub fn batches_committed(&self) -> u64 {
        self.store.lock().expect("store").batches_committed()
    }
}

/// Hands one node's outbound traffic to the other until both go quiet.
/// Acks go to the ack queue, everything else to the message queue.
pub fn relay(a: &mut Harness, b: &mut Harness) -> usize {
    let mut delivered = 0;
    for _ in 0..100 {
        let from_a = a.outbound();
        let from_b = b.outbound();
        if from_a.is_empty() && from_b.is_empty() {
            return delivered;
        }
        delivered += from_a.len() + from_b.len();
        for m in from_a {
            b.deliver(m);
        }
        for m in from_b {
            a.deliver(m);
        }
    }
    panic!("relay did not settle");
}

impl Harness {
    pub fn deliver(&mut self, msg: Message) {
        match msg.payload {
            Payload::Ack(_) => self.submit_ack(msg),
            _ => self.submit(msg),
        }
    }
}
