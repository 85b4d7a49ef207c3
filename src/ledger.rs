// Two-tier balance ledger.
// Speculative effects of messages executed during a height go to the transient
// tier; committed blocks are applied to the persisted tier. Reads see the
// transient value when one exists.

use crate::consensus::blocks::{EcEntry, EntryCreditBlock, FactoidBlock};
use crate::consensus::types::{Hash, PublicKey};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Clone, Debug, Default)]
struct Balances {
    factoid: HashMap<Hash, i64>,
    ec: HashMap<PublicKey, i64>,
}

#[derive(Debug)]
pub struct BalanceLedger {
    persisted: Mutex<Balances>,
    transient: Mutex<Balances>,
    exchange_rate: u64,
    pending_exchange_rate: Option<u64>,
}

fn guard(m: &Mutex<Balances>) -> MutexGuard<'_, Balances> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl BalanceLedger {
    pub fn new(exchange_rate: u64) -> Self {
        Self {
            persisted: Mutex::new(Balances::default()),
            transient: Mutex::new(Balances::default()),
            exchange_rate: exchange_rate.max(1),
            pending_exchange_rate: None,
        }
    }

    pub fn factoid_balance(&self, address: &Hash) -> i64 {
        if let Some(v) = guard(&self.transient).factoid.get(address) {
            return *v;
        }
        guard(&self.persisted).factoid.get(address).copied().unwrap_or(0)
    }

    pub fn ec_balance(&self, key: &PublicKey) -> i64 {
        if let Some(v) = guard(&self.transient).ec.get(key) {
            return *v;
        }
        guard(&self.persisted).ec.get(key).copied().unwrap_or(0)
    }

    /// Speculative factoid change.
    pub fn adjust_factoid(&self, address: &Hash, delta: i64) {
        let current = self.factoid_balance(address);
        guard(&self.transient)
            .factoid
            .insert(*address, current.saturating_add(delta));
    }

    /// Speculative entry-credit change.
    pub fn adjust_ec(&self, key: &PublicKey, delta: i64) {
        let current = self.ec_balance(key);
        guard(&self.transient)
            .ec
            .insert(*key, current.saturating_add(delta));
    }

    /// Drops every speculative change.
    pub fn discard(&self) {
        *guard(&self.transient) = Balances::default();
    }

    pub fn apply_factoid_block(&self, block: &FactoidBlock) {
        let mut p = guard(&self.persisted);
        for tx in &block.transactions {
            for input in &tx.inputs {
                let b = p.factoid.entry(input.address).or_insert(0);
                *b = b.saturating_sub(input.amount as i64);
            }
            for output in &tx.outputs {
                let b = p.factoid.entry(output.address).or_insert(0);
                *b = b.saturating_add(output.amount as i64);
            }
        }
    }

    pub fn apply_ec_block(&self, block: &EntryCreditBlock) {
        let mut p = guard(&self.persisted);
        for entry in &block.body {
            let (key, delta) = match entry {
                EcEntry::IncreaseBalance(inc) => (inc.ec_pubkey, inc.num_ec as i64),
                EcEntry::CommitChain(c) => (c.ec_pubkey, -(c.credits as i64)),
                EcEntry::CommitEntry(c) => (c.ec_pubkey, -(c.credits as i64)),
                EcEntry::MinuteNumber(_) => continue,
            };
            let b = p.ec.entry(key).or_insert(0);
            *b = b.saturating_add(delta);
        }
    }

    pub fn exchange_rate(&self) -> u64 {
        self.exchange_rate
    }

    /// Takes effect at the next end of block.
    pub fn schedule_exchange_rate(&mut self, factoshis_per_ec: u64) {
        self.pending_exchange_rate = Some(factoshis_per_ec.max(1));
    }

    pub fn process_end_of_block(&mut self) {
        if let Some(rate) = self.pending_exchange_rate.take() {
            self.exchange_rate = rate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::blocks::{CommitEntry, FactoidTransaction, IncreaseBalance, TxIo};

    #[test]
    fn transient_overlays_persisted() {
        let ledger = BalanceLedger::new(1000);
        let addr = [1u8; 32];
        let mut fb = FactoidBlock::new(0, 1000);
        fb.add_transaction(FactoidTransaction {
            milli_timestamp: 0,
            inputs: vec![],
            outputs: vec![TxIo { address: addr, amount: 50 }],
            ec_outputs: vec![],
            signatures: vec![],
        });
        ledger.apply_factoid_block(&fb);
        assert_eq!(ledger.factoid_balance(&addr), 50);

        ledger.adjust_factoid(&addr, -20);
        assert_eq!(ledger.factoid_balance(&addr), 30);
        ledger.discard();
        assert_eq!(ledger.factoid_balance(&addr), 50);

        ledger.adjust_factoid(&addr, -20);
        ledger.apply_factoid_block(&fb);
        assert_eq!(ledger.factoid_balance(&addr), 30);
        ledger.discard();
        assert_eq!(ledger.factoid_balance(&addr), 100);
    }

    #[test]
    fn ec_block_credits_and_debits() {
        let ledger = BalanceLedger::new(1000);
        let key = [7u8; 32];
        let mut ec = EntryCreditBlock::new(1);
        ec.add_entry(EcEntry::IncreaseBalance(IncreaseBalance {
            ec_pubkey: key,
            txid: [0u8; 32],
            index: 0,
            num_ec: 10,
        }));
        ec.add_entry(EcEntry::CommitEntry(CommitEntry {
            milli_time: 0,
            entry_hash: [2u8; 32],
            credits: 3,
            ec_pubkey: key,
            signature: String::new(),
        }));
        ec.add_entry(EcEntry::MinuteNumber(1));
        ledger.apply_ec_block(&ec);
        assert_eq!(ledger.ec_balance(&key), 7);
    }

    #[test]
    fn exchange_rate_changes_at_end_of_block() {
        let mut ledger = BalanceLedger::new(1000);
        ledger.schedule_exchange_rate(2000);
        assert_eq!(ledger.exchange_rate(), 1000);
        ledger.process_end_of_block();
        assert_eq!(ledger.exchange_rate(), 2000);
        ledger.process_end_of_block();
        assert_eq!(ledger.exchange_rate(), 2000);
    }
}
