//! The memory pool of transactions waiting to be mined: admission
//! against the UTXO view and unconfirmed parents, fee policy, conflict
//! sweeping on mined blocks, TTL and size-bound eviction.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use btcd_chainstate::state::Chain;
use btcd_chainstate::utxo::UtxoEntry;
use btcd_chainstate::validation::check_transaction;
use btcd_consensus::constants::{COINBASE_MATURITY, MAX_TX_SIZE};
use btcd_consensus::Hash256;
use btcd_primitives::hash::sha256d;
use btcd_primitives::outpoint::OutPoint;
use btcd_primitives::transaction::Transaction;
use btcd_script::interpreter::ScriptError;
use btcd_script::{verify_script, VERIFY_CLTV, VERIFY_DERSIG, VERIFY_P2SH};
use btcd_storage::KeyValueStore;

/// Unconfirmed transactions are always held to the post-deployment rules.
pub const MEMPOOL_VERIFY_FLAGS: u32 = VERIFY_P2SH | VERIFY_DERSIG | VERIFY_CLTV;

pub const DEFAULT_MIN_FEE: i64 = 1_000;
pub const DEFAULT_MIN_RELAY_FEE_PER_KB: i64 = 1_000;
pub const DEFAULT_MAX_BYTES: usize = 50 * 1024 * 1024;
pub const DEFAULT_TX_TTL_SECS: u64 = 24 * 60 * 60;

/// Where a pool entry came from; local submissions survive fee policy and
/// missing-input checks that relayed transactions do not.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxSource {
    Own,
    UnknownInputs,
    External,
}

#[derive(Clone, Debug)]
pub struct PendingTx {
    pub txid: Hash256,
    pub tx: Transaction,
    pub raw: Vec<u8>,
    pub fee: i64,
    pub volume: i64,
    pub sigops: u32,
    pub first_seen: u64,
    pub source: TxSource,
}

impl PendingTx {
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn fee_rate_per_kb(&self) -> i64 {
        let size = i64::try_from(self.size().max(1)).unwrap_or(i64::MAX);
        self.fee.saturating_mul(1000) / size
    }
}

#[derive(Clone, Debug)]
pub struct MempoolPolicy {
    pub enabled: bool,
    pub min_fee: i64,
    pub min_relay_fee_per_kb: i64,
    pub max_bytes: usize,
    pub tx_ttl_secs: u64,
}

impl Default for MempoolPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_fee: DEFAULT_MIN_FEE,
            min_relay_fee_per_kb: DEFAULT_MIN_RELAY_FEE_PER_KB,
            max_bytes: DEFAULT_MAX_BYTES,
            tx_ttl_secs: DEFAULT_TX_TTL_SECS,
        }
    }
}

#[derive(Debug)]
pub enum MempoolError {
    NotEnabled,
    AlreadyKnown,
    Coinbase,
    Oversize,
    ConflictingInput(OutPoint),
    MissingInputs(Vec<OutPoint>),
    ImmatureInput(OutPoint),
    FeeTooLow { fee: i64, required: i64 },
    Invalid(String),
    Script(ScriptError),
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MempoolError::NotEnabled => write!(f, "transaction pool is disabled"),
            MempoolError::AlreadyKnown => write!(f, "already in the pool"),
            MempoolError::Coinbase => write!(f, "coinbase cannot enter the pool"),
            MempoolError::Oversize => write!(f, "transaction too large"),
            MempoolError::ConflictingInput(outpoint) => write!(
                f,
                "input {}:{} already spent in the pool",
                btcd_consensus::hash_to_hex(&outpoint.hash),
                outpoint.index
            ),
            MempoolError::MissingInputs(missing) => {
                write!(f, "{} unknown input(s)", missing.len())
            }
            MempoolError::ImmatureInput(outpoint) => write!(
                f,
                "coinbase input {}:{} not mature",
                btcd_consensus::hash_to_hex(&outpoint.hash),
                outpoint.index
            ),
            MempoolError::FeeTooLow { fee, required } => {
                write!(f, "fee {fee} below required {required}")
            }
            MempoolError::Invalid(reason) => write!(f, "{reason}"),
            MempoolError::Script(err) => write!(f, "script: {err}"),
        }
    }
}

impl std::error::Error for MempoolError {}

/// The coin lookup the admission path needs from the chain.
pub trait CoinView {
    fn coin(&self, outpoint: &OutPoint) -> Option<UtxoEntry>;
    fn height(&self) -> u32;
}

impl<S: KeyValueStore> CoinView for Chain<S> {
    fn coin(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.utxo_lookup(outpoint).ok().flatten()
    }

    fn height(&self) -> u32 {
        self.tip_height()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Default)]
pub struct Mempool {
    entries: HashMap<Hash256, PendingTx>,
    spent: HashMap<OutPoint, Hash256>,
    total_bytes: usize,
    pub policy: MempoolPolicy,
}

impl Mempool {
    pub fn new(policy: MempoolPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            spent: HashMap::new(),
            total_bytes: 0,
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&PendingTx> {
        self.entries.get(txid)
    }

    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    fn unconfirmed_prevout(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        let parent = self.entries.get(&outpoint.hash)?;
        let output = parent.tx.vout.get(outpoint.index as usize)?;
        Some(UtxoEntry {
            value: output.value,
            script_pubkey: output.script_pubkey.clone(),
            height: u32::MAX,
            is_coinbase: false,
        })
    }

    /// Admission: inputs must resolve against the pool or the UTXO set,
    /// the fee must clear the floor and relay rate, and every input
    /// script must verify under the standard flags. Locally submitted
    /// transactions with unknown inputs are parked instead of dropped.
    pub fn admit<V: CoinView>(
        &mut self,
        view: &V,
        tx: Transaction,
        raw: Vec<u8>,
        source: TxSource,
    ) -> Result<Hash256, MempoolError> {
        if !self.policy.enabled {
            return Err(MempoolError::NotEnabled);
        }
        let txid = sha256d(&raw);
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyKnown);
        }
        if tx.is_coinbase() {
            return Err(MempoolError::Coinbase);
        }
        if raw.len() > MAX_TX_SIZE {
            return Err(MempoolError::Oversize);
        }
        check_transaction(&tx, false)
            .map_err(|reject| MempoolError::Invalid(reject.message))?;

        let next_height = view.height() + 1;
        let mut prevouts: Vec<UtxoEntry> = Vec::with_capacity(tx.vin.len());
        let mut missing: Vec<OutPoint> = Vec::new();
        let mut value_in: i64 = 0;
        for input in &tx.vin {
            if let Some(spender) = self.spent.get(&input.prevout) {
                if *spender != txid {
                    return Err(MempoolError::ConflictingInput(input.prevout));
                }
            }
            let entry = match self.unconfirmed_prevout(&input.prevout) {
                Some(entry) => entry,
                None => match view.coin(&input.prevout) {
                    Some(entry) => entry,
                    None => {
                        missing.push(input.prevout);
                        continue;
                    }
                },
            };
            if entry.is_coinbase && next_height.saturating_sub(entry.height) < COINBASE_MATURITY {
                return Err(MempoolError::ImmatureInput(input.prevout));
            }
            value_in = value_in.saturating_add(entry.value);
            prevouts.push(entry);
        }

        if !missing.is_empty() {
            if source == TxSource::Own {
                // keep our own transaction around until the parents show up
                return self.insert(PendingTx {
                    txid,
                    volume: tx.total_output_value(),
                    sigops: 0,
                    fee: 0,
                    first_seen: now_secs(),
                    source: TxSource::UnknownInputs,
                    tx,
                    raw,
                });
            }
            return Err(MempoolError::MissingInputs(missing));
        }

        let value_out = tx.total_output_value();
        if value_out > value_in {
            return Err(MempoolError::Invalid("outputs exceed inputs".to_string()));
        }
        let fee = value_in - value_out;
        let size = i64::try_from(raw.len().max(1)).unwrap_or(i64::MAX);
        let required = self
            .policy
            .min_fee
            .max(self.policy.min_relay_fee_per_kb.saturating_mul(size) / 1000);
        if fee < required && source != TxSource::Own {
            return Err(MempoolError::FeeTooLow { fee, required });
        }

        let mut sigops = 0u32;
        for (index, input) in tx.vin.iter().enumerate() {
            verify_script(
                &input.script_sig,
                &prevouts[index].script_pubkey,
                &tx,
                index,
                MEMPOOL_VERIFY_FLAGS,
            )
            .map_err(MempoolError::Script)?;
            sigops = sigops.saturating_add(btcd_script::sigop_count(&input.script_sig));
        }
        for output in &tx.vout {
            sigops = sigops.saturating_add(btcd_script::sigop_count(&output.script_pubkey));
        }

        self.insert(PendingTx {
            txid,
            volume: value_out,
            sigops,
            fee,
            first_seen: now_secs(),
            source,
            tx,
            raw,
        })
    }

    fn insert(&mut self, entry: PendingTx) -> Result<Hash256, MempoolError> {
        let txid = entry.txid;
        for input in &entry.tx.vin {
            self.spent.insert(input.prevout, txid);
        }
        self.total_bytes += entry.size();
        self.entries.insert(txid, entry);
        Ok(txid)
    }

    fn remove_entry(&mut self, txid: &Hash256) -> Option<PendingTx> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.tx.vin {
            if self.spent.get(&input.prevout) == Some(txid) {
                self.spent.remove(&input.prevout);
            }
        }
        self.total_bytes -= entry.size();
        Some(entry)
    }

    /// Called for every transaction of a committed block: the mined copy
    /// leaves the pool, and so does anything spending the same inputs.
    pub fn on_block_mined(&mut self, tx: &Transaction, txid: &Hash256) -> usize {
        let mut removed = 0;
        if self.remove_entry(txid).is_some() {
            removed += 1;
        }
        for input in &tx.vin {
            if let Some(conflict) = self.spent.get(&input.prevout).copied() {
                if self.remove_entry(&conflict).is_some() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// TTL expiry plus lowest-fee-rate eviction down to the byte bound.
    pub fn expire(&mut self) -> (usize, usize) {
        let now = now_secs();
        let ttl = self.policy.tx_ttl_secs;
        let stale: Vec<Hash256> = self
            .entries
            .values()
            .filter(|entry| now.saturating_sub(entry.first_seen) > ttl)
            .map(|entry| entry.txid)
            .collect();
        let expired = stale.len();
        for txid in stale {
            self.remove_entry(&txid);
        }

        let mut evicted = 0;
        while self.total_bytes > self.policy.max_bytes {
            let victim = self
                .entries
                .values()
                .min_by(|a, b| {
                    a.fee_rate_per_kb()
                        .cmp(&b.fee_rate_per_kb())
                        .then(b.first_seen.cmp(&a.first_seen))
                })
                .map(|entry| entry.txid);
            let Some(txid) = victim else { break };
            self.remove_entry(&txid);
            evicted += 1;
        }
        (expired, evicted)
    }

    /// Relay and listing order: fee rate descending, first-seen breaking
    /// ties.
    pub fn relay_order(&self) -> Vec<Hash256> {
        let mut entries: Vec<(&Hash256, i64, u64)> = self
            .entries
            .iter()
            .map(|(txid, entry)| (txid, entry.fee_rate_per_kb(), entry.first_seen))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)).then(a.0.cmp(b.0)));
        entries.into_iter().map(|(txid, _, _)| *txid).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btcd_primitives::transaction::{TxIn, TxOut};

    struct FakeCoins {
        coins: HashMap<OutPoint, UtxoEntry>,
        height: u32,
    }

    impl CoinView for FakeCoins {
        fn coin(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
            self.coins.get(outpoint).cloned()
        }

        fn height(&self) -> u32 {
            self.height
        }
    }

    fn coins_with(outpoints: &[(OutPoint, i64)]) -> FakeCoins {
        let mut coins = HashMap::new();
        for (outpoint, value) in outpoints {
            coins.insert(
                *outpoint,
                UtxoEntry {
                    value: *value,
                    script_pubkey: vec![0x51],
                    height: 10,
                    is_coinbase: false,
                },
            );
        }
        FakeCoins { coins, height: 200 }
    }

    fn spend(prevout: OutPoint, value: i64, tag: u8) -> (Transaction, Vec<u8>) {
        let tx = Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout,
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value,
                // push tag, drop it, leave true: distinct yet spendable
                script_pubkey: vec![0x01, tag, 0x75, 0x51],
            }],
            lock_time: 0,
        };
        let raw = tx.consensus_encode();
        (tx, raw)
    }

    fn outpoint(tag: u8) -> OutPoint {
        OutPoint::new([tag; 32], 0)
    }

    #[test]
    fn admission_requires_fee() {
        let view = coins_with(&[(outpoint(1), 100_000)]);
        let mut pool = Mempool::new(MempoolPolicy::default());

        let (tx, raw) = spend(outpoint(1), 100_000, 1);
        let err = pool.admit(&view, tx, raw, TxSource::External).unwrap_err();
        assert!(matches!(err, MempoolError::FeeTooLow { .. }));

        let (tx, raw) = spend(outpoint(1), 90_000, 1);
        pool.admit(&view, tx, raw, TxSource::External).expect("fee ok");
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn double_spend_in_pool_is_rejected() {
        let view = coins_with(&[(outpoint(1), 100_000)]);
        let mut pool = Mempool::new(MempoolPolicy::default());
        let (tx, raw) = spend(outpoint(1), 90_000, 1);
        pool.admit(&view, tx, raw, TxSource::External).unwrap();

        let (tx2, raw2) = spend(outpoint(1), 80_000, 2);
        let err = pool.admit(&view, tx2, raw2, TxSource::External).unwrap_err();
        assert!(matches!(err, MempoolError::ConflictingInput(_)));
    }

    #[test]
    fn unconfirmed_parent_chains_are_allowed() {
        let view = coins_with(&[(outpoint(1), 100_000)]);
        let mut pool = Mempool::new(MempoolPolicy::default());
        let (parent, parent_raw) = spend(outpoint(1), 90_000, 1);
        let parent_txid = pool
            .admit(&view, parent, parent_raw, TxSource::External)
            .unwrap();

        let (child, child_raw) = spend(OutPoint::new(parent_txid, 0), 80_000, 2);
        pool.admit(&view, child, child_raw, TxSource::External)
            .expect("child spends parent in pool");
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn missing_inputs_park_own_but_reject_external() {
        let view = coins_with(&[]);
        let mut pool = Mempool::new(MempoolPolicy::default());

        let (tx, raw) = spend(outpoint(9), 10_000, 1);
        let err = pool
            .admit(&view, tx.clone(), raw.clone(), TxSource::External)
            .unwrap_err();
        assert!(matches!(err, MempoolError::MissingInputs(_)));

        let txid = pool.admit(&view, tx, raw, TxSource::Own).expect("parked");
        assert_eq!(pool.get(&txid).unwrap().source, TxSource::UnknownInputs);
    }

    #[test]
    fn mined_transactions_and_conflicts_leave_the_pool() {
        let view = coins_with(&[(outpoint(1), 100_000), (outpoint(2), 100_000)]);
        let mut pool = Mempool::new(MempoolPolicy::default());

        let (keeper, keeper_raw) = spend(outpoint(2), 90_000, 3);
        let keeper_txid = pool
            .admit(&view, keeper, keeper_raw, TxSource::External)
            .unwrap();

        let (ours, ours_raw) = spend(outpoint(1), 90_000, 1);
        pool.admit(&view, ours, ours_raw, TxSource::External).unwrap();

        // a block mines a different spend of outpoint(1)
        let (mined, mined_raw) = spend(outpoint(1), 85_000, 2);
        let mined_txid = sha256d(&mined_raw);
        let removed = pool.on_block_mined(&mined, &mined_txid);
        assert_eq!(removed, 1, "the conflicting pool entry is swept");
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&keeper_txid));
    }

    #[test]
    fn eviction_removes_lowest_fee_rate_first() {
        let view = coins_with(&[(outpoint(1), 100_000), (outpoint(2), 100_000)]);
        let mut policy = MempoolPolicy::default();
        policy.min_fee = 1;
        policy.min_relay_fee_per_kb = 1;
        let mut pool = Mempool::new(policy);

        let (cheap, cheap_raw) = spend(outpoint(1), 99_900, 1); // fee 100
        let cheap_txid = pool
            .admit(&view, cheap, cheap_raw, TxSource::External)
            .unwrap();
        let (rich, rich_raw) = spend(outpoint(2), 90_000, 2); // fee 10_000
        let rich_txid = pool.admit(&view, rich, rich_raw, TxSource::External).unwrap();

        assert_eq!(pool.relay_order(), vec![rich_txid, cheap_txid]);

        pool.policy.max_bytes = pool.bytes() - 1;
        let (_, evicted) = pool.expire();
        assert_eq!(evicted, 1);
        assert!(pool.contains(&rich_txid));
        assert!(!pool.contains(&cheap_txid));
    }

    #[test]
    fn immature_coinbase_spend_is_rejected() {
        let mut view = coins_with(&[]);
        view.coins.insert(
            outpoint(7),
            UtxoEntry {
                value: 100_000,
                script_pubkey: vec![0x51],
                height: 150,
                is_coinbase: true,
            },
        );
        // tip 200: only 51 confirmations
        let mut pool = Mempool::new(MempoolPolicy::default());
        let (tx, raw) = spend(outpoint(7), 90_000, 1);
        let err = pool.admit(&view, tx, raw, TxSource::External).unwrap_err();
        assert!(matches!(err, MempoolError::ImmatureInput(_)));
    }
}
