//! The chain state machine: accepts headers and blocks, commits them to
//! the UTXO set with undo records, and reorganizes between branches.
//!
//! Consensus-critical mutation happens from a single caller (the node's
//! main loop); the tree mutex exists for readers on other tasks and for
//! the header-sync insertion path.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use btcd_consensus::constants::{
    COINBASE_MATURITY, MAX_FUTURE_BLOCK_TIME, MOVING_CHECKPOINT_DEPTH,
};
use btcd_consensus::money::{block_subsidy, money_range};
use btcd_consensus::params::ChainParams;
use btcd_consensus::{hash_to_hex, Hash256};
use btcd_primitives::block::{Block, BlockDecodeError, HEADER_LEN};
use btcd_primitives::outpoint::OutPoint;
use btcd_pow::{check_proof_of_work, pow_limit_bits, retarget};
use btcd_script::interpreter::ScriptError;
use btcd_script::{verify_script, VERIFY_CLTV, VERIFY_DERSIG, VERIFY_P2SH};
use btcd_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use rayon::prelude::*;

use crate::blockfiles::{BlockFileError, BlockFiles, FileLocation};
use crate::tree::{BlockTree, HeaderLink, NodeId};
use crate::undo::{undo_key, BlockUndo, SpentOutput};
use crate::utxo::{UtxoEntry, UtxoSet};
use crate::validation::{
    check_block_size, check_block_transactions, check_coinbase_height, BlockReject,
};

const META_BEST_BLOCK: &[u8] = b"best_block";

const STATUS_HAS_DATA: u32 = 1 << 0;
const STATUS_INVALID: u32 = 1 << 1;
/// Set once the body passed full validation including scripts; bodies
/// stored for a side branch stay untrusted until a reorg applies them.
const STATUS_TRUSTED: u32 = 1 << 2;

const PROGRESS_LOG_EVERY: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum ChainError {
    Store(StoreError),
    Files(BlockFileError),
    Decode(BlockDecodeError),
    Reject(BlockReject),
    InputMissing(OutPoint),
    InputSpent(OutPoint),
    ImmatureCoinbase(OutPoint),
    Script(ScriptError),
    BadCoinbaseValue,
    ValueOutOfRange,
    MissingUndo(u32),
    UndoMismatch { expected: Hash256, found: Hash256 },
    MissingBlockData(Hash256),
    CorruptIndex(&'static str),
}

impl ChainError {
    /// The reject code a block submitter sees; commit failures map onto
    /// the canonical transaction-validation codes.
    pub fn rpc_result(&self) -> &'static str {
        match self {
            ChainError::Reject(reject) => reject.rpc_result,
            ChainError::InputMissing(_) => "bad-txns-inputs-missingorspent",
            ChainError::InputSpent(_) => "bad-txns-inputs-missingorspent",
            ChainError::ImmatureCoinbase(_) => "bad-txns-premature-spend-of-coinbase",
            ChainError::Script(_) => "mandatory-script-verify-flag-failed",
            ChainError::BadCoinbaseValue => "bad-cb-amount",
            ChainError::ValueOutOfRange => "bad-txns-inputvalues-outofrange",
            ChainError::Decode(_) => "bad-blk-length",
            _ => "internal-error",
        }
    }

    /// True when the failure condemns the block (and scores its sender),
    /// as opposed to a local storage problem.
    pub fn is_consensus_fault(&self) -> bool {
        matches!(
            self,
            ChainError::Reject(_)
                | ChainError::InputMissing(_)
                | ChainError::InputSpent(_)
                | ChainError::ImmatureCoinbase(_)
                | ChainError::Script(_)
                | ChainError::BadCoinbaseValue
                | ChainError::ValueOutOfRange
                | ChainError::Decode(_)
        )
    }
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Store(err) => write!(f, "store: {err}"),
            ChainError::Files(err) => write!(f, "block files: {err}"),
            ChainError::Decode(err) => write!(f, "{err} - RPC_Result:bad-blk-length"),
            ChainError::Reject(reject) => write!(f, "{reject}"),
            ChainError::InputMissing(outpoint) => write!(
                f,
                "input {}:{} not found - RPC_Result:bad-txns-inputs-missingorspent",
                hash_to_hex(&outpoint.hash),
                outpoint.index
            ),
            ChainError::InputSpent(outpoint) => write!(
                f,
                "input {}:{} already spent - RPC_Result:bad-txns-inputs-missingorspent",
                hash_to_hex(&outpoint.hash),
                outpoint.index
            ),
            ChainError::ImmatureCoinbase(outpoint) => write!(
                f,
                "coinbase {}:{} not mature - RPC_Result:bad-txns-premature-spend-of-coinbase",
                hash_to_hex(&outpoint.hash),
                outpoint.index
            ),
            ChainError::Script(err) => {
                write!(f, "script: {err} - RPC_Result:mandatory-script-verify-flag-failed")
            }
            ChainError::BadCoinbaseValue => {
                write!(f, "coinbase pays too much - RPC_Result:bad-cb-amount")
            }
            ChainError::ValueOutOfRange => {
                write!(f, "input values out of range - RPC_Result:bad-txns-inputvalues-outofrange")
            }
            ChainError::MissingUndo(height) => write!(f, "no undo record for height {height}"),
            ChainError::UndoMismatch { expected, found } => write!(
                f,
                "undo stack top is {} but tip is {}",
                hash_to_hex(found),
                hash_to_hex(expected)
            ),
            ChainError::MissingBlockData(hash) => {
                write!(f, "no stored body for block {}", hash_to_hex(hash))
            }
            ChainError::CorruptIndex(message) => write!(f, "corrupt block index: {message}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}

impl From<BlockFileError> for ChainError {
    fn from(err: BlockFileError) -> Self {
        ChainError::Files(err)
    }
}

impl From<BlockDecodeError> for ChainError {
    fn from(err: BlockDecodeError) -> Self {
        ChainError::Decode(err)
    }
}

impl From<BlockReject> for ChainError {
    fn from(err: BlockReject) -> Self {
        ChainError::Reject(err)
    }
}

impl From<ScriptError> for ChainError {
    fn from(err: ScriptError) -> Self {
        ChainError::Script(err)
    }
}

/// One fixed-layout record per indexed block.
#[derive(Clone, Copy, Debug)]
struct IndexEntry {
    status: u32,
    height: u32,
    location: FileLocation,
    sigops: u32,
    tx_count: u32,
    header: [u8; HEADER_LEN],
}

impl IndexEntry {
    const LEN: usize = 4 + 4 + 16 + 4 + 4 + HEADER_LEN;

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.location.encode());
        out.extend_from_slice(&self.sigops.to_le_bytes());
        out.extend_from_slice(&self.tx_count.to_le_bytes());
        out.extend_from_slice(&self.header);
        out
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::LEN {
            return None;
        }
        let status = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let height = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
        let location = FileLocation::decode(&bytes[8..24])?;
        let sigops = u32::from_le_bytes(bytes[24..28].try_into().ok()?);
        let tx_count = u32::from_le_bytes(bytes[28..32].try_into().ok()?);
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[32..32 + HEADER_LEN]);
        Some(Self {
            status,
            height,
            location,
            sigops,
            tx_count,
            header,
        })
    }

    fn has_data(&self) -> bool {
        self.status & STATUS_HAS_DATA != 0
    }

    fn is_invalid(&self) -> bool {
        self.status & STATUS_INVALID != 0
    }

    fn is_trusted(&self) -> bool {
        self.status & STATUS_TRUSTED != 0
    }
}

struct Changeset {
    created: Vec<(OutPoint, UtxoEntry)>,
    spent: Vec<SpentOutput>,
}

pub struct Chain<S> {
    params: ChainParams,
    store: Arc<S>,
    blocks: BlockFiles,
    utxo: UtxoSet<Arc<S>>,
    /// The block index; lock order is tree before nothing else.
    pub tree: Mutex<BlockTree>,
    tip_id: AtomicUsize,
    abort: AtomicBool,
    volatile: bool,
}

fn now_unix() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

impl<S: KeyValueStore> Chain<S> {
    /// Opens (or creates) the chain state, rebuilding the in-memory tree
    /// from the block index and committing genesis on first start.
    pub fn open(
        params: ChainParams,
        store: Arc<S>,
        blocks: BlockFiles,
        volatile: bool,
    ) -> Result<Self, ChainError> {
        let mut genesis_header = [0u8; HEADER_LEN];
        genesis_header.copy_from_slice(&params.genesis_block[..HEADER_LEN]);

        let chain = Self {
            utxo: UtxoSet::new(Arc::clone(&store)),
            params,
            store,
            blocks,
            tree: Mutex::new(BlockTree::new(genesis_header)),
            tip_id: AtomicUsize::new(0),
            abort: AtomicBool::new(false),
            volatile,
        };
        chain.load_index()?;

        match chain.store.get(Column::Meta, META_BEST_BLOCK)? {
            Some(bytes) => {
                let hash: Hash256 = bytes
                    .try_into()
                    .map_err(|_| ChainError::CorruptIndex("best block hash truncated"))?;
                let tree = chain.lock_tree();
                let tip = tree
                    .get(&hash)
                    .ok_or(ChainError::CorruptIndex("best block not in index"))?;
                drop(tree);
                chain.tip_id.store(tip, Ordering::SeqCst);
            }
            None => chain.commit_genesis()?,
        }
        Ok(chain)
    }

    fn load_index(&self) -> Result<(), ChainError> {
        let entries = self.store.scan_prefix(Column::BlockIndex, &[])?;
        let mut decoded: Vec<(Hash256, IndexEntry)> = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let hash: Hash256 = key
                .try_into()
                .map_err(|_| ChainError::CorruptIndex("index key is not a hash"))?;
            let entry = IndexEntry::decode(&value)
                .ok_or(ChainError::CorruptIndex("index entry truncated"))?;
            decoded.push((hash, entry));
        }
        decoded.sort_by_key(|(_, entry)| entry.height);

        let mut tree = self.lock_tree();
        for (hash, entry) in decoded {
            if entry.is_invalid() {
                continue;
            }
            if entry.height == 0 {
                let root = tree.root();
                if tree.node(root).hash != hash {
                    return Err(ChainError::CorruptIndex("foreign genesis in index"));
                }
                let node = tree.node_mut(root);
                node.block_size = entry.location.len;
                node.tx_count = entry.tx_count;
                node.sigops = entry.sigops;
                continue;
            }
            match tree.add_header(entry.header) {
                HeaderLink::Added(id) => {
                    let node = tree.node_mut(id);
                    if entry.has_data() {
                        node.block_size = entry.location.len;
                    }
                    node.tx_count = entry.tx_count;
                    node.sigops = entry.sigops;
                }
                HeaderLink::Duplicate(_) => {}
                HeaderLink::Orphan => {
                    btcd_log::log_warn!(
                        "dropping orphaned index entry {} at height {}",
                        hash_to_hex(&hash),
                        entry.height
                    );
                }
            }
        }
        Ok(())
    }

    fn commit_genesis(&self) -> Result<(), ChainError> {
        let mut block = Block::new(self.params.genesis_block.clone())?;
        block.build_tx_list()?;
        block.trusted = true;

        let location = match self.index_entry(block.hash())? {
            Some(entry) if entry.has_data() => entry.location,
            _ => self.blocks.append(&block.raw)?,
        };
        let mut batch = WriteBatch::new();
        let coinbase = &block.txs[0];
        let txid = block.txids[0];
        for (index, output) in coinbase.vout.iter().enumerate() {
            let outpoint = OutPoint::new(txid, index as u32);
            let entry = UtxoEntry {
                value: output.value,
                script_pubkey: output.script_pubkey.clone(),
                height: 0,
                is_coinbase: true,
            };
            self.utxo.put(&mut batch, &outpoint, &entry);
        }

        let (root, hash, header) = {
            let tree = self.lock_tree();
            let root = tree.root();
            let node = tree.node(root);
            (root, node.hash, node.header)
        };
        let entry = IndexEntry {
            status: STATUS_HAS_DATA | STATUS_TRUSTED,
            height: 0,
            location,
            sigops: 0,
            tx_count: 1,
            header,
        };
        batch.put(Column::BlockIndex, hash.as_slice(), entry.encode());
        batch.put(Column::HeightIndex, 0u32.to_be_bytes().as_slice(), hash.as_slice());
        batch.put(Column::Meta, META_BEST_BLOCK, hash.as_slice());
        self.store.write_batch(&batch)?;

        {
            let mut tree = self.lock_tree();
            let node = tree.node_mut(root);
            node.block_size = block.raw.len() as u32;
            node.tx_count = 1;
        }
        self.tip_id.store(root, Ordering::SeqCst);
        btcd_log::log_info!("committed genesis {}", hash_to_hex(&hash));
        Ok(())
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn lock_tree(&self) -> MutexGuard<'_, BlockTree> {
        self.tree.lock().expect("block index lock")
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// The committed tip; readable without the tree lock.
    pub fn tip(&self) -> NodeId {
        self.tip_id.load(Ordering::SeqCst)
    }

    pub fn tip_info(&self) -> (Hash256, u32) {
        let tree = self.lock_tree();
        let node = tree.node(self.tip());
        (node.hash, node.height)
    }

    pub fn tip_height(&self) -> u32 {
        self.tip_info().1
    }

    // ---- header acceptance (sync engine path) ----

    /// Validates a header in its chain context and links it into the
    /// index. Returns the reject for the caller to score the sender.
    pub fn accept_header(&self, header: [u8; HEADER_LEN]) -> Result<HeaderLink, BlockReject> {
        let hash = btcd_primitives::hash::sha256d(&header);
        let mut tree = self.lock_tree();
        if let Some(existing) = tree.get(&hash) {
            return Ok(HeaderLink::Duplicate(existing));
        }
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&header[4..36]);
        let Some(parent) = tree.get(&prev) else {
            return Ok(HeaderLink::Orphan);
        };

        let version = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let time = u32::from_le_bytes([header[68], header[69], header[70], header[71]]);
        let bits = u32::from_le_bytes([header[72], header[73], header[74], header[75]]);
        self.check_header_context(&tree, parent, &hash, version, time, bits)?;

        Ok(tree.add_header(header))
    }

    fn check_header_context(
        &self,
        tree: &BlockTree,
        parent: NodeId,
        hash: &Hash256,
        version: u32,
        time: u32,
        bits: u32,
    ) -> Result<(u32, u32, u32), BlockReject> {
        let consensus = &self.params.consensus;
        if version == 0 {
            return Err(BlockReject::dos("block version 0 not allowed", "bad-version"));
        }
        if !check_proof_of_work(hash, bits, consensus) {
            return Err(BlockReject::dos("proof of work failed", "high-hash"));
        }
        if time > now_unix().saturating_add(MAX_FUTURE_BLOCK_TIME) {
            return Err(BlockReject::dos(
                "block timestamp too far in the future",
                "time-too-new",
            ));
        }
        if bits != self.expected_bits(tree, parent, time) {
            return Err(BlockReject::dos("incorrect proof of work", "bad-diffbits"));
        }
        if time <= tree.median_time_past(parent) {
            return Err(BlockReject::dos("block's timestamp is too early", "time-too-old"));
        }

        let (maj2, maj3, maj4) = self.count_majorities(tree, parent);
        let reject = consensus.majority_reject_outdated;
        if (version < 2 && maj2 >= reject)
            || (version < 3 && maj3 >= reject)
            || (version < 4 && maj4 >= reject)
        {
            return Err(BlockReject::dos("rejected outdated block version", "bad-version"));
        }
        Ok((maj2, maj3, maj4))
    }

    /// Counts upgraded versions over the majority window ending at
    /// `parent`, inclusive.
    fn count_majorities(&self, tree: &BlockTree, parent: NodeId) -> (u32, u32, u32) {
        let window = self.params.consensus.majority_window;
        let (mut maj2, mut maj3, mut maj4) = (0u32, 0u32, 0u32);
        let mut cur = Some(parent);
        let mut count = 0usize;
        while let Some(id) = cur {
            if count == window {
                break;
            }
            let node = tree.node(id);
            let version = node.version();
            if version >= 2 {
                maj2 += 1;
                if version >= 3 {
                    maj3 += 1;
                    if version >= 4 {
                        maj4 += 1;
                    }
                }
            }
            count += 1;
            cur = node.parent;
        }
        (maj2, maj3, maj4)
    }

    /// The compact target the next block after `parent` must carry.
    fn expected_bits(&self, tree: &BlockTree, parent: NodeId, new_time: u32) -> u32 {
        let consensus = &self.params.consensus;
        if consensus.pow_no_retargeting {
            return tree.node(parent).bits();
        }
        let interval = consensus.retarget_interval();
        let parent_node = tree.node(parent);
        let next_height = parent_node.height + 1;

        if next_height % interval != 0 {
            if consensus.pow_allow_min_difficulty {
                let limit = pow_limit_bits(consensus);
                // a block 2x spacing late may carry minimum difficulty
                if i64::from(new_time)
                    > i64::from(parent_node.time()) + consensus.pow_target_spacing * 2
                {
                    return limit;
                }
                // otherwise the last non-minimum difficulty applies
                let mut cur = parent;
                loop {
                    let node = tree.node(cur);
                    if node.height % interval == 0 || node.bits() != limit {
                        return node.bits();
                    }
                    match node.parent {
                        Some(parent) => cur = parent,
                        None => return node.bits(),
                    }
                }
            }
            return parent_node.bits();
        }

        let period_start_height = next_height - interval;
        let first = tree
            .ancestor(parent, period_start_height)
            .expect("retarget period start below parent");
        let actual = i64::from(parent_node.time()) - i64::from(tree.node(first).time());
        retarget(parent_node.bits(), actual, consensus)
    }

    // ---- full-block validation ----

    /// Cheap context checks. On success the block carries its height and
    /// version-majority counters.
    pub fn pre_check_block(&self, block: &mut Block) -> Result<(), BlockReject> {
        let consensus = &self.params.consensus;
        check_block_size(block)?;
        if block.header.version == 0 {
            return Err(BlockReject::dos("block version 0 not allowed", "bad-version"));
        }
        if !check_proof_of_work(block.hash(), block.header.bits, consensus) {
            return Err(BlockReject::dos("proof of work failed", "high-hash"));
        }
        if block.header.time > now_unix().saturating_add(MAX_FUTURE_BLOCK_TIME) {
            return Err(BlockReject::dos(
                "block timestamp too far in the future",
                "time-too-new",
            ));
        }

        let tree = self.lock_tree();
        if let Some(existing) = tree.get(block.hash()) {
            if tree.node(existing).parent.is_none() {
                return Err(BlockReject::genesis());
            }
            return Err(BlockReject::duplicate(block.hash()));
        }
        let Some(parent) = tree.get(&block.header.prev_block) else {
            return Err(BlockReject::parent_unknown(block.hash()));
        };
        block.height = tree.node(parent).height + 1;

        // reject blocks hooking deeper than the unwind buffer
        let tip = self.tip();
        let tip_height = tree.node(tip).height;
        if parent != tip
            && tip_height.saturating_sub(block.height) >= MOVING_CHECKPOINT_DEPTH
        {
            return Err(BlockReject::soft(
                format!(
                    "block {} hooks too deep into the chain: {}/{}",
                    hash_to_hex(block.hash()),
                    block.height,
                    tip_height
                ),
                "bad-prevblk",
            ));
        }

        if block.header.bits != self.expected_bits(&tree, parent, block.header.time) {
            return Err(BlockReject::dos("incorrect proof of work", "bad-diffbits"));
        }
        if block.header.time <= tree.median_time_past(parent) {
            return Err(BlockReject::dos("block's timestamp is too early", "time-too-old"));
        }

        let (maj2, maj3, maj4) = self.count_majorities(&tree, parent);
        block.majority_v2 = maj2;
        block.majority_v3 = maj3;
        block.majority_v4 = maj4;
        let reject = consensus.majority_reject_outdated;
        let version = block.header.version;
        if (version < 2 && maj2 >= reject)
            || (version < 3 && maj3 >= reject)
            || (version < 4 && maj4 >= reject)
        {
            return Err(BlockReject::dos("rejected outdated block version", "bad-version"));
        }
        Ok(())
    }

    /// The expensive checks, run only when the body will be applied.
    /// Derives the script-verify flags for the block's epoch.
    pub fn post_check_block(&self, block: &mut Block) -> Result<(), BlockReject> {
        if !block.has_tx_list() {
            block
                .build_tx_list()
                .map_err(|err| BlockReject::dos(err.to_string(), "bad-tx"))?;
        }

        let enforce = self.params.consensus.majority_enforce_upgrade;
        if !block.trusted {
            if block.header.version >= 2 && block.majority_v2 >= enforce {
                check_coinbase_height(block)?;
            }
            block.sigops = check_block_transactions(block)?;
        }

        let mut flags = 0u32;
        if block.header.time >= btcd_consensus::constants::BIP16_SWITCH_TIME {
            flags |= VERIFY_P2SH;
        }
        if block.majority_v3 >= enforce {
            flags |= VERIFY_DERSIG;
        }
        if block.header.version >= 4 && block.majority_v4 >= enforce {
            flags |= VERIFY_CLTV;
        }
        block.verify_flags = flags;
        Ok(())
    }

    // ---- commit ----

    /// Full acceptance path for a block whose header is not yet indexed:
    /// validation, linking, then commit, side-store or reorganization.
    pub fn accept_block(&self, block: &mut Block) -> Result<(), ChainError> {
        self.pre_check_block(block)?;

        let header = block.header.consensus_encode();
        let node = {
            let mut tree = self.lock_tree();
            match tree.add_header(header) {
                HeaderLink::Added(id) | HeaderLink::Duplicate(id) => id,
                HeaderLink::Orphan => {
                    return Err(ChainError::CorruptIndex("parent vanished after pre-check"))
                }
            }
        };
        self.commit_block(block, node)
    }

    /// Applies a block body for an already-indexed header node: commit if
    /// it extends the tip, otherwise store the body and reorganize when
    /// the branch is longer. Main-loop only.
    pub fn commit_block(&self, block: &mut Block, node: NodeId) -> Result<(), ChainError> {
        let (parent, node_height, tip, tip_height) = {
            let tree = self.lock_tree();
            let tip = self.tip();
            let tree_node = tree.node(node);
            (
                tree_node.parent,
                tree_node.height,
                tip,
                tree.node(tip).height,
            )
        };
        block.height = node_height;
        if block.majority_v2 == 0 && block.majority_v3 == 0 && block.majority_v4 == 0 {
            let tree = self.lock_tree();
            if let Some(parent) = parent {
                let (maj2, maj3, maj4) = self.count_majorities(&tree, parent);
                block.majority_v2 = maj2;
                block.majority_v3 = maj3;
                block.majority_v4 = maj4;
            }
        }
        self.post_check_block(block)?;

        if parent == Some(tip) {
            if let Err(err) = self.connect_tip_block(block, node) {
                if err.is_consensus_fault() {
                    self.delete_branch(node)?;
                }
                return Err(err);
            }
            return Ok(());
        }

        // side branch: keep the body, switch over if it is now longer
        self.store_block_body(block, node)?;
        if node_height > tip_height {
            self.move_to_block(node)?;
        }
        Ok(())
    }

    /// Connects a block directly on top of the current tip.
    fn connect_tip_block(&self, block: &mut Block, node: NodeId) -> Result<(), ChainError> {
        let changeset = self.process_block_transactions(block)?;
        let height = block.height;

        let mut batch = WriteBatch::new();
        batch.reserve(changeset.created.len() + changeset.spent.len() + 8);
        let mut undo = BlockUndo {
            block_hash: *block.hash(),
            spent: Vec::with_capacity(changeset.spent.len()),
            created: Vec::with_capacity(changeset.created.len()),
        };
        for spent in changeset.spent {
            self.utxo.delete(&mut batch, &spent.outpoint);
            undo.spent.push(spent);
        }
        for (outpoint, entry) in &changeset.created {
            self.utxo.put(&mut batch, outpoint, entry);
            undo.created.push(*outpoint);
        }
        batch.put(Column::Undo, undo_key(height).as_slice(), undo.encode());
        if height >= MOVING_CHECKPOINT_DEPTH {
            batch.delete(
                Column::Undo,
                undo_key(height - MOVING_CHECKPOINT_DEPTH).as_slice(),
            );
        }

        let location = match self.index_entry(block.hash())? {
            Some(entry) if entry.has_data() => entry.location,
            _ => self.blocks.append(&block.raw)?,
        };
        let entry = IndexEntry {
            status: STATUS_HAS_DATA | STATUS_TRUSTED,
            height,
            location,
            sigops: block.sigops,
            tx_count: block.tx_count() as u32,
            header: block.header.consensus_encode(),
        };
        batch.put(Column::BlockIndex, block.hash().as_slice(), entry.encode());
        batch.put(
            Column::HeightIndex,
            height.to_be_bytes().as_slice(),
            block.hash().as_slice(),
        );
        batch.put(Column::Meta, META_BEST_BLOCK, block.hash().as_slice());
        self.store.write_batch(&batch)?;

        {
            let mut tree = self.lock_tree();
            let tree_node = tree.node_mut(node);
            tree_node.block_size = block.raw.len() as u32;
            tree_node.tx_count = block.tx_count() as u32;
            tree_node.sigops = block.sigops;
        }
        self.tip_id.store(node, Ordering::SeqCst);
        Ok(())
    }

    /// Stores the body of a block that does not extend the tip.
    fn store_block_body(&self, block: &Block, node: NodeId) -> Result<(), ChainError> {
        if let Some(entry) = self.index_entry(block.hash())? {
            if entry.has_data() {
                return Ok(());
            }
        }
        let location = self.blocks.append(&block.raw)?;
        let entry = IndexEntry {
            status: STATUS_HAS_DATA,
            height: block.height,
            location,
            sigops: block.sigops,
            tx_count: block.tx_count() as u32,
            header: block.header.consensus_encode(),
        };
        self.store
            .put(Column::BlockIndex, block.hash(), &entry.encode())?;
        let mut tree = self.lock_tree();
        let tree_node = tree.node_mut(node);
        tree_node.block_size = block.raw.len() as u32;
        tree_node.tx_count = block.tx_count() as u32;
        tree_node.sigops = block.sigops;
        Ok(())
    }

    /// Spends every input against the UTXO view (allowing intra-block
    /// chains), script-verifies under the block's flags, and produces the
    /// change-set with accumulated fees.
    fn process_block_transactions(&self, block: &Block) -> Result<Changeset, ChainError> {
        use std::collections::{HashMap, HashSet};

        let height = block.height;
        let mut pending: HashMap<OutPoint, UtxoEntry> = HashMap::new();
        let mut spent_outpoints: HashSet<OutPoint> = HashSet::new();
        let mut spent: Vec<SpentOutput> = Vec::new();
        let mut fees: i64 = 0;
        let mut script_jobs: Vec<(usize, usize, Vec<u8>)> = Vec::new();

        for (tx_index, tx) in block.txs.iter().enumerate() {
            let txid = block.txids[tx_index];
            if tx_index > 0 {
                let mut value_in: i64 = 0;
                for (vin, input) in tx.vin.iter().enumerate() {
                    let outpoint = input.prevout;
                    if spent_outpoints.contains(&outpoint) {
                        return Err(ChainError::InputSpent(outpoint));
                    }
                    let entry = match pending.remove(&outpoint) {
                        Some(entry) => entry,
                        None => {
                            let entry = self
                                .utxo
                                .get(&outpoint)?
                                .ok_or(ChainError::InputMissing(outpoint))?;
                            spent.push(SpentOutput {
                                outpoint,
                                entry: entry.clone(),
                            });
                            entry
                        }
                    };
                    spent_outpoints.insert(outpoint);
                    if entry.is_coinbase && height.saturating_sub(entry.height) < COINBASE_MATURITY
                    {
                        return Err(ChainError::ImmatureCoinbase(outpoint));
                    }
                    value_in = value_in.saturating_add(entry.value);
                    if !block.trusted {
                        script_jobs.push((tx_index, vin, entry.script_pubkey));
                    }
                }
                if !money_range(value_in) {
                    return Err(ChainError::ValueOutOfRange);
                }
                let value_out = tx.total_output_value();
                if value_out > value_in {
                    return Err(ChainError::ValueOutOfRange);
                }
                fees = fees.saturating_add(value_in - value_out);
            }
            for (index, output) in tx.vout.iter().enumerate() {
                pending.insert(
                    OutPoint::new(txid, index as u32),
                    UtxoEntry {
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                        height,
                        is_coinbase: tx_index == 0,
                    },
                );
            }
        }

        let coinbase_out = block.txs[0].total_output_value();
        if coinbase_out > block_subsidy(height).saturating_add(fees) {
            return Err(ChainError::BadCoinbaseValue);
        }

        if !script_jobs.is_empty() {
            let flags = block.verify_flags;
            let txs = &block.txs;
            script_jobs
                .par_iter()
                .try_for_each(|(tx_index, vin, script_pubkey)| {
                    let tx = &txs[*tx_index];
                    verify_script(&tx.vin[*vin].script_sig, script_pubkey, tx, *vin, flags)
                })
                .map_err(ChainError::Script)?;
        }

        Ok(Changeset {
            created: pending.into_iter().collect(),
            spent,
        })
    }

    // ---- undo & reorganization ----

    /// Reverses the most recent commit. Fails hard when the undo stack
    /// does not match the tip.
    pub fn undo_last_block(&self) -> Result<(), ChainError> {
        let (tip_hash, height, parent) = {
            let tree = self.lock_tree();
            let node = tree.node(self.tip());
            (node.hash, node.height, node.parent)
        };
        let Some(parent) = parent else {
            return Err(ChainError::CorruptIndex("cannot undo the genesis block"));
        };
        btcd_log::log_info!("undo block {} {}", height, hash_to_hex(&tip_hash));

        let bytes = self
            .store
            .get(Column::Undo, &undo_key(height))?
            .ok_or(ChainError::MissingUndo(height))?;
        let undo = BlockUndo::decode(&bytes)
            .map_err(|_| ChainError::CorruptIndex("undo record truncated"))?;
        if undo.block_hash != tip_hash {
            return Err(ChainError::UndoMismatch {
                expected: tip_hash,
                found: undo.block_hash,
            });
        }

        let mut batch = WriteBatch::new();
        for outpoint in &undo.created {
            self.utxo.delete(&mut batch, outpoint);
        }
        for spent in &undo.spent {
            self.utxo.put(&mut batch, &spent.outpoint, &spent.entry);
        }
        batch.delete(Column::Undo, undo_key(height).as_slice());
        batch.delete(Column::HeightIndex, height.to_be_bytes().as_slice());
        let parent_hash = {
            let tree = self.lock_tree();
            tree.node(parent).hash
        };
        batch.put(Column::Meta, META_BEST_BLOCK, parent_hash.as_slice());
        self.store.write_batch(&batch)?;

        self.tip_id.store(parent, Ordering::SeqCst);
        Ok(())
    }

    /// Moves the committed tip to `dst`, undoing and reapplying blocks
    /// across the fork point as needed.
    pub fn move_to_block(&self, dst: NodeId) -> Result<(), ChainError> {
        {
            let tree = self.lock_tree();
            let tip = self.tip();
            let tip_height = tree.node(tip).height;

            // every ancestor down to tip height must have its body
            let mut cur = dst;
            while tree.node(cur).height > tip_height {
                cur = tree.node(cur).parent.expect("walked above root");
                if tree.node(cur).height > tip_height && !tree.node(cur).has_body() {
                    btcd_log::log_warn!(
                        "cannot reorganize to {}: missing body at {}",
                        hash_to_hex(&tree.node(dst).hash),
                        hash_to_hex(&tree.node(cur).hash)
                    );
                    return Ok(());
                }
            }
            // walk both sides to the common ancestor, confirming bodies
            let mut tmp = tip;
            while tmp != cur {
                let cur_parent = tree.node(cur).parent.expect("fork below root");
                if cur != dst && !tree.node(cur).has_body() {
                    btcd_log::log_warn!(
                        "cannot reorganize to {}: missing body at {}",
                        hash_to_hex(&tree.node(dst).hash),
                        hash_to_hex(&tree.node(cur).hash)
                    );
                    return Ok(());
                }
                cur = cur_parent;
                tmp = tree.node(tmp).parent.expect("fork below root");
            }
        }

        // undo down to the common ancestor
        loop {
            let (tip, dst_ancestor) = {
                let tree = self.lock_tree();
                let tip = self.tip();
                (tip, tree.first_common_parent(tip, dst))
            };
            if tip == dst_ancestor {
                break;
            }
            if self.aborted() {
                return Ok(());
            }
            self.undo_last_block()?;
        }

        self.parse_till_block(dst)
    }

    /// Re-commits stored blocks from the tip toward `end`, deleting the
    /// branch and falling back to the farthest remaining tip when a
    /// stored block turns out invalid.
    pub fn parse_till_block(&self, end: NodeId) -> Result<(), ChainError> {
        let mut last_progress = Instant::now();
        while !self.aborted() && self.tip() != end {
            let (next, next_hash, has_body, end_height, tip_height) = {
                let tree = self.lock_tree();
                let tip = self.tip();
                let Some(next) = tree.find_path_to(tip, end) else {
                    break;
                };
                let node = tree.node(next);
                (
                    next,
                    node.hash,
                    node.has_body(),
                    tree.node(end).height,
                    tree.node(tip).height,
                )
            };
            if last_progress.elapsed() >= PROGRESS_LOG_EVERY {
                btcd_log::log_info!("reorganizing chain ... {}/{}", tip_height, end_height);
                last_progress = Instant::now();
            }
            if !has_body {
                btcd_log::log_warn!(
                    "block {} not yet committed, stopping reorganization",
                    hash_to_hex(&next_hash)
                );
                break;
            }

            let result = (|| -> Result<(), ChainError> {
                let entry = self
                    .index_entry(&next_hash)?
                    .filter(|entry| entry.has_data() && !entry.is_invalid())
                    .ok_or(ChainError::MissingBlockData(next_hash))?;
                let mut block = Block::new(self.blocks.read(entry.location)?)?;
                block.build_tx_list()?;
                // bodies stored off-tip have not been script-verified yet
                block.trusted = entry.is_trusted();
                block.height = entry.height;
                {
                    let tree = self.lock_tree();
                    if let Some(parent) = tree.node(next).parent {
                        let (maj2, maj3, maj4) = self.count_majorities(&tree, parent);
                        block.majority_v2 = maj2;
                        block.majority_v3 = maj3;
                        block.majority_v4 = maj4;
                    }
                }
                self.post_check_block(&mut block)?;
                self.connect_tip_block(&mut block, next)
            })();
            if let Err(err) = result {
                btcd_log::log_warn!(
                    "reapplying block {} failed: {err}",
                    hash_to_hex(&next_hash)
                );
                self.delete_branch(next)?;
                break;
            }
        }

        if !self.aborted() && self.tip() != end {
            let fallback = {
                let tree = self.lock_tree();
                tree.find_farthest(tree.root())
            };
            if fallback != self.tip() {
                btcd_log::log_info!("reorganization failed, going to the farthest tip instead");
                self.move_to_block(fallback)?;
            }
        }
        self.sync()?;
        Ok(())
    }

    /// Drops a node and all its descendants from the index, marking their
    /// stored bodies invalid.
    pub fn delete_branch(&self, node: NodeId) -> Result<(), ChainError> {
        let removed = {
            let mut tree = self.lock_tree();
            tree.delete_branch(node)
        };
        for hash in &removed {
            if let Some(mut entry) = self.index_entry(hash)? {
                entry.status |= STATUS_INVALID;
                self.store
                    .put(Column::BlockIndex, hash, &entry.encode())?;
            }
        }
        btcd_log::log_info!("deleted branch of {} block(s)", removed.len());
        if !self.volatile {
            self.blocks.sync()?;
        }
        Ok(())
    }

    // ---- durability & maintenance ----

    /// Durability barrier. In volatile mode this is deferred to the final
    /// shutdown flush.
    pub fn sync(&self) -> Result<(), ChainError> {
        if self.volatile {
            return Ok(());
        }
        self.flush()
    }

    /// Unconditional flush, used at shutdown even in volatile mode.
    pub fn flush(&self) -> Result<(), ChainError> {
        self.store.persist()?;
        self.blocks.sync()?;
        Ok(())
    }

    /// One bounded unit of background work for the idle tick: prunes a
    /// few undo records that fell out of the unwind window.
    pub fn idle(&self) -> Result<bool, ChainError> {
        let tip_height = self.tip_height();
        if tip_height <= MOVING_CHECKPOINT_DEPTH {
            return Ok(false);
        }
        let cutoff = tip_height - MOVING_CHECKPOINT_DEPTH;
        let stale: Vec<Vec<u8>> = self
            .store
            .scan_prefix(Column::Undo, &[])?
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| {
                key.len() == 4
                    && u32::from_be_bytes([key[0], key[1], key[2], key[3]]) < cutoff
            })
            .take(32)
            .collect();
        if stale.is_empty() {
            return Ok(false);
        }
        let mut batch = WriteBatch::new();
        for key in stale {
            batch.delete(Column::Undo, key);
        }
        self.store.write_batch(&batch)?;
        Ok(true)
    }

    /// Rebuilds the UTXO set by replaying every stored block from
    /// genesis.
    pub fn rescan(&self) -> Result<(), ChainError> {
        btcd_log::log_info!("rebuilding the unspent set from block history");
        self.store.clear_column(Column::Utxo)?;
        self.store.clear_column(Column::Undo)?;
        self.store.clear_column(Column::HeightIndex)?;
        self.store.delete(Column::Meta, META_BEST_BLOCK)?;
        {
            let root = {
                let tree = self.lock_tree();
                tree.root()
            };
            self.tip_id.store(root, Ordering::SeqCst);
        }
        self.commit_genesis()?;
        let farthest = {
            let tree = self.lock_tree();
            tree.find_farthest(tree.root())
        };
        self.move_to_block(farthest)
    }

    /// Rolls the committed tip back by `count` blocks.
    pub fn undo_recent(&self, count: u32) -> Result<(), ChainError> {
        for _ in 0..count {
            if self.tip_height() == 0 {
                break;
            }
            self.undo_last_block()?;
        }
        self.sync()
    }

    // ---- read accessors ----

    fn index_entry(&self, hash: &Hash256) -> Result<Option<IndexEntry>, ChainError> {
        match self.store.get(Column::BlockIndex, hash)? {
            Some(bytes) => Ok(Some(
                IndexEntry::decode(&bytes)
                    .ok_or(ChainError::CorruptIndex("index entry truncated"))?,
            )),
            None => Ok(None),
        }
    }

    /// Raw bytes of a stored, non-invalidated block.
    pub fn read_block_bytes_by_hash(&self, hash: &Hash256) -> Result<Vec<u8>, ChainError> {
        let entry = self
            .index_entry(hash)?
            .filter(|entry| entry.has_data() && !entry.is_invalid())
            .ok_or(ChainError::MissingBlockData(*hash))?;
        Ok(self.blocks.read(entry.location)?)
    }

    pub fn utxo_lookup(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainError> {
        Ok(self.utxo.get(outpoint)?)
    }

    /// Main-chain block hash at a height, if committed.
    pub fn hash_at_height(&self, height: u32) -> Result<Option<Hash256>, ChainError> {
        match self.store.get(Column::HeightIndex, &height.to_be_bytes())? {
            Some(bytes) => Ok(Some(bytes.try_into().map_err(|_| {
                ChainError::CorruptIndex("height index entry truncated")
            })?)),
            None => Ok(None),
        }
    }

    /// A locator: the last ten tip hashes, then exponentially sparser
    /// ancestors, ending with genesis.
    pub fn block_locator(&self) -> Vec<Hash256> {
        let tree = self.lock_tree();
        let mut out = Vec::new();
        let mut cur = Some(self.tip());
        let mut step = 1u32;
        while let Some(id) = cur {
            let node = tree.node(id);
            out.push(node.hash);
            if node.parent.is_none() {
                return out;
            }
            if out.len() >= 10 {
                step = step.saturating_mul(2);
            }
            let target = node.height.saturating_sub(step);
            cur = tree.ancestor(id, target);
        }
        let root = tree.root();
        out.push(tree.node(root).hash);
        out
    }
}
