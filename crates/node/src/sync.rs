//! The block-synchronization engine: header-first download, inventory
//! processing, getdata scheduling with per-peer parallelism and timeouts,
//! the out-of-order block cache, and inventory routing to peers.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use btcd_chainstate::tree::{HeaderLink, NodeId};
use btcd_consensus::{bidx, hash_to_hex, Hash256};
use btcd_primitives::block::{Block, HEADER_LEN};
use btcd_storage::KeyValueStore;
use std::collections::HashMap;

use crate::p2p::{
    build_addr_payload, build_headers_payload, build_inv_entry, build_inv_payload,
    build_locator_payload, parse_addr_payload, parse_headers_payload, parse_inv,
    parse_locator_payload, Peer, PingAction, GET_BLOCK_TIMEOUT, MAX_HEADERS_RESULTS, MSG_BLOCK,
    MSG_TX, NO_DATA_TIMEOUT,
};
use crate::NetCtx;

/// Never request a block further ahead than this of the committed tip.
pub const MAX_BLOCKS_FORWARD: u32 = 5000;
/// Bound on the total declared size served for one `getdata`.
pub const MAX_GETDATA_FORWARD: usize = 2_000_000;
/// Cached out-of-order blocks are dropped after this long.
pub const EXPIRE_CACHED_AFTER: Duration = Duration::from_secs(20 * 60);
/// Tx inventory is ignored while this many block bodies are pending.
const MAX_PENDING_BLOCKS_FOR_TX: usize = 10;
const MAX_GETADDR_RESPONSE: usize = 1000;
const MAX_GETBLOCKS_INVS: usize = 500;

/// A header-known block whose body is still missing.
#[derive(Clone, Debug)]
pub struct BlockToGet {
    pub hash: Hash256,
    pub node: NodeId,
    pub height: u32,
    pub assigned_to: Option<u64>,
    pub requested_at: Option<Instant>,
}

#[derive(Clone, Copy, Debug)]
pub struct ReceivedBlock {
    pub first_seen: Instant,
}

/// A downloaded block travelling to the main loop.
pub struct BlockRcvd {
    pub block: Block,
    pub node: Option<NodeId>,
    pub from_peer: Option<u64>,
    pub received_at: Instant,
}

/// A transaction body travelling to the main loop.
pub struct TxRcvd {
    pub raw: Vec<u8>,
    pub from_peer: Option<u64>,
}

/// The download registries; one mutex guards all three.
#[derive(Default)]
pub struct SyncState {
    pub received_blocks: HashMap<u64, ReceivedBlock>,
    pub blocks_to_get: HashMap<u64, BlockToGet>,
    pub cached_blocks: Vec<BlockRcvd>,
}

impl SyncState {
    pub fn pending_block_count(&self) -> usize {
        self.blocks_to_get.len() + self.cached_blocks.len()
    }

    /// Drops cached blocks that overstayed; returns how many.
    pub fn expire_cached(&mut self, now: Instant) -> usize {
        let before = self.cached_blocks.len();
        self.cached_blocks
            .retain(|cached| now.duration_since(cached.received_at) < EXPIRE_CACHED_AFTER);
        let dropped = before - self.cached_blocks.len();
        if dropped > 0 {
            crate::counters::add("BlockCacheExpired", dropped as u64);
        }
        dropped
    }

    /// Takes one cached block that links directly onto the tip.
    pub fn take_cached_at(&mut self, height: u32, tip_hash: &Hash256) -> Option<BlockRcvd> {
        let position = self.cached_blocks.iter().position(|cached| {
            cached.block.height == height || cached.block.header.prev_block == *tip_hash
        })?;
        Some(self.cached_blocks.remove(position))
    }
}

/// Routes one framed message from a peer's reader task.
pub async fn handle_message<S: KeyValueStore>(
    ctx: &NetCtx<S>,
    peer: &Arc<Peer>,
    command: &str,
    payload: &[u8],
) {
    {
        let mut ctrl = peer.ctrl();
        ctrl.last_data_received = Instant::now();
        ctrl.bytes_received += 24 + payload.len() as u64;
    }
    match command {
        "ping" => peer.send_message("pong", payload),
        "pong" => peer.pong_received(payload),
        "inv" => process_inv(ctx, peer, payload),
        "headers" => process_headers(ctx, peer, payload),
        "block" => block_received(ctx, peer, payload).await,
        "tx" => {
            let _ = ctx
                .net_txs
                .send(TxRcvd {
                    raw: payload.to_vec(),
                    from_peer: Some(peer.id),
                })
                .await;
        }
        "getheaders" => serve_getheaders(ctx, peer, payload),
        "getblocks" => serve_getblocks(ctx, peer, payload),
        "getdata" => serve_getdata(ctx, peer, payload),
        "getaddr" => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as u32;
            let sample = ctx.addr_book.sample(MAX_GETADDR_RESPONSE);
            peer.send_message("addr", &build_addr_payload(&sample, now));
        }
        "addr" => match parse_addr_payload(payload) {
            Ok(addrs) => {
                let learned = ctx.addr_book.insert_many(addrs);
                if learned > 0 {
                    log_debug!("learned {learned} addresses from {}", peer.addr);
                }
            }
            Err(_) => {
                peer.misbehave("BadAddr", 50);
            }
        },
        "alert" => {
            let _ = ctx
                .net_alerts
                .send(format!("alert from {} ({} bytes)", peer.addr, payload.len()))
                .await;
        }
        "mempool" => {
            let txids: Vec<(u32, Hash256)> = {
                let pool = ctx.mempool.lock().expect("mempool lock");
                pool.relay_order()
                    .into_iter()
                    .map(|txid| (MSG_TX, txid))
                    .collect()
            };
            if !txids.is_empty() {
                peer.send_message("inv", &build_inv_payload(&txids));
            }
        }
        "sendheaders" => {
            peer.ctrl().node.send_headers = true;
        }
        "notfound" => {
            if let Ok(entries) = parse_inv(payload) {
                let mut sync = ctx.sync.lock().expect("sync lock");
                let mut ctrl = peer.ctrl();
                for (inv_type, hash) in entries {
                    if inv_type == MSG_BLOCK && ctrl.blocks_in_flight.remove(&hash).is_some() {
                        if let Some(entry) = sync.blocks_to_get.get_mut(&bidx(&hash)) {
                            entry.assigned_to = None;
                            entry.requested_at = None;
                        }
                    }
                }
            }
        }
        "version" | "verack" => {}
        _ => {
            crate::counters::bump("NetUnknownCmd");
        }
    }
}

/// Links a `headers` response into the tree and schedules downloads.
fn process_headers<S: KeyValueStore>(ctx: &NetCtx<S>, peer: &Arc<Peer>, payload: &[u8]) {
    let headers = match parse_headers_payload(payload) {
        Ok(headers) => headers,
        Err(_) => {
            peer.dos("BadHeaders");
            return;
        }
    };
    let count = headers.len();
    let mut accepted = 0usize;
    for header in headers {
        match ctx.chain.accept_header(header) {
            Ok(HeaderLink::Added(node)) => {
                accepted += 1;
                let (hash, height) = {
                    let tree = ctx.chain.lock_tree();
                    let tree_node = tree.node(node);
                    (tree_node.hash, tree_node.height)
                };
                let mut sync = ctx.sync.lock().expect("sync lock");
                sync.blocks_to_get.insert(
                    bidx(&hash),
                    BlockToGet {
                        hash,
                        node,
                        height,
                        assigned_to: None,
                        requested_at: None,
                    },
                );
            }
            Ok(HeaderLink::Duplicate(_)) => {
                crate::counters::bump("HeaderDuplicate");
            }
            Ok(HeaderLink::Orphan) => {
                // missing ancestry: ask again from our locator
                crate::counters::bump("HeaderOrphan");
                let mut ctrl = peer.ctrl();
                ctrl.all_headers_received = false;
                ctrl.get_headers_in_progress = false;
                return;
            }
            Err(reject) => {
                if reject.is_dos() {
                    peer.dos("BadHeader");
                } else {
                    crate::counters::bump("HeaderRejected");
                }
                return;
            }
        }
    }

    let mut ctrl = peer.ctrl();
    ctrl.get_headers_in_progress = false;
    if count < MAX_HEADERS_RESULTS {
        ctrl.all_headers_received = true;
    }
    if accepted > 0 {
        ctrl.get_blocks_data_now = true;
    }
}

/// Inventory handling, exactly the header-first discipline: block invs
/// flip the download switch or trigger another header sync; tx invs are
/// ignored while the chain is far behind.
fn process_inv<S: KeyValueStore>(ctx: &NetCtx<S>, peer: &Arc<Peer>, payload: &[u8]) {
    let entries = match parse_inv(payload) {
        Ok(entries) => entries,
        Err(_) => {
            peer.dos("InvBad");
            return;
        }
    };
    peer.ctrl().invs_received += entries.len() as u64;

    let mut tx_requests: Vec<(u32, Hash256)> = Vec::new();
    for (inv_type, hash) in entries {
        match inv_type {
            MSG_BLOCK => {
                let all_headers = peer.ctrl().all_headers_received;
                if !all_headers {
                    crate::counters::bump("InvBlockIgnored");
                    continue;
                }
                let mut sync = ctx.sync.lock().expect("sync lock");
                if sync.received_blocks.contains_key(&bidx(&hash)) {
                    crate::counters::bump("InvBlockOld");
                } else if let Some(entry) = sync.blocks_to_get.get(&bidx(&hash)) {
                    crate::counters::bump("InvBlockFresh");
                    let mut ctrl = peer.ctrl();
                    if ctrl.node.height < entry.height {
                        ctrl.node.height = entry.height;
                    }
                    ctrl.get_blocks_data_now = true;
                } else {
                    crate::counters::bump("InvBlockNew");
                    peer.ctrl().all_headers_received = false;
                }
            }
            MSG_TX => {
                if !ctx.config.tx_pool_enabled {
                    continue;
                }
                let pending = ctx.sync.lock().expect("sync lock").pending_block_count();
                if pending > MAX_PENDING_BLOCKS_FOR_TX {
                    crate::counters::bump("InvTxIgnored");
                    continue;
                }
                let known = ctx.mempool.lock().expect("mempool lock").contains(&hash);
                if !known {
                    tx_requests.push((MSG_TX, hash));
                }
            }
            _ => {}
        }
    }
    if !tx_requests.is_empty() {
        peer.send_message("getdata", &build_inv_payload(&tx_requests));
    }
}

/// A full block body came in: expected downloads go to the cache or the
/// main loop, anything else is noise.
async fn block_received<S: KeyValueStore>(ctx: &NetCtx<S>, peer: &Arc<Peer>, payload: &[u8]) {
    let mut block = match Block::new(payload.to_vec()) {
        Ok(block) => block,
        Err(_) => {
            peer.dos("BrokenBlock");
            return;
        }
    };
    let hash = *block.hash();
    let key = bidx(&hash);
    let now = Instant::now();

    let expected = {
        let mut sync = ctx.sync.lock().expect("sync lock");
        match sync.blocks_to_get.remove(&key) {
            Some(entry) => {
                sync.received_blocks
                    .insert(key, ReceivedBlock { first_seen: now });
                Some(entry)
            }
            None => None,
        }
    };
    peer.ctrl().blocks_in_flight.remove(&hash);

    let Some(entry) = expected else {
        let seen = ctx
            .sync
            .lock()
            .expect("sync lock")
            .received_blocks
            .contains_key(&key);
        if seen {
            crate::counters::bump("BlockSameRcvd");
        } else {
            crate::counters::bump("BlockUnexpected");
            peer.misbehave("UnexpectedBlock", 100);
        }
        return;
    };

    block.height = entry.height;
    let rcvd = BlockRcvd {
        block,
        node: Some(entry.node),
        from_peer: Some(peer.id),
        received_at: now,
    };
    let (tip_hash, _) = ctx.chain.tip_info();
    if rcvd.block.header.prev_block == tip_hash {
        let _ = ctx.net_blocks.send(rcvd).await;
    } else {
        crate::counters::bump("BlockCached");
        ctx.sync.lock().expect("sync lock").cached_blocks.push(rcvd);
    }
}

fn serve_getheaders<S: KeyValueStore>(ctx: &NetCtx<S>, peer: &Arc<Peer>, payload: &[u8]) {
    let Ok((locator, stop)) = parse_locator_payload(payload) else {
        peer.dos("BadGetHdrs");
        return;
    };
    let (_, tip_height) = ctx.chain.tip_info();
    let anchor = find_main_chain_anchor(ctx, &locator);

    let mut headers: Vec<[u8; HEADER_LEN]> = Vec::new();
    let tree = ctx.chain.lock_tree();
    let mut height = anchor + 1;
    while height <= tip_height && headers.len() < MAX_HEADERS_RESULTS {
        let Ok(Some(hash)) = ctx.chain.hash_at_height(height) else {
            break;
        };
        let Some(node) = tree.get(&hash) else { break };
        headers.push(tree.node(node).header);
        if hash == stop {
            break;
        }
        height += 1;
    }
    drop(tree);
    peer.send_message("headers", &build_headers_payload(&headers));
}

fn serve_getblocks<S: KeyValueStore>(ctx: &NetCtx<S>, peer: &Arc<Peer>, payload: &[u8]) {
    let Ok((locator, stop)) = parse_locator_payload(payload) else {
        peer.dos("BadGetBlks");
        return;
    };
    if locator.is_empty() {
        peer.dos("BadGetBlks");
        return;
    }
    let (_, tip_height) = ctx.chain.tip_info();
    let anchor = find_main_chain_anchor(ctx, &locator);

    let mut invs: Vec<(u32, Hash256)> = Vec::new();
    let mut height = anchor + 1;
    while height <= tip_height && invs.len() < MAX_GETBLOCKS_INVS {
        let Ok(Some(hash)) = ctx.chain.hash_at_height(height) else {
            break;
        };
        invs.push((MSG_BLOCK, hash));
        if hash == stop {
            break;
        }
        height += 1;
    }
    if invs.is_empty() {
        crate::counters::bump("GetblksMissed");
        return;
    }
    peer.send_message("inv", &build_inv_payload(&invs));
}

/// Highest locator entry that sits on our main chain.
fn find_main_chain_anchor<S: KeyValueStore>(ctx: &NetCtx<S>, locator: &[Hash256]) -> u32 {
    for hash in locator {
        let height = {
            let tree = ctx.chain.lock_tree();
            tree.get(hash).map(|node| tree.node(node).height)
        };
        let Some(height) = height else { continue };
        if let Ok(Some(main_hash)) = ctx.chain.hash_at_height(height) {
            if main_hash == *hash {
                return height;
            }
        }
    }
    0
}

fn serve_getdata<S: KeyValueStore>(ctx: &NetCtx<S>, peer: &Arc<Peer>, payload: &[u8]) {
    let entries = match parse_inv(payload) {
        Ok(entries) => entries,
        Err(_) => {
            peer.dos("BadGetData");
            return;
        }
    };
    let mut served_bytes = 0usize;
    let mut notfound: Vec<(u32, Hash256)> = Vec::new();
    for (inv_type, hash) in entries {
        match inv_type {
            MSG_BLOCK => {
                if served_bytes >= MAX_GETDATA_FORWARD {
                    break;
                }
                match ctx.chain.read_block_bytes_by_hash(&hash) {
                    Ok(bytes) => {
                        served_bytes += bytes.len();
                        peer.send_message("block", &bytes);
                    }
                    Err(_) => notfound.push((MSG_BLOCK, hash)),
                }
            }
            MSG_TX => {
                let raw = {
                    let pool = ctx.mempool.lock().expect("mempool lock");
                    pool.get(&hash).map(|entry| entry.raw.clone())
                };
                match raw {
                    Some(raw) => peer.send_message("tx", &raw),
                    None => notfound.push((MSG_TX, hash)),
                }
            }
            _ => {}
        }
    }
    if !notfound.is_empty() {
        peer.send_message("notfound", &build_inv_payload(&notfound));
    }
}

/// One pass of per-peer maintenance, run from the main loop's 1 s tick:
/// pings, stuck-peer teardown, header requests, block-download dispatch,
/// pending-inv flush and cache expiry.
pub fn network_tick<S: KeyValueStore>(ctx: &NetCtx<S>) {
    let now = Instant::now();
    let peers = ctx.peers.snapshot();
    let tip_height = ctx.chain.tip_height();

    // reschedule downloads whose peer went quiet
    {
        let mut sync = ctx.sync.lock().expect("sync lock");
        for entry in sync.blocks_to_get.values_mut() {
            let Some(requested_at) = entry.requested_at else {
                continue;
            };
            if now.duration_since(requested_at) <= GET_BLOCK_TIMEOUT {
                continue;
            }
            if let Some(peer_id) = entry.assigned_to.take() {
                entry.requested_at = None;
                crate::counters::bump("GetBlockTimeout");
                if let Some(peer) = ctx.peers.get(peer_id) {
                    log_debug!("peer {} timed out on block {}", peer.addr, hash_to_hex(&entry.hash));
                    peer.disconnect();
                }
            }
        }
        sync.expire_cached(now);
    }

    for peer in &peers {
        if peer.is_broken() {
            continue;
        }
        {
            let ctrl = peer.ctrl();
            if !ctrl.verack_received {
                continue;
            }
            if now.duration_since(ctrl.last_data_received) > NO_DATA_TIMEOUT {
                drop(ctrl);
                crate::counters::bump("NetNoDataTimeout");
                peer.disconnect();
                continue;
            }
        }

        match peer.ping_tick(now) {
            PingAction::Send(payload) => peer.send_message("ping", &payload),
            PingAction::TimedOut => {
                crate::counters::bump("PingTimeout");
                peer.disconnect();
                continue;
            }
            PingAction::None => {}
        }

        // header-first sync
        {
            let mut ctrl = peer.ctrl();
            if !ctrl.all_headers_received && !ctrl.get_headers_in_progress {
                ctrl.get_headers_in_progress = true;
                drop(ctrl);
                let locator = ctx.chain.block_locator();
                peer.send_message(
                    "getheaders",
                    &build_locator_payload(&locator, &[0u8; 32]),
                );
            }
        }

        dispatch_block_downloads(ctx, peer, tip_height, now);
        flush_pending_invs(ctx, peer);
    }
}

/// Hands unassigned block-download work to a willing peer, lowest height
/// first, within the in-flight and look-ahead limits.
fn dispatch_block_downloads<S: KeyValueStore>(
    ctx: &NetCtx<S>,
    peer: &Arc<Peer>,
    tip_height: u32,
    now: Instant,
) {
    let limit = ctx.config.inflight_per_peer.max(1);
    {
        let ctrl = peer.ctrl();
        if !ctrl.get_blocks_data_now || ctrl.blocks_in_flight.len() >= limit {
            return;
        }
    }

    let mut to_request: Vec<Hash256> = Vec::new();
    {
        let mut sync = ctx.sync.lock().expect("sync lock");
        let mut candidates: Vec<(u32, u64)> = sync
            .blocks_to_get
            .iter()
            .filter(|(_, entry)| {
                entry.assigned_to.is_none()
                    && entry.height <= tip_height.saturating_add(MAX_BLOCKS_FORWARD)
            })
            .map(|(key, entry)| (entry.height, *key))
            .collect();
        candidates.sort_unstable();

        let mut ctrl = peer.ctrl();
        for (_, key) in candidates {
            if ctrl.blocks_in_flight.len() + to_request.len() >= limit {
                break;
            }
            let entry = sync.blocks_to_get.get_mut(&key).expect("candidate exists");
            entry.assigned_to = Some(peer.id);
            entry.requested_at = Some(now);
            ctrl.blocks_in_flight.insert(entry.hash, now);
            to_request.push(entry.hash);
        }
        if to_request.is_empty() {
            ctrl.get_blocks_data_now = false;
            return;
        }
    }

    let invs: Vec<(u32, Hash256)> = to_request
        .into_iter()
        .map(|hash| (MSG_BLOCK, hash))
        .collect();
    peer.send_message("getdata", &build_inv_payload(&invs));
}

/// Sends out a peer's queued invs; block announcements upgrade to
/// `headers` messages for peers that asked with `sendheaders`.
fn flush_pending_invs<S: KeyValueStore>(ctx: &NetCtx<S>, peer: &Arc<Peer>) {
    let (pending, send_headers) = {
        let mut ctrl = peer.ctrl();
        if ctrl.pending_invs.is_empty() {
            return;
        }
        (std::mem::take(&mut ctrl.pending_invs), ctrl.node.send_headers)
    };

    let mut plain: Vec<(u32, Hash256)> = Vec::new();
    let mut header_blocks: Vec<[u8; HEADER_LEN]> = Vec::new();
    for inv in &pending {
        let inv_type = u32::from_le_bytes([inv[0], inv[1], inv[2], inv[3]]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&inv[4..]);
        if inv_type == MSG_BLOCK && send_headers {
            let tree = ctx.chain.lock_tree();
            if let Some(node) = tree.get(&hash) {
                header_blocks.push(tree.node(node).header);
                continue;
            }
        }
        plain.push((inv_type, hash));
    }

    if !header_blocks.is_empty() {
        crate::counters::bump("InvSentAsHeader");
        peer.send_message("headers", &build_headers_payload(&header_blocks));
    }
    if !plain.is_empty() {
        peer.send_message("inv", &build_inv_payload(&plain));
    }
}

/// Queues an inv on every open connection except the source. Type-1 invs
/// skip peers that opted out of tx relay, and our own transactions are
/// not pushed at peers that never inv'd us anything.
pub fn net_route_inv(
    peers: &crate::p2p_server::PeerManager,
    inv_type: u32,
    hash: &Hash256,
    except: Option<u64>,
) -> usize {
    let inv = build_inv_entry(inv_type, hash);
    let mut queued = 0usize;
    for peer in peers.snapshot() {
        if Some(peer.id) == except || peer.is_broken() {
            continue;
        }
        {
            let ctrl = peer.ctrl();
            if inv_type == MSG_TX && ctrl.node.do_not_relay_txs {
                crate::counters::bump("SendInvNoTxNode");
                continue;
            }
            if inv_type == MSG_TX && except.is_none() && ctrl.invs_received == 0 {
                // do not leak our own transactions to silent peers
                crate::counters::bump("SendInvOwnBlocked");
                continue;
            }
        }
        if peer.queue_inv(inv) {
            queued += 1;
        }
    }
    queued
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rcvd(height: u32, age: Duration) -> BlockRcvd {
        let header = btcd_primitives::block::BlockHeader {
            version: 2,
            prev_block: [height as u8; 32],
            merkle_root: [0u8; 32],
            time: 0,
            bits: 0x207f_ffff,
            nonce: height,
        };
        let mut raw = header.consensus_encode().to_vec();
        raw.push(1);
        // minimal fake coinbase body so Block::new parses
        let tx = btcd_primitives::transaction::Transaction {
            version: 1,
            vin: vec![btcd_primitives::transaction::TxIn {
                prevout: btcd_primitives::outpoint::OutPoint::null(),
                script_sig: vec![0, 0],
                sequence: u32::MAX,
            }],
            vout: vec![btcd_primitives::transaction::TxOut {
                value: 0,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        raw.extend_from_slice(&tx.consensus_encode());
        let mut block = Block::new(raw).unwrap();
        block.height = height;
        BlockRcvd {
            block,
            node: None,
            from_peer: None,
            received_at: Instant::now() - age,
        }
    }

    #[test]
    fn cached_blocks_expire_after_twenty_minutes() {
        let mut sync = SyncState::default();
        sync.cached_blocks.push(rcvd(1, Duration::from_secs(0)));
        sync.cached_blocks
            .push(rcvd(2, EXPIRE_CACHED_AFTER + Duration::from_secs(1)));
        assert_eq!(sync.expire_cached(Instant::now()), 1);
        assert_eq!(sync.cached_blocks.len(), 1);
        assert_eq!(sync.cached_blocks[0].block.height, 1);
    }

    #[test]
    fn take_cached_matches_next_height() {
        let mut sync = SyncState::default();
        sync.cached_blocks.push(rcvd(5, Duration::from_secs(0)));
        sync.cached_blocks.push(rcvd(4, Duration::from_secs(0)));
        let taken = sync.take_cached_at(4, &[0xff; 32]).expect("height 4 cached");
        assert_eq!(taken.block.height, 4);
        assert!(sync.take_cached_at(4, &[0xff; 32]).is_none());
        assert_eq!(sync.cached_blocks.len(), 1);
    }

}
