//! The single-threaded arbiter: every consensus-critical mutation runs
//! here, fed by typed channels from the peer tasks, the command surface
//! and the periodic ticks.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use btcd_chainstate::state::ChainError;
use btcd_consensus::{hash_to_hex, Hash256};
use btcd_primitives::block::Block;
use btcd_primitives::transaction::Transaction;
use btcd_storage::KeyValueStore;
use tokio::sync::{mpsc, oneshot, watch};

use crate::mempool::{MempoolError, TxSource};
use crate::p2p::{MSG_BLOCK, MSG_TX};
use crate::sync::{net_route_inv, BlockRcvd, TxRcvd};
use crate::NetCtx;

/// A freshly mined block is one no older than this; only those are
/// re-announced and beeped about.
const FRESH_BLOCK_AGE_SECS: u64 = 10 * 60;

pub struct PeerSummary {
    pub id: u64,
    pub addr: std::net::SocketAddr,
    pub inbound: bool,
    pub agent: String,
    pub height: u32,
    pub ping_ms: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub blocks_in_flight: usize,
    pub invs_to_send: usize,
    pub misbehave: u32,
}

/// Records enqueued by the command surface (RPC, UIs); each one is
/// answered on its oneshot once the main loop has run it.
pub enum Command {
    SubmitBlock {
        raw: Vec<u8>,
        reply: oneshot::Sender<Result<Hash256, String>>,
    },
    SubmitTx {
        raw: Vec<u8>,
        reply: oneshot::Sender<Result<Hash256, String>>,
    },
    Tip {
        reply: oneshot::Sender<(Hash256, u32)>,
    },
    PeerList {
        reply: oneshot::Sender<Vec<PeerSummary>>,
    },
    MempoolList {
        reply: oneshot::Sender<Vec<Hash256>>,
    },
    DropPeer {
        id: u64,
    },
    Quit,
}

fn beep(enabled: bool) {
    if enabled {
        eprint!("\x07");
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Commits one received block and performs the follow-up work: mempool
/// sweep, inventory routing for fresh blocks, fork warnings.
pub fn local_accept_block<S: KeyValueStore>(
    ctx: &NetCtx<S>,
    rcvd: BlockRcvd,
) -> Result<(), ChainError> {
    let BlockRcvd {
        mut block,
        node,
        from_peer,
        ..
    } = rcvd;
    let hash = *block.hash();

    match node {
        Some(node) => ctx.chain.commit_block(&mut block, node)?,
        None => ctx.chain.accept_block(&mut block)?,
    }

    {
        let mut pool = ctx.mempool.lock().expect("mempool lock");
        for index in 1..block.txs.len() {
            pool.on_block_mined(&block.txs[index], &block.txids[index]);
        }
    }

    let fresh = u64::from(block.header.time) + FRESH_BLOCK_AGE_SECS > now_secs();
    let (tip_hash, _) = ctx.chain.tip_info();
    if fresh {
        net_route_inv(&ctx.peers, MSG_BLOCK, &hash, from_peer);
        if tip_hash == hash {
            log_info!("new block {} at height {}", hash_to_hex(&hash), block.height);
            beep(ctx.config.beep_new_block);
        }
    }

    if tip_hash != hash {
        // accepted but not the tip: a fork block
        let fork_depth = {
            let tree = ctx.chain.lock_tree();
            match tree.get(&hash) {
                Some(node) => {
                    let common = tree.first_common_parent(ctx.chain.tip(), node);
                    tree.node(node).height - tree.node(common).height
                }
                None => 0,
            }
        };
        if fork_depth > 1 {
            log_warn!(
                "fork is {fork_depth} blocks deep at {}",
                hash_to_hex(&hash)
            );
            beep(ctx.config.beep_fork);
        }
    }
    Ok(())
}

/// A block arrived from the network: commit it when it links, otherwise
/// park it in the out-of-order cache.
pub fn handle_net_block<S: KeyValueStore>(
    ctx: &NetCtx<S>,
    rcvd: BlockRcvd,
    retry_cached: &mut bool,
) {
    let (tip_hash, tip_height) = ctx.chain.tip_info();
    let linking = match rcvd.node {
        Some(_) => rcvd.block.height <= tip_height + 1,
        None => {
            let tree = ctx.chain.lock_tree();
            tree.contains(&rcvd.block.header.prev_block) || rcvd.block.header.prev_block == tip_hash
        }
    };
    if !linking {
        crate::counters::bump("BlockPostponed");
        ctx.sync
            .lock()
            .expect("sync lock")
            .cached_blocks
            .push(rcvd);
        return;
    }

    let from_peer = rcvd.from_peer;
    let hash = *rcvd.block.hash();
    match local_accept_block(ctx, rcvd) {
        Ok(()) => {
            crate::counters::bump("BlockAccepted");
            *retry_cached = true;
        }
        Err(err) => {
            log_warn!("block {} rejected: {err}", hash_to_hex(&hash));
            punish_block_sender(ctx, from_peer, &err);
        }
    }
}

fn punish_block_sender<S: KeyValueStore>(
    ctx: &NetCtx<S>,
    from_peer: Option<u64>,
    err: &ChainError,
) {
    let hostile = match err {
        ChainError::Reject(reject) => reject.is_dos(),
        other => other.is_consensus_fault(),
    };
    if !hostile {
        return;
    }
    if let Some(peer) = from_peer.and_then(|id| ctx.peers.get(id)) {
        peer.dos("BadBlock");
    }
}

/// Commits at most one cached block that now links onto the tip; returns
/// whether more cached blocks remain to try.
pub fn retry_cached_blocks<S: KeyValueStore>(ctx: &NetCtx<S>) -> bool {
    crate::counters::bump("RedoCachedBlocks");
    let (tip_hash, tip_height) = ctx.chain.tip_info();
    let taken = {
        let mut sync = ctx.sync.lock().expect("sync lock");
        sync.take_cached_at(tip_height + 1, &tip_hash)
    };
    let Some(rcvd) = taken else {
        return false;
    };
    let from_peer = rcvd.from_peer;
    let hash = *rcvd.block.hash();
    if let Err(err) = local_accept_block(ctx, rcvd) {
        log_warn!("cached block {} rejected: {err}", hash_to_hex(&hash));
        punish_block_sender(ctx, from_peer, &err);
    }
    !ctx.sync.lock().expect("sync lock").cached_blocks.is_empty()
}

/// A transaction body from the network or a local submitter.
pub fn handle_net_tx<S: KeyValueStore>(ctx: &NetCtx<S>, rcvd: TxRcvd) -> Result<Hash256, String> {
    let tx = match Transaction::consensus_decode(&rcvd.raw) {
        Ok(tx) => tx,
        Err(err) => {
            if let Some(peer) = rcvd.from_peer.and_then(|id| ctx.peers.get(id)) {
                peer.misbehave("BrokenTx", 100);
            }
            return Err(format!("broken transaction: {err}"));
        }
    };
    let source = if rcvd.from_peer.is_none() {
        TxSource::Own
    } else {
        TxSource::External
    };
    let outcome = {
        let mut pool = ctx.mempool.lock().expect("mempool lock");
        pool.admit(ctx.chain.as_ref(), tx, rcvd.raw, source)
    };
    match outcome {
        Ok(txid) => {
            crate::counters::bump("TxAccepted");
            let routed = net_route_inv(&ctx.peers, MSG_TX, &txid, rcvd.from_peer);
            if rcvd.from_peer.is_none() && routed == 0 {
                log_warn!("own transaction was not announced to any peer");
            }
            Ok(txid)
        }
        Err(err) => {
            match &err {
                MempoolError::AlreadyKnown => crate::counters::bump("TxDuplicate"),
                MempoolError::MissingInputs(_) => crate::counters::bump("TxMissingInputs"),
                MempoolError::FeeTooLow { .. } => crate::counters::bump("TxFeeTooLow"),
                MempoolError::Script(_) | MempoolError::Invalid(_) => {
                    crate::counters::bump("TxInvalid");
                    if let Some(peer) = rcvd.from_peer.and_then(|id| ctx.peers.get(id)) {
                        peer.misbehave("BadTx", 100);
                    }
                }
                _ => crate::counters::bump("TxRejected"),
            }
            Err(err.to_string())
        }
    }
}

fn peer_summaries<S: KeyValueStore>(ctx: &NetCtx<S>) -> Vec<PeerSummary> {
    ctx.peers
        .snapshot()
        .into_iter()
        .map(|peer| {
            let ctrl = peer.ctrl();
            PeerSummary {
                id: peer.id,
                addr: peer.addr,
                inbound: peer.inbound,
                agent: ctrl.node.agent.clone(),
                height: ctrl.node.height,
                ping_ms: ctrl.average_ping_ms(),
                bytes_sent: ctrl.bytes_sent,
                bytes_received: ctrl.bytes_received,
                blocks_in_flight: ctrl.blocks_in_flight.len(),
                invs_to_send: ctrl.pending_invs.len(),
                misbehave: ctrl.misbehave,
            }
        })
        .collect()
}

enum Flow {
    Continue,
    Quit,
}

fn handle_command<S: KeyValueStore>(ctx: &NetCtx<S>, command: Command) -> Flow {
    match command {
        Command::SubmitBlock { raw, reply } => {
            let result = Block::new(raw)
                .map_err(|err| err.to_string())
                .and_then(|block| {
                    let hash = *block.hash();
                    let rcvd = BlockRcvd {
                        block,
                        node: None,
                        from_peer: None,
                        received_at: std::time::Instant::now(),
                    };
                    local_accept_block(ctx, rcvd)
                        .map(|_| hash)
                        .map_err(|err| err.to_string())
                });
            let _ = reply.send(result);
        }
        Command::SubmitTx { raw, reply } => {
            let result = handle_net_tx(
                ctx,
                TxRcvd {
                    raw,
                    from_peer: None,
                },
            );
            let _ = reply.send(result);
        }
        Command::Tip { reply } => {
            let _ = reply.send(ctx.chain.tip_info());
        }
        Command::PeerList { reply } => {
            let _ = reply.send(peer_summaries(ctx));
        }
        Command::MempoolList { reply } => {
            let order = ctx.mempool.lock().expect("mempool lock").relay_order();
            let _ = reply.send(order);
        }
        Command::DropPeer { id } => {
            if let Some(peer) = ctx.peers.get(id) {
                log_info!("dropping and banning peer {} on request", peer.addr);
                peer.dos("FromUI");
            }
        }
        Command::Quit => return Flow::Quit,
    }
    Flow::Continue
}

/// The select loop. Exactly one consensus-critical operation at a time;
/// commands ride the same serialization point as network events.
pub async fn run<S: KeyValueStore + Send + Sync + 'static>(
    ctx: NetCtx<S>,
    mut commands: mpsc::Receiver<Command>,
    mut net_blocks: mpsc::Receiver<BlockRcvd>,
    mut net_txs: mpsc::Receiver<TxRcvd>,
    mut net_alerts: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut net_tick = tokio::time::interval(Duration::from_secs(1));
    let mut peers_tick = tokio::time::interval(Duration::from_secs(5 * 60));
    let mut tx_tick = tokio::time::interval(Duration::from_secs(60));
    net_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    peers_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tx_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut retry_cached = false;
    loop {
        crate::counters::bump("MainThreadLoops");
        // drain the cache one block per pass, yielding between commits
        while retry_cached {
            retry_cached = retry_cached_blocks(&ctx);
            if *shutdown.borrow() {
                return;
            }
            tokio::task::yield_now().await;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            Some(command) = commands.recv() => {
                crate::counters::bump("MainUICmd");
                if matches!(handle_command(&ctx, command), Flow::Quit) {
                    return;
                }
            }
            Some(rcvd) = net_blocks.recv() => {
                crate::counters::bump("MainNetBlock");
                handle_net_block(&ctx, rcvd, &mut retry_cached);
            }
            Some(rcvd) = net_txs.recv() => {
                crate::counters::bump("MainNetTx");
                let _ = handle_net_tx(&ctx, rcvd);
            }
            Some(alert) = net_alerts.recv() => {
                crate::counters::bump("MainNetAlert");
                log_warn!("{alert}");
            }
            _ = net_tick.tick() => {
                crate::sync::network_tick(&ctx);
            }
            _ = peers_tick.tick() => {
                let dropped = ctx.addr_book.expire();
                if dropped > 0 {
                    log_debug!("expired {dropped} peer address(es)");
                }
            }
            _ = tx_tick.tick() => {
                let (expired, evicted) = ctx.mempool.lock().expect("mempool lock").expire();
                if expired + evicted > 0 {
                    log_debug!("mempool dropped {expired} expired / {evicted} evicted");
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                crate::counters::bump("MainThreadTimeouts");
                if retry_cached {
                    retry_cached = retry_cached_blocks(&ctx);
                } else if let Ok(true) = ctx.chain.idle() {
                    crate::counters::bump("ChainIdleUsed");
                }
            }
        }
    }
}
