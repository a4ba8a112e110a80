//! Connection lifecycle: the open-connection registry, accept and dial
//! loops, handshake, per-peer reader/writer tasks, hammering protection
//! and the periodic slowest-peer drop.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use btcd_storage::KeyValueStore;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::p2p::{
    build_message, build_version_payload, parse_version, read_message, Peer, PeerError,
    ANY_SEND_TIMEOUT, NO_DATA_TIMEOUT, TCP_DIAL_TIMEOUT,
};
use crate::peer_book::DEFAULT_BAN_SECS;
use crate::NetCtx;

/// An inbound address reconnecting faster than this gets turned away.
pub const HAMMERING_MIN_RECONNECT: Duration = Duration::from_secs(60);
pub const DROP_SLOWEST_EVERY: Duration = Duration::from_secs(10 * 60);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const WRITER_CHUNK: usize = 64 * 1024;
const DIAL_PAUSE: Duration = Duration::from_secs(1);

pub struct PeerManager {
    peers: Mutex<HashMap<u64, Arc<Peer>>>,
    next_id: AtomicU64,
    in_active: AtomicUsize,
    out_active: AtomicUsize,
    recently_disconnected: Mutex<HashMap<IpAddr, Instant>>,
    network_closed: AtomicBool,
    pub our_nonce: u64,
    pub max_inbound: usize,
    pub max_outbound: usize,
}

impl PeerManager {
    pub fn new(max_inbound: usize, max_outbound: usize) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            in_active: AtomicUsize::new(0),
            out_active: AtomicUsize::new(0),
            recently_disconnected: Mutex::new(HashMap::new()),
            network_closed: AtomicBool::new(false),
            our_nonce: rand::random(),
            max_inbound,
            max_outbound,
        }
    }

    pub fn next_peer_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers
            .lock()
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, id: u64) -> Option<Arc<Peer>> {
        self.peers.lock().ok()?.get(&id).cloned()
    }

    pub fn counts(&self) -> (usize, usize) {
        (
            self.in_active.load(Ordering::Relaxed),
            self.out_active.load(Ordering::Relaxed),
        )
    }

    pub fn connected_addrs(&self) -> HashSet<SocketAddr> {
        self.peers
            .lock()
            .map(|peers| peers.values().map(|peer| peer.addr).collect())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.network_closed.load(Ordering::SeqCst)
    }

    pub fn register(&self, peer: Arc<Peer>) {
        if peer.inbound {
            self.in_active.fetch_add(1, Ordering::Relaxed);
        } else {
            self.out_active.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(peer.id, peer);
        }
    }

    pub fn unregister(&self, peer: &Peer) {
        let removed = self
            .peers
            .lock()
            .map(|mut peers| peers.remove(&peer.id).is_some())
            .unwrap_or(false);
        if !removed {
            return;
        }
        if peer.inbound {
            self.in_active.fetch_sub(1, Ordering::Relaxed);
            if let Ok(mut recent) = self.recently_disconnected.lock() {
                recent.insert(peer.addr.ip(), Instant::now());
            }
        } else {
            self.out_active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Gate for the accept loop; the error names the reason for the log.
    pub fn admit_inbound(&self, addr: SocketAddr) -> Result<(), &'static str> {
        if self.is_closed() {
            return Err("shutting down");
        }
        if self.in_active.load(Ordering::Relaxed) >= self.max_inbound {
            return Err("inbound slots full");
        }
        let hammering = self
            .recently_disconnected
            .lock()
            .map(|recent| {
                recent
                    .get(&addr.ip())
                    .map(|last| last.elapsed() < HAMMERING_MIN_RECONNECT)
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if hammering {
            return Err("hammering");
        }
        Ok(())
    }

    /// Tosses the outbound peer with the worst round-trip average.
    pub fn drop_slowest(&self) -> Option<SocketAddr> {
        let victim = self
            .snapshot()
            .into_iter()
            .filter(|peer| !peer.inbound && !peer.is_broken() && peer.ctrl().verack_received)
            .max_by_key(|peer| peer.average_ping_ms())?;
        crate::counters::bump("DropSlowest");
        log_info!(
            "dropping slowest peer {} (avg ping {} ms)",
            victim.addr,
            victim.average_ping_ms()
        );
        victim.disconnect();
        Some(victim.addr)
    }

    /// Disables new connections, breaks every peer and waits for the
    /// reader/writer tasks to unwind; bounded by the send timeout.
    pub async fn close_all(&self) {
        self.network_closed.store(true, Ordering::SeqCst);
        for peer in self.snapshot() {
            peer.disconnect();
        }
        let deadline = Instant::now() + ANY_SEND_TIMEOUT + Duration::from_secs(5);
        loop {
            let (inbound, outbound) = self.counts();
            if inbound == 0 && outbound == 0 {
                return;
            }
            if Instant::now() > deadline {
                log_warn!("{} connection(s) still active at shutdown", inbound + outbound);
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Listens for and serves inbound connections.
pub async fn serve_accept<S: KeyValueStore + Send + Sync + 'static>(
    ctx: NetCtx<S>,
    listener: TcpListener,
) {
    if let Ok(local) = listener.local_addr() {
        log_info!("listening for peers on {local}");
    }
    loop {
        if ctx.peers.is_closed() {
            return;
        }
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                log_warn!("accept failed: {err}");
                continue;
            }
        };
        if ctx.addr_book.is_banned(addr.ip()) {
            crate::counters::bump("InboundBanned");
            drop(stream);
            continue;
        }
        if let Err(reason) = ctx.peers.admit_inbound(addr) {
            crate::counters::bump("InboundRefused");
            log_debug!("refusing inbound peer {addr}: {reason}");
            if reason == "hammering" {
                ctx.addr_book
                    .ban(addr.ip(), HAMMERING_MIN_RECONNECT);
            }
            drop(stream);
            continue;
        }
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = run_peer(ctx, stream, addr, true).await {
                log_debug!("inbound peer {addr} closed: {err}");
            }
        });
    }
}

/// Keeps the outbound slots filled from the address book and runs the
/// ten-minute slowest-peer drop.
pub async fn maintain_outbound<S: KeyValueStore + Send + Sync + 'static>(ctx: NetCtx<S>) {
    let mut last_drop = Instant::now();
    loop {
        if ctx.peers.is_closed() {
            return;
        }
        let (_, outbound) = ctx.peers.counts();
        if outbound < ctx.peers.max_outbound {
            if let Some(addr) = ctx.addr_book.pick_dial_target(&ctx.peers.connected_addrs()) {
                ctx.addr_book.note_attempt(addr);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    match timeout(TCP_DIAL_TIMEOUT, TcpStream::connect(addr)).await {
                        Ok(Ok(stream)) => {
                            if let Err(err) = run_peer(ctx.clone(), stream, addr, false).await {
                                log_debug!("outbound peer {addr} closed: {err}");
                                ctx.addr_book.note_failure(addr);
                            }
                        }
                        _ => {
                            crate::counters::bump("DialFailed");
                            ctx.addr_book.note_failure(addr);
                        }
                    }
                });
            }
        } else if last_drop.elapsed() >= DROP_SLOWEST_EVERY {
            last_drop = Instant::now();
            ctx.peers.drop_slowest();
        }
        tokio::time::sleep(DIAL_PAUSE).await;
    }
}

/// Runs one connection to completion: handshake, then the reader loop
/// with a paired writer task draining the send ring.
pub async fn run_peer<S: KeyValueStore + Send + Sync + 'static>(
    ctx: NetCtx<S>,
    stream: TcpStream,
    addr: SocketAddr,
    inbound: bool,
) -> Result<(), String> {
    let magic = ctx.chain.params().message_start;
    let peer = Arc::new(Peer::new(ctx.peers.next_peer_id(), addr, inbound, magic));
    ctx.peers.register(Arc::clone(&peer));

    let result = drive_peer(&ctx, &peer, stream).await;

    peer.disconnect();
    if peer.is_banned() {
        ctx.addr_book
            .ban(addr.ip(), Duration::from_secs(DEFAULT_BAN_SECS));
    }
    release_in_flight(&ctx, &peer);
    ctx.peers.unregister(&peer);
    result
}

async fn drive_peer<S: KeyValueStore + Send + Sync + 'static>(
    ctx: &NetCtx<S>,
    peer: &Arc<Peer>,
    mut stream: TcpStream,
) -> Result<(), String> {
    handshake(ctx, peer, &mut stream)
        .await
        .map_err(|err| format!("handshake failed: {err}"))?;

    if !peer.inbound {
        // inbound source ports are ephemeral and no use for dialing
        ctx.addr_book.note_success(peer.addr);
    }
    log_info!(
        "peer {} ({}) connected, height {}",
        peer.addr,
        peer.ctrl().node.agent,
        peer.ctrl().node.height
    );
    peer.send_message("getaddr", &[]);

    // a dedicated writer drains the ring while the reader dispatches
    let (mut read_half, write_half) = stream.into_split();
    let writer = tokio::spawn(writer_task(Arc::clone(peer), write_half));

    let result = loop {
        if peer.is_broken() {
            break Ok(());
        }
        let message = match timeout(NO_DATA_TIMEOUT, read_message(&mut read_half, magic_of(ctx))).await
        {
            Err(_) => {
                crate::counters::bump("NetNoDataTimeout");
                break Ok(());
            }
            Ok(Err(PeerError::Closed)) => break Ok(()),
            Ok(Err(err)) => {
                if err.is_dos() {
                    crate::counters::bump("NetMsgViolation");
                    peer.dos("bad message");
                } else {
                    crate::counters::bump("NetReadError");
                }
                break Err(err.to_string());
            }
            Ok(Ok(message)) => message,
        };
        let (command, payload) = message;
        crate::sync::handle_message(ctx, peer, &command, &payload).await;
    };

    peer.disconnect();
    let _ = writer.await;
    result
}

fn magic_of<S: KeyValueStore>(ctx: &NetCtx<S>) -> [u8; 4] {
    ctx.chain.params().message_start
}

fn release_in_flight<S: KeyValueStore>(ctx: &NetCtx<S>, peer: &Peer) {
    let hashes: Vec<_> = peer.ctrl().blocks_in_flight.keys().copied().collect();
    if hashes.is_empty() {
        return;
    }
    let mut sync = ctx.sync.lock().expect("sync lock");
    for hash in hashes {
        if let Some(entry) = sync.blocks_to_get.get_mut(&btcd_consensus::bidx(&hash)) {
            if entry.assigned_to == Some(peer.id) {
                entry.assigned_to = None;
                entry.requested_at = None;
            }
        }
    }
}

/// The version/verack exchange, both directions, with self-connection
/// detection via the nonce.
async fn handshake<S: KeyValueStore>(
    ctx: &NetCtx<S>,
    peer: &Arc<Peer>,
    stream: &mut TcpStream,
) -> Result<(), String> {
    let magic = magic_of(ctx);
    let start_height = ctx.chain.tip_height();
    let relay_txs = ctx.config.tx_relay_enabled;

    let mut version_sent = false;
    if !peer.inbound {
        let payload =
            build_version_payload(ctx.peers.our_nonce, start_height, Some(peer.addr), relay_txs);
        stream
            .write_all(&build_message(magic, "version", &payload))
            .await
            .map_err(|err| err.to_string())?;
        version_sent = true;
    }

    let mut got_version = false;
    let mut got_verack = false;
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    while !(got_version && got_verack) {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or("handshake timed out")?;
        let (command, payload) = timeout(remaining, read_message(stream, magic))
            .await
            .map_err(|_| "handshake timed out".to_string())?
            .map_err(|err| err.to_string())?;
        match command.as_str() {
            "version" => {
                let node = parse_version(&payload).map_err(|err| err.to_string())?;
                if node.nonce == ctx.peers.our_nonce {
                    crate::counters::bump("SelfConnection");
                    return Err("connected to ourselves".to_string());
                }
                peer.ctrl().node = node;
                got_version = true;
                if !version_sent {
                    let payload = build_version_payload(
                        ctx.peers.our_nonce,
                        start_height,
                        Some(peer.addr),
                        relay_txs,
                    );
                    stream
                        .write_all(&build_message(magic, "version", &payload))
                        .await
                        .map_err(|err| err.to_string())?;
                    version_sent = true;
                }
                stream
                    .write_all(&build_message(magic, "verack", &[]))
                    .await
                    .map_err(|err| err.to_string())?;
            }
            "verack" => got_verack = true,
            "ping" => {
                stream
                    .write_all(&build_message(magic, "pong", &payload))
                    .await
                    .map_err(|err| err.to_string())?;
            }
            _ => {}
        }
    }
    peer.ctrl().verack_received = true;
    Ok(())
}

async fn writer_task(peer: Arc<Peer>, mut half: OwnedWriteHalf) {
    let mut chunk = vec![0u8; WRITER_CHUNK];
    loop {
        let (count, broken) = {
            let ctrl = peer.ctrl();
            (ctrl.send_buf.peek(&mut chunk), ctrl.broken)
        };
        if count == 0 {
            if broken {
                break;
            }
            let _ = timeout(Duration::from_millis(500), peer.writer_wake.notified()).await;
            continue;
        }
        match timeout(ANY_SEND_TIMEOUT, half.write_all(&chunk[..count])).await {
            Ok(Ok(())) => {
                peer.ctrl().send_buf.consume(count);
            }
            _ => {
                crate::counters::bump("NetSendTimeout");
                peer.disconnect();
                break;
            }
        }
    }
    let _ = half.shutdown().await;
}
