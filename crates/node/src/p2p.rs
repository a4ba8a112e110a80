//! Per-peer plumbing: message framing, the bounded ring send buffer, the
//! misbehavior score and ping bookkeeping, plus the payload builders and
//! parsers for every wire command we speak.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use btcd_consensus::constants::{MIN_PROTO_VERSION, PROTOCOL_VERSION};
use btcd_consensus::Hash256;
use btcd_primitives::block::HEADER_LEN;
use btcd_primitives::encoding::{Decoder, Encoder};
use btcd_primitives::hash::sha256d;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;

pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;

/// If this much is queued in the send buffer, the peer is too slow.
pub const SEND_BUF_SIZE: usize = 4 * 1024 * 1024;
pub const MAX_PENDING_INVS: usize = 500;
pub const MAX_HEADERS_RESULTS: usize = 2000;

pub const NO_DATA_TIMEOUT: Duration = Duration::from_secs(2 * 60);
pub const ANY_SEND_TIMEOUT: Duration = Duration::from_secs(30);
pub const GET_BLOCK_TIMEOUT: Duration = Duration::from_secs(15);
pub const TCP_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub const PING_PERIOD: Duration = Duration::from_secs(60);
pub const PING_TIMEOUT: Duration = Duration::from_secs(30);
const PING_HISTORY_LENGTH: usize = 8;
/// Ignore this many of the longest samples when averaging.
const PING_IGNORED_LONGEST: usize = 4;
pub const PING_ASSUMED_IF_UNSUPPORTED: u32 = 999;

const NODE_NETWORK: u64 = 1;
const USER_AGENT: &str = concat!("/btcd:", env!("CARGO_PKG_VERSION"), "/");

const BAN_SCORE_LIMIT: u32 = 1000;

/// Maximum accepted payload size per command; anything larger is a
/// DoS-scored protocol violation.
pub fn max_payload_size(command: &str) -> usize {
    match command {
        "inv" | "getdata" | "headers" => 3 + 50_000 * 36,
        "getblocks" | "getheaders" => 4 + 3 + 500 * 32 + 32,
        "tx" => 100_000,
        "block" => 1_000_000,
        "addr" => 3 + 1000 * 30,
        _ => 1024,
    }
}

#[derive(Debug)]
pub enum PeerError {
    Io(String),
    Closed,
    BadMagic,
    BadChecksum,
    MsgTooBig(String),
    Protocol(&'static str),
}

impl PeerError {
    /// Violations that imply malice rather than flaky transport.
    pub fn is_dos(&self) -> bool {
        matches!(
            self,
            PeerError::BadChecksum | PeerError::MsgTooBig(_) | PeerError::Protocol(_)
        )
    }
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerError::Io(err) => write!(f, "{err}"),
            PeerError::Closed => write!(f, "connection closed"),
            PeerError::BadMagic => write!(f, "bad message magic"),
            PeerError::BadChecksum => write!(f, "bad payload checksum"),
            PeerError::MsgTooBig(cmd) => write!(f, "oversize {cmd} payload"),
            PeerError::Protocol(reason) => write!(f, "{reason}"),
        }
    }
}

impl std::error::Error for PeerError {}

/// Single-producer single-consumer byte ring. The producer side is any
/// task holding the peer mutex; the per-peer writer task consumes. The
/// producer index never catches the consumer: a message that would fill
/// the last byte is refused instead.
pub struct SendBuffer {
    buf: Box<[u8]>,
    prod: usize,
    cons: usize,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; SEND_BUF_SIZE].into_boxed_slice(),
            prod: 0,
            cons: 0,
        }
    }

    pub fn queued(&self) -> usize {
        if self.prod >= self.cons {
            self.prod - self.cons
        } else {
            self.prod + SEND_BUF_SIZE - self.cons
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prod == self.cons
    }

    /// Appends a full frame; false when it does not fit.
    pub fn push(&mut self, data: &[u8]) -> bool {
        let free = SEND_BUF_SIZE - self.queued();
        if free <= data.len() {
            return false;
        }
        let room = SEND_BUF_SIZE - self.prod;
        if room >= data.len() {
            self.buf[self.prod..self.prod + data.len()].copy_from_slice(data);
            self.prod = (self.prod + data.len()) % SEND_BUF_SIZE;
        } else {
            self.buf[self.prod..].copy_from_slice(&data[..room]);
            self.buf[..data.len() - room].copy_from_slice(&data[room..]);
            self.prod = data.len() - room;
        }
        true
    }

    /// Copies queued bytes into `out` without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let take = self.queued().min(out.len());
        let room = SEND_BUF_SIZE - self.cons;
        if take <= room {
            out[..take].copy_from_slice(&self.buf[self.cons..self.cons + take]);
        } else {
            out[..room].copy_from_slice(&self.buf[self.cons..]);
            out[room..take].copy_from_slice(&self.buf[..take - room]);
        }
        take
    }

    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.queued());
        self.cons = (self.cons + count) % SEND_BUF_SIZE;
    }
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Remote node data carried by its `version` message.
#[derive(Clone, Debug, Default)]
pub struct RemoteNode {
    pub version: u32,
    pub services: u64,
    pub timestamp: u64,
    pub height: u32,
    pub agent: String,
    pub do_not_relay_txs: bool,
    pub send_headers: bool,
    pub nonce: u64,
}

pub struct PeerCtrl {
    pub send_buf: SendBuffer,
    pub broken: bool,
    pub banit: bool,
    pub misbehave: u32,
    pub node: RemoteNode,
    pub verack_received: bool,

    pub pending_invs: Vec<[u8; 36]>,
    pub blocks_in_flight: HashMap<Hash256, Instant>,
    pub invs_received: u64,

    pub all_headers_received: bool,
    pub get_headers_in_progress: bool,
    pub get_blocks_data_now: bool,

    pub last_data_received: Instant,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub max_send_buf_use: usize,
    pub connected_at: Instant,

    pub next_ping: Instant,
    pub ping_in_progress: Option<(Vec<u8>, Instant)>,
    ping_history_ms: [u32; PING_HISTORY_LENGTH],
    ping_history_idx: usize,
    ping_samples: usize,
}

impl PeerCtrl {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            send_buf: SendBuffer::new(),
            broken: false,
            banit: false,
            misbehave: 0,
            node: RemoteNode::default(),
            verack_received: false,
            pending_invs: Vec::new(),
            blocks_in_flight: HashMap::new(),
            invs_received: 0,
            all_headers_received: false,
            get_headers_in_progress: false,
            get_blocks_data_now: false,
            last_data_received: now,
            bytes_received: 0,
            bytes_sent: 0,
            max_send_buf_use: 0,
            connected_at: now,
            next_ping: now + PING_PERIOD,
            ping_in_progress: None,
            ping_history_ms: [0; PING_HISTORY_LENGTH],
            ping_history_idx: 0,
            ping_samples: 0,
        }
    }

    pub fn record_ping_ms(&mut self, millis: u32) {
        self.ping_history_ms[self.ping_history_idx] = millis;
        self.ping_history_idx = (self.ping_history_idx + 1) % PING_HISTORY_LENGTH;
        self.ping_samples = self.ping_samples.saturating_add(1);
    }

    /// Mean round-trip time with the longest samples ignored; peers that
    /// never answered a ping get a pessimistic assumption.
    pub fn average_ping_ms(&self) -> u32 {
        let filled = self.ping_samples.min(PING_HISTORY_LENGTH);
        if filled == 0 {
            return PING_ASSUMED_IF_UNSUPPORTED;
        }
        let mut samples: Vec<u32> = self.ping_history_ms[..filled].to_vec();
        samples.sort_unstable();
        let keep = filled.saturating_sub(PING_IGNORED_LONGEST).max(1);
        let sum: u64 = samples[..keep].iter().map(|ms| *ms as u64).sum();
        (sum / keep as u64) as u32
    }
}

pub struct Peer {
    pub id: u64,
    pub addr: SocketAddr,
    pub inbound: bool,
    magic: [u8; 4],
    ctrl: Mutex<PeerCtrl>,
    pub writer_wake: Notify,
}

impl Peer {
    pub fn new(id: u64, addr: SocketAddr, inbound: bool, magic: [u8; 4]) -> Self {
        Self {
            id,
            addr,
            inbound,
            magic,
            ctrl: Mutex::new(PeerCtrl::new()),
            writer_wake: Notify::new(),
        }
    }

    pub fn ctrl(&self) -> MutexGuard<'_, PeerCtrl> {
        self.ctrl.lock().expect("peer mutex")
    }

    pub fn is_broken(&self) -> bool {
        self.ctrl().broken
    }

    pub fn is_banned(&self) -> bool {
        self.ctrl().banit
    }

    /// Frames and queues a message. A send that does not fit into the
    /// ring disconnects the peer.
    pub fn send_message(&self, command: &str, payload: &[u8]) {
        let frame = build_message(self.magic, command, payload);
        let mut ctrl = self.ctrl();
        if ctrl.broken {
            return;
        }
        if !ctrl.send_buf.push(&frame) {
            ctrl.broken = true;
            drop(ctrl);
            crate::counters::bump("PeerSendOverflow");
            log_debug!("peer {} send buffer overflow on {command}", self.addr);
            self.writer_wake.notify_one();
            return;
        }
        ctrl.bytes_sent += frame.len() as u64;
        let queued = ctrl.send_buf.queued();
        if queued > ctrl.max_send_buf_use {
            ctrl.max_send_buf_use = queued;
        }
        drop(ctrl);
        self.writer_wake.notify_one();
    }

    pub fn disconnect(&self) {
        self.ctrl().broken = true;
        self.writer_wake.notify_one();
    }

    /// Ban outright: the address goes on the ban list and the connection
    /// is torn down.
    pub fn dos(&self, reason: &'static str) {
        crate::counters::bump("Ban");
        {
            let mut ctrl = self.ctrl();
            ctrl.banit = true;
            ctrl.broken = true;
        }
        log_debug!("ban peer {} because {reason}", self.addr);
        self.writer_wake.notify_one();
    }

    /// Accumulates misbehavior weight; crossing the limit bans.
    pub fn misbehave(&self, reason: &'static str, weight: u32) -> bool {
        let mut ctrl = self.ctrl();
        if ctrl.banit {
            return true;
        }
        ctrl.misbehave = ctrl.misbehave.saturating_add(weight).min(BAN_SCORE_LIMIT);
        if ctrl.misbehave >= BAN_SCORE_LIMIT {
            ctrl.banit = true;
            ctrl.broken = true;
            drop(ctrl);
            crate::counters::bump("BanMisbehave");
            log_debug!("peer {} banned after misbehaving: {reason}", self.addr);
            self.writer_wake.notify_one();
            return true;
        }
        false
    }

    /// Appends an inv for the flush pass; drops on overflow rather than
    /// blocking.
    pub fn queue_inv(&self, inv: [u8; 36]) -> bool {
        let mut ctrl = self.ctrl();
        if ctrl.pending_invs.len() >= MAX_PENDING_INVS {
            drop(ctrl);
            crate::counters::bump("SendInvIgnored");
            return false;
        }
        ctrl.pending_invs.push(inv);
        true
    }

    /// Ping maintenance for the network tick: emits a fresh ping when due
    /// and reports an expired one.
    pub fn ping_tick(&self, now: Instant) -> PingAction {
        let mut ctrl = self.ctrl();
        if let Some((_, sent_at)) = &ctrl.ping_in_progress {
            if now.duration_since(*sent_at) > PING_TIMEOUT {
                ctrl.ping_in_progress = None;
                return PingAction::TimedOut;
            }
            return PingAction::None;
        }
        if now >= ctrl.next_ping {
            let nonce: [u8; 8] = rand::random();
            ctrl.ping_in_progress = Some((nonce.to_vec(), now));
            ctrl.next_ping = now + PING_PERIOD;
            return PingAction::Send(nonce.to_vec());
        }
        PingAction::None
    }

    pub fn pong_received(&self, payload: &[u8]) {
        let mut ctrl = self.ctrl();
        let Some((nonce, sent_at)) = ctrl.ping_in_progress.take() else {
            return;
        };
        if nonce != payload {
            ctrl.ping_in_progress = Some((nonce, sent_at));
            return;
        }
        let millis = sent_at.elapsed().as_millis().min(u32::MAX as u128) as u32;
        ctrl.record_ping_ms(millis);
    }

    pub fn average_ping_ms(&self) -> u32 {
        self.ctrl().average_ping_ms()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PingAction {
    None,
    Send(Vec<u8>),
    TimedOut,
}

// ---- framing ----

pub fn build_message(magic: [u8; 4], command: &str, payload: &[u8]) -> Vec<u8> {
    debug_assert!(command.len() <= 12);
    let mut out = Vec::with_capacity(24 + payload.len());
    out.extend_from_slice(&magic);
    let mut cmd = [0u8; 12];
    cmd[..command.len()].copy_from_slice(command.as_bytes());
    out.extend_from_slice(&cmd);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let checksum = sha256d(payload);
    out.extend_from_slice(&checksum[..4]);
    out.extend_from_slice(payload);
    out
}

/// Reads one framed message, enforcing magic, per-command size limits and
/// the payload checksum.
pub async fn read_message<R: AsyncReadExt + Unpin>(
    stream: &mut R,
    magic: [u8; 4],
) -> Result<(String, Vec<u8>), PeerError> {
    let mut header = [0u8; 24];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => PeerError::Closed,
            _ => PeerError::Io(err.to_string()),
        })?;
    if header[..4] != magic {
        return Err(PeerError::BadMagic);
    }
    let command: String = header[4..16]
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| *byte as char)
        .collect();
    if !command.bytes().all(|byte| byte.is_ascii_graphic()) {
        return Err(PeerError::Protocol("non-ascii command"));
    }
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > max_payload_size(&command) {
        return Err(PeerError::MsgTooBig(command));
    }
    let mut payload = vec![0u8; length];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|err| PeerError::Io(err.to_string()))?;
    let checksum = sha256d(&payload);
    if header[20..24] != checksum[..4] {
        return Err(PeerError::BadChecksum);
    }
    Ok((command, payload))
}

// ---- payload builders & parsers ----

fn write_net_addr(encoder: &mut Encoder, addr: Option<SocketAddr>) {
    encoder.write_u64_le(NODE_NETWORK);
    match addr {
        Some(addr) => {
            let octets = match addr.ip() {
                IpAddr::V4(ip4) => ip4.to_ipv6_mapped().octets(),
                IpAddr::V6(ip6) => ip6.octets(),
            };
            encoder.write_bytes(&octets);
            encoder.write_bytes(&addr.port().to_be_bytes());
        }
        None => {
            encoder.write_bytes(&[0u8; 16]);
            encoder.write_bytes(&[0u8; 2]);
        }
    }
}

pub fn build_version_payload(
    nonce: u64,
    start_height: u32,
    remote: Option<SocketAddr>,
    relay_txs: bool,
) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u32_le(PROTOCOL_VERSION);
    encoder.write_u64_le(NODE_NETWORK);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    encoder.write_u64_le(now);
    write_net_addr(&mut encoder, remote);
    write_net_addr(&mut encoder, None);
    encoder.write_u64_le(nonce);
    encoder.write_var_str(USER_AGENT);
    encoder.write_u32_le(start_height);
    encoder.write_u8(if relay_txs { 1 } else { 0 });
    encoder.into_inner()
}

/// Parses a `version` payload. Fields past the nonce are optional for
/// ancient peers; a missing relay flag means relay.
pub fn parse_version(payload: &[u8]) -> Result<RemoteNode, PeerError> {
    let mut decoder = Decoder::new(payload);
    let mut node = RemoteNode::default();
    node.version = decoder
        .read_u32_le()
        .map_err(|_| PeerError::Protocol("short version payload"))?;
    if node.version < MIN_PROTO_VERSION {
        return Err(PeerError::Protocol("obsolete protocol version"));
    }
    node.services = decoder
        .read_u64_le()
        .map_err(|_| PeerError::Protocol("short version payload"))?;
    node.timestamp = decoder
        .read_u64_le()
        .map_err(|_| PeerError::Protocol("short version payload"))?;
    if decoder.read_bytes(26).is_err() || decoder.read_bytes(26).is_err() {
        return Ok(node);
    }
    match decoder.read_u64_le() {
        Ok(nonce) => node.nonce = nonce,
        Err(_) => return Ok(node),
    }
    if let Ok(agent) = decoder.read_var_str() {
        node.agent = agent;
    } else {
        return Ok(node);
    }
    if let Ok(height) = decoder.read_u32_le() {
        node.height = height;
    } else {
        return Ok(node);
    }
    if let Ok(flag) = decoder.read_u8() {
        node.do_not_relay_txs = flag == 0;
    }
    Ok(node)
}

pub fn build_inv_payload(entries: &[(u32, Hash256)]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(entries.len() as u64);
    for (inv_type, hash) in entries {
        encoder.write_u32_le(*inv_type);
        encoder.write_hash(hash);
    }
    encoder.into_inner()
}

pub fn parse_inv(payload: &[u8]) -> Result<Vec<(u32, Hash256)>, PeerError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder
        .read_varint()
        .map_err(|_| PeerError::Protocol("bad inv count"))? as usize;
    if count == 0 || count > 50_000 || decoder.remaining() != count * 36 {
        return Err(PeerError::Protocol("inv length mismatch"));
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let inv_type = decoder
            .read_u32_le()
            .map_err(|_| PeerError::Protocol("truncated inv"))?;
        let hash = decoder
            .read_hash()
            .map_err(|_| PeerError::Protocol("truncated inv"))?;
        out.push((inv_type, hash));
    }
    Ok(out)
}

pub fn build_locator_payload(locator: &[Hash256], stop: &Hash256) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u32_le(PROTOCOL_VERSION);
    encoder.write_varint(locator.len() as u64);
    for hash in locator {
        encoder.write_hash(hash);
    }
    encoder.write_hash(stop);
    encoder.into_inner()
}

/// Shared layout of `getheaders` and `getblocks`.
pub fn parse_locator_payload(payload: &[u8]) -> Result<(Vec<Hash256>, Hash256), PeerError> {
    let mut decoder = Decoder::new(payload);
    let _version = decoder
        .read_u32_le()
        .map_err(|_| PeerError::Protocol("short locator payload"))?;
    let count = decoder
        .read_varint()
        .map_err(|_| PeerError::Protocol("bad locator count"))? as usize;
    if count > 500 {
        return Err(PeerError::Protocol("locator too long"));
    }
    let mut locator = Vec::with_capacity(count);
    for _ in 0..count {
        locator.push(
            decoder
                .read_hash()
                .map_err(|_| PeerError::Protocol("truncated locator"))?,
        );
    }
    let stop = decoder
        .read_hash()
        .map_err(|_| PeerError::Protocol("truncated locator"))?;
    Ok((locator, stop))
}

pub fn build_headers_payload(headers: &[[u8; HEADER_LEN]]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(headers.len() as u64);
    for header in headers {
        encoder.write_bytes(header);
        encoder.write_varint(0);
    }
    encoder.into_inner()
}

pub fn parse_headers_payload(payload: &[u8]) -> Result<Vec<[u8; HEADER_LEN]>, PeerError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder
        .read_varint()
        .map_err(|_| PeerError::Protocol("bad headers count"))? as usize;
    if count > MAX_HEADERS_RESULTS {
        return Err(PeerError::Protocol("too many headers"));
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let header = decoder
            .read_fixed::<HEADER_LEN>()
            .map_err(|_| PeerError::Protocol("truncated header"))?;
        let _tx_count = decoder
            .read_varint()
            .map_err(|_| PeerError::Protocol("truncated header"))?;
        out.push(header);
    }
    Ok(out)
}

pub fn build_addr_payload(addrs: &[SocketAddr], now: u32) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(addrs.len() as u64);
    for addr in addrs {
        encoder.write_u32_le(now);
        encoder.write_u64_le(NODE_NETWORK);
        let octets = match addr.ip() {
            IpAddr::V4(ip4) => ip4.to_ipv6_mapped().octets(),
            IpAddr::V6(ip6) => ip6.octets(),
        };
        encoder.write_bytes(&octets);
        encoder.write_bytes(&addr.port().to_be_bytes());
    }
    encoder.into_inner()
}

pub fn parse_addr_payload(payload: &[u8]) -> Result<Vec<SocketAddr>, PeerError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder
        .read_varint()
        .map_err(|_| PeerError::Protocol("bad addr count"))? as usize;
    if count > 1000 {
        return Err(PeerError::Protocol("too many addrs"));
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let _time = decoder
            .read_u32_le()
            .map_err(|_| PeerError::Protocol("truncated addr"))?;
        let _services = decoder
            .read_u64_le()
            .map_err(|_| PeerError::Protocol("truncated addr"))?;
        let octets = decoder
            .read_fixed::<16>()
            .map_err(|_| PeerError::Protocol("truncated addr"))?;
        let port_bytes = decoder
            .read_fixed::<2>()
            .map_err(|_| PeerError::Protocol("truncated addr"))?;
        let port = u16::from_be_bytes(port_bytes);
        if port == 0 {
            continue;
        }
        let ip6 = Ipv6Addr::from(octets);
        let ip = match ip6.to_ipv4_mapped() {
            Some(ip4) => IpAddr::V4(ip4),
            None => IpAddr::V6(ip6),
        };
        if ip.is_unspecified() || ip.is_loopback() {
            continue;
        }
        out.push(SocketAddr::new(ip, port));
    }
    Ok(out)
}

pub fn build_inv_entry(inv_type: u32, hash: &Hash256) -> [u8; 36] {
    let mut out = [0u8; 36];
    out[..4].copy_from_slice(&inv_type.to_le_bytes());
    out[4..].copy_from_slice(hash);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new(
            1,
            "127.0.0.1:8333".parse().unwrap(),
            false,
            [0xf9, 0xbe, 0xb4, 0xd9],
        )
    }

    #[test]
    fn payload_limits_match_protocol_maxima() {
        assert_eq!(max_payload_size("inv"), 3 + 50_000 * 36);
        assert_eq!(max_payload_size("getdata"), 3 + 50_000 * 36);
        assert_eq!(max_payload_size("headers"), 3 + 50_000 * 36);
        assert_eq!(max_payload_size("getblocks"), 4 + 3 + 500 * 32 + 32);
        assert_eq!(max_payload_size("getheaders"), 4 + 3 + 500 * 32 + 32);
        assert_eq!(max_payload_size("tx"), 100_000);
        assert_eq!(max_payload_size("block"), 1_000_000);
        assert_eq!(max_payload_size("addr"), 3 + 1000 * 30);
        assert_eq!(max_payload_size("version"), 1024);
        assert_eq!(max_payload_size("bogus"), 1024);
    }

    #[test]
    fn ring_wraps_and_tracks_indices() {
        let mut ring = SendBuffer::new();
        assert!(ring.is_empty());

        let chunk = vec![0xabu8; 1 << 20];
        assert!(ring.push(&chunk));
        assert_eq!(ring.queued(), chunk.len());

        let mut out = vec![0u8; 600_000];
        let taken = ring.peek(&mut out);
        assert_eq!(taken, 600_000);
        ring.consume(taken);
        assert_eq!(ring.queued(), chunk.len() - 600_000);

        // wrap the producer around the end of the buffer
        for _ in 0..6 {
            assert!(ring.push(&chunk[..500_000]));
            let mut drain = vec![0u8; 500_000];
            let got = ring.peek(&mut drain);
            ring.consume(got);
        }
        assert!(ring.queued() < SEND_BUF_SIZE);
    }

    #[test]
    fn ring_refuses_to_fill_completely() {
        let mut ring = SendBuffer::new();
        let big = vec![1u8; SEND_BUF_SIZE - 1];
        assert!(ring.push(&big), "one byte of slack must remain usable");
        assert_eq!(ring.queued(), SEND_BUF_SIZE - 1);
        assert!(!ring.push(&[2u8]), "filling the last byte is refused");

        let mut out = vec![0u8; 1024];
        let got = ring.peek(&mut out);
        ring.consume(got);
        assert!(ring.push(&[2u8; 1023]));
    }

    #[test]
    fn overflow_breaks_the_peer() {
        let peer = peer();
        // a block-sized payload per message; the fifth no longer fits
        let payload = vec![0u8; 1_000_000];
        for _ in 0..4 {
            peer.send_message("block", &payload);
            assert!(!peer.is_broken());
        }
        let before = crate::counters::get("PeerSendOverflow");
        peer.send_message("block", &payload);
        assert!(peer.is_broken());
        assert_eq!(crate::counters::get("PeerSendOverflow"), before + 1);
    }

    #[test]
    fn misbehaviour_accumulates_to_a_ban() {
        let peer = peer();
        assert!(!peer.misbehave("spam", 400));
        assert!(!peer.misbehave("spam", 400));
        assert!(!peer.is_banned());
        assert!(peer.misbehave("spam", 400));
        assert!(peer.is_banned());
        assert!(peer.is_broken());
        // banned implies broken, further weight changes nothing
        assert!(peer.misbehave("spam", 1));
    }

    #[test]
    fn ping_average_ignores_longest() {
        let peer = peer();
        {
            let mut ctrl = peer.ctrl();
            for millis in [10, 20, 30, 40, 500, 600, 700, 800] {
                ctrl.record_ping_ms(millis);
            }
        }
        // the four slowest samples do not count
        assert_eq!(peer.average_ping_ms(), 25);
    }

    #[test]
    fn ping_unsupported_is_assumed_slow() {
        let peer = peer();
        assert_eq!(peer.average_ping_ms(), PING_ASSUMED_IF_UNSUPPORTED);
    }

    #[test]
    fn pending_inv_cap_drops_overflow() {
        let peer = peer();
        let inv = build_inv_entry(MSG_TX, &[1u8; 32]);
        for _ in 0..MAX_PENDING_INVS {
            assert!(peer.queue_inv(inv));
        }
        assert!(!peer.queue_inv(inv));
        assert_eq!(peer.ctrl().pending_invs.len(), MAX_PENDING_INVS);
    }

    #[test]
    fn version_payload_roundtrip() {
        let payload = build_version_payload(0xdead_beef, 1234, None, true);
        let node = parse_version(&payload).unwrap();
        assert_eq!(node.version, PROTOCOL_VERSION);
        assert_eq!(node.nonce, 0xdead_beef);
        assert_eq!(node.height, 1234);
        assert!(!node.do_not_relay_txs);
        assert!(node.agent.starts_with("/btcd:"));
    }

    #[test]
    fn obsolete_version_is_refused() {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(MIN_PROTO_VERSION - 1);
        encoder.write_u64_le(0);
        encoder.write_u64_le(0);
        assert!(parse_version(&encoder.into_inner()).is_err());
    }

    #[test]
    fn inv_payload_roundtrip() {
        let entries = vec![(MSG_TX, [1u8; 32]), (MSG_BLOCK, [2u8; 32])];
        let payload = build_inv_payload(&entries);
        assert_eq!(parse_inv(&payload).unwrap(), entries);
    }

    #[test]
    fn inv_length_mismatch_rejected() {
        let mut payload = build_inv_payload(&[(MSG_TX, [1u8; 32])]);
        payload.pop();
        assert!(parse_inv(&payload).is_err());
    }

    #[test]
    fn locator_roundtrip() {
        let locator = vec![[1u8; 32], [2u8; 32]];
        let stop = [9u8; 32];
        let payload = build_locator_payload(&locator, &stop);
        let (parsed, parsed_stop) = parse_locator_payload(&payload).unwrap();
        assert_eq!(parsed, locator);
        assert_eq!(parsed_stop, stop);
    }

    #[test]
    fn headers_payload_roundtrip() {
        let headers = vec![[3u8; HEADER_LEN], [4u8; HEADER_LEN]];
        let payload = build_headers_payload(&headers);
        assert_eq!(parse_headers_payload(&payload).unwrap(), headers);
    }

    #[test]
    fn message_frame_layout() {
        let magic = [0xf9, 0xbe, 0xb4, 0xd9];
        let frame = build_message(magic, "ping", &[1, 2, 3]);
        assert_eq!(frame.len(), 27);
        assert_eq!(&frame[..4], &magic);
        assert_eq!(&frame[4..8], b"ping");
        assert_eq!(frame[16], 3);
        let checksum = sha256d(&[1, 2, 3]);
        assert_eq!(&frame[20..24], &checksum[..4]);
    }
}
