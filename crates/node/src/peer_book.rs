//! The persisted peer address book: candidate addresses for the dialer
//! with attempt/success history, plus the ban list fed by DoS scoring.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

const PEERS_FILE_VERSION: u32 = 1;
/// Entries with no success in this window are forgotten.
const STALE_AFTER_SECS: u64 = 30 * 24 * 60 * 60;
const GIVE_UP_AFTER_FAILURES: u32 = 5;
/// Do not redial the same address more often than this.
const REDIAL_COOLDOWN_SECS: u64 = 60;
pub const DEFAULT_BAN_SECS: u64 = 24 * 60 * 60;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct AddrBookEntry {
    pub last_seen: u64,
    pub last_attempt: u64,
    pub last_success: u64,
    pub failures: u32,
    /// A successful handshake at some point moves the address out of the
    /// untried pool.
    pub tried: bool,
}

#[derive(Debug, Deserialize, Serialize)]
struct PeersFile {
    version: u32,
    peers: Vec<(SocketAddr, AddrBookEntry)>,
}

#[derive(Default)]
pub struct AddrBook {
    entries: Mutex<HashMap<SocketAddr, AddrBookEntry>>,
    banned: Mutex<HashMap<IpAddr, SystemTime>>,
    path: Option<PathBuf>,
}

impl AddrBook {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            banned: Mutex::new(HashMap::new()),
            path,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert_many(&self, addrs: impl IntoIterator<Item = SocketAddr>) -> usize {
        let now = now_secs();
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let mut inserted = 0;
        for addr in addrs {
            let entry = entries.entry(addr).or_insert_with(|| {
                inserted += 1;
                AddrBookEntry::default()
            });
            entry.last_seen = now;
        }
        inserted
    }

    pub fn note_attempt(&self, addr: SocketAddr) {
        if let Ok(mut entries) = self.entries.lock() {
            let entry = entries.entry(addr).or_default();
            entry.last_attempt = now_secs();
        }
    }

    pub fn note_success(&self, addr: SocketAddr) {
        if let Ok(mut entries) = self.entries.lock() {
            let entry = entries.entry(addr).or_default();
            let now = now_secs();
            entry.last_seen = now;
            entry.last_success = now;
            entry.failures = 0;
            entry.tried = true;
        }
    }

    pub fn note_failure(&self, addr: SocketAddr) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(&addr) {
                entry.failures = entry.failures.saturating_add(1);
            }
        }
    }

    pub fn ban(&self, ip: IpAddr, duration: Duration) {
        if let Ok(mut banned) = self.banned.lock() {
            banned.insert(ip, SystemTime::now() + duration);
        }
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        let now = SystemTime::now();
        let Ok(mut banned) = self.banned.lock() else {
            return false;
        };
        match banned.get(&ip).copied() {
            Some(until) if until > now => true,
            Some(_) => {
                banned.remove(&ip);
                false
            }
            None => false,
        }
    }

    /// Picks an address to dial, preferring ones we never connected to;
    /// recently attempted or banned addresses are skipped.
    pub fn pick_dial_target(&self, exclude: &HashSet<SocketAddr>) -> Option<SocketAddr> {
        let now = now_secs();
        let entries = self.entries.lock().ok()?;
        let mut untried: Vec<SocketAddr> = Vec::new();
        let mut tried: Vec<SocketAddr> = Vec::new();
        for (addr, entry) in entries.iter() {
            if exclude.contains(addr) || self.is_banned(addr.ip()) {
                continue;
            }
            if now.saturating_sub(entry.last_attempt) < REDIAL_COOLDOWN_SECS {
                continue;
            }
            if entry.tried {
                tried.push(*addr);
            } else {
                untried.push(*addr);
            }
        }
        drop(entries);
        let mut rng = rand::thread_rng();
        if !untried.is_empty() && (tried.is_empty() || rand::random::<u8>() % 4 != 0) {
            untried.choose(&mut rng).copied()
        } else {
            tried.choose(&mut rng).copied()
        }
    }

    /// Random sample for `getaddr` responses.
    pub fn sample(&self, limit: usize) -> Vec<SocketAddr> {
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        let mut addrs: Vec<SocketAddr> = entries.keys().copied().collect();
        drop(entries);
        let mut rng = rand::thread_rng();
        addrs.shuffle(&mut rng);
        addrs.truncate(limit);
        addrs
    }

    /// Drops stale and hopeless entries; returns how many were removed.
    pub fn expire(&self) -> usize {
        let now = now_secs();
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, entry| {
            if entry.failures >= GIVE_UP_AFTER_FAILURES && entry.last_success == 0 {
                return false;
            }
            now.saturating_sub(entry.last_seen.max(entry.last_success)) < STALE_AFTER_SECS
        });
        before - entries.len()
    }

    pub fn load(&self) -> Result<usize, String> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.to_string()),
        };
        let file: PeersFile =
            serde_json::from_slice(&bytes).map_err(|err| format!("invalid peers file: {err}"))?;
        if file.version != PEERS_FILE_VERSION {
            return Err(format!("unsupported peers file version {}", file.version));
        }
        let mut loaded = 0;
        if let Ok(mut entries) = self.entries.lock() {
            for (addr, entry) in file.peers {
                entries.insert(addr, entry);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    pub fn save(&self) -> Result<(), String> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut peers: Vec<(SocketAddr, AddrBookEntry)> = self
            .entries
            .lock()
            .map_err(|_| "peer book lock poisoned".to_string())?
            .iter()
            .map(|(addr, entry)| (*addr, *entry))
            .collect();
        peers.sort_by_key(|(addr, _)| addr.to_string());
        let file = PeersFile {
            version: PEERS_FILE_VERSION,
            peers,
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|err| err.to_string())?;
        write_atomically(path, &json)
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| err.to_string())?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|err| err.to_string())?;
    if fs::rename(&tmp, path).is_err() {
        let _ = fs::remove_file(path);
        fs::rename(&tmp, path).map_err(|err| err.to_string())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tail: u8) -> SocketAddr {
        format!("10.0.0.{tail}:8333").parse().unwrap()
    }

    #[test]
    fn insert_and_pick() {
        let book = AddrBook::new(None);
        assert_eq!(book.insert_many([addr(1), addr(2)]), 2);
        assert_eq!(book.insert_many([addr(1)]), 0, "duplicates not re-counted");
        let picked = book.pick_dial_target(&HashSet::new()).unwrap();
        assert!([addr(1), addr(2)].contains(&picked));
    }

    #[test]
    fn exclusion_and_ban() {
        let book = AddrBook::new(None);
        book.insert_many([addr(1), addr(2)]);
        book.ban(addr(1).ip(), Duration::from_secs(60));
        assert!(book.is_banned(addr(1).ip()));
        let mut exclude = HashSet::new();
        exclude.insert(addr(2));
        assert_eq!(book.pick_dial_target(&exclude), None);
    }

    #[test]
    fn recently_attempted_is_skipped() {
        let book = AddrBook::new(None);
        book.insert_many([addr(1)]);
        book.note_attempt(addr(1));
        assert_eq!(book.pick_dial_target(&HashSet::new()), None);
    }

    #[test]
    fn expire_drops_hopeless_entries() {
        let book = AddrBook::new(None);
        book.insert_many([addr(1), addr(2)]);
        for _ in 0..GIVE_UP_AFTER_FAILURES {
            book.note_failure(addr(1));
        }
        assert_eq!(book.expire(), 1);
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        let book = AddrBook::new(Some(path.clone()));
        book.insert_many([addr(1), addr(2)]);
        book.note_success(addr(1));
        book.save().unwrap();

        let reloaded = AddrBook::new(Some(path));
        assert_eq!(reloaded.load().unwrap(), 2);
        assert_eq!(reloaded.len(), 2);
    }
}
