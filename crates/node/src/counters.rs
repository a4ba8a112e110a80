//! Process-wide event counters, mirrored into the status output.

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

fn table() -> &'static Mutex<BTreeMap<&'static str, u64>> {
    static TABLE: OnceLock<Mutex<BTreeMap<&'static str, u64>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(BTreeMap::new()))
}

pub fn bump(name: &'static str) {
    add(name, 1);
}

pub fn add(name: &'static str, value: u64) {
    if let Ok(mut counters) = table().lock() {
        *counters.entry(name).or_insert(0) += value;
    }
}

pub fn get(name: &'static str) -> u64 {
    table()
        .lock()
        .map(|counters| counters.get(name).copied().unwrap_or(0))
        .unwrap_or(0)
}

pub fn snapshot() -> Vec<(&'static str, u64)> {
    table()
        .lock()
        .map(|counters| counters.iter().map(|(name, value)| (*name, *value)).collect())
        .unwrap_or_default()
}
