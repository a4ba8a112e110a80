//! Runtime configuration: a JSON config file under the data directory
//! with command-line flags layered on top.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use btcd_consensus::params::Network;
use serde::Deserialize;

use crate::logging;
use crate::mempool::{
    DEFAULT_MAX_BYTES, DEFAULT_MIN_FEE, DEFAULT_MIN_RELAY_FEE_PER_KB, DEFAULT_TX_TTL_SECS,
};

pub const DEFAULT_DATA_DIR: &str = "data";
pub const CONFIG_FILE_NAME: &str = "btcd.conf.json";
const DEFAULT_MAX_INBOUND: usize = 16;
const DEFAULT_MAX_OUTBOUND: usize = 8;
const DEFAULT_INFLIGHT_PER_PEER: usize = 1;

#[derive(Clone, Debug)]
pub struct Config {
    pub network: Network,
    pub data_dir: PathBuf,
    pub listen: bool,
    pub listen_addr: Option<SocketAddr>,
    pub max_inbound: usize,
    pub max_outbound: usize,
    pub connect_nodes: Vec<SocketAddr>,

    pub tx_pool_enabled: bool,
    pub tx_relay_enabled: bool,
    pub min_fee: i64,
    pub min_relay_fee_per_kb: i64,
    pub mempool_max_bytes: usize,
    pub tx_ttl_secs: u64,

    pub beep_new_block: bool,
    pub beep_fork: bool,

    pub inflight_per_peer: usize,
    pub worker_threads: usize,

    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,

    pub rescan: bool,
    pub undo_blocks: u32,
    pub volatile_utxo: bool,
    pub defrag_on_shutdown: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            listen: true,
            listen_addr: None,
            max_inbound: DEFAULT_MAX_INBOUND,
            max_outbound: DEFAULT_MAX_OUTBOUND,
            connect_nodes: Vec::new(),
            tx_pool_enabled: true,
            tx_relay_enabled: true,
            min_fee: DEFAULT_MIN_FEE,
            min_relay_fee_per_kb: DEFAULT_MIN_RELAY_FEE_PER_KB,
            mempool_max_bytes: DEFAULT_MAX_BYTES,
            tx_ttl_secs: DEFAULT_TX_TTL_SECS,
            beep_new_block: false,
            beep_fork: true,
            inflight_per_peer: DEFAULT_INFLIGHT_PER_PEER,
            worker_threads: 0,
            log_level: logging::Level::Info,
            log_format: logging::Format::Text,
            log_timestamps: true,
            rescan: false,
            undo_blocks: 0,
            volatile_utxo: false,
            defrag_on_shutdown: false,
        }
    }
}

impl Config {
    pub fn net_dir(&self) -> PathBuf {
        match self.network {
            Network::Mainnet => self.data_dir.clone(),
            Network::Testnet => self.data_dir.join("testnet"),
            Network::Regtest => self.data_dir.join("regtest"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    network: Option<String>,
    listen: Option<bool>,
    listen_addr: Option<SocketAddr>,
    max_inbound: Option<usize>,
    max_outbound: Option<usize>,
    connect: Option<Vec<SocketAddr>>,
    tx_pool: Option<bool>,
    tx_relay: Option<bool>,
    min_fee: Option<i64>,
    min_relay_fee_per_kb: Option<i64>,
    mempool_max_mb: Option<u64>,
    tx_ttl_secs: Option<u64>,
    beeps: Option<BeepsFile>,
    inflight_per_peer: Option<usize>,
    workers: Option<usize>,
    log_level: Option<String>,
    log_format: Option<String>,
    log_timestamps: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct BeepsFile {
    new_block: Option<bool>,
    fork: Option<bool>,
}

fn apply_config_file(config: &mut Config, file: ConfigFile) -> Result<(), String> {
    if let Some(raw) = file.network {
        config.network =
            Network::parse(&raw).ok_or_else(|| format!("unknown network '{raw}'"))?;
    }
    if let Some(listen) = file.listen {
        config.listen = listen;
    }
    if file.listen_addr.is_some() {
        config.listen_addr = file.listen_addr;
    }
    if let Some(value) = file.max_inbound {
        config.max_inbound = value;
    }
    if let Some(value) = file.max_outbound {
        config.max_outbound = value;
    }
    if let Some(connect) = file.connect {
        config.connect_nodes = connect;
    }
    if let Some(value) = file.tx_pool {
        config.tx_pool_enabled = value;
    }
    if let Some(value) = file.tx_relay {
        config.tx_relay_enabled = value;
    }
    if let Some(value) = file.min_fee {
        config.min_fee = value;
    }
    if let Some(value) = file.min_relay_fee_per_kb {
        config.min_relay_fee_per_kb = value;
    }
    if let Some(value) = file.mempool_max_mb {
        config.mempool_max_bytes = (value as usize).saturating_mul(1024 * 1024);
    }
    if let Some(value) = file.tx_ttl_secs {
        config.tx_ttl_secs = value;
    }
    if let Some(beeps) = file.beeps {
        if let Some(value) = beeps.new_block {
            config.beep_new_block = value;
        }
        if let Some(value) = beeps.fork {
            config.beep_fork = value;
        }
    }
    if let Some(value) = file.inflight_per_peer {
        config.inflight_per_peer = value.max(1);
    }
    if let Some(value) = file.workers {
        config.worker_threads = value;
    }
    if let Some(raw) = file.log_level {
        config.log_level =
            logging::Level::parse(&raw).ok_or_else(|| format!("unknown log level '{raw}'"))?;
    }
    if let Some(raw) = file.log_format {
        config.log_format =
            logging::Format::parse(&raw).ok_or_else(|| format!("unknown log format '{raw}'"))?;
    }
    if let Some(value) = file.log_timestamps {
        config.log_timestamps = value;
    }
    Ok(())
}

fn load_config_file(config: &mut Config, path: &Path) -> Result<(), String> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(format!("cannot read {}: {err}", path.display())),
    };
    let file: ConfigFile = serde_json::from_slice(&bytes)
        .map_err(|err| format!("invalid config {}: {err}", path.display()))?;
    apply_config_file(config, file)
}

pub enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

pub fn usage() -> &'static str {
    "usage: btcd [options]\n\
     \n\
     one-shot actions:\n\
     \x20 -r             rebuild the unspent set from block history\n\
     \x20 -u <n>         undo the last n blocks and exit\n\
     \n\
     options:\n\
     \x20 -t             use testnet\n\
     \x20 -vul           volatile unspent set (flush only at shutdown)\n\
     \x20 -defrag        compact the database on shutdown\n\
     \x20 --network <mainnet|testnet|regtest>\n\
     \x20 --datadir <dir>\n\
     \x20 --config <file>\n\
     \x20 --listen / --nolisten\n\
     \x20 --listen-addr <ip:port>\n\
     \x20 --connect <ip:port>      (repeatable, disables discovery dialing)\n\
     \x20 --max-inbound <n> / --max-outbound <n>\n\
     \x20 --inflight <n>           block downloads in flight per peer\n\
     \x20 --workers <n>            hashing/verify worker threads\n\
     \x20 --log-level <level> / --log-format <text|json> / --no-log-timestamps\n\
     \x20 help / version"
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut config = Config::default();
    let mut config_path: Option<PathBuf> = None;

    // first pass: everything, remembering explicit flags so the config
    // file cannot override them
    let args: Vec<String> = raw_args.into_iter().collect();
    if let Some(first) = args.first().map(|value| value.as_str()) {
        match first {
            "help" | "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "version" | "--version" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
    }

    let mut iter = args.iter().peekable();
    let mut cli_flags: Vec<(String, Option<String>)> = Vec::new();
    while let Some(arg) = iter.next() {
        let needs_value = matches!(
            arg.as_str(),
            "-u" | "--network"
                | "--datadir"
                | "--config"
                | "--listen-addr"
                | "--connect"
                | "--max-inbound"
                | "--max-outbound"
                | "--inflight"
                | "--workers"
                | "--log-level"
                | "--log-format"
        );
        let value = if needs_value {
            Some(
                iter.next()
                    .ok_or_else(|| format!("missing value for {arg}\n{}", usage()))?
                    .clone(),
            )
        } else {
            None
        };
        if arg == "--datadir" {
            config.data_dir = PathBuf::from(value.clone().expect("checked"));
        }
        if arg == "--config" {
            config_path = Some(PathBuf::from(value.clone().expect("checked")));
        }
        if arg == "-t" {
            config.network = Network::Testnet;
        }
        if arg == "--network" {
            let raw = value.clone().expect("checked");
            config.network =
                Network::parse(&raw).ok_or_else(|| format!("unknown network '{raw}'"))?;
        }
        cli_flags.push((arg.clone(), value));
    }

    let path = config_path.unwrap_or_else(|| config.data_dir.join(CONFIG_FILE_NAME));
    load_config_file(&mut config, &path)?;

    for (flag, value) in cli_flags {
        let value = |flag: &str| -> Result<String, String> {
            Ok(value.clone().ok_or_else(|| format!("missing value for {flag}"))?)
        };
        match flag.as_str() {
            "-r" => config.rescan = true,
            "-t" => config.network = Network::Testnet,
            "-vul" => config.volatile_utxo = true,
            "-defrag" => config.defrag_on_shutdown = true,
            "-u" => {
                config.undo_blocks = value("-u")?
                    .parse()
                    .map_err(|_| "invalid block count for -u".to_string())?;
            }
            "--network" => {
                let raw = value("--network")?;
                config.network =
                    Network::parse(&raw).ok_or_else(|| format!("unknown network '{raw}'"))?;
            }
            "--datadir" => config.data_dir = PathBuf::from(value("--datadir")?),
            "--config" => {}
            "--listen" => config.listen = true,
            "--nolisten" => config.listen = false,
            "--listen-addr" => {
                config.listen_addr = Some(
                    value("--listen-addr")?
                        .parse()
                        .map_err(|_| "invalid listen address".to_string())?,
                );
            }
            "--connect" => {
                let addr: SocketAddr = value("--connect")?
                    .parse()
                    .map_err(|_| "invalid connect address".to_string())?;
                config.connect_nodes.push(addr);
            }
            "--max-inbound" => {
                config.max_inbound = value("--max-inbound")?
                    .parse()
                    .map_err(|_| "invalid inbound cap".to_string())?;
            }
            "--max-outbound" => {
                config.max_outbound = value("--max-outbound")?
                    .parse()
                    .map_err(|_| "invalid outbound cap".to_string())?;
            }
            "--inflight" => {
                let parsed: usize = value("--inflight")?
                    .parse()
                    .map_err(|_| "invalid in-flight count".to_string())?;
                config.inflight_per_peer = parsed.max(1);
            }
            "--workers" => {
                config.worker_threads = value("--workers")?
                    .parse()
                    .map_err(|_| "invalid worker count".to_string())?;
            }
            "--log-level" => {
                let raw = value("--log-level")?;
                config.log_level = logging::Level::parse(&raw)
                    .ok_or_else(|| format!("unknown log level '{raw}'"))?;
            }
            "--log-format" => {
                let raw = value("--log-format")?;
                config.log_format = logging::Format::parse(&raw)
                    .ok_or_else(|| format!("unknown log format '{raw}'"))?;
            }
            "--no-log-timestamps" => config.log_timestamps = false,
            other => return Err(format!("unknown option '{other}'\n{}", usage())),
        }
    }

    Ok(CliAction::Run(Box::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(args: &[&str]) -> Config {
        match parse_args_from(args.iter().map(|value| value.to_string())).unwrap() {
            CliAction::Run(config) => *config,
            _ => panic!("expected a run action"),
        }
    }

    #[test]
    fn defaults() {
        let config = run(&[]);
        assert_eq!(config.network, Network::Mainnet);
        assert!(config.listen);
        assert!(!config.volatile_utxo);
        assert_eq!(config.undo_blocks, 0);
        assert_eq!(config.inflight_per_peer, 1);
    }

    #[test]
    fn short_flags() {
        let config = run(&["-t", "-r", "-vul", "-defrag", "-u", "5"]);
        assert_eq!(config.network, Network::Testnet);
        assert!(config.rescan);
        assert!(config.volatile_utxo);
        assert!(config.defrag_on_shutdown);
        assert_eq!(config.undo_blocks, 5);
    }

    #[test]
    fn unknown_flag_is_an_error() {
        let result = parse_args_from(["--bogus".to_string()]);
        assert!(result.is_err());
    }

    #[test]
    fn config_file_merges_under_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            serde_json::json!({
                "network": "regtest",
                "listen": false,
                "max_outbound": 3,
                "beeps": { "new_block": true },
                "mempool_max_mb": 7
            })
            .to_string(),
        )
        .unwrap();

        let config = run(&["--config", path.to_str().unwrap(), "--max-outbound", "11"]);
        assert_eq!(config.network, Network::Regtest);
        assert!(!config.listen);
        assert!(config.beep_new_block);
        assert_eq!(config.mempool_max_bytes, 7 * 1024 * 1024);
        // the command line wins over the file
        assert_eq!(config.max_outbound, 11);
    }

    #[test]
    fn help_and_version() {
        assert!(matches!(
            parse_args_from(["help".to_string()]).unwrap(),
            CliAction::PrintHelp
        ));
        assert!(matches!(
            parse_args_from(["version".to_string()]).unwrap(),
            CliAction::PrintVersion
        ));
    }
}
