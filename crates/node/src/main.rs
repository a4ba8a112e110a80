use btcd_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

mod config;
mod counters;
mod mempool;
mod node;
mod p2p;
mod p2p_server;
mod peer_book;
mod sync;

use std::fs::{self, File};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use btcd_chainstate::blockfiles::BlockFiles;
use btcd_chainstate::state::Chain;
use btcd_consensus::params::chain_params;
use btcd_storage::fjall::FjallStore;
use fs2::FileExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use crate::config::{CliAction, Config};
use crate::mempool::{Mempool, MempoolPolicy};
use crate::p2p_server::PeerManager;
use crate::peer_book::AddrBook;
use crate::sync::{BlockRcvd, SyncState, TxRcvd};

const LOCK_FILE_NAME: &str = ".lock";
const PEERS_FILE_NAME: &str = "peers.json";
const MAX_BLOCK_FILE_SIZE: u64 = 128 * 1024 * 1024;

/// Everything the peer tasks and the main loop share; one handle value
/// passed through instead of process globals.
pub struct NetCtx<S> {
    pub chain: Arc<Chain<S>>,
    pub peers: Arc<PeerManager>,
    pub addr_book: Arc<AddrBook>,
    pub sync: Arc<Mutex<SyncState>>,
    pub mempool: Arc<Mutex<Mempool>>,
    pub net_blocks: mpsc::Sender<BlockRcvd>,
    pub net_txs: mpsc::Sender<TxRcvd>,
    pub net_alerts: mpsc::Sender<String>,
    pub config: Arc<Config>,
}

impl<S> Clone for NetCtx<S> {
    fn clone(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
            peers: Arc::clone(&self.peers),
            addr_book: Arc::clone(&self.addr_book),
            sync: Arc::clone(&self.sync),
            mempool: Arc::clone(&self.mempool),
            net_blocks: self.net_blocks.clone(),
            net_txs: self.net_txs.clone(),
            net_alerts: self.net_alerts.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

struct DataDirLock {
    file: File,
    path: std::path::PathBuf,
}

impl DataDirLock {
    fn acquire(dir: &Path) -> Result<Self, String> {
        let path = dir.join(LOCK_FILE_NAME);
        let file = File::create(&path)
            .map_err(|err| format!("cannot create lock file {}: {err}", path.display()))?;
        file.try_lock_exclusive().map_err(|_| {
            format!(
                "data directory {} is locked by another instance",
                dir.display()
            )
        })?;
        Ok(Self { file, path })
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}

fn main() -> ExitCode {
    let action = match config::parse_args_from(std::env::args().skip(1)) {
        Ok(action) => action,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    let config = match action {
        CliAction::PrintHelp => {
            println!("{}", config::usage());
            return ExitCode::SUCCESS;
        }
        CliAction::PrintVersion => {
            println!("btcd {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        CliAction::Run(config) => Arc::new(*config),
    };

    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });
    if config.worker_threads > 0 {
        let _ = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .build_global();
    }

    let net_dir = config.net_dir();
    if let Err(err) = fs::create_dir_all(&net_dir) {
        log_error!("cannot create data directory {}: {err}", net_dir.display());
        return ExitCode::FAILURE;
    }
    let lock = match DataDirLock::acquire(&net_dir) {
        Ok(lock) => lock,
        Err(err) => {
            log_error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let store = match FjallStore::open(net_dir.join("db")) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            log_error!("cannot open database: {err}");
            return ExitCode::FAILURE;
        }
    };
    let blocks = match BlockFiles::open(net_dir.join("blocks"), MAX_BLOCK_FILE_SIZE) {
        Ok(blocks) => blocks,
        Err(err) => {
            log_error!("cannot open block files: {err}");
            return ExitCode::FAILURE;
        }
    };
    let params = chain_params(config.network);
    if config.volatile_utxo {
        log_warn!("volatile unspent-set mode: close the client properly, do not kill it");
    }
    let chain = match Chain::open(params, store, blocks, config.volatile_utxo) {
        Ok(chain) => Arc::new(chain),
        Err(err) => {
            log_error!("cannot open chain state: {err}");
            return ExitCode::FAILURE;
        }
    };
    let (tip_hash, tip_height) = chain.tip_info();
    log_info!(
        "chain state at height {tip_height} ({})",
        btcd_consensus::hash_to_hex(&tip_hash)
    );

    // one-shot maintenance actions exit without touching the network
    if config.undo_blocks > 0 {
        log_info!("undoing the last {} block(s)", config.undo_blocks);
        if let Err(err) = chain.undo_recent(config.undo_blocks) {
            log_error!("undo failed: {err}");
            return ExitCode::FAILURE;
        }
        let _ = chain.flush();
        drop(lock);
        return ExitCode::SUCCESS;
    }
    if config.rescan {
        if let Err(err) = chain.rescan() {
            log_error!("rescan failed: {err}");
            return ExitCode::FAILURE;
        }
        if config.volatile_utxo {
            log_info!("rebuild complete in volatile mode, flushing and exiting");
            let _ = chain.flush();
            drop(lock);
            return ExitCode::SUCCESS;
        }
    }

    let addr_book = Arc::new(AddrBook::new(Some(net_dir.join(PEERS_FILE_NAME))));
    match addr_book.load() {
        Ok(count) if count > 0 => log_info!("loaded {count} peer address(es)"),
        Ok(_) => {}
        Err(err) => log_warn!("peer book not loaded: {err}"),
    }
    addr_book.insert_many(config.connect_nodes.iter().copied());

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        run_node(Arc::clone(&config), Arc::clone(&chain), Arc::clone(&addr_book))
    }));

    // orderly teardown, also on the panic path
    if config.defrag_on_shutdown {
        log_info!("compacting the database before shutdown");
        while matches!(chain.idle(), Ok(true)) {}
    }
    if let Err(err) = chain.flush() {
        log_error!("final flush failed: {err}");
    }
    if let Err(err) = addr_book.save() {
        log_warn!("peer book not saved: {err}");
    }
    drop(lock);

    match outcome {
        Ok(Ok(())) => {
            log_info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Ok(Err(err)) => {
            log_error!("{err}");
            ExitCode::FAILURE
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log_error!("main loop panic recovered: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run_node(
    config: Arc<Config>,
    chain: Arc<Chain<FjallStore>>,
    addr_book: Arc<AddrBook>,
) -> Result<(), String> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| format!("cannot start runtime: {err}"))?;

    runtime.block_on(async move {
        let (net_blocks_tx, net_blocks_rx) = mpsc::channel(128);
        let (net_txs_tx, net_txs_rx) = mpsc::channel(1024);
        let (net_alerts_tx, net_alerts_rx) = mpsc::channel(64);
        let (_commands_tx, commands_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let peers = Arc::new(PeerManager::new(config.max_inbound, config.max_outbound));
        let mempool = Arc::new(Mutex::new(Mempool::new(MempoolPolicy {
            enabled: config.tx_pool_enabled,
            min_fee: config.min_fee,
            min_relay_fee_per_kb: config.min_relay_fee_per_kb,
            max_bytes: config.mempool_max_bytes,
            tx_ttl_secs: config.tx_ttl_secs,
        })));
        let ctx = NetCtx {
            chain: Arc::clone(&chain),
            peers: Arc::clone(&peers),
            addr_book,
            sync: Arc::new(Mutex::new(SyncState::default())),
            mempool,
            net_blocks: net_blocks_tx,
            net_txs: net_txs_tx,
            net_alerts: net_alerts_tx,
            config: Arc::clone(&config),
        };

        if config.listen {
            let bind_addr = config.listen_addr.unwrap_or_else(|| {
                SocketAddr::from(([0, 0, 0, 0], chain.params().default_port))
            });
            let listener = TcpListener::bind(bind_addr)
                .await
                .map_err(|err| format!("cannot bind {bind_addr}: {err}"))?;
            tokio::spawn(p2p_server::serve_accept(ctx.clone(), listener));
        }
        tokio::spawn(p2p_server::maintain_outbound(ctx.clone()));

        {
            let shutdown_tx = shutdown_tx.clone();
            let chain = Arc::clone(&chain);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log_info!("interrupt received, shutting down");
                    chain.request_abort();
                    let _ = shutdown_tx.send(true);
                }
            });
        }

        node::run(
            ctx.clone(),
            commands_rx,
            net_blocks_rx,
            net_txs_rx,
            net_alerts_rx,
            shutdown_rx,
        )
        .await;

        log_info!("closing network");
        ctx.peers.close_all().await;
        Ok(())
    })
}
