mod control;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use plbd_chainstate::state::{ChainState, ChainStateConfig};
use plbd_consensus::{chain_params, Network};
use plbd_storage::fjall::{FjallOptions, FjallStore};
use plbd_storage::memory::MemoryStore;
use plbd_storage::KeyValueStore;
use tracing::{error, info, warn};

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:18332";
const DEFAULT_SCRIPT_WORKERS: usize = 4;
const DEFAULT_COIN_CACHE_MB: usize = 256;
const DEFAULT_DB_CACHE_MB: u64 = 256;
const DEFAULT_MEMPOOL_MAX_MB: usize = 300;
const MEMPOOL_FILE_NAME: &str = "mempool.dat";

#[derive(Clone, Copy, Debug)]
enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

struct Config {
    backend: Backend,
    data_dir: PathBuf,
    network: Network,
    control_addr: String,
    script_workers: usize,
    coin_cache_mb: usize,
    db_cache_mb: u64,
    mempool_max_mb: usize,
    min_relay_fee_per_kb: i64,
    prune_target_mb: Option<u64>,
    require_standard: bool,
    verify_on_start: Option<(u32, u32)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::Fjall,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            network: Network::Mainnet,
            control_addr: DEFAULT_CONTROL_ADDR.to_string(),
            script_workers: DEFAULT_SCRIPT_WORKERS,
            coin_cache_mb: DEFAULT_COIN_CACHE_MB,
            db_cache_mb: DEFAULT_DB_CACHE_MB,
            mempool_max_mb: DEFAULT_MEMPOOL_MAX_MB,
            min_relay_fee_per_kb: plbd_consensus::constants::DEFAULT_MIN_RELAY_FEE_PER_KB,
            prune_target_mb: None,
            require_standard: true,
            verify_on_start: None,
        }
    }
}

fn parse_args() -> Result<Config, String> {
    let mut config = Config::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value_for = |name: &str| {
            args.next()
                .ok_or_else(|| format!("{name} requires a value"))
        };
        match arg.as_str() {
            "--backend" => {
                let value = value_for("--backend")?;
                config.backend =
                    Backend::parse(&value).ok_or_else(|| format!("unknown backend {value}"))?;
            }
            "--datadir" => config.data_dir = PathBuf::from(value_for("--datadir")?),
            "--network" => {
                let value = value_for("--network")?;
                config.network =
                    Network::parse(&value).ok_or_else(|| format!("unknown network {value}"))?;
            }
            "--control" => config.control_addr = value_for("--control")?,
            "--script-workers" => {
                config.script_workers = value_for("--script-workers")?
                    .parse()
                    .map_err(|_| "invalid --script-workers".to_string())?;
            }
            "--coincache-mb" => {
                config.coin_cache_mb = value_for("--coincache-mb")?
                    .parse()
                    .map_err(|_| "invalid --coincache-mb".to_string())?;
            }
            "--dbcache-mb" => {
                config.db_cache_mb = value_for("--dbcache-mb")?
                    .parse()
                    .map_err(|_| "invalid --dbcache-mb".to_string())?;
            }
            "--mempool-mb" => {
                config.mempool_max_mb = value_for("--mempool-mb")?
                    .parse()
                    .map_err(|_| "invalid --mempool-mb".to_string())?;
            }
            "--minrelayfee" => {
                config.min_relay_fee_per_kb = value_for("--minrelayfee")?
                    .parse()
                    .map_err(|_| "invalid --minrelayfee".to_string())?;
            }
            "--prune-mb" => {
                config.prune_target_mb = Some(
                    value_for("--prune-mb")?
                        .parse()
                        .map_err(|_| "invalid --prune-mb".to_string())?,
                );
            }
            "--acceptnonstd" => config.require_standard = false,
            "--verifychain" => {
                let level = value_for("--verifychain")?
                    .parse()
                    .map_err(|_| "invalid --verifychain level".to_string())?;
                let depth = args
                    .next()
                    .map(|value| value.parse::<u32>())
                    .transpose()
                    .map_err(|_| "invalid --verifychain depth".to_string())?
                    .unwrap_or(0);
                config.verify_on_start = Some((level, depth));
            }
            other => return Err(format!("unknown argument {other}")),
        }
    }
    Ok(config)
}

fn chainstate_config(config: &Config) -> ChainStateConfig {
    ChainStateConfig {
        data_dir: config.data_dir.join(config.network.as_str()),
        script_workers: config.script_workers,
        coin_cache_bytes: config.coin_cache_mb * 1024 * 1024,
        prune_target_bytes: config.prune_target_mb.map(|mb| mb * 1024 * 1024),
        require_standard: config.require_standard,
        min_relay_fee_per_kb: config.min_relay_fee_per_kb,
        mempool_max_bytes: config.mempool_max_mb * 1_000_000,
        ..ChainStateConfig::default()
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match parse_args() {
        Ok(config) => config,
        Err(message) => {
            error!("{message}");
            return ExitCode::from(2);
        }
    };

    let result = match config.backend {
        Backend::Memory => run(Arc::new(MemoryStore::new()), config),
        Backend::Fjall => {
            let db_path = config
                .data_dir
                .join(config.network.as_str())
                .join("index");
            let options = FjallOptions {
                cache_bytes: Some(config.db_cache_mb * 1024 * 1024),
                ..FjallOptions::default()
            };
            match FjallStore::open_with_options(db_path, options) {
                Ok(store) => run(Arc::new(store), config),
                Err(err) => {
                    error!("failed to open database: {err}");
                    return ExitCode::from(1);
                }
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            ExitCode::from(1)
        }
    }
}

fn run<S: KeyValueStore + 'static>(store: Arc<S>, config: Config) -> Result<(), String> {
    let params = chain_params(config.network);
    info!(network = config.network.as_str(), "starting chain state");
    let chain = Arc::new(
        ChainState::new(store, params, chainstate_config(&config))
            .map_err(|err| format!("chain state failed to open: {err}"))?,
    );
    let tip = chain.best_block();
    info!(
        height = tip.map(|tip| tip.height).unwrap_or(-1),
        "chain state ready"
    );

    if let Some((level, depth)) = config.verify_on_start {
        chain
            .verify_chain(level, depth)
            .map_err(|err| format!("chain verification failed: {err}"))?;
        info!(level, depth, "chain verification passed");
        return Ok(());
    }

    let mempool_path = config
        .data_dir
        .join(config.network.as_str())
        .join(MEMPOOL_FILE_NAME);
    match std::fs::read(&mempool_path) {
        Ok(bytes) => match chain.load_mempool(&bytes) {
            Ok(loaded) => info!(loaded, "mempool restored"),
            Err(err) => warn!("mempool file ignored: {err}"),
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("failed to read mempool file: {err}"),
    }

    let runtime = tokio::runtime::Runtime::new().map_err(|err| err.to_string())?;
    let shutdown = chain.shutdown_flag();
    runtime.block_on(async {
        let control = tokio::spawn(control::serve(
            config.control_addr.clone(),
            Arc::clone(&chain),
        ));
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; shutting down");
            }
            result = control => {
                match result {
                    Ok(Ok(())) => info!("control socket closed; shutting down"),
                    Ok(Err(err)) => warn!("control socket failed: {err}"),
                    Err(err) => warn!("control task panicked: {err}"),
                }
            }
        }
    });
    shutdown.store(true, Ordering::Release);
    runtime.shutdown_timeout(Duration::from_secs(5));

    // Final persistence pass: mempool image, then a forced flush.
    if let Err(err) = std::fs::write(&mempool_path, chain.dump_mempool()) {
        warn!("failed to persist mempool: {err}");
    }
    chain
        .flush(true)
        .map_err(|err| format!("final flush failed: {err}"))?;
    info!("clean shutdown");
    Ok(())
}
