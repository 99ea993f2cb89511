// pastellad — the Pastella full node daemon.
//
// Startup order: flags → config → identity/wallet → chain (load, validate,
// or bootstrap) → P2P → API → miner → timers. Ctrl-C stops the miner,
// flushes the chain and reputation snapshots and exits 0; fatal startup
// errors (bad config, ledger mismatch) exit 1.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use colored::*;
use tokio::sync::{Mutex, Notify, RwLock};

use pastella::config::Config;
use pastella::consensus::chain::{Blockchain, ChainParams};
use pastella::consensus::genesis::create_genesis_block;
use pastella::crypto::velora::VeloraEngine;
use pastella::miner::Miner;
use pastella::net::mempool::Mempool;
use pastella::net::node::P2pNode;
use pastella::net::reputation::ReputationManager;
use pastella::node::{ChainSnapshot, ChainStore, NodeIdentity};
use pastella::now_ms;
use pastella::rpc::{RpcState, start_api_server};
use pastella::wallet::Wallet;

const CHAIN_SAVE_INTERVAL_SECS: u64 = 120;

fn banner() {
    println!(
        "{}",
        " ██████╗  █████╗ ███████╗████████╗███████╗██╗     ██╗      █████╗ ".bright_cyan()
    );
    println!(
        "{}",
        " ██╔══██╗██╔══██╗██╔════╝╚══██╔══╝██╔════╝██║     ██║     ██╔══██╗".bright_cyan()
    );
    println!(
        "{}",
        " ██████╔╝███████║███████╗   ██║   █████╗  ██║     ██║     ███████║"
            .bright_cyan()
            .bold()
    );
    println!(
        "{}",
        " ██╔═══╝ ██╔══██║╚════██║   ██║   ██╔══╝  ██║     ██║     ██╔══██║"
            .bright_cyan()
            .bold()
    );
    println!(
        "{}",
        " ██║     ██║  ██║███████║   ██║   ███████╗███████╗███████╗██║  ██║".blue()
    );
    println!(
        "{}",
        " ╚═╝     ╚═╝  ╚═╝╚══════╝   ╚═╝   ╚══════╝╚══════╝╚══════╝╚═╝  ╚═╝".blue()
    );
    println!();
    println!(
        "{}",
        format!("            v{} — memory-hard proof-of-work node", env!("CARGO_PKG_VERSION"))
            .bright_green()
            .bold()
    );
    println!();
}

fn print_help() {
    println!("Usage: pastellad [options]");
    println!();
    println!("  --config <file>                 config file path");
    println!("  --data-dir <dir>                data directory");
    println!("  --api-port <port>               HTTP API port");
    println!("  --p2p-port <port>               P2P listen port");
    println!("  --host <addr>                   API bind host");
    println!("  --api-key <key>                 API key for protected endpoints");
    println!("  --block-time <ms>               target block spacing");
    println!("  --min-seed-conn <n>             minimum seed connections");
    println!("  --difficulty-algorithm <name>   lwma3 | aggressive | dogecoin");
    println!("  --mine / --no-mine              toggle the built-in miner (off by default)");
    println!("  --no-api                        disable the HTTP API");
    println!("  --no-p2p                        disable networking");
    println!("  --generate-genesis              mine and print a genesis compact, then exit");
    println!("  --debug                         verbose logging");
    println!("  --help, --version");
}

#[derive(Default)]
struct Flags {
    config_path: Option<String>,
    data_dir: Option<String>,
    api_port: Option<u16>,
    p2p_port: Option<u16>,
    host: Option<String>,
    api_key: Option<String>,
    block_time: Option<u64>,
    min_seed_conn: Option<usize>,
    difficulty_algorithm: Option<String>,
    mine: bool,
    no_api: bool,
    no_p2p: bool,
    generate_genesis: bool,
    debug: bool,
}

fn take_value(
    iter: &mut std::slice::Iter<'_, String>,
    flag: &str,
    inline: Option<&str>,
) -> Result<String, String> {
    if let Some(v) = inline {
        return Ok(v.to_string());
    }
    iter.next()
        .map(|s| s.to_string())
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_flags(args: &[String]) -> Result<Flags, String> {
    let mut flags = Flags::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) => (f, Some(v)),
            None => (arg.as_str(), None),
        };
        match flag {
            "--config" => flags.config_path = Some(take_value(&mut iter, flag, inline)?),
            "--data-dir" => flags.data_dir = Some(take_value(&mut iter, flag, inline)?),
            "--api-port" => {
                flags.api_port = Some(
                    take_value(&mut iter, flag, inline)?
                        .parse()
                        .map_err(|_| "--api-port must be a port number".to_string())?,
                )
            }
            "--p2p-port" => {
                flags.p2p_port = Some(
                    take_value(&mut iter, flag, inline)?
                        .parse()
                        .map_err(|_| "--p2p-port must be a port number".to_string())?,
                )
            }
            "--host" => flags.host = Some(take_value(&mut iter, flag, inline)?),
            "--api-key" => flags.api_key = Some(take_value(&mut iter, flag, inline)?),
            "--block-time" => {
                flags.block_time = Some(
                    take_value(&mut iter, flag, inline)?
                        .parse()
                        .map_err(|_| "--block-time must be milliseconds".to_string())?,
                )
            }
            "--min-seed-conn" => {
                flags.min_seed_conn = Some(
                    take_value(&mut iter, flag, inline)?
                        .parse()
                        .map_err(|_| "--min-seed-conn must be 0-10".to_string())?,
                )
            }
            "--difficulty-algorithm" => {
                flags.difficulty_algorithm = Some(take_value(&mut iter, flag, inline)?)
            }
            "--mine" => flags.mine = true,
            "--no-mine" => flags.mine = false,
            "--no-api" => flags.no_api = true,
            "--no-p2p" => flags.no_p2p = true,
            "--generate-genesis" => flags.generate_genesis = true,
            "--debug" => flags.debug = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("pastellad {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => return Err(format!("unknown flag: {other}")),
        }
    }
    Ok(flags)
}

fn apply_flags(config: &mut Config, flags: &Flags) -> Result<(), String> {
    if let Some(dir) = &flags.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if let Some(port) = flags.api_port {
        config.api.port = port;
    }
    if let Some(port) = flags.p2p_port {
        config.network.p2p_port = port;
    }
    if let Some(host) = &flags.host {
        config.api.host = host.clone();
    }
    if let Some(key) = &flags.api_key {
        config.api.api_key = Some(key.clone());
    }
    if let Some(ms) = flags.block_time {
        config.blockchain.block_time = ms;
    }
    if let Some(n) = flags.min_seed_conn {
        config.network.min_seed_connections = n;
    }
    if let Some(algo) = &flags.difficulty_algorithm {
        config.blockchain.difficulty_algorithm = algo.parse()?;
    }
    Ok(())
}

/// Load the persisted chain or bootstrap a fresh one. Ledger-level config
/// mismatches are fatal; corrupt files are backed up and replaced.
fn open_chain(
    store: &ChainStore,
    params: &ChainParams,
    engine: &VeloraEngine,
) -> Result<Blockchain, i32> {
    let tag = "[chain]".bright_cyan().bold();
    match store.load() {
        Ok(Some(snapshot)) => {
            if snapshot.network_id != params.network_id {
                eprintln!(
                    "{} chain file belongs to network '{}', config says '{}'",
                    "[fatal]".bright_red().bold(),
                    snapshot.network_id,
                    params.network_id
                );
                return Err(1);
            }
            if snapshot.difficulty_algorithm != params.algorithm {
                eprintln!(
                    "{} chain file uses difficulty algorithm {}, config says {}",
                    "[fatal]".bright_red().bold(),
                    snapshot.difficulty_algorithm,
                    params.algorithm
                );
                return Err(1);
            }
            match Blockchain::from_blocks(params.clone(), engine.clone(), snapshot.blocks, now_ms())
            {
                Ok(chain) => {
                    println!("{tag} loaded chain at height {}", chain.height());
                    Ok(chain)
                }
                Err(e) => {
                    eprintln!("{tag} persisted chain failed validation: {e}");
                    match store.backup_corrupt(now_ms()) {
                        Ok(backup) => {
                            eprintln!("{tag} moved rejected chain to {}", backup.display())
                        }
                        Err(e) => eprintln!("{tag} could not back up chain file: {e}"),
                    }
                    println!("{tag} bootstrapping fresh chain from genesis");
                    Ok(Blockchain::bootstrap(params.clone(), engine.clone()))
                }
            }
        }
        Ok(None) => {
            println!("{tag} no chain file — bootstrapping genesis");
            Ok(Blockchain::bootstrap(params.clone(), engine.clone()))
        }
        Err(e) => {
            eprintln!("{tag} unreadable chain file: {e}");
            match store.backup_corrupt(now_ms()) {
                Ok(backup) => eprintln!("{tag} moved corrupt chain to {}", backup.display()),
                Err(e) => eprintln!("{tag} could not back up chain file: {e}"),
            }
            Ok(Blockchain::bootstrap(params.clone(), engine.clone()))
        }
    }
}

fn snapshot_of(chain: &Blockchain) -> ChainSnapshot {
    ChainSnapshot {
        network_id: chain.params().network_id.clone(),
        difficulty_algorithm: chain.params().algorithm,
        blocks: chain.blocks().to_vec(),
    }
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let flags = match parse_flags(&args) {
        Ok(flags) => flags,
        Err(e) => {
            eprintln!("{} {e}", "error:".bright_red().bold());
            print_help();
            return 1;
        }
    };

    banner();

    let config_path = flags
        .config_path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("pastella.json"));
    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {e}", "[fatal]".bright_red().bold());
            return 1;
        }
    };
    if let Err(e) = apply_flags(&mut config, &flags) {
        eprintln!("{} {e}", "[fatal]".bright_red().bold());
        return 1;
    }
    if let Err(e) = config.validate() {
        eprintln!("{} {e}", "[fatal]".bright_red().bold());
        return 1;
    }

    let engine = VeloraEngine::new();
    let params = ChainParams::from_config(&config);

    if flags.generate_genesis {
        println!("{} mining genesis compact...", "[init]".bright_blue().bold());
        let genesis = create_genesis_block(&params.genesis, &engine);
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "timestamp": genesis.timestamp,
                "difficulty": genesis.difficulty,
                "nonce": genesis.nonce,
                "hash": genesis.hash,
            }))
            .expect("genesis serializes")
        );
        return 0;
    }

    let data_dir = config.data_dir();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        eprintln!(
            "{} cannot create data dir {}: {e}",
            "[fatal]".bright_red().bold(),
            data_dir.display()
        );
        return 1;
    }
    println!(
        "{} data dir: {}",
        "[init]".bright_blue().bold(),
        data_dir.display()
    );

    let identity = match NodeIdentity::load_or_generate(&config.identity_file(), now_ms()) {
        Ok(identity) => identity,
        Err(e) => {
            eprintln!("{} identity: {e}", "[fatal]".bright_red().bold());
            return 1;
        }
    };
    println!(
        "{} node id: {}…",
        "[init]".bright_blue().bold(),
        &identity.node_id[..16]
    );

    let wallet = match Wallet::load_or_create(&config.wallet_file(), now_ms()) {
        Ok(wallet) => wallet,
        Err(e) => {
            eprintln!("{} wallet: {e}", "[fatal]".bright_red().bold());
            return 1;
        }
    };
    println!(
        "{} wallet address: {}",
        "[init]".bright_blue().bold(),
        wallet.address()
    );

    let store = ChainStore::new(&config.blockchain_file());
    let chain = match open_chain(&store, &params, &engine) {
        Ok(chain) => chain,
        Err(code) => return code,
    };
    if !store.exists()
        && let Err(e) = store.save(&snapshot_of(&chain))
    {
        eprintln!("{} initial chain save failed: {e}", "[fatal]".bright_red().bold());
        return 1;
    }

    let chain = Arc::new(RwLock::new(chain));
    let mempool = Arc::new(Mutex::new(Mempool::new(
        config.blockchain.mempool_max_size_kb,
        config.wallet.min_fee,
    )));
    let reputation = Arc::new(Mutex::new(ReputationManager::open(
        &config.reputation_file(),
    )));
    let shutdown = Arc::new(Notify::new());

    let node = if flags.no_p2p {
        println!("{} p2p disabled", "[init]".bright_blue().bold());
        None
    } else {
        let node = P2pNode::new(
            config.clone(),
            identity.clone(),
            chain.clone(),
            mempool.clone(),
            reputation.clone(),
        );
        let listener = node.clone();
        let shutdown_on_failure = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.start().await {
                eprintln!("{} listener failed: {e}", "[p2p]".bright_red().bold());
                shutdown_on_failure.notify_waiters();
            }
        });
        Some(node)
    };

    let miner = if flags.mine {
        let miner = Arc::new(Miner::new(chain.clone(), mempool.clone(), wallet.address()));
        let runner = miner.clone();
        let miner_node = node.clone();
        tokio::spawn(async move {
            runner.run(miner_node).await;
        });
        Some(miner)
    } else {
        None
    };

    // Periodic chain snapshot. A failing save is a fatal persistence error.
    {
        let chain = chain.clone();
        let store = ChainStore::new(&config.blockchain_file());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(CHAIN_SAVE_INTERVAL_SECS));
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                let snapshot = snapshot_of(&*chain.read().await);
                if let Err(e) = store.save(&snapshot) {
                    eprintln!(
                        "{} chain snapshot failed: {e} — shutting down",
                        "[fatal]".bright_red().bold()
                    );
                    shutdown.notify_waiters();
                    return;
                }
            }
        });
    }

    let state = Arc::new(RpcState {
        config: config.clone(),
        chain: chain.clone(),
        mempool: mempool.clone(),
        reputation: reputation.clone(),
        node: node.clone(),
        miner: miner.clone(),
        started_at: now_ms(),
        shutdown: shutdown.clone(),
    });

    if !flags.no_api {
        let state = state.clone();
        let api_port = config.api.port;
        let shutdown_on_failure = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = start_api_server(state, api_port).await {
                eprintln!("{} api failed: {e}", "[api]".bright_red().bold());
                shutdown_on_failure.notify_waiters();
            }
        });
    } else {
        println!("{} api disabled", "[init]".bright_blue().bold());
    }

    if flags.debug {
        println!(
            "{} network={} p2p={} api={} algo={}",
            "[debug]".bright_black(),
            config.network.network_id,
            config.network.p2p_port,
            config.api.port,
            config.blockchain.difficulty_algorithm
        );
    }

    // Run until Ctrl-C or an internal fatal error.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("{} signal received", "[shutdown]".bright_red().bold());
        }
        _ = shutdown.notified() => {
            println!("{} stop requested", "[shutdown]".bright_red().bold());
        }
    }

    if let Some(miner) = &miner {
        miner.stop_handle().store(true, Ordering::Relaxed);
    }

    // Final flushes.
    let snapshot = snapshot_of(&*chain.read().await);
    if let Err(e) = store.save(&snapshot) {
        eprintln!("{} final chain save failed: {e}", "[shutdown]".bright_red().bold());
        return 1;
    }
    if let Err(e) = reputation.lock().await.save() {
        eprintln!("{} reputation save failed: {e}", "[shutdown]".yellow());
    }
    println!("{} done", "[shutdown]".bright_red().bold());
    0
}
