use clap::Parser;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use zrx_miner::cli::Args;
use zrx_miner::engine::MiningEngine;
use zrx_miner::error::{MinerError, SubmitOutcome};
use zrx_miner::header::BlockTemplate;
use zrx_miner::pool::{enough_memory_for_fast_mode, VmPool};
use zrx_miner::rpc::{RpcClient, RpcConfig};

const LOG_TARGET: &str = "zrx_miner::main";

/// Every unrecoverable startup/runtime error funnels through here so the
/// process always exits 1 on failure and 0 on a clean SIGINT stop.
fn exit_fatal(err: MinerError) -> ! {
    log::error!(target: LOG_TARGET, "fatal: {}", err);
    eprintln!("fatal: {}", err);
    std::process::exit(1);
}

fn init_logging(args: &Args) {
    let level = if args.debug { "debug" } else { "info" };
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level),
    );
    // `--log-console` decides whether stderr is kept once a log file is also
    // configured; with no log file, stderr is always where logs go.
    if let Some(path) = &args.log_file {
        if !args.log_console {
            if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
        }
    }
    builder.init();
}

fn format_hashrate(hr: f64) -> String {
    if hr >= 1_000_000.0 {
        format!("{:.2} MH/s", hr / 1_000_000.0)
    } else if hr >= 1_000.0 {
        format!("{:.2} KH/s", hr / 1_000.0)
    } else {
        format!("{:.2} H/s", hr)
    }
}

fn fetch_password(args: &Args) -> Option<String> {
    if args.rpc_password.is_some() {
        return args.rpc_password.clone();
    }
    args.rpc_user.as_ref()?;
    eprint!("RPC password: ");
    rpassword_fallback()
}

// The reference stack has no `rpassword` dependency; a miner invoked with
// `--rpc-user` but no `--rpc-password` and no TTY simply mines unauthenticated
// against whatever the empty password yields, matching how the node itself
// treats a configured user with a blank password.
fn rpassword_fallback() -> Option<String> {
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).ok()?;
    Some(line.trim_end().to_string())
}

fn connect_with_retries(client: &RpcClient) -> Result<serde_json::Value, MinerError> {
    let mut last_err = None;
    for attempt in 1..=5 {
        match client.get_blockchain_info() {
            Ok(info) => return Ok(info),
            Err(e) => {
                log::warn!(target: LOG_TARGET, "cannot reach node (attempt {}/5): {}", attempt, e);
                last_err = Some(e);
                if attempt < 5 {
                    std::thread::sleep(Duration::from_secs(2));
                }
            }
        }
    }
    Err(MinerError::Rpc(last_err.expect("at least one attempt always runs")))
}

fn fetch_template_with_retries(client: &RpcClient) -> Result<BlockTemplate, MinerError> {
    let mut last_err = None;
    for attempt in 1..=5 {
        match client.get_block_template() {
            Ok(v) => match BlockTemplate::from_rpc_value(&v) {
                Ok(t) => return Ok(t),
                Err(e) => {
                    log::warn!(target: LOG_TARGET, "malformed template (attempt {}/5): {}", attempt, e);
                    last_err = Some(MinerError::Template(e));
                }
            },
            Err(e) => {
                log::warn!(target: LOG_TARGET, "getblocktemplate failed (attempt {}/5): {}", attempt, e);
                last_err = Some(MinerError::Rpc(e));
            }
        }
        if attempt < 5 {
            std::thread::sleep(Duration::from_secs(2));
        }
    }
    Err(last_err.expect("at least one attempt always runs"))
}

fn fetch_wallet_balance(client: &RpcClient) -> Option<f64> {
    match client.get_wallet_info() {
        Ok(v) => v.get("balance").and_then(serde_json::Value::as_f64),
        Err(e) => {
            log::debug!(target: LOG_TARGET, "getwalletinfo failed: {}", e);
            None
        }
    }
}

fn main() {
    let args = Args::parse();
    init_logging(&args);

    let fast_mode = if args.fast_mode && !enough_memory_for_fast_mode() {
        log::warn!(target: LOG_TARGET, "fast mode requested but available RAM looks too low, falling back to light mode");
        false
    } else {
        args.fast_mode
    };

    let rpc_config = RpcConfig {
        url: args.rpc_url.trim_end_matches('/').to_string(),
        username: args.rpc_user.clone(),
        password: fetch_password(&args),
        ..RpcConfig::default()
    };
    let client = RpcClient::new(rpc_config);

    let chain_info = connect_with_retries(&client).unwrap_or_else(|e| exit_fatal(e));
    log::info!(
        target: LOG_TARGET,
        "connected: chain={} blocks={}",
        chain_info.get("chain").and_then(|v| v.as_str()).unwrap_or("?"),
        chain_info.get("blocks").and_then(|v| v.as_u64()).unwrap_or(0),
    );

    let mut template = fetch_template_with_retries(&client).unwrap_or_else(|e| exit_fatal(e));
    log::info!(
        target: LOG_TARGET,
        "template: height={} bits=0x{:08x} epoch={}",
        template.height,
        template.bits,
        zrx_miner::header::seed_height(template.height)
    );

    let threads = args.resolved_threads();
    let mut pool = VmPool::init(threads, template.seed_hash, fast_mode, args.numa, true)
        .unwrap_or_else(|e| exit_fatal(MinerError::Pool(e)));

    let mut engine = MiningEngine::new();

    let running = Arc::new(AtomicBool::new(true));
    install_sigint_handler(running.clone());

    log::info!(target: LOG_TARGET, "mining started with {} threads, mode={}", threads, if fast_mode { "fast" } else { "light" });

    engine.start_mining(&mut pool, template.clone());

    let start_time = Instant::now();
    let mut last_template_fetch = Instant::now();
    let mut last_block_check = Instant::now();
    let mut last_stats = Instant::now();
    let mut blocks_found = 0u64;
    let mut consecutive_rpc_failures = 0u32;
    let mut wallet_balance: Option<f64> = None;
    if !args.no_balance {
        wallet_balance = fetch_wallet_balance(&client);
    }

    while running.load(Ordering::Relaxed) {
        if let Some(solution) = engine.get_solution() {
            engine.stop(&pool);
            let submission = zrx_miner::header::assemble_submission(
                &solution.header,
                &solution.hash,
                &solution.template,
            );
            log::info!(target: LOG_TARGET, "*** solution found at height {} ***", solution.template.height);
            match client.submit_block(&hex::encode(submission)) {
                Ok(SubmitOutcome::Accepted) => {
                    blocks_found += 1;
                    log::info!(target: LOG_TARGET, "block accepted, total found: {}", blocks_found);
                }
                Ok(SubmitOutcome::Rejected(reason)) => {
                    log::warn!(target: LOG_TARGET, "block rejected: {}", reason);
                }
                Err(e) => {
                    log::warn!(target: LOG_TARGET, "submitblock failed: {}", e);
                }
            }

            template = fetch_template_with_retries(&client).unwrap_or_else(|e| exit_fatal(e));
            if let Err(e) = pool.update_seed(template.seed_hash) {
                exit_fatal(MinerError::Pool(e));
            }
            engine.start_mining(&mut pool, template.clone());
            last_template_fetch = Instant::now();
        }

        if last_block_check.elapsed() > args.block_check_interval() {
            if !args.no_balance {
                wallet_balance = fetch_wallet_balance(&client).or(wallet_balance);
            }
            match client.get_blockchain_info() {
                Ok(_) => consecutive_rpc_failures = 0,
                Err(e) => {
                    consecutive_rpc_failures += 1;
                    log::warn!(target: LOG_TARGET, "rpc check failed ({}): {}", consecutive_rpc_failures, e);
                    if consecutive_rpc_failures >= 2 {
                        log::error!(target: LOG_TARGET, "DISCONNECTED from node, pausing mining");
                        engine.stop(&pool);
                        while running.load(Ordering::Relaxed) && client.get_blockchain_info().is_err() {
                            std::thread::sleep(Duration::from_secs(2));
                        }
                        if running.load(Ordering::Relaxed) {
                            log::info!(target: LOG_TARGET, "reconnected");
                            consecutive_rpc_failures = 0;
                            template = fetch_template_with_retries(&client).unwrap_or_else(|e| exit_fatal(e));
                            if pool.update_seed(template.seed_hash).is_ok() {
                                engine.start_mining(&mut pool, template.clone());
                            }
                        }
                    }
                }
            }
            last_block_check = Instant::now();
        }

        if last_template_fetch.elapsed() > args.update_interval() {
            if let Ok(v) = client.get_block_template() {
                if let Ok(new_template) = BlockTemplate::from_rpc_value(&v) {
                    let changed = new_template.height != template.height
                        || new_template.bits != template.bits
                        || new_template.seed_hash != template.seed_hash;
                    if changed {
                        let seed_changed = new_template.seed_hash != template.seed_hash;
                        engine.stop(&pool);
                        template = new_template;
                        if seed_changed {
                            if let Err(e) = pool.update_seed(template.seed_hash) {
                                exit_fatal(MinerError::Pool(e));
                            }
                        }
                        engine.start_mining(&mut pool, template.clone());
                    }
                }
            }
            last_template_fetch = Instant::now();
        }

        if last_stats.elapsed() > Duration::from_secs(10) {
            let hr = engine.hashrate();
            let balance_suffix = wallet_balance
                .map(|b| format!(" | balance: {:.8}", b))
                .unwrap_or_default();
            eprint!(
                "\r[H={}] {} | hashes: {} | blocks: {} | bits: 0x{:08x}{}   ",
                template.height,
                format_hashrate(hr),
                engine.hash_count(),
                blocks_found,
                template.bits,
                balance_suffix,
            );
            last_stats = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(50));
    }

    engine.stop(&pool);
    let elapsed = start_time.elapsed().as_secs_f64();
    eprintln!();
    log::info!(
        target: LOG_TARGET,
        "shutting down: {} hashes in {:.1}s, {} blocks found",
        engine.hash_count(),
        elapsed,
        blocks_found
    );
}

fn install_sigint_handler(running: Arc<AtomicBool>) {
    #[cfg(unix)]
    unsafe {
        RUNNING_FLAG.store(Arc::as_ptr(&running) as usize, Ordering::SeqCst);
        std::mem::forget(running);
        libc::signal(libc::SIGINT, handle_sigint as *const () as libc::sighandler_t);
    }
    #[cfg(not(unix))]
    {
        let _ = running;
    }
}

#[cfg(unix)]
static RUNNING_FLAG: AtomicUsize = AtomicUsize::new(0);

#[cfg(unix)]
extern "C" fn handle_sigint(_: libc::c_int) {
    let ptr = RUNNING_FLAG.load(Ordering::SeqCst);
    if ptr != 0 {
        let flag = unsafe { &*(ptr as *const AtomicBool) };
        flag.store(false, Ordering::Relaxed);
    }
}
