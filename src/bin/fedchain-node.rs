use fedchain_core::clock::{Clock, SystemClock};
use fedchain_core::consensus::node::{spawn_eom_ticker, Node, NodeCommand};
use fedchain_core::consensus::storage::{FileStore, SharedStore};
use fedchain_core::validation::NodeKey;
use fedchain_core::{ConsensusState, GenesisConfig};
use std::env;
use std::fs;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{error, info, trace, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fedchain_core=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "node exited");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), String> {
    let mut genesis_path: Option<String> = None;
    let mut key_hex: Option<String> = None;
    let mut key_file: Option<String> = None;
    let mut data_dir: Option<String> = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--genesis" => genesis_path = args.next(),
            "--key-hex" => key_hex = args.next(),
            "--key-file" => key_file = args.next(),
            "--data-dir" => data_dir = args.next(),
            _ => return Err(format!("unknown arg {}", arg)),
        }
    }

    let genesis_path = genesis_path.ok_or("missing --genesis")?;
    let genesis = GenesisConfig::from_file(&genesis_path).map_err(|e| e.to_string())?;

    let secret_hex = if let Some(h) = key_hex {
        h
    } else if let Some(path) = key_file {
        fs::read_to_string(path).map_err(|e| format!("read key file: {}", e))?
    } else {
        return Err("missing --key-hex or --key-file".into());
    };
    let key = NodeKey::from_secret_hex(secret_hex.trim()).map_err(|e| e.to_string())?;

    let data_dir = data_dir.unwrap_or_else(|| format!("data/{}", hex::encode(key.identity())));
    let store: SharedStore = Arc::new(Mutex::new(
        FileStore::open(&data_dir).map_err(|e| format!("open store {}: {}", data_dir, e))?,
    ));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let minute = Duration::from_millis(genesis.consensus.minute_ms());

    let (state, queues) =
        ConsensusState::new(&genesis, key, store, Arc::clone(&clock)).map_err(|e| e.to_string())?;
    info!(data_dir = %data_dir, minute_ms = minute.as_millis() as u64, "node starting");

    let shutdown = Arc::new(AtomicBool::new(false));
    let ticker = spawn_eom_ticker(queues.msg_tx.clone(), clock, minute, Arc::clone(&shutdown));

    // Transport is external; outbound and invalid traffic is only logged here.
    let outbound_rx = queues.outbound_rx;
    thread::spawn(move || {
        while let Ok(msg) = outbound_rx.recv() {
            trace!(kind = msg.kind(), ts = msg.timestamp, "outbound");
        }
    });
    let invalid_rx = queues.invalid_rx;
    thread::spawn(move || {
        while let Ok(msg) = invalid_rx.recv() {
            warn!(kind = msg.kind(), ts = msg.timestamp, "invalid message");
        }
    });

    let (_tx_cmd, rx_cmd) = mpsc::channel::<NodeCommand>();
    let node = Node::new(state, queues.msg_tx);
    let result = node.run(rx_cmd);

    shutdown.store(true, Ordering::Relaxed);
    if ticker.join().is_err() {
        warn!("eom ticker panicked");
    }
    result.map_err(|e| e.to_string())
}
