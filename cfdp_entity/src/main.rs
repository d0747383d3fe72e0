// src/main.rs
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use cfdp_entity::commands::{self, Command};
use cfdp_entity::config::{self, Config};
use cfdp_entity::filestore::DirectoryStore;
use cfdp_entity::manager::TransactionManager;
use cfdp_entity::net::udp::{self, ChannelSink, LossModel};
use cfdp_entity::{EngineError, logging};
use cfdp_protocol::EntityId;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

type Manager = TransactionManager<ChannelSink, DirectoryStore>;

fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::from_default_env()
        .add_directive("cfdp_entity=info".parse()?)
        .add_directive("cfdp_protocol=info".parse()?)
        .add_directive("tokio=warn".parse()?);
    match log_dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "cfdp-entity.log"));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .compact()
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).compact().init();
            Ok(None)
        }
    }
}

async fn send_file(
    manager: &mut Manager,
    path: &Path,
    to: EntityId,
    cfg: &Config,
) -> Result<()> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?;
    let id = manager.start_transfer(to, name, data, cfg.class, cfg.closure, Instant::now())?;
    info!(event = "transfer_started", txn = %id, file = %path.display(), peer = %to);
    Ok(())
}

async fn run_command(manager: &mut Manager, cmd: Command, cfg: &Config) {
    let now = Instant::now();
    let result: Result<(), EngineError> = match cmd {
        Command::Send { path, to } => {
            let Some(to) = to.or(cfg.send_to) else {
                warn!(event = "send_rejected", reason = "no destination entity");
                return;
            };
            if let Err(e) = send_file(manager, &path, to, cfg).await {
                warn!(event = "send_rejected", file = %path.display(), error = %e);
            }
            return;
        }
        Command::Cancel(id) => manager.cancel_transfer(id, now),
        Command::Suspend(id) => manager.suspend(id, now),
        Command::Resume(id) => manager.resume(id, now),
        Command::Prompt(id, kind) => manager.prompt(id, kind, now),
        Command::Status => {
            for s in manager.summaries() {
                info!(
                    event = "status",
                    txn = %s.id,
                    role = ?s.role,
                    class = s.class,
                    state = %s.state,
                    file = %s.file_name,
                    progress = s.progress,
                    size = s.file_size,
                    suspended = s.suspended,
                );
            }
            Ok(())
        }
        Command::Stats => {
            info!(event = "stats", stats = ?manager.stats(), active = manager.active_count());
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!(event = "command_rejected", error = %e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = config::Cli::parse_and_build_config()?;
    if cfg.print_config {
        print!("{}", cfg.file.to_toml()?);
        return Ok(());
    }
    let _log_guard = init_tracing(cfg.log_dir.as_deref())?;
    logging::init(cfg.log_dir.clone().unwrap_or_else(|| PathBuf::from("logs")));

    let registry = Arc::new(cfg.file.registry()?);
    let peers = cfg.file.peer_addresses()?;
    let store = DirectoryStore::new(cfg.store_dir.clone(), cfg.file.store.conflict)
        .with_context(|| format!("opening store {}", cfg.store_dir.display()))?;
    info!(
        local = %registry.local()?.entity_id,
        bind = %cfg.bind,
        store = %cfg.store_dir.display(),
        peers = peers.len(),
        "CFDP entity starting"
    );

    // -------- link ----------
    let socket = Arc::new(udp::bind(&cfg.bind).await?);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, mut in_rx) = mpsc::channel(1024);
    let addr_book = peers.clone();
    udp::spawn_sender(socket.clone(), peers, LossModel::new(cfg.loss), out_rx);
    udp::spawn_receiver(socket, in_tx);

    // -------- engine ----------
    let (report_tx, mut report_rx) = mpsc::unbounded_channel();
    let mut manager = TransactionManager::new(registry, ChannelSink::new(out_tx), store, report_tx)?
        .with_retention(cfg.file.retention())
        .with_max_file_size(cfg.file.store.max_file_size);

    let (cmd_tx, mut cmd_rx) = mpsc::channel(64);
    commands::spawn_stdin_reader(cmd_tx);

    if let Some(to) = cfg.send_to {
        for path in &cfg.send {
            if let Err(e) = send_file(&mut manager, path, to, &cfg).await {
                error!(event = "send_rejected", file = %path.display(), error = %e);
            }
        }
    }

    let mut ticker = tokio::time::interval(cfg.tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!("entity running. Press Ctrl+C to stop");

    loop {
        tokio::select! {
            Some((bytes, from)) = in_rx.recv() => {
                let peer = addr_book
                    .iter()
                    .find_map(|(id, addr)| (*addr == from).then_some(*id))
                    .unwrap_or(EntityId(0));
                logging::pdus::log_pdu("rx", peer, &bytes).await;
                manager.on_pdu_received_blocking(&bytes, Instant::now());
            }
            _ = ticker.tick() => {
                manager.tick(Instant::now());
                if cfg.exit_when_idle && manager.stats().completed > 0 && manager.active_count() == 0 {
                    info!("all transactions finished; exiting");
                    break;
                }
            }
            Some(cmd) = cmd_rx.recv() => run_command(&mut manager, cmd, &cfg).await,
            Some(report) = report_rx.recv() => logging::csv::log_transfer(&report).await,
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(?e, "failed to install Ctrl+C handler");
                }
                info!("shutdown signal received; exiting.");
                break;
            }
        }
    }

    while let Ok(report) = report_rx.try_recv() {
        logging::csv::log_transfer(&report).await;
    }
    info!(stats = ?manager.stats(), "entity stopped");
    Ok(())
}
