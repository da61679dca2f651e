mod cache;
mod candidates;
mod config;
mod errors;
mod ingest;
mod lifecycle;
mod logging;
mod maintenance;
mod models;
mod normalizer;
mod scorer;
mod server;
mod session;
mod store;
mod util;

use anyhow::Result;
use config::EngineConfig;
use models::Incognito;
use server::protocol::Request;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("clai-engine {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }
    if args.first().map(|s| s.as_str()) == Some("status") {
        return debug_status().await;
    }

    if !args.is_empty() {
        eprintln!("clai-engine: unknown command '{}'", args[0]);
        eprintln!("Run 'clai-engine --help' for usage.");
        std::process::exit(1);
    }

    run_daemon().await
}

fn print_help() {
    println!("clai-engine {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Local background engine for shell history and next-command suggestions.");
    println!("Run with no arguments to start the daemon. The CLI and shell hooks that");
    println!("talk to it over $CLAI_SOCKET are a separate, external collaborator.");
    println!();
    println!("USAGE:");
    println!("    clai-engine            start the daemon in the foreground");
    println!("    clai-engine status     query a running daemon's status{{}} and print it");
    println!("    clai-engine --version   print the version");
    println!("    clai-engine --help      print this message");
}

/// Thin debug CLI: connects to the running daemon's socket, sends `status{}`,
/// prints the JSON response. Exit codes follow §6: 0 success, 2 unavailable.
async fn debug_status() -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    let socket_path = models::socket_path();
    let mut stream = match UnixStream::connect(&socket_path).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("clai-engine: cannot reach daemon at {socket_path:?}: {e}");
            std::process::exit(2);
        }
    };

    let body = serde_json::to_vec(&Request::Status {})?;
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    let mut resp_buf = vec![0u8; len as usize];
    stream.read_exact(&mut resp_buf).await?;

    let response: serde_json::Value = serde_json::from_slice(&resp_buf)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn run_daemon() -> Result<()> {
    logging::init(Some(models::log_path()), logging::level_from_env());
    logging::info(&format!("clai-engine {} starting", env!("CARGO_PKG_VERSION")));

    let cfg = Arc::new(EngineConfig::from_env());

    let lock_path = models::lock_path();
    let socket_path = models::socket_path();
    let (daemon_handle, listener) = lifecycle::startup(&lock_path, &socket_path).await?;
    logging::info(&format!("listening on {socket_path:?}"));

    let store = Arc::new(store::Store::open(&models::db_path(), cfg.sqlite_busy_timeout_ms).await?);

    let default_incognito = if env_flag("CLAI_EPHEMERAL") || env_flag("CLAI_NO_RECORD") {
        Incognito::Ephemeral
    } else {
        Incognito::Off
    };
    let sessions = Arc::new(session::SessionTracker::new(
        cfg.pending_start_ttl,
        cfg.session_idle_evict,
        default_incognito,
    ));

    let scorer = Arc::new(scorer::Scorer::new(cfg.clone()));
    if let Ok(rows) = store.load_weights().await {
        scorer.load_persisted(rows);
    }

    let ingest = ingest::Ingest::new(&cfg);
    let suggest_cache = cache::Cache::new(cfg.cache_ttl_ms, cfg.cache_memory_budget_mb);

    let suggestions_enabled = AtomicBool::new(
        std::env::var("CLAI_SUGGESTIONS_ENABLED")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(true),
    );

    let state = Arc::new(server::EngineState {
        store: store.clone(),
        sessions: sessions.clone(),
        ingest: ingest.clone(),
        scorer: scorer.clone(),
        suggest_cache,
        cfg: cfg.clone(),
        start_time: Instant::now(),
        playbooks: Vec::new(),
        suggestions_enabled,
        shutdown_requested: tokio::sync::Notify::new(),
        last_activity: std::sync::Mutex::new(Instant::now()),
        dropped_total_snapshot: std::sync::atomic::AtomicU64::new(0),
        suggestions: std::sync::Mutex::new(std::collections::HashMap::new()),
    });

    let ingest_task = tokio::spawn(ingest.clone().run(store.clone(), sessions.clone(), cfg.clone()));
    let maintenance_task = tokio::spawn(maintenance::run(store.clone(), cfg.clone()));
    let session_gc_task = tokio::spawn({
        let sessions = sessions.clone();
        async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                sessions.gc().await;
            }
        }
    });

    let server_state = state.clone();
    let server_task = tokio::spawn(server::run(listener, server_state));

    wait_for_shutdown_signal(&state).await;

    logging::info("shutting down");
    ingest_task.abort();
    maintenance_task.abort();
    session_gc_task.abort();
    server_task.abort();
    persist_weights(&store, &scorer).await;
    lifecycle::shutdown(&daemon_handle);

    Ok(())
}

async fn persist_weights(store: &store::Store, scorer: &scorer::Scorer) {
    for (signal, value, samples) in scorer.weights_for_persist() {
        if let Err(e) = store.save_weight(signal, value, samples).await {
            logging::warn(&format!("failed to persist weight: {e}"));
        }
    }
}

async fn wait_for_shutdown_signal(state: &Arc<server::EngineState>) {
    let idle_timeout = if state.cfg.idle_timeout_mins > 0 {
        Some(std::time::Duration::from_secs(state.cfg.idle_timeout_mins * 60))
    } else {
        None
    };

    loop {
        let idle_check = async {
            match idle_timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                logging::info("received SIGINT");
                return;
            }
            _ = terminate_signal() => {
                logging::info("received SIGTERM");
                return;
            }
            _ = state.shutdown_requested.notified() => {
                logging::info("received shutdown{} request");
                return;
            }
            _ = idle_check => {
                let idle_for = state.last_activity.lock().unwrap().elapsed();
                if idle_for >= idle_timeout.unwrap() {
                    logging::info("idle timeout reached");
                    return;
                }
            }
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).map(|v| v == "1" || v.to_lowercase() == "true").unwrap_or(false)
}
