use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use corazon_core::{
    build_router, corazon_root_dir, debug_enabled, CodexExecEngine, CorazonConfig, ServerConfig,
    SqliteStore, ThreadPaths,
};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_filter())
        .init();

    let defaults = ServerConfig::default();

    let bind = parse_socket("CORAZON_BIND", defaults.bind);
    let root_dir = env::var_os("CORAZON_ROOT_DIR").map(PathBuf::from);
    let reconnect_idle_timeout =
        parse_millis("CORAZON_IDLE_TIMEOUT_MS", defaults.reconnect_idle_timeout);
    let run_retention = parse_secs("CORAZON_RUN_RETENTION_SECS", defaults.run_retention);

    let config = ServerConfig {
        bind,
        root_dir,
        reconnect_idle_timeout,
        run_retention,
        run_sweep_interval: defaults.run_sweep_interval,
    };

    let root = match config.root_dir.clone() {
        Some(root) => root,
        None => corazon_root_dir()?,
    };
    std::fs::create_dir_all(&root)?;
    tracing::info!(root = %root.display(), "data root");

    let corazon_config = match CorazonConfig::load(&root) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "failed to load corazon config; using defaults");
            CorazonConfig::default()
        }
    };

    let db_path = env::var_os("CORAZON_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| root.join("corazon.db"));
    let store = Arc::new(SqliteStore::open(&db_path)?);
    let engine = Arc::new(CodexExecEngine::new(corazon_config.codex.clone()));

    let app = build_router(
        config.clone(),
        store,
        engine,
        Arc::new(corazon_config),
        ThreadPaths::new(&root),
    );

    let listener = TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}

fn parse_socket(key: &str, default: SocketAddr) -> SocketAddr {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_millis(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map(Duration::from_millis).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_secs(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map(Duration::from_secs).unwrap_or(default),
        Err(_) => default,
    }
}

fn tracing_filter() -> tracing_subscriber::EnvFilter {
    let explicit = env::var("CORAZON_LOG").or_else(|_| env::var("RUST_LOG")).ok();
    if let Some(filter) = explicit {
        return tracing_subscriber::EnvFilter::new(filter);
    }
    if debug_enabled() {
        return tracing_subscriber::EnvFilter::new("debug");
    }
    tracing_subscriber::EnvFilter::new("info")
}
