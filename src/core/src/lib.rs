mod config;
mod corazon_config;
mod server;

pub mod agent;
pub mod paths;
pub mod relay;
pub mod storage;
pub mod turn;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use agent::{AgentEngine, CodexExecEngine, EngineThread, RuntimeThreads, ThreadOptions};
pub use config::ServerConfig;
pub use corazon_config::{ChatConfig, CodexConfig, CorazonConfig, TitleConfig};
pub use paths::{corazon_root_dir, ThreadPaths};
pub use relay::{RunRegistry, RunStatus};
pub use server::build_router;
pub use storage::{SqliteStore, ThreadStore};
pub use turn::{TurnOrchestrator, TurnRequest};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether `CORAZON_DEBUG` asks for verbose per-event logging.
pub fn debug_enabled() -> bool {
    debug_flag(std::env::var("CORAZON_DEBUG").ok().as_deref())
}

fn debug_flag(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "true" | "TRUE" | "yes" | "YES"))
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
