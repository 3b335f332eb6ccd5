mod codex_exec;
mod engine;
mod runtime;

pub use codex_exec::CodexExecEngine;
pub use engine::{
    cancel_pair, AgentEngine, CancelHandle, CancelSignal, EngineError, EngineThread, EventStream,
    RunResult, ThreadOptions,
};
pub use runtime::RuntimeThreads;
