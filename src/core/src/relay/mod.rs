//! Run registry and resume relay.
//!
//! Each turn writes its chunks into a [`RunSink`]; any number of readers
//! replay the buffered log from an offset and follow it live.

mod reader;
mod registry;

pub use reader::ChunkStream;
pub use registry::{RunInfo, RunRegistry, RunSink, RunStatus};
