//! One chat turn, from engine events to the persisted transcript.
//!
//! ```text
//! engine events ─▶ EventNormalizer ─▶ TurnWriter ─┬─▶ RunSink (run log)
//!                                                 └─▶ TranscriptBuilder
//! ```

mod attachments;
mod builder;
mod input;
mod normalizer;
mod orchestrator;
mod timing;
mod title;
mod writer;

pub use attachments::{relocate_pending, rewrite_attachment_urls};
pub use builder::{apply_reasoning_durations, TranscriptBuilder};
pub use input::{build_engine_input, NO_INPUT_ERROR};
pub use normalizer::{EventNormalizer, NoHooks, Normalized, NormalizerHooks};
pub use orchestrator::{TurnOrchestrator, TurnRequest, TurnStream};
pub use timing::TurnTimer;
pub use title::{normalize_title, TitleGenerator};
pub use writer::TurnWriter;

#[cfg(test)]
mod tests;
