use corazon_protocol::{Chunk, ThreadEvent, UiMessage};

use super::builder::TranscriptBuilder;
use super::normalizer::Normalized;
use crate::relay::RunSink;

/// Serializes normalized records into chunks and tees every chunk into the
/// run log and the transcript builder.
pub struct TurnWriter {
    sink: RunSink,
    builder: Option<TranscriptBuilder>,
    event_index: u64,
}

impl TurnWriter {
    pub fn new(sink: RunSink) -> Self {
        Self {
            sink,
            builder: Some(TranscriptBuilder::new()),
            event_index: 0,
        }
    }

    pub fn sink(&self) -> &RunSink {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut RunSink {
        &mut self.sink
    }

    pub fn write(&mut self, chunk: Chunk) {
        if let Some(builder) = self.builder.as_mut() {
            builder.apply(&chunk);
        }
        self.sink.write(chunk);
    }

    pub fn emit(&mut self, record: Normalized) {
        let chunk = match record {
            Normalized::TextStart { kind, id, metadata } => Chunk::start(kind, id, metadata),
            Normalized::TextDelta { kind, id, delta } => Chunk::delta(kind, id, delta),
            Normalized::TextEnd { kind, id } => Chunk::end(kind, id),
            Normalized::Item(data) => Chunk::DataItem {
                id: data.id().to_string(),
                data,
            },
            Normalized::Event(event) => {
                self.event_index += 1;
                let id = format!("event-{}", self.event_index);
                return self.write_event(id, event);
            }
        };
        self.write(chunk);
    }

    /// Write a thread event under an explicit chunk id.
    pub fn write_event(&mut self, id: String, event: ThreadEvent) {
        let transient = event.is_transient();
        self.write(Chunk::DataEvent {
            id,
            data: event,
            transient,
        });
    }

    pub fn error(&mut self, text: impl Into<String>) {
        self.write(Chunk::error(text));
    }

    /// Build the assistant message from everything written so far. Later
    /// chunks only reach the run log.
    pub fn take_transcript(&mut self) -> Option<UiMessage> {
        self.builder.take().and_then(TranscriptBuilder::build)
    }
}
