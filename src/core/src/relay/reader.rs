use std::sync::Arc;
use std::time::Duration;

use corazon_protocol::Chunk;
use futures::stream::{self, BoxStream};
use futures::StreamExt;

use super::registry::{ReaderGuard, RunLog};
use crate::lock_or_recover;

/// Chunks delivered to one consumer; always ends with exactly one `finish`.
pub type ChunkStream = BoxStream<'static, Chunk>;

pub(super) fn finish_only() -> ChunkStream {
    stream::once(async { Chunk::Finish }).boxed()
}

/// Follow a run log from `start`.
///
/// A run that was already terminal when the reader attached is only waited
/// on for `idle_timeout` between chunks; after that the reader gives up and
/// synthesizes `finish` so the client can settle.
pub(super) fn follow(log: Arc<RunLog>, start: usize, idle_timeout: Duration) -> ChunkStream {
    let guard = ReaderGuard::new(log.clone());
    let idle = log.status().is_terminal();
    let mut version = log.version.subscribe();

    let stream = async_stream::stream! {
        let _guard = guard;
        let mut offset = start;
        let mut saw_finish = false;

        'outer: loop {
            version.borrow_and_update();
            let (batch, closed) = {
                let state = lock_or_recover(&log.state);
                let batch = state
                    .chunks
                    .get(offset..)
                    .map(<[Chunk]>::to_vec)
                    .unwrap_or_default();
                (batch, state.closed)
            };

            if !batch.is_empty() {
                for chunk in batch {
                    offset += 1;
                    let is_finish = chunk.is_finish();
                    yield chunk;
                    if is_finish {
                        saw_finish = true;
                        break 'outer;
                    }
                }
                continue;
            }
            if closed {
                break;
            }

            if idle {
                match tokio::time::timeout(idle_timeout, version.changed()).await {
                    Ok(Ok(())) => continue,
                    _ => break,
                }
            } else if version.changed().await.is_err() {
                break;
            }
        }

        if !saw_finish {
            yield Chunk::Finish;
        }
    };
    stream.boxed()
}
