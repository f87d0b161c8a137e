//! Response streaming as an explicit state machine.
//!
//! Two delivery modes:
//!
//! - **Chunked text**: a complete answer is cut into fixed-size slices with
//!   [`slice_text`]. The caller paces them (the server inserts an
//!   inter-chunk delay), so the output is deterministic and replayable.
//! - **Event stream**: an [`EventStream`] pulls text increments from a
//!   producer one at a time and frames each as a [`StreamEvent`]:
//!
//! ```text
//! Idle ──chunk──▶ Emitting(1) ──chunk──▶ Emitting(n) ──end──▶ Done
//!   │                 │                       │
//!   └─────────────────┴──────── error ────────┴──────────────▶ Errored
//! ```
//!
//! `Done` and `Errored` are terminal: exactly one `done` or `error` event is
//! emitted, after which the stream yields `None`. A producer that ends or
//! fails therefore always closes the stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, Stream};
use serde_json::json;

/// A lazy, finite, non-restartable sequence of text increments.
pub type TextStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// One framed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(String),
    Done,
    Error(String),
}

impl StreamEvent {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            StreamEvent::Chunk(content) => json!({ "content": content }),
            StreamEvent::Done => json!({ "done": true }),
            StreamEvent::Error(message) => json!({ "error": message }),
        }
    }

    /// `data: <JSON>\n\n`
    pub fn sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    /// Number of chunks emitted so far.
    Emitting(usize),
    Done,
    Errored,
}

impl StreamState {
    pub fn is_finished(self) -> bool {
        matches!(self, StreamState::Done | StreamState::Errored)
    }
}

/// Frames a producer's increments as [`StreamEvent`]s.
pub struct EventStream<S> {
    inner: S,
    state: StreamState,
}

impl<S> EventStream<S>
where
    S: Stream<Item = anyhow::Result<String>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: StreamState::Idle,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    fn emitted(&self) -> usize {
        match self.state {
            StreamState::Emitting(n) => n,
            _ => 0,
        }
    }
}

impl<S> Stream for EventStream<S>
where
    S: Stream<Item = anyhow::Result<String>> + Unpin,
{
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        if self.state.is_finished() {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                let emitted = self.emitted();
                self.state = StreamState::Emitting(emitted + 1);
                Poll::Ready(Some(StreamEvent::Chunk(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!(
                    chunks = self.emitted(),
                    error = %e,
                    "stream producer failed"
                );
                self.state = StreamState::Errored;
                Poll::Ready(Some(StreamEvent::Error(format!("{e:#}"))))
            }
            Poll::Ready(None) => {
                self.state = StreamState::Done;
                Poll::Ready(Some(StreamEvent::Done))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.state.is_finished() {
            (0, Some(0))
        } else {
            let (lower, upper) = self.inner.size_hint();
            (lower + 1, upper.map(|u| u + 1))
        }
    }
}

/// Cut `text` into slices of at most `chunk_size` characters.
///
/// Slices on character boundaries, never inside a UTF-8 sequence. A
/// `chunk_size` of zero is treated as one.
pub fn slice_text(text: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(text.len() / chunk_size + 1);
    let mut current = String::new();
    let mut count = 0;
    for c in text.chars() {
        current.push(c);
        count += 1;
        if count == chunk_size {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// A producer that yields the given chunks without delay.
pub fn text_stream(chunks: Vec<String>) -> TextStream {
    Box::pin(stream::iter(chunks.into_iter().map(Ok)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_slice_text_fixed_size() {
        assert_eq!(slice_text("abcdefg", 3), vec!["abc", "def", "g"]);
        assert_eq!(slice_text("abc", 3), vec!["abc"]);
        assert!(slice_text("", 3).is_empty());
        assert_eq!(slice_text("ab", 0), vec!["a", "b"]);
    }

    #[test]
    fn test_slice_text_respects_char_boundaries() {
        let chunks = slice_text("ñandú👁️", 2);
        assert_eq!(chunks.concat(), "ñandú👁️");
        assert!(chunks.iter().all(|c| c.chars().count() <= 2));
    }

    #[test]
    fn test_sse_frames() {
        assert_eq!(
            StreamEvent::Chunk("hi".into()).sse_frame(),
            "data: {\"content\":\"hi\"}\n\n"
        );
        assert_eq!(StreamEvent::Done.sse_frame(), "data: {\"done\":true}\n\n");
        assert_eq!(
            StreamEvent::Error("boom".into()).sse_frame(),
            "data: {\"error\":\"boom\"}\n\n"
        );
    }

    #[tokio::test]
    async fn test_event_stream_emits_in_order_then_done() {
        let mut events = EventStream::new(text_stream(vec!["a".into(), "b".into()]));
        assert_eq!(events.state(), StreamState::Idle);

        assert_eq!(events.next().await, Some(StreamEvent::Chunk("a".into())));
        assert_eq!(events.state(), StreamState::Emitting(1));
        assert_eq!(events.next().await, Some(StreamEvent::Chunk("b".into())));
        assert_eq!(events.state(), StreamState::Emitting(2));
        assert_eq!(events.next().await, Some(StreamEvent::Done));
        assert_eq!(events.state(), StreamState::Done);
        assert_eq!(events.next().await, None);
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn test_empty_producer_is_just_done() {
        let events: Vec<_> = EventStream::new(text_stream(Vec::new())).collect().await;
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[tokio::test]
    async fn test_producer_failure_emits_one_error_and_closes() {
        let producer: TextStream = Box::pin(stream::iter(vec![
            Ok("partial".to_string()),
            Err(anyhow::anyhow!("provider disconnected")),
            Ok("never seen".to_string()),
        ]));
        let mut events = EventStream::new(producer);
        let collected: Vec<_> = (&mut events).collect().await;
        assert_eq!(
            collected,
            vec![
                StreamEvent::Chunk("partial".into()),
                StreamEvent::Error("provider disconnected".into()),
            ]
        );
        assert_eq!(events.state(), StreamState::Errored);
        assert!(collected.last().unwrap().is_terminal());
    }
}
