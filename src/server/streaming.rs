//! Raw text streaming for incremental responses.
//!
//! Converts a [`CompletionStream`] into body chunks: each chunk is exactly
//! the text of one completion event, with no SSE framing. Empty fragments
//! are skipped. The first fragment is pulled before the response starts, so
//! a failure or timeout ahead of any output still gets an error status. After
//! that the body ends when the events run out or on the first error; dropping
//! the body (client disconnect) drops the event stream, which cancels the
//! generation.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, Stream};
use prometheus::{IntCounter, IntCounterVec};
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::inference::facade::{CompletionStream, LanguageModel};

/// Media type of streaming responses.
pub const STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Counters a streaming body reports into.
#[derive(Clone)]
pub struct StreamCounters {
    pub fragments: IntCounter,
    /// Errors that end a body after headers were sent, by kind.
    pub errors: IntCounterVec,
}

struct Pump {
    events: CompletionStream,
    request_id: Uuid,
    idle_timeout: Duration,
    counters: StreamCounters,
    delivered: usize,
}

impl Pump {
    /// Next non-empty text chunk. `None` once the events run out.
    async fn next_chunk(&mut self) -> Option<Result<Bytes, ServiceError>> {
        loop {
            let next = match tokio::time::timeout(self.idle_timeout, self.events.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let err = ServiceError::Timeout(self.idle_timeout.as_secs());
                    warn!(request_id = %self.request_id, delivered = self.delivered, "{err}");
                    return Some(Err(err));
                }
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(err)) => {
                    warn!(request_id = %self.request_id, error = %err, "Stream aborted");
                    return Some(Err(err));
                }
                None => {
                    debug!(
                        request_id = %self.request_id,
                        fragments = self.delivered,
                        "Stream finished"
                    );
                    return None;
                }
            };

            match LanguageModel::extract_text(&event) {
                Ok("") => continue,
                Ok(text) => {
                    self.delivered += 1;
                    self.counters.fragments.inc();
                    return Some(Ok(Bytes::copy_from_slice(text.as_bytes())));
                }
                Err(err) => {
                    warn!(request_id = %self.request_id, error = %err, "Stream aborted");
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Turn completion events into text chunks. `idle_timeout` bounds the wait
/// for each next event.
///
/// Waits for the first chunk before returning: an error there is returned
/// directly for the caller to report. Errors after that end the body and
/// are counted in `counters.errors`.
pub async fn text_chunks(
    events: CompletionStream,
    request_id: Uuid,
    idle_timeout: Duration,
    counters: StreamCounters,
) -> Result<impl Stream<Item = Result<Bytes, ServiceError>> + Send + 'static, ServiceError> {
    let mut pump = Pump {
        events,
        request_id,
        idle_timeout,
        counters,
        delivered: 0,
    };

    let (first, rest) = match pump.next_chunk().await {
        Some(Ok(chunk)) => (Some(Ok(chunk)), Some(pump)),
        Some(Err(err)) => return Err(err),
        None => (None, None),
    };

    let rest = stream::unfold(rest, |state| async move {
        let mut pump = state?;
        match pump.next_chunk().await? {
            Ok(chunk) => Some((Ok(chunk), Some(pump))),
            Err(err) => {
                pump.counters.errors.with_label_values(&[err.kind()]).inc();
                Some((Err(err), None))
            }
        }
    });

    Ok(stream::iter(first).chain(rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use crate::inference::completion::{CompletionEvent, EngineError, FinishReason};
    use crate::inference::engine::EventResult;

    fn events(items: Vec<EventResult>) -> CompletionStream {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.try_send(item).unwrap();
        }
        CompletionStream::new(rx)
    }

    fn text(t: &str) -> EventResult {
        Ok(CompletionEvent::single("c", "m", t, None))
    }

    fn counters() -> StreamCounters {
        StreamCounters {
            fragments: IntCounter::new("f", "f").unwrap(),
            errors: IntCounterVec::new(prometheus::Opts::new("e", "e"), &["kind"]).unwrap(),
        }
    }

    async fn collect(
        stream: impl Stream<Item = Result<Bytes, ServiceError>>,
    ) -> Vec<Result<Bytes, ServiceError>> {
        tokio::pin!(stream);
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item);
        }
        out
    }

    async fn open(
        items: Vec<EventResult>,
        counters: &StreamCounters,
    ) -> Result<Vec<Result<Bytes, ServiceError>>, ServiceError> {
        let chunks = text_chunks(
            events(items),
            Uuid::new_v4(),
            Duration::from_secs(5),
            counters.clone(),
        )
        .await?;
        Ok(collect(chunks).await)
    }

    #[tokio::test]
    async fn test_one_chunk_per_fragment_in_order() {
        let counters = counters();
        let chunks = open(
            vec![
                text("He"),
                text("llo"),
                text(" there"),
                Ok(CompletionEvent::single("c", "m", "", Some(FinishReason::Stop))),
            ],
            &counters,
        )
        .await
        .unwrap();

        let chunks: Vec<Bytes> = chunks.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            chunks,
            vec![
                Bytes::from_static(b"He"),
                Bytes::from_static(b"llo"),
                Bytes::from_static(b" there")
            ]
        );
        assert_eq!(counters.fragments.get(), 3);
    }

    #[tokio::test]
    async fn test_empty_completion_yields_empty_body() {
        let counters = counters();
        let chunks = open(
            vec![Ok(CompletionEvent::single("c", "m", "", Some(FinishReason::Length)))],
            &counters,
        )
        .await
        .unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_error_after_output_ends_body_and_is_counted() {
        let counters = counters();
        let chunks = open(
            vec![
                text("partial"),
                Err(EngineError::DecodeFailed("oom".into())),
                text("never"),
            ],
            &counters,
        )
        .await
        .unwrap();

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_ok());
        assert!(matches!(chunks[1], Err(ServiceError::Inference(_))));
        assert_eq!(counters.errors.with_label_values(&["inference"]).get(), 1);
    }

    #[tokio::test]
    async fn test_error_before_output_is_returned() {
        let counters = counters();
        let result = open(
            vec![
                Ok(CompletionEvent::single("c", "m", "", None)),
                Err(EngineError::ContextOverflow {
                    prompt_tokens: 9,
                    n_ctx: 4,
                }),
            ],
            &counters,
        )
        .await;

        assert!(matches!(result, Err(ServiceError::Inference(_))));
        // Reported by the caller, not by the body.
        assert_eq!(counters.errors.with_label_values(&["inference"]).get(), 0);
    }

    #[tokio::test]
    async fn test_malformed_first_event_is_returned() {
        let result = open(
            vec![Ok(CompletionEvent {
                id: "c".into(),
                model: "m".into(),
                choices: vec![],
            })],
            &counters(),
        )
        .await;

        assert!(matches!(result, Err(ServiceError::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn test_stalled_engine_times_out_before_output() {
        let (_tx, rx) = mpsc::channel::<EventResult>(1);
        let result = text_chunks(
            CompletionStream::new(rx),
            Uuid::new_v4(),
            Duration::from_millis(50),
            counters(),
        )
        .await;

        assert!(matches!(result, Err(ServiceError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_stall_after_output_ends_body_and_is_counted() {
        let (tx, rx) = mpsc::channel::<EventResult>(1);
        tx.send(text("first")).await.unwrap();
        let counters = counters();

        let chunks = text_chunks(
            CompletionStream::new(rx),
            Uuid::new_v4(),
            Duration::from_millis(50),
            counters.clone(),
        )
        .await
        .unwrap();
        let chunks = collect(chunks).await;
        drop(tx);

        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[1], Err(ServiceError::Timeout(_))));
        assert_eq!(counters.errors.with_label_values(&["timeout"]).get(), 1);
    }
}
