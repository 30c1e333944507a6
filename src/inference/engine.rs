//! Model worker: serializes access to the native engine.
//!
//! The native handle is not reentrant, so it is owned by one dedicated OS
//! thread. Requests queue on a bounded channel and run one at a time in
//! arrival order:
//! 1. Single-shot jobs reply once over a oneshot channel
//! 2. Streaming jobs forward each event over a bounded channel as soon as
//!    the engine yields it
//! 3. A closed event channel means the client went away; the worker stops
//!    pulling events and drops the generation
//! 4. Jobs whose caller is already gone when they reach the front of the
//!    queue are skipped

use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::ServiceError;
use crate::inference::completion::{
    Completion, CompletionEngine, CompletionEvent, CompletionParams, EngineError,
};

/// Item carried on a streaming channel.
pub type EventResult = Result<CompletionEvent, EngineError>;

enum Job {
    Complete {
        prompt: String,
        params: CompletionParams,
        reply: oneshot::Sender<EventResult>,
    },
    Stream {
        prompt: String,
        params: CompletionParams,
        events: mpsc::Sender<EventResult>,
    },
}

/// Handle to the model worker thread. Dropping the last handle shuts the
/// worker down once queued jobs are done.
pub struct InferenceEngine {
    jobs: mpsc::Sender<Job>,
    model_path: String,
    stream_buffer: usize,
}

impl InferenceEngine {
    /// Move `engine` onto its own worker thread.
    pub fn spawn(
        engine: Box<dyn CompletionEngine>,
        queue_depth: usize,
        stream_buffer: usize,
    ) -> std::io::Result<Self> {
        let (jobs, rx) = mpsc::channel(queue_depth.max(1));
        let model_path = engine.model_path().to_string();

        thread::Builder::new()
            .name("model-worker".into())
            .spawn(move || run_worker(engine, rx))?;

        Ok(Self {
            jobs,
            model_path,
            stream_buffer: stream_buffer.max(1),
        })
    }

    pub fn model_path(&self) -> &str {
        &self.model_path
    }

    /// Run a non-streaming completion.
    pub async fn complete(
        &self,
        prompt: String,
        mut params: CompletionParams,
    ) -> Result<CompletionEvent, ServiceError> {
        params.stream = false;
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job::Complete {
                prompt,
                params,
                reply,
            })
            .await
            .map_err(|_| ServiceError::WorkerUnavailable)?;

        let event = rx.await.map_err(|_| ServiceError::WorkerUnavailable)??;
        Ok(event)
    }

    /// Start a streaming completion. Events arrive on the returned receiver
    /// in generation order; the channel closes when generation ends.
    pub async fn stream(
        &self,
        prompt: String,
        mut params: CompletionParams,
    ) -> Result<mpsc::Receiver<EventResult>, ServiceError> {
        params.stream = true;
        let (events, rx) = mpsc::channel(self.stream_buffer);
        self.jobs
            .send(Job::Stream {
                prompt,
                params,
                events,
            })
            .await
            .map_err(|_| ServiceError::WorkerUnavailable)?;
        Ok(rx)
    }
}

fn run_worker(mut engine: Box<dyn CompletionEngine>, mut jobs: mpsc::Receiver<Job>) {
    info!(model = engine.model_path(), "Model worker started");

    while let Some(job) = jobs.blocking_recv() {
        match job {
            Job::Complete { reply, .. } if reply.is_closed() => {
                debug!("Caller gone before job started, skipping completion");
            }
            Job::Stream { events, .. } if events.is_closed() => {
                debug!("Caller gone before job started, skipping stream");
            }
            Job::Complete {
                prompt,
                params,
                reply,
            } => {
                let result = engine
                    .complete(&prompt, &params)
                    .and_then(Completion::into_single);
                if reply.send(result).is_err() {
                    debug!("Caller dropped before completion was delivered");
                }
            }
            Job::Stream {
                prompt,
                params,
                events,
            } => match run_stream(engine.as_mut(), &prompt, &params, &events) {
                Ok(delivered) => debug!(delivered, "Stream complete"),
                Err(e @ ServiceError::StreamInterrupted { .. }) => debug!("{e}"),
                Err(e) => warn!(error = %e, "Stream failed"),
            },
        }
    }

    info!("Model worker stopped");
}

/// Pump one streaming generation into `events`. Returns the number of events
/// delivered.
fn run_stream(
    engine: &mut dyn CompletionEngine,
    prompt: &str,
    params: &CompletionParams,
    events: &mpsc::Sender<EventResult>,
) -> Result<usize, ServiceError> {
    let completion = match engine.complete(prompt, params) {
        Ok(completion) => completion,
        Err(e) => {
            let _ = events.blocking_send(Err(e.clone()));
            return Err(e.into());
        }
    };

    let iter: Box<dyn Iterator<Item = EventResult> + '_> = match completion {
        Completion::Stream(iter) => iter,
        Completion::Single(event) => Box::new(std::iter::once(Ok(event))),
    };

    let mut delivered = 0;
    for item in iter {
        let failed = item.as_ref().err().cloned();
        if events.blocking_send(item).is_err() {
            // Receiver dropped: the generation is released with `iter`.
            return Err(ServiceError::StreamInterrupted { delivered });
        }
        if let Some(e) = failed {
            return Err(e.into());
        }
        delivered += 1;
    }

    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::inference::completion::FinishReason;
    use crate::inference::scripted::ScriptedEngine;

    fn params() -> CompletionParams {
        CompletionParams {
            max_tokens: 16,
            stop: vec![],
            temperature: 0.0,
            stream: false,
        }
    }

    /// Counts how many events were pulled from its stream.
    struct Counting {
        pulled: Arc<AtomicUsize>,
    }

    impl CompletionEngine for Counting {
        fn model_path(&self) -> &str {
            "counting"
        }

        fn complete(
            &mut self,
            _prompt: &str,
            _params: &CompletionParams,
        ) -> Result<Completion<'_>, EngineError> {
            let pulled = self.pulled.clone();
            Ok(Completion::Stream(Box::new((0..1000).map(move |i| {
                pulled.fetch_add(1, Ordering::SeqCst);
                Ok(CompletionEvent::single("c", "counting", format!("{i} "), None))
            }))))
        }
    }

    struct Failing;

    impl CompletionEngine for Failing {
        fn model_path(&self) -> &str {
            "failing"
        }

        fn complete(
            &mut self,
            _prompt: &str,
            _params: &CompletionParams,
        ) -> Result<Completion<'_>, EngineError> {
            Err(EngineError::DecodeFailed("kernel fault".into()))
        }
    }

    /// Takes `delay` per completion and counts how many it ran.
    struct Slow {
        delay: std::time::Duration,
        ran: Arc<AtomicUsize>,
    }

    impl CompletionEngine for Slow {
        fn model_path(&self) -> &str {
            "slow"
        }

        fn complete(
            &mut self,
            _prompt: &str,
            _params: &CompletionParams,
        ) -> Result<Completion<'_>, EngineError> {
            self.ran.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            Ok(Completion::Single(CompletionEvent::single(
                "s",
                "slow",
                "done",
                Some(FinishReason::Stop),
            )))
        }
    }

    #[tokio::test]
    async fn test_abandoned_jobs_are_skipped() {
        let ran = Arc::new(AtomicUsize::new(0));
        let engine = Arc::new(
            InferenceEngine::spawn(
                Box::new(Slow {
                    delay: std::time::Duration::from_millis(200),
                    ran: ran.clone(),
                }),
                8,
                4,
            )
            .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..5 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                tokio::time::timeout(
                    std::time::Duration::from_millis(50),
                    engine.complete("p".into(), params()),
                )
                .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_err());
        }

        // Queued behind the abandoned jobs; only a live caller gets work.
        let event = engine.complete("p".into(), params()).await.unwrap();
        assert_eq!(event.choices[0].text, "done");
        assert!(ran.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_complete_returns_terminal_event() {
        let engine = InferenceEngine::spawn(
            Box::new(ScriptedEngine::new("m", ["He", "llo"])),
            4,
            4,
        )
        .unwrap();
        let event = engine.complete("p".into(), params()).await.unwrap();
        assert_eq!(event.choices[0].text, "Hello");
        assert_eq!(event.finish_reason(), Some(FinishReason::Stop));
        assert_eq!(engine.model_path(), "m");
    }

    #[tokio::test]
    async fn test_stream_preserves_order() {
        let engine = InferenceEngine::spawn(
            Box::new(ScriptedEngine::new("m", ["a", "b", "c"])),
            4,
            1,
        )
        .unwrap();
        let mut rx = engine.stream("p".into(), params()).await.unwrap();
        let mut texts = Vec::new();
        while let Some(event) = rx.recv().await {
            texts.push(event.unwrap().choices[0].text.clone());
        }
        assert_eq!(texts, vec!["a", "b", "c", ""]);
    }

    #[tokio::test]
    async fn test_dropped_receiver_stops_generation() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let engine = InferenceEngine::spawn(
            Box::new(Counting {
                pulled: pulled.clone(),
            }),
            4,
            2,
        )
        .unwrap();

        let mut rx = engine.stream("p".into(), params()).await.unwrap();
        assert!(rx.recv().await.is_some());
        drop(rx);

        // The worker is free again once it notices the disconnect.
        let mut rx = engine.stream("p".into(), params()).await.unwrap();
        assert!(rx.recv().await.is_some());
        drop(rx);

        assert!(pulled.load(Ordering::SeqCst) < 100);
    }

    #[tokio::test]
    async fn test_engine_failure_propagates() {
        let engine = InferenceEngine::spawn(Box::new(Failing), 4, 4).unwrap();

        let err = engine.complete("p".into(), params()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Inference(EngineError::DecodeFailed(_))));

        let mut rx = engine.stream("p".into(), params()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(Err(EngineError::DecodeFailed(_)))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_serialized() {
        let engine = Arc::new(
            InferenceEngine::spawn(Box::new(ScriptedEngine::new("m", ["x", "y"])), 8, 4).unwrap(),
        );
        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.complete("p".into(), params()).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().choices[0].text, "xy");
        }
    }
}
