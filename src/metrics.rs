//! Prometheus metrics for the relay.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,

    /// Requests received, by endpoint.
    pub requests: IntCounterVec,

    /// Failed requests, by error kind.
    pub errors: IntCounterVec,

    /// Text fragments written to streaming responses.
    pub fragments: IntCounter,

    /// Time spent waiting on the model, by endpoint.
    pub inference_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("prompt_relay".into()), None)?;

        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Requests received"),
            &["endpoint"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("errors_total", "Failed requests by error kind"),
            &["kind"],
        )?;
        let fragments = IntCounter::new(
            "stream_fragments_total",
            "Text fragments written to streaming responses",
        )?;
        let inference_seconds = HistogramVec::new(
            HistogramOpts::new("inference_seconds", "Time spent waiting on the model"),
            &["endpoint"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(fragments.clone()))?;
        registry.register(Box::new(inference_seconds.clone()))?;

        Ok(Self {
            registry,
            requests,
            errors,
            fragments,
            inference_seconds,
        })
    }

    /// Text exposition of all registered metrics.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
