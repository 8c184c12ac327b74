#![cfg(feature = "metrics")]

use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::{sync::Arc, time::Duration};

#[derive(Clone)]
pub struct MetricsContext {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub ws_sessions: IntGauge,
    pub hub_evictions_total: IntCounter,
}

impl MetricsContext {
    pub fn init() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new(
                "parley_http_requests_total",
                "Number of HTTP responses served, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let latency = HistogramVec::new(
            HistogramOpts::new(
                "parley_http_request_duration_seconds",
                "HTTP request latency, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(latency.clone()))?;

        let sessions = IntGauge::new(
            "parley_ws_sessions",
            "WebSocket sessions currently registered with the hub",
        )?;
        registry.register(Box::new(sessions.clone()))?;

        let evictions = IntCounter::new(
            "parley_hub_evictions_total",
            "Sessions severed because their outbound queue was full",
        )?;
        registry.register(Box::new(evictions.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total: requests,
            http_request_duration_seconds: latency,
            ws_sessions: sessions,
            hub_evictions_total: evictions,
        }))
    }

    pub fn observe_http(&self, route: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        let labels = [route, status.as_str()];
        self.http_requests_total.with_label_values(&labels).inc();
        self.http_request_duration_seconds
            .with_label_values(&labels)
            .observe(elapsed.as_secs_f64());
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
