//! Prometheus export of the session registry.
//!
//! Gauges are synchronized from the shared [`SessionRegistry`] on every
//! scrape, so the write loops never touch Prometheus types directly.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Encoder, GaugeVec, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use warp::Filter;

use crate::stats::SessionRegistry;

pub struct PrometheusExporter {
    registry: Registry,
    sessions: Arc<SessionRegistry>,

    bytes_sent: IntGaugeVec,
    sends: IntGaugeVec,
    echo_mismatches: IntCounter,
    sessions_active: IntGauge,
    send_latency: GaugeVec,
}

impl PrometheusExporter {
    pub fn new(sessions: Arc<SessionRegistry>) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let bytes_sent = IntGaugeVec::new(
            Opts::new(
                "quic_pusher_bytes_sent_total",
                "Cumulative bytes written, per session",
            ),
            &["session"],
        )?;
        registry.register(Box::new(bytes_sent.clone()))?;

        let sends = IntGaugeVec::new(
            Opts::new(
                "quic_pusher_sends_total",
                "Cumulative payloads written, per session",
            ),
            &["session"],
        )?;
        registry.register(Box::new(sends.clone()))?;

        let echo_mismatches = IntCounter::with_opts(Opts::new(
            "quic_pusher_echo_mismatches_total",
            "Echoed payloads that did not match what was sent",
        ))?;
        registry.register(Box::new(echo_mismatches.clone()))?;

        let sessions_active = IntGauge::with_opts(Opts::new(
            "quic_pusher_sessions_active",
            "Sessions currently sending",
        ))?;
        registry.register(Box::new(sessions_active.clone()))?;

        let send_latency = GaugeVec::new(
            Opts::new(
                "quic_pusher_send_latency_seconds",
                "Per-send write latency summary, in seconds",
            ),
            &["stat"],
        )?;
        registry.register(Box::new(send_latency.clone()))?;

        Ok(Self {
            registry,
            sessions,
            bytes_sent,
            sends,
            echo_mismatches,
            sessions_active,
            send_latency,
        })
    }

    /// Sync all gauges from the shared session registry.
    pub fn update_metrics(&self) {
        let snapshot = self.sessions.snapshot();

        for s in &snapshot.sessions {
            self.bytes_sent
                .with_label_values(&[s.session.as_str()])
                .set(s.bytes as i64);
            self.sends
                .with_label_values(&[s.session.as_str()])
                .set(s.sends as i64);
        }
        // Counters can only move forward; rebuild from the registry total
        self.echo_mismatches.reset();
        self.echo_mismatches
            .inc_by(snapshot.total_echo_mismatches());
        self.sessions_active.set(snapshot.active_sessions() as i64);

        let latency = &snapshot.latency;
        if latency.count > 0 {
            for (stat, value) in [
                ("mean", latency.mean),
                ("p50", latency.p50),
                ("p90", latency.p90),
                ("p99", latency.p99),
                ("max", latency.max),
            ] {
                self.send_latency
                    .with_label_values(&[stat])
                    .set(value.as_secs_f64());
            }
        }

        debug!("synced Prometheus gauges from session registry");
    }

    /// All metrics in Prometheus text format.
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("metrics are not valid UTF-8")
    }
}

/// HTTP server exposing `/metrics` and `/health`.
pub struct MetricsServer {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MetricsServer {
    pub async fn start(bind: SocketAddr, exporter: Arc<PrometheusExporter>) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let (local_addr, server) = warp::serve(routes(exporter))
            .try_bind_with_graceful_shutdown(bind, async {
                shutdown_rx.await.ok();
                debug!("metrics server shutting down");
            })
            .context("binding metrics server")?;

        tokio::spawn(server);

        info!("metrics exposed on http://{local_addr}/metrics");
        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn routes(
    exporter: Arc<PrometheusExporter>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let metrics = warp::path("metrics").and(warp::get()).and_then(move || {
        let exporter = exporter.clone();
        async move { serve_metrics(exporter).await }
    });

    let health = warp::path("health")
        .and(warp::get())
        .map(|| warp::reply::with_status("OK", warp::http::StatusCode::OK));

    metrics.or(health)
}

async fn serve_metrics(
    exporter: Arc<PrometheusExporter>,
) -> Result<impl warp::Reply, Infallible> {
    exporter.update_metrics();

    match exporter.gather() {
        Ok(body) => Ok(warp::reply::with_header(
            body,
            "Content-Type",
            "text/plain; version=0.0.4; charset=utf-8",
        )),
        Err(e) => {
            error!("failed to gather metrics: {e:#}");
            Ok(warp::reply::with_header(
                format!("# ERROR: failed to gather metrics: {e}\n"),
                "Content-Type",
                "text/plain; charset=utf-8",
            ))
        }
    }
}
