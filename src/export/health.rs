use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Prometheus metrics for daemon health and observability.
///
/// All metrics use the "scamperd" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    server: parking_lot::Mutex<Option<ServerHandle>>,

    /// Flow events received from the upstream socket tracker, by type.
    pub events_received: CounterVec,
    /// Flow events dropped before any measurement, by reason.
    pub flows_rejected: CounterVec,
    /// Pending flows evicted because no close ever arrived.
    pub flows_expired: Counter,
    /// Flows currently waiting for their close event.
    pub pending_flows: Gauge,
    /// Measurements started as cache owners.
    pub traces_started: Counter,
    /// Measurements served from the cache.
    pub traces_cached: Counter,
    /// Close tasks that ended in an error, by pipeline stage.
    pub trace_errors: CounterVec,
    /// Live trace cache entries.
    pub cache_entries: Gauge,
    /// Hops annotated and archived.
    pub hops_annotated: Counter,
}

/// Handle to the serving task, kept so stop() can wind it down.
struct ServerHandle {
    stop_tx: tokio::sync::oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl HealthMetrics {
    /// Build the registry and register every scamperd metric in it.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = CounterVec::new(
            Opts::new(
                "events_received_total",
                "Flow events received from the upstream socket tracker.",
            )
            .namespace("scamperd"),
            &["type"],
        )?;
        let flows_rejected = CounterVec::new(
            Opts::new(
                "flows_rejected_total",
                "Flow events dropped before any measurement.",
            )
            .namespace("scamperd"),
            &["reason"],
        )?;
        let flows_expired = Counter::with_opts(
            Opts::new(
                "flows_expired_total",
                "Pending flows evicted because no close ever arrived.",
            )
            .namespace("scamperd"),
        )?;
        let pending_flows = Gauge::with_opts(
            Opts::new(
                "pending_flows",
                "Flows currently waiting for their close event.",
            )
            .namespace("scamperd"),
        )?;
        let traces_started = Counter::with_opts(
            Opts::new(
                "traces_started_total",
                "Measurements started as cache owners.",
            )
            .namespace("scamperd"),
        )?;
        let traces_cached = Counter::with_opts(
            Opts::new("traces_cached_total", "Measurements served from the cache.")
                .namespace("scamperd"),
        )?;
        let trace_errors = CounterVec::new(
            Opts::new(
                "trace_errors_total",
                "Close tasks that ended in an error, by pipeline stage.",
            )
            .namespace("scamperd"),
            &["kind"],
        )?;
        let cache_entries = Gauge::with_opts(
            Opts::new("cache_entries", "Live trace cache entries.").namespace("scamperd"),
        )?;
        let hops_annotated = Counter::with_opts(
            Opts::new("hops_annotated_total", "Hops annotated and archived.")
                .namespace("scamperd"),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(flows_rejected.clone()))?;
        registry.register(Box::new(flows_expired.clone()))?;
        registry.register(Box::new(pending_flows.clone()))?;
        registry.register(Box::new(traces_started.clone()))?;
        registry.register(Box::new(traces_cached.clone()))?;
        registry.register(Box::new(trace_errors.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(hops_annotated.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            server: parking_lot::Mutex::new(None),
            events_received,
            flows_rejected,
            flows_expired,
            pending_flows,
            traces_started,
            traces_cached,
            trace_errors,
            cache_entries,
            hops_annotated,
        })
    }

    /// Bind the listener and serve /metrics and /healthz until stop().
    pub async fn start(&self) -> Result<()> {
        let bind_addr = bind_address(&self.addr);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding metrics listener on {bind_addr}"))?;
        let bound = listener.local_addr().context("resolving bound address")?;

        let app = Router::new()
            .route("/metrics", get(serve_metrics))
            .route("/healthz", get(serve_healthz))
            .with_state(self.registry.clone());

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            info!(addr = %bound, "serving health metrics");

            let serving = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = stop_rx.await;
            });

            if let Err(e) = serving.await {
                error!(error = %e, "metrics server exited with error");
            }
        });

        *self.server.lock() = Some(ServerHandle { stop_tx, task });

        Ok(())
    }

    /// Ask the server to drain and wait for its task to finish.
    pub async fn stop(&self) -> Result<()> {
        let handle = self.server.lock().take();

        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(());
            if let Err(e) = handle.task.await {
                warn!(error = %e, "metrics server task join failed");
            }
        }

        Ok(())
    }
}

/// Expand a bare ":port" spec to the wildcard address on that port.
fn bind_address(addr: &str) -> String {
    match addr {
        "" => "0.0.0.0:9090".to_string(),
        spec if spec.starts_with(':') => format!("0.0.0.0{spec}"),
        spec => spec.to_string(),
    }
}

/// GET /metrics renders the registry in Prometheus text format.
async fn serve_metrics(State(registry): State<Registry>) -> Response {
    match render_metrics(&registry) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            error!(error = %e, "rendering metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn render_metrics(registry: &Registry) -> Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buf)
        .context("encoding metric families")?;

    String::from_utf8(buf).context("metrics output is not valid UTF-8")
}

/// GET /healthz - liveness probe.
async fn serve_healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_gather() {
        let health = HealthMetrics::new(":9090").expect("metrics");

        health.traces_started.inc();
        health.trace_errors.with_label_values(&["parse"]).inc();
        health.events_received.with_label_values(&["open"]).inc();
        health.pending_flows.set(3.0);

        let families = health.registry.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"scamperd_traces_started_total"));
        assert!(names.contains(&"scamperd_trace_errors_total"));
        assert!(names.contains(&"scamperd_pending_flows"));
    }

    #[test]
    fn test_bind_address_forms() {
        assert_eq!(bind_address(""), "0.0.0.0:9090");
        assert_eq!(bind_address(":9091"), "0.0.0.0:9091");
        assert_eq!(bind_address("127.0.0.1:9092"), "127.0.0.1:9092");
    }

    #[test]
    fn test_render_metrics_includes_counters() {
        let health = HealthMetrics::new(":9090").expect("metrics");
        health.traces_cached.inc();

        let body = render_metrics(&health.registry).expect("render");
        assert!(body.contains("scamperd_traces_cached_total 1"));
    }

    #[tokio::test]
    async fn test_server_start_stop() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.start().await.expect("start");
        health.stop().await.expect("stop");
    }
}
