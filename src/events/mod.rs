//! Client for the upstream socket-tracking event feed.
//!
//! The tracker exposes a Unix domain socket that emits one JSON object
//! per line for every TCP flow it observes. This module connects,
//! dispatches open/close notifications to the handler, and reconnects
//! with a fixed backoff when the feed goes away. Malformed lines are
//! logged and skipped; the feed itself is an external collaborator and
//! its hiccups must never take the daemon down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::export::health::HealthMetrics;
use crate::handler::{Handler, SockId};
use crate::hopannotation::AnnotatorClient;
use crate::scamper::Tracer;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// One line of the event feed.
#[derive(Debug, Deserialize)]
struct FlowEvent {
    event: String,
    timestamp: DateTime<Utc>,
    uuid: String,
    #[serde(default)]
    src_ip: String,
    #[serde(default)]
    dst_ip: String,
    #[serde(default)]
    src_port: u16,
    #[serde(default)]
    dst_port: u16,
}

/// Long-lived connector between the event socket and the handler.
pub struct EventSource {
    path: PathBuf,
    health: Arc<HealthMetrics>,
}

impl EventSource {
    pub fn new(path: &Path, health: Arc<HealthMetrics>) -> Self {
        Self {
            path: path.to_path_buf(),
            health,
        }
    }

    /// Consume the feed until cancellation, reconnecting on any error.
    pub async fn run<T: Tracer, A: AnnotatorClient>(
        self,
        handler: Arc<Handler<T, A>>,
        cancel: CancellationToken,
    ) {
        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => return,
                stream = UnixStream::connect(&self.path) => stream,
            };

            let stream = match stream {
                Ok(stream) => {
                    info!(path = %self.path.display(), "connected to event socket");
                    stream
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "event socket connect failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => continue,
                    }
                }
            };

            self.consume(stream, &handler, &cancel).await;

            if cancel.is_cancelled() {
                return;
            }

            warn!(path = %self.path.display(), "event socket closed, reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            }
        }
    }

    /// Read the feed line by line until EOF, error, or cancellation.
    async fn consume<T: Tracer, A: AnnotatorClient>(
        &self,
        stream: UnixStream,
        handler: &Arc<Handler<T, A>>,
        cancel: &CancellationToken,
    ) {
        let mut lines = BufReader::new(stream).lines();

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => return,
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "reading event socket");
                    return;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let event: FlowEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "skipping malformed event line");
                    continue;
                }
            };

            self.dispatch(event, handler);
        }
    }

    fn dispatch<T: Tracer, A: AnnotatorClient>(
        &self,
        event: FlowEvent,
        handler: &Arc<Handler<T, A>>,
    ) {
        self.health
            .events_received
            .with_label_values(&[event.event.as_str()])
            .inc();

        match event.event.as_str() {
            "open" => {
                let sock_id = SockId {
                    src_ip: event.src_ip,
                    dst_ip: event.dst_ip,
                    src_port: event.src_port,
                    dst_port: event.dst_port,
                };
                handler.open(event.timestamp, &event.uuid, Some(&sock_id));
            }
            "close" => {
                handler.close(event.timestamp, &event.uuid);
            }
            other => {
                debug!(event = other, uuid = %event.uuid, "ignoring unknown event type");
            }
        }
    }
}
