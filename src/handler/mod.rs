//! Orchestration of the trigger pipeline.
//!
//! The handler receives open/close notifications from the upstream
//! socket tracker. Opens are validated and buffered; each close spawns
//! an independent task that classifies the remote endpoint, wins or
//! waits on the trace cache, archives the measurement, and annotates
//! the hops it contains. Every error is logged and counted here; none
//! propagate back to the event source.

pub mod addrs;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::export::health::HealthMetrics;
use crate::hopannotation::{AnnotatorClient, HopAnnotator};
use crate::ipcache::{FingerprintCache, Reservation, TraceOutcome};
use crate::parser::TraceParser;
use crate::scamper::Tracer;

use self::addrs::{ClassifyError, LocalAddrs};

/// Socket identity of one flow as reported by the upstream tracker.
#[derive(Debug, Clone, Default)]
pub struct SockId {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
}

/// A flow whose open has been seen but whose close has not.
struct PendingFlow {
    src_ip: String,
    dst_ip: String,
    opened: Instant,
}

/// Receives flow lifecycle events and drives the measurement pipeline.
pub struct Handler<T: Tracer, A: AnnotatorClient> {
    local: LocalAddrs,
    cache: Arc<FingerprintCache>,
    tracer: Arc<T>,
    parser: TraceParser,
    annotator: Arc<HopAnnotator<A>>,
    pending: parking_lot::Mutex<HashMap<String, PendingFlow>>,
    pending_timeout: Duration,
    scan_period: Duration,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    done: Option<mpsc::UnboundedSender<()>>,
}

impl<T: Tracer, A: AnnotatorClient> Handler<T, A> {
    /// Build a handler around a tracer and parser, constructing the
    /// trace cache and hop annotator it owns. `local` is the host
    /// address set; tests inject a fixed one through
    /// [`LocalAddrs::from_addrs`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tracer: Arc<T>,
        parser: TraceParser,
        cache_cfg: &CacheConfig,
        annotation_client: A,
        annotation_output: PathBuf,
        local: LocalAddrs,
        health: Arc<HealthMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            local,
            cache: Arc::new(FingerprintCache::new(cache_cfg.clone())),
            tracer,
            parser,
            annotator: Arc::new(HopAnnotator::new(annotation_client, annotation_output)),
            pending: parking_lot::Mutex::new(HashMap::new()),
            pending_timeout: cache_cfg.entry_timeout,
            scan_period: cache_cfg.scan_period,
            health,
            cancel,
            done: None,
        }
    }

    /// Register a channel that receives one message per finished close
    /// task. Test synchronization surface only.
    pub fn with_done_observer(mut self, done: mpsc::UnboundedSender<()>) -> Self {
        self.done = Some(done);
        self
    }

    /// Spawn the background maintenance tasks: the cache sweep, the
    /// pending-flow sweep, and the daily hop registry reset.
    pub fn start_background(self: &Arc<Self>) {
        self.cache.start_sweeper(self.cancel.child_token());
        self.annotator.start_daily_reset(self.cancel.child_token());

        let handler = Arc::clone(self);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(handler.scan_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let expired = handler.sweep_pending();
                        if expired > 0 {
                            handler.health.flows_expired.inc_by(expired as f64);
                            debug!(expired, "evicted flows that never closed");
                        }
                        handler.health.pending_flows.set(handler.pending_len() as f64);
                        handler.health.cache_entries.set(handler.cache.len() as f64);
                    }
                }
            }
        });
    }

    /// Record a newly opened flow. Invalid notifications are logged,
    /// counted, and dropped.
    pub fn open(&self, when: DateTime<Utc>, uuid: &str, sock_id: Option<&SockId>) {
        if self.cancel.is_cancelled() {
            self.reject("shutdown");
            return;
        }

        if uuid.is_empty() {
            warn!("ignoring open event with empty uuid");
            self.reject("empty-uuid");
            return;
        }

        let Some(sock_id) = sock_id else {
            warn!(uuid, "ignoring open event without socket identity");
            self.reject("missing-sockid");
            return;
        };

        if sock_id.dst_ip.is_empty() {
            warn!(uuid, "ignoring open event with empty destination");
            self.reject("empty-dst");
            return;
        }

        if let Err(e) = self.local.remote_ip(&sock_id.src_ip, &sock_id.dst_ip) {
            warn!(uuid, error = %e, "ignoring unclassifiable open event");
            self.reject(classify_reason(&e));
            return;
        }

        debug!(uuid, src = %sock_id.src_ip, dst = %sock_id.dst_ip, when = %when, "tracking flow");

        let mut pending = self.pending.lock();
        pending.insert(
            uuid.to_string(),
            PendingFlow {
                src_ip: sock_id.src_ip.clone(),
                dst_ip: sock_id.dst_ip.clone(),
                opened: Instant::now(),
            },
        );
        self.health.pending_flows.set(pending.len() as f64);
    }

    /// Consume a close notification, spawning the measurement task for
    /// the matching flow. Closes without a matching open are dropped.
    pub fn close(self: &Arc<Self>, when: DateTime<Utc>, uuid: &str) {
        let flow = {
            let mut pending = self.pending.lock();
            let flow = pending.remove(uuid);
            self.health.pending_flows.set(pending.len() as f64);
            flow
        };

        let Some(flow) = flow else {
            debug!(uuid, "close event for unknown flow");
            self.reject("unknown-flow");
            return;
        };

        let handler = Arc::clone(self);
        let uuid = uuid.to_string();
        tokio::spawn(async move {
            handler.run_close(when, &uuid, &flow).await;
            if let Some(done) = &handler.done {
                let _ = done.send(());
            }
        });
    }

    /// The close task: classify, measure or wait, archive, annotate.
    async fn run_close(&self, when: DateTime<Utc>, uuid: &str, flow: &PendingFlow) {
        let remote_ip = match self.local.remote_ip(&flow.src_ip, &flow.dst_ip) {
            Ok(ip) => ip.to_string(),
            Err(e) => {
                warn!(uuid, error = %e, "could not classify closed flow");
                self.count_error("classify");
                return;
            }
        };

        let payload: Arc<[u8]> = match self.cache.reserve(&remote_ip) {
            Reservation::Owner(owner) => {
                self.health.traces_started.inc();

                match self.tracer.trace(&remote_ip, uuid, "", when).await {
                    Ok(payload) => {
                        let payload: Arc<[u8]> = payload.into();
                        self.cache.publish(
                            owner,
                            TraceOutcome::Ready {
                                payload: Arc::clone(&payload),
                                uuid: uuid.to_string(),
                            },
                        );
                        payload
                    }
                    Err(e) => {
                        warn!(uuid, remote_ip = %remote_ip, error = %e, "traceroute failed");
                        self.count_error("trace");
                        self.cache.publish(owner, TraceOutcome::Failed);
                        return;
                    }
                }
            }
            Reservation::Waiter(waiter) => {
                let outcome = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    outcome = waiter.wait() => outcome,
                };

                match outcome {
                    Some(TraceOutcome::Ready {
                        payload,
                        uuid: source_uuid,
                    }) => {
                        self.health.traces_cached.inc();

                        if let Err(e) = self
                            .tracer
                            .cached_trace(uuid, &source_uuid, when, &payload)
                            .await
                        {
                            warn!(
                                uuid,
                                remote_ip = %remote_ip,
                                error = %e,
                                "archiving cached traceroute failed",
                            );
                            self.count_error("cacheduse");
                            return;
                        }

                        payload
                    }
                    Some(TraceOutcome::Failed) => {
                        debug!(uuid, remote_ip = %remote_ip, "owner measurement failed, skipping");
                        return;
                    }
                    // The entry vanished unpublished; only happens on
                    // shutdown.
                    None => return,
                }
            }
        };

        let trace = match self.parser.parse(&payload) {
            Ok(trace) => trace,
            Err(e) => {
                warn!(uuid, remote_ip = %remote_ip, error = %e, "parsing traceroute failed");
                self.count_error("parse");
                return;
            }
        };

        let hops = match self.parser.extract_hops(&trace) {
            Ok(hops) => hops,
            Err(e) => {
                warn!(uuid, remote_ip = %remote_ip, error = %e, "extracting hops failed");
                self.count_error("extract");
                return;
            }
        };

        match self.annotator.annotate(&hops, when).await {
            Ok(written) => self.health.hops_annotated.inc_by(written as f64),
            Err(e) => {
                warn!(uuid, remote_ip = %remote_ip, error = %e, "annotating hops failed");
                self.count_error("annotate");
            }
        }
    }

    /// Remove pending flows whose close never arrived.
    fn sweep_pending(&self) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, flow| flow.opened.elapsed() <= self.pending_timeout);
        before - pending.len()
    }

    /// Number of flows awaiting their close event.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// The trace cache, exposed for inspection.
    pub fn cache(&self) -> &FingerprintCache {
        &self.cache
    }

    fn reject(&self, reason: &str) {
        self.health.flows_rejected.with_label_values(&[reason]).inc();
    }

    fn count_error(&self, kind: &str) {
        self.health.trace_errors.with_label_values(&[kind]).inc();
    }
}

fn classify_reason(e: &ClassifyError) -> &'static str {
    match e {
        ClassifyError::InvalidSrc(_) => "invalid-src",
        ClassifyError::InvalidDst(_) => "invalid-dst",
        ClassifyError::NoneLocal { .. } => "none-local",
        ClassifyError::BothLocal { .. } => "both-local",
    }
}
