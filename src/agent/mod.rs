use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::annotator::HttpAnnotator;
use crate::config::Config;
use crate::events::EventSource;
use crate::export::health::HealthMetrics;
use crate::handler::addrs::LocalAddrs;
use crate::handler::Handler;
use crate::parser::TraceParser;
use crate::scamper::{Identity, Scamper};

/// Agent wires together all components: event source, handler, tracer,
/// parser, annotation client, and health metrics.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    handler: Option<Arc<Handler<Scamper, HttpAnnotator>>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            handler: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin consuming flow events.
    ///
    /// Construction failures here (bad scamper config, unreadable
    /// interfaces) are fatal to process startup by design.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health server first so probes respond while we come up.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 2. Process identity for artifact names and synthesized UUIDs.
        let hostname = if self.cfg.hostname.is_empty() {
            detect_hostname().context("detecting hostname")?
        } else {
            self.cfg.hostname.clone()
        };
        let identity = Identity::new(hostname.clone(), caller_version());
        info!(hostname, version = caller_version(), "resolved process identity");

        // 3. Measurement components.
        let scamper = Scamper::new(
            self.cfg.scamper.clone(),
            identity,
            self.cancel.child_token(),
        )
        .context("configuring scamper tracer")?;

        let parser =
            TraceParser::new(&self.cfg.scamper.trace_type).context("configuring trace parser")?;

        let annotator =
            HttpAnnotator::new(&self.cfg.hopannotation).context("building annotation client")?;

        // 4. Host address set, enumerated once.
        let local = LocalAddrs::discover().context("enumerating local addresses")?;
        info!(addrs = local.len(), "enumerated local addresses");

        // 5. The handler and its background sweepers.
        let handler = Arc::new(Handler::new(
            Arc::new(scamper),
            parser,
            &self.cfg.ipcache,
            annotator,
            self.cfg.hopannotation.output_path.clone(),
            local,
            Arc::clone(&self.health),
            self.cancel.clone(),
        ));
        handler.start_background();

        // 6. Start consuming the event feed.
        let source = EventSource::new(&self.cfg.event_socket, Arc::clone(&self.health));
        let feed_handler = Arc::clone(&handler);
        let feed_cancel = self.cancel.child_token();
        tokio::spawn(async move {
            source.run(feed_handler, feed_cancel).await;
        });

        self.handler = Some(handler);

        info!("agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    ///
    /// Cancellation kills in-flight scamper subprocesses, interrupts
    /// cache waits, and stops the sweepers; already-published cache
    /// entries stay valid until their TTL.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(handler) = &self.handler {
            info!(
                pending_flows = handler.pending_len(),
                cache_entries = handler.cache().len(),
                "shutting down trigger pipeline",
            );
        }

        self.health.stop().await?;

        Ok(())
    }
}

/// Version string recorded in artifact metadata.
pub fn caller_version() -> &'static str {
    option_env!("GIT_COMMIT").unwrap_or(env!("CARGO_PKG_VERSION"))
}

fn detect_hostname() -> Result<String> {
    let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .context("reading /proc/sys/kernel/hostname")?;

    let hostname = hostname.trim().to_string();
    if hostname.is_empty() {
        bail!("empty hostname");
    }

    Ok(hostname)
}
