//! Exactly-once-per-day hop annotation.
//!
//! Hops extracted from a trace are annotated through a narrow client
//! capability and archived one file per (hop, day). A process-wide
//! registry guarantees the annotation service is asked about each
//! (hop, day) pair at most once, even when concurrent traces race on
//! the same hop; the registry resets shortly after UTC midnight so each
//! new day re-annotates.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Errors from annotating or archiving hops.
#[derive(Debug, Error)]
pub enum AnnotateError {
    #[error("annotation service error: {0}")]
    Service(String),

    #[error("no annotation returned for {0}")]
    Missing(String),

    #[error("archiving annotation for {hop}: {source}")]
    Archive {
        hop: String,
        #[source]
        source: std::io::Error,
    },
}

/// Geolocation portion of a hop annotation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Geolocation {
    #[serde(rename = "ContinentCode", default)]
    pub continent_code: String,
    #[serde(rename = "CountryCode", default)]
    pub country_code: String,
    #[serde(rename = "City", default)]
    pub city: String,
    #[serde(rename = "Latitude", default)]
    pub latitude: f64,
    #[serde(rename = "Longitude", default)]
    pub longitude: f64,
}

/// Network (AS) portion of a hop annotation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Network {
    #[serde(rename = "ASNumber", default)]
    pub as_number: u32,
    #[serde(rename = "ASName", default)]
    pub as_name: String,
}

/// What the annotation service knows about one IP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientAnnotations {
    #[serde(rename = "Geo", default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<Geolocation>,
    #[serde(rename = "Network", default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,
}

/// Narrow capability to annotate a batch of IPs.
pub trait AnnotatorClient: Send + Sync + 'static {
    fn annotate(
        &self,
        ips: Vec<String>,
    ) -> impl std::future::Future<Output = Result<HashMap<String, ClientAnnotations>, AnnotateError>>
           + Send;
}

/// On-disk form of one archived hop annotation.
#[derive(Debug, Serialize)]
struct ArchivedAnnotation<'a> {
    #[serde(rename = "Timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "Annotations")]
    annotations: &'a ClientAnnotations,
}

/// Annotates and archives hops at most once per (hop, day).
pub struct HopAnnotator<A: AnnotatorClient> {
    client: A,
    output_path: PathBuf,
    registry: parking_lot::Mutex<HashSet<String>>,
}

impl<A: AnnotatorClient> HopAnnotator<A> {
    pub fn new(client: A, output_path: PathBuf) -> Self {
        Self {
            client,
            output_path,
            registry: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    /// Annotate the hops not yet seen today and archive the results.
    ///
    /// Returns how many hops were newly archived. Keys are inserted
    /// speculatively under the registry lock, which is what makes the
    /// at-most-once contract hold under races; any hop that fails to
    /// annotate or archive is rolled back so a later trace can retry it.
    pub async fn annotate(
        &self,
        hops: &[String],
        when: DateTime<Utc>,
    ) -> Result<usize, AnnotateError> {
        let day = when.format("%Y-%m-%d").to_string();

        let new_hops: Vec<String> = {
            let mut registry = self.registry.lock();
            hops.iter()
                .filter(|hop| registry.insert(registry_key(hop, &day)))
                .cloned()
                .collect()
        };

        if new_hops.is_empty() {
            return Ok(0);
        }

        let annotations = match self.client.annotate(new_hops.clone()).await {
            Ok(annotations) => annotations,
            Err(e) => {
                self.rollback(&new_hops, &day);
                return Err(e);
            }
        };

        let date = when.format("%Y%m%d").to_string();
        let dir = self.output_path.join(&date);
        if let Err(source) = tokio::fs::create_dir_all(&dir).await {
            self.rollback(&new_hops, &day);
            return Err(AnnotateError::Archive {
                hop: dir.display().to_string(),
                source,
            });
        }

        let mut written = 0;
        let mut first_err = None;

        for hop in &new_hops {
            let Some(annotation) = annotations.get(hop) else {
                self.rollback(std::slice::from_ref(hop), &day);
                if first_err.is_none() {
                    first_err = Some(AnnotateError::Missing(hop.clone()));
                }
                continue;
            };

            let archived = ArchivedAnnotation {
                timestamp: when,
                annotations: annotation,
            };
            let path = dir.join(format!("{hop}_{date}.json"));

            // Rewriting an existing file is harmless; the registry, not
            // the filesystem, decides what gets skipped.
            let bytes = match serde_json::to_vec(&archived) {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.rollback(std::slice::from_ref(hop), &day);
                    if first_err.is_none() {
                        first_err = Some(AnnotateError::Service(format!(
                            "encoding annotation for {hop}: {e}",
                        )));
                    }
                    continue;
                }
            };

            if let Err(source) = tokio::fs::write(&path, bytes).await {
                self.rollback(std::slice::from_ref(hop), &day);
                if first_err.is_none() {
                    first_err = Some(AnnotateError::Archive {
                        hop: hop.clone(),
                        source,
                    });
                }
                continue;
            }

            written += 1;
        }

        debug!(written, total = hops.len(), "archived hop annotations");

        match first_err {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Number of (hop, day) pairs currently registered.
    pub fn seen(&self) -> usize {
        self.registry.lock().len()
    }

    /// Forget everything; the next trace re-annotates all its hops.
    pub fn clear(&self) {
        self.registry.lock().clear();
    }

    fn rollback(&self, hops: &[String], day: &str) {
        let mut registry = self.registry.lock();
        for hop in hops {
            registry.remove(&registry_key(hop, day));
        }
    }

    /// Spawn the task that clears the registry after each UTC midnight.
    pub fn start_daily_reset(self: &Arc<Self>, cancel: CancellationToken) {
        let annotator = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let wait = until_next_utc_midnight(Utc::now());
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {
                        let dropped = annotator.seen();
                        annotator.clear();
                        info!(dropped, "reset hop annotation registry for the new day");
                    }
                }
            }
        });
    }
}

fn registry_key(hop: &str, day: &str) -> String {
    format!("{hop}-{day}")
}

/// Time until the next UTC midnight, with a one-day fallback if the
/// calendar math ever fails.
fn until_next_utc_midnight(now: DateTime<Utc>) -> Duration {
    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    now.date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|midnight| (midnight.and_utc() - now).to_std().unwrap_or(DAY))
        .unwrap_or(DAY)
}
