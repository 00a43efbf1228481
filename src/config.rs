use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the scamperd daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Unix domain socket emitting TCP flow open/close events.
    #[serde(default)]
    pub event_socket: PathBuf,

    /// Hostname override for artifact UUIDs and filenames. Empty means
    /// detect from the OS.
    #[serde(default)]
    pub hostname: String,

    /// Scamper subprocess configuration.
    #[serde(default)]
    pub scamper: ScamperConfig,

    /// Single-flight trace cache configuration.
    #[serde(default)]
    pub ipcache: CacheConfig,

    /// Hop annotation configuration.
    #[serde(default)]
    pub hopannotation: HopAnnotationConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Scamper binary invocation and artifact output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScamperConfig {
    /// Path to the scamper binary.
    #[serde(default)]
    pub binary: PathBuf,

    /// Root directory for trace artifact files.
    #[serde(default)]
    pub output_path: PathBuf,

    /// Wall-clock limit for one scamper run. Valid range: 1s to 3600s.
    /// Default: 900s.
    #[serde(default = "default_scamper_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Traceroute flavor: "mda" or "regular". Default: "mda".
    #[serde(default = "default_trace_type")]
    pub trace_type: String,

    /// tracelb inter-probe wait in centiseconds. Valid range: 15 to 200.
    /// Default: 25.
    #[serde(default = "default_tracelb_wait_probe")]
    pub tracelb_wait_probe: u32,

    /// Ask tracelb to resolve PTR records. Default: false.
    #[serde(default)]
    pub tracelb_ptr: bool,
}

/// Single-flight trace cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// How long a completed entry shields its remote IP from re-tracing.
    /// Default: 10m.
    #[serde(default = "default_entry_timeout", with = "humantime_serde")]
    pub entry_timeout: Duration,

    /// How often expired entries are swept. Default: 1m.
    #[serde(default = "default_scan_period", with = "humantime_serde")]
    pub scan_period: Duration,
}

/// Hop annotation service and output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HopAnnotationConfig {
    /// Root directory for per-hop annotation files.
    #[serde(default)]
    pub output_path: PathBuf,

    /// Annotation service endpoint.
    #[serde(default)]
    pub service_url: String,

    /// Annotation request timeout. Default: 10s.
    #[serde(default = "default_annotation_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_scamper_timeout() -> Duration {
    Duration::from_secs(900)
}

fn default_trace_type() -> String {
    "mda".to_string()
}

fn default_tracelb_wait_probe() -> u32 {
    25
}

fn default_entry_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_scan_period() -> Duration {
    Duration::from_secs(60)
}

fn default_annotation_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            event_socket: PathBuf::new(),
            hostname: String::new(),
            scamper: ScamperConfig::default(),
            ipcache: CacheConfig::default(),
            hopannotation: HopAnnotationConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ScamperConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::new(),
            output_path: PathBuf::new(),
            timeout: default_scamper_timeout(),
            trace_type: default_trace_type(),
            tracelb_wait_probe: default_tracelb_wait_probe(),
            tracelb_ptr: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entry_timeout: default_entry_timeout(),
            scan_period: default_scan_period(),
        }
    }
}

impl Default for HopAnnotationConfig {
    fn default() -> Self {
        Self {
            output_path: PathBuf::new(),
            service_url: String::new(),
            timeout: default_annotation_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    ///
    /// Scamper's own numeric and filesystem checks run when the tracer
    /// is constructed; this only catches fields that must be present
    /// before any component is built.
    pub fn validate(&self) -> Result<()> {
        if self.event_socket.as_os_str().is_empty() {
            bail!("event_socket is required");
        }

        if self.scamper.binary.as_os_str().is_empty() {
            bail!("scamper.binary is required");
        }

        if self.scamper.output_path.as_os_str().is_empty() {
            bail!("scamper.output_path is required");
        }

        if self.hopannotation.output_path.as_os_str().is_empty() {
            bail!("hopannotation.output_path is required");
        }

        if self.hopannotation.service_url.is_empty() {
            bail!("hopannotation.service_url is required");
        }

        if self.ipcache.entry_timeout.is_zero() {
            bail!("ipcache.entry_timeout must be positive");
        }

        if self.ipcache.scan_period.is_zero() {
            bail!("ipcache.scan_period must be positive");
        }

        Ok(())
    }
}
