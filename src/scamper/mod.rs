//! Scamper subprocess supervision and trace artifact archival.
//!
//! [`Scamper`] launches the external scamper binary for one remote IP,
//! bounds its lifetime with a wall-clock timeout and the daemon's
//! cancellation token, and atomically persists the captured output under
//! a dated directory tree. Cached results are re-archived under a new
//! flow identity without re-running the measurement.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ScamperConfig;

/// Errors detected while validating a [`ScamperConfig`] at construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{} is not an executable file", .path.display())]
    NotExecutable { path: PathBuf },

    #[error("failed to create directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create a directory inside {}: {source}", .path.display())]
    ProbeDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid timeout value (min: 1s, max 3600s): {0:?}")]
    InvalidTimeout(Duration),

    #[error("invalid traceroute type: {0}")]
    InvalidTraceType(String),

    #[error("invalid tracelb wait probe value: {0}")]
    InvalidWaitProbe(u32),
}

/// Errors from running a measurement or archiving its result.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("invalid cookie {cookie:?}")]
    InvalidCookie {
        cookie: String,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("failed to spawn {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("traceroute to {remote_ip} failed: {status}")]
    Failed {
        remote_ip: String,
        status: std::process::ExitStatus,
    },

    #[error("traceroute to {remote_ip} exceeded {timeout:?}: signal: killed")]
    Killed {
        remote_ip: String,
        timeout: Duration,
    },

    #[error("traceroute to {remote_ip} canceled: signal: killed")]
    Canceled { remote_ip: String },

    #[error("reading scamper output: {0}")]
    Read(#[source] std::io::Error),

    #[error("cached traceroute payload has no UUID line")]
    BadCachedPayload,

    #[error("encoding trace metadata: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("writing artifact {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// First line of every trace artifact, carrying flow identity and cache
/// provenance. Field names are the wire format and must not change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "UUID")]
    pub uuid: String,

    #[serde(rename = "TracerouteCallerVersion", default)]
    pub traceroute_caller_version: String,

    #[serde(rename = "CachedResult", default)]
    pub cached_result: bool,

    #[serde(rename = "CachedUUID", default)]
    pub cached_uuid: String,
}

/// Process-wide identity embedded in artifact names and synthesized
/// UUIDs. Constructed once at startup and injected, never a global.
#[derive(Debug, Clone)]
pub struct Identity {
    pub hostname: String,
    pub version: String,
    start_epoch: u64,
}

impl Identity {
    pub fn new(hostname: impl Into<String>, version: impl Into<String>) -> Self {
        let start_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            hostname: hostname.into(),
            version: version.into(),
            start_epoch,
        }
    }

    /// Host prefix used in artifact filenames.
    pub fn prefix(&self) -> String {
        format!("{}_{}", self.hostname, self.start_epoch)
    }

    /// Synthesize a flow UUID from this host's identity and a cookie.
    pub fn uuid(&self, cookie: u64) -> String {
        format!("{}_{:016X}", self.prefix(), cookie)
    }
}

/// Capability to run (or replay) one traceroute per remote endpoint.
pub trait Tracer: Send + Sync + 'static {
    /// Run a traceroute to `remote_ip`, archive the result, and return
    /// the full artifact bytes (metadata line plus raw output). An empty
    /// `uuid` means one is synthesized from the host identity and
    /// `cookie` at write time.
    fn trace(
        &self,
        remote_ip: &str,
        cookie: &str,
        uuid: &str,
        when: DateTime<Utc>,
    ) -> impl std::future::Future<Output = anyhow::Result<Vec<u8>>> + Send;

    /// Archive an already-measured payload under a new flow identity.
    fn cached_trace(
        &self,
        cookie: &str,
        cached_uuid: &str,
        when: DateTime<Utc>,
        cached_payload: &[u8],
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;

    /// Hook for callers that decide to skip a measurement entirely.
    fn dont_trace(&self);
}

/// Supervises the external scamper binary and writes its artifacts.
pub struct Scamper {
    cfg: ScamperConfig,
    identity: Identity,
    cancel: CancellationToken,
}

impl Scamper {
    /// Validate the configuration and build a tracer.
    ///
    /// Checks that the binary is an executable regular file, that the
    /// output root is writable (by creating a probe directory inside
    /// it), and that timeout, trace type, and tracelb wait probe are in
    /// range.
    pub fn new(
        cfg: ScamperConfig,
        identity: Identity,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        validate_binary(&cfg.binary)?;
        validate_output_root(&cfg.output_path)?;

        if cfg.timeout < Duration::from_secs(1) || cfg.timeout > Duration::from_secs(3600) {
            return Err(ConfigError::InvalidTimeout(cfg.timeout));
        }

        match cfg.trace_type.as_str() {
            "mda" | "regular" => {}
            other => return Err(ConfigError::InvalidTraceType(other.to_string())),
        }

        if !(15..=200).contains(&cfg.tracelb_wait_probe) {
            return Err(ConfigError::InvalidWaitProbe(cfg.tracelb_wait_probe));
        }

        Ok(Self {
            cfg,
            identity,
            cancel,
        })
    }

    /// Run scamper against `remote_ip` and archive the result.
    pub async fn trace(
        &self,
        remote_ip: &str,
        cookie: &str,
        uuid: &str,
        when: DateTime<Utc>,
    ) -> Result<Vec<u8>, TraceError> {
        let cookie_value = parse_cookie(cookie)?;
        let stdout = self.run_scamper(remote_ip).await?;

        let uuid = if uuid.is_empty() {
            self.identity.uuid(cookie_value)
        } else {
            uuid.to_string()
        };

        let meta = Metadata {
            uuid,
            traceroute_caller_version: self.identity.version.clone(),
            cached_result: false,
            cached_uuid: String::new(),
        };

        self.write_artifact(cookie_value, when, &meta, &stdout).await
    }

    /// Archive a cached payload under a fresh UUID derived from `cookie`.
    ///
    /// The original UUID is taken from the payload's first line; a
    /// payload without one is rejected and nothing is written.
    pub async fn cached_trace(
        &self,
        cookie: &str,
        cached_uuid: &str,
        when: DateTime<Utc>,
        cached_payload: &[u8],
    ) -> Result<(), TraceError> {
        let cookie_value = parse_cookie(cookie)?;

        let source_uuid = extract_uuid(cached_payload).ok_or(TraceError::BadCachedPayload)?;
        if source_uuid != cached_uuid {
            debug!(
                extracted = %source_uuid,
                supplied = %cached_uuid,
                "cached payload UUID differs from supplied UUID",
            );
        }

        let meta = Metadata {
            uuid: self.identity.uuid(cookie_value),
            traceroute_caller_version: self.identity.version.clone(),
            cached_result: true,
            cached_uuid: source_uuid,
        };

        self.write_artifact(cookie_value, when, &meta, cached_payload)
            .await?;

        Ok(())
    }

    /// No-op hook for suppressed measurements.
    pub fn dont_trace(&self) {
        debug!("trace suppressed");
    }

    /// Compose the scamper command for one measurement.
    fn scamper_command(&self, remote_ip: &str) -> String {
        let mut cmd = match self.cfg.trace_type.as_str() {
            "mda" => format!(
                "tracelb -P icmp-echo -q 3 -W {}",
                self.cfg.tracelb_wait_probe,
            ),
            _ => "trace -P icmp-paris -q 3".to_string(),
        };

        if self.cfg.tracelb_ptr {
            cmd.push_str(" -O ptr");
        }

        cmd.push(' ');
        cmd.push_str(remote_ip);
        cmd
    }

    /// Launch the subprocess and capture stdout, killing it when the
    /// timeout elapses or the daemon shuts down, whichever comes first.
    async fn run_scamper(&self, remote_ip: &str) -> Result<Vec<u8>, TraceError> {
        let command = self.scamper_command(remote_ip);

        let mut child = Command::new(&self.cfg.binary)
            .args(["-o-", "-O", "json", "-I", &command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TraceError::Spawn {
                binary: self.cfg.binary.clone(),
                source,
            })?;

        let mut stdout = child.stdout.take().ok_or_else(|| {
            TraceError::Read(std::io::Error::other("child stdout not captured"))
        })?;

        enum RunEnd {
            Canceled,
            TimedOut,
            Finished(std::io::Result<usize>, std::io::Result<std::process::ExitStatus>),
        }

        let mut buf = Vec::new();
        let end = tokio::select! {
            _ = self.cancel.cancelled() => RunEnd::Canceled,
            _ = tokio::time::sleep(self.cfg.timeout) => RunEnd::TimedOut,
            (read, status) = async {
                let read = stdout.read_to_end(&mut buf).await;
                let status = child.wait().await;
                (read, status)
            } => RunEnd::Finished(read, status),
        };

        match end {
            RunEnd::Canceled | RunEnd::TimedOut => {
                let _ = child.start_kill();
                let _ = child.wait().await;

                if matches!(end, RunEnd::Canceled) {
                    Err(TraceError::Canceled {
                        remote_ip: remote_ip.to_string(),
                    })
                } else {
                    Err(TraceError::Killed {
                        remote_ip: remote_ip.to_string(),
                        timeout: self.cfg.timeout,
                    })
                }
            }
            RunEnd::Finished(read, status) => {
                read.map_err(TraceError::Read)?;
                let status = status.map_err(TraceError::Read)?;

                if !status.success() {
                    return Err(TraceError::Failed {
                        remote_ip: remote_ip.to_string(),
                        status,
                    });
                }

                Ok(buf)
            }
        }
    }

    /// Write metadata line plus payload atomically and return the
    /// combined bytes.
    async fn write_artifact(
        &self,
        cookie: u64,
        when: DateTime<Utc>,
        meta: &Metadata,
        payload: &[u8],
    ) -> Result<Vec<u8>, TraceError> {
        let mut data = serde_json::to_vec(meta).map_err(TraceError::Encode)?;
        data.push(b'\n');
        data.extend_from_slice(payload);

        let dir = self
            .cfg
            .output_path
            .join(when.format("%Y/%m/%d").to_string());
        let name = artifact_name(&self.identity.prefix(), cookie, when);
        let path = dir.join(&name);

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| TraceError::Write {
                path: dir.clone(),
                source,
            })?;

        // Temp file plus rename in the same directory keeps partially
        // written artifacts invisible to collectors scanning the tree.
        let tmp = dir.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|source| TraceError::Write {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| TraceError::Write {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), bytes = data.len(), "wrote trace artifact");

        Ok(data)
    }
}

impl Tracer for Scamper {
    async fn trace(
        &self,
        remote_ip: &str,
        cookie: &str,
        uuid: &str,
        when: DateTime<Utc>,
    ) -> anyhow::Result<Vec<u8>> {
        Ok(Scamper::trace(self, remote_ip, cookie, uuid, when).await?)
    }

    async fn cached_trace(
        &self,
        cookie: &str,
        cached_uuid: &str,
        when: DateTime<Utc>,
        cached_payload: &[u8],
    ) -> anyhow::Result<()> {
        Ok(Scamper::cached_trace(self, cookie, cached_uuid, when, cached_payload).await?)
    }

    fn dont_trace(&self) {
        Scamper::dont_trace(self);
    }
}

/// Artifact filename: `<YYYYMMDDThhmmssZ>_<host-prefix>_<16-hex-cookie>.jsonl`.
fn artifact_name(prefix: &str, cookie: u64, when: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{:016X}.jsonl",
        when.format("%Y%m%dT%H%M%SZ"),
        prefix,
        cookie,
    )
}

/// Decode a hex cookie into its 64-bit value.
fn parse_cookie(cookie: &str) -> Result<u64, TraceError> {
    u64::from_str_radix(cookie, 16).map_err(|source| TraceError::InvalidCookie {
        cookie: cookie.to_string(),
        source,
    })
}

/// Pull the UUID out of the first line of a cached payload.
fn extract_uuid(payload: &[u8]) -> Option<String> {
    let first = payload.split(|&b| b == b'\n').next()?;
    let meta: Metadata = serde_json::from_slice(first).ok()?;
    if meta.uuid.is_empty() {
        None
    } else {
        Some(meta.uuid)
    }
}

fn validate_binary(path: &std::path::Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::metadata(path).map_err(|_| ConfigError::NotExecutable {
        path: path.to_path_buf(),
    })?;

    if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
        return Err(ConfigError::NotExecutable {
            path: path.to_path_buf(),
        });
    }

    Ok(())
}

fn validate_output_root(path: &std::path::Path) -> Result<(), ConfigError> {
    std::fs::create_dir_all(path).map_err(|source| ConfigError::CreateDir {
        path: path.to_path_buf(),
        source,
    })?;

    // Creating and removing a probe directory proves the root is
    // writable before the first measurement needs it.
    let probe = path.join(format!(".scamperd-probe-{}", std::process::id()));
    std::fs::create_dir(&probe).map_err(|source| ConfigError::ProbeDir {
        path: path.to_path_buf(),
        source,
    })?;
    let _ = std::fs::remove_dir(&probe);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use chrono::TimeZone;
    use tempfile::TempDir;

    fn test_config(binary: &str, output: &Path) -> ScamperConfig {
        ScamperConfig {
            binary: PathBuf::from(binary),
            output_path: output.to_path_buf(),
            timeout: Duration::from_secs(60),
            trace_type: "mda".to_string(),
            tracelb_wait_probe: 39,
            tracelb_ptr: true,
        }
    }

    fn identity() -> Identity {
        Identity::new("testhost", "test-version")
    }

    fn scamper(cfg: ScamperConfig) -> Scamper {
        Scamper::new(cfg, identity(), CancellationToken::new()).expect("valid config")
    }

    /// Write an executable shell script into `dir`.
    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        path
    }

    fn faketime() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 4, 1, 3, 45, 51).single().expect("valid time")
    }

    #[test]
    fn test_construction_rejects_bad_configs() {
        let out = TempDir::new().expect("tempdir");
        let non_exec_dir = TempDir::new().expect("tempdir");
        let non_exec = non_exec_dir.path().join("not-executable");
        std::fs::write(&non_exec, "just data").expect("write");

        struct Case {
            binary: String,
            output: PathBuf,
            timeout: Duration,
            trace_type: &'static str,
            wait_probe: u32,
            want: &'static str,
        }

        let cases = [
            Case {
                // A directory is not an executable file.
                binary: out.path().to_string_lossy().into_owned(),
                output: out.path().to_path_buf(),
                timeout: Duration::from_secs(900),
                trace_type: "mda",
                wait_probe: 15,
                want: "is not an executable file",
            },
            Case {
                binary: "/nonexistent/scamper".to_string(),
                output: out.path().to_path_buf(),
                timeout: Duration::from_secs(900),
                trace_type: "mda",
                wait_probe: 15,
                want: "is not an executable file",
            },
            Case {
                binary: non_exec.to_string_lossy().into_owned(),
                output: out.path().to_path_buf(),
                timeout: Duration::from_secs(900),
                trace_type: "mda",
                wait_probe: 15,
                want: "is not an executable file",
            },
            Case {
                binary: "/bin/echo".to_string(),
                output: PathBuf::from("/dev/null"),
                timeout: Duration::from_secs(900),
                trace_type: "mda",
                wait_probe: 15,
                want: "failed to create directory",
            },
            Case {
                binary: "/bin/echo".to_string(),
                output: PathBuf::from("/proc/sys"),
                timeout: Duration::from_secs(900),
                trace_type: "mda",
                wait_probe: 15,
                want: "failed to create a directory inside",
            },
            Case {
                binary: "/bin/echo".to_string(),
                output: out.path().to_path_buf(),
                timeout: Duration::ZERO,
                trace_type: "mda",
                wait_probe: 15,
                want: "invalid timeout value (min: 1s, max 3600s)",
            },
            Case {
                binary: "/bin/echo".to_string(),
                output: out.path().to_path_buf(),
                timeout: Duration::from_secs(3601),
                trace_type: "mda",
                wait_probe: 15,
                want: "invalid timeout value (min: 1s, max 3600s)",
            },
            Case {
                binary: "/bin/echo".to_string(),
                output: out.path().to_path_buf(),
                timeout: Duration::from_secs(900),
                trace_type: "bad",
                wait_probe: 15,
                want: "invalid traceroute type",
            },
            Case {
                binary: "/bin/echo".to_string(),
                output: out.path().to_path_buf(),
                timeout: Duration::from_secs(900),
                trace_type: "mda",
                wait_probe: 14,
                want: "invalid tracelb wait probe value",
            },
            Case {
                binary: "/bin/echo".to_string(),
                output: out.path().to_path_buf(),
                timeout: Duration::from_secs(900),
                trace_type: "mda",
                wait_probe: 201,
                want: "invalid tracelb wait probe value",
            },
        ];

        for case in cases {
            let cfg = ScamperConfig {
                binary: PathBuf::from(&case.binary),
                output_path: case.output.clone(),
                timeout: case.timeout,
                trace_type: case.trace_type.to_string(),
                tracelb_wait_probe: case.wait_probe,
                tracelb_ptr: false,
            };

            let err = Scamper::new(cfg, identity(), CancellationToken::new())
                .err()
                .unwrap_or_else(|| panic!("construction should fail: {}", case.want));
            assert!(
                err.to_string().contains(case.want),
                "error {err:?} should contain {:?}",
                case.want,
            );
        }
    }

    #[test]
    fn test_construction_accepts_valid_configs() {
        let out = TempDir::new().expect("tempdir");

        for trace_type in ["mda", "regular"] {
            let cfg = ScamperConfig {
                trace_type: trace_type.to_string(),
                tracelb_wait_probe: 25,
                ..test_config("/bin/echo", out.path())
            };
            assert!(Scamper::new(cfg, identity(), CancellationToken::new()).is_ok());
        }
    }

    #[tokio::test]
    async fn test_trace_mda_argv_with_ptr() {
        let out = TempDir::new().expect("tempdir");
        let s = scamper(test_config("/bin/echo", out.path()));

        let data = s
            .trace("10.1.1.1", "12AB", "", faketime())
            .await
            .expect("trace");

        let text = String::from_utf8(data).expect("utf8");
        let mut lines = text.lines();

        let meta: Metadata =
            serde_json::from_str(lines.next().expect("meta line")).expect("metadata");
        assert!(!meta.cached_result);
        assert_eq!(meta.cached_uuid, "");
        assert_eq!(meta.traceroute_caller_version, "test-version");
        assert!(meta.uuid.ends_with("_00000000000012AB"));

        assert_eq!(
            lines.next().expect("argv line"),
            "-o- -O json -I tracelb -P icmp-echo -q 3 -W 39 -O ptr 10.1.1.1",
        );

        // The artifact file holds exactly the returned bytes.
        let path = out.path().join(format!(
            "2019/04/01/20190401T034551Z_{}_00000000000012AB.jsonl",
            s.identity.prefix(),
        ));
        let on_disk = std::fs::read_to_string(&path).expect("artifact exists");
        assert_eq!(on_disk, text);
    }

    #[tokio::test]
    async fn test_trace_mda_argv_without_ptr() {
        let out = TempDir::new().expect("tempdir");
        let cfg = ScamperConfig {
            tracelb_ptr: false,
            ..test_config("/bin/echo", out.path())
        };
        let s = scamper(cfg);

        let data = s.trace("10.1.1.1", "1", "", faketime()).await.expect("trace");
        let text = String::from_utf8(data).expect("utf8");

        assert_eq!(
            text.lines().nth(1).expect("argv line"),
            "-o- -O json -I tracelb -P icmp-echo -q 3 -W 39 10.1.1.1",
        );
    }

    #[tokio::test]
    async fn test_trace_regular_argv() {
        let out = TempDir::new().expect("tempdir");
        let cfg = ScamperConfig {
            trace_type: "regular".to_string(),
            tracelb_ptr: false,
            ..test_config("/bin/echo", out.path())
        };
        let s = scamper(cfg);

        let data = s.trace("10.1.1.1", "1", "", faketime()).await.expect("trace");
        let text = String::from_utf8(data).expect("utf8");

        assert_eq!(
            text.lines().nth(1).expect("argv line"),
            "-o- -O json -I trace -P icmp-paris -q 3 10.1.1.1",
        );
    }

    #[tokio::test]
    async fn test_trace_uuid_passed_through() {
        let out = TempDir::new().expect("tempdir");
        let s = scamper(test_config("/bin/echo", out.path()));

        let data = s
            .trace("1.2.3.4", "1", "0123456789", faketime())
            .await
            .expect("trace");

        let text = String::from_utf8(data).expect("utf8");
        let meta: Metadata =
            serde_json::from_str(text.lines().next().expect("meta")).expect("metadata");
        assert_eq!(meta.uuid, "0123456789");
    }

    #[tokio::test]
    async fn test_trace_nonzero_exit_is_error() {
        let out = TempDir::new().expect("tempdir");
        let bin = TempDir::new().expect("tempdir");
        let fail = script(bin.path(), "fail", "exit 1");

        let s = scamper(test_config(&fail.to_string_lossy(), out.path()));
        let err = s
            .trace("10.1.1.1", "1", "", faketime())
            .await
            .expect_err("should fail");

        assert!(matches!(err, TraceError::Failed { .. }));
        assert!(err.to_string().contains("exit status"));
    }

    #[tokio::test]
    async fn test_trace_timeout_kills_subprocess() {
        let out = TempDir::new().expect("tempdir");
        let bin = TempDir::new().expect("tempdir");
        let forever = script(bin.path(), "loop", "sleep 3600");

        let cfg = ScamperConfig {
            timeout: Duration::from_secs(1),
            ..test_config(&forever.to_string_lossy(), out.path())
        };
        let s = scamper(cfg);

        let err = s
            .trace("10.1.1.1", "1", "", faketime())
            .await
            .expect_err("should be killed");

        assert!(err.to_string().contains("signal: killed"), "got {err}");

        // No artifact may exist after a failed measurement.
        assert!(!out.path().join("2019").exists());
    }

    #[tokio::test]
    async fn test_trace_cancellation_kills_subprocess() {
        let out = TempDir::new().expect("tempdir");
        let bin = TempDir::new().expect("tempdir");
        let forever = script(bin.path(), "loop", "sleep 3600");

        let cancel = CancellationToken::new();
        let s = Scamper::new(
            test_config(&forever.to_string_lossy(), out.path()),
            identity(),
            cancel.clone(),
        )
        .expect("valid config");

        let trace = s.trace("10.1.1.1", "1", "", faketime());
        let canceler = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };

        let (result, ()) = tokio::join!(trace, canceler);
        let err = result.expect_err("should be canceled");
        assert!(err.to_string().contains("signal: killed"), "got {err}");
    }

    #[tokio::test]
    async fn test_trace_invalid_cookie() {
        let out = TempDir::new().expect("tempdir");
        let s = scamper(test_config("/bin/echo", out.path()));

        let err = s
            .trace("10.1.1.1", "an invalid cookie", "", faketime())
            .await
            .expect_err("should fail");
        assert!(matches!(err, TraceError::InvalidCookie { .. }));

        let err = s
            .cached_trace("an invalid cookie", "", faketime(), b"")
            .await
            .expect_err("should fail");
        assert!(matches!(err, TraceError::InvalidCookie { .. }));
    }

    const CACHED_PAYLOAD: &str = concat!(
        "{\"UUID\": \"ndt-plh7v_1566050090_000000000004D64D\"}\n",
        "{\"type\":\"cycle-start\", \"list_name\":\"/tmp/scamperctrl:51811\", \"id\":1, \"hostname\":\"ndt-plh7v\", \"start_time\":1566691298}\n",
        "{\"type\":\"tracelb\", \"version\":\"0.1\", \"userid\":0, \"method\":\"icmp-echo\", \"src\":\"::ffff:180.87.97.101\", \"dst\":\"::ffff:1.47.236.62\", \"start\":{\"sec\":1566691298, \"usec\":476221, \"ftime\":\"2019-08-25 00:01:38\"}, \"probe_size\":60, \"firsthop\":1, \"attempts\":3, \"confidence\":95, \"tos\":0, \"gaplimit\":3, \"wait_timeout\":5, \"wait_probe\":250, \"probec\":0, \"probec_max\":3000, \"nodec\":0, \"linkc\":0}\n",
        "{\"type\":\"cycle-stop\", \"list_name\":\"/tmp/scamperctrl:51811\", \"id\":1, \"hostname\":\"ndt-plh7v\", \"stop_time\":1566691298}",
    );

    #[tokio::test]
    async fn test_cached_trace_writes_artifact() {
        let out = TempDir::new().expect("tempdir");
        let s = scamper(test_config("/bin/echo", out.path()));

        s.cached_trace(
            "1",
            "ndt-plh7v_1566050090_000000000004D64D",
            faketime(),
            CACHED_PAYLOAD.as_bytes(),
        )
        .await
        .expect("cached trace");

        let path = out.path().join(format!(
            "2019/04/01/20190401T034551Z_{}_0000000000000001.jsonl",
            s.identity.prefix(),
        ));
        let text = std::fs::read_to_string(&path).expect("artifact exists");
        let mut lines = text.lines();

        let meta: Metadata =
            serde_json::from_str(lines.next().expect("meta line")).expect("metadata");
        assert!(meta.cached_result);
        assert_eq!(meta.cached_uuid, "ndt-plh7v_1566050090_000000000004D64D");
        assert!(meta.uuid.ends_with("_0000000000000001"));
        assert_eq!(meta.traceroute_caller_version, "test-version");

        // The cached payload follows the new metadata line verbatim.
        assert!(lines.next().expect("payload line").contains("ndt-plh7v"));
    }

    #[tokio::test]
    async fn test_cached_trace_rejects_broken_payload() {
        let out = TempDir::new().expect("tempdir");
        let s = scamper(test_config("/bin/echo", out.path()));

        let err = s
            .cached_trace("1", "whatever", faketime(), b"Broken cached traceroute")
            .await
            .expect_err("should fail");
        assert!(matches!(err, TraceError::BadCachedPayload));

        // Nothing was written.
        assert!(!out.path().join("2019").exists());
    }

    #[test]
    fn test_extract_uuid() {
        let uuid = extract_uuid(b"{\"UUID\": \"ndt-plh7v_1566050090_000000000004D64D\"}");
        assert_eq!(
            uuid.as_deref(),
            Some("ndt-plh7v_1566050090_000000000004D64D"),
        );

        assert_eq!(extract_uuid(b"invalid json"), None);
        assert_eq!(extract_uuid(b"{\"UUID\": \"\"}"), None);
    }

    #[test]
    fn test_artifact_name_round_trip() {
        let when = faketime();
        let name = artifact_name("host_123", 0x12AB, when);
        assert_eq!(name, "20190401T034551Z_host_123_00000000000012AB.jsonl");

        // Filename determines (date, cookie); the cookie survives the
        // 16-hex round trip.
        let stem = name.strip_suffix(".jsonl").expect("suffix");
        let (rest, cookie_hex) = stem.rsplit_once('_').expect("cookie component");
        assert_eq!(u64::from_str_radix(cookie_hex, 16).expect("hex"), 0x12AB);
        assert!(rest.starts_with("20190401T034551Z"));
    }

    #[test]
    fn test_identity_uuid_format() {
        let id = Identity::new("node1", "v1");
        let uuid = id.uuid(0x4D64D);
        assert!(uuid.starts_with("node1_"));
        assert!(uuid.ends_with("_000000000004D64D"));
    }
}
