//! Event log and in-process counters.
//!
//! `EventSink` appends one JSON line per webhook outcome to an optional file
//! with size-based rotation.  `RelayMetrics` holds the counters rendered by
//! the `/metrics` endpoint.

use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

use crate::config::RotationConfig;

/// Size-based rotating writer.  Backups are `<path>.1` … `<path>.<keep>`,
/// each with a `.gz` suffix when compression is on.
pub struct RotatingWriter {
    path: PathBuf,
    file: std::fs::File,
    max_bytes: Option<u64>,
    keep: usize,
    compress: bool,
}

impl RotatingWriter {
    pub fn open(path: &str, rotation: &RotationConfig) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            file,
            max_bytes: rotation.max_bytes,
            keep: rotation.keep,
            compress: rotation.compress,
        })
    }

    fn check_rotate(&mut self) {
        if let Some(limit) = self.max_bytes {
            if self.exceeds_limit(limit) {
                self.rotate_backups();
                self.compress_latest_backup();
                self.reopen_current();
            }
        }
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.check_rotate();
        writeln!(self.file, "{}", line)
    }

    fn exceeds_limit(&self, limit: u64) -> bool {
        self.path
            .metadata()
            .map(|meta| meta.len() >= limit)
            .unwrap_or(false)
    }

    fn backup_path(&self, idx: usize, gz: bool) -> PathBuf {
        if gz {
            self.path.with_extension(format!("{idx}.gz"))
        } else {
            self.path.with_extension(format!("{idx}"))
        }
    }

    /// Shift `<path>.N[.gz]` up by one; the oldest backup falls off the end.
    fn rotate_backups(&self) {
        if self.keep == 0 {
            return;
        }
        for idx in (2..=self.keep).rev() {
            for gz in [false, true] {
                let old = self.backup_path(idx - 1, gz);
                if old.exists() {
                    let _ = fs::rename(&old, self.backup_path(idx, gz));
                }
            }
        }
        if self.path.exists() {
            let _ = fs::rename(&self.path, self.backup_path(1, false));
        }
    }

    fn compress_latest_backup(&self) {
        if !self.compress || self.keep == 0 {
            return;
        }
        let rotated = self.backup_path(1, false);
        if let Ok(data) = fs::read(&rotated) {
            let mut gz = GzEncoder::new(Vec::new(), Compression::default());
            if gz.write_all(&data).is_ok() {
                if let Ok(buf) = gz.finish() {
                    let _ = fs::write(self.backup_path(1, true), buf);
                    let _ = fs::remove_file(&rotated);
                }
            }
        }
    }

    fn reopen_current(&mut self) {
        if let Ok(newf) = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            self.file = newf;
        }
    }
}

/// One line of the event log.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent<'a> {
    pub schema_version: u8,
    pub ts: String,
    pub identity: &'a str,
    pub group_id: &'a str,
    pub outcome: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<&'a str>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct EventSink {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    log_stdout: bool,
    metrics: Arc<RelayMetrics>,
}

impl EventSink {
    pub fn new(
        writer: Option<Arc<Mutex<RotatingWriter>>>,
        log_stdout: bool,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            writer,
            log_stdout,
            metrics,
        }
    }

    /// Open the configured log file.  A file that cannot be opened disables
    /// the event log with a warning rather than failing start-up.
    pub fn from_config(
        log_file: Option<&str>,
        rotation: &RotationConfig,
        log_stdout: bool,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let writer = match log_file {
            Some(path) => match RotatingWriter::open(path, rotation) {
                Ok(f) => Some(Arc::new(Mutex::new(f))),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to open LOG_FILE; event log disabled");
                    None
                }
            },
            None => None,
        };
        Self::new(writer, log_stdout, metrics)
    }

    pub fn emit(&self, event: &WebhookEvent<'_>) {
        if let Some(target) = &self.writer {
            let line = match serde_json::to_string(event) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to serialise event");
                    return;
                }
            };
            if let Ok(mut guard) = target.lock() {
                match guard.write_line(&line) {
                    Ok(()) => {
                        self.metrics.event_lines.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to write event line");
                        self.metrics.event_write_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        if self.log_stdout {
            tracing::info!(
                target: "events",
                identity = %event.identity,
                group_id = %event.group_id,
                outcome = %event.outcome,
                mode = ?event.mode,
                latency_ms = event.latency_ms
            );
        }
    }
}

/// Webhook outcomes counted by `/metrics`, in exposition order.
pub const OUTCOME_LABELS: [&str; 8] = [
    "processed",
    "dispatched",
    "busy",
    "reset",
    "bad_request",
    "forbidden",
    "rate_limited",
    "internal_error",
];

const LATENCY_BUCKETS_MS: [u64; 10] = [5, 10, 50, 100, 500, 1000, 5000, 10_000, 30_000, 60_000];

pub struct RelayMetrics {
    outcomes: [AtomicU64; OUTCOME_LABELS.len()],
    pub model_failures: AtomicU64,
    pub stream_truncations: AtomicU64,
    pub notify_failures: AtomicU64,
    pub stale_replies_dropped: AtomicU64,
    pub swept_sessions: AtomicU64,
    pub swept_requests: AtomicU64,
    pub swept_rate_entries: AtomicU64,
    pub event_lines: AtomicU64,
    pub event_write_errors: AtomicU64,
    latency_counts: [AtomicU64; LATENCY_BUCKETS_MS.len()],
    latency_sum_ms: AtomicU64,
    latency_count: AtomicU64,
    start_epoch: f64,
    start_instant: Instant,
}

impl Default for RelayMetrics {
    fn default() -> Self {
        let start = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            outcomes: Default::default(),
            model_failures: AtomicU64::new(0),
            stream_truncations: AtomicU64::new(0),
            notify_failures: AtomicU64::new(0),
            stale_replies_dropped: AtomicU64::new(0),
            swept_sessions: AtomicU64::new(0),
            swept_requests: AtomicU64::new(0),
            swept_rate_entries: AtomicU64::new(0),
            event_lines: AtomicU64::new(0),
            event_write_errors: AtomicU64::new(0),
            latency_counts: Default::default(),
            latency_sum_ms: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            start_epoch: start.as_secs_f64(),
            start_instant: Instant::now(),
        }
    }
}

/// Current store sizes, sampled under the coordinator lock.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreSizes {
    pub sessions: usize,
    pub active_requests: usize,
    pub rate_entries: usize,
}

impl RelayMetrics {
    pub fn record_outcome(&self, label: &str, latency_ms: u64) {
        if let Some(idx) = OUTCOME_LABELS.iter().position(|l| *l == label) {
            self.outcomes[idx].fetch_add(1, Ordering::Relaxed);
        }
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        for (idx, ub) in LATENCY_BUCKETS_MS.iter().enumerate() {
            if latency_ms <= *ub {
                self.latency_counts[idx].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    pub fn outcome_count(&self, label: &str) -> u64 {
        OUTCOME_LABELS
            .iter()
            .position(|l| *l == label)
            .map(|idx| self.outcomes[idx].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn uptime_secs(&self) -> f64 {
        self.start_instant.elapsed().as_secs_f64()
    }

    /// Prometheus text exposition.
    pub fn render(&self, sizes: StoreSizes) -> String {
        let mut buf = String::new();
        writeln!(&mut buf, "# HELP relay_webhook_requests_total Webhook calls by outcome").ok();
        writeln!(&mut buf, "# TYPE relay_webhook_requests_total counter").ok();
        for (idx, label) in OUTCOME_LABELS.iter().enumerate() {
            writeln!(
                &mut buf,
                "relay_webhook_requests_total{{outcome=\"{}\"}} {}",
                label,
                self.outcomes[idx].load(Ordering::Relaxed)
            )
            .ok();
        }

        let counters = [
            ("relay_model_failures_total", "Model calls that ended in an apology", &self.model_failures),
            ("relay_stream_truncations_total", "Reasoning answers cut off by the time budget", &self.stream_truncations),
            ("relay_notify_failures_total", "Callback deliveries that failed", &self.notify_failures),
            ("relay_stale_replies_dropped_total", "Finished answers dropped after reset or sweep", &self.stale_replies_dropped),
            ("relay_event_lines_total", "Event log lines written", &self.event_lines),
            ("relay_event_write_errors_total", "Event log write failures", &self.event_write_errors),
        ];
        for (name, help, value) in counters {
            writeln!(&mut buf, "# HELP {} {}\n# TYPE {} counter", name, help, name).ok();
            writeln!(&mut buf, "{} {}", name, value.load(Ordering::Relaxed)).ok();
        }

        writeln!(&mut buf, "# HELP relay_janitor_removed_total Entries removed by janitor sweeps\n# TYPE relay_janitor_removed_total counter").ok();
        for (store, value) in [
            ("sessions", &self.swept_sessions),
            ("active_requests", &self.swept_requests),
            ("rate_entries", &self.swept_rate_entries),
        ] {
            writeln!(
                &mut buf,
                "relay_janitor_removed_total{{store=\"{}\"}} {}",
                store,
                value.load(Ordering::Relaxed)
            )
            .ok();
        }

        writeln!(&mut buf, "# HELP relay_store_entries Current entries per relay store\n# TYPE relay_store_entries gauge").ok();
        for (store, value) in [
            ("sessions", sizes.sessions),
            ("active_requests", sizes.active_requests),
            ("rate_entries", sizes.rate_entries),
        ] {
            writeln!(&mut buf, "relay_store_entries{{store=\"{}\"}} {}", store, value).ok();
        }

        writeln!(&mut buf, "# HELP relay_webhook_latency_ms Webhook handling latency histogram milliseconds").ok();
        writeln!(&mut buf, "# TYPE relay_webhook_latency_ms histogram").ok();
        let mut cumulative: u64 = 0;
        for (i, ub) in LATENCY_BUCKETS_MS.iter().enumerate() {
            cumulative += self.latency_counts[i].load(Ordering::Relaxed);
            writeln!(&mut buf, "relay_webhook_latency_ms_bucket{{le=\"{}\"}} {}", ub, cumulative).ok();
        }
        let count = self.latency_count.load(Ordering::Relaxed);
        writeln!(&mut buf, "relay_webhook_latency_ms_bucket{{le=\"+Inf\"}} {}", count).ok();
        writeln!(&mut buf, "relay_webhook_latency_ms_sum {}", self.latency_sum_ms.load(Ordering::Relaxed)).ok();
        writeln!(&mut buf, "relay_webhook_latency_ms_count {}", count).ok();

        writeln!(&mut buf, "# HELP relay_build_info Build information\n# TYPE relay_build_info gauge").ok();
        writeln!(&mut buf, "relay_build_info{{version=\"{}\"}} 1", env!("CARGO_PKG_VERSION")).ok();
        writeln!(&mut buf, "# HELP relay_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE relay_process_start_time_seconds gauge").ok();
        writeln!(&mut buf, "relay_process_start_time_seconds {}", self.start_epoch).ok();
        writeln!(&mut buf, "# HELP relay_process_uptime_seconds Process uptime seconds\n# TYPE relay_process_uptime_seconds gauge").ok();
        writeln!(&mut buf, "relay_process_uptime_seconds {}", self.uptime_secs()).ok();
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_counters_and_histogram_render() {
        let metrics = RelayMetrics::default();
        metrics.record_outcome("processed", 42);
        metrics.record_outcome("rate_limited", 1);
        metrics.record_outcome("unknown", 1);
        assert_eq!(metrics.outcome_count("processed"), 1);

        let text = metrics.render(StoreSizes {
            sessions: 3,
            active_requests: 1,
            rate_entries: 7,
        });
        assert!(text.contains("relay_webhook_requests_total{outcome=\"processed\"} 1"));
        assert!(text.contains("relay_webhook_requests_total{outcome=\"rate_limited\"} 1"));
        assert!(text.contains("relay_store_entries{store=\"rate_entries\"} 7"));
        assert!(text.contains("relay_webhook_latency_ms_bucket{le=\"+Inf\"} 3"));
        assert!(text.contains("relay_webhook_latency_ms_bucket{le=\"50\"} 3"));
        assert_eq!(text.matches("# HELP relay_janitor_removed_total").count(), 1);
    }

    #[test]
    fn rotation_moves_full_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let rotation = RotationConfig {
            max_bytes: Some(64),
            keep: 2,
            compress: false,
        };
        let mut writer = RotatingWriter::open(path.to_str().unwrap(), &rotation).unwrap();
        let line = "x".repeat(80);
        writer.write_line(&line).unwrap();
        writer.write_line("second").unwrap();

        let backup = fs::read_to_string(path.with_extension("1")).unwrap();
        assert_eq!(backup.trim(), line);
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), "second");
    }

    #[test]
    fn compressed_rotation_leaves_gzip_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let rotation = RotationConfig {
            max_bytes: Some(16),
            keep: 1,
            compress: true,
        };
        let mut writer = RotatingWriter::open(path.to_str().unwrap(), &rotation).unwrap();
        writer.write_line("a line that exceeds sixteen bytes").unwrap();
        writer.write_line("next").unwrap();

        assert!(!path.with_extension("1").exists());
        assert!(path.with_extension("1.gz").exists());
    }

    #[test]
    fn compressed_backups_shift_up_to_keep() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let rotation = RotationConfig {
            max_bytes: Some(16),
            keep: 3,
            compress: true,
        };
        let mut writer = RotatingWriter::open(path.to_str().unwrap(), &rotation).unwrap();
        for i in 0..5 {
            writer
                .write_line(&format!("line {i} is longer than sixteen bytes"))
                .unwrap();
        }

        let gunzip = |idx: usize| {
            let raw = fs::read(path.with_extension(format!("{idx}.gz"))).unwrap();
            let mut out = String::new();
            std::io::Read::read_to_string(&mut flate2::read::GzDecoder::new(&raw[..]), &mut out)
                .unwrap();
            out
        };
        assert!(gunzip(1).starts_with("line 3"));
        assert!(gunzip(2).starts_with("line 2"));
        assert!(gunzip(3).starts_with("line 1"));
        assert!(!path.with_extension("4.gz").exists());
        assert!(fs::read_to_string(&path).unwrap().starts_with("line 4"));
    }

    #[test]
    fn sink_counts_written_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let metrics = Arc::new(RelayMetrics::default());
        let rotation = RotationConfig {
            max_bytes: None,
            keep: 1,
            compress: false,
        };
        let sink = EventSink::from_config(path.to_str(), &rotation, false, metrics.clone());
        sink.emit(&WebhookEvent {
            schema_version: 1,
            ts: "2026-01-01T00:00:00Z".into(),
            identity: "alice",
            group_id: "g1",
            outcome: "processed",
            mode: Some("normal"),
            latency_ms: 12,
            error: None,
        });
        assert_eq!(metrics.event_lines.load(Ordering::Relaxed), 1);
        let line = fs::read_to_string(&path).unwrap();
        let v: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(v["outcome"], "processed");
        assert_eq!(v["groupId"], "g1");
        assert!(v.get("error").is_none());
    }
}
