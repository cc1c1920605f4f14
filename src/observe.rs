//! Per-run observability records.
//!
//! Every VM launch and in-sandbox execution writes one JSON document
//! with stable field names; readers ignore unknown fields. The record
//! is advisory: failures to write it never fail the run.

use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};

pub const RUN_RECORD_FILE: &str = "run-observability.json";

/// Millisecond timings per provisioning/execution stage. A zero value
/// means the stage did not run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimings {
    #[serde(default)]
    pub policy_resolve_ms: u64,
    #[serde(default)]
    pub rootfs_copy_ms: u64,
    #[serde(default)]
    pub vm_start_ms: u64,
    #[serde(default)]
    pub vm_ready_ms: u64,
    #[serde(default)]
    pub vsock_wait_ms: u64,
    #[serde(default)]
    pub guest_exec_ms: u64,
    #[serde(default)]
    pub cleanup_ms: u64,
    #[serde(default)]
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub backend: String,
    pub image_ref: String,
    pub image_digest: String,
    pub cache_hit: bool,
    /// `provision` or `exec`.
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_dir: Option<String>,
    pub timings_ms: StageTimings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_error: Option<String>,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>, backend: impl Into<String>, phase: &str) -> Self {
        Self {
            run_id: run_id.into(),
            backend: backend.into(),
            image_ref: String::new(),
            image_digest: String::new(),
            cache_hit: false,
            phase: phase.to_string(),
            run_dir: None,
            timings_ms: StageTimings::default(),
            exit_code: None,
            guest_error: None,
        }
    }

    /// Best-effort write into the run directory.
    pub fn write_to(&self, run_dir: &Path) {
        let path = run_dir.join(RUN_RECORD_FILE);
        match serde_json::to_vec_pretty(self) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!(path = %path.display(), error = %e, "observability record not written");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "observability record not encoded");
            }
        }
    }
}

/// Stopwatch for one stage.
pub struct Stage(Instant);

impl Stage {
    pub fn start() -> Self {
        Self(Instant::now())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_with_stable_names() {
        let mut record = RunRecord::new("run-1", "firecracker", "provision");
        record.image_ref = "ghcr.io/example/base@sha256:abcd".into();
        record.cache_hit = true;
        record.timings_ms.vm_start_ms = 42;
        record.timings_ms.total_ms = 431;

        let json = serde_json::to_string(&record).unwrap();
        for field in [
            "\"run_id\"",
            "\"backend\"",
            "\"image_ref\"",
            "\"cache_hit\"",
            "\"phase\"",
            "\"timings_ms\"",
            "\"vm_start_ms\"",
            "\"total_ms\"",
        ] {
            assert!(json.contains(field), "{field} missing from {json}");
        }

        let back: RunRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timings_ms.vm_start_ms, 42);
        assert!(back.cache_hit);
    }

    #[test]
    fn readers_ignore_unknown_fields() {
        let json = r#"{
            "run_id": "run-2",
            "backend": "firecracker",
            "image_ref": "",
            "image_digest": "",
            "cache_hit": false,
            "phase": "exec",
            "timings_ms": { "guest_exec_ms": 7, "an_unknown_timing": 1 },
            "some_future_field": {"x": 1}
        }"#;
        let record: RunRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.timings_ms.guest_exec_ms, 7);
        assert_eq!(record.phase, "exec");
    }

    #[test]
    fn write_to_creates_the_record_file() {
        let dir = tempfile::tempdir().unwrap();
        let record = RunRecord::new("run-3", "firecracker", "provision");
        record.write_to(dir.path());
        let written = std::fs::read_to_string(dir.path().join(RUN_RECORD_FILE)).unwrap();
        assert!(written.contains("run-3"));
    }
}
