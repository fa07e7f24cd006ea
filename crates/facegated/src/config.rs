use facegate_core::models::{ARCFACE_MODEL, SCRFD_MODEL};
use crate::reference::FetchLimits;
use facegate_core::MatchPolicy;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on (default: 0.0.0.0:8080).
    pub bind_addr: SocketAddr,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Identity threshold and liveness bounds.
    ///
    /// The 0.12 identity default was tuned for a different descriptor
    /// extractor. Same-person distances between L2-normalised ArcFace
    /// embeddings are far larger, so with the bundled ONNX models
    /// `FACEGATE_IDENTITY_THRESHOLD` must be retuned or genuine users
    /// will be rejected.
    pub policy: MatchPolicy,
    /// Requests still queued for the engine after this many seconds are
    /// dropped before extraction starts.
    pub verify_timeout_secs: u64,
    /// Timeout for downloading a remote reference image.
    pub fetch_timeout_secs: u64,
    /// Largest remote reference image accepted (default: 10 MiB).
    pub max_fetch_bytes: u64,
    /// Let reference URLs reach private, loopback and link-local hosts.
    /// Off by default; registration URLs are untrusted input.
    pub allow_private_fetch: bool,
    /// Maximum accepted request body size.
    pub max_body_bytes: usize,
    /// Whether to checksum the ONNX models at startup.
    pub verify_models: bool,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACEGATE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facegate_core::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let db_path = std::env::var("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("accounts.db"));

        let defaults = MatchPolicy::default();

        Self {
            bind_addr: std::env::var("FACEGATE_BIND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080))),
            model_dir,
            db_path,
            policy: MatchPolicy {
                identity_threshold: env_f32(
                    "FACEGATE_IDENTITY_THRESHOLD",
                    defaults.identity_threshold,
                ),
                motion_upper_bound: env_f32(
                    "FACEGATE_MOTION_UPPER_BOUND",
                    defaults.motion_upper_bound,
                ),
                shift_lower_bound: env_f32(
                    "FACEGATE_SHIFT_LOWER_BOUND",
                    defaults.shift_lower_bound,
                ),
            },
            verify_timeout_secs: env_u64("FACEGATE_VERIFY_TIMEOUT_SECS", 10),
            fetch_timeout_secs: env_u64("FACEGATE_FETCH_TIMEOUT_SECS", 10),
            max_fetch_bytes: env_u64("FACEGATE_MAX_FETCH_BYTES", 10 * 1024 * 1024),
            allow_private_fetch: std::env::var("FACEGATE_ALLOW_PRIVATE_FETCH")
                .map(|v| v == "1")
                .unwrap_or(false),
            max_body_bytes: env_usize("FACEGATE_MAX_BODY_BYTES", 16 * 1024 * 1024),
            verify_models: std::env::var("FACEGATE_VERIFY_MODELS")
                .map(|v| v != "0")
                .unwrap_or(true),
        }
    }

    /// Download bounds for remote reference images.
    pub fn fetch_limits(&self) -> FetchLimits {
        FetchLimits {
            timeout: Duration::from_secs(self.fetch_timeout_secs),
            max_bytes: self.max_fetch_bytes,
            allow_private_hosts: self.allow_private_fetch,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir.join(SCRFD_MODEL).to_string_lossy().into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir.join(ARCFACE_MODEL).to_string_lossy().into_owned()
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
impl Config {
    /// Defaults suitable for in-process tests: in-memory database, no model checks.
    pub fn for_tests() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            model_dir: PathBuf::from("models"),
            db_path: PathBuf::from(":memory:"),
            policy: MatchPolicy::default(),
            verify_timeout_secs: 10,
            fetch_timeout_secs: 5,
            max_fetch_bytes: 64 * 1024,
            // test image servers bind to loopback
            allow_private_fetch: true,
            max_body_bytes: 1024 * 1024,
            verify_models: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parsers_fall_back_on_garbage() {
        std::env::set_var("FACEGATE_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_f32("FACEGATE_TEST_GARBAGE", 0.12), 0.12);
        assert_eq!(env_u64("FACEGATE_TEST_GARBAGE", 7), 7);
        assert_eq!(env_usize("FACEGATE_TEST_UNSET_KEY", 3), 3);
    }

    #[test]
    fn test_model_paths_join_model_dir() {
        let config = Config::for_tests();
        assert!(config.scrfd_model_path().ends_with("models/det_10g.onnx"));
        assert!(config.arcface_model_path().ends_with("models/w600k_r50.onnx"));
    }

    #[test]
    fn test_fetch_limits_follow_config() {
        let mut config = Config::for_tests();
        config.fetch_timeout_secs = 3;
        config.max_fetch_bytes = 2048;
        config.allow_private_fetch = false;
        let limits = config.fetch_limits();
        assert_eq!(limits.timeout, Duration::from_secs(3));
        assert_eq!(limits.max_bytes, 2048);
        assert!(!limits.allow_private_hosts);
    }
}
