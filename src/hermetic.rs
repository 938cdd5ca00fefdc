//! Hermetic runner (§4.H): fixed epoch, secret scrubbing, pinned worker
//! count, and a best-effort whole-process network isolation assertion.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use tracing::{info, warn};

use crate::config::{BuildInfo, Config};

/// Prefixes and names of environment variables the runner scrubs before
/// any plugin runs. Deliberately broad: it is cheaper to over-clear than
/// to leak a credential into a build log or a sandboxed child's inherited
/// environment (sandboxed children get an explicitly empty environment
/// regardless — see `sandbox.rs` — this scrub protects in-process plugins
/// and anything that shells out from the driver itself).
const SECRET_ENV_PREFIXES: &[&str] = &[
    "AWS_", "GCP_", "AZURE_", "GITHUB_TOKEN", "GITLAB_TOKEN", "NPM_TOKEN",
    "DOCKER_", "SSH_", "GPG_", "API_KEY", "_SECRET", "_KEY", "_TOKEN", "_PASSWORD",
];

/// Read the fixed build epoch from `BUILD_EPOCH`, falling back to the
/// current wall-clock time only when unset (non-hermetic, logged loudly).
#[must_use]
pub fn build_epoch() -> DateTime<Utc> {
    std::env::var("BUILD_EPOCH")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(|| {
            warn!("BUILD_EPOCH not set; build will not be reproducible");
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| Utc.timestamp_opt(i64::try_from(d.as_secs()).unwrap_or(0), 0).single().unwrap_or_default())
                .unwrap_or_default()
        })
}

/// Read the source commit identifier from `BUILD_COMMIT`, defaulting to
/// `"unknown"`.
#[must_use]
pub fn build_commit() -> String {
    std::env::var("BUILD_COMMIT").unwrap_or_else(|_| "unknown".to_string())
}

/// Clear every environment variable whose name matches a secret-like
/// prefix or suffix. Runs once, before any plugin (in-process or
/// sandboxed) executes.
pub fn scrub_environment() {
    let to_remove: Vec<String> = std::env::vars()
        .map(|(k, _)| k)
        .filter(|key| {
            let upper = key.to_ascii_uppercase();
            SECRET_ENV_PREFIXES
                .iter()
                .any(|pat| upper.starts_with(pat) || upper.ends_with(pat))
        })
        .collect();
    for key in &to_remove {
        std::env::remove_var(key);
    }
    if !to_remove.is_empty() {
        info!(count = to_remove.len(), "scrubbed secret-like environment variables");
    }
}

/// Attempt to place the whole build process in a fresh network namespace.
/// Returns whether the kernel actually asserted isolation (`true`) versus
/// the runner merely requesting it and falling back to per-plugin sandbox
/// probes for the guarantees that matter (`false`).
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
#[must_use]
pub fn assert_network_isolation() -> bool {
    // SAFETY: called once, early in `main`, before any other thread is
    // spawned; `unshare(CLONE_NEWNET)` only affects the calling process.
    let rc = unsafe { libc::unshare(libc::CLONE_NEWNET) };
    if rc == 0 {
        info!("kernel asserted network namespace isolation for the build process");
        true
    } else {
        warn!("unshare(CLONE_NEWNET) unavailable; relying on per-plugin sandbox probes");
        false
    }
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn assert_network_isolation() -> bool {
    warn!("network namespace isolation is only implemented on Linux; relying on per-plugin sandbox probes");
    false
}

/// Build a [`rayon::ThreadPool`] sized per configuration, recording whether
/// the count was derived.
#[must_use]
pub fn build_thread_pool(config: &Config) -> (rayon::ThreadPool, usize, bool) {
    let (workers, derived) = config.workers.resolve();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .expect("failed to build a bounded rayon thread pool");
    (pool, workers, derived)
}

/// Assemble the [`BuildInfo`] record written alongside the output.
#[must_use]
pub fn build_info(config: &Config, workers: usize, workers_derived: bool, network_isolation_asserted: bool) -> BuildInfo {
    BuildInfo {
        timestamp: build_epoch().timestamp(),
        commit: build_commit(),
        runner_version: env!("CARGO_PKG_VERSION").to_string(),
        environment_fingerprint: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        network_isolation_asserted,
        workers,
        workers_derived,
        autolink_enabled: config.autolink,
    }
}
