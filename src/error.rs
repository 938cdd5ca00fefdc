//! Distinct, catchable error kinds for the build pipeline.
//!
//! Every stage failure must be attributable to one of these kinds so that
//! operators and CI can branch on failure class (see the exit code mapping
//! in `main.rs`).

use std::path::PathBuf;

use thiserror::Error;

/// Top-level build error. Each variant maps to a distinct process exit code.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Missing directories, duplicate plugin names, invalid priority, unreadable templates.
    #[error("configuration: {0}")]
    Configuration(String),

    /// Front-matter parse failure, slug collision, non-UTF-8 body.
    #[error("content: {path}: {reason}")]
    Content {
        /// Offending source file.
        path: PathBuf,
        /// Human-readable reason.
        reason: String,
    },

    /// A plugin returned an error object or exited non-zero.
    #[error("plugin: {name}: {reason}")]
    Plugin {
        /// Plugin name.
        name: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Sandbox precondition failure (see [`SandboxError`]).
    #[error("sandbox: {0}")]
    Sandbox(#[from] SandboxError),

    /// Output guard matched a forbidden construct (see [`GuardError`]).
    #[error("guard: {0}")]
    Guard(#[from] GuardError),

    /// Manifest mismatch in verify mode (see [`IntegrityError`]).
    #[error("integrity: {0}")]
    Integrity(#[from] IntegrityError),

    /// Filesystem errors, with the offending path attached when known.
    #[error("io: {path}: {source}")]
    Io {
        /// Offending path, or `<unknown>` when not applicable.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    /// Process exit code for this error, per the CLI contract.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 5,
            Self::Guard(_) => 2,
            Self::Integrity(_) => 3,
            Self::Sandbox(_) => 4,
            Self::Content { .. } | Self::Plugin { .. } | Self::Io { .. } => 1,
        }
    }

    /// Attach a path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Sandbox precondition and lifecycle failures.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The post-fork reachability probe succeeded when it must fail.
    #[error("network reachability probe succeeded inside the sandbox for plugin '{plugin}'")]
    NetworkReachable {
        /// Offending plugin name.
        plugin: String,
    },

    /// The host does not support the isolation primitive the policy requires.
    #[error("network namespace isolation unsupported on this host for plugin '{plugin}'")]
    NamespaceUnsupported {
        /// Offending plugin name.
        plugin: String,
    },

    /// The child did not exit within its wall-clock budget.
    #[error("plugin '{plugin}' exceeded its {timeout_secs}s wall-clock timeout")]
    Timeout {
        /// Offending plugin name.
        plugin: String,
        /// Configured timeout, in seconds.
        timeout_secs: u64,
    },

    /// The child exited non-zero, or the output filter rejected its response.
    #[error("plugin '{plugin}' failed: {reason}")]
    Precondition {
        /// Offending plugin name.
        plugin: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// A single output guard violation.
#[derive(Debug, Error)]
#[error("forbidden construct '{rule}' in {path}: {excerpt}")]
pub struct GuardError {
    /// Path of the offending artefact, relative to the output directory.
    pub path: PathBuf,
    /// Identifier of the matched rule.
    pub rule: String,
    /// Single-line excerpt around the match, truncated.
    pub excerpt: String,
}

/// Manifest verification failures.
#[derive(Debug, Error)]
pub enum IntegrityError {
    /// A file listed in the manifest is missing from the output directory.
    #[error("missing {0} file(s) present in manifest but absent from output")]
    Missing(usize),

    /// A file exists in the output directory but is not listed in the manifest.
    #[error("{0} extra file(s) present in output but absent from manifest")]
    Extra(usize),

    /// A file's digest does not match the manifest.
    #[error("{0} file(s) with a digest mismatch")]
    Mismatch(usize),
}
