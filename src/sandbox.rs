//! Plugin sandbox (§4.D): hosts plugins that are external executables.
//!
//! Generalises the pack's simple child-process plugin runners (stdin JSON
//! in, stdout JSON out) into the length-prefixed binary envelope of §6,
//! adding the preconditions the spec treats as fatal: network denial
//! verified by a reachability probe, dropped privileges, resource limits,
//! and a wall-clock timeout. The OS-level isolation primitives
//! (`uid`/`gid` drop, `unshare`, `setrlimit`) require `unsafe` to register
//! with `std::process::Command`; this is the one module in the crate where
//! `#[allow(unsafe_code)]` is granted (see `DESIGN.md`).

#![allow(unsafe_code)]

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{BuildError, SandboxError};
use crate::registry::{Capability, PluginDescriptor};
use crate::site::{Post, RenderContext};

use super::plugins::Plugin;

/// Well-known external address used for the post-fork reachability probe.
/// Any successful connection here means network isolation failed.
const PROBE_ADDRESS: &str = "1.1.1.1:443";
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
/// Bound on how long the probe waits for the child to actually enter its
/// own network namespace (it is created by a `pre_exec` closure that runs
/// after `fork` but is not guaranteed complete the instant `spawn` returns).
const NAMESPACE_ENTRY_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for one sandboxed plugin.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Path to the plugin executable.
    pub binary: PathBuf,
    /// Unprivileged user id to run the child as.
    pub uid: u32,
    /// Unprivileged group id to run the child as.
    pub gid: u32,
    /// Wall-clock timeout. Defaults to 30s per §4.D.
    pub timeout: Duration,
    /// CPU time limit, seconds.
    pub cpu_seconds: u64,
    /// Address-space limit, bytes.
    pub memory_bytes: u64,
    /// Open file descriptor limit.
    pub max_fds: u64,
    /// Writable scratch directory for the child's working directory.
    pub scratch_dir: PathBuf,
    /// Opaque plugin configuration forwarded in the request envelope.
    pub plugin_config: Value,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::new(),
            uid: 65534,
            gid: 65534,
            timeout: Duration::from_secs(30),
            cpu_seconds: 10,
            memory_bytes: 256 * 1024 * 1024,
            max_fds: 64,
            scratch_dir: std::env::temp_dir(),
            plugin_config: Value::Null,
        }
    }
}

/// Request envelope sent to the plugin on stdin (§6).
#[derive(Debug, Serialize)]
struct SandboxRequest<'a> {
    op: &'a str,
    post: Option<SandboxPost>,
    config: &'a Value,
}

#[derive(Debug, Serialize)]
struct SandboxPost {
    slug: String,
    title: String,
    body: String,
}

/// Response envelope read from the plugin on stdout (§6).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SandboxResponse {
    Ok { body: String, #[serde(default)] metadata: Value },
    Err { error: String },
}

/// A [`Plugin`] implementation whose hooks run inside an isolated child
/// process rather than in-process.
pub struct SandboxedPlugin {
    descriptor: PluginDescriptor,
    config: SandboxConfig,
}

impl SandboxedPlugin {
    /// Wrap an external binary as a plugin advertising the given capabilities.
    #[must_use]
    pub fn new(name: String, priority: i32, capabilities: HashSet<Capability>, config: SandboxConfig) -> Self {
        Self {
            descriptor: PluginDescriptor {
                name,
                version: "external".to_string(),
                priority,
                capabilities,
            },
            config,
        }
    }

    fn invoke(&self, op: &str, post: Option<&Post>) -> Result<Vec<u8>, BuildError> {
        let request = SandboxRequest {
            op,
            post: post.map(|p| SandboxPost {
                slug: p.slug.clone(),
                title: p.meta.title.clone(),
                body: p.rendered_body_str(),
            }),
            config: &self.config.plugin_config,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| BuildError::Plugin { name: self.descriptor.name.clone(), reason: e.to_string() })?;

        let mut child = self.spawn()?;
        self.probe_network_denied(&mut child)?;
        self.write_framed(&mut child, &payload)?;
        let response_bytes = self.read_framed_with_timeout(&mut child)?;

        let response: SandboxResponse = serde_json::from_slice(&response_bytes).map_err(|e| BuildError::Plugin {
            name: self.descriptor.name.clone(),
            reason: format!("malformed response envelope: {e}"),
        })?;

        match response {
            SandboxResponse::Ok { body, .. } => Ok(body.into_bytes()),
            SandboxResponse::Err { error } => Err(BuildError::Plugin {
                name: self.descriptor.name.clone(),
                reason: error,
            }),
        }
    }

    fn spawn(&self) -> Result<Child, BuildError> {
        let mut command = Command::new(&self.config.binary);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.config.scratch_dir)
            .env_clear()
            .env("PATH", "/usr/bin:/bin")
            .env("HOME", &self.config.scratch_dir)
            .env("SECUREBLOG_SANDBOX_MODULE_GRAPH", "0")
            .env("SECUREBLOG_SANDBOX_WORKSPACE", "0");

        let uid = self.config.uid;
        let gid = self.config.gid;
        let cpu_seconds = self.config.cpu_seconds;
        let memory_bytes = self.config.memory_bytes;
        let max_fds = self.config.max_fds;

        // SAFETY: this closure runs in the child between fork and exec. It
        // only calls async-signal-safe libc functions (setrlimit, setgid,
        // setuid, unshare) and never allocates or touches Rust runtime
        // state, satisfying `pre_exec`'s safety contract.
        unsafe {
            command.pre_exec(move || {
                apply_rlimits(cpu_seconds, memory_bytes, max_fds)?;
                deny_network_namespace()?;
                drop_privileges(uid, gid)?;
                Ok(())
            });
        }

        command
            .spawn()
            .map_err(|e| BuildError::Sandbox(SandboxError::Precondition {
                plugin: self.descriptor.name.clone(),
                reason: format!("failed to spawn: {e}"),
            }))
    }

    /// Verify the post-fork reachability probe failed. The child itself
    /// does not run this probe (it would require cooperation from
    /// untrusted plugin code); instead the sandbox joins the child's own
    /// network namespace via `setns` and dials the probe address from
    /// there, confirming the *child's* isolation rather than the parent's,
    /// before any plugin bytes are exchanged.
    fn probe_network_denied(&self, child: &mut Child) -> Result<(), BuildError> {
        match probe_reachable_in_namespace(child.id()) {
            Ok(true) => {
                let _ = child.kill();
                Err(SandboxError::NetworkReachable { plugin: self.descriptor.name.clone() }.into())
            }
            Ok(false) => {
                debug!(plugin = %self.descriptor.name, "network reachability probe failed as required");
                Ok(())
            }
            Err(err) => {
                let _ = child.kill();
                warn!(plugin = %self.descriptor.name, error = %err, "unable to verify the sandboxed child's network namespace isolation");
                Err(SandboxError::NamespaceUnsupported { plugin: self.descriptor.name.clone() }.into())
            }
        }
    }

    fn write_framed(&self, child: &mut Child, payload: &[u8]) -> Result<(), BuildError> {
        let stdin = child.stdin.as_mut().ok_or_else(|| BuildError::Plugin {
            name: self.descriptor.name.clone(),
            reason: "plugin stdin unavailable".to_string(),
        })?;
        let len = u32::try_from(payload.len()).map_err(|_| BuildError::Plugin {
            name: self.descriptor.name.clone(),
            reason: "request payload too large".to_string(),
        })?;
        stdin
            .write_all(&len.to_be_bytes())
            .and_then(|()| stdin.write_all(payload))
            .map_err(|e| BuildError::io(&self.config.binary, e))
    }

    fn read_framed_with_timeout(&self, child: &mut Child) -> Result<Vec<u8>, BuildError> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| BuildError::io(&self.config.binary, e))?
            {
                let mut stdout = Vec::new();
                if let Some(mut out) = child.stdout.take() {
                    let _ = out.read_to_end(&mut stdout);
                }
                if !status.success() {
                    let mut stderr = String::new();
                    if let Some(mut err) = child.stderr.take() {
                        let _ = err.read_to_string(&mut stderr);
                    }
                    return Err(SandboxError::Precondition {
                        plugin: self.descriptor.name.clone(),
                        reason: format!("exited with {status}: {}", stderr.trim()),
                    }
                    .into());
                }
                return parse_length_prefixed(&stdout).ok_or_else(|| {
                    SandboxError::Precondition {
                        plugin: self.descriptor.name.clone(),
                        reason: "malformed length-prefixed response".to_string(),
                    }
                    .into()
                });
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                return Err(SandboxError::Timeout {
                    plugin: self.descriptor.name.clone(),
                    timeout_secs: self.config.timeout.as_secs(),
                }
                .into());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

fn parse_length_prefixed(buf: &[u8]) -> Option<Vec<u8>> {
    if buf.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    buf.get(4..4 + len).map(<[u8]>::to_vec)
}

fn apply_rlimits(cpu_seconds: u64, memory_bytes: u64, max_fds: u64) -> std::io::Result<()> {
    rlimit::setrlimit(rlimit::Resource::CPU, cpu_seconds, cpu_seconds)?;
    rlimit::setrlimit(rlimit::Resource::AS, memory_bytes, memory_bytes)?;
    rlimit::setrlimit(rlimit::Resource::NOFILE, max_fds, max_fds)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn deny_network_namespace() -> std::io::Result<()> {
    // SAFETY: CLONE_NEWNET only affects the calling (about-to-exec) child;
    // this runs before any other thread exists in the child.
    let rc = unsafe { libc::unshare(libc::CLONE_NEWNET) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn deny_network_namespace() -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "network namespace isolation is only implemented on Linux",
    ))
}

/// Join `pid`'s network namespace, attempt [`PROBE_ADDRESS`], then restore
/// the caller's own namespace regardless of outcome. Returns `Ok(true)` if
/// the address was reachable from inside the child's namespace (isolation
/// failed), `Ok(false)` if it was not (isolation held), and `Err` if the
/// child's isolation could not be verified at all (host lacks namespace
/// support, or the probing process lacks the privilege to join it).
#[cfg(target_os = "linux")]
fn probe_reachable_in_namespace(pid: u32) -> std::io::Result<bool> {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    wait_for_distinct_namespace(pid, Instant::now() + NAMESPACE_ENTRY_TIMEOUT)?;

    let self_ns = File::open("/proc/self/ns/net")?;
    let child_ns = File::open(format!("/proc/{pid}/ns/net"))?;

    // SAFETY: `setns` here only changes which network namespace this
    // thread is a member of; both namespace file descriptors stay open
    // (via RAII) until after the probe and the restore below.
    let join_rc = unsafe { libc::setns(child_ns.as_raw_fd(), libc::CLONE_NEWNET) };
    if join_rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let reachable = TcpStream::connect_timeout(&PROBE_ADDRESS.parse().expect("valid probe address"), PROBE_TIMEOUT).is_ok();

    // SAFETY: restore the caller's original namespace unconditionally so a
    // failed probe never leaves the build process itself network-isolated.
    let restore_rc = unsafe { libc::setns(self_ns.as_raw_fd(), libc::CLONE_NEWNET) };
    if restore_rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(reachable)
}

#[cfg(not(target_os = "linux"))]
fn probe_reachable_in_namespace(_pid: u32) -> std::io::Result<bool> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "network namespace probing is only implemented on Linux",
    ))
}

/// Poll `/proc/<pid>/ns/net` until it names a different namespace than
/// `/proc/self/ns/net`, or `deadline` passes. The child's `pre_exec`
/// closure calls `unshare(CLONE_NEWNET)` before `exec`, but `Command::spawn`
/// can return before that closure has run.
#[cfg(target_os = "linux")]
fn wait_for_distinct_namespace(pid: u32, deadline: Instant) -> std::io::Result<()> {
    let self_ns = std::fs::read_link("/proc/self/ns/net")?;
    loop {
        let child_ns = std::fs::read_link(format!("/proc/{pid}/ns/net"))?;
        if child_ns != self_ns {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "child did not enter a distinct network namespace before the deadline",
            ));
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn drop_privileges(uid: u32, gid: u32) -> std::io::Result<()> {
    // SAFETY: setgid before setuid, as dropping uid first would forfeit the
    // privilege needed to change gid.
    let gid_rc = unsafe { libc::setgid(gid) };
    if gid_rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let uid_rc = unsafe { libc::setuid(uid) };
    if uid_rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

impl Plugin for SandboxedPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn pre_build(&self, _content_dir: &std::path::Path) -> Result<(), BuildError> {
        if self.descriptor.capabilities.contains(&Capability::Build) {
            self.invoke("pre_build", None)?;
        }
        Ok(())
    }

    fn transform_content(&self, post: &Post, body: Vec<u8>) -> Result<Vec<u8>, BuildError> {
        if !self.descriptor.capabilities.contains(&Capability::Content) {
            return Ok(body);
        }
        let mut scratch = post.clone();
        scratch.rendered_body = body;
        self.invoke("content", Some(&scratch))
    }

    fn transform_security(&self, post: &Post, body: Vec<u8>) -> Result<Vec<u8>, BuildError> {
        if !self.descriptor.capabilities.contains(&Capability::Security) {
            return Ok(body);
        }
        let mut scratch = post.clone();
        scratch.rendered_body = body;
        self.invoke("security", Some(&scratch))
    }

    fn pre_render(&self, ctx: &RenderContext<'_>) -> Result<(), BuildError> {
        if self.descriptor.capabilities.contains(&Capability::Render) {
            self.invoke("pre_render", ctx.post)?;
        }
        Ok(())
    }

    fn post_render(&self, bytes: Vec<u8>) -> Result<Vec<u8>, BuildError> {
        if !self.descriptor.capabilities.contains(&Capability::Render) {
            return Ok(bytes);
        }
        warn!(plugin = %self.descriptor.name, "post_render over the sandbox boundary re-wraps bytes as a synthetic post");
        let synthetic = Post {
            meta: crate::site::PostMeta {
                title: String::new(),
                date: chrono::Utc::now(),
                tags: Vec::new(),
                slug: String::new(),
                draft: false,
                extra: Default::default(),
            },
            slug: String::new(),
            raw_body: Vec::new(),
            rendered_body: bytes,
            content_hash: None,
            source: PathBuf::new(),
        };
        self.invoke("post_render", Some(&synthetic))
    }

    fn generate(&self, posts: &[Post], output_dir: &std::path::Path) -> Result<(), BuildError> {
        if !self.descriptor.capabilities.contains(&Capability::Output) {
            return Ok(());
        }
        for post in posts {
            self.invoke("output", Some(post))?;
        }
        let _ = output_dir;
        Ok(())
    }

    fn post_build(&self, _output_dir: &std::path::Path) -> Result<(), BuildError> {
        if self.descriptor.capabilities.contains(&Capability::Build) {
            self.invoke("post_build", None)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_length_prefixed_roundtrip() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&5_u32.to_be_bytes());
        buf.extend_from_slice(b"hello");
        assert_eq!(parse_length_prefixed(&buf), Some(b"hello".to_vec()));
    }

    #[test]
    fn parse_length_prefixed_rejects_short_buffer() {
        assert_eq!(parse_length_prefixed(&[0, 0]), None);
    }

    #[test]
    fn parse_length_prefixed_rejects_truncated_payload() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10_u32.to_be_bytes());
        buf.extend_from_slice(b"short");
        assert_eq!(parse_length_prefixed(&buf), None);
    }
}
