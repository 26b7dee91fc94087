//! Thin seam over the `ip(8)` tool.
//!
//! Wiring and routing talk to the kernel through [`IpRunner`] so they can be
//! exercised without root by a recording fake.

use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum IpError {
    #[error("network namespace {path} is unreachable: {reason}")]
    NamespaceUnreachable { path: PathBuf, reason: String },

    #[error("failed to execute ip {command}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("ip {command} failed: {stderr}")]
    Failed { command: String, stderr: String },

    #[error("unexpected output from ip {command}: {reason}")]
    Output { command: String, reason: String },
}

impl IpError {
    /// The object being changed or removed does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            IpError::Failed { stderr, .. } => {
                stderr.contains("Cannot find device")
                    || stderr.contains("No such file or directory")
                    || stderr.contains("No such process")
                    || stderr.contains("does not exist")
            }
            _ => false,
        }
    }
}

/// Runs `ip` subcommands on the host or inside a network namespace.
pub trait IpRunner {
    /// Run `ip <args>` and return its stdout. When `netns` is given the
    /// command runs inside that namespace.
    fn run(&self, netns: Option<&Path>, args: &[&str]) -> Result<String, IpError>;
}

impl<R: IpRunner + ?Sized> IpRunner for &R {
    fn run(&self, netns: Option<&Path>, args: &[&str]) -> Result<String, IpError> {
        (**self).run(netns, args)
    }
}

/// The real `ip` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpCommand;

impl IpRunner for IpCommand {
    fn run(&self, netns: Option<&Path>, args: &[&str]) -> Result<String, IpError> {
        match netns {
            Some(path) => in_netns(path, || exec(args)),
            None => exec(args),
        }
    }
}

fn exec(args: &[&str]) -> Result<String, IpError> {
    let command = args.join(" ");
    debug!("ip {}", command);

    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|source| IpError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(IpError::Failed {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Execute a function inside a network namespace, switching the calling
/// thread back to its original namespace afterwards.
pub fn in_netns<T, F>(netns_path: &Path, f: F) -> Result<T, IpError>
where
    F: FnOnce() -> Result<T, IpError>,
{
    let unreachable = |reason: String| IpError::NamespaceUnreachable {
        path: netns_path.to_path_buf(),
        reason,
    };

    let current = File::open("/proc/thread-self/ns/net")
        .map_err(|e| unreachable(format!("cannot open current namespace: {}", e)))?;
    let target = File::open(netns_path).map_err(|e| unreachable(e.to_string()))?;

    setns(target.as_raw_fd(), CloneFlags::CLONE_NEWNET)
        .map_err(|e| unreachable(format!("setns: {}", e)))?;

    let result = f();

    setns(current.as_raw_fd(), CloneFlags::CLONE_NEWNET)
        .map_err(|e| unreachable(format!("failed to restore original namespace: {}", e)))?;

    result
}

/// MAC address of `ifname`, read from `ip -j link show`.
pub fn link_mac<R: IpRunner>(ip: &R, netns: Option<&Path>, ifname: &str) -> Result<String, IpError> {
    let args = ["-j", "link", "show", "dev", ifname];
    let out = ip.run(netns, &args)?;
    let command = args.join(" ");

    let links: Vec<serde_json::Value> =
        serde_json::from_str(&out).map_err(|e| IpError::Output {
            command: command.clone(),
            reason: e.to_string(),
        })?;

    links
        .first()
        .and_then(|link| link.get("address"))
        .and_then(|addr| addr.as_str())
        .map(str::to_string)
        .ok_or(IpError::Output {
            command,
            reason: format!("no address reported for {}", ifname),
        })
}

/// Whether `ifname` is administratively and operationally up.
pub fn link_is_up<R: IpRunner>(ip: &R, netns: Option<&Path>, ifname: &str) -> Result<bool, IpError> {
    let out = ip.run(netns, &["-j", "link", "show", "dev", ifname])?;
    let links: Vec<serde_json::Value> =
        serde_json::from_str(&out).map_err(|e| IpError::Output {
            command: format!("-j link show dev {}", ifname),
            reason: e.to_string(),
        })?;

    Ok(links.first().map_or(false, |link| {
        let flags_up = link
            .get("flags")
            .and_then(|f| f.as_array())
            .map_or(false, |flags| flags.iter().any(|f| f == "UP"));
        let oper = link.get("operstate").and_then(|s| s.as_str());
        flags_up && oper != Some("DOWN")
    }))
}
