//! Port reaping
//!
//! Finds every process holding a port and force-kills it. A worker reuses
//! one port for all of its jobs, so this runs before the first job and after
//! every job, whatever the outcome.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::constants::timeouts;

/// Port reaper errors
#[derive(Debug, thiserror::Error)]
pub enum ReaperError {
    #[error("Failed to find processes on port {port}: {message}")]
    Lookup { port: u16, message: String },
    #[error("Failed to kill process {pid} on port {port}: {message}")]
    Kill { pid: u32, port: u16, message: String },
}

/// Frees a port by terminating whatever holds it
#[async_trait]
pub trait PortReaper: Send + Sync {
    /// Kill every process bound to `port`; a free port is not an error
    async fn clear_port(&self, port: u16) -> Result<(), ReaperError>;
}

/// Reaper built on `lsof` and `kill`, with a `/proc` scan when `lsof` is missing
pub struct SystemPortReaper {
    command_timeout: Duration,
    confirm_attempts: u32,
    confirm_interval: Duration,
}

impl Default for SystemPortReaper {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemPortReaper {
    pub fn new() -> Self {
        Self {
            command_timeout: Duration::from_secs(timeouts::REAPER_COMMAND_SECS),
            confirm_attempts: 20,
            confirm_interval: Duration::from_millis(100),
        }
    }

    async fn run(&self, program: &Path, args: &[&str]) -> Result<std::process::Output, String> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to run {}: {}", program.display(), e))?;

        match tokio::time::timeout(self.command_timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| e.to_string()),
            Err(_) => Err(format!(
                "{} timed out after {:?}",
                program.display(),
                self.command_timeout
            )),
        }
    }

    async fn list_pids(&self, port: u16) -> Result<Vec<u32>, ReaperError> {
        let lsof = match which::which("lsof") {
            Ok(path) => path,
            Err(_) => {
                log::debug!("lsof not found, scanning /proc for port {}", port);
                return tokio::task::spawn_blocking(move || proc_listening_pids(port))
                    .await
                    .map_err(|e| ReaperError::Lookup {
                        port,
                        message: e.to_string(),
                    });
            }
        };

        let target = format!("-i:{}", port);
        let output = self
            .run(&lsof, &["-t", &target])
            .await
            .map_err(|message| ReaperError::Lookup { port, message })?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        // lsof exits 1 when nothing matches
        if output.status.success() || (output.status.code() == Some(1) && stdout.trim().is_empty()) {
            Ok(parse_pid_list(&stdout))
        } else {
            Err(ReaperError::Lookup {
                port,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn kill(&self, pid: u32, port: u16) -> Result<(), ReaperError> {
        log::info!("Killing process {} on port {}", pid, port);
        let pid_str = pid.to_string();
        let output = self
            .run(Path::new("kill"), &["-9", &pid_str])
            .await
            .map_err(|message| ReaperError::Kill { pid, port, message })?;

        if !output.status.success() && self.is_alive(pid).await {
            return Err(ReaperError::Kill {
                pid,
                port,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        for _ in 0..self.confirm_attempts {
            if !self.is_alive(pid).await {
                return Ok(());
            }
            tokio::time::sleep(self.confirm_interval).await;
        }

        Err(ReaperError::Kill {
            pid,
            port,
            message: "process still alive after SIGKILL".to_string(),
        })
    }

    async fn is_alive(&self, pid: u32) -> bool {
        if is_zombie(pid) {
            return false;
        }
        let pid_str = pid.to_string();
        self.run(Path::new("kill"), &["-0", &pid_str])
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl PortReaper for SystemPortReaper {
    async fn clear_port(&self, port: u16) -> Result<(), ReaperError> {
        let own_pid = std::process::id();
        let pids: Vec<u32> = self
            .list_pids(port)
            .await?
            .into_iter()
            .filter(|pid| *pid != own_pid)
            .collect();

        if pids.is_empty() {
            log::debug!("Port {} is clear", port);
            return Ok(());
        }

        for pid in pids {
            self.kill(pid, port).await?;
        }
        Ok(())
    }
}

/// Parse `lsof -t` output, one PID per line
pub fn parse_pid_list(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// A killed child of a dead parent can linger as a zombie that `kill -0` still sees
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            // State follows the parenthesised command name
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

/// Processes owning a LISTEN socket on `port`, from `/proc/net/tcp{,6}`
#[cfg(target_os = "linux")]
fn proc_listening_pids(port: u16) -> Vec<u32> {
    let mut inodes = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(contents) = std::fs::read_to_string(table) {
            inodes.extend(contents.lines().skip(1).filter_map(|line| listening_inode(line, port)));
        }
    }

    if inodes.is_empty() {
        return Vec::new();
    }
    pids_owning_inodes(&inodes)
}

#[cfg(not(target_os = "linux"))]
fn proc_listening_pids(_port: u16) -> Vec<u32> {
    Vec::new()
}

/// Socket inode of a `/proc/net/tcp` line listening on `target_port`
///
/// Format: `sl local_address rem_address st ... uid timeout inode ...`
/// with the local port in hex and state `0A` meaning LISTEN.
fn listening_inode(line: &str, target_port: u16) -> Option<u64> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return None;
    }

    let (_, port_hex) = parts[1].rsplit_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    if port != target_port || parts[3] != "0A" {
        return None;
    }

    let inode: u64 = parts[9].parse().ok()?;
    (inode != 0).then_some(inode)
}

/// Scan `/proc/*/fd` for `socket:[inode]` links
#[cfg(target_os = "linux")]
fn pids_owning_inodes(inodes: &[u64]) -> Vec<u32> {
    let mut pids = Vec::new();
    let Ok(proc_dir) = std::fs::read_dir("/proc") else {
        return pids;
    };

    for entry in proc_dir.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };

        let owns = fds.flatten().any(|fd| {
            std::fs::read_link(fd.path())
                .ok()
                .and_then(|link| {
                    let link = link.to_string_lossy().into_owned();
                    link.strip_prefix("socket:[")?
                        .strip_suffix(']')?
                        .parse::<u64>()
                        .ok()
                })
                .is_some_and(|inode| inodes.contains(&inode))
        });
        if owns {
            pids.push(pid);
        }
    }

    pids
}
