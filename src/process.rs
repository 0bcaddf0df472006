//! Process operations behind a trait seam

use crate::error::ManagerError;
use crate::scanner::{self, DiscoveredInstance};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Arguments for spawning a llama-server process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub binary: PathBuf,
    pub model_path: PathBuf,
    pub port: u16,
    pub host: String,
}

/// OS-level process operations used by the lifecycle manager.
#[async_trait]
pub trait ProcessDriver: Send + Sync {
    /// Spawn a detached server process and return its pid.
    async fn spawn_server(&self, spec: &SpawnSpec) -> Result<u32, ManagerError>;

    /// Send a termination signal to a pid.
    fn terminate(&self, pid: u32) -> anyhow::Result<()>;

    /// Whether the pid currently exists (zombies count as dead).
    async fn is_alive(&self, pid: u32) -> bool;

    /// Discover external server instances, excluding the given pids.
    async fn scan_servers(&self, exclude: HashSet<u32>) -> Vec<DiscoveredInstance>;

    /// Resident memory in MB; 0.0 when unknown.
    async fn memory_mb(&self, pid: u32) -> f64;
}

// ============================================================================
// Production implementation
// ============================================================================

/// Production driver: tokio spawn, signals, sysinfo scans.
pub struct SystemProcessDriver;

impl SystemProcessDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemProcessDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessDriver for SystemProcessDriver {
    async fn spawn_server(&self, spec: &SpawnSpec) -> Result<u32, ManagerError> {
        let mut cmd = Command::new(&spec.binary);
        cmd.arg("-m")
            .arg(&spec.model_path)
            .arg("--port")
            .arg(spec.port.to_string())
            .arg("--host")
            .arg(&spec.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // The server must outlive this controller.
            .kill_on_drop(false);

        // Own process group, so signals aimed at the controller's terminal
        // never reach the server.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ManagerError::SpawnFailed {
            message: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| ManagerError::SpawnFailed {
            message: "child exited before a pid could be read".to_string(),
        })?;

        tracing::info!(
            pid = pid,
            model = %spec.model_path.display(),
            port = spec.port,
            host = %spec.host,
            "llama-server spawned"
        );

        // Reap only. Lifecycle decisions come from the registry and the
        // process table, never from this handle.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        Ok(pid)
    }

    fn terminate(&self, pid: u32) -> anyhow::Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                .map_err(|e| anyhow::anyhow!("failed to signal pid {}: {}", pid, e))
        }

        #[cfg(not(unix))]
        {
            use sysinfo::{Pid, System};

            let mut sys = System::new();
            if !sys.refresh_process(Pid::from_u32(pid)) {
                anyhow::bail!("failed to signal pid {}: no such process", pid);
            }
            match sys.process(Pid::from_u32(pid)) {
                Some(process) if process.kill() => Ok(()),
                _ => anyhow::bail!("failed to signal pid {}", pid),
            }
        }
    }

    async fn is_alive(&self, pid: u32) -> bool {
        scanner::is_alive(pid).await
    }

    async fn scan_servers(&self, exclude: HashSet<u32>) -> Vec<DiscoveredInstance> {
        scanner::scan_servers(exclude).await
    }

    async fn memory_mb(&self, pid: u32) -> f64 {
        scanner::memory_mb_of(pid).await
    }
}

// ============================================================================
// Mock implementation for testing
// ============================================================================
