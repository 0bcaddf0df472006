//! OS process-table scanning for externally launched llama-server processes
//!
//! Discovery is best-effort by contract: every entry point here degrades to
//! an empty result (or zero) instead of propagating an error, because the
//! caller's running-models view must never fail outright.

use crate::error::ManagerError;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use sysinfo::{Pid, ProcessStatus, System};

/// A llama-server process found in the process table but not spawned by
/// this controller. Recomputed fresh on every scan; never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredInstance {
    pub pid: u32,
    /// Best-effort; a server launched with an unparseable command line
    /// still shows up as long as its port is detectable.
    pub model_path: Option<String>,
    pub port: u16,
    pub host: String,
    pub filename: String,
}

/// Parsed fields of a llama-server command line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedServerArgs {
    pub model_path: Option<String>,
    pub port: u16,
    pub host: String,
}

/// Whether an argv identifies a llama-server instance.
pub fn is_server_command(args: &[String]) -> bool {
    args.iter().any(|a| a.contains("llama-server"))
}

fn strip_quotes(value: &str) -> &str {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    trimmed
}

/// Value of the first matching flag, accepting both `--flag value` and
/// `--flag=value` forms.
fn flag_value<'a>(args: &'a [String], names: &[&str]) -> Option<&'a str> {
    for (i, arg) in args.iter().enumerate() {
        for name in names {
            if arg == name {
                return args.get(i + 1).map(String::as_str);
            }
            if let Some(rest) = arg.strip_prefix(name)
                && let Some(value) = rest.strip_prefix('=')
            {
                return Some(value);
            }
        }
    }
    None
}

/// Parse a llama-server argv into its launch parameters.
///
/// The port is the uniqueness key downstream, so a command line without a
/// parseable port in 1-65535 yields `None` and the process is dropped from
/// discovery. The model path uses the `-m`/`--model` flag first and falls
/// back to any token ending in `.gguf`; the host defaults to loopback.
pub fn parse_server_args(args: &[String]) -> Option<ParsedServerArgs> {
    let port = flag_value(args, &["--port"])?
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)?;

    let host = flag_value(args, &["--host"])
        .map(strip_quotes)
        .unwrap_or("127.0.0.1")
        .to_string();

    let model_path = flag_value(args, &["-m", "--model"])
        .map(|v| strip_quotes(v).to_string())
        .or_else(|| {
            args.iter()
                .map(|a| strip_quotes(a))
                .find(|a| a.to_ascii_lowercase().ends_with(".gguf"))
                .map(str::to_string)
        });

    Some(ParsedServerArgs {
        model_path,
        port,
        host,
    })
}

fn model_filename(model_path: Option<&str>) -> String {
    model_path
        .and_then(|p| Path::new(p).file_name())
        .and_then(|f| f.to_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Core discovery over `(pid, argv)` rows.
///
/// Pids in `exclude` (the registry snapshot) are skipped so managed
/// instances are never rediscovered; duplicate ports keep the first row.
pub fn discover_from_table(
    rows: impl IntoIterator<Item = (u32, Vec<String>)>,
    exclude: &HashSet<u32>,
) -> Vec<DiscoveredInstance> {
    let mut seen_ports: HashSet<u16> = HashSet::new();
    let mut discovered = Vec::new();

    for (pid, args) in rows {
        if exclude.contains(&pid) || !is_server_command(&args) {
            continue;
        }
        let Some(parsed) = parse_server_args(&args) else {
            continue;
        };
        if !seen_ports.insert(parsed.port) {
            continue;
        }

        let filename = model_filename(parsed.model_path.as_deref());
        discovered.push(DiscoveredInstance {
            pid,
            model_path: parsed.model_path,
            port: parsed.port,
            host: parsed.host,
            filename,
        });
    }

    discovered
}

/// Scan the live process table for external llama-server instances.
pub fn scan_process_table(exclude: &HashSet<u32>) -> Vec<DiscoveredInstance> {
    let mut sys = System::new();
    sys.refresh_processes();

    let rows = sys
        .processes()
        .iter()
        .map(|(pid, process)| (pid.as_u32(), process.cmd().to_vec()));

    let discovered = discover_from_table(rows, exclude);
    tracing::debug!(count = discovered.len(), "External server scan complete");
    discovered
}

/// Resident memory of a process in megabytes; 0.0 if the process is gone
/// or the query fails.
pub fn memory_mb(pid: u32) -> f64 {
    let mut sys = System::new();
    if !sys.refresh_process(Pid::from_u32(pid)) {
        return 0.0;
    }
    sys.process(Pid::from_u32(pid))
        .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}

/// Whether a pid currently exists. Zombies count as dead: the process can
/// no longer serve requests and only awaits reaping.
pub fn pid_is_alive(pid: u32) -> bool {
    let mut sys = System::new();
    if !sys.refresh_process(Pid::from_u32(pid)) {
        return false;
    }
    sys.process(Pid::from_u32(pid))
        .map(|p| p.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}

// ── Async wrappers ──────────────────────────────────────────
// sysinfo walks the whole process table synchronously; running it on a
// tokio worker thread would stall the runtime, so the wrappers below move
// it to the blocking pool.

/// Async wrapper for [`scan_process_table`].
pub async fn scan_servers(exclude: HashSet<u32>) -> Vec<DiscoveredInstance> {
    match tokio::task::spawn_blocking(move || scan_process_table(&exclude)).await {
        Ok(discovered) => discovered,
        Err(e) => {
            let err = ManagerError::ScanFailure {
                message: e.to_string(),
            };
            crate::metrics::record_scan_failure();
            tracing::warn!(error = %err, "Degrading to empty scan result");
            Vec::new()
        }
    }
}

/// Async wrapper for [`memory_mb`].
pub async fn memory_mb_of(pid: u32) -> f64 {
    tokio::task::spawn_blocking(move || memory_mb(pid))
        .await
        .unwrap_or(0.0)
}

/// Async wrapper for [`pid_is_alive`].
pub async fn is_alive(pid: u32) -> bool {
    tokio::task::spawn_blocking(move || pid_is_alive(pid))
        .await
        .unwrap_or(false)
}
