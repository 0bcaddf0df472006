//! Launch, stop, and reconciliation of model server processes

use crate::config::ManagerConfig;
use crate::error::ManagerError;
use crate::models::{self, ModelFile};
use crate::port;
use crate::process::{ProcessDriver, SpawnSpec};
use crate::registry::{InstanceRegistry, ManagedInstance};
use crate::settings::Settings;
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// Uniform view over managed and discovered instances. Derived on every
/// call, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct RunningModel {
    pub pid: u32,
    pub model_path: Option<String>,
    pub port: u16,
    pub host: String,
    pub filename: String,
    pub external: bool,
    pub memory_mb: f64,
}

/// Orchestrates the process lifecycle: validate, spawn, track, discover,
/// stop. Sole owner of registry mutations.
pub struct LifecycleManager {
    registry: Arc<InstanceRegistry>,
    driver: Arc<dyn ProcessDriver>,
    settings: Arc<RwLock<Settings>>,
    config: ManagerConfig,
    /// Serializes the probe-spawn-register sequence. The port probe and
    /// the child's bind are not one atomic step, so two launches for the
    /// same port must never run the sequence concurrently.
    launch_lock: Mutex<()>,
}

fn validate_port(port: u32) -> Result<u16, ManagerError> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ManagerError::InvalidInput(format!("port must be in 1-65535 (got {port})")))
}

fn filename_of(path: &Path) -> String {
    path.file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("unknown")
        .to_string()
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        driver: Arc<dyn ProcessDriver>,
        settings: Arc<RwLock<Settings>>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            registry,
            driver,
            settings,
            config,
            launch_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &Arc<RwLock<Settings>> {
        &self.settings
    }

    /// Launch a llama-server for the given model on the given port.
    ///
    /// The bind probe is advisory; the post-spawn check (and later
    /// reconciliation) is the authoritative signal for bind races.
    pub async fn launch(
        &self,
        model_path: PathBuf,
        port: u32,
        host: Option<String>,
    ) -> Result<ManagedInstance, ManagerError> {
        let port = validate_port(port)?;
        if let Some(host) = host.as_deref()
            && host.parse::<IpAddr>().is_err()
        {
            return Err(ManagerError::InvalidInput(format!(
                "host '{host}' is not a valid IP address"
            )));
        }

        let _guard = self.launch_lock.lock().await;

        if !tokio::fs::try_exists(&model_path).await.unwrap_or(false) {
            return Err(ManagerError::NotFound(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        let (binary, default_host) = {
            let settings = self.settings.read().await;
            (settings.resolve_server_binary(), settings.bind.clone())
        };
        if !tokio::fs::try_exists(&binary).await.unwrap_or(false) {
            return Err(ManagerError::BinaryNotFound {
                path: binary.display().to_string(),
            });
        }

        let host = host.unwrap_or(default_host);

        if self.registry.port_in_use(port).await {
            return Err(ManagerError::PortUnavailable { port });
        }
        if !port::port_is_free(&host, port) {
            return Err(ManagerError::PortUnavailable { port });
        }

        let spec = SpawnSpec {
            binary,
            model_path: model_path.clone(),
            port,
            host: host.clone(),
        };
        let pid = self.driver.spawn_server(&spec).await?;

        if self.config.spawn_check_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.spawn_check_delay_ms)).await;
            if !self.driver.is_alive(pid).await {
                return Err(ManagerError::SpawnFailed {
                    message: format!(
                        "server (pid {pid}) exited immediately; bad model, port race, \
                         or incompatible binary"
                    ),
                });
            }
        }

        let instance = ManagedInstance {
            pid,
            model_path,
            port,
            host,
            started_at: chrono::Utc::now(),
        };
        self.registry.insert(instance.clone()).await;

        crate::metrics::record_launch(&filename_of(&instance.model_path));
        tracing::info!(
            pid = pid,
            port = instance.port,
            model = %instance.model_path.display(),
            "Model server launched"
        );

        Ok(instance)
    }

    /// Stop a running model by pid. Returns `false` for unknown pids and
    /// for external instances that outlive the bounded wait; signal
    /// failures are swallowed (the caller's recovery is a rescan).
    pub async fn stop(&self, pid: u32) -> bool {
        // Managed path: take the entry first so a second stop observes the
        // pid as gone, then fire-and-forget the signal. The pid is the sole
        // handle; the next scan confirms death.
        if let Some(instance) = self.registry.remove(pid).await {
            if let Err(e) = self.driver.terminate(pid) {
                tracing::warn!(pid = pid, error = %e, "Termination signal failed");
            }
            crate::metrics::record_stop("managed");
            tracing::info!(
                pid = pid,
                model = %instance.model_path.display(),
                "Managed instance stopped"
            );
            return true;
        }

        // External path: signal, then poll liveness with an upper bound.
        let externals = self.driver.scan_servers(self.registry.pids().await).await;
        if !externals.iter().any(|e| e.pid == pid) {
            return false;
        }

        if let Err(e) = self.driver.terminate(pid) {
            tracing::warn!(pid = pid, error = %e, "Termination signal failed");
            return false;
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.stop_timeout_secs);
        loop {
            if !self.driver.is_alive(pid).await {
                crate::metrics::record_stop("external");
                tracing::info!(pid = pid, "External instance stopped");
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    pid = pid,
                    timeout_secs = self.config.stop_timeout_secs,
                    "External instance ignored the termination signal"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(self.config.stop_poll_interval_ms)).await;
        }
    }

    /// Signal every managed instance and clear the registry regardless of
    /// signal outcomes. With `include_external`, also signals every
    /// instance found by a fresh scan. Returns the number of processes
    /// signaled.
    pub async fn stop_all(&self, include_external: bool) -> usize {
        let instances = self.registry.clear().await;
        let mut signaled = 0;

        for instance in &instances {
            match self.driver.terminate(instance.pid) {
                Ok(()) => signaled += 1,
                Err(e) => {
                    tracing::warn!(pid = instance.pid, error = %e, "stop-all: signal failed");
                }
            }
        }

        if include_external {
            for external in self.driver.scan_servers(HashSet::new()).await {
                match self.driver.terminate(external.pid) {
                    Ok(()) => signaled += 1,
                    Err(e) => {
                        tracing::warn!(pid = external.pid, error = %e, "stop-all: signal failed");
                    }
                }
            }
        }

        tracing::info!(
            managed = instances.len(),
            signaled = signaled,
            include_external = include_external,
            "Stop-all complete"
        );
        signaled
    }

    /// Reconcile and merge: prune managed entries whose pid is dead,
    /// decorate survivors with live memory usage, and append a fresh
    /// external scan. Recomputed on every call; nothing is cached.
    pub async fn list_running(&self) -> Vec<RunningModel> {
        let mut running = Vec::new();

        for instance in self.registry.values().await {
            if !self.driver.is_alive(instance.pid).await {
                self.registry.remove(instance.pid).await;
                tracing::info!(
                    pid = instance.pid,
                    port = instance.port,
                    "Pruned managed instance whose process is gone"
                );
                continue;
            }

            running.push(RunningModel {
                pid: instance.pid,
                model_path: Some(instance.model_path.to_string_lossy().into_owned()),
                port: instance.port,
                host: instance.host.clone(),
                filename: filename_of(&instance.model_path),
                external: false,
                memory_mb: self.driver.memory_mb(instance.pid).await,
            });
        }

        for external in self.driver.scan_servers(self.registry.pids().await).await {
            let memory_mb = self.driver.memory_mb(external.pid).await;
            running.push(RunningModel {
                pid: external.pid,
                model_path: external.model_path,
                port: external.port,
                host: external.host,
                filename: external.filename,
                external: true,
                memory_mb,
            });
        }

        crate::metrics::update_running_count(running.len());
        running
    }

    /// GGUF files in the configured model directory.
    pub async fn list_model_files(&self) -> Vec<ModelFile> {
        let dir = self.settings.read().await.model_dir.clone();
        models::list_model_files(&dir).await
    }

    /// Whether a port can currently be bound on the configured interface.
    pub async fn check_port(&self, port: u32) -> Result<bool, ManagerError> {
        let port = validate_port(port)?;
        let bind = self.settings.read().await.bind.clone();
        Ok(port::port_is_free(&bind, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::mocks::MockProcessDriver;
    use crate::scanner::DiscoveredInstance;
    use std::net::TcpListener;
    use tempfile::TempDir;

    struct Fixture {
        manager: Arc<LifecycleManager>,
        registry: Arc<InstanceRegistry>,
        driver: Arc<MockProcessDriver>,
        _temp: TempDir,
        model: PathBuf,
    }

    fn test_config() -> ManagerConfig {
        ManagerConfig {
            spawn_check_delay_ms: 1,
            stop_poll_interval_ms: 10,
            stop_timeout_secs: 1,
            ..Default::default()
        }
    }

    /// Manager over a mock driver, with a real model file and a real (but
    /// arbitrary) file standing in for the server binary.
    fn fixture_with_config(config: ManagerConfig) -> Fixture {
        let temp = TempDir::new().unwrap();
        let model = temp.path().join("llama-3-8b.gguf");
        std::fs::write(&model, b"gguf").unwrap();
        let binary = temp.path().join("llama-server");
        std::fs::write(&binary, b"").unwrap();

        let settings = Settings {
            bind: "127.0.0.1".to_string(),
            model_dir: temp.path().to_path_buf(),
            llama_server: binary.to_string_lossy().into_owned(),
        };

        let registry = Arc::new(InstanceRegistry::new());
        let driver = Arc::new(MockProcessDriver::new());
        let manager = Arc::new(LifecycleManager::new(
            registry.clone(),
            driver.clone(),
            Arc::new(RwLock::new(settings)),
            config,
        ));

        Fixture {
            manager,
            registry,
            driver,
            _temp: temp,
            model,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_config(test_config())
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    fn external(pid: u32, port: u16) -> DiscoveredInstance {
        DiscoveredInstance {
            pid,
            model_path: Some("/elsewhere/ext.gguf".to_string()),
            port,
            host: "127.0.0.1".to_string(),
            filename: "ext.gguf".to_string(),
        }
    }

    // ── launch ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_launch_registers_instance() {
        let fx = fixture();
        let port = free_port();

        let instance = fx
            .manager
            .launch(fx.model.clone(), port as u32, None)
            .await
            .unwrap();

        assert_eq!(instance.port, port);
        assert_eq!(instance.host, "127.0.0.1");
        assert!(fx.registry.contains(instance.pid).await);
        assert_eq!(fx.driver.spawn_count(), 1);

        let spec = &fx.driver.spawned()[0];
        assert_eq!(spec.model_path, fx.model);
        assert_eq!(spec.port, port);
    }

    #[tokio::test]
    async fn test_launch_rejects_out_of_range_ports() {
        let fx = fixture();

        for bad in [0u32, 70000, 1_000_000] {
            let err = fx
                .manager
                .launch(fx.model.clone(), bad, None)
                .await
                .unwrap_err();
            assert!(matches!(err, ManagerError::InvalidInput(_)), "port {bad}");
        }
        // Rejected before any spawn attempt.
        assert_eq!(fx.driver.spawn_count(), 0);
        assert!(fx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_launch_rejects_bad_host() {
        let fx = fixture();
        let err = fx
            .manager
            .launch(fx.model.clone(), free_port() as u32, Some("lo cal".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::InvalidInput(_)));
        assert_eq!(fx.driver.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_launch_missing_model_is_not_found() {
        let fx = fixture();
        let err = fx
            .manager
            .launch(PathBuf::from("/nope/ghost.gguf"), free_port() as u32, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));
        assert_eq!(fx.driver.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_launch_missing_binary() {
        let fx = fixture();
        {
            let mut settings = fx.manager.settings().write().await;
            settings.llama_server = "/nope/llama-server".to_string();
        }

        let err = fx
            .manager
            .launch(fx.model.clone(), free_port() as u32, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::BinaryNotFound { .. }));
        assert_eq!(fx.driver.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_launch_on_os_occupied_port() {
        let fx = fixture();
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = fx
            .manager
            .launch(fx.model.clone(), port as u32, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::PortUnavailable { .. }));
        // No process spawned, registry unchanged.
        assert_eq!(fx.driver.spawn_count(), 0);
        assert!(fx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_launch_on_port_held_by_managed_instance() {
        let fx = fixture();
        let port = free_port();

        fx.manager
            .launch(fx.model.clone(), port as u32, None)
            .await
            .unwrap();
        // The mock child never binds the port, so only the registry check
        // can reject the duplicate.
        let err = fx
            .manager
            .launch(fx.model.clone(), port as u32, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::PortUnavailable { .. }));
        assert_eq!(fx.driver.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_same_port_launches_one_winner() {
        let fx = fixture();
        let port = free_port();

        let (a, b) = tokio::join!(
            fx.manager.launch(fx.model.clone(), port as u32, None),
            fx.manager.launch(fx.model.clone(), port as u32, None),
        );

        let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);

        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(
            loser.unwrap_err(),
            ManagerError::PortUnavailable { .. }
        ));
        assert_eq!(fx.registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_launch_spawn_failure_leaves_registry_unchanged() {
        let fx = fixture();
        fx.driver.fail_next_spawn();

        let err = fx
            .manager
            .launch(fx.model.clone(), free_port() as u32, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::SpawnFailed { .. }));
        assert!(fx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_launch_detects_immediate_child_exit() {
        let fx = fixture();
        fx.driver.spawn_dies_immediately();

        let err = fx
            .manager
            .launch(fx.model.clone(), free_port() as u32, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::SpawnFailed { .. }));
        // Spawn happened, but the dead child must not be registered.
        assert_eq!(fx.driver.spawn_count(), 1);
        assert!(fx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_launch_explicit_host_overrides_bind() {
        let fx = fixture();
        let instance = fx
            .manager
            .launch(fx.model.clone(), free_port() as u32, Some("0.0.0.0".into()))
            .await
            .unwrap();
        assert_eq!(instance.host, "0.0.0.0");
        assert_eq!(fx.driver.spawned()[0].host, "0.0.0.0");
    }

    // ── stop ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_stop_managed_is_idempotent() {
        let fx = fixture();
        let instance = fx
            .manager
            .launch(fx.model.clone(), free_port() as u32, None)
            .await
            .unwrap();

        assert!(fx.manager.stop(instance.pid).await);
        assert!(!fx.registry.contains(instance.pid).await);
        assert_eq!(fx.driver.terminated(), vec![instance.pid]);

        // Second stop finds nothing and has no side effects.
        assert!(!fx.manager.stop(instance.pid).await);
        assert_eq!(fx.driver.terminated(), vec![instance.pid]);
    }

    #[tokio::test]
    async fn test_stop_managed_survives_signal_failure() {
        let fx = fixture();
        let instance = fx
            .manager
            .launch(fx.model.clone(), free_port() as u32, None)
            .await
            .unwrap();
        fx.driver.fail_terminate(instance.pid);

        // Fire-and-forget: the entry is dropped even when the signal fails.
        assert!(fx.manager.stop(instance.pid).await);
        assert!(fx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_stop_external_polls_until_gone() {
        let fx = fixture();
        fx.driver.add_external(external(4000, 9100));

        assert!(fx.manager.stop(4000).await);
        assert_eq!(fx.driver.terminated(), vec![4000]);
    }

    #[tokio::test]
    async fn test_stop_external_bounded_when_signal_ignored() {
        let fx = fixture();
        fx.driver.add_external(external(4001, 9101));
        fx.driver.ignore_signals(4001);

        let start = std::time::Instant::now();
        assert!(!fx.manager.stop(4001).await);
        // Bounded wait: well past the 1 s timeout would mean the old
        // unbounded poll came back.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stop_unknown_pid_is_false() {
        let fx = fixture();
        assert!(!fx.manager.stop(99999).await);
        assert!(fx.driver.terminated().is_empty());
    }

    // ── stop_all ────────────────────────────────────────────

    #[tokio::test]
    async fn test_stop_all_clears_registry() {
        let fx = fixture();
        let a = fx
            .manager
            .launch(fx.model.clone(), free_port() as u32, None)
            .await
            .unwrap();
        let b = fx
            .manager
            .launch(fx.model.clone(), free_port() as u32, None)
            .await
            .unwrap();

        let signaled = fx.manager.stop_all(false).await;
        assert_eq!(signaled, 2);
        assert!(fx.registry.is_empty().await);

        let terminated = fx.driver.terminated();
        assert!(terminated.contains(&a.pid));
        assert!(terminated.contains(&b.pid));
    }

    #[tokio::test]
    async fn test_stop_all_clears_registry_despite_signal_failures() {
        let fx = fixture();
        let a = fx
            .manager
            .launch(fx.model.clone(), free_port() as u32, None)
            .await
            .unwrap();
        fx.manager
            .launch(fx.model.clone(), free_port() as u32, None)
            .await
            .unwrap();
        fx.driver.fail_terminate(a.pid);

        fx.manager.stop_all(false).await;
        assert_eq!(fx.registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_stop_all_spares_externals_by_default() {
        let fx = fixture();
        fx.driver.add_external(external(4100, 9200));
        fx.manager
            .launch(fx.model.clone(), free_port() as u32, None)
            .await
            .unwrap();

        fx.manager.stop_all(false).await;
        assert!(!fx.driver.terminated().contains(&4100));
    }

    #[tokio::test]
    async fn test_stop_all_with_external_reaps_everything() {
        let fx = fixture();
        fx.driver.add_external(external(4200, 9300));
        let managed = fx
            .manager
            .launch(fx.model.clone(), free_port() as u32, None)
            .await
            .unwrap();

        let signaled = fx.manager.stop_all(true).await;
        assert_eq!(signaled, 2);
        let terminated = fx.driver.terminated();
        assert!(terminated.contains(&managed.pid));
        assert!(terminated.contains(&4200));
    }

    // ── list_running ────────────────────────────────────────

    #[tokio::test]
    async fn test_list_running_merges_managed_and_external() {
        let fx = fixture();
        let managed = fx
            .manager
            .launch(fx.model.clone(), free_port() as u32, None)
            .await
            .unwrap();
        fx.driver.set_memory_mb(managed.pid, 512.0);
        fx.driver.add_external(external(4300, 9400));

        let running = fx.manager.list_running().await;
        assert_eq!(running.len(), 2);

        let ours = running.iter().find(|m| m.pid == managed.pid).unwrap();
        assert!(!ours.external);
        assert_eq!(ours.filename, "llama-3-8b.gguf");
        assert_eq!(ours.memory_mb, 512.0);

        let theirs = running.iter().find(|m| m.pid == 4300).unwrap();
        assert!(theirs.external);
        assert_eq!(theirs.port, 9400);
    }

    #[tokio::test]
    async fn test_launched_pid_appears_exactly_once() {
        let fx = fixture();
        let instance = fx
            .manager
            .launch(fx.model.clone(), free_port() as u32, None)
            .await
            .unwrap();

        let running = fx.manager.list_running().await;
        let occurrences = running.iter().filter(|m| m.pid == instance.pid).count();
        assert_eq!(occurrences, 1);
    }

    #[tokio::test]
    async fn test_list_running_prunes_dead_managed_instances() {
        let fx = fixture();
        let instance = fx
            .manager
            .launch(fx.model.clone(), free_port() as u32, None)
            .await
            .unwrap();

        // Process dies behind the controller's back.
        fx.driver.kill_silently(instance.pid);

        let running = fx.manager.list_running().await;
        assert!(running.iter().all(|m| m.pid != instance.pid));
        // Reconciliation removed the stale entry, not just hid it.
        assert!(fx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_stopped_pid_leaves_view() {
        let fx = fixture();
        let instance = fx
            .manager
            .launch(fx.model.clone(), free_port() as u32, None)
            .await
            .unwrap();
        assert!(fx.manager.stop(instance.pid).await);

        let running = fx.manager.list_running().await;
        assert!(running.iter().all(|m| m.pid != instance.pid));
    }

    // ── model files and port checks ─────────────────────────

    #[tokio::test]
    async fn test_list_model_files_uses_settings_dir() {
        let fx = fixture();
        let dir = fx.manager.settings().read().await.model_dir.clone();
        std::fs::write(dir.join("another.gguf"), b"").unwrap();
        std::fs::write(dir.join("notes.txt"), b"").unwrap();

        let files = fx.manager.list_model_files().await;
        let names: Vec<_> = files.iter().map(|f| f.filename.as_str()).collect();
        assert!(names.contains(&"llama-3-8b.gguf"));
        assert!(names.contains(&"another.gguf"));
        assert!(!names.contains(&"notes.txt"));
    }

    #[tokio::test]
    async fn test_check_port() {
        let fx = fixture();
        assert!(fx.manager.check_port(free_port() as u32).await.unwrap());

        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();
        assert!(!fx.manager.check_port(busy as u32).await.unwrap());

        assert!(matches!(
            fx.manager.check_port(0).await,
            Err(ManagerError::InvalidInput(_))
        ));
        assert!(matches!(
            fx.manager.check_port(70000).await,
            Err(ManagerError::InvalidInput(_))
        ));
    }
}
