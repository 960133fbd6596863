//! Sandbox Registry & Reaper.
//!
//! The registry is the one process-wide piece of shared mutable state;
//! everything else is partitioned by sandbox id. It is an injectable
//! service object rather than a module-level singleton, so multiple
//! instances (and tests) can coexist with an explicit start/stop lifecycle
//! for the background sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::session::Session;

/// What the registry holds for one live sandbox.
pub struct SandboxRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub session: Arc<Session>,
}

/// Process-wide mapping from sandbox id to live sandbox record.
#[derive(Default)]
pub struct Registry {
    sandboxes: RwLock<HashMap<Uuid, Arc<SandboxRecord>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, record: SandboxRecord) {
        self.sandboxes.write().insert(record.id, Arc::new(record));
    }

    pub fn lookup(&self, id: Uuid) -> Option<Arc<SandboxRecord>> {
        self.sandboxes.read().get(&id).cloned()
    }

    /// Atomically removes `id` from the registry. Both the per-sandbox
    /// expiry task and the periodic sweep call this for the same id when
    /// their timing races; the map's `remove` hands the record to exactly
    /// one caller, making teardown safe to run twice.
    pub fn unregister(&self, id: Uuid) -> Option<Arc<SandboxRecord>> {
        self.sandboxes.write().remove(&id)
    }

    /// A snapshot of every live sandbox's id and creation time, used by
    /// `list_sandboxes` and by the periodic sweep.
    pub fn snapshot(&self) -> Vec<(Uuid, DateTime<Utc>)> {
        self.sandboxes
            .read()
            .values()
            .map(|record| (record.id, record.created_at))
            .collect()
    }
}

/// Background component that destroys sandboxes whose idle budget has
/// elapsed, either via a per-sandbox deferred task or the periodic sweep —
/// whichever notices first.
pub struct Reaper {
    registry: Arc<Registry>,
    idle_budget: Duration,
    sweep_period: Duration,
    sweep_handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn new(registry: Arc<Registry>, idle_budget: Duration, sweep_period: Duration) -> Self {
        Self {
            registry,
            idle_budget,
            sweep_period,
            sweep_handle: None,
        }
    }

    /// Schedules the one-shot expiry for a freshly registered sandbox.
    pub fn schedule_expiry(&self, id: Uuid) {
        let registry = self.registry.clone();
        let budget = self.idle_budget;
        tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            reap(&registry, id).await;
        });
    }

    /// Starts the always-running periodic sweep. Idempotent: calling twice
    /// replaces the previous task rather than running two sweeps.
    pub fn start(&mut self) {
        let registry = self.registry.clone();
        let idle_budget = self.idle_budget;
        let sweep_period = self.sweep_period;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_period);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let expired: Vec<Uuid> = registry
                    .snapshot()
                    .into_iter()
                    .filter(|(_, created_at)| {
                        now.signed_duration_since(*created_at)
                            .to_std()
                            .map(|age| age >= idle_budget)
                            .unwrap_or(false)
                    })
                    .map(|(id, _)| id)
                    .collect();

                for id in expired {
                    reap(&registry, id).await;
                }
            }
        });
        self.sweep_handle = Some(handle);
    }

    /// Stops the periodic sweep. Per-sandbox expiry tasks already scheduled
    /// keep running; they are independent tasks, not tied to this handle.
    pub fn stop(&mut self) {
        if let Some(handle) = self.sweep_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[instrument(skip(registry))]
async fn reap(registry: &Registry, id: Uuid) {
    if let Some(record) = registry.unregister(id) {
        info!(sandbox_id = %id, "reaping expired sandbox");
        record.session.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::session::InterpreterLauncher;
    use async_trait::async_trait;
    use std::path::Path;
    use tokio::process::{Child, Command};

    struct EchoLauncher;

    #[async_trait]
    impl InterpreterLauncher for EchoLauncher {
        async fn launch(&self, _work_dir: &Path, _env_dir: &Path) -> anyhow::Result<Child> {
            Ok(Command::new("cat")
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true)
                .spawn()?)
        }
    }

    async fn fake_session(id: Uuid) -> Arc<Session> {
        let tmp = tempfile::tempdir().unwrap();
        let work_dir = tmp.path().join("work");
        let env_dir = tmp.path().join("env");
        tokio::fs::create_dir_all(&work_dir).await.unwrap();
        tokio::fs::create_dir_all(&env_dir).await.unwrap();
        std::mem::forget(tmp); // directories are removed by Session::shutdown

        let config = KernelConfig {
            execute_message_timeout: Duration::from_millis(100),
            ..KernelConfig::default()
        };
        Arc::new(
            Session::start(id, work_dir, env_dir, &config, &EchoLauncher)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn register_lookup_unregister_round_trip() {
        let registry = Registry::new();
        let id = Uuid::new_v4();
        let session = fake_session(id).await;

        registry.register(SandboxRecord {
            id,
            created_at: Utc::now(),
            session: session.clone(),
        });

        assert!(registry.lookup(id).is_some());
        let removed = registry.unregister(id);
        assert!(removed.is_some());
        assert!(registry.lookup(id).is_none());

        // Second unregister of the same id is a no-op, not a double-free.
        assert!(registry.unregister(id).is_none());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn double_reap_is_benign() {
        let registry = Arc::new(Registry::new());
        let id = Uuid::new_v4();
        let session = fake_session(id).await;
        registry.register(SandboxRecord {
            id,
            created_at: Utc::now(),
            session,
        });

        // Simulates the per-sandbox timer and the periodic sweep racing on
        // the same sandbox: only one should find it still registered.
        let (a, b) = tokio::join!(reap(&registry, id), reap(&registry, id));
        let _ = (a, b);
        assert!(registry.lookup(id).is_none());
    }
}
