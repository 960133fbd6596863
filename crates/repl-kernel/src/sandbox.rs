//! `SandboxManager`: the single entry point the daemon (or any other caller)
//! talks to. Combines the baseline image, the provisioner, kernel sessions,
//! the filesystem gateway, and the registry/reaper into the public operation
//! set.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::baseline::Baseline;
use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::fs_gateway::{self, FileEntry};
use crate::protocol::ExecutionRecord;
use crate::provision::{self, ProvisionedDirs};
use crate::registry::{Reaper, Registry, SandboxRecord};
use crate::session::{InterpreterLauncher, ProcessInterpreterLauncher, Session};

/// Summary of one live sandbox, as returned by `list_sandboxes`.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxSummary {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Process-wide facade over every sandbox operation.
///
/// An instance, not a singleton: the daemon builds exactly one and shares it
/// behind an `Arc`, but nothing here prevents constructing a second one (a
/// test harness does exactly that, with its own registry and launcher).
pub struct SandboxManager {
    config: KernelConfig,
    baseline: Option<Baseline>,
    registry: Arc<Registry>,
    reaper: std::sync::Mutex<Reaper>,
    launcher: Arc<dyn InterpreterLauncher>,
}

impl SandboxManager {
    /// Builds the baseline image (best-effort) and starts the periodic
    /// sweep. The returned manager is ready to accept `create` calls.
    pub async fn start(config: KernelConfig) -> Self {
        Self::start_with_launcher(config, Arc::new(ProcessInterpreterLauncher)).await
    }

    /// Same as [`Self::start`] but with an injectable launcher, used by the
    /// daemon's test harness to substitute a fake interpreter.
    pub async fn start_with_launcher(
        config: KernelConfig,
        launcher: Arc<dyn InterpreterLauncher>,
    ) -> Self {
        let baseline = Baseline::ensure(&config).await;
        let registry = Arc::new(Registry::new());
        let mut reaper = Reaper::new(registry.clone(), config.idle_budget, config.sweep_period);
        reaper.start();

        Self {
            config,
            baseline,
            registry,
            reaper: std::sync::Mutex::new(reaper),
            launcher,
        }
    }

    /// Stops the periodic sweep without touching any live sandbox. Intended
    /// for graceful shutdown; existing sandboxes are left registered so a
    /// caller can still `close` them explicitly if it wants to.
    pub fn stop_sweeping(&self) {
        self.reaper.lock().unwrap().stop();
    }

    #[instrument(skip(self))]
    pub async fn create(&self) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let ProvisionedDirs { work_dir, env_dir } =
            provision::provision(&self.config, self.baseline.as_ref(), id).await?;

        let session = Session::start(id, work_dir, env_dir, &self.config, self.launcher.as_ref())
            .await?;

        self.registry.register(SandboxRecord {
            id,
            created_at: Utc::now(),
            session: Arc::new(session),
        });
        self.reaper.lock().unwrap().schedule_expiry(id);

        info!(sandbox_id = %id, "sandbox created");
        Ok(id)
    }

    #[instrument(skip(self, code))]
    pub async fn execute(&self, id: Uuid, code: &str) -> Result<ExecutionRecord> {
        self.session(id)?.execute(code).await
    }

    #[instrument(skip(self, package))]
    pub async fn install(&self, id: Uuid, package: &str) -> Result<crate::session::InstallResult> {
        self.session(id)?.install(package).await
    }

    pub async fn upload(
        &self,
        id: Uuid,
        rel_path: Option<&str>,
        original_filename: Option<&str>,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        let session = self.session(id)?;
        fs_gateway::upload(session.work_dir(), rel_path, original_filename, bytes).await
    }

    pub async fn list_files(&self, id: Uuid) -> Result<Vec<FileEntry>> {
        let session = self.session(id)?;
        fs_gateway::list(session.work_dir().to_path_buf()).await
    }

    pub async fn resolve_download(&self, id: Uuid, rel_path: &str) -> Result<PathBuf> {
        let session = self.session(id)?;
        fs_gateway::resolve_for_download(session.work_dir(), rel_path).await
    }

    #[instrument(skip(self))]
    pub async fn close(&self, id: Uuid) -> Result<()> {
        let record = self
            .registry
            .unregister(id)
            .ok_or(KernelError::Unknown(id))?;
        record.session.shutdown().await;
        info!(sandbox_id = %id, "sandbox closed");
        Ok(())
    }

    pub fn list_sandboxes(&self) -> Vec<SandboxSummary> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|(id, created_at)| SandboxSummary { id, created_at })
            .collect()
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline.is_some()
    }

    fn session(&self, id: Uuid) -> Result<Arc<Session>> {
        self.registry
            .lookup(id)
            .map(|record| record.session.clone())
            .ok_or(KernelError::Unknown(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;
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

    async fn manager(tmp_root: PathBuf) -> SandboxManager {
        let config = KernelConfig {
            tmp_root,
            execute_message_timeout: Duration::from_millis(200),
            sweep_period: Duration::from_secs(3600),
            idle_budget: Duration::from_secs(3600),
            ..KernelConfig::default()
        };
        SandboxManager::start_with_launcher(config, Arc::new(EchoLauncher)).await
    }

    #[tokio::test]
    async fn unknown_sandbox_operations_fail_with_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path().to_path_buf()).await;

        let bogus = Uuid::new_v4();
        assert!(matches!(
            manager.execute(bogus, "1+1").await,
            Err(KernelError::Unknown(_))
        ));
        assert!(matches!(
            manager.close(bogus).await,
            Err(KernelError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn create_registers_and_close_unregisters() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path().to_path_buf()).await;

        let id = manager.create().await.unwrap();
        assert_eq!(manager.list_sandboxes().len(), 1);
        assert_eq!(manager.list_sandboxes()[0].id, id);

        manager.close(id).await.unwrap();
        assert!(manager.list_sandboxes().is_empty());

        // Closing twice reports the sandbox as already gone rather than
        // panicking on a double teardown.
        assert!(matches!(manager.close(id).await, Err(KernelError::Unknown(_))));
    }

    #[tokio::test]
    async fn upload_and_list_files_round_trip_through_the_manager() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path().to_path_buf()).await;
        let id = manager.create().await.unwrap();

        manager
            .upload(id, Some("hello.txt"), None, b"hi there")
            .await
            .unwrap();

        let files = manager.list_files(id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "hello.txt");

        manager.close(id).await.unwrap();
    }
}
