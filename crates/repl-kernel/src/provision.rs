//! Environment Provisioner: produces the two directories a new sandbox needs
//! by cloning the baseline image, falling back to a fresh build when that
//! fails or no baseline exists.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

use crate::baseline::Baseline;
use crate::config::KernelConfig;
use crate::error::{KernelError, Result};

const WORKER_SCRIPT: &str = include_str!("../assets/worker.py");
const FONT_ASSET: &[u8] = include_bytes!("../assets/sandbox_font.ttf");
pub const WORKER_SCRIPT_NAME: &str = "sandbox_worker.py";
pub const FONT_ASSET_NAME: &str = "sandbox_font.ttf";

/// The two directories a provisioned sandbox owns.
#[derive(Debug, Clone)]
pub struct ProvisionedDirs {
    pub work_dir: PathBuf,
    pub env_dir: PathBuf,
}

/// Provisions `work_dir`/`env_dir` for `id`, cloning `baseline` into the new
/// `env_dir` when available. On any failure, both directories are removed
/// before returning the error — a sandbox never leaves partial artifacts
/// behind.
pub async fn provision(
    config: &KernelConfig,
    baseline: Option<&Baseline>,
    id: Uuid,
) -> Result<ProvisionedDirs> {
    let work_dir = config.tmp_root.join(format!("sandbox_{id}_work"));
    let env_dir = config.tmp_root.join(format!("sandbox_venv_{id}_env"));

    match try_provision(&work_dir, &env_dir, baseline).await {
        Ok(()) => {
            // Canonicalize once so the Filesystem Gateway can compare
            // against a stable prefix for containment checks.
            let work_dir = fs::canonicalize(&work_dir)
                .await
                .map_err(|e| KernelError::Provisioning(e.into()))?;
            info!(sandbox_id = %id, work_dir = %work_dir.display(), env_dir = %env_dir.display(), "sandbox provisioned");
            Ok(ProvisionedDirs { work_dir, env_dir })
        }
        Err(error) => {
            let _ = fs::remove_dir_all(&work_dir).await;
            let _ = fs::remove_dir_all(&env_dir).await;
            Err(KernelError::Provisioning(error))
        }
    }
}

async fn try_provision(
    work_dir: &Path,
    env_dir: &Path,
    baseline: Option<&Baseline>,
) -> anyhow::Result<()> {
    fs::create_dir_all(work_dir).await?;
    fs::create_dir_all(env_dir).await?;

    match baseline {
        Some(baseline) => {
            let source = baseline.dir().to_path_buf();
            let dest = env_dir.to_path_buf();
            let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &dest)).await?;
            if let Err(error) = copied {
                warn!(%error, "baseline copy failed, building environment from scratch");
                build_fresh_environment(env_dir).await?;
            }
        }
        None => build_fresh_environment(env_dir).await?,
    }

    fs::write(env_dir.join(WORKER_SCRIPT_NAME), WORKER_SCRIPT).await?;

    if let Err(error) = fs::write(work_dir.join(FONT_ASSET_NAME), FONT_ASSET).await {
        warn!(%error, "failed to place bundled font asset, continuing without it");
    }

    Ok(())
}

async fn build_fresh_environment(env_dir: &Path) -> anyhow::Result<()> {
    let python = which::which("python3").or_else(|_| which::which("python"))?;
    let status = Command::new(&python)
        .args(["-m", "venv", &env_dir.to_string_lossy()])
        .status()
        .await?;
    if !status.success() {
        anyhow::bail!("python -m venv exited with {status}");
    }
    Ok(())
}

/// Recursively copies `source` into `dest`, preserving executable bits and
/// symlink targets, so the resulting environment is internally consistent
/// with its new location (no absolute-path baked-in copies are rewritten;
/// Python venvs resolve their interpreter relative to argv0, which a plain
/// directory copy already preserves correctly).
fn copy_tree(source: &Path, dest: &Path) -> anyhow::Result<()> {
    use std::fs as std_fs;

    for entry in walkdir::WalkDir::new(source).min_depth(1) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source)?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std_fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link_target = std_fs::read_link(entry.path())?;
            if let Some(parent) = target.parent() {
                std_fs::create_dir_all(parent)?;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(link_target, &target)?;
            #[cfg(not(unix))]
            std_fs::copy(entry.path(), &target).map(|_| ())?;
        } else {
            if let Some(parent) = target.parent() {
                std_fs::create_dir_all(parent)?;
            }
            std_fs::copy(entry.path(), &target)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = std_fs::metadata(entry.path())?.permissions().mode();
                std_fs::set_permissions(&target, std_fs::Permissions::from_mode(mode))?;
            }
        }
    }

    Ok(())
}
