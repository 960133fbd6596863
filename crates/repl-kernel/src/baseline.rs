//! Baseline Image Builder.
//!
//! Built once per service lifetime: a warm interpreter environment with a
//! fixed, documented set of numerical/data packages pre-installed, reused as
//! a template every later sandbox clones instead of installing from scratch.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::process::Command;
use tracing::{info, instrument, warn};

use crate::config::{KernelConfig, BASELINE_PACKAGES};

/// A built (or reused) baseline environment directory.
///
/// Read-only after construction: nothing in this module, or in
/// [`crate::provision`], ever writes into `dir` again once `ensure` returns.
#[derive(Debug, Clone)]
pub struct Baseline {
    dir: PathBuf,
}

impl Baseline {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Builds the baseline at `config.baseline_dir()` if it does not already
    /// exist, or reuses it if it does. Returns `None` if no usable baseline
    /// could be produced (e.g. no `python3` on `PATH`); callers fall back to
    /// building each sandbox's environment from scratch in that case.
    #[instrument(skip(config))]
    pub async fn ensure(config: &KernelConfig) -> Option<Self> {
        let dir = config.baseline_dir();

        if fs::metadata(&dir).await.is_ok() {
            info!(path = %dir.display(), "reusing existing baseline image");
            return Some(Self { dir });
        }

        info!(path = %dir.display(), "building baseline image");
        match build(&dir).await {
            Ok(()) => Some(Self { dir }),
            Err(error) => {
                warn!(%error, "failed to build baseline image; sandboxes will build from scratch");
                let _ = fs::remove_dir_all(&dir).await;
                None
            }
        }
    }
}

async fn build(dir: &Path) -> anyhow::Result<()> {
    let python = which::which("python3")
        .or_else(|_| which::which("python"))
        .map_err(|_| anyhow::anyhow!("no python3/python interpreter found on PATH"))?;

    let status = Command::new(&python)
        .args(["-m", "venv", &dir.to_string_lossy()])
        .status()
        .await?;
    if !status.success() {
        anyhow::bail!("python -m venv exited with {status}");
    }

    let pip = dir.join("bin").join("pip");
    for package in BASELINE_PACKAGES {
        info!(package, "installing baseline package");
        match Command::new(&pip).args(["install", package]).status().await {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(package, %status, "baseline package install failed, skipping"),
            Err(error) => warn!(package, %error, "failed to spawn pip, skipping package"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reuses_existing_baseline_without_rebuilding() {
        let tmp = tempfile::tempdir().unwrap();
        let config = KernelConfig {
            tmp_root: tmp.path().to_path_buf(),
            ..KernelConfig::default()
        };
        fs::create_dir_all(config.baseline_dir()).await.unwrap();
        // A marker file proves `ensure` took the "reuse" branch: if it had
        // tried to rebuild, the directory-exists check still short-circuits
        // before anything here could be touched.
        fs::write(config.baseline_dir().join("marker"), b"x")
            .await
            .unwrap();

        let baseline = Baseline::ensure(&config).await.unwrap();
        assert!(fs::metadata(baseline.dir().join("marker")).await.is_ok());
    }
}
