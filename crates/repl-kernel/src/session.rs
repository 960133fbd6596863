//! Kernel Session: owns one interpreter subprocess per sandbox and drives it
//! through the wire protocol in [`crate::protocol`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::protocol::{ExecutionAssembler, ExecutionRecord, PumpControl, Submission, WireMessage};
use crate::provision::WORKER_SCRIPT_NAME;

/// The snippet registering the bundled font with the plotting library,
/// submitted once right after a session becomes ready. Wrapped so a missing
/// or unreadable font asset never surfaces as an error to the caller.
const FONT_INIT_SNIPPET: &str = r#"
try:
    import os
    import matplotlib as mpl
    import matplotlib.font_manager as fm
    _font_path = os.path.join(os.getcwd(), "sandbox_font.ttf")
    if os.path.exists(_font_path):
        fm.fontManager.addfont(_font_path)
        _font_name = fm.FontProperties(fname=_font_path).get_name()
        mpl.rcParams["font.sans-serif"] = [_font_name] + mpl.rcParams["font.sans-serif"]
        mpl.rcParams["font.family"] = "sans-serif"
except Exception:
    pass
"#;

/// Spawns the child interpreter process. Exists as a trait so tests can
/// substitute a fake worker instead of a real Python interpreter.
#[async_trait]
pub trait InterpreterLauncher: Send + Sync + 'static {
    async fn launch(&self, work_dir: &Path, env_dir: &Path) -> anyhow::Result<Child>;
}

/// The real launcher: spawns `env_dir`'s venv interpreter running the
/// bundled worker script, cwd set to `work_dir`.
#[derive(Debug, Clone, Default)]
pub struct ProcessInterpreterLauncher;

#[async_trait]
impl InterpreterLauncher for ProcessInterpreterLauncher {
    async fn launch(&self, work_dir: &Path, env_dir: &Path) -> anyhow::Result<Child> {
        let python = env_dir.join("bin").join("python3");
        let worker = env_dir.join(WORKER_SCRIPT_NAME);

        let child = Command::new(python)
            .arg(worker)
            .current_dir(work_dir)
            .env("VIRTUAL_ENV", env_dir)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Starting,
    Ready,
    Executing,
    Closed,
}

struct Inner {
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    exec_counter: u64,
    state: SessionState,
}

/// Combined output and outcome of an `install` call.
#[derive(Debug, Clone, Serialize)]
pub struct InstallResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub message: String,
}

/// Owns one interpreter subprocess for the lifetime of a sandbox.
///
/// Single-flight by construction: [`Session::execute`] and
/// [`Session::install`] both take the `inner` mutex for their full duration,
/// which is exactly the serialization discipline the design calls for. The
/// child process itself lives behind a *separate* mutex so `shutdown` can
/// kill it without queuing behind a pumping `execute`: killing the child
/// closes its stdout, which wakes the pump's pending read with EOF.
pub struct Session {
    id: Uuid,
    work_dir: PathBuf,
    env_dir: PathBuf,
    message_timeout: Duration,
    install_timeout: Duration,
    inner: Mutex<Inner>,
    child: Mutex<Child>,
    closed: AtomicBool,
}

impl Session {
    #[instrument(skip(config, launcher))]
    pub async fn start(
        id: Uuid,
        work_dir: PathBuf,
        env_dir: PathBuf,
        config: &KernelConfig,
        launcher: &dyn InterpreterLauncher,
    ) -> Result<Self> {
        let mut child = launcher
            .launch(&work_dir, &env_dir)
            .await
            .map_err(|e| KernelError::SessionStart(id, e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| KernelError::SessionStart(id, anyhow::anyhow!("missing child stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KernelError::SessionStart(id, anyhow::anyhow!("missing child stdout")))?;
        let lines = BufReader::new(stdout).lines();

        let session = Self {
            id,
            work_dir,
            env_dir,
            message_timeout: config.execute_message_timeout,
            install_timeout: config.install_timeout,
            inner: Mutex::new(Inner {
                stdin,
                lines,
                exec_counter: 0,
                state: SessionState::Ready,
            }),
            child: Mutex::new(child),
            closed: AtomicBool::new(false),
        };

        info!(sandbox_id = %id, "kernel session ready");

        // Initialization side effect: register the bundled font, discard
        // the record. Run through the pump directly at exec_counter 0
        // rather than through `execute`, so this submission never advances
        // the user-visible counter — the first real `execute` call must
        // still observe `exec_counter == 1`. Best-effort: the snippet
        // swallows its own errors, so this only fails if the session itself
        // cannot run at all, which the caller would hit again on the very
        // next real execute anyway.
        let mut inner = session.inner.lock().await;
        let _ = session.pump(&mut inner, FONT_INIT_SNIPPET, 0).await;
        drop(inner);

        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    #[instrument(skip(self, code), fields(sandbox_id = %self.id))]
    pub async fn execute(&self, code: &str) -> Result<ExecutionRecord> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KernelError::Closed(self.id));
        }

        let mut inner = self.inner.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(KernelError::Closed(self.id));
        }

        inner.state = SessionState::Executing;
        inner.exec_counter += 1;
        let exec_counter = inner.exec_counter;

        let result = self.pump(&mut inner, code, exec_counter).await;
        inner.state = SessionState::Ready;
        result
    }

    /// Submits one snippet and pumps the wire protocol until a terminal
    /// message arrives or the per-message timeout elapses. Shared by
    /// `execute` (with the caller-visible `exec_counter`) and the one-shot
    /// font-init submission in `start` (always at `exec_counter` 0, never
    /// advancing `inner.exec_counter`).
    async fn pump(&self, inner: &mut Inner, code: &str, exec_counter: u64) -> Result<ExecutionRecord> {
        let sid = Uuid::new_v4().to_string();

        let submission = Submission::execute(sid.clone(), code.to_string());
        let line = serde_json::to_string(&submission)
            .map_err(|e| KernelError::ExecuteInternal(self.id, e.into()))?;

        if let Err(error) = write_line(&mut inner.stdin, &line).await {
            inner.state = SessionState::Closed;
            return Err(KernelError::ExecuteInternal(self.id, error.into()));
        }

        let mut assembler = ExecutionAssembler::new(sid, exec_counter);
        loop {
            let next = tokio::time::timeout(self.message_timeout, inner.lines.next_line()).await;
            match next {
                Ok(Ok(Some(raw))) => match serde_json::from_str::<WireMessage>(&raw) {
                    Ok(message) => {
                        if matches!(assembler.handle(message), PumpControl::Stop) {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(sandbox_id = %self.id, %error, "ignoring unparseable wire message");
                    }
                },
                Ok(Ok(None)) => {
                    warn!(sandbox_id = %self.id, "interpreter stdout closed mid-execution");
                    break;
                }
                Ok(Err(error)) => {
                    warn!(sandbox_id = %self.id, %error, "error reading interpreter stdout");
                    break;
                }
                Err(_elapsed) => {
                    warn!(sandbox_id = %self.id, "per-message receive timed out, returning partial record");
                    break;
                }
            }
        }

        // A concurrent `shutdown` kills the child to interrupt this very
        // pump, which surfaces here as the stdout stream closing. Report
        // that as `Closed` rather than handing back a partial record.
        if self.closed.load(Ordering::SeqCst) {
            return Err(KernelError::Closed(self.id));
        }

        Ok(assembler.finish())
    }

    #[instrument(skip(self, package), fields(sandbox_id = %self.id))]
    pub async fn install(&self, package: &str) -> Result<InstallResult> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KernelError::Closed(self.id));
        }

        let _inner = self.inner.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(KernelError::Closed(self.id));
        }

        let pip = self.env_dir.join("bin").join("pip");
        let spawn = Command::new(&pip)
            .args(["install", package])
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.install_timeout, spawn).await {
            Ok(Ok(output)) => Ok(InstallResult {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                message: if output.status.success() {
                    format!("successfully installed {package}")
                } else {
                    format!("failed to install {package}")
                },
            }),
            Ok(Err(error)) => Ok(InstallResult {
                success: false,
                stdout: String::new(),
                stderr: error.to_string(),
                message: format!("failed to spawn installer for {package}"),
            }),
            Err(_elapsed) => Ok(InstallResult {
                success: false,
                stdout: String::new(),
                stderr: String::new(),
                message: format!("installing {package} timed out"),
            }),
        }
    }

    /// Idempotent, best-effort teardown. Swallows every error once the
    /// child is known to be gone.
    ///
    /// Takes the dedicated `child` mutex, never `inner`, so a `shutdown`
    /// racing a pumping `execute` does not queue behind it: killing the
    /// child closes its stdout immediately, which wakes the pump's pending
    /// `next_line` with EOF instead of waiting out the message timeout.
    #[instrument(skip(self), fields(sandbox_id = %self.id))]
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut child = self.child.lock().await;
        if let Err(error) = child.start_kill() {
            warn!(sandbox_id = %self.id, %error, "failed to signal interpreter during shutdown");
        }
        let _ = child.wait().await;
        drop(child);

        if let Err(error) = tokio::fs::remove_dir_all(&self.work_dir).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(sandbox_id = %self.id, %error, "failed to remove work_dir during shutdown");
            }
        }
        if let Err(error) = tokio::fs::remove_dir_all(&self.env_dir).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(sandbox_id = %self.id, %error, "failed to remove env_dir during shutdown");
            }
        }

        info!(sandbox_id = %self.id, "kernel session shut down");
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}
