use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Infrastructure-level failures raised by the sandbox core.
///
/// User-code errors (a `ZeroDivisionError` raised inside submitted code, say)
/// are never represented here — they travel back as the `error` field of a
/// normal [`crate::protocol::ExecutionRecord`]. Only failures of the
/// surrounding machinery reach this type.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("failed to provision sandbox workspace: {0}")]
    Provisioning(#[source] anyhow::Error),

    #[error("interpreter subprocess for sandbox {0} failed to start: {1}")]
    SessionStart(Uuid, #[source] anyhow::Error),

    #[error("sandbox {0} not found")]
    Unknown(Uuid),

    #[error("sandbox {0} is closed")]
    Closed(Uuid),

    #[error("path '{0}' escapes the sandbox working directory")]
    AccessDenied(PathBuf),

    #[error("path '{0}' does not exist")]
    NotFound(PathBuf),

    #[error("execution pump failed for sandbox {0}: {1}")]
    ExecuteInternal(Uuid, #[source] anyhow::Error),

    #[error("io error at {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KernelError>;
