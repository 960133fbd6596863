//! Kernel core for an isolated, per-session code execution sandbox service.
//!
//! A sandbox is a disposable Python interpreter subprocess paired with a
//! private working directory. This crate owns everything below the HTTP
//! surface: building a warm baseline environment once, cloning it per
//! sandbox, driving the interpreter over a line-delimited JSON protocol, and
//! reclaiming sandboxes that go idle.

pub mod baseline;
pub mod config;
pub mod error;
pub mod fs_gateway;
pub mod protocol;
pub mod provision;
pub mod registry;
pub mod sandbox;
pub mod session;

pub use config::KernelConfig;
pub use error::{KernelError, Result};
pub use protocol::{ExecuteError, ExecutionRecord, RichResult};
pub use sandbox::{SandboxManager, SandboxSummary};
pub use session::InstallResult;
