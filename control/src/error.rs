//! Error kinds surfaced to the outer API, with verbatim wire strings.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("missing command")]
    MissingCommand,
    #[error("missing sandbox_id")]
    MissingSandboxId,
    #[error("missing execution_id")]
    MissingExecutionId,
    #[error("missing policy")]
    MissingPolicy,
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
    #[error("unknown sandbox {0}")]
    UnknownSandbox(String),
    #[error("unknown execution {execution_id} in sandbox {sandbox_id}")]
    UnknownExecution {
        sandbox_id: String,
        execution_id: String,
    },
    #[error("sandbox {0} is not ready")]
    SandboxNotReady(String),
    #[error("sandbox_busy: sandbox {sandbox_id} already has active execution {execution_id}")]
    SandboxBusyExecution {
        sandbox_id: String,
        execution_id: String,
    },
    #[error("sandbox_busy: sandbox {0} already has an active file download")]
    SandboxBusyDownload(String),
    #[error("execution stdin attach is not supported by the current backend")]
    StdinUnsupported,
    #[error("execution resize is not supported by the current backend")]
    ResizeUnsupported,
    #[error("backend adapter error: {0}")]
    Adapter(String),
    #[error("unknown backend {0}")]
    UnknownBackend(String),
}
