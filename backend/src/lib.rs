//! Backend adapter interface (C5): the capability-typed contract the
//! control service uses to drive a sandbox, regardless of which concrete
//! backend (microVM launcher, container launcher, ...) implements it.
//!
//! Re-architected from runtime capability probing into a sum over
//! capability sets: [`BackendAdapter`] carries four independently-optional
//! typed handles rather than one trait object downcast at call sites.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum BackendError {
    #[error("adapter error: {0}")]
    Adapter(String),
    #[error("capability not supported by this adapter")]
    Unsupported,
}

/// An opaque, pre-compiled policy descriptor. Compilation of policy source
/// into this handle is delegated to a collaborator out of this core's
/// scope; this struct only carries the fields the control service itself
/// reads back out (image identity for event payloads and execution
/// records).
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub image_ref: String,
    pub image_digest: String,
    pub content_hash: String,
    pub raw: serde_json::Value,
}

/// A request to run one command, either as a one-shot launch or inside an
/// already-provisioned persistent sandbox.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub sandbox_id: String,
    pub execution_id: String,
    pub run_id: String,
    pub command: Vec<String>,
    pub tty: bool,
    pub launch_timeout_secs: Option<u64>,
    pub run_dir: PathBuf,
    pub policy: CompiledPolicy,
}

/// A request to provision a persistent sandbox ahead of any execution.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub sandbox_id: String,
    pub policy: CompiledPolicy,
}

/// Result of a completed run, whether produced synchronously (baseline) or
/// assembled at the end of a streaming/persistent run.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub run_id: String,
    pub launched_vm: bool,
    pub plan_path: Option<PathBuf>,
    pub run_dir: Option<PathBuf>,
    pub message: Option<String>,
    pub image_ref: Option<String>,
    pub image_digest: Option<String>,
}

/// Interactive input forwarded to a running child by a streaming adapter.
pub trait AttachIo: Send + Sync {
    fn write_stdin(&self, data: &[u8]) -> Result<(), BackendError>;
    fn resize_tty(&self, cols: u32, rows: u32) -> Result<(), BackendError>;
}

/// Callbacks a streaming-capable adapter drives as a run progresses.
pub trait StreamCallbacks: Send + Sync {
    fn on_stdout(&self, data: &[u8]);
    fn on_stderr(&self, data: &[u8]);
    fn on_attach(&self, attach: Arc<dyn AttachIo>);
}

/// Lowest-priority capability: run synchronously to completion, no
/// intermediate streaming or attach support.
#[async_trait]
pub trait BaselineRun: Send + Sync {
    async fn run(&self, request: RunRequest) -> Result<RunResult, BackendError>;
}

/// Mid-priority capability: stream stdout/stderr chunks as they occur and
/// optionally register attach I/O for interactive sessions.
#[async_trait]
pub trait Streaming: Send + Sync {
    async fn run_stream(
        &self,
        request: RunRequest,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> Result<RunResult, BackendError>;
}

/// Highest-priority capability: the sandbox itself is provisioned once
/// (at CREATE) and subsequent executions reuse that provisioned context.
#[async_trait]
pub trait PersistentSandbox: Send + Sync {
    async fn provision_sandbox(&self, request: ProvisionRequest) -> Result<(), BackendError>;
    async fn run_in_sandbox(
        &self,
        request: RunRequest,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> Result<RunResult, BackendError>;
    async fn terminate_sandbox(&self, sandbox_id: &str) -> Result<(), BackendError>;
}

/// Optional capability for reading a file out of a provisioned sandbox.
#[async_trait]
pub trait SandboxFileDownload: Send + Sync {
    async fn download_sandbox_file(
        &self,
        sandbox_id: &str,
        absolute_path: &str,
        max_bytes: u64,
    ) -> Result<Vec<u8>, BackendError>;
}

/// The capability set exposed by one concrete backend.
#[derive(Clone)]
pub struct BackendAdapter {
    pub name: String,
    pub baseline: Option<Arc<dyn BaselineRun>>,
    pub streaming: Option<Arc<dyn Streaming>>,
    pub persistent: Option<Arc<dyn PersistentSandbox>>,
    pub download: Option<Arc<dyn SandboxFileDownload>>,
}

/// Which capability the control service chose for a given execution.
/// Recorded because output-buffering semantics differ by path (see the
/// execution driver's streaming-vs-final-result reconciliation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedPath {
    Persistent,
    Streaming,
    Baseline,
}

impl BackendAdapter {
    /// Adapter selection order: persistent > streaming > baseline.
    pub fn select_path(&self) -> Option<SelectedPath> {
        if self.persistent.is_some() {
            Some(SelectedPath::Persistent)
        } else if self.streaming.is_some() {
            Some(SelectedPath::Streaming)
        } else if self.baseline.is_some() {
            Some(SelectedPath::Baseline)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    #[async_trait]
    impl BaselineRun for Dummy {
        async fn run(&self, _request: RunRequest) -> Result<RunResult, BackendError> {
            Ok(RunResult::default())
        }
    }

    #[async_trait]
    impl Streaming for Dummy {
        async fn run_stream(
            &self,
            _request: RunRequest,
            _callbacks: Arc<dyn StreamCallbacks>,
        ) -> Result<RunResult, BackendError> {
            Ok(RunResult::default())
        }
    }

    #[async_trait]
    impl PersistentSandbox for Dummy {
        async fn provision_sandbox(&self, _request: ProvisionRequest) -> Result<(), BackendError> {
            Ok(())
        }
        async fn run_in_sandbox(
            &self,
            _request: RunRequest,
            _callbacks: Arc<dyn StreamCallbacks>,
        ) -> Result<RunResult, BackendError> {
            Ok(RunResult::default())
        }
        async fn terminate_sandbox(&self, _sandbox_id: &str) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn adapter_with(
        persistent: bool,
        streaming: bool,
        baseline: bool,
    ) -> BackendAdapter {
        let dummy = Arc::new(Dummy);
        BackendAdapter {
            name: "dummy".to_string(),
            baseline: baseline.then(|| dummy.clone() as Arc<dyn BaselineRun>),
            streaming: streaming.then(|| dummy.clone() as Arc<dyn Streaming>),
            persistent: persistent.then(|| dummy.clone() as Arc<dyn PersistentSandbox>),
            download: None,
        }
    }

    #[test]
    fn selection_order_prefers_persistent_over_streaming_over_baseline() {
        assert_eq!(
            adapter_with(true, true, true).select_path(),
            Some(SelectedPath::Persistent)
        );
        assert_eq!(
            adapter_with(false, true, true).select_path(),
            Some(SelectedPath::Streaming)
        );
        assert_eq!(
            adapter_with(false, false, true).select_path(),
            Some(SelectedPath::Baseline)
        );
        assert_eq!(adapter_with(false, false, false).select_path(), None);
    }
}
