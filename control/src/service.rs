//! Control service: sandbox registry (C6) and execution engine (C7) wired
//! together behind one lock, plus the execution driver task and the
//! retention pruner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use cleanroom_backend::AttachIo;
use cleanroom_backend::BackendAdapter;
use cleanroom_backend::BackendError;
use cleanroom_backend::CompiledPolicy;
use cleanroom_backend::ProvisionRequest;
use cleanroom_backend::RunRequest;
use cleanroom_backend::SelectedPath;
use cleanroom_backend::StreamCallbacks;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::attach::RESIZE_DEADLINE;
use crate::attach::STDIN_DEADLINE;
use crate::attach::poll_attach;
use crate::error::ControlError;
use crate::event::DoneLatch;
use crate::event::EventHub;
use crate::execution::CancelOutcome;
use crate::execution::Execution;
use crate::execution::ExecutionEventPayload;
use crate::execution::ExecutionOptions;
use crate::execution::ExecutionSnapshot;
use crate::execution::ExecutionStatus;
use crate::execution::append_capped;
use crate::id::mint_execution_id;
use crate::id::mint_run_id;
use crate::id::mint_sandbox_id;
use crate::id::normalize_command;
use crate::id::signal_to_exit;
use crate::sandbox::Sandbox;
use crate::sandbox::SandboxSnapshot;
use crate::sandbox::SandboxStatus;
use crate::state::State;

pub use crate::execution::ExecutionEvent;
pub use crate::sandbox::SandboxEvent;

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub default_backend: String,
    pub stdout_stderr_cap_bytes: usize,
    pub sandbox_event_history_cap: usize,
    pub execution_event_history_cap: usize,
    pub sandbox_event_channel_capacity: usize,
    pub execution_event_channel_capacity: usize,
    pub max_finished_executions: usize,
    pub max_stopped_sandboxes: usize,
    pub max_age: Duration,
    pub default_download_max_bytes: u64,
    pub default_cancel_signal: i32,
    pub terminate_signal: i32,
    pub default_launch_timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            default_backend: "firecracker".to_string(),
            stdout_stderr_cap_bytes: 1024 * 1024,
            sandbox_event_history_cap: 256,
            execution_event_history_cap: 2048,
            sandbox_event_channel_capacity: 64,
            execution_event_channel_capacity: 128,
            max_finished_executions: 2048,
            max_stopped_sandboxes: 256,
            max_age: Duration::from_secs(24 * 3600),
            default_download_max_bytes: 10 * 1024 * 1024,
            default_cancel_signal: 2,
            terminate_signal: 15,
            default_launch_timeout: Duration::from_secs(300),
        }
    }
}

pub struct SandboxSubscription {
    pub history: Vec<SandboxEvent>,
    pub receiver: mpsc::Receiver<SandboxEvent>,
    pub done: Arc<DoneLatch>,
    sandbox_id: String,
    subscriber_id: u64,
    state: Arc<RwLock<State>>,
}

impl SandboxSubscription {
    pub async fn unsubscribe(self) {
        let mut guard = self.state.write().await;
        if let Some(sandbox) = guard.sandboxes.get_mut(&self.sandbox_id) {
            sandbox.events.unsubscribe(self.subscriber_id);
        }
    }
}

pub struct ExecutionSubscription {
    pub history: Vec<ExecutionEvent>,
    pub receiver: mpsc::Receiver<ExecutionEvent>,
    pub done: Arc<DoneLatch>,
    key: (String, String),
    subscriber_id: u64,
    state: Arc<RwLock<State>>,
}

impl ExecutionSubscription {
    pub async fn unsubscribe(self) {
        let mut guard = self.state.write().await;
        if let Some(exec) = guard.executions.get_mut(&self.key) {
            exec.events.unsubscribe(self.subscriber_id);
        }
    }
}

pub struct ControlService {
    state: Arc<RwLock<State>>,
    backends: HashMap<String, BackendAdapter>,
    config: ControlConfig,
}

impl ControlService {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            backends: HashMap::new(),
            config,
        }
    }

    pub fn register_backend(&mut self, adapter: BackendAdapter) {
        self.backends.insert(adapter.name.clone(), adapter);
    }

    // -----------------------------------------------------------------
    // Sandbox registry (C6)
    // -----------------------------------------------------------------

    pub async fn create_sandbox(
        &self,
        policy: Option<CompiledPolicy>,
        backend: Option<String>,
        launch_config: Option<serde_json::Value>,
    ) -> Result<SandboxSnapshot, ControlError> {
        let policy = policy.ok_or(ControlError::MissingPolicy)?;
        if policy.image_ref.trim().is_empty() {
            return Err(ControlError::InvalidPolicy(
                "missing image reference".to_string(),
            ));
        }

        let backend_name = backend.unwrap_or_else(|| self.config.default_backend.clone());
        let adapter = self
            .backends
            .get(&backend_name)
            .ok_or_else(|| ControlError::UnknownBackend(backend_name.clone()))?
            .clone();

        let id = mint_sandbox_id();

        if let Some(persistent) = &adapter.persistent {
            persistent
                .provision_sandbox(ProvisionRequest {
                    sandbox_id: id.clone(),
                    policy: policy.clone(),
                })
                .await
                .map_err(|e| ControlError::Adapter(e.to_string()))?;
        }

        let now = SystemTime::now();
        let mut sandbox = Sandbox {
            id: id.clone(),
            backend: backend_name,
            policy,
            launch_config: launch_config.unwrap_or(serde_json::Value::Null),
            active_execution_id: None,
            download_in_progress: false,
            created_at: now,
            updated_at: now,
            last_execution_id: None,
            status: SandboxStatus::Ready,
            events: EventHub::new(
                self.config.sandbox_event_history_cap,
                self.config.sandbox_event_channel_capacity,
            ),
            done: Arc::new(DoneLatch::new()),
        };
        sandbox.emit(SandboxStatus::Ready, None);
        let snapshot = sandbox.snapshot();

        {
            let mut state = self.state.write().await;
            state.sandboxes.insert(id, sandbox);
        }
        self.prune().await;
        Ok(snapshot)
    }

    pub async fn get_sandbox(&self, id: &str) -> Result<SandboxSnapshot, ControlError> {
        if id.trim().is_empty() {
            return Err(ControlError::MissingSandboxId);
        }
        let state = self.state.read().await;
        state
            .sandboxes
            .get(id)
            .map(Sandbox::snapshot)
            .ok_or_else(|| ControlError::UnknownSandbox(id.to_string()))
    }

    pub async fn list_sandboxes(&self) -> Vec<SandboxSnapshot> {
        let state = self.state.read().await;
        let mut list: Vec<_> = state.sandboxes.values().map(Sandbox::snapshot).collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    pub async fn subscribe_sandbox_events(
        &self,
        sandbox_id: &str,
    ) -> Result<SandboxSubscription, ControlError> {
        let mut state = self.state.write().await;
        let sandbox = state
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| ControlError::UnknownSandbox(sandbox_id.to_string()))?;
        let done = sandbox.done.clone();
        let (history, receiver, subscriber_id) = sandbox.events.subscribe();
        Ok(SandboxSubscription {
            history,
            receiver,
            done,
            sandbox_id: sandbox_id.to_string(),
            subscriber_id,
            state: self.state.clone(),
        })
    }

    pub async fn terminate_sandbox(&self, id: &str) -> Result<(), ControlError> {
        if id.trim().is_empty() {
            return Err(ControlError::MissingSandboxId);
        }

        let backend_name = {
            let state = self.state.read().await;
            let sandbox = state
                .sandboxes
                .get(id)
                .ok_or_else(|| ControlError::UnknownSandbox(id.to_string()))?;
            if sandbox.status.is_terminal() {
                return Ok(());
            }
            sandbox.backend.clone()
        };

        let terminate_signal = self.config.terminate_signal;
        let mut cancel_tokens: Vec<CancellationToken> = Vec::new();

        {
            let mut state = self.state.write().await;
            if let Some(sandbox) = state.sandboxes.get_mut(id) {
                sandbox.emit(SandboxStatus::Stopping, None);
            }

            let keys: Vec<(String, String)> = state
                .executions
                .iter()
                .filter(|(key, exec)| key.0 == id && !exec.status.is_terminal())
                .map(|(key, _)| key.clone())
                .collect();

            for key in keys {
                let mut was_queued = false;
                if let Some(exec) = state.executions.get_mut(&key) {
                    exec.cancel_requested = true;
                    exec.cancel_signal = Some(terminate_signal);
                    exec.record_event(ExecutionEventPayload::Message(format!(
                        "cancel-request (signal={terminate_signal})"
                    )));
                    if exec.status == ExecutionStatus::Queued {
                        was_queued = true;
                        let exit_code = signal_to_exit(terminate_signal);
                        exec.finalize(ExecutionStatus::Canceled, exit_code, None);
                    } else if let Some(token) = exec.cancel_token.clone() {
                        cancel_tokens.push(token);
                    }
                }
                if was_queued {
                    if let Some(sandbox) = state.sandboxes.get_mut(id) {
                        if sandbox.active_execution_id.as_deref() == Some(key.1.as_str()) {
                            sandbox.active_execution_id = None;
                        }
                    }
                }
            }
        }

        for token in cancel_tokens {
            token.cancel();
        }

        let mut adapter_err = None;
        if let Some(adapter) = self.backends.get(&backend_name) {
            if let Some(persistent) = &adapter.persistent {
                if let Err(err) = persistent.terminate_sandbox(id).await {
                    tracing::warn!(sandbox_id = %id, %err, "adapter terminate_sandbox failed");
                    adapter_err = Some(err.to_string());
                }
            }
        }

        {
            let mut state = self.state.write().await;
            if let Some(sandbox) = state.sandboxes.get_mut(id) {
                sandbox.emit(SandboxStatus::Stopped, None);
                sandbox.done.close();
            }
        }

        self.prune().await;

        match adapter_err {
            Some(err) => Err(ControlError::Adapter(err)),
            None => Ok(()),
        }
    }

    pub async fn download_sandbox_file(
        &self,
        sandbox_id: &str,
        absolute_path: &str,
        max_bytes: Option<u64>,
    ) -> Result<Vec<u8>, ControlError> {
        if sandbox_id.trim().is_empty() {
            return Err(ControlError::MissingSandboxId);
        }
        let max_bytes = max_bytes.unwrap_or(self.config.default_download_max_bytes);

        let backend_name = {
            let mut state = self.state.write().await;
            let sandbox = state
                .sandboxes
                .get_mut(sandbox_id)
                .ok_or_else(|| ControlError::UnknownSandbox(sandbox_id.to_string()))?;
            if sandbox.status != SandboxStatus::Ready {
                return Err(ControlError::SandboxNotReady(sandbox_id.to_string()));
            }
            if sandbox.download_in_progress {
                return Err(ControlError::SandboxBusyDownload(sandbox_id.to_string()));
            }
            if let Some(active) = &sandbox.active_execution_id {
                return Err(ControlError::SandboxBusyExecution {
                    sandbox_id: sandbox_id.to_string(),
                    execution_id: active.clone(),
                });
            }
            sandbox.download_in_progress = true;
            sandbox.backend.clone()
        };

        let result = self
            .run_download(&backend_name, sandbox_id, absolute_path, max_bytes)
            .await;

        {
            let mut state = self.state.write().await;
            if let Some(sandbox) = state.sandboxes.get_mut(sandbox_id) {
                sandbox.download_in_progress = false;
            }
        }

        result
    }

    async fn run_download(
        &self,
        backend_name: &str,
        sandbox_id: &str,
        absolute_path: &str,
        max_bytes: u64,
    ) -> Result<Vec<u8>, ControlError> {
        let adapter = self
            .backends
            .get(backend_name)
            .ok_or_else(|| ControlError::UnknownBackend(backend_name.to_string()))?;
        let download = adapter
            .download
            .as_ref()
            .ok_or_else(|| ControlError::Adapter("download capability not supported".to_string()))?;
        download
            .download_sandbox_file(sandbox_id, absolute_path, max_bytes)
            .await
            .map_err(|e| ControlError::Adapter(e.to_string()))
    }

    // -----------------------------------------------------------------
    // Execution engine (C7)
    // -----------------------------------------------------------------

    pub async fn create_execution(
        &self,
        sandbox_id: &str,
        command: Vec<String>,
        options: ExecutionOptions,
    ) -> Result<ExecutionSnapshot, ControlError> {
        if sandbox_id.trim().is_empty() {
            return Err(ControlError::MissingSandboxId);
        }
        if command.is_empty() {
            return Err(ControlError::MissingCommand);
        }
        let command = normalize_command(command);
        if command.is_empty() {
            return Err(ControlError::MissingCommand);
        }

        let execution_id = mint_execution_id();
        let backend_name;
        let snapshot;

        {
            let mut state = self.state.write().await;
            let (backend, image_ref, image_digest) = {
                let sandbox = state
                    .sandboxes
                    .get(sandbox_id)
                    .ok_or_else(|| ControlError::UnknownSandbox(sandbox_id.to_string()))?;
                if sandbox.status != SandboxStatus::Ready {
                    return Err(ControlError::SandboxNotReady(sandbox_id.to_string()));
                }
                if let Some(active) = &sandbox.active_execution_id {
                    return Err(ControlError::SandboxBusyExecution {
                        sandbox_id: sandbox_id.to_string(),
                        execution_id: active.clone(),
                    });
                }
                if sandbox.download_in_progress {
                    return Err(ControlError::SandboxBusyDownload(sandbox_id.to_string()));
                }
                (
                    sandbox.backend.clone(),
                    sandbox.policy.image_ref.clone(),
                    sandbox.policy.image_digest.clone(),
                )
            };
            backend_name = backend;

            let now = SystemTime::now();
            let mut execution = Execution {
                id: execution_id.clone(),
                sandbox_id: sandbox_id.to_string(),
                run_id: None,
                image_ref,
                image_digest,
                command,
                options,
                status: ExecutionStatus::Queued,
                exit_code: None,
                created_at: now,
                started_at: None,
                finished_at: None,
                message: None,
                stdout: Vec::new(),
                stderr: Vec::new(),
                launched_vm: false,
                plan_path: None,
                run_dir: None,
                cancel_requested: false,
                cancel_signal: None,
                cancel_token: None,
                attach_stdin: None,
                attach_resize: None,
                events: EventHub::new(
                    self.config.execution_event_history_cap,
                    self.config.execution_event_channel_capacity,
                ),
                done: Arc::new(DoneLatch::new()),
            };
            execution.record_event(ExecutionEventPayload::Message("queued".to_string()));
            snapshot = execution.snapshot();

            state
                .executions
                .insert((sandbox_id.to_string(), execution_id.clone()), execution);

            if let Some(sandbox) = state.sandboxes.get_mut(sandbox_id) {
                sandbox.active_execution_id = Some(execution_id.clone());
                sandbox.last_execution_id = Some(execution_id.clone());
                sandbox.updated_at = now;
            }
        }

        self.spawn_driver(sandbox_id.to_string(), execution_id, backend_name);
        self.prune().await;
        Ok(snapshot)
    }

    pub async fn get_execution(
        &self,
        sandbox_id: &str,
        execution_id: &str,
    ) -> Result<ExecutionSnapshot, ControlError> {
        if sandbox_id.trim().is_empty() {
            return Err(ControlError::MissingSandboxId);
        }
        if execution_id.trim().is_empty() {
            return Err(ControlError::MissingExecutionId);
        }
        let state = self.state.read().await;
        state
            .executions
            .get(&(sandbox_id.to_string(), execution_id.to_string()))
            .map(Execution::snapshot)
            .ok_or_else(|| ControlError::UnknownExecution {
                sandbox_id: sandbox_id.to_string(),
                execution_id: execution_id.to_string(),
            })
    }

    pub async fn wait_execution(
        &self,
        sandbox_id: &str,
        execution_id: &str,
    ) -> Result<ExecutionSnapshot, ControlError> {
        let done = {
            let state = self.state.read().await;
            let exec = state
                .executions
                .get(&(sandbox_id.to_string(), execution_id.to_string()))
                .ok_or_else(|| ControlError::UnknownExecution {
                    sandbox_id: sandbox_id.to_string(),
                    execution_id: execution_id.to_string(),
                })?;
            exec.done.clone()
        };
        done.wait().await;
        self.get_execution(sandbox_id, execution_id).await
    }

    pub async fn subscribe_execution_events(
        &self,
        sandbox_id: &str,
        execution_id: &str,
    ) -> Result<ExecutionSubscription, ControlError> {
        let key = (sandbox_id.to_string(), execution_id.to_string());
        let mut state = self.state.write().await;
        let exec = state
            .executions
            .get_mut(&key)
            .ok_or_else(|| ControlError::UnknownExecution {
                sandbox_id: sandbox_id.to_string(),
                execution_id: execution_id.to_string(),
            })?;
        let done = exec.done.clone();
        let (history, receiver, subscriber_id) = exec.events.subscribe();
        Ok(ExecutionSubscription {
            history,
            receiver,
            done,
            key,
            subscriber_id,
            state: self.state.clone(),
        })
    }

    pub async fn cancel_execution(
        &self,
        sandbox_id: &str,
        execution_id: &str,
        signal: Option<i32>,
    ) -> Result<CancelOutcome, ControlError> {
        if sandbox_id.trim().is_empty() {
            return Err(ControlError::MissingSandboxId);
        }
        if execution_id.trim().is_empty() {
            return Err(ControlError::MissingExecutionId);
        }
        let signal = signal.unwrap_or(self.config.default_cancel_signal);
        let key = (sandbox_id.to_string(), execution_id.to_string());

        let mut cancel_token = None;
        let outcome;
        let mut clear_active = false;

        {
            let mut state = self.state.write().await;
            let exec =
                state
                    .executions
                    .get_mut(&key)
                    .ok_or_else(|| ControlError::UnknownExecution {
                        sandbox_id: sandbox_id.to_string(),
                        execution_id: execution_id.to_string(),
                    })?;

            if exec.status.is_terminal() {
                return Ok(CancelOutcome {
                    accepted: false,
                    status: exec.status,
                });
            }

            exec.cancel_requested = true;
            exec.cancel_signal = Some(signal);
            exec.record_event(ExecutionEventPayload::Message(format!(
                "cancel-request (signal={signal})"
            )));

            if exec.status == ExecutionStatus::Queued {
                let exit_code = signal_to_exit(signal);
                exec.finalize(ExecutionStatus::Canceled, exit_code, None);
                outcome = CancelOutcome {
                    accepted: true,
                    status: ExecutionStatus::Canceled,
                };
                clear_active = true;
            } else {
                cancel_token = exec.cancel_token.clone();
                outcome = CancelOutcome {
                    accepted: true,
                    status: exec.status,
                };
            }
        }

        if clear_active {
            let mut state = self.state.write().await;
            if let Some(sandbox) = state.sandboxes.get_mut(sandbox_id) {
                if sandbox.active_execution_id.as_deref() == Some(execution_id) {
                    sandbox.active_execution_id = None;
                }
            }
        }

        if let Some(token) = cancel_token {
            token.cancel();
        }

        self.prune().await;
        Ok(outcome)
    }

    pub async fn write_execution_stdin(
        &self,
        sandbox_id: &str,
        execution_id: &str,
        data: Vec<u8>,
    ) -> Result<(), ControlError> {
        if sandbox_id.trim().is_empty() {
            return Err(ControlError::MissingSandboxId);
        }
        if execution_id.trim().is_empty() {
            return Err(ControlError::MissingExecutionId);
        }
        let writer = poll_attach(
            &self.state,
            sandbox_id,
            execution_id,
            STDIN_DEADLINE,
            |exec| exec.attach_stdin.clone(),
            ControlError::StdinUnsupported,
        )
        .await?;
        writer
            .write_stdin(&data)
            .map_err(|e| ControlError::Adapter(e.to_string()))
    }

    pub async fn resize_execution_tty(
        &self,
        sandbox_id: &str,
        execution_id: &str,
        cols: u32,
        rows: u32,
    ) -> Result<(), ControlError> {
        if sandbox_id.trim().is_empty() {
            return Err(ControlError::MissingSandboxId);
        }
        if execution_id.trim().is_empty() {
            return Err(ControlError::MissingExecutionId);
        }
        let writer = poll_attach(
            &self.state,
            sandbox_id,
            execution_id,
            RESIZE_DEADLINE,
            |exec| exec.attach_resize.clone(),
            ControlError::ResizeUnsupported,
        )
        .await?;
        writer
            .resize_tty(cols, rows)
            .map_err(|e| ControlError::Adapter(e.to_string()))
    }

    fn spawn_driver(&self, sandbox_id: String, execution_id: String, backend_name: String) {
        let state = self.state.clone();
        let backends = self.backends.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            run_driver(state, backends, config, sandbox_id, execution_id, backend_name).await;
        });
    }

    async fn prune(&self) {
        prune_state(&self.state, &self.config).await;
    }
}

// -----------------------------------------------------------------------
// Execution driver
// -----------------------------------------------------------------------

struct DriverCallbacks {
    state: Arc<RwLock<State>>,
    key: (String, String),
    cap: usize,
}

impl DriverCallbacks {
    fn record_chunk(&self, data: &[u8], is_stdout: bool) {
        let mut guard = self.state.blocking_write();
        if let Some(exec) = guard.executions.get_mut(&self.key) {
            if exec.status.is_terminal() {
                return;
            }
            if is_stdout {
                append_capped(&mut exec.stdout, data, self.cap);
                exec.record_event(ExecutionEventPayload::Stdout(data.to_vec()));
            } else {
                append_capped(&mut exec.stderr, data, self.cap);
                exec.record_event(ExecutionEventPayload::Stderr(data.to_vec()));
            }
        }
    }
}

impl StreamCallbacks for DriverCallbacks {
    fn on_stdout(&self, data: &[u8]) {
        self.record_chunk(data, true);
    }

    fn on_stderr(&self, data: &[u8]) {
        self.record_chunk(data, false);
    }

    fn on_attach(&self, attach: Arc<dyn AttachIo>) {
        let mut guard = self.state.blocking_write();
        if let Some(exec) = guard.executions.get_mut(&self.key) {
            if !exec.status.is_terminal() {
                exec.attach_stdin = Some(attach.clone());
                exec.attach_resize = Some(attach);
            }
        }
    }
}

/// Absorb a streaming adapter's final captured result into the retained
/// buffer without double-appending what was already streamed: if
/// `retained` already contains `buffered` as a prefix (including the
/// equal case), nothing more is appended; if `buffered` extends
/// `retained`, only the new suffix is appended; otherwise the adapter's
/// capture didn't line up with what was streamed and the whole thing is
/// appended rather than silently dropped.
fn reconcile_delta(retained: &mut Vec<u8>, buffered: &[u8], cap: usize) {
    if buffered.is_empty() {
        return;
    }
    if retained.as_slice().starts_with(buffered) {
        return;
    }
    if buffered.starts_with(retained.as_slice()) {
        let suffix = &buffered[retained.len()..];
        append_capped(retained, suffix, cap);
        return;
    }
    append_capped(retained, buffered, cap);
}

fn message_already_in_tail(buf: &[u8], message: &str) -> bool {
    String::from_utf8_lossy(buf).contains(message)
}

async fn run_driver(
    state: Arc<RwLock<State>>,
    backends: HashMap<String, BackendAdapter>,
    config: ControlConfig,
    sandbox_id: String,
    execution_id: String,
    backend_name: String,
) {
    let key = (sandbox_id.clone(), execution_id.clone());

    let adapter = {
        let mut guard = state.write().await;

        match guard.executions.get(&key) {
            Some(exec) if exec.status.is_terminal() => return,
            Some(_) => {}
            None => return,
        }

        let sandbox_status = guard.sandboxes.get(&sandbox_id).map(|s| s.status);
        match sandbox_status {
            None => {
                if let Some(exec) = guard.executions.get_mut(&key) {
                    exec.finalize(
                        ExecutionStatus::Failed,
                        1,
                        Some("sandbox no longer exists".to_string()),
                    );
                }
                return;
            }
            Some(SandboxStatus::Stopping) | Some(SandboxStatus::Stopped) => {
                if let Some(exec) = guard.executions.get_mut(&key) {
                    let exit_code = signal_to_exit(config.terminate_signal);
                    exec.finalize(
                        ExecutionStatus::Canceled,
                        exit_code,
                        Some("sandbox is stopping".to_string()),
                    );
                }
                return;
            }
            Some(SandboxStatus::Ready) => {}
        }

        let adapter = match backends.get(&backend_name) {
            Some(a) => a.clone(),
            None => {
                if let Some(exec) = guard.executions.get_mut(&key) {
                    exec.finalize(
                        ExecutionStatus::Failed,
                        1,
                        Some(format!("unknown backend {backend_name}")),
                    );
                }
                return;
            }
        };

        let token = CancellationToken::new();
        let run_id = mint_run_id();

        if let Some(exec) = guard.executions.get_mut(&key) {
            exec.cancel_token = Some(token);
            exec.started_at = Some(SystemTime::now());
            exec.status = ExecutionStatus::Running;
            exec.run_id = Some(run_id);
            exec.record_event(ExecutionEventPayload::Message("started".to_string()));
        }

        adapter
    };

    let built = {
        let guard = state.read().await;
        let exec = match guard.executions.get(&key) {
            Some(e) => e,
            None => return,
        };
        let policy = match guard.sandboxes.get(&sandbox_id).map(|s| s.policy.clone()) {
            Some(p) => p,
            None => return,
        };
        let cancel_token = match exec.cancel_token.clone() {
            Some(t) => t,
            None => return,
        };
        (
            RunRequest {
                sandbox_id: sandbox_id.clone(),
                execution_id: execution_id.clone(),
                run_id: exec.run_id.clone().unwrap_or_default(),
                command: exec.command.clone(),
                tty: exec.options.tty,
                launch_timeout_secs: exec.options.launch_timeout_secs,
                run_dir: std::env::temp_dir()
                    .join("cleanroom-runs")
                    .join(&execution_id),
                policy,
            },
            cancel_token,
        )
    };
    let (run_request, cancel_token) = built;

    let timeout = run_request
        .launch_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(config.default_launch_timeout);

    let path = adapter.select_path();
    let callbacks = Arc::new(DriverCallbacks {
        state: state.clone(),
        key: key.clone(),
        cap: config.stdout_stderr_cap_bytes,
    });

    let run_future = async move {
        match path {
            Some(SelectedPath::Persistent) => match &adapter.persistent {
                Some(persistent) => persistent.run_in_sandbox(run_request, callbacks).await,
                None => Err(BackendError::Unsupported),
            },
            Some(SelectedPath::Streaming) => match &adapter.streaming {
                Some(streaming) => streaming.run_stream(run_request, callbacks).await,
                None => Err(BackendError::Unsupported),
            },
            Some(SelectedPath::Baseline) => match &adapter.baseline {
                Some(baseline) => baseline.run(run_request).await,
                None => Err(BackendError::Unsupported),
            },
            None => Err(BackendError::Unsupported),
        }
    };
    let timed_out = match tokio::time::timeout(timeout, run_future).await {
        Ok(outcome) => Some(outcome),
        Err(_elapsed) => None,
    };

    {
        let mut guard = state.write().await;
        let exec = match guard.executions.get_mut(&key) {
            Some(e) => e,
            None => return,
        };

        match timed_out {
            None => {
                let exit_code = 124;
                let message = format!("execution exceeded launch timeout of {}s", timeout.as_secs());
                let line = format!("{message}\n");
                append_capped(&mut exec.stderr, line.as_bytes(), config.stdout_stderr_cap_bytes);
                exec.record_event(ExecutionEventPayload::Stderr(line.into_bytes()));
                exec.finalize(ExecutionStatus::TimedOut, exit_code, Some(message));
            }
            Some(Err(err)) => {
                let (status, exit_code) = if cancel_token.is_cancelled() || exec.cancel_requested {
                    (
                        ExecutionStatus::Canceled,
                        signal_to_exit(exec.cancel_signal.unwrap_or(config.default_cancel_signal)),
                    )
                } else {
                    (ExecutionStatus::Failed, 1)
                };
                let message = err.to_string();
                let line = format!("{message}\n");
                append_capped(&mut exec.stderr, line.as_bytes(), config.stdout_stderr_cap_bytes);
                exec.record_event(ExecutionEventPayload::Stderr(line.into_bytes()));
                exec.finalize(status, exit_code, Some(message));
            }
            Some(Ok(result)) => {
                match path {
                    Some(SelectedPath::Baseline) => {
                        append_capped(&mut exec.stdout, &result.stdout, config.stdout_stderr_cap_bytes);
                        append_capped(&mut exec.stderr, &result.stderr, config.stdout_stderr_cap_bytes);
                    }
                    Some(SelectedPath::Streaming) | Some(SelectedPath::Persistent) => {
                        reconcile_delta(&mut exec.stdout, &result.stdout, config.stdout_stderr_cap_bytes);
                        reconcile_delta(&mut exec.stderr, &result.stderr, config.stdout_stderr_cap_bytes);
                    }
                    None => {}
                }

                if result.exit_code != 0 {
                    if let Some(message) = &result.message {
                        if !message_already_in_tail(&exec.stderr, message) {
                            let line = format!("{message}\n");
                            append_capped(&mut exec.stderr, line.as_bytes(), config.stdout_stderr_cap_bytes);
                        }
                    }
                }

                exec.launched_vm = result.launched_vm;
                exec.plan_path = result.plan_path.clone();
                if result.run_dir.is_some() {
                    exec.run_dir = result.run_dir.clone();
                }
                if let Some(image_ref) = &result.image_ref {
                    exec.image_ref = image_ref.clone();
                }
                if let Some(image_digest) = &result.image_digest {
                    exec.image_digest = image_digest.clone();
                }

                let status = if exec.cancel_requested {
                    ExecutionStatus::Canceled
                } else if result.exit_code == 0 {
                    ExecutionStatus::Succeeded
                } else {
                    ExecutionStatus::Failed
                };
                exec.finalize(status, result.exit_code, result.message.clone());
            }
        }

        if let Some(sandbox) = guard.sandboxes.get_mut(&sandbox_id) {
            if sandbox.active_execution_id.as_deref() == Some(execution_id.as_str()) {
                sandbox.active_execution_id = None;
            }
        }
    }

    prune_state(&state, &config).await;
}

// -----------------------------------------------------------------------
// Retention pruning
// -----------------------------------------------------------------------

async fn prune_state(state: &Arc<RwLock<State>>, config: &ControlConfig) {
    let mut guard = state.write().await;
    let now = SystemTime::now();

    let aged_out: Vec<(String, String)> = guard
        .executions
        .iter()
        .filter(|(_, e)| e.status.is_terminal())
        .filter(|(_, e)| {
            e.finished_at
                .map(|f| now.duration_since(f).unwrap_or_default() > config.max_age)
                .unwrap_or(false)
        })
        .map(|(k, _)| k.clone())
        .collect();
    for key in &aged_out {
        evict_execution(&mut guard, key);
    }

    let mut finished: Vec<((String, String), SystemTime)> = guard
        .executions
        .iter()
        .filter(|(_, e)| e.status.is_terminal())
        .filter_map(|(k, e)| e.finished_at.map(|f| (k.clone(), f)))
        .collect();
    finished.sort_by_key(|(_, f)| *f);
    if finished.len() > config.max_finished_executions {
        let excess = finished.len() - config.max_finished_executions;
        for (key, _) in finished.into_iter().take(excess) {
            evict_execution(&mut guard, &key);
        }
    }

    let stale_stopped: Vec<String> = guard
        .sandboxes
        .iter()
        .filter(|(_, s)| s.status == SandboxStatus::Stopped && s.active_execution_id.is_none())
        .filter(|(_, s)| now.duration_since(s.updated_at).unwrap_or_default() > config.max_age)
        .map(|(id, _)| id.clone())
        .collect();
    for id in stale_stopped {
        evict_sandbox(&mut guard, &id);
    }

    let mut stopped: Vec<(String, SystemTime)> = guard
        .sandboxes
        .iter()
        .filter(|(_, s)| s.status == SandboxStatus::Stopped && s.active_execution_id.is_none())
        .map(|(id, s)| (id.clone(), s.updated_at))
        .collect();
    stopped.sort_by_key(|(_, t)| *t);
    if stopped.len() > config.max_stopped_sandboxes {
        let excess = stopped.len() - config.max_stopped_sandboxes;
        for (id, _) in stopped.into_iter().take(excess) {
            evict_sandbox(&mut guard, &id);
        }
    }
}

fn evict_execution(state: &mut State, key: &(String, String)) {
    if let Some(mut exec) = state.executions.remove(key) {
        exec.events.close_all();
        exec.done.close();
    }
}

fn evict_sandbox(state: &mut State, id: &str) {
    if let Some(mut sandbox) = state.sandboxes.remove(id) {
        sandbox.events.close_all();
        sandbox.done.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cleanroom_backend::BaselineRun;
    use cleanroom_backend::RunResult;
    use tokio::sync::Notify;

    fn policy() -> CompiledPolicy {
        CompiledPolicy {
            image_ref: "alpine:latest".to_string(),
            image_digest: "sha256:deadbeef".to_string(),
            content_hash: "hash".to_string(),
            raw: serde_json::Value::Null,
        }
    }

    struct EchoBaseline;

    #[async_trait]
    impl BaselineRun for EchoBaseline {
        async fn run(&self, request: RunRequest) -> Result<RunResult, BackendError> {
            Ok(RunResult {
                exit_code: 0,
                stdout: request.command.join(" ").into_bytes(),
                run_id: request.run_id,
                ..Default::default()
            })
        }
    }

    struct BlockingBaseline {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl BaselineRun for BlockingBaseline {
        async fn run(&self, _request: RunRequest) -> Result<RunResult, BackendError> {
            self.release.notified().await;
            Ok(RunResult::default())
        }
    }

    fn adapter_with(baseline: Arc<dyn BaselineRun>) -> BackendAdapter {
        BackendAdapter {
            name: "test".to_string(),
            baseline: Some(baseline),
            streaming: None,
            persistent: None,
            download: None,
        }
    }

    fn service_with(adapter: BackendAdapter) -> ControlService {
        let mut service = ControlService::new(ControlConfig::default());
        service.register_backend(adapter);
        service
    }

    #[tokio::test]
    async fn happy_path_echo_completes_successfully() {
        let service = service_with(adapter_with(Arc::new(EchoBaseline)));
        let sandbox = service
            .create_sandbox(Some(policy()), Some("test".to_string()), None)
            .await
            .unwrap();
        let exec = service
            .create_execution(
                &sandbox.id,
                vec!["echo".to_string(), "hi".to_string()],
                ExecutionOptions::default(),
            )
            .await
            .unwrap();

        let finished = service.wait_execution(&sandbox.id, &exec.id).await.unwrap();
        assert_eq!(finished.status, ExecutionStatus::Succeeded);
        assert_eq!(finished.exit_code, Some(0));
        assert_eq!(finished.stdout, b"echo hi");
    }

    #[tokio::test]
    async fn cancel_requested_while_running_finalizes_as_canceled() {
        let release = Arc::new(Notify::new());
        let adapter = adapter_with(Arc::new(BlockingBaseline {
            release: release.clone(),
        }));
        let service = service_with(adapter);
        let sandbox = service
            .create_sandbox(Some(policy()), Some("test".to_string()), None)
            .await
            .unwrap();
        let exec = service
            .create_execution(&sandbox.id, vec!["sleep".to_string()], ExecutionOptions::default())
            .await
            .unwrap();

        loop {
            let snapshot = service.get_execution(&sandbox.id, &exec.id).await.unwrap();
            if snapshot.status == ExecutionStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let outcome = service
            .cancel_execution(&sandbox.id, &exec.id, None)
            .await
            .unwrap();
        assert!(outcome.accepted);

        release.notify_one();

        let finished = service.wait_execution(&sandbox.id, &exec.id).await.unwrap();
        assert_eq!(finished.status, ExecutionStatus::Canceled);
    }

    #[tokio::test]
    async fn create_execution_rejects_when_sandbox_busy() {
        let release = Arc::new(Notify::new());
        let adapter = adapter_with(Arc::new(BlockingBaseline {
            release: release.clone(),
        }));
        let service = service_with(adapter);
        let sandbox = service
            .create_sandbox(Some(policy()), Some("test".to_string()), None)
            .await
            .unwrap();
        let first = service
            .create_execution(&sandbox.id, vec!["sleep".to_string()], ExecutionOptions::default())
            .await
            .unwrap();

        let err = service
            .create_execution(&sandbox.id, vec!["echo".to_string()], ExecutionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::SandboxBusyExecution { .. }));

        release.notify_one();
        let _ = service.wait_execution(&sandbox.id, &first.id).await;
    }

    fn blank_sandbox(id: &str) -> Sandbox {
        let now = SystemTime::now();
        Sandbox {
            id: id.to_string(),
            backend: "test".to_string(),
            policy: policy(),
            launch_config: serde_json::Value::Null,
            active_execution_id: None,
            download_in_progress: false,
            created_at: now,
            updated_at: now,
            last_execution_id: None,
            status: SandboxStatus::Ready,
            events: EventHub::new(8, 8),
            done: Arc::new(DoneLatch::new()),
        }
    }

    fn finished_execution(sandbox_id: &str, id: &str) -> Execution {
        let now = SystemTime::now();
        Execution {
            id: id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            run_id: None,
            image_ref: "alpine:latest".to_string(),
            image_digest: "sha256:deadbeef".to_string(),
            command: vec!["echo".to_string()],
            options: ExecutionOptions::default(),
            status: ExecutionStatus::Succeeded,
            exit_code: Some(0),
            created_at: now,
            started_at: Some(now),
            finished_at: Some(now),
            message: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            launched_vm: false,
            plan_path: None,
            run_dir: None,
            cancel_requested: false,
            cancel_signal: None,
            cancel_token: None,
            attach_stdin: None,
            attach_resize: None,
            events: EventHub::new(8, 8),
            done: Arc::new(DoneLatch::new()),
        }
    }

    #[tokio::test]
    async fn retention_prunes_finished_executions_over_cap() {
        let config = ControlConfig {
            max_finished_executions: 5,
            ..ControlConfig::default()
        };
        let service = ControlService::new(config.clone());
        let sandbox_id = "cr-test".to_string();

        {
            let mut guard = service.state.write().await;
            guard.sandboxes.insert(sandbox_id.clone(), blank_sandbox(&sandbox_id));
            for i in 0..10 {
                let exec = finished_execution(&sandbox_id, &format!("exec-{i}"));
                guard
                    .executions
                    .insert((sandbox_id.clone(), exec.id.clone()), exec);
            }
        }

        prune_state(&service.state, &config).await;

        let guard = service.state.read().await;
        assert_eq!(guard.executions.len(), 5);
    }
}
