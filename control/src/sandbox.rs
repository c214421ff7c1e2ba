//! Sandbox entity (C6): lifecycle state, its event stream, and the
//! snapshot type handed back across the API boundary.

use std::sync::Arc;
use std::time::SystemTime;

use cleanroom_backend::CompiledPolicy;

use crate::event::DoneLatch;
use crate::event::EventHub;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Ready,
    Stopping,
    Stopped,
}

impl SandboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxStatus::Ready => "ready",
            SandboxStatus::Stopping => "stopping",
            SandboxStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SandboxStatus::Stopped)
    }
}

#[derive(Debug, Clone)]
pub struct SandboxEvent {
    pub sandbox_id: String,
    pub status: SandboxStatus,
    pub message: Option<String>,
    pub occurred_at: SystemTime,
}

/// Internal, mutable sandbox record. Not `Clone`: its fan-out state
/// (`events`) and done latch are identity, not value, types.
pub struct Sandbox {
    pub id: String,
    pub backend: String,
    pub policy: CompiledPolicy,
    pub launch_config: serde_json::Value,
    pub active_execution_id: Option<String>,
    pub download_in_progress: bool,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub last_execution_id: Option<String>,
    pub status: SandboxStatus,
    pub events: EventHub<SandboxEvent>,
    pub done: Arc<DoneLatch>,
}

impl Sandbox {
    pub fn snapshot(&self) -> SandboxSnapshot {
        SandboxSnapshot {
            id: self.id.clone(),
            backend: self.backend.clone(),
            status: self.status,
            active_execution_id: self.active_execution_id.clone(),
            download_in_progress: self.download_in_progress,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_execution_id: self.last_execution_id.clone(),
            image_ref: self.policy.image_ref.clone(),
            image_digest: self.policy.image_digest.clone(),
        }
    }

    pub fn emit(&mut self, status: SandboxStatus, message: Option<String>) {
        self.status = status;
        self.updated_at = SystemTime::now();
        self.events.emit(SandboxEvent {
            sandbox_id: self.id.clone(),
            status,
            message,
            occurred_at: self.updated_at,
        });
    }
}

/// Read-only view of a sandbox handed back to API callers.
#[derive(Debug, Clone)]
pub struct SandboxSnapshot {
    pub id: String,
    pub backend: String,
    pub status: SandboxStatus,
    pub active_execution_id: Option<String>,
    pub download_in_progress: bool,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub last_execution_id: Option<String>,
    pub image_ref: String,
    pub image_digest: String,
}
