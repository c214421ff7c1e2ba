//! Execution entity (C7): lifecycle state, retained output buffers, and
//! the attach/cancel handles the driver and synchronizer share.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use cleanroom_backend::AttachIo;
use tokio_util::sync::CancellationToken;

use crate::event::DoneLatch;
use crate::event::EventHub;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Canceled => "canceled",
            ExecutionStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::Failed
                | ExecutionStatus::Canceled
                | ExecutionStatus::TimedOut
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub launch_timeout_secs: Option<u64>,
    pub tty: bool,
}

#[derive(Debug, Clone)]
pub enum ExecutionEventPayload {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Message(String),
    Exit {
        exit_code: i32,
        status: ExecutionStatus,
        message: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    pub sandbox_id: String,
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub image_ref: String,
    pub image_digest: String,
    pub occurred_at: SystemTime,
    pub payload: ExecutionEventPayload,
}

/// Append `data`, discarding the oldest bytes first if the result would
/// exceed `cap`.
pub fn append_capped(buf: &mut Vec<u8>, data: &[u8], cap: usize) {
    buf.extend_from_slice(data);
    if buf.len() > cap {
        let excess = buf.len() - cap;
        buf.drain(0..excess);
    }
}

pub struct Execution {
    pub id: String,
    pub sandbox_id: String,
    pub run_id: Option<String>,
    pub image_ref: String,
    pub image_digest: String,
    pub command: Vec<String>,
    pub options: ExecutionOptions,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub message: Option<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub launched_vm: bool,
    pub plan_path: Option<PathBuf>,
    pub run_dir: Option<PathBuf>,
    pub cancel_requested: bool,
    pub cancel_signal: Option<i32>,
    pub cancel_token: Option<CancellationToken>,
    pub attach_stdin: Option<Arc<dyn AttachIo>>,
    pub attach_resize: Option<Arc<dyn AttachIo>>,
    pub events: EventHub<ExecutionEvent>,
    pub done: Arc<DoneLatch>,
}

impl Execution {
    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            id: self.id.clone(),
            sandbox_id: self.sandbox_id.clone(),
            run_id: self.run_id.clone(),
            image_ref: self.image_ref.clone(),
            image_digest: self.image_digest.clone(),
            command: self.command.clone(),
            options: self.options.clone(),
            status: self.status,
            exit_code: self.exit_code,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            message: self.message.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        }
    }

    pub fn record_event(&mut self, payload: ExecutionEventPayload) {
        let event = ExecutionEvent {
            sandbox_id: self.sandbox_id.clone(),
            execution_id: self.id.clone(),
            status: self.status,
            image_ref: self.image_ref.clone(),
            image_digest: self.image_digest.clone(),
            occurred_at: SystemTime::now(),
            payload,
        };
        self.events.emit(event);
    }

    /// Set terminal status, exit code, and `finished_at`; emit exactly one
    /// terminal exit event, then close the done latch. Clears the cancel
    /// and attach handles since no attach is allowed after termination.
    pub fn finalize(&mut self, status: ExecutionStatus, exit_code: i32, message: Option<String>) {
        self.status = status;
        self.exit_code = Some(exit_code);
        self.finished_at = Some(SystemTime::now());
        if message.is_some() {
            self.message = message.clone();
        }
        self.record_event(ExecutionEventPayload::Exit {
            exit_code,
            status,
            message,
        });
        self.done.close();
        self.cancel_token = None;
        self.attach_stdin = None;
        self.attach_resize = None;
    }
}

/// Read-only view of an execution handed back to API callers.
#[derive(Debug, Clone)]
pub struct ExecutionSnapshot {
    pub id: String,
    pub sandbox_id: String,
    pub run_id: Option<String>,
    pub image_ref: String,
    pub image_digest: String,
    pub command: Vec<String>,
    pub options: ExecutionOptions,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub message: Option<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    pub accepted: bool,
    pub status: ExecutionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_capped_keeps_tail_on_overflow() {
        let mut buf = vec![b'a'; 10];
        append_capped(&mut buf, &[b'b'; 5], 12);
        assert_eq!(buf.len(), 12);
        let expected: Vec<u8> = [vec![b'a'; 7], vec![b'b'; 5]].concat();
        assert_eq!(buf, expected);
    }

    #[test]
    fn append_capped_never_exceeds_cap_across_many_writes() {
        let mut buf = Vec::new();
        for _ in 0..2000 {
            append_capped(&mut buf, b"0123456789", 1024);
            assert!(buf.len() <= 1024);
        }
        assert!(buf.ends_with(b"789"));
    }
}
