//! Attach/resize registration synchronizer (C8): bridges API-level
//! stdin/resize calls to attach writers a streaming adapter registers
//! asynchronously, some time after the execution is first published.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use cleanroom_backend::AttachIo;
use tokio::sync::RwLock;

use crate::error::ControlError;
use crate::state::State;

pub const STDIN_DEADLINE: Duration = Duration::from_secs(2);
pub const RESIZE_DEADLINE: Duration = Duration::from_millis(250);
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Poll for an attach writer to appear on the named execution, sleeping on
/// the poll interval or the execution's done latch, whichever fires
/// first, and re-sampling under a fresh read-lock acquisition each time.
pub(crate) async fn poll_attach(
    state: &Arc<RwLock<State>>,
    sandbox_id: &str,
    execution_id: &str,
    deadline: Duration,
    select: fn(&crate::execution::Execution) -> Option<Arc<dyn AttachIo>>,
    unsupported: ControlError,
) -> Result<Arc<dyn AttachIo>, ControlError> {
    let key = (sandbox_id.to_string(), execution_id.to_string());
    let start = Instant::now();
    loop {
        let (found, done) = {
            let guard = state.read().await;
            let exec = guard.executions.get(&key).ok_or_else(|| {
                ControlError::UnknownExecution {
                    sandbox_id: sandbox_id.to_string(),
                    execution_id: execution_id.to_string(),
                }
            })?;
            (select(exec), exec.done.clone())
        };

        if let Some(writer) = found {
            return Ok(writer);
        }
        if done.is_done() {
            return Err(unsupported);
        }

        let elapsed = start.elapsed();
        if elapsed >= deadline {
            return Err(unsupported);
        }
        let remaining = deadline - elapsed;
        let poll = POLL_INTERVAL.min(remaining);

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = done.wait() => {}
        }
    }
}

