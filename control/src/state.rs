//! The single registry both the sandbox and execution operations share. A
//! single read-write lock over this struct is how the control service
//! satisfies the "never hold a lock across an external call" rule: every
//! public operation takes the lock just long enough to read or mutate
//! plain data, then releases it before calling into a backend adapter,
//! a cancel handle, or an attach writer.

use std::collections::HashMap;

use crate::execution::Execution;
use crate::sandbox::Sandbox;

#[derive(Default)]
pub(crate) struct State {
    pub sandboxes: HashMap<String, Sandbox>,
    pub executions: HashMap<(String, String), Execution>,
}
