//! Test support: an in-process stand-in for the consensus log.
//!
//! The loopback log applies proposals synchronously to a local state
//! machine, which lets scheduler and pipeline tests drive the whole
//! protocol deterministically without elections or sockets. Production
//! code never uses this; the contract it implements is the same
//! `ProposeLog` the Raft handle provides.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::coordinator::command::{ApplyOutcome, LogCommand};
use crate::coordinator::scheduler::ProposeLog;
use crate::coordinator::state::{CoordinatorState, SharedState};
use crate::error::{EngineError, Result};

pub struct LoopbackLog {
    state: SharedState,
    log: std::sync::Mutex<Vec<LogCommand>>,
}

impl LoopbackLog {
    pub fn new(max_attempts: u32) -> (Arc<Self>, SharedState) {
        let state: SharedState = Arc::new(RwLock::new(CoordinatorState::new(max_attempts)));
        let log = Arc::new(Self {
            state: state.clone(),
            log: std::sync::Mutex::new(Vec::new()),
        });
        (log, state)
    }

    /// Every command proposed so far, in commit order.
    pub fn entries(&self) -> Vec<LogCommand> {
        self.log.lock().expect("loopback log lock poisoned").clone()
    }
}

#[async_trait]
impl ProposeLog for LoopbackLog {
    async fn propose(&self, command: LogCommand) -> Result<ApplyOutcome> {
        let outcome = self
            .state
            .write()
            .map_err(|_| EngineError::Internal("state lock poisoned".into()))?
            .apply(&command);
        self.log
            .lock()
            .expect("loopback log lock poisoned")
            .push(command);
        Ok(outcome)
    }
}
