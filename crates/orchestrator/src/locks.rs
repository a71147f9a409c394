use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use closeflow_core::domain::flow::FlowId;

/// In-process registry allowing at most one processor per flow id.
#[derive(Clone, Debug, Default)]
pub struct FlowLocks {
    busy: Arc<Mutex<HashSet<FlowId>>>,
}

impl FlowLocks {
    /// Returns `None` while another holder owns `flow_id`.
    pub fn try_acquire(&self, flow_id: &FlowId) -> Option<FlowGuard> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(flow_id.clone()) {
            return None;
        }
        Some(FlowGuard { flow_id: flow_id.clone(), busy: Arc::clone(&self.busy) })
    }

    pub fn is_busy(&self, flow_id: &FlowId) -> bool {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner).contains(flow_id)
    }
}

#[derive(Debug)]
pub struct FlowGuard {
    flow_id: FlowId,
    busy: Arc<Mutex<HashSet<FlowId>>>,
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.flow_id);
    }
}
