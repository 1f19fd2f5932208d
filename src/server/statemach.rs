//! Workload state machine: thin wrapper over the embedder's callback.

use std::sync::Arc;

use bytes::Bytes;

/// The embedder-supplied workload function. It must be deterministic across
/// all replicas, pure, and non-blocking: it runs synchronously on the
/// server's event loop, and identical input on every replica must produce
/// identical output or rounds fail with `inconsistent-response`.
pub type WorkloadFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Executes workloads through the embedder's callback.
pub(crate) struct StateMachine {
    workload_fn: WorkloadFn,
}

impl StateMachine {
    pub(crate) fn new(workload_fn: WorkloadFn) -> Self {
        StateMachine { workload_fn }
    }

    /// Runs one workload to completion and returns its result bytes.
    pub(crate) fn execute(&self, workload: &[u8]) -> Bytes {
        Bytes::from((self.workload_fn)(workload))
    }
}

#[cfg(test)]
mod statemach_tests {
    use super::*;

    #[test]
    fn execute_echo() {
        let sm = StateMachine::new(Arc::new(|w: &[u8]| w.to_vec()));
        assert_eq!(sm.execute(b"hello"), Bytes::from_static(b"hello"));
    }

    #[test]
    fn execute_pure_twice() {
        let sm = StateMachine::new(Arc::new(|w: &[u8]| {
            let mut v = w.to_vec();
            v.reverse();
            v
        }));
        assert_eq!(sm.execute(b"abc"), sm.execute(b"abc"));
    }
}
