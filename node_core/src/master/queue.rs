//! FIFO of outbound master/peer-RPC calls. Owned solely by the event loop - nothing else ever
//! touches it, so no locking is needed even though the queue looks superficially like a classic
//! producer/consumer structure.

use crate::master::call::RosApiCall;
use std::collections::VecDeque;

#[derive(Default)]
pub struct ApiCallQueue {
    calls: VecDeque<RosApiCall>,
    next_id: u64,
}

impl ApiCallQueue {
    pub fn new() -> ApiCallQueue {
        ApiCallQueue {
            calls: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Allocates the next call id. Strictly increasing and never reused within the process
    /// lifetime, per the queue invariant.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn push(&mut self, call: RosApiCall) {
        self.calls.push_back(call);
    }

    pub fn pop_front(&mut self) -> Option<RosApiCall> {
        self.calls.pop_front()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::call::MethodCode;

    #[test]
    fn ids_are_strictly_increasing() {
        let mut queue = ApiCallQueue::new();
        let a = queue.next_id();
        let b = queue.next_id();
        let c = queue.next_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn drains_in_fifo_order() {
        let mut queue = ApiCallQueue::new();
        for i in 0..3u64 {
            let id = queue.next_id();
            queue.push(RosApiCall::new(id, MethodCode::RegisterPublisher, vec![], "localhost", 11311, i as usize, |_, _| {}));
        }

        assert_eq!(queue.pop_front().unwrap().id, 0);
        assert_eq!(queue.pop_front().unwrap().id, 1);
        assert_eq!(queue.pop_front().unwrap().id, 2);
        assert!(queue.pop_front().is_none());
    }
}
