//! Round-robin membership queue.

use super::BackendTarget;
use std::collections::VecDeque;

/// Ordered backend membership with rotate-on-select semantics.
///
/// Not synchronized on its own; the owning group keeps it behind one lock so
/// selection, insertion and removal form a single critical section.
#[derive(Debug, Default)]
pub struct RoundRobinQueue {
    members: VecDeque<BackendTarget>,
}

impl RoundRobinQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            members: VecDeque::new(),
        }
    }

    /// Append a backend at the tail. Returns `false` if it is already a member.
    pub fn push(&mut self, target: BackendTarget) -> bool {
        if self.members.contains(&target) {
            return false;
        }
        self.members.push_back(target);
        true
    }

    /// Remove a backend by identity. Returns `false` if it was not a member.
    pub fn remove(&mut self, target: &BackendTarget) -> bool {
        match self.members.iter().position(|m| m == target) {
            Some(idx) => {
                self.members.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Pop the head, re-append it at the tail and return it.
    pub fn next(&mut self) -> Option<BackendTarget> {
        let head = self.members.pop_front()?;
        self.members.push_back(head.clone());
        Some(head)
    }

    pub fn contains(&self, target: &BackendTarget) -> bool {
        self.members.contains(target)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Remove and return every member in rotation order.
    pub fn drain(&mut self) -> Vec<BackendTarget> {
        self.members.drain(..).collect()
    }

    /// Members in current rotation order.
    pub fn snapshot(&self) -> Vec<BackendTarget> {
        self.members.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Protocol;
    use std::collections::HashMap;
    use std::time::Duration;

    fn target(port: u16) -> BackendTarget {
        BackendTarget::new(
            Protocol::Tcp,
            format!("127.0.0.1:{port}").parse().unwrap(),
            Duration::from_secs(1),
        )
    }

    fn test_queue() -> RoundRobinQueue {
        let mut queue = RoundRobinQueue::new();
        queue.push(target(8001));
        queue.push(target(8002));
        queue.push(target(8003));
        queue
    }

    #[test]
    fn test_round_robin_cycles() {
        let mut queue = test_queue();

        assert_eq!(queue.next().unwrap(), target(8001));
        assert_eq!(queue.next().unwrap(), target(8002));
        assert_eq!(queue.next().unwrap(), target(8003));
        assert_eq!(queue.next().unwrap(), target(8001)); // Cycles back
    }

    #[test]
    fn test_round_robin_empty() {
        let mut queue = RoundRobinQueue::new();
        assert!(queue.next().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fairness_and_spacing() {
        let mut queue = RoundRobinQueue::new();
        let n = 4usize;
        for i in 0..n {
            queue.push(target(9000 + i as u16));
        }

        let m = 4 * n + 3;
        let mut counts: HashMap<BackendTarget, usize> = HashMap::new();
        let mut last_seen: HashMap<BackendTarget, usize> = HashMap::new();
        for step in 0..m {
            let selected = queue.next().unwrap();
            if let Some(prev) = last_seen.insert(selected.clone(), step) {
                assert_eq!(step - prev, n, "backend selected out of turn");
            }
            *counts.entry(selected).or_default() += 1;
        }

        assert_eq!(counts.len(), n);
        for count in counts.values() {
            assert!(*count == m / n || *count == m.div_ceil(n));
        }
    }

    #[test]
    fn test_duplicate_push_rejected() {
        let mut queue = test_queue();
        assert!(!queue.push(target(8002)));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut queue = test_queue();
        assert!(queue.remove(&target(8002)));
        assert!(!queue.remove(&target(8002)));

        assert_eq!(queue.next().unwrap(), target(8001));
        assert_eq!(queue.next().unwrap(), target(8003));
        assert_eq!(queue.next().unwrap(), target(8001));
    }

    #[test]
    fn test_removed_member_appended_at_tail_on_readd() {
        let mut queue = test_queue();
        queue.remove(&target(8001));
        queue.push(target(8001));
        assert_eq!(
            queue.snapshot(),
            vec![target(8002), target(8003), target(8001)]
        );
    }
}
