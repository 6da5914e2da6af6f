//! FIFO queue of pending tasks.
//!
//! Assignment order must match submission order per profile, so this is a
//! plain FIFO with targeted removal for cancellation.

use crate::task::{Task, TaskId};
use std::collections::VecDeque;

/// FIFO queue of tasks awaiting dispatch.
#[derive(Default)]
pub struct TaskQueue {
    inner: VecDeque<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, task: Task) {
        self.inner.push_back(task);
    }

    /// Returns a popped-but-undispatchable task to the head, preserving
    /// FIFO order.
    pub fn push_front(&mut self, task: Task) {
        self.inner.push_front(task);
    }

    pub fn pop_front(&mut self) -> Option<Task> {
        self.inner.pop_front()
    }

    /// Removes a queued task by id (cancellation path).
    pub fn remove(&mut self, id: &TaskId) -> Option<Task> {
        let pos = self.inner.iter().position(|t| &t.id == id)?;
        self.inner.remove(pos)
    }

    /// Empties the queue, yielding the tasks in FIFO order.
    pub fn drain(&mut self) -> Vec<Task> {
        self.inner.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn task(profile: &str) -> Task {
        Task::new(Bytes::from_static(b"x"), vec![], None, profile)
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = TaskQueue::new();
        let a = task("p");
        let b = task("p");
        let a_id = a.id.clone();
        let b_id = b.id.clone();
        queue.push_back(a);
        queue.push_back(b);

        assert_eq!(queue.pop_front().unwrap().id, a_id);
        assert_eq!(queue.pop_front().unwrap().id, b_id);
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn test_push_front_restores_head() {
        let mut queue = TaskQueue::new();
        let a = task("p");
        let b = task("p");
        let a_id = a.id.clone();
        queue.push_back(a);
        queue.push_back(b);

        let popped = queue.pop_front().unwrap();
        queue.push_front(popped);
        assert_eq!(queue.pop_front().unwrap().id, a_id);
    }

    #[test]
    fn test_remove_by_id() {
        let mut queue = TaskQueue::new();
        let a = task("p");
        let b = task("p");
        let b_id = b.id.clone();
        queue.push_back(a);
        queue.push_back(b);

        assert!(queue.remove(&b_id).is_some());
        assert!(queue.remove(&b_id).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_preserves_order() {
        let mut queue = TaskQueue::new();
        let ids: Vec<_> = (0..4)
            .map(|_| {
                let t = task("p");
                let id = t.id.clone();
                queue.push_back(t);
                id
            })
            .collect();
        let drained: Vec<_> = queue.drain().into_iter().map(|t| t.id).collect();
        assert_eq!(drained, ids);
        assert!(queue.is_empty());
    }
}
