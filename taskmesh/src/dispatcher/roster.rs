//! Daemon roster: per-slot records and the dispatch selection rule.

use crate::task::TaskId;
use crate::url::TransportUrl;

/// Per-registered-daemon bookkeeping.
///
/// `instance_counter` is monotonic across reconnects; after a URL
/// regeneration it holds the negated magnitude until a fresh daemon
/// connects on the new URL, at which point it goes positive again.
#[derive(Debug, Clone)]
pub struct DaemonRecord {
    pub url: TransportUrl,
    pub index: usize,
    pub online: bool,
    pub instance_counter: i64,
    pub assigned_count: u64,
    pub complete_count: u64,
    pub inflight: Option<TaskId>,
}

impl DaemonRecord {
    fn new(url: TransportUrl, index: usize) -> Self {
        Self {
            url,
            index,
            online: false,
            instance_counter: 0,
            assigned_count: 0,
            complete_count: 0,
            inflight: None,
        }
    }
}

/// The set of daemon slots owned by one dispatcher.
pub struct Roster {
    slots: Vec<DaemonRecord>,
}

impl Roster {
    pub fn new(urls: Vec<TransportUrl>) -> Self {
        let slots = urls
            .into_iter()
            .enumerate()
            .map(|(i, url)| DaemonRecord::new(url, i))
            .collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DaemonRecord> {
        self.slots.get(index)
    }

    pub fn online_count(&self) -> usize {
        self.slots.iter().filter(|s| s.online).count()
    }

    /// The dispatch rule: among online, idle slots, the least loaded by
    /// `assigned_count`, ties broken by lower index.
    ///
    /// `eligible` lets the caller veto slots that are connected but not
    /// yet released to the queue (sticky setup still in flight).
    pub fn select_idle(&self, eligible: impl Fn(usize) -> bool) -> Option<usize> {
        self.slots
            .iter()
            .filter(|s| s.online && s.inflight.is_none() && eligible(s.index))
            .min_by_key(|s| (s.assigned_count, s.index))
            .map(|s| s.index)
    }

    /// Marks a fresh connection on the slot. A negative counter left by a
    /// URL regeneration goes back to positive here.
    pub fn mark_connected(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.online = true;
        slot.instance_counter = slot.instance_counter.abs() + 1;
    }

    /// Marks the slot offline, yielding the task that was in flight on
    /// it, if any.
    pub fn mark_disconnected(&mut self, index: usize) -> Option<TaskId> {
        let slot = &mut self.slots[index];
        slot.online = false;
        slot.inflight.take()
    }

    /// Records a task assignment.
    pub fn assign(&mut self, index: usize, id: TaskId) {
        let slot = &mut self.slots[index];
        debug_assert!(slot.inflight.is_none(), "slot already has a task in flight");
        slot.inflight = Some(id);
        slot.assigned_count += 1;
    }

    /// Records a completion from the slot's daemon, yielding the task
    /// that was in flight.
    pub fn complete(&mut self, index: usize) -> Option<TaskId> {
        let slot = &mut self.slots[index];
        slot.complete_count += 1;
        slot.inflight.take()
    }

    /// Installs a regenerated URL for the slot (`saisei`): the counter
    /// flips to its negated magnitude until the next connect.
    pub fn regenerate(&mut self, index: usize, url: TransportUrl) {
        let slot = &mut self.slots[index];
        slot.url = url;
        slot.online = false;
        slot.instance_counter = -slot.instance_counter.abs();
    }

    pub fn snapshot(&self) -> Vec<DaemonRecord> {
        self.slots.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(n: usize) -> Roster {
        let urls = (0..n)
            .map(|i| format!("tcp://127.0.0.1:{}", 7000 + i).parse().unwrap())
            .collect();
        Roster::new(urls)
    }

    #[test]
    fn test_select_prefers_least_loaded() {
        let mut r = roster(3);
        for i in 0..3 {
            r.mark_connected(i);
        }
        r.assign(0, TaskId::new("a"));
        r.complete(0);
        r.assign(0, TaskId::new("b"));
        r.complete(0);
        r.assign(1, TaskId::new("c"));
        r.complete(1);

        // Slot 2 has never been assigned anything.
        assert_eq!(r.select_idle(|_| true), Some(2));
    }

    #[test]
    fn test_select_breaks_ties_by_lowest_index() {
        let mut r = roster(3);
        for i in 0..3 {
            r.mark_connected(i);
        }
        assert_eq!(r.select_idle(|_| true), Some(0));
    }

    #[test]
    fn test_select_skips_busy_and_offline() {
        let mut r = roster(3);
        r.mark_connected(0);
        r.mark_connected(1);
        r.assign(0, TaskId::new("x"));

        // Slot 0 busy, slot 2 offline.
        assert_eq!(r.select_idle(|_| true), Some(1));
        r.assign(1, TaskId::new("y"));
        assert_eq!(r.select_idle(|_| true), None);
    }

    #[test]
    fn test_select_honours_eligibility_veto() {
        let mut r = roster(2);
        r.mark_connected(0);
        r.mark_connected(1);
        assert_eq!(r.select_idle(|i| i != 0), Some(1));
    }

    #[test]
    fn test_counters_stay_monotonic() {
        let mut r = roster(1);
        r.mark_connected(0);
        r.assign(0, TaskId::new("a"));
        assert_eq!(r.get(0).unwrap().assigned_count, 1);
        assert_eq!(r.get(0).unwrap().inflight, Some(TaskId::new("a")));

        assert_eq!(r.complete(0), Some(TaskId::new("a")));
        assert_eq!(r.get(0).unwrap().complete_count, 1);
        assert!(r.get(0).unwrap().inflight.is_none());
    }

    #[test]
    fn test_disconnect_yields_inflight_task() {
        let mut r = roster(1);
        r.mark_connected(0);
        r.assign(0, TaskId::new("a"));

        let lost = r.mark_disconnected(0);
        assert_eq!(lost, Some(TaskId::new("a")));
        assert!(!r.get(0).unwrap().online);
        // Completion counter untouched by the loss.
        assert_eq!(r.get(0).unwrap().complete_count, 0);
    }

    #[test]
    fn test_instance_counter_sign_dance() {
        let mut r = roster(1);

        r.mark_connected(0);
        assert_eq!(r.get(0).unwrap().instance_counter, 1);
        r.mark_disconnected(0);
        r.mark_connected(0);
        assert_eq!(r.get(0).unwrap().instance_counter, 2);

        // Regeneration negates the magnitude until a fresh connect.
        r.regenerate(0, "tcp://127.0.0.1:0".parse().unwrap());
        assert_eq!(r.get(0).unwrap().instance_counter, -2);
        assert!(!r.get(0).unwrap().online);

        r.mark_connected(0);
        assert_eq!(r.get(0).unwrap().instance_counter, 3);
    }
}
