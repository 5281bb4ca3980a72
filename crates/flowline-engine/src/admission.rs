use std::collections::{HashMap, HashSet, VecDeque};

use flowline_core::run::RunId;

#[derive(Default)]
struct Slots {
    running: HashSet<RunId>,
    queue: VecDeque<RunId>,
}

/// Per-workflow concurrency slots with a FIFO wait queue.
///
/// A run holds its slot from admission until it reaches a terminal status,
/// including while it is suspended on a delay.
#[derive(Default)]
pub struct Admission {
    workflows: HashMap<String, Slots>,
}

impl Admission {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `run_id` if a slot is free and nobody is queued ahead of it.
    /// Otherwise queue it. Returns whether it was admitted.
    pub fn offer(&mut self, workflow_id: &str, run_id: RunId, cap: usize) -> bool {
        let slots = self.workflows.entry(workflow_id.to_string()).or_default();
        if slots.queue.is_empty() && slots.running.len() < cap.max(1) {
            slots.running.insert(run_id);
            true
        } else {
            slots.queue.push_back(run_id);
            false
        }
    }

    /// Occupy a slot unconditionally. Used when recovering runs that were
    /// already running before a restart.
    pub fn restore(&mut self, workflow_id: &str, run_id: RunId) {
        self.workflows
            .entry(workflow_id.to_string())
            .or_default()
            .running
            .insert(run_id);
    }

    /// Free the slot held by `run_id` and admit queued runs in FIFO order
    /// while capacity allows. Returns the newly admitted runs.
    pub fn release(&mut self, workflow_id: &str, run_id: &RunId, cap: usize) -> Vec<RunId> {
        let Some(slots) = self.workflows.get_mut(workflow_id) else {
            return vec![];
        };
        slots.running.remove(run_id);

        let mut admitted = vec![];
        while slots.running.len() < cap.max(1) {
            let Some(next) = slots.queue.pop_front() else {
                break;
            };
            slots.running.insert(next.clone());
            admitted.push(next);
        }
        admitted
    }

    /// Remove a queued run. Returns false if it was not queued.
    pub fn withdraw(&mut self, workflow_id: &str, run_id: &RunId) -> bool {
        let Some(slots) = self.workflows.get_mut(workflow_id) else {
            return false;
        };
        let before = slots.queue.len();
        slots.queue.retain(|id| id != run_id);
        slots.queue.len() != before
    }

    pub fn holds(&self, workflow_id: &str, run_id: &RunId) -> bool {
        self.workflows
            .get(workflow_id)
            .is_some_and(|s| s.running.contains(run_id))
    }

    pub fn running(&self, workflow_id: &str) -> usize {
        self.workflows.get(workflow_id).map_or(0, |s| s.running.len())
    }

    pub fn queued(&self, workflow_id: &str) -> usize {
        self.workflows.get(workflow_id).map_or(0, |s| s.queue.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> RunId {
        RunId::from_string(s)
    }

    #[test]
    fn test_cap_and_fifo() {
        let mut a = Admission::new();
        assert!(a.offer("wf", id("r1"), 2));
        assert!(a.offer("wf", id("r2"), 2));
        assert!(!a.offer("wf", id("r3"), 2));
        assert!(!a.offer("wf", id("r4"), 2));
        assert_eq!((a.running("wf"), a.queued("wf")), (2, 2));

        assert_eq!(a.release("wf", &id("r1"), 2), vec![id("r3")]);
        assert_eq!(a.release("wf", &id("r2"), 2), vec![id("r4")]);
        assert!(a.release("wf", &id("r3"), 2).is_empty());
        assert_eq!(a.running("wf"), 1);
    }

    #[test]
    fn test_workflows_are_independent() {
        let mut a = Admission::new();
        assert!(a.offer("a", id("r1"), 1));
        assert!(a.offer("b", id("r2"), 1));
        assert!(!a.offer("a", id("r3"), 1));
        assert!(a.holds("b", &id("r2")));
    }

    #[test]
    fn test_withdraw_queued() {
        let mut a = Admission::new();
        a.offer("wf", id("r1"), 1);
        a.offer("wf", id("r2"), 1);
        assert!(a.withdraw("wf", &id("r2")));
        assert!(!a.withdraw("wf", &id("r2")));
        assert!(a.release("wf", &id("r1"), 1).is_empty());
    }

    #[test]
    fn test_restored_runs_count_against_cap() {
        let mut a = Admission::new();
        a.restore("wf", id("old1"));
        a.restore("wf", id("old2"));
        assert!(!a.offer("wf", id("new"), 2));
        assert_eq!(a.release("wf", &id("old1"), 2), vec![id("new")]);
    }
}
