//! Observer registry for task and sync status fan-out.

use std::collections::BTreeMap;
use std::sync::Arc;

use taskroom_core::{SyncStatus, Task};

pub type TaskCallback = Arc<dyn Fn(&[Task]) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub(crate) u64);

/// What an unsubscribe removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removed {
    Task { remaining: usize },
    Status,
    Unknown,
}

#[derive(Default)]
pub(crate) struct ObserverRegistry {
    tasks: BTreeMap<ObserverId, TaskCallback>,
    statuses: BTreeMap<ObserverId, StatusCallback>,
}

impl ObserverRegistry {
    /// Returns the number of task observers after insertion.
    pub fn add_task(&mut self, id: ObserverId, callback: TaskCallback) -> usize {
        self.tasks.insert(id, callback);
        self.tasks.len()
    }

    pub fn add_status(&mut self, id: ObserverId, callback: StatusCallback) {
        self.statuses.insert(id, callback);
    }

    pub fn remove(&mut self, id: ObserverId) -> Removed {
        if self.tasks.remove(&id).is_some() {
            return Removed::Task {
                remaining: self.tasks.len(),
            };
        }
        if self.statuses.remove(&id).is_some() {
            return Removed::Status;
        }
        Removed::Unknown
    }

    #[cfg(test)]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn notify_tasks(&self, tasks: &[Task]) {
        for callback in self.tasks.values() {
            callback(tasks);
        }
    }

    pub fn notify_task_observer(&self, id: ObserverId, tasks: &[Task]) {
        if let Some(callback) = self.tasks.get(&id) {
            callback(tasks);
        }
    }

    pub fn notify_status(&self, status: &SyncStatus) {
        for callback in self.statuses.values() {
            callback(status);
        }
    }

    pub fn notify_status_observer(&self, id: ObserverId, status: &SyncStatus) {
        if let Some(callback) = self.statuses.get(&id) {
            callback(status);
        }
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
        self.statuses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_remove_reports_remaining_task_observers() {
        let mut registry = ObserverRegistry::default();
        registry.add_task(ObserverId(1), Arc::new(|_| {}));
        assert_eq!(registry.add_task(ObserverId(2), Arc::new(|_| {})), 2);
        registry.add_status(ObserverId(3), Arc::new(|_| {}));

        assert_eq!(registry.remove(ObserverId(1)), Removed::Task { remaining: 1 });
        assert_eq!(registry.remove(ObserverId(3)), Removed::Status);
        assert_eq!(registry.remove(ObserverId(3)), Removed::Unknown);
        assert_eq!(registry.task_count(), 1);

        registry.clear();
        assert_eq!(registry.task_count(), 0);
    }

    #[test]
    fn test_notify_reaches_every_task_observer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ObserverRegistry::default();
        for id in 0..3 {
            let calls = calls.clone();
            registry.add_task(
                ObserverId(id),
                Arc::new(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        registry.notify_tasks(&[]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
