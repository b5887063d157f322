use crate::task::handle::Handle;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Registry of live task handles keyed by task ID.
#[derive(Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<String, Arc<Handle>>>,
    // IDs claimed by a start or recovery that has not committed yet
    reserved: Mutex<HashSet<String>>,
}

/// Exclusive claim on a task ID. Dropping it without `commit` releases the ID.
pub struct Reservation<'a> {
    store: &'a TaskStore,
    id: String,
}

impl Reservation<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register `handle` under the reserved ID.
    pub fn commit(self, handle: Arc<Handle>) {
        self.store.set(self.id.clone(), handle);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.store
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` unless it is registered or already being started.
    pub fn reserve(&self, id: &str) -> Option<Reservation<'_>> {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        if reserved.contains(id) || self.get(id).is_some() {
            return None;
        }
        reserved.insert(id.to_string());
        Some(Reservation {
            store: self,
            id: id.to_string(),
        })
    }

    pub fn set(&self, id: impl Into<String>, handle: Arc<Handle>) {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), handle);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Handle>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn del(&self, id: &str) -> Option<Arc<Handle>> {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_reserve_is_exclusive() {
        let store = TaskStore::new();
        let first = store.reserve("web").unwrap();
        assert_eq!(first.id(), "web");
        assert!(store.reserve("web").is_none());
        assert!(store.reserve("db").is_some());

        drop(first);
        assert!(store.reserve("web").is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_reserve_single_winner() {
        let store = Arc::new(TaskStore::new());
        let barrier = Arc::new(Barrier::new(8));
        let held = Arc::new(Barrier::new(8));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                let held = held.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let claim = store.reserve("web");
                    let won = claim.is_some();
                    // keep the claim until every thread has tried
                    held.wait();
                    won
                })
            })
            .collect();

        let winners = workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(store.reserve("web").is_some());
    }
}
