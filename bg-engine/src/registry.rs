//! Per-user lock registry.
//!
//! Lazily creates one shared slot per user. The map's own shard locks are held
//! only while a slot is looked up or created; callers lock the returned slot.

use crate::types::UserId;
use dashmap::DashMap;
use std::sync::Arc;

pub struct LockRegistry<T> {
    slots: DashMap<UserId, Arc<T>>,
}

impl<T> LockRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    pub fn get_or_create_with(&self, user_id: &UserId, init: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.slots.get(user_id) {
            return existing.value().clone();
        }
        self.slots
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(init()))
            .value()
            .clone()
    }

    pub fn get(&self, user_id: &UserId) -> Option<Arc<T>> {
        self.slots.get(user_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, user_id: &UserId) -> Option<Arc<T>> {
        self.slots.remove(user_id).map(|(_, slot)| slot)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Clones out every slot so callers can lock them without holding shard locks.
    pub fn snapshot(&self) -> Vec<(UserId, Arc<T>)> {
        self.slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl<T: Default> LockRegistry<T> {
    pub fn get_or_create(&self, user_id: &UserId) -> Arc<T> {
        self.get_or_create_with(user_id, T::default)
    }
}

impl<T> Default for LockRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn returns_the_same_slot_for_the_same_user() {
        let registry: LockRegistry<Mutex<u32>> = LockRegistry::new();
        let user = UserId::new("u1");
        let a = registry.get_or_create(&user);
        let b = registry.get_or_create(&user);
        assert!(Arc::ptr_eq(&a, &b));
        *a.lock() += 1;
        assert_eq!(*b.lock(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn users_get_independent_slots() {
        let registry: LockRegistry<Mutex<u32>> = LockRegistry::new();
        let a = registry.get_or_create(&UserId::new("a"));
        let b = registry.get_or_create(&UserId::new("b"));
        assert!(!Arc::ptr_eq(&a, &b));
        let _held = a.lock();
        assert!(b.try_lock().is_some());
    }

    #[test]
    fn remove_evicts_and_next_lookup_creates_fresh_slot() {
        let registry: LockRegistry<Mutex<u32>> = LockRegistry::new();
        let user = UserId::new("u1");
        *registry.get_or_create(&user).lock() = 7;
        let removed = registry.remove(&user).expect("slot existed");
        assert_eq!(*removed.lock(), 7);
        assert!(registry.get(&user).is_none());
        assert_eq!(*registry.get_or_create(&user).lock(), 0);
    }

    #[test]
    fn concurrent_creation_yields_one_slot() {
        let registry: Arc<LockRegistry<Mutex<u32>>> = Arc::new(LockRegistry::new());
        let user = UserId::new("shared");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let user = user.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        *registry.get_or_create(&user).lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(*registry.get_or_create(&user).lock(), 800);
    }
}
