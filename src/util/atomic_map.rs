use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};
use rustc_hash::FxHashMap;

/// A copy-on-write map: readers grab a snapshot of the whole map (an `Arc` clone under a very
///  short read lock) and iterate it without holding any lock, while writers replace the snapshot.
///
/// This is a good fit for data that is read on every packet but changes rarely, e.g. the set of
///  connections of an end point.
pub struct AtomicMap<K,V> {
    map: RwLock<Arc<FxHashMap<K,V>>>,
}
impl <K: Hash+Eq+Clone+Sync+Send,V:Clone+Sync+Send> Default for AtomicMap<K,V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash+Eq+Clone+Sync+Send, V:Clone+Sync+Send> AtomicMap<K,V> {
    pub fn new() -> AtomicMap<K,V> {
        AtomicMap {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    pub fn load(&self) -> Arc<FxHashMap<K,V>> {
        self.map.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.load()
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.load().is_empty()
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut FxHashMap<K,V>) -> T) -> T {
        let mut guard = self.map.write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut map: FxHashMap<K,V> = guard.as_ref().clone();
        let result = f(&mut map);
        *guard = Arc::new(map);
        result
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.update(|m| m.insert(key, value))
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.update(|m| m.remove(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_drop() {
        let _ = AtomicMap::<u32, u32>::new();
    }

    #[test]
    fn test_update() {
        let map = AtomicMap::<u32, u32>::new();

        map.update(|m| {
            m.insert(1, 2);
        });
        assert_eq!(Some(2), map.get(&1));
        assert_eq!(Some(2), map.remove(&1));
        assert!(map.is_empty());
    }

    #[test]
    fn test_snapshot_is_stable() {
        let map = AtomicMap::<u32, u32>::new();
        map.insert(1, 1);

        let snapshot = map.load();
        map.insert(2, 2);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_concurrent_updates() {
        let map = Arc::new(AtomicMap::<u32, u32>::new());

        let handles = (0..8)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        map.insert(t * 1000 + i, i);
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(map.len(), 800);
    }
}
