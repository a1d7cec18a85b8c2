//! Thread-safe map with snapshot iteration.
//!
//! Backed by [`DashMap`] for sharded concurrent access. Iteration walks a
//! point-in-time copy, so callbacks may freely call back into the map
//! (DashMap deadlocks if a shard is written while one of its iterators is
//! alive on the same thread).

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;

/// Cloning shares the underlying storage.
pub struct ConcurrentMap<K, V> {
	entries: Arc<DashMap<K, V>>,
}

impl<K, V> Clone for ConcurrentMap<K, V> {
	fn clone(&self) -> Self {
		Self {
			entries: Arc::clone(&self.entries),
		}
	}
}

impl<K: Eq + Hash, V> Default for ConcurrentMap<K, V> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K: Eq + Hash, V> ConcurrentMap<K, V> {
	pub fn new() -> Self {
		Self {
			entries: Arc::new(DashMap::new()),
		}
	}

	/// Inserts `value`, returning the entry it replaced.
	pub fn set(&self, key: K, value: V) -> Option<V> {
		self.entries.insert(key, value)
	}

	pub fn delete<Q>(&self, key: &Q) -> Option<V>
	where
		K: Borrow<Q>,
		Q: Hash + Eq + ?Sized,
	{
		self.entries.remove(key).map(|(_, value)| value)
	}

	/// Removes the entry only if `predicate` accepts the current value.
	///
	/// The check and the removal happen under the same shard lock.
	pub fn delete_if<Q, F>(&self, key: &Q, predicate: F) -> Option<V>
	where
		K: Borrow<Q>,
		Q: Hash + Eq + ?Sized,
		F: FnOnce(&V) -> bool,
	{
		self.entries
			.remove_if(key, |_, value| predicate(value))
			.map(|(_, value)| value)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

impl<K: Eq + Hash + Clone, V: Clone> ConcurrentMap<K, V> {
	pub fn get<Q>(&self, key: &Q) -> Option<V>
	where
		K: Borrow<Q>,
		Q: Hash + Eq + ?Sized,
	{
		self.entries.get(key).map(|entry| entry.value().clone())
	}

	/// Copies every entry out of the map.
	pub fn snapshot(&self) -> Vec<(K, V)> {
		self.entries
			.iter()
			.map(|entry| (entry.key().clone(), entry.value().clone()))
			.collect()
	}

	pub fn values(&self) -> Vec<V> {
		self.entries.iter().map(|entry| entry.value().clone()).collect()
	}

	/// Visits a snapshot of the entries until `f` returns `false`.
	pub fn for_each<F>(&self, mut f: F)
	where
		F: FnMut(&K, &V) -> bool,
	{
		for (key, value) in self.snapshot() {
			if !f(&key, &value) {
				break;
			}
		}
	}
}

impl<K: Eq + Hash, V> fmt::Debug for ConcurrentMap<K, V> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConcurrentMap")
			.field("len", &self.entries.len())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use std::thread;

	use super::*;

	#[test]
	fn basic_operations() {
		let map = ConcurrentMap::new();
		assert!(map.is_empty());

		assert_eq!(map.set("a".to_string(), 1), None);
		assert_eq!(map.set("a".to_string(), 2), Some(1));
		map.set("b".to_string(), 3);

		assert_eq!(map.get("a"), Some(2));
		assert_eq!(map.len(), 2);
		assert_eq!(map.delete("a"), Some(2));
		assert_eq!(map.get("a"), None);
		assert_eq!(map.delete("missing"), None);
		assert!(!map.is_empty());
	}

	#[test]
	fn for_each_tolerates_mutation_from_callback() {
		let map = ConcurrentMap::new();
		for i in 0..32 {
			map.set(i, i * 10);
		}

		let mut visited = 0;
		map.for_each(|key, _| {
			map.delete(key);
			map.set(key + 100, 0);
			visited += 1;
			true
		});

		assert_eq!(visited, 32);
		assert_eq!(map.len(), 32);
		assert!(map.get(&0).is_none());
		assert!(map.get(&100).is_some());
	}

	#[test]
	fn for_each_stops_early() {
		let map = ConcurrentMap::new();
		for i in 0..10 {
			map.set(i, ());
		}

		let mut visited = 0;
		map.for_each(|_, _| {
			visited += 1;
			visited < 3
		});
		assert_eq!(visited, 3);
	}

	#[test]
	fn delete_if_checks_identity() {
		let map = ConcurrentMap::new();
		let first = Arc::new(1);
		let second = Arc::new(1);
		map.set("c1", Arc::clone(&second));

		assert!(map.delete_if("c1", |current| Arc::ptr_eq(current, &first)).is_none());
		assert_eq!(map.len(), 1);

		assert!(map.delete_if("c1", |current| Arc::ptr_eq(current, &second)).is_some());
		assert!(map.is_empty());
	}

	#[test]
	fn clones_share_storage_across_threads() {
		let map: ConcurrentMap<u32, u32> = ConcurrentMap::new();

		let handles: Vec<_> = (0..4)
			.map(|t| {
				let map = map.clone();
				thread::spawn(move || {
					for i in 0..250 {
						map.set(t * 1_000 + i, i);
					}
				})
			})
			.collect();

		for handle in handles {
			handle.join().unwrap();
		}

		assert_eq!(map.len(), 1_000);
		assert_eq!(map.snapshot().len(), 1_000);
	}
}
