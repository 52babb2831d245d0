//! A map that can be shared between threads.

use std::{
    borrow::Borrow,
    collections::HashMap,
    fmt,
    hash::Hash,
    ops::ControlFlow,
    sync::OnceLock,
};

use crate::sync::RwLock;

/// A key/value map guarded by a single [`RwLock`].
///
/// All methods take `&self`, so a `SyncMap` can be shared between threads (for example in an
/// [`Arc`][std::sync::Arc] or from a `static`). Reads take the lock shared, writes take it
/// exclusively, and every method holds it for exactly one critical section. [`SyncMap::bulk_set`]
/// is therefore atomic with respect to all other operations.
///
/// The backing storage is created lazily on first use, so [`SyncMap::new`] is a `const fn` and
/// a default-constructed map is immediately usable.
///
/// Iteration order of [`SyncMap::range`] and [`SyncMap::to_map`] is unspecified. Use
/// [`SyncMap::keys`] to get the keys in ascending order.
pub struct SyncMap<K, V> {
    storage: OnceLock<RwLock<HashMap<K, V>>>,
}

impl<K, V> SyncMap<K, V> {
    /// Creates an empty map without allocating.
    pub const fn new() -> Self {
        Self {
            storage: OnceLock::new(),
        }
    }

    fn storage(&self) -> &RwLock<HashMap<K, V>> {
        self.storage.get_or_init(|| {
            log::trace!("initializing map storage");
            RwLock::new(HashMap::new())
        })
    }

    /// Returns the number of entries in the map.
    pub fn len(&self) -> usize {
        self.storage().read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry.
    ///
    /// The storage is replaced wholesale under a single write lock.
    pub fn clear(&self) {
        *self.storage().write() = HashMap::new();
    }

    /// Calls `visit` for every entry, in unspecified order.
    ///
    /// Returning [`ControlFlow::Break`] from `visit` stops the iteration. Returns `true` if every
    /// entry was visited, and `false` if `visit` stopped early.
    ///
    /// The read lock is held for the whole iteration. `visit` must not modify this map (through
    /// [`SyncMap::set`], [`SyncMap::delete`], and so on), or it will deadlock.
    pub fn range<F>(&self, mut visit: F) -> bool
    where
        F: FnMut(&K, &V) -> ControlFlow<()>,
    {
        let storage = self.storage().read();
        storage
            .iter()
            .all(|(key, value)| visit(key, value).is_continue())
    }
}

impl<K: Eq + Hash, V> SyncMap<K, V> {
    /// Returns a copy of the value stored for `key`, or [`None`] if there is none.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
        V: Clone,
    {
        self.storage().read().get(key).cloned()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.storage().read().contains_key(key)
    }

    /// Inserts `value` under `key`, replacing any previous value.
    pub fn set(&self, key: K, value: V) {
        self.storage().write().insert(key, value);
    }

    /// Inserts every entry of `entries` while holding the write lock once.
    ///
    /// Other threads observe either none or all of the new entries.
    pub fn bulk_set<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        self.storage().write().extend(entries);
    }

    /// Removes the entry for `key`. Returns whether there was one.
    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.storage().write().remove(key).is_some()
    }

    /// Copies the current contents into a plain [`HashMap`].
    pub fn to_map(&self) -> HashMap<K, V>
    where
        K: Clone,
        V: Clone,
    {
        HashMap::clone(&self.storage().read())
    }
}

impl<K: Ord + Clone, V> SyncMap<K, V> {
    /// Returns all keys, sorted in ascending order.
    pub fn keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = self.storage().read().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }
}

impl<K, V> Default for SyncMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> From<HashMap<K, V>> for SyncMap<K, V> {
    fn from(map: HashMap<K, V>) -> Self {
        Self {
            storage: OnceLock::from(RwLock::from(map)),
        }
    }
}

impl<K: Eq + Hash, V> FromIterator<(K, V)> for SyncMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<HashMap<_, _>>())
    }
}

impl<K: Eq + Hash, V> Extend<(K, V)> for SyncMap<K, V> {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.bulk_set(iter);
    }
}

/// Copies every entry into a new, independently locked map.
///
/// Values are duplicated with `V::clone`: owned values are deep copies, while shared values such
/// as [`Arc`][std::sync::Arc] keep pointing at the same data.
impl<K: Eq + Hash + Clone, V: Clone> Clone for SyncMap<K, V> {
    fn clone(&self) -> Self {
        Self::from(self.to_map())
    }
}

impl<K: Ord + fmt::Debug, V: fmt::Debug> fmt::Debug for SyncMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.storage().try_read() {
            Some(storage) => {
                let mut entries: Vec<_> = storage.iter().collect();
                entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
                f.debug_map().entries(entries).finish()
            }
            None => f
                .debug_struct("SyncMap")
                .field("storage", &"<locked>")
                .finish_non_exhaustive(),
        }
    }
}
