use foldhash::HashMap;
use parking_lot::RwLock;
use std::{borrow::Borrow, collections::hash_map::Entry, hash::Hash};

/// A map of derived artifacts that are computed once per key and never change afterwards.
///
/// Readers never block each other, except when an entry is vacant. If two threads race to fill
/// the same entry, both compute a value but only the first one is kept, and both get the kept
/// value back.
#[derive(Debug)]
pub(crate) struct OnceCache<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for OnceCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> OnceCache<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::default()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().len()
    }
}

impl<K, V> OnceCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Returns the value for the specified `key`, if it exists.
    pub(crate) fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.inner.read().get(key).cloned()
    }

    /// Returns the value for the specified `key`, and whether it was already present. The entry
    /// gets written to with the key-value pair returned by `f` if it doesn't exist. If `f`
    /// returns [`Err`], the error is propagated and the entry isn't written to.
    pub(crate) fn get_or_try_insert<Q, E>(
        &self,
        key: &Q,
        f: impl FnOnce() -> Result<(K, V), E>,
    ) -> Result<(V, bool), E>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        if let Some(value) = self.get(key) {
            return Ok((value, true));
        }

        let (key, value) = f()?;

        match self.inner.write().entry(key) {
            Entry::Occupied(entry) => Ok((entry.get().clone(), true)),
            Entry::Vacant(entry) => Ok((entry.insert(value).clone(), false)),
        }
    }
}
