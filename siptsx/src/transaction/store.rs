//! The concurrent key-to-transaction maps.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

use super::key::TsxKey;

/// A concurrent map from [`TsxKey`] to a transaction handle. Storing an
/// already-present key is a conflict surfaced to the caller; lookups clone
/// the handle out under the lock so iteration never observes a torn map.
pub(crate) struct Store<T> {
    map: Mutex<HashMap<TsxKey, T>>,
}

impl<T: Clone> Store<T> {
    pub(crate) fn new() -> Self {
        Store {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, key: TsxKey, value: T) -> Result<()> {
        let mut map = self.map.lock().expect("Lock failed");
        if map.contains_key(&key) {
            return Err(Error::DuplicateTransaction(key));
        }
        map.insert(key, value);
        Ok(())
    }

    pub(crate) fn find(&self, key: &TsxKey) -> Option<T> {
        self.map.lock().expect("Lock failed").get(key).cloned()
    }

    /// Removes `key`; a no-op when already absent.
    pub(crate) fn remove(&self, key: &TsxKey) -> Option<T> {
        self.map.lock().expect("Lock failed").remove(key)
    }

    /// A point-in-time snapshot of every stored handle.
    pub(crate) fn all(&self) -> Vec<T> {
        self.map.lock().expect("Lock failed").values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().expect("Lock failed").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SipMethod;
    use assert_matches::assert_matches;

    fn key(branch: &str) -> TsxKey {
        TsxKey::client_with(SipMethod::Options, branch)
    }

    #[test]
    fn test_insert_conflict() {
        let store = Store::new();
        store.insert(key("z9hG4bK1"), 1).unwrap();

        let err = store.insert(key("z9hG4bK1"), 2).unwrap_err();
        assert_matches!(err, Error::DuplicateTransaction(_));

        // The original mapping survives the conflict.
        assert_eq!(store.find(&key("z9hG4bK1")), Some(1));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = Store::new();
        store.insert(key("z9hG4bK1"), 1).unwrap();

        assert_eq!(store.remove(&key("z9hG4bK1")), Some(1));
        assert_eq!(store.remove(&key("z9hG4bK1")), None);
    }

    #[test]
    fn test_all_snapshots() {
        let store = Store::new();
        store.insert(key("z9hG4bK1"), 1).unwrap();
        store.insert(key("z9hG4bK2"), 2).unwrap();

        let mut all = store.all();
        all.sort();
        assert_eq!(all, vec![1, 2]);
        assert_eq!(store.len(), 2);
    }
}
