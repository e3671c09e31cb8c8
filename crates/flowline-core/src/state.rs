use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};

/// Shared key-value region visible to every unit and collaborator of a run.
///
/// Clones share the same map. Writes from concurrent parallel branches are
/// last-write-wins: the lock only makes each individual read or write atomic,
/// it does not order branches against each other. Workflows whose sibling
/// branches write the same key race on it.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    inner: Arc<Mutex<Map<String, Value>>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(map)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        // A panicking writer cannot leave a Map half-updated, so recover the guard.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.lock().get(key).and_then(|v| v.as_str()).map(String::from)
    }

    /// Set a value, returning the previous one.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.lock().insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.lock().remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Read-modify-write under a single lock acquisition.
    pub fn update<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        f(&mut self.lock())
    }

    /// Merge `other` into the state (overwrites on conflict).
    pub fn merge(&self, other: &Map<String, Value>) {
        let mut map = self.lock();
        for (k, v) in other {
            map.insert(k.clone(), v.clone());
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether two handles point at the same underlying map.
    pub fn shares_with(&self, other: &SessionState) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
