//! In-process provider backed by a hash map. The default provider, and the
//! one the executor tests run against: failures can be queued to exercise
//! retry and skip paths.

use super::{Provider, RemoteObject};
use crate::error::ProviderError;
use crate::value::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct MemoryProvider {
    objects: Mutex<HashMap<(String, String), BTreeMap<String, Value>>>,
    next_id: AtomicU64,
    injected: Mutex<VecDeque<ProviderError>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error to be returned by the next provider call.
    pub fn inject_failure(&self, error: ProviderError) {
        self.injected.lock().expect("injected lock").push_back(error);
    }

    /// Number of live objects, for assertions.
    pub fn len(&self) -> usize {
        self.objects.lock().expect("objects lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attributes of one live object, for assertions.
    pub fn get(&self, kind: &str, id: &str) -> Option<BTreeMap<String, Value>> {
        self.objects
            .lock()
            .expect("objects lock")
            .get(&(kind.to_string(), id.to_string()))
            .cloned()
    }

    /// Overwrite an object's attributes behind the engine's back, to
    /// simulate drift.
    pub fn drift(&self, kind: &str, id: &str, attrs: BTreeMap<String, Value>) {
        self.objects
            .lock()
            .expect("objects lock")
            .insert((kind.to_string(), id.to_string()), attrs);
    }

    /// Remove an object behind the engine's back.
    pub fn vanish(&self, kind: &str, id: &str) {
        self.objects
            .lock()
            .expect("objects lock")
            .remove(&(kind.to_string(), id.to_string()));
    }

    fn take_injected(&self) -> Result<(), ProviderError> {
        match self.injected.lock().expect("injected lock").pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Provider for MemoryProvider {
    fn create(
        &self,
        kind: &str,
        attrs: &BTreeMap<String, Value>,
    ) -> Result<RemoteObject, ProviderError> {
        self.take_injected()?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{kind}-{n}");
        let mut stored = attrs.clone();
        stored.insert("id".to_string(), Value::from(id.clone()));
        self.objects
            .lock()
            .expect("objects lock")
            .insert((kind.to_string(), id.clone()), stored.clone());
        Ok(RemoteObject { id, attrs: stored })
    }

    fn read(&self, kind: &str, id: &str) -> Result<RemoteObject, ProviderError> {
        self.take_injected()?;
        self.objects
            .lock()
            .expect("objects lock")
            .get(&(kind.to_string(), id.to_string()))
            .map(|attrs| RemoteObject {
                id: id.to_string(),
                attrs: attrs.clone(),
            })
            .ok_or_else(|| ProviderError::NotFound { id: id.to_string() })
    }

    fn update(
        &self,
        kind: &str,
        id: &str,
        attrs: &BTreeMap<String, Value>,
    ) -> Result<RemoteObject, ProviderError> {
        self.take_injected()?;
        let mut objects = self.objects.lock().expect("objects lock");
        let key = (kind.to_string(), id.to_string());
        if !objects.contains_key(&key) {
            return Err(ProviderError::NotFound { id: id.to_string() });
        }
        let mut stored = attrs.clone();
        stored.insert("id".to_string(), Value::from(id));
        objects.insert(key, stored.clone());
        Ok(RemoteObject {
            id: id.to_string(),
            attrs: stored,
        })
    }

    fn delete(&self, kind: &str, id: &str) -> Result<(), ProviderError> {
        self.take_injected()?;
        let removed = self
            .objects
            .lock()
            .expect("objects lock")
            .remove(&(kind.to_string(), id.to_string()));
        match removed {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound { id: id.to_string() }),
        }
    }
}
