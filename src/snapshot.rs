use crate::prelude::*;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

pub type SnapshotValues = HashMap<String, Option<Value>>;

/// One poll cycle's worth of readings for a single battery. Keys are
/// item names, values are `None` when the register could not be read.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub values: SnapshotValues,
    pub taken_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).and_then(|v| v.as_ref())
    }

    pub fn numeric(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }
}

/// Shared handle to the most recent snapshot. Writers replace the whole
/// snapshot at publish time so readers never observe a half-filled cycle.
#[derive(Clone, Debug, Default)]
pub struct SnapshotStore {
    inner: Arc<RwLock<Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, values: SnapshotValues) {
        let mut snapshot = self.inner.write().unwrap();
        snapshot.values = values;
        snapshot.taken_at = Some(Utc::now());
    }

    /// Updates a single key without touching the cycle timestamp. Used by
    /// write commands to reflect a value we just sent to the hardware.
    pub fn merge(&self, key: &str, value: Value) {
        let mut snapshot = self.inner.write().unwrap();
        snapshot.values.insert(key.to_string(), Some(value));
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().unwrap().get(key).cloned()
    }

    pub fn numeric(&self, key: &str) -> Option<f64> {
        self.inner.read().unwrap().numeric(key)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.read().unwrap().clone()
    }

    pub fn age(&self) -> Option<chrono::Duration> {
        self.inner
            .read()
            .unwrap()
            .taken_at
            .map(|t| Utc::now() - t)
    }
}
