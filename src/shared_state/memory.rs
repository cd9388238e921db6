use super::{expires_at, SharedStateStore, StateKey, StateUpdate};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Single-process store. Atomic only within one process; used by tests and
/// single-worker deployments.
#[derive(Debug, Default)]
pub struct InMemorySharedStateStore {
    records: Mutex<HashMap<String, (String, i64)>>,
}

impl InMemorySharedStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedStateStore for InMemorySharedStateStore {
    fn compare_and_update(
        &self,
        key: &StateKey,
        now_ms: i64,
        ttl: Duration,
        update: &mut dyn FnMut(Option<&str>) -> StateUpdate,
    ) -> Result<Option<String>> {
        let mut records = self.records.lock().unwrap();

        let current = records
            .get(key.as_str())
            .filter(|(_, expiry)| *expiry > now_ms)
            .map(|(value, _)| value.clone());

        match update(current.as_deref()) {
            StateUpdate::Keep => Ok(current),
            StateUpdate::Put(value) => {
                records.insert(
                    key.as_str().to_string(),
                    (value.clone(), expires_at(now_ms, ttl)),
                );
                Ok(Some(value))
            }
            StateUpdate::Delete => {
                records.remove(key.as_str());
                Ok(None)
            }
        }
    }

    fn purge_expired(&self, now_ms: i64) -> Result<usize> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, (_, expiry)| *expiry > now_ms);
        Ok(before - records.len())
    }
}
