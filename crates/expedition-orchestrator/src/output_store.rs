use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::RwLock;

use expedition_types::OutputRecord;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PutError {
    /// The output store is single-writer-per-key (§3); a second write to the same key is
    /// a scheduler invariant violation, not a recoverable condition.
    #[error("output already recorded for key `{0}`")]
    AlreadyWritten(String),
}

/// Single-writer-per-key, multi-reader store of completed task outputs (§6). Durable only
/// for the lifetime of one mission run — surviving a process restart is a collaborator's
/// concern.
#[derive(Default)]
pub struct OutputStore {
    records: RwLock<HashMap<String, OutputRecord>>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, key: impl Into<String>, record: OutputRecord) -> Result<(), PutError> {
        let key = key.into();
        let mut records = self.records.write().await;
        if records.contains_key(&key) {
            return Err(PutError::AlreadyWritten(key));
        }
        records.insert(key, record);
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<OutputRecord> {
        self.records.read().await.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = OutputStore::new();
        store
            .put("a1", OutputRecord { findings: vec!["x".into()], ..Default::default() })
            .await
            .unwrap();
        let record = store.get("a1").await.unwrap();
        assert_eq!(record.findings, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn second_write_to_the_same_key_is_rejected() {
        let store = OutputStore::new();
        store.put("a1", OutputRecord::default()).await.unwrap();
        let err = store.put("a1", OutputRecord::default()).await;
        assert_eq!(err, Err(PutError::AlreadyWritten("a1".to_string())));
    }

    #[tokio::test]
    async fn missing_key_reads_as_none() {
        let store = OutputStore::new();
        assert!(store.get("ghost").await.is_none());
    }
}
