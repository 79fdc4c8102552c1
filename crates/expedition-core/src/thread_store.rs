use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;

use expedition_types::{Interrupt, Message, Thread};

/// The persistence interface C2 consumes (§6). Threads are created on first use and
/// never destroyed by the core; durability of the encoding itself is a collaborator's
/// concern (§1 non-goals) — this implementation is an in-memory map flushed to a single
/// JSON file, the same shape as `tandem-core::storage::Storage`'s `sessions.json`.
pub struct ThreadStore {
    base: Option<PathBuf>,
    threads: RwLock<HashMap<String, Thread>>,
}

impl ThreadStore {
    /// An ephemeral, memory-only store (used in tests and the `run` CLI subcommand).
    pub fn in_memory() -> Self {
        Self {
            base: None,
            threads: RwLock::new(HashMap::new()),
        }
    }

    /// A store backed by `<base>/threads.json`, loaded eagerly and rewritten after every
    /// mutation (small-scale durability; a real deployment would swap this for a database
    /// without changing the trait surface callers depend on).
    pub async fn open(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let file = base.join("threads.json");
        let threads = match fs::read_to_string(&file).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            base: Some(base),
            threads: RwLock::new(threads),
        })
    }

    async fn flush(&self, threads: &HashMap<String, Thread>) -> anyhow::Result<()> {
        let Some(base) = &self.base else {
            return Ok(());
        };
        let raw = serde_json::to_string_pretty(threads)?;
        fs::write(base.join("threads.json"), raw).await?;
        Ok(())
    }

    /// Fetches the thread, creating it if this is the first time it's addressed (§3).
    pub async fn get_or_create(&self, thread_id: &str) -> Thread {
        let mut threads = self.threads.write().await;
        threads
            .entry(thread_id.to_string())
            .or_insert_with(|| Thread::new(thread_id))
            .clone()
    }

    pub async fn append_message(&self, thread_id: &str, message: Message) -> anyhow::Result<()> {
        let mut threads = self.threads.write().await;
        threads
            .entry(thread_id.to_string())
            .or_insert_with(|| Thread::new(thread_id))
            .messages
            .push(message);
        self.flush(&threads).await
    }

    pub async fn load_messages(&self, thread_id: &str) -> Vec<Message> {
        self.threads
            .read()
            .await
            .get(thread_id)
            .map(|t| t.messages.clone())
            .unwrap_or_default()
    }

    pub async fn save_checkpoint(&self, thread_id: &str, blob: Value) -> anyhow::Result<()> {
        let mut threads = self.threads.write().await;
        threads
            .entry(thread_id.to_string())
            .or_insert_with(|| Thread::new(thread_id))
            .checkpoint = blob;
        self.flush(&threads).await
    }

    pub async fn load_checkpoint(&self, thread_id: &str) -> Value {
        self.threads
            .read()
            .await
            .get(thread_id)
            .map(|t| t.checkpoint.clone())
            .unwrap_or(Value::Null)
    }

    pub async fn set_pending_interrupt(
        &self,
        thread_id: &str,
        interrupt: Option<Interrupt>,
    ) -> anyhow::Result<()> {
        let mut threads = self.threads.write().await;
        threads
            .entry(thread_id.to_string())
            .or_insert_with(|| Thread::new(thread_id))
            .pending_interrupt = interrupt;
        self.flush(&threads).await
    }

    pub async fn pending_interrupt(&self, thread_id: &str) -> Option<Interrupt> {
        self.threads
            .read()
            .await
            .get(thread_id)
            .and_then(|t| t.pending_interrupt.clone())
    }
}

pub type SharedThreadStore = Arc<ThreadStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use expedition_types::Message;

    #[tokio::test]
    async fn append_message_is_visible_to_a_later_load() {
        let store = ThreadStore::in_memory();
        store
            .append_message("t1", Message::user("hello"))
            .await
            .unwrap();
        let messages = store.load_messages("t1").await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }

    #[tokio::test]
    async fn checkpoint_round_trips() {
        let store = ThreadStore::in_memory();
        store
            .save_checkpoint("t1", serde_json::json!({"step": 3}))
            .await
            .unwrap();
        let checkpoint = store.load_checkpoint("t1").await;
        assert_eq!(checkpoint["step"], 3);
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ThreadStore::open(dir.path()).await.unwrap();
            store
                .append_message("t1", Message::user("hi"))
                .await
                .unwrap();
        }
        let reopened = ThreadStore::open(dir.path()).await.unwrap();
        let messages = reopened.load_messages("t1").await;
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = ThreadStore::in_memory();
        let first = store.get_or_create("t1").await;
        store
            .append_message("t1", Message::user("hi"))
            .await
            .unwrap();
        let second = store.get_or_create("t1").await;
        assert_eq!(first.thread_id, second.thread_id);
        assert_eq!(second.messages.len(), 1);
    }
}
