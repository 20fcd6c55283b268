use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::{
    error::{BridgeError, Result},
    record::ArtifactRecord,
    store::KvStore,
};

pub const REGISTRY_KEY: &str = "android_bridge_apk_registry";

pub type RecordMap = BTreeMap<String, ArtifactRecord>;

type Mutation = Box<dyn FnOnce(&mut Option<ArtifactRecord>) -> Result<()> + Send>;

enum Command {
    Get {
        id: String,
        reply: oneshot::Sender<Option<ArtifactRecord>>,
    },
    All {
        reply: oneshot::Sender<RecordMap>,
    },
    Put {
        record: ArtifactRecord,
        reply: oneshot::Sender<()>,
    },
    Update {
        id: String,
        apply: Mutation,
        reply: oneshot::Sender<Result<Option<ArtifactRecord>>>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the download registry.
///
/// The whole id → record document lives under one storage key. A single task
/// owns the store and applies commands one at a time, so read-modify-write
/// cycles from different callers never interleave.
#[derive(Clone)]
pub struct Registry {
    tx: mpsc::UnboundedSender<Command>,
}

impl Registry {
    /// Starts the writer task. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn KvStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_registry(store, rx));
        Self { tx }
    }

    pub async fn get(&self, id: &str) -> Option<ArtifactRecord> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Get {
            id: id.to_string(),
            reply,
        });
        rx.await.ok().flatten()
    }

    pub async fn all(&self) -> RecordMap {
        let (reply, rx) = oneshot::channel();
        self.send(Command::All { reply });
        rx.await.unwrap_or_default()
    }

    pub async fn put(&self, record: ArtifactRecord) {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Put { record, reply });
        let _ = rx.await;
    }

    /// Applies `apply` to the entry for `id` (None if absent) inside the writer
    /// task. The document is saved only when `apply` succeeds; leaving the
    /// slot empty removes the entry.
    pub async fn update<F>(&self, id: &str, apply: F) -> Result<Option<ArtifactRecord>>
    where
        F: FnOnce(&mut Option<ArtifactRecord>) -> Result<()> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Update {
            id: id.to_string(),
            apply: Box::new(apply),
            reply,
        });
        rx.await
            .map_err(|_| BridgeError::Storage("registry task stopped".to_string()))?
    }

    pub async fn remove(&self, id: &str) {
        let _ = self
            .update(id, |slot| {
                *slot = None;
                Ok(())
            })
            .await;
    }

    pub async fn clear(&self) {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Clear { reply });
        let _ = rx.await;
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            error!("[Registry] Writer task is gone; request dropped");
        }
    }
}

async fn run_registry(store: Arc<dyn KvStore>, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Get { id, reply } => {
                let _ = reply.send(load(store.as_ref()).remove(&id));
            }
            Command::All { reply } => {
                let _ = reply.send(load(store.as_ref()));
            }
            Command::Put { record, reply } => {
                let mut records = load(store.as_ref());
                records.insert(record.id.clone(), record);
                save(store.as_ref(), &records);
                let _ = reply.send(());
            }
            Command::Update { id, apply, reply } => {
                let mut records = load(store.as_ref());
                let mut slot = records.remove(&id);
                let result = match apply(&mut slot) {
                    Ok(()) => {
                        if let Some(record) = slot.clone() {
                            records.insert(id, record);
                        }
                        save(store.as_ref(), &records);
                        Ok(slot)
                    }
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            Command::Clear { reply } => {
                if let Err(err) = store.remove_item(REGISTRY_KEY) {
                    error!("[Registry] Failed to clear registry: {err:#}");
                }
                let _ = reply.send(());
            }
        }
    }
}

// Storage failures read as an empty registry so a broken store never blocks
// the page; the next successful save overwrites whatever was there.
fn load(store: &dyn KvStore) -> RecordMap {
    match store.get_item(REGISTRY_KEY) {
        Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!("[Registry] Failed to parse registry: {err}. Starting fresh.");
            RecordMap::new()
        }),
        Ok(None) => RecordMap::new(),
        Err(err) => {
            warn!("[Registry] Failed to read registry: {err:#}. Starting fresh.");
            RecordMap::new()
        }
    }
}

fn save(store: &dyn KvStore, records: &RecordMap) {
    let raw = match serde_json::to_string(records) {
        Ok(raw) => raw,
        Err(err) => {
            error!("[Registry] Failed to serialize registry: {err}");
            return;
        }
    };
    if let Err(err) = store.set_item(REGISTRY_KEY, &raw) {
        error!("[Registry] Failed to save registry: {err:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{record::ArtifactStatus, store::MemoryStore};

    struct BrokenStore;

    impl KvStore for BrokenStore {
        fn get_item(&self, _key: &str) -> anyhow::Result<Option<String>> {
            Err(anyhow::anyhow!("disk on fire"))
        }
        fn set_item(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("disk on fire"))
        }
        fn remove_item(&self, _key: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("disk on fire"))
        }
    }

    #[tokio::test]
    async fn test_put_get_all() {
        let registry = Registry::spawn(Arc::new(MemoryStore::new()));
        assert!(registry.get("app1").await.is_none());

        registry.put(ArtifactRecord::new("app1", "https://x/a.apk")).await;
        registry.put(ArtifactRecord::new("app2", "https://x/b.apk")).await;

        let record = registry.get("app1").await.unwrap();
        assert_eq!(record.source_url, "https://x/a.apk");
        assert_eq!(
            registry.all().await.keys().cloned().collect::<Vec<_>>(),
            vec!["app1".to_string(), "app2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_writes() {
        let registry = Registry::spawn(Arc::new(MemoryStore::new()));

        let updates = (0..32).map(|i| {
            let registry = registry.clone();
            async move {
                let id = format!("app{i}");
                let url = format!("https://x/{i}.apk");
                let record_id = id.clone();
                registry
                    .update(&id, move |slot| {
                        let record =
                            slot.get_or_insert_with(|| ArtifactRecord::new(&record_id, &url));
                        record.begin_download(&url)
                    })
                    .await
            }
        });
        for result in futures::future::join_all(updates).await {
            assert!(result.is_ok());
        }

        let all = registry.all().await;
        assert_eq!(all.len(), 32);
        assert!(all.values().all(|r| r.status == ArtifactStatus::Downloading));
    }

    #[tokio::test]
    async fn test_failed_update_is_not_saved() {
        let registry = Registry::spawn(Arc::new(MemoryStore::new()));
        registry.put(ArtifactRecord::new("app1", "https://x/a.apk")).await;

        let result = registry
            .update("app1", |slot| match slot.as_mut() {
                Some(record) => record.mark_installed(),
                None => Err(BridgeError::NotFound),
            })
            .await;
        assert!(matches!(result, Err(BridgeError::InvalidTransition { .. })));
        assert_eq!(
            registry.get("app1").await.unwrap().status,
            ArtifactStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let registry = Registry::spawn(Arc::new(MemoryStore::new()));
        registry.put(ArtifactRecord::new("app1", "https://x/a.apk")).await;
        registry.put(ArtifactRecord::new("app2", "https://x/b.apk")).await;

        registry.remove("app1").await;
        assert!(registry.get("app1").await.is_none());
        assert!(registry.get("app2").await.is_some());

        registry.clear().await;
        assert!(registry.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_reads_as_empty() {
        let registry = Registry::spawn(Arc::new(BrokenStore));
        registry.put(ArtifactRecord::new("app1", "https://x/a.apk")).await;
        assert!(registry.get("app1").await.is_none());
        assert!(registry.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_document_reads_as_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set_item(REGISTRY_KEY, "not json").unwrap();
        let registry = Registry::spawn(store);
        assert!(registry.all().await.is_empty());
    }
}
