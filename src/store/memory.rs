use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast, watch};
use uuid::Uuid;

use crate::live::Live;

use super::{Document, Filter, OrderBy, StoreError, StoreResult};

const MAX_TXN_ATTEMPTS: u32 = 5;

type Collections = HashMap<&'static str, HashMap<Uuid, Document>>;

/// In-process document store. Documents are versioned JSON values grouped
/// into named collections; every committed write bumps the document version
/// and wakes the live subscriptions on that collection.
#[derive(Clone)]
pub struct MemoryStore {
    collections: Arc<RwLock<Collections>>,
    changes: broadcast::Sender<&'static str>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    pub async fn get(&self, collection: &'static str, id: Uuid) -> Option<Document> {
        let guard = self.collections.read().await;
        guard.get(collection).and_then(|docs| docs.get(&id)).cloned()
    }

    pub async fn query(
        &self,
        collection: &'static str,
        filter: &Filter,
        order: Option<&OrderBy>,
    ) -> Vec<Document> {
        let guard = self.collections.read().await;
        let mut docs: Vec<Document> = guard
            .get(collection)
            .map(|docs| docs.values().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default();
        if let Some(order) = order {
            order.sort(&mut docs);
        }
        docs
    }

    pub async fn count(&self, collection: &'static str, filter: &Filter) -> usize {
        let guard = self.collections.read().await;
        guard
            .get(collection)
            .map(|docs| docs.values().filter(|d| filter.matches(d)).count())
            .unwrap_or(0)
    }

    /// Create or fully replace a document.
    pub async fn set<T: Serialize>(
        &self,
        collection: &'static str,
        id: Uuid,
        value: &T,
    ) -> StoreResult<()> {
        let data = serde_json::to_value(value)?;
        {
            let mut guard = self.collections.write().await;
            let docs = guard.entry(collection).or_default();
            let version = docs.get(&id).map(|d| d.version).unwrap_or(0) + 1;
            docs.insert(id, Document { id, version, data });
        }
        self.notify(collection);
        Ok(())
    }

    /// Replace a document only if its version still matches `expected`
    /// (`None` = must not exist yet). Returns whether the write landed; a
    /// `false` is the caller's signal that it lost a write race.
    pub async fn set_if_unchanged<T: Serialize>(
        &self,
        collection: &'static str,
        id: Uuid,
        expected: Option<u64>,
        value: &T,
    ) -> StoreResult<bool> {
        let data = serde_json::to_value(value)?;
        {
            let mut guard = self.collections.write().await;
            let docs = guard.entry(collection).or_default();
            let current = docs.get(&id).map(|d| d.version);
            if current != expected {
                return Ok(false);
            }
            let version = current.unwrap_or(0) + 1;
            docs.insert(id, Document { id, version, data });
        }
        self.notify(collection);
        Ok(true)
    }

    /// Merge the fields of a JSON object into an existing document.
    pub async fn update(
        &self,
        collection: &'static str,
        id: Uuid,
        fields: Value,
    ) -> StoreResult<()> {
        {
            let mut guard = self.collections.write().await;
            let doc = guard
                .get_mut(collection)
                .and_then(|docs| docs.get_mut(&id))
                .ok_or(StoreError::NotFound { collection, id })?;
            merge_fields(&mut doc.data, fields);
            doc.version += 1;
        }
        self.notify(collection);
        Ok(())
    }

    /// Deleting an absent document is a no-op, matching hosted stores.
    pub async fn delete(&self, collection: &'static str, id: Uuid) {
        let removed = {
            let mut guard = self.collections.write().await;
            guard
                .get_mut(collection)
                .and_then(|docs| docs.remove(&id))
                .is_some()
        };
        if removed {
            self.notify(collection);
        }
    }

    /// Live view over a query. The returned handle always holds the latest
    /// result set; intermediate results are dropped, never queued. Dropping
    /// the handle tears the listener down.
    pub async fn subscribe(
        &self,
        collection: &'static str,
        filter: Filter,
        order: Option<OrderBy>,
    ) -> Live<Vec<Document>> {
        // Register the listener before reading the initial snapshot so a
        // write landing in between still triggers a recompute.
        let mut changes = self.changes.subscribe();
        let initial = self.query(collection, &filter, order.as_ref()).await;
        let (tx, rx) = watch::channel(initial);
        let store = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(changed) if changed == collection => {}
                    Ok(_) => continue,
                    // A lagged receiver just missed intermediate states;
                    // recompute from current data.
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                let docs = store.query(collection, &filter, order.as_ref()).await;
                if tx.send(docs).is_err() {
                    break;
                }
            }
        });
        Live::new(rx, task)
    }

    /// Live view over a single document.
    pub async fn subscribe_doc(
        &self,
        collection: &'static str,
        id: Uuid,
    ) -> Live<Option<Document>> {
        let mut changes = self.changes.subscribe();
        let initial = self.get(collection, id).await;
        let (tx, rx) = watch::channel(initial);
        let store = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(changed) if changed == collection => {}
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                let doc = store.get(collection, id).await;
                if tx.send(doc).is_err() {
                    break;
                }
            }
        });
        Live::new(rx, task)
    }

    /// Run `body` as an atomic transaction: all reads observe one consistent
    /// snapshot, buffered writes commit together only if none of the read
    /// documents changed in the meantime. Conflicting attempts are retried a
    /// bounded number of times; an `Err` from `body` aborts immediately with
    /// no effects.
    pub async fn run_transaction<T, E, F>(&self, mut body: F) -> Result<T, E>
    where
        F: FnMut(&mut Txn) -> Result<T, E>,
        E: From<StoreError>,
    {
        for _ in 0..MAX_TXN_ATTEMPTS {
            let snapshot = self.collections.read().await.clone();
            let mut txn = Txn {
                snapshot,
                reads: Vec::new(),
                writes: Vec::new(),
            };
            let out = body(&mut txn)?;

            match self.commit(txn).await {
                Ok(changed) => {
                    for collection in changed {
                        self.notify(collection);
                    }
                    return Ok(out);
                }
                Err(CommitError::Conflict) => continue,
                Err(CommitError::Store(err)) => return Err(E::from(err)),
            }
        }
        Err(E::from(StoreError::TransactionConflict {
            attempts: MAX_TXN_ATTEMPTS,
        }))
    }

    async fn commit(&self, txn: Txn) -> Result<Vec<&'static str>, CommitError> {
        let mut guard = self.collections.write().await;

        for (collection, id, observed) in &txn.reads {
            let current = guard
                .get(collection)
                .and_then(|docs| docs.get(id))
                .map(|d| d.version);
            if current != *observed {
                return Err(CommitError::Conflict);
            }
        }

        let mut changed = Vec::new();
        for write in txn.writes {
            match write {
                TxnWrite::Set {
                    collection,
                    id,
                    data,
                } => {
                    let docs = guard.entry(collection).or_default();
                    let version = docs.get(&id).map(|d| d.version).unwrap_or(0) + 1;
                    docs.insert(id, Document { id, version, data });
                    changed.push(collection);
                }
                TxnWrite::Update {
                    collection,
                    id,
                    fields,
                } => {
                    let doc = guard
                        .get_mut(collection)
                        .and_then(|docs| docs.get_mut(&id))
                        .ok_or(CommitError::Store(StoreError::NotFound {
                            collection,
                            id,
                        }))?;
                    merge_fields(&mut doc.data, fields);
                    doc.version += 1;
                    changed.push(collection);
                }
                TxnWrite::Delete { collection, id } => {
                    if let Some(docs) = guard.get_mut(collection)
                        && docs.remove(&id).is_some()
                    {
                        changed.push(collection);
                    }
                }
            }
        }

        changed.dedup();
        Ok(changed)
    }

    fn notify(&self, collection: &'static str) {
        // No receivers is fine; subscriptions come and go.
        let _ = self.changes.send(collection);
    }
}

enum CommitError {
    Conflict,
    Store(StoreError),
}

enum TxnWrite {
    Set {
        collection: &'static str,
        id: Uuid,
        data: Value,
    },
    Update {
        collection: &'static str,
        id: Uuid,
        fields: Value,
    },
    Delete {
        collection: &'static str,
        id: Uuid,
    },
}

/// Transaction context handed to the `run_transaction` body. Reads come from
/// the snapshot taken when the attempt started and record the observed
/// version; buffered writes are not read back.
pub struct Txn {
    snapshot: Collections,
    reads: Vec<(&'static str, Uuid, Option<u64>)>,
    writes: Vec<TxnWrite>,
}

impl Txn {
    pub fn get(&mut self, collection: &'static str, id: Uuid) -> Option<Document> {
        let doc = self
            .snapshot
            .get(collection)
            .and_then(|docs| docs.get(&id))
            .cloned();
        self.reads
            .push((collection, id, doc.as_ref().map(|d| d.version)));
        doc
    }

    pub fn set<T: Serialize>(
        &mut self,
        collection: &'static str,
        id: Uuid,
        value: &T,
    ) -> StoreResult<()> {
        let data = serde_json::to_value(value)?;
        self.writes.push(TxnWrite::Set {
            collection,
            id,
            data,
        });
        Ok(())
    }

    pub fn update(&mut self, collection: &'static str, id: Uuid, fields: Value) {
        self.writes.push(TxnWrite::Update {
            collection,
            id,
            fields,
        });
    }

    pub fn delete(&mut self, collection: &'static str, id: Uuid) {
        self.writes.push(TxnWrite::Delete { collection, id });
    }
}

fn merge_fields(data: &mut Value, fields: Value) {
    if let (Value::Object(target), Value::Object(updates)) = (data, fields) {
        for (key, value) in updates {
            target.insert(key, value);
        }
    }
}
