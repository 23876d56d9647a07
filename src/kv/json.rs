//! Purpose: Durable kv backend that keeps every bucket in one JSON document in a blob store.
//! Exports: `JsonClient`, `JsonOptions`.
//! Role: Development/low-volume substitute for the remote broker; survives process restart.
//! Invariants: Every set/delete rewrites the whole document; this backend is not meant to scale.
//! Invariants: Mutations and watcher registration serialize through the bucket lock, so replay
//! and live delivery never overlap or skip.
//! Invariants: Document layout is `{bucket: {"name": bucket, "data": {key: base64}}}`.

use std::collections::BTreeMap;
use std::io::BufReader;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info, warn};

use super::watch::{self, Offer, WatchSender};
use super::{Bucket, Change, KvClient, WatchEvent, Watcher};
use crate::core::error::{Error, ErrorKind};
use crate::storage::BlobStore;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JsonOptions {
    #[serde(default = "default_document")]
    pub document: String,
    #[serde(default = "default_watch_capacity")]
    pub watch_capacity: usize,
}

/// Largest accepted `watch_capacity`; the queue is allocated per watcher.
pub const MAX_WATCH_CAPACITY: usize = 1 << 20;

fn default_document() -> String {
    "kv.json".to_string()
}

fn default_watch_capacity() -> usize {
    watch::DEFAULT_WATCH_CAPACITY
}

impl Default for JsonOptions {
    fn default() -> Self {
        Self {
            document: default_document(),
            watch_capacity: default_watch_capacity(),
        }
    }
}

#[derive(Clone)]
pub struct JsonClient {
    shared: Arc<Shared>,
}

struct Shared {
    store: Arc<dyn BlobStore>,
    document: String,
    watch_capacity: usize,
    buckets: RwLock<BTreeMap<String, Arc<BucketState>>>,
    save_lock: Mutex<()>,
}

struct BucketState {
    name: String,
    inner: RwLock<BucketInner>,
}

struct BucketInner {
    data: BTreeMap<String, Bytes>,
    watchers: Vec<(u64, WatchSender)>,
    next_watcher_id: u64,
}

#[derive(Serialize, Deserialize)]
struct DocumentBucket {
    name: String,
    #[serde(default)]
    data: BTreeMap<String, Base64Value>,
}

struct Base64Value(Bytes);

impl Serialize for Base64Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Base64Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map(|raw| Base64Value(Bytes::from(raw)))
            .map_err(serde::de::Error::custom)
    }
}

impl JsonOptions {
    pub fn validate(&self) -> Result<(), Error> {
        if self.document.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("kv document name is empty"));
        }
        if self.watch_capacity > MAX_WATCH_CAPACITY {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "watch_capacity {} exceeds {MAX_WATCH_CAPACITY}",
                    self.watch_capacity
                ))
                .with_hint("Pick a smaller watch_capacity in the kv options."));
        }
        Ok(())
    }
}

impl JsonClient {
    /// Loads the document, or writes an empty one when the store has none yet.
    pub fn open(store: Arc<dyn BlobStore>, options: JsonOptions) -> Result<Self, Error> {
        options.validate()?;
        let shared = Arc::new(Shared {
            store,
            document: options.document,
            watch_capacity: options.watch_capacity,
            buckets: RwLock::new(BTreeMap::new()),
            save_lock: Mutex::new(()),
        });

        match shared.store.read_streaming(&shared.document) {
            Ok(reader) => {
                let document: BTreeMap<String, DocumentBucket> =
                    serde_json::from_reader(BufReader::new(reader)).map_err(|err| {
                        Error::new(ErrorKind::Corrupt)
                            .with_message("malformed kv document")
                            .with_key(&shared.document)
                            .with_source(err)
                    })?;
                let mut buckets = shared.buckets_mut();
                for (name, bucket) in document {
                    let data = bucket
                        .data
                        .into_iter()
                        .map(|(key, value)| (key, value.0))
                        .collect();
                    buckets.insert(name.clone(), Arc::new(BucketState::new(name, data)));
                }
                info!(
                    document = %shared.document,
                    buckets = buckets.len(),
                    "loaded kv document"
                );
            }
            Err(err) if err.is_not_found() => {
                info!(document = %shared.document, "no kv document yet; writing an empty one");
                shared.save()?;
            }
            Err(err) => return Err(err),
        }

        Ok(Self { shared })
    }

    pub fn document(&self) -> &str {
        &self.shared.document
    }
}

#[async_trait]
impl KvClient for JsonClient {
    async fn bucket(&self, name: &str) -> Result<Arc<dyn Bucket>, Error> {
        if name.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("bucket name must not be empty"));
        }
        let (state, created) = {
            let mut buckets = self.shared.buckets_mut();
            match buckets.get(name) {
                Some(state) => (state.clone(), false),
                None => {
                    let state = Arc::new(BucketState::new(name.to_string(), BTreeMap::new()));
                    buckets.insert(name.to_string(), state.clone());
                    (state, true)
                }
            }
        };
        if created {
            debug!(bucket = name, "created bucket");
            self.shared.save()?;
        }
        Ok(Arc::new(JsonBucket {
            state,
            shared: self.shared.clone(),
        }))
    }
}

impl Shared {
    fn buckets(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<BucketState>>> {
        self.buckets.read().unwrap_or_else(|poison| poison.into_inner())
    }

    fn buckets_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<BucketState>>> {
        self.buckets.write().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Rewrites the full document. The snapshot is taken under the save lock so the
    /// last completed save always contains every mutation applied before it started.
    fn save(&self) -> Result<(), Error> {
        let _guard = self
            .save_lock
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let document = self.snapshot();
        let mut writer = self.store.save_streaming(&self.document)?;
        serde_json::to_writer(&mut writer, &document).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write kv document")
                .with_key(&self.document)
                .with_source(err)
        })?;
        writer.commit()
    }

    fn snapshot(&self) -> BTreeMap<String, DocumentBucket> {
        self.buckets()
            .iter()
            .map(|(name, state)| {
                let data = state
                    .read()
                    .data
                    .iter()
                    .map(|(key, value)| (key.clone(), Base64Value(value.clone())))
                    .collect();
                (
                    name.clone(),
                    DocumentBucket {
                        name: name.clone(),
                        data,
                    },
                )
            })
            .collect()
    }
}

impl BucketState {
    fn new(name: String, data: BTreeMap<String, Bytes>) -> Self {
        Self {
            name,
            inner: RwLock::new(BucketInner {
                data,
                watchers: Vec::new(),
                next_watcher_id: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BucketInner> {
        self.inner.read().unwrap_or_else(|poison| poison.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BucketInner> {
        self.inner.write().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl BucketInner {
    fn publish(&mut self, bucket: &str, change: Change) {
        self.watchers
            .retain(|(id, sender)| match sender.offer(WatchEvent::Change(change.clone())) {
                Offer::Delivered => {
                    debug!(bucket, key = %change.key, op = %change.operation, watcher = id, "queued change");
                    true
                }
                Offer::Overflowed => {
                    warn!(bucket, watcher = id, "watcher queue full; detaching it");
                    false
                }
                Offer::Closed => false,
            });
    }
}

struct JsonBucket {
    state: Arc<BucketState>,
    shared: Arc<Shared>,
}

#[async_trait]
impl Bucket for JsonBucket {
    fn name(&self) -> &str {
        &self.state.name
    }

    async fn get(&self, key: &str) -> Result<Bytes, Error> {
        self.state
            .read()
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), Error> {
        {
            let mut inner = self.state.write();
            inner.data.insert(key.to_string(), value.clone());
            inner.publish(&self.state.name, Change::put(key, value));
        }
        self.shared.save()
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        {
            let mut inner = self.state.write();
            if inner.data.remove(key).is_none() {
                return Err(Error::not_found(key));
            }
            inner.publish(&self.state.name, Change::delete(key));
        }
        self.shared.save()
    }

    async fn list_keys(&self) -> Result<Vec<String>, Error> {
        Ok(self.state.read().data.keys().cloned().collect())
    }

    async fn watch_all(&self) -> Result<Box<dyn Watcher>, Error> {
        let watcher = {
            let mut inner = self.state.write();
            let capacity = inner
                .data
                .len()
                .saturating_add(1)
                .saturating_add(self.shared.watch_capacity);
            let (sender, watcher) = watch::channel(&self.state.name, capacity);
            debug!(bucket = %self.state.name, entries = inner.data.len(), "replaying bucket");
            for (key, value) in &inner.data {
                sender.offer(WatchEvent::Change(Change::put(key.clone(), value.clone())));
            }
            sender.offer(WatchEvent::Replayed);

            let id = inner.next_watcher_id;
            inner.next_watcher_id += 1;
            inner.watchers.push((id, sender));

            let state = Arc::downgrade(&self.state);
            watcher.on_unwatch(move || {
                if let Some(state) = state.upgrade() {
                    state.write().watchers.retain(|(other, _)| *other != id);
                }
            })
        };
        Ok(Box::new(watcher))
    }
}

#[cfg(test)]
mod tests {
    use super::{JsonClient, JsonOptions, MAX_WATCH_CAPACITY};
    use crate::core::error::ErrorKind;
    use crate::kv::{Change, KvClient, WatchEvent};
    use crate::storage::{BlobStore, MemoryStore};
    use bytes::Bytes;
    use serde_json::Value;
    use std::sync::Arc;

    fn document(store: &MemoryStore) -> Value {
        let raw = store.read("kv.json").expect("document");
        serde_json::from_slice(&raw).expect("json")
    }

    #[tokio::test]
    async fn first_open_persists_empty_document() {
        let store = MemoryStore::new();
        JsonClient::open(Arc::new(store.clone()), JsonOptions::default()).expect("open");
        assert_eq!(document(&store), serde_json::json!({}));
    }

    #[tokio::test]
    async fn document_layout_uses_base64_values() {
        let store = MemoryStore::new();
        let client = JsonClient::open(Arc::new(store.clone()), JsonOptions::default()).expect("open");
        let bucket = client.bucket("perms").await.expect("bucket");
        bucket
            .set("alice", Bytes::from_static(b"admin"))
            .await
            .expect("set");

        let doc = document(&store);
        assert_eq!(doc["perms"]["name"], "perms");
        assert_eq!(doc["perms"]["data"]["alice"], "YWRtaW4=");
    }

    #[tokio::test]
    async fn every_mutation_rewrites_all_buckets() {
        let store = MemoryStore::new();
        let client = JsonClient::open(Arc::new(store.clone()), JsonOptions::default()).expect("open");
        let first = client.bucket("first").await.expect("bucket");
        let second = client.bucket("second").await.expect("bucket");
        first.set("a", Bytes::from_static(b"1")).await.expect("set");
        second.set("b", Bytes::from_static(b"2")).await.expect("set");

        let doc = document(&store);
        assert_eq!(doc["first"]["data"]["a"], "MQ==");
        assert_eq!(doc["second"]["data"]["b"], "Mg==");

        second.delete("b").await.expect("delete");
        let doc = document(&store);
        assert!(doc["second"]["data"].as_object().expect("data").is_empty());
        assert_eq!(doc["first"]["data"]["a"], "MQ==");
    }

    #[tokio::test]
    async fn corrupt_document_is_rejected() {
        let store = MemoryStore::new();
        store.save("kv.json", b"{\"b\": [1, 2]}").expect("save");
        let err = JsonClient::open(Arc::new(store), JsonOptions::default())
            .err()
            .expect("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[tokio::test]
    async fn overflowing_watcher_does_not_block_writers() {
        let options = JsonOptions {
            watch_capacity: 0,
            ..JsonOptions::default()
        };
        let client = JsonClient::open(Arc::new(MemoryStore::new()), options).expect("open");
        let bucket = client.bucket("busy").await.expect("bucket");
        let mut watcher = bucket.watch_all().await.expect("watch");

        for n in 0..16u8 {
            bucket
                .set("k", Bytes::from(vec![n]))
                .await
                .expect("set never blocks");
        }

        assert_eq!(watcher.next().await.expect("replayed"), Some(WatchEvent::Replayed));
        let err = watcher.next().await.expect_err("lagged");
        assert_eq!(err.kind(), ErrorKind::Lagged);

        let mut fresh = bucket.watch_all().await.expect("resubscribe");
        assert_eq!(
            fresh.next().await.expect("replay"),
            Some(WatchEvent::Change(Change::put("k", vec![15u8])))
        );
        assert_eq!(fresh.next().await.expect("replayed"), Some(WatchEvent::Replayed));
    }

    #[tokio::test]
    async fn empty_bucket_name_is_usage_error() {
        let client = JsonClient::open(Arc::new(MemoryStore::new()), JsonOptions::default()).expect("open");
        let err = client.bucket("").await.err().expect("usage");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
    #[tokio::test]
    async fn custom_document_name_is_used() {
        let store = MemoryStore::new();
        let options = JsonOptions {
            document: "state.json".to_string(),
            ..JsonOptions::default()
        };
        let client = JsonClient::open(Arc::new(store.clone()), options).expect("open");
        assert_eq!(client.document(), "state.json");
        assert!(store.read("state.json").is_ok());
        assert!(store.read("kv.json").expect_err("default unused").is_not_found());
    }

    #[test]
    fn oversized_watch_capacity_is_rejected() {
        let options = JsonOptions {
            watch_capacity: usize::MAX,
            ..JsonOptions::default()
        };
        let err = JsonClient::open(Arc::new(MemoryStore::new()), options)
            .err()
            .expect("usage");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let options = JsonOptions {
            watch_capacity: MAX_WATCH_CAPACITY,
            ..JsonOptions::default()
        };
        options.validate().expect("largest accepted");
    }
}
