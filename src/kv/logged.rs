// Logging decorators for kv clients, buckets and watchers; results pass through untouched.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{Bucket, KvClient, WatchEvent, Watcher};
use crate::core::error::Error;

#[derive(Clone)]
pub struct LoggedClient {
    inner: Arc<dyn KvClient>,
}

impl LoggedClient {
    pub fn new(inner: Arc<dyn KvClient>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl KvClient for LoggedClient {
    async fn bucket(&self, name: &str) -> Result<Arc<dyn Bucket>, Error> {
        match self.inner.bucket(name).await {
            Ok(bucket) => {
                debug!(bucket = name, "kv bucket");
                Ok(Arc::new(LoggedBucket::new(bucket)))
            }
            Err(err) => {
                debug!(bucket = name, %err, "kv bucket failed");
                Err(err)
            }
        }
    }
}

pub struct LoggedBucket {
    inner: Arc<dyn Bucket>,
}

impl LoggedBucket {
    pub fn new(inner: Arc<dyn Bucket>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Bucket for LoggedBucket {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> Result<Bytes, Error> {
        let bucket = self.inner.name();
        let result = self.inner.get(key).await;
        match &result {
            Ok(value) => debug!(bucket, key, len = value.len(), "kv get"),
            Err(err) => debug!(bucket, key, %err, "kv get failed"),
        }
        result
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), Error> {
        let bucket = self.inner.name();
        let len = value.len();
        let result = self.inner.set(key, value).await;
        match &result {
            Ok(()) => debug!(bucket, key, len, "kv set"),
            Err(err) => debug!(bucket, key, len, %err, "kv set failed"),
        }
        result
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let bucket = self.inner.name();
        let result = self.inner.delete(key).await;
        match &result {
            Ok(()) => debug!(bucket, key, "kv delete"),
            Err(err) => debug!(bucket, key, %err, "kv delete failed"),
        }
        result
    }

    async fn list_keys(&self) -> Result<Vec<String>, Error> {
        let bucket = self.inner.name();
        let result = self.inner.list_keys().await;
        match &result {
            Ok(keys) => debug!(bucket, count = keys.len(), "kv list_keys"),
            Err(err) => debug!(bucket, %err, "kv list_keys failed"),
        }
        result
    }

    async fn watch_all(&self) -> Result<Box<dyn Watcher>, Error> {
        let bucket = self.inner.name();
        match self.inner.watch_all().await {
            Ok(watcher) => {
                debug!(bucket, "kv watch_all");
                Ok(Box::new(LoggedWatcher::new(watcher)))
            }
            Err(err) => {
                debug!(bucket, %err, "kv watch_all failed");
                Err(err)
            }
        }
    }
}

pub struct LoggedWatcher {
    inner: Box<dyn Watcher>,
}

impl LoggedWatcher {
    pub fn new(inner: Box<dyn Watcher>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Watcher for LoggedWatcher {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn next(&mut self) -> Result<Option<WatchEvent>, Error> {
        let result = self.inner.next().await;
        let bucket = self.inner.bucket();
        match &result {
            Ok(Some(WatchEvent::Change(change))) => {
                debug!(bucket, key = %change.key, op = %change.operation, "kv watch change")
            }
            Ok(Some(WatchEvent::Replayed)) => debug!(bucket, "kv watch replayed"),
            Ok(None) => debug!(bucket, "kv watch finished"),
            Err(err) => debug!(bucket, %err, "kv watch failed"),
        }
        result
    }

    fn unwatch(&mut self) {
        self.inner.unwatch();
        debug!(bucket = self.inner.bucket(), "kv unwatch");
    }
}
