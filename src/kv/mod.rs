//! Purpose: Namespaced key-value buckets with replay-then-live change subscriptions.
//! Exports: `KvClient`, `Bucket`, `Watcher`, `WatchEvent`, `Change`, `Operation`,
//! `JsonClient`, `JsonOptions`, `NatsClient`, `NatsOptions`, `LoggedClient`, `get_json`, `set_json`.
//! Role: One contract over the durable-document backend and the remote broker backend.
//! Invariants: A watcher sees replayed state, then `WatchEvent::Replayed`, then live changes
//! in mutation order, each exactly once.
//! Invariants: `get`/`delete` of an absent key fail with `ErrorKind::NotFound` on every backend.
//! Invariants: Producers never block on a slow watcher; overflow detaches it (`ErrorKind::Lagged`).
#![allow(clippy::result_large_err)]

mod json;
mod logged;
pub(crate) mod nats;
mod watch;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::error::{Error, ErrorKind};

pub use json::{JsonClient, JsonOptions, MAX_WATCH_CAPACITY};
pub use logged::{LoggedBucket, LoggedClient, LoggedWatcher};
pub use nats::{NatsClient, NatsOptions};
pub use watch::{ChannelWatcher, DEFAULT_WATCH_CAPACITY};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Operation {
    Put,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Put => f.write_str("Put"),
            Operation::Delete => f.write_str("Delete"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Change {
    pub key: String,
    pub value: Option<Bytes>,
    pub operation: Operation,
}

impl Change {
    pub fn put(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            operation: Operation::Put,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            operation: Operation::Delete,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatchEvent {
    Change(Change),
    /// Every pre-existing entry has been delivered; later events are live.
    Replayed,
}

#[async_trait]
pub trait KvClient: Send + Sync {
    /// Returns the named bucket, creating it when absent. Repeated calls share state.
    async fn bucket(&self, name: &str) -> Result<Arc<dyn Bucket>, Error>;
}

#[async_trait]
pub trait Bucket: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Bytes, Error>;

    async fn set(&self, key: &str, value: Bytes) -> Result<(), Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    async fn list_keys(&self) -> Result<Vec<String>, Error>;

    async fn watch_all(&self) -> Result<Box<dyn Watcher>, Error>;
}

#[async_trait]
pub trait Watcher: Send {
    fn bucket(&self) -> &str;

    /// Next event in delivery order.
    ///
    /// `Ok(None)` once the watcher has been unwatched and drained. `Err(Lagged)` when the
    /// queue overflowed; `Err(Broker | Closed)` when the upstream watch failed. After an
    /// error the watcher is finished and the caller must subscribe again.
    async fn next(&mut self) -> Result<Option<WatchEvent>, Error>;

    /// Detaches from the bucket and closes the queue. Idempotent.
    fn unwatch(&mut self);
}

pub async fn get_json<T: DeserializeOwned>(bucket: &dyn Bucket, key: &str) -> Result<T, Error> {
    let raw = bucket.get(key).await?;
    serde_json::from_slice(&raw).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message(format!("malformed json value in bucket {}", bucket.name()))
            .with_key(key)
            .with_source(err)
    })
}

pub async fn set_json<T: Serialize + ?Sized>(
    bucket: &dyn Bucket,
    key: &str,
    value: &T,
) -> Result<(), Error> {
    let raw = serde_json::to_vec(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode json value")
            .with_key(key)
            .with_source(err)
    })?;
    bucket.set(key, Bytes::from(raw)).await
}
