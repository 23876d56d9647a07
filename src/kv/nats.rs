//! Purpose: Remote kv backend over the broker's replicated key-value buckets (JetStream).
//! Exports: `NatsClient`, `NatsOptions`; crate-internal `connect`.
//! Role: Production backend; one bucket maps 1:1 to a broker-managed bucket.
//! Invariants: Bucket handles create-or-attach; keys and values pass through unmodified.
//! Invariants: Watch translation drops purges and emits `Replayed` exactly once.
use std::collections::HashMap;
use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::watch::{self, WatchSender};
use super::{Bucket, Change, KvClient, WatchEvent, Watcher};
use crate::core::error::{Error, ErrorKind};

const DEFAULT_URL: &str = "nats://127.0.0.1:4222";

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NatsOptions {
    #[serde(default = "default_url")]
    pub url: String,
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

impl Default for NatsOptions {
    fn default() -> Self {
        Self { url: default_url() }
    }
}

impl NatsOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn validate(&self) -> Result<(), Error> {
        let parsed = Url::parse(&self.url).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid broker url: {}", self.url))
                .with_hint("Use nats://host:port (or tls://, ws://, wss://).")
                .with_source(err)
        })?;
        match parsed.scheme() {
            "nats" | "tls" | "ws" | "wss" => Ok(()),
            other => Err(Error::new(ErrorKind::Usage)
                .with_message(format!("unsupported broker url scheme: {other}"))
                .with_hint("Use nats://host:port (or tls://, ws://, wss://).")),
        }
    }
}

/// Opens a broker connection; failures are startup errors.
pub(crate) async fn connect(options: &NatsOptions) -> Result<async_nats::Client, Error> {
    options.validate()?;
    let client = async_nats::connect(options.url.as_str())
        .await
        .map_err(|err| {
            broker_error(format!("failed to connect to broker at {}", options.url), err)
                .with_hint("Check that the broker is running and reachable.")
        })?;
    info!(url = %options.url, "connected to broker");
    Ok(client)
}

pub(crate) fn broker_error(
    message: impl Into<String>,
    err: impl StdError + Send + Sync + 'static,
) -> Error {
    Error::new(ErrorKind::Broker)
        .with_message(message)
        .with_source(err)
}

#[derive(Clone)]
pub struct NatsClient {
    context: jetstream::Context,
    buckets: Arc<Mutex<HashMap<String, Arc<NatsBucket>>>>,
}

impl NatsClient {
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            context: jetstream::new(client),
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn connect(options: &NatsOptions) -> Result<Self, Error> {
        Ok(Self::new(connect(options).await?))
    }

    fn cached(&self, name: &str) -> Option<Arc<NatsBucket>> {
        self.buckets
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl KvClient for NatsClient {
    async fn bucket(&self, name: &str) -> Result<Arc<dyn Bucket>, Error> {
        if let Some(bucket) = self.cached(name) {
            return Ok(bucket);
        }

        let config = kv::Config {
            bucket: name.to_string(),
            ..Default::default()
        };
        let store = match self.context.create_key_value(config).await {
            Ok(store) => store,
            Err(create_err) => {
                debug!(bucket = name, err = %create_err, "create failed; attaching to existing bucket");
                self.context.get_key_value(name).await.map_err(|_| {
                    broker_error(format!("failed to open bucket {name}"), create_err)
                })?
            }
        };

        let bucket = Arc::new(NatsBucket {
            name: name.to_string(),
            store,
        });
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let bucket = buckets.entry(name.to_string()).or_insert(bucket).clone();
        Ok(bucket)
    }
}

struct NatsBucket {
    name: String,
    store: kv::Store,
}

#[async_trait]
impl Bucket for NatsBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Bytes, Error> {
        self.store
            .get(key)
            .await
            .map_err(|err| broker_error(format!("get failed in bucket {}", self.name), err).with_key(key))?
            .ok_or_else(|| Error::not_found(key))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), Error> {
        self.store
            .put(key, value)
            .await
            .map(|_revision| ())
            .map_err(|err| broker_error(format!("put failed in bucket {}", self.name), err).with_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        // The broker accepts deletes of absent keys; report them like every other backend.
        self.get(key).await?;
        self.store
            .delete(key)
            .await
            .map_err(|err| broker_error(format!("delete failed in bucket {}", self.name), err).with_key(key))
    }

    async fn list_keys(&self) -> Result<Vec<String>, Error> {
        let mut keys = Box::pin(self.store.keys().await.map_err(|err| {
            broker_error(format!("failed to list keys in bucket {}", self.name), err)
        })?);
        let mut out = Vec::new();
        while let Some(key) = keys.next().await {
            out.push(key.map_err(|err| {
                broker_error(format!("failed to list keys in bucket {}", self.name), err)
            })?);
        }
        out.sort();
        Ok(out)
    }

    async fn watch_all(&self) -> Result<Box<dyn Watcher>, Error> {
        let stored = self
            .store
            .status()
            .await
            .map_err(|err| broker_error(format!("failed to inspect bucket {}", self.name), err))?
            .values();
        let updates = self
            .store
            .watch_with_history(">")
            .await
            .map_err(|err| broker_error(format!("failed to watch bucket {}", self.name), err))?;

        let (sender, watcher) = watch::channel(&self.name, watch::DEFAULT_WATCH_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(forward(
            self.name.clone(),
            Box::pin(updates),
            sender,
            cancel.clone(),
            stored > 0,
        ));
        Ok(Box::new(watcher.on_unwatch(move || cancel.cancel())))
    }
}

/// Pumps broker updates into the watcher queue until unwatched or the broker stream ends.
///
/// Sends are awaited here: a slow consumer backs up the broker subscription, not a writer.
async fn forward<S, E>(
    bucket: String,
    mut updates: Pin<Box<S>>,
    sender: WatchSender,
    cancel: CancellationToken,
    mut replay_pending: bool,
) where
    S: Stream<Item = Result<kv::Entry, E>> + Send,
    E: StdError + Send + Sync + 'static,
{
    if !replay_pending && !sender.send(WatchEvent::Replayed).await {
        return;
    }

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(bucket = %bucket, "broker watch stopped");
                return;
            }
            next = updates.next() => next,
        };

        match next {
            Some(Ok(entry)) => {
                let caught_up = entry.delta == 0;
                if let Some(change) = translate(entry.key, entry.value, entry.operation) {
                    debug!(bucket = %bucket, key = %change.key, op = %change.operation, "forwarding change");
                    if !sender.send(WatchEvent::Change(change)).await {
                        return;
                    }
                }
                if replay_pending && caught_up {
                    replay_pending = false;
                    if !sender.send(WatchEvent::Replayed).await {
                        return;
                    }
                }
            }
            Some(Err(err)) => {
                warn!(bucket = %bucket, %err, "broker watch failed");
                sender
                    .fail(broker_error(format!("watch on bucket {bucket} failed"), err))
                    .await;
                return;
            }
            None => {
                sender
                    .fail(
                        Error::new(ErrorKind::Closed)
                            .with_message(format!("broker watch on bucket {bucket} ended")),
                    )
                    .await;
                return;
            }
        }
    }
}

fn translate(key: String, value: Bytes, operation: kv::Operation) -> Option<Change> {
    match operation {
        kv::Operation::Put => Some(Change::put(key, value)),
        kv::Operation::Delete => Some(Change::delete(key)),
        kv::Operation::Purge => None,
    }
}
