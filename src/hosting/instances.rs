//! Purpose: Keep the host's server registry in sync with the instances bucket and serve discovery.
//! Exports: `InstanceManager`, `InstanceInfo`, `RetryPolicy`, `WatchOptions`.
//! Role: Consumer of kv watch streams; selects backend servers by gamemode.
//! Invariants: Register is an upsert: an existing server of the same name is replaced.
//! Invariants: One malformed or unresolvable record never stops the watch loop.
//! Invariants: The watch loop stops on cancellation or after `RetryPolicy::max_retries`
//! consecutive failures, returning the last error with its kind preserved.
//!
//! Notes:
//! - After every (re)subscription replay, servers this loop registered that the replay did not
//!   mention are unregistered, so deletes missed while disconnected are reconciled.
//! - `ErrorKind::Lagged` resubscribes at once and does not count as a failure.
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::{ServerInfo, ServerRegistry};
use crate::core::error::{Error, ErrorKind};
use crate::kv::{Bucket, Change, Operation, WatchEvent, set_json};

/// Descriptor stored under the instance name in the instances bucket.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub gamemode: String,
    pub address: String,
    pub port: u16,
}

impl InstanceInfo {
    pub fn new(gamemode: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            gamemode: gamemode.into(),
            address: address.into(),
            port,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): doubling from `initial_backoff`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WatchOptions {
    pub retry: RetryPolicy,
}

struct WatchTask {
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), Error>>,
}

pub struct InstanceManager {
    bucket: Arc<dyn Bucket>,
    registry: Arc<dyn ServerRegistry>,
    rng: Mutex<fastrand::Rng>,
    watch: Option<WatchTask>,
}

impl InstanceManager {
    /// Manager without a background watch loop; the registry is only changed by explicit calls.
    pub fn new(bucket: Arc<dyn Bucket>, registry: Arc<dyn ServerRegistry>) -> Self {
        Self {
            bucket,
            registry,
            rng: Mutex::new(seeded_rng()),
            watch: None,
        }
    }

    /// Manager with the supervised watch loop running on the current tokio runtime.
    pub fn start(
        bucket: Arc<dyn Bucket>,
        registry: Arc<dyn ServerRegistry>,
        options: WatchOptions,
    ) -> Self {
        let mut manager = Self::new(bucket, registry);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watch(
            manager.bucket.clone(),
            manager.registry.clone(),
            options.retry,
            cancel.clone(),
        ));
        manager.watch = Some(WatchTask { cancel, handle });
        manager
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(fastrand::Rng::with_seed(seed));
        self
    }

    pub fn bucket(&self) -> &Arc<dyn Bucket> {
        &self.bucket
    }

    pub fn registry(&self) -> &Arc<dyn ServerRegistry> {
        &self.registry
    }

    /// True once the watch loop has stopped on its own (or was never started).
    pub fn watch_finished(&self) -> bool {
        self.watch
            .as_ref()
            .is_none_or(|task| task.handle.is_finished())
    }

    pub async fn register(&self, name: &str, info: &InstanceInfo) -> Result<ServerInfo, Error> {
        register_instance(self.registry.as_ref(), name, info).await
    }

    pub fn unregister(&self, name: &str) -> bool {
        unregister_instance(self.registry.as_ref(), name)
    }

    /// Writes the descriptor; watch loops (including this one) pick it up.
    pub async fn announce(&self, name: &str, info: &InstanceInfo) -> Result<(), Error> {
        set_json(self.bucket.as_ref(), name, info).await
    }

    pub async fn retire(&self, name: &str) -> Result<(), Error> {
        self.bucket.delete(name).await
    }

    pub async fn servers_of_gamemode(&self, gamemode: &str) -> Result<Vec<ServerInfo>, Error> {
        let bucket = self.bucket.name();
        let mut servers = Vec::new();
        for key in self.bucket.list_keys().await? {
            let raw = match self.bucket.get(&key).await {
                Ok(raw) => raw,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            };
            let info: InstanceInfo = match serde_json::from_slice(&raw) {
                Ok(info) => info,
                Err(err) => {
                    warn!(bucket, instance = %key, %err, "skipping malformed instance descriptor");
                    continue;
                }
            };
            if info.gamemode != gamemode {
                continue;
            }
            match self.registry.server(&key) {
                Some(server) => servers.push(server),
                None => debug!(bucket, instance = %key, "instance not registered yet; skipping"),
            }
        }
        Ok(servers)
    }

    pub async fn random_server_of_gamemode(&self, gamemode: &str) -> Result<ServerInfo, Error> {
        let mut servers = self.servers_of_gamemode(gamemode).await?;
        if servers.is_empty() {
            return Err(Error::new(ErrorKind::NoServersAvailable)
                .with_message(format!("no servers available for gamemode {gamemode}")));
        }
        let index = self
            .rng
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .usize(..servers.len());
        Ok(servers.swap_remove(index))
    }

    /// Stops the watch loop and returns how it ended.
    pub async fn shutdown(mut self) -> Result<(), Error> {
        let Some(task) = self.watch.take() else {
            return Ok(());
        };
        task.cancel.cancel();
        task.handle.await.map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("instance watch task panicked")
                .with_source(err)
        })?
    }
}

impl Drop for InstanceManager {
    fn drop(&mut self) {
        if let Some(task) = self.watch.take() {
            task.cancel.cancel();
        }
    }
}

fn seeded_rng() -> fastrand::Rng {
    let mut seed = [0u8; 8];
    match getrandom::fill(&mut seed) {
        Ok(()) => fastrand::Rng::with_seed(u64::from_le_bytes(seed)),
        Err(_) => fastrand::Rng::new(),
    }
}

async fn resolve(info: &InstanceInfo) -> Result<SocketAddr, Error> {
    let target = format!("{}:{}", info.address, info.port);
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(target.as_str())
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to resolve {target}"))
                .with_source(err)
        })?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!("{target} resolved to no address"))
        })
}

async fn register_instance(
    registry: &dyn ServerRegistry,
    name: &str,
    info: &InstanceInfo,
) -> Result<ServerInfo, Error> {
    let address = resolve(info).await.map_err(|err| err.with_key(name))?;
    if registry.server(name).is_some() && registry.unregister(name) {
        info!(instance = name, "unregistered server");
    }
    let server = ServerInfo::new(name, address);
    registry.register(server.clone())?;
    info!(instance = name, %address, gamemode = %info.gamemode, "registered server");
    Ok(server)
}

fn unregister_instance(registry: &dyn ServerRegistry, name: &str) -> bool {
    let removed = registry.unregister(name);
    if removed {
        info!(instance = name, "unregistered server");
    }
    removed
}

struct WatchEnd {
    replayed: bool,
    error: Error,
}

async fn run_watch(
    bucket: Arc<dyn Bucket>,
    registry: Arc<dyn ServerRegistry>,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let mut owned = HashSet::new();
    let mut failures = 0u32;
    let mut waited = Duration::ZERO;
    loop {
        let end = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(bucket = bucket.name(), "instance watch cancelled");
                return Ok(());
            }
            end = watch_once(bucket.as_ref(), registry.as_ref(), &mut owned) => end,
        };

        if end.replayed {
            failures = 0;
            waited = Duration::ZERO;
        }
        if end.error.kind() == ErrorKind::Lagged {
            warn!(bucket = bucket.name(), "instance watch lagged; resubscribing");
            continue;
        }

        failures += 1;
        if failures > retry.max_retries {
            error!(bucket = bucket.name(), err = %end.error, failures, "instance watch giving up");
            return Err(add_retry_hint(end.error, failures, waited));
        }
        let delay = retry.backoff(failures);
        warn!(
            bucket = bucket.name(),
            err = %end.error,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "instance watch failed; retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
        waited += delay;
    }
}

async fn watch_once(
    bucket: &dyn Bucket,
    registry: &dyn ServerRegistry,
    owned: &mut HashSet<String>,
) -> WatchEnd {
    let mut watcher = match bucket.watch_all().await {
        Ok(watcher) => watcher,
        Err(error) => {
            return WatchEnd {
                replayed: false,
                error,
            };
        }
    };

    let mut replayed = false;
    let mut seen = HashSet::new();
    loop {
        match watcher.next().await {
            Ok(Some(WatchEvent::Change(change))) => {
                if !replayed {
                    seen.insert(change.key.clone());
                }
                apply(registry, owned, change).await;
            }
            Ok(Some(WatchEvent::Replayed)) => {
                replayed = true;
                let stale: Vec<String> = owned
                    .iter()
                    .filter(|name| !seen.contains(*name))
                    .cloned()
                    .collect();
                for name in stale {
                    unregister_instance(registry, &name);
                    owned.remove(&name);
                }
                info!(bucket = bucket.name(), instances = seen.len(), "instance watch caught up");
            }
            Ok(None) => {
                return WatchEnd {
                    replayed,
                    error: Error::new(ErrorKind::Closed).with_message("instance watch ended"),
                };
            }
            Err(error) => return WatchEnd { replayed, error },
        }
    }
}

async fn apply(registry: &dyn ServerRegistry, owned: &mut HashSet<String>, change: Change) {
    match change.operation {
        Operation::Put => {
            let Some(value) = change.value else {
                warn!(instance = %change.key, "put without value; skipping");
                return;
            };
            let info: InstanceInfo = match serde_json::from_slice(&value) {
                Ok(info) => info,
                Err(err) => {
                    warn!(instance = %change.key, %err, "skipping malformed instance descriptor");
                    return;
                }
            };
            match register_instance(registry, &change.key, &info).await {
                Ok(_) => {
                    owned.insert(change.key);
                }
                Err(err) => warn!(instance = %change.key, %err, "failed to register instance"),
            }
        }
        Operation::Delete => {
            unregister_instance(registry, &change.key);
            owned.remove(&change.key);
        }
    }
}

fn add_retry_hint(err: Error, attempts: u32, waited: Duration) -> Error {
    let info = format!(
        "Watch attempts: {attempts} (waited {}ms).",
        waited.as_millis()
    );
    if let Some(hint) = err.hint().map(|hint| hint.to_string()) {
        err.with_hint(format!("{hint} {info}"))
    } else {
        err.with_hint(info)
    }
}
