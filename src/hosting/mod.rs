//! Purpose: Assemble storage, kv and messaging once per process and hand them to consumers.
//! Exports: `Hosting`, `HostingConfig`, backend selections, `PodInfo`, the server registry seam,
//! and the instance manager.
//! Role: The single coordination object; consumers receive it (or its parts) explicitly.
//! Invariants: Construction either yields every backend and both event buses, or an error.
//! Invariants: No process exit happens inside the library; startup errors are returned.
#![allow(clippy::result_large_err)]

mod config;
mod instances;
mod pod;
mod registry;

use std::sync::Arc;

use tracing::info;

use crate::core::error::Error;
use crate::kv::KvClient;
use crate::messaging::Messenger;
use crate::rpc::EventBus;
use crate::storage::BlobStore;

pub use config::{HostingConfig, KvBackend, MessagingBackend, StorageBackend};
pub use instances::{InstanceInfo, InstanceManager, RetryPolicy, WatchOptions};
pub use pod::PodInfo;
pub use registry::{MemoryServerRegistry, ServerInfo, ServerRegistry, find_server};

pub struct Hosting {
    storage: Arc<dyn BlobStore>,
    kv: Arc<dyn KvClient>,
    messenger: Arc<dyn Messenger>,
    pod: PodInfo,
    network_bus: EventBus,
    pod_bus: EventBus,
}

impl Hosting {
    /// Builds every backend named by `config`; any failure is a startup error.
    pub async fn connect(config: HostingConfig) -> Result<Self, Error> {
        info!(pod = %config.pod, "starting hosting");
        let storage = config.build_storage()?;
        let kv = config.build_kv(storage.clone()).await?;
        let messenger = config.build_messaging().await?;
        Self::assemble(storage, kv, messenger, config.pod).await
    }

    /// Wires already-built backends together and subscribes the network and pod buses.
    pub async fn assemble(
        storage: Arc<dyn BlobStore>,
        kv: Arc<dyn KvClient>,
        messenger: Arc<dyn Messenger>,
        pod: PodInfo,
    ) -> Result<Self, Error> {
        let network_bus = EventBus::new(messenger.clone(), pod.network_subject()).await?;
        let pod_bus = EventBus::new(messenger.clone(), pod.pod_subject()).await?;
        Ok(Self {
            storage,
            kv,
            messenger,
            pod,
            network_bus,
            pod_bus,
        })
    }

    pub fn storage(&self) -> &Arc<dyn BlobStore> {
        &self.storage
    }

    pub fn kv(&self) -> &Arc<dyn KvClient> {
        &self.kv
    }

    pub fn messenger(&self) -> &Arc<dyn Messenger> {
        &self.messenger
    }

    pub fn pod(&self) -> &PodInfo {
        &self.pod
    }

    /// Bus on the subject shared by the whole network.
    pub fn network_bus(&self) -> &EventBus {
        &self.network_bus
    }

    /// Bus on the subject addressed to this proxy only.
    pub fn pod_bus(&self) -> &EventBus {
        &self.pod_bus
    }

    /// Opens the instances bucket and starts a supervised watch loop feeding `registry`.
    pub async fn instance_manager(
        &self,
        registry: Arc<dyn ServerRegistry>,
        options: WatchOptions,
    ) -> Result<InstanceManager, Error> {
        let bucket = self.kv.bucket(&self.pod.instances_bucket()).await?;
        Ok(InstanceManager::start(bucket, registry, options))
    }
}
