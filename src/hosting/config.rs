// Backend selection: identifiers plus JSON options, validated up front, built on demand.
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::info;

use super::pod::PodInfo;
use crate::core::error::{Error, ErrorKind};
use crate::kv::{JsonClient, JsonOptions, KvClient, LoggedClient, NatsClient, NatsOptions};
use crate::messaging::{LoggedMessenger, MemoryMessenger, Messenger, NatsMessenger};
use crate::storage::{BlobStore, FsOptions, FsStore, LoggedStore, MemoryStore};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum StorageBackend {
    #[default]
    Memory,
    Fs(FsOptions),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KvBackend {
    Json(JsonOptions),
    Nats(NatsOptions),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MessagingBackend {
    Memory,
    Nats(NatsOptions),
}

impl Default for KvBackend {
    fn default() -> Self {
        Self::Json(JsonOptions::default())
    }
}

impl Default for MessagingBackend {
    fn default() -> Self {
        Self::Nats(NatsOptions::default())
    }
}

impl StorageBackend {
    pub fn parse(name: &str, options: Option<&str>) -> Result<Self, Error> {
        match name {
            "memory" => Ok(Self::Memory),
            "fs" => {
                let raw = options.ok_or_else(|| {
                    Error::new(ErrorKind::Usage)
                        .with_message("fs storage requires options")
                        .with_hint(r#"Pass options like {"folder":"./data"}."#)
                })?;
                Ok(Self::Fs(decode_options("fs", raw)?))
            }
            other => Err(unknown_backend("storage", other, "memory, fs")),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fs(_) => "fs",
        }
    }
}

impl KvBackend {
    pub fn parse(name: &str, options: Option<&str>) -> Result<Self, Error> {
        match name {
            "json" => {
                let options: JsonOptions = decode_or_default("json", options)?;
                options.validate()?;
                Ok(Self::Json(options))
            }
            "nats" => {
                let options: NatsOptions = decode_or_default("nats", options)?;
                options.validate()?;
                Ok(Self::Nats(options))
            }
            other => Err(unknown_backend("kv", other, "json, nats")),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::Nats(_) => "nats",
        }
    }
}

impl MessagingBackend {
    pub fn parse(name: &str, options: Option<&str>) -> Result<Self, Error> {
        match name {
            "memory" => Ok(Self::Memory),
            "nats" => {
                let options: NatsOptions = decode_or_default("nats", options)?;
                options.validate()?;
                Ok(Self::Nats(options))
            }
            other => Err(unknown_backend("messaging", other, "memory, nats")),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Nats(_) => "nats",
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HostingConfig {
    pub storage: StorageBackend,
    pub log_storage: bool,
    pub kv: KvBackend,
    pub log_kv: bool,
    pub messaging: MessagingBackend,
    pub log_messaging: bool,
    pub pod: PodInfo,
}

impl HostingConfig {
    pub fn build_storage(&self) -> Result<Arc<dyn BlobStore>, Error> {
        info!(backend = self.storage.name(), "using storage backend");
        let store: Arc<dyn BlobStore> = match &self.storage {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::Fs(options) => Arc::new(FsStore::open(options.clone())?),
        };
        if self.log_storage {
            return Ok(Arc::new(LoggedStore::new(store)));
        }
        Ok(store)
    }

    pub async fn build_kv(&self, storage: Arc<dyn BlobStore>) -> Result<Arc<dyn KvClient>, Error> {
        info!(backend = self.kv.name(), "using kv backend");
        let client: Arc<dyn KvClient> = match &self.kv {
            KvBackend::Json(options) => Arc::new(JsonClient::open(storage, options.clone())?),
            KvBackend::Nats(options) => Arc::new(NatsClient::connect(options).await?),
        };
        if self.log_kv {
            return Ok(Arc::new(LoggedClient::new(client)));
        }
        Ok(client)
    }

    pub async fn build_messaging(&self) -> Result<Arc<dyn Messenger>, Error> {
        info!(backend = self.messaging.name(), "using messaging backend");
        let messenger: Arc<dyn Messenger> = match &self.messaging {
            MessagingBackend::Memory => Arc::new(MemoryMessenger::new()),
            MessagingBackend::Nats(options) => Arc::new(NatsMessenger::connect(options).await?),
        };
        if self.log_messaging {
            return Ok(Arc::new(LoggedMessenger::new(messenger)));
        }
        Ok(messenger)
    }
}

fn decode_options<T: DeserializeOwned>(backend: &str, raw: &str) -> Result<T, Error> {
    serde_json::from_str(raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("malformed {backend} backend options"))
            .with_hint("Options must be a JSON object.")
            .with_source(err)
    })
}

fn decode_or_default<T: DeserializeOwned + Default>(
    backend: &str,
    raw: Option<&str>,
) -> Result<T, Error> {
    match raw.map(str::trim) {
        None | Some("") => Ok(T::default()),
        Some(raw) => decode_options(backend, raw),
    }
}

fn unknown_backend(layer: &str, name: &str, known: &str) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(format!("unknown {layer} backend: {name}"))
        .with_hint(format!("Use one of: {known}."))
}
