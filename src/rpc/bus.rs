// Event bus: one messaging subscription per subject, demultiplexed by rpc type.
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};
use uuid::Uuid;

use super::{Request, Response, RpcType};
use crate::core::error::{Error, ErrorKind};
use crate::messaging::{Message, MessageHandler, Messenger, Subscription, handler_fn};

/// Handles one rpc type. On success the handler owns `ack`/`respond`; the bus never acks for it.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, message: Message, request: Request) -> Result<(), Error>;
}

struct FnRpcHandler<F>(F);

#[async_trait]
impl<F, Fut> RpcHandler for FnRpcHandler<F>
where
    F: Fn(Message, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    async fn handle(&self, message: Message, request: Request) -> Result<(), Error> {
        (self.0)(message, request).await
    }
}

pub fn rpc_handler_fn<F, Fut>(f: F) -> Arc<dyn RpcHandler>
where
    F: Fn(Message, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(FnRpcHandler(f))
}

#[derive(Default)]
struct Handlers {
    entries: RwLock<HashMap<RpcType, (u64, Arc<dyn RpcHandler>)>>,
    next_id: AtomicU64,
}

impl Handlers {
    fn get(&self, rpc_type: &RpcType) -> Option<Arc<dyn RpcHandler>> {
        self.entries
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(rpc_type)
            .map(|(_, handler)| handler.clone())
    }
}

pub struct EventBus {
    subject: String,
    messenger: Arc<dyn Messenger>,
    handlers: Arc<Handlers>,
    _subscription: Subscription,
}

impl EventBus {
    /// Subscribes to `subject`; the subscription lives as long as the bus.
    pub async fn new(messenger: Arc<dyn Messenger>, subject: impl Into<String>) -> Result<Self, Error> {
        let subject = subject.into();
        let handlers = Arc::new(Handlers::default());
        let dispatcher = Arc::new(Dispatcher {
            subject: subject.clone(),
            handlers: handlers.clone(),
        });
        let subscription = messenger.subscribe(&subject, dispatcher).await?;
        debug!(subject = %subject, "event bus subscribed");
        Ok(Self {
            subject,
            messenger,
            handlers,
            _subscription: subscription,
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Installs `handler` for `rpc_type`, replacing any previous one.
    ///
    /// Dropping the returned `Registration` leaves the handler installed.
    pub fn register(&self, rpc_type: RpcType, handler: Arc<dyn RpcHandler>) -> Registration {
        let id = self.handlers.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .entries
            .write()
            .unwrap_or_else(|poison| poison.into_inner())
            .insert(rpc_type.clone(), (id, handler));
        debug!(subject = %self.subject, rpc_type = %rpc_type, "registered rpc handler");
        Registration {
            rpc_type,
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Fire-and-forget send on this bus's subject.
    pub async fn publish(&self, request: &Request) -> Result<(), Error> {
        self.messenger
            .publish(&self.subject, request.to_bytes()?)
            .await
    }

    /// Sends `request` with a private reply topic and waits for the first response.
    pub async fn request(&self, request: &Request, timeout: Duration) -> Result<Response, Error> {
        let inbox = format!("_INBOX.{}", Uuid::new_v4().simple());
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let _replies = self
            .messenger
            .subscribe(
                &inbox,
                handler_fn(move |message: Message| {
                    let slot = slot.clone();
                    async move {
                        let tx = slot
                            .lock()
                            .unwrap_or_else(|poison| poison.into_inner())
                            .take();
                        if let Some(tx) = tx {
                            let _ = tx.send(message.data);
                        }
                    }
                }),
            )
            .await?;

        self.messenger
            .publish_with_reply(&self.subject, &inbox, request.to_bytes()?)
            .await?;

        let data = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(data)) => data,
            Ok(Err(_)) => {
                return Err(Error::new(ErrorKind::Closed)
                    .with_message(format!("reply subscription on {inbox} ended")));
            }
            Err(_) => {
                return Err(Error::new(ErrorKind::Timeout)
                    .with_message(format!(
                        "no {} response on {} within {}ms",
                        request.rpc_type,
                        self.subject,
                        timeout.as_millis()
                    ))
                    .with_hint("Check that a peer with a handler for this type is subscribed."));
            }
        };
        Response::from_bytes(&data)
    }
}

/// Handle returned by `EventBus::register`.
pub struct Registration {
    rpc_type: RpcType,
    id: u64,
    handlers: Weak<Handlers>,
}

impl Registration {
    pub fn rpc_type(&self) -> &RpcType {
        &self.rpc_type
    }

    /// Removes the handler this registration installed; a later replacement is left alone.
    pub fn unregister(self) {
        let Some(handlers) = self.handlers.upgrade() else {
            return;
        };
        let mut entries = handlers
            .entries
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        if entries.get(&self.rpc_type).is_some_and(|(id, _)| *id == self.id) {
            entries.remove(&self.rpc_type);
        }
    }
}

struct Dispatcher {
    subject: String,
    handlers: Arc<Handlers>,
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, message: Message) {
        trace!(subject = %self.subject, %message, "received rpc");
        let request = match Request::from_bytes(&message.data) {
            Ok(request) => request,
            Err(err) => {
                // Neither ack nor nak: redelivery, if any, is left to the transport.
                error!(subject = %self.subject, %err, "dropping malformed rpc envelope");
                return;
            }
        };

        let Some(handler) = self.handlers.get(&request.rpc_type) else {
            trace!(subject = %self.subject, rpc_type = %request.rpc_type, "no handler; nak");
            if let Err(err) = message.nak().await {
                error!(subject = %self.subject, %err, "failed to nak rpc");
            }
            return;
        };

        let rpc_type = request.rpc_type.clone();
        if let Err(err) = handler.handle(message.clone(), request).await {
            error!(subject = %self.subject, rpc_type = %rpc_type, %err, "rpc handler failed");
            if let Err(err) = message.nak().await {
                error!(subject = %self.subject, %err, "failed to nak rpc");
            }
        }
    }
}
