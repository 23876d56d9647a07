//! Purpose: Topic publish/subscribe transport with reply-to and ack/nak controls.
//! Exports: `Messenger`, `Message`, `MessageHandler`, `Subscription`, `handler_fn`,
//! `MemoryMessenger`, `NatsMessenger`, `LoggedMessenger`.
//! Role: Carries rpc envelopes between instances; backends are swappable behind `Messenger`.
//! Invariants: One subscription delivers to its handler sequentially, in arrival order.
//! Invariants: `ack`/`nak` are no-ops on transports without redelivery, never errors.
//! Invariants: Dropping a `Subscription` stops delivery.
#![allow(clippy::result_large_err)]

mod logged;
mod memory;
mod nats;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::core::error::Error;

pub use logged::LoggedMessenger;
pub use memory::MemoryMessenger;
pub use nats::NatsMessenger;

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, Error>;

    async fn publish(&self, topic: &str, data: Bytes) -> Result<(), Error>;

    async fn publish_with_reply(&self, topic: &str, reply_to: &str, data: Bytes)
    -> Result<(), Error>;

    /// Plain pub/sub has no redelivery, so acknowledging is a no-op unless a backend says otherwise.
    async fn ack(&self, _message: &Message) -> Result<(), Error> {
        Ok(())
    }

    async fn nak(&self, _message: &Message) -> Result<(), Error> {
        Ok(())
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message);
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: Message) {
        (self.0)(message).await
    }
}

/// Adapts an async closure into a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Clone)]
pub struct Message {
    pub topic: String,
    pub data: Bytes,
    pub reply_to: Option<String>,
    transport: Arc<dyn Messenger>,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        data: impl Into<Bytes>,
        reply_to: Option<String>,
        transport: Arc<dyn Messenger>,
    ) -> Self {
        Self {
            topic: topic.into(),
            data: data.into(),
            reply_to,
            transport,
        }
    }

    /// Routes `respond`/`ack`/`nak` through another transport (used by decorators).
    pub fn with_transport(mut self, transport: Arc<dyn Messenger>) -> Self {
        self.transport = transport;
        self
    }

    /// Publishes to the reply topic; a no-op when the sender expects no reply.
    pub async fn respond(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        match &self.reply_to {
            Some(reply_to) => self.transport.publish(reply_to, data.into()).await,
            None => Ok(()),
        }
    }

    pub async fn ack(&self) -> Result<(), Error> {
        self.transport.ack(self).await
    }

    pub async fn nak(&self) -> Result<(), Error> {
        self.transport.nak(self).await
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.topic)?;
        if let Some(reply_to) = &self.reply_to {
            write!(f, "(<- {reply_to}) ")?;
        }
        write!(f, "-> {}", String::from_utf8_lossy(&self.data))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("data", &self.data)
            .field("reply_to", &self.reply_to)
            .finish_non_exhaustive()
    }
}

/// Owns the delivery task of one subscription.
pub struct Subscription {
    topic: String,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(topic: impl Into<String>, task: JoinHandle<()>) -> Self {
        Self {
            topic: topic.into(),
            task: Some(task),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryMessenger, Message, Messenger, handler_fn};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn display_shows_reply_topic() {
        let transport: Arc<dyn Messenger> = Arc::new(MemoryMessenger::new());
        let plain = Message::new("gatehost.default.default", "hi", None, transport.clone());
        assert_eq!(plain.to_string(), "gatehost.default.default -> hi");

        let with_reply = Message::new("t", "hi", Some("_INBOX.1".to_string()), transport);
        assert_eq!(with_reply.to_string(), "t (<- _INBOX.1) -> hi");
    }

    #[tokio::test]
    async fn respond_without_reply_topic_is_noop() {
        let transport: Arc<dyn Messenger> = Arc::new(MemoryMessenger::new());
        let message = Message::new("t", "ping", None, transport);
        message.respond("pong").await.expect("noop");
        message.ack().await.expect("ack");
        message.nak().await.expect("nak");
    }

    #[tokio::test]
    async fn respond_publishes_to_reply_topic() {
        let messenger = MemoryMessenger::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _replies = messenger
            .subscribe(
                "reply",
                handler_fn(move |message: Message| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message.data);
                    }
                }),
            )
            .await
            .expect("subscribe");
        let _requests = messenger
            .subscribe(
                "ping",
                handler_fn(|message: Message| async move {
                    message.respond("pong").await.expect("respond");
                }),
            )
            .await
            .expect("subscribe");

        messenger
            .publish_with_reply("ping", "reply", Bytes::from_static(b"ping"))
            .await
            .expect("publish");
        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timely")
            .expect("reply");
        assert_eq!(reply.as_ref(), b"pong");
    }
}
