// Logging decorator for any messenger. Delivered messages are rewrapped so that
// respond/ack/nak issued by handlers are logged too.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{Message, MessageHandler, Messenger, Subscription};
use crate::core::error::Error;

#[derive(Clone)]
pub struct LoggedMessenger {
    inner: Arc<dyn Messenger>,
}

impl LoggedMessenger {
    pub fn new(inner: Arc<dyn Messenger>) -> Self {
        Self { inner }
    }
}

struct LoggedHandler {
    inner: Arc<dyn MessageHandler>,
    transport: Arc<dyn Messenger>,
}

#[async_trait]
impl MessageHandler for LoggedHandler {
    async fn handle(&self, message: Message) {
        debug!(%message, "messaging received");
        self.inner
            .handle(message.with_transport(self.transport.clone()))
            .await
    }
}

#[async_trait]
impl Messenger for LoggedMessenger {
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, Error> {
        let handler = Arc::new(LoggedHandler {
            inner: handler,
            transport: Arc::new(self.clone()),
        });
        match self.inner.subscribe(topic, handler).await {
            Ok(subscription) => {
                debug!(topic, "messaging subscribe");
                Ok(subscription)
            }
            Err(err) => {
                debug!(topic, %err, "messaging subscribe failed");
                Err(err)
            }
        }
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<(), Error> {
        let len = data.len();
        let result = self.inner.publish(topic, data).await;
        match &result {
            Ok(()) => debug!(topic, len, "messaging publish"),
            Err(err) => debug!(topic, len, %err, "messaging publish failed"),
        }
        result
    }

    async fn publish_with_reply(
        &self,
        topic: &str,
        reply_to: &str,
        data: Bytes,
    ) -> Result<(), Error> {
        let len = data.len();
        let result = self.inner.publish_with_reply(topic, reply_to, data).await;
        match &result {
            Ok(()) => debug!(topic, reply_to, len, "messaging publish"),
            Err(err) => debug!(topic, reply_to, len, %err, "messaging publish failed"),
        }
        result
    }

    async fn ack(&self, message: &Message) -> Result<(), Error> {
        let result = self.inner.ack(message).await;
        match &result {
            Ok(()) => debug!(topic = %message.topic, "messaging ack"),
            Err(err) => debug!(topic = %message.topic, %err, "messaging ack failed"),
        }
        result
    }

    async fn nak(&self, message: &Message) -> Result<(), Error> {
        let result = self.inner.nak(message).await;
        match &result {
            Ok(()) => debug!(topic = %message.topic, "messaging nak"),
            Err(err) => debug!(topic = %message.topic, %err, "messaging nak failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::LoggedMessenger;
    use crate::messaging::{MemoryMessenger, Message, Messenger, handler_fn};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn responses_flow_through_decorator() {
        let messenger = LoggedMessenger::new(Arc::new(MemoryMessenger::new()));
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
        let _echo = messenger
            .subscribe(
                "echo",
                handler_fn(|message: Message| async move {
                    message.ack().await.expect("ack");
                    let data = message.data.clone();
                    message.respond(data).await.expect("respond");
                }),
            )
            .await
            .expect("subscribe");

        messenger
            .publish_with_reply("echo", "reply", Bytes::from_static(b"hello"))
            .await
            .expect("publish");
        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timely")
            .expect("reply");
        assert_eq!(reply.as_ref(), b"hello");
    }
}
