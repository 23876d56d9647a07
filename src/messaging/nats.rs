// Broker-backed messenger over plain (core) pub/sub subjects.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_stream::StreamExt;
use tracing::debug;

use super::{Message, MessageHandler, Messenger, Subscription};
use crate::core::error::Error;
use crate::kv::NatsOptions;
use crate::kv::nats::{broker_error, connect};

/// Core pub/sub has no consumer groups, so ack/nak keep the trait's no-op defaults.
#[derive(Clone)]
pub struct NatsMessenger {
    client: async_nats::Client,
}

impl NatsMessenger {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    pub async fn connect(options: &NatsOptions) -> Result<Self, Error> {
        Ok(Self::new(connect(options).await?))
    }
}

#[async_trait]
impl Messenger for NatsMessenger {
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, Error> {
        let mut subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|err| broker_error(format!("failed to subscribe to {topic}"), err))?;

        let transport: Arc<dyn Messenger> = Arc::new(self.clone());
        let subject = topic.to_string();
        let task = tokio::spawn(async move {
            while let Some(delivered) = subscriber.next().await {
                let message = Message::new(
                    delivered.subject.to_string(),
                    delivered.payload,
                    delivered.reply.map(|reply| reply.to_string()),
                    transport.clone(),
                );
                handler.handle(message).await;
            }
            debug!(topic = %subject, "broker subscription ended");
        });
        Ok(Subscription::new(topic, task))
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<(), Error> {
        self.client
            .publish(topic.to_string(), data)
            .await
            .map_err(|err| broker_error(format!("failed to publish to {topic}"), err))
    }

    async fn publish_with_reply(
        &self,
        topic: &str,
        reply_to: &str,
        data: Bytes,
    ) -> Result<(), Error> {
        self.client
            .publish_with_reply(topic.to_string(), reply_to.to_string(), data)
            .await
            .map_err(|err| broker_error(format!("failed to publish to {topic}"), err))
    }
}
