// In-process broker: exact topic match, no persistence, no redelivery.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Message, MessageHandler, Messenger, Subscription};
use crate::core::error::Error;

#[derive(Clone)]
struct Delivery {
    topic: String,
    data: Bytes,
    reply_to: Option<String>,
}

type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>;

#[derive(Clone, Default)]
pub struct MemoryMessenger {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl MemoryMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver(&self, delivery: Delivery) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let Some(queues) = subscribers.get_mut(&delivery.topic) else {
            debug!(topic = %delivery.topic, "no subscribers");
            return;
        };
        queues.retain(|queue| queue.send(delivery.clone()).is_ok());
        if queues.is_empty() {
            subscribers.remove(&delivery.topic);
        }
    }
}

#[async_trait]
impl Messenger for MemoryMessenger {
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, Error> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        self.subscribers
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .entry(topic.to_string())
            .or_default()
            .push(tx);

        let transport: Arc<dyn Messenger> = Arc::new(self.clone());
        let task = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let message = Message::new(
                    delivery.topic,
                    delivery.data,
                    delivery.reply_to,
                    transport.clone(),
                );
                handler.handle(message).await;
            }
        });
        Ok(Subscription::new(topic, task))
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<(), Error> {
        self.deliver(Delivery {
            topic: topic.to_string(),
            data,
            reply_to: None,
        });
        Ok(())
    }

    async fn publish_with_reply(
        &self,
        topic: &str,
        reply_to: &str,
        data: Bytes,
    ) -> Result<(), Error> {
        self.deliver(Delivery {
            topic: topic.to_string(),
            data,
            reply_to: Some(reply_to.to_string()),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryMessenger;
    use crate::messaging::{Message, Messenger, handler_fn};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn delivers_in_publish_order_to_every_subscriber() {
        let messenger = MemoryMessenger::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subscriptions = Vec::new();
        for name in ["first", "second"] {
            let tx = tx.clone();
            subscriptions.push(
                messenger
                    .subscribe(
                        "events",
                        handler_fn(move |message: Message| {
                            let tx = tx.clone();
                            async move {
                                let _ = tx.send((name, message.data));
                            }
                        }),
                    )
                    .await
                    .expect("subscribe"),
            );
        }

        for n in 0..3u8 {
            messenger
                .publish("events", Bytes::from(vec![n]))
                .await
                .expect("publish");
        }

        let mut first = Vec::new();
        let mut second = Vec::new();
        for _ in 0..6 {
            let (name, data) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timely")
                .expect("delivery");
            match name {
                "first" => first.push(data[0]),
                _ => second.push(data[0]),
            }
        }
        assert_eq!(first, vec![0, 1, 2]);
        assert_eq!(second, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn unsubscribed_handler_stops_receiving() {
        let messenger = MemoryMessenger::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = messenger
            .subscribe(
                "events",
                handler_fn(move |message: Message| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message.data);
                    }
                }),
            )
            .await
            .expect("subscribe");
        assert_eq!(subscription.topic(), "events");
        subscription.unsubscribe();

        messenger
            .publish("events", Bytes::from_static(b"late"))
            .await
            .expect("publish");
        let received = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(matches!(received, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let messenger = MemoryMessenger::new();
        messenger
            .publish("nobody", Bytes::from_static(b"x"))
            .await
            .expect("publish");
    }
}
