//! Purpose: Event bus behavior over the in-process messenger.
//! Role: Covers dispatch by type, nak paths, registration ownership, and request/response.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use gatehost::core::error::{Error, ErrorKind};
use gatehost::messaging::{MemoryMessenger, Message, MessageHandler, Messenger, Subscription};
use gatehost::rpc::{
    EventBus, Request, RpcType, Status, TransferPlayerRequest, TransferPlayerResponse,
    Response, rpc_handler_fn,
};

const SUBJECT: &str = "gatehost.test.net";

/// Messenger that records ack/nak calls issued through delivered messages.
#[derive(Clone, Default)]
struct RecordingMessenger {
    inner: MemoryMessenger,
    controls: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingMessenger {
    fn controls(&self) -> Vec<(String, String)> {
        self.controls.lock().expect("lock").clone()
    }

    fn record(&self, control: &str, message: &Message) {
        self.controls
            .lock()
            .expect("lock")
            .push((control.to_string(), String::from_utf8_lossy(&message.data).into_owned()));
    }
}

struct Rewrap {
    inner: Arc<dyn MessageHandler>,
    transport: Arc<dyn Messenger>,
}

#[async_trait]
impl MessageHandler for Rewrap {
    async fn handle(&self, message: Message) {
        self.inner
            .handle(message.with_transport(self.transport.clone()))
            .await
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, Error> {
        let handler = Arc::new(Rewrap {
            inner: handler,
            transport: Arc::new(self.clone()),
        });
        self.inner.subscribe(topic, handler).await
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<(), Error> {
        self.inner.publish(topic, data).await
    }

    async fn publish_with_reply(
        &self,
        topic: &str,
        reply_to: &str,
        data: Bytes,
    ) -> Result<(), Error> {
        self.inner.publish_with_reply(topic, reply_to, data).await
    }

    async fn ack(&self, message: &Message) -> Result<(), Error> {
        self.record("ack", message);
        Ok(())
    }

    async fn nak(&self, message: &Message) -> Result<(), Error> {
        self.record("nak", message);
        Ok(())
    }
}

async fn wait_for_controls(messenger: &RecordingMessenger, count: usize) -> Vec<(String, String)> {
    for _ in 0..100 {
        let controls = messenger.controls();
        if controls.len() >= count {
            return controls;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    messenger.controls()
}

fn forwarding_handler(tx: mpsc::UnboundedSender<String>) -> Arc<dyn gatehost::rpc::RpcHandler> {
    rpc_handler_fn(move |message, request| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(request.data);
            message.ack().await
        }
    })
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timely")
        .expect("value")
}

#[tokio::test]
async fn dispatches_by_type_and_handler_acks() {
    let messenger = RecordingMessenger::default();
    let bus = EventBus::new(Arc::new(messenger.clone()), SUBJECT)
        .await
        .expect("bus");
    let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel();
    let _ping = bus.register(RpcType::new("PING"), forwarding_handler(ping_tx));
    let _pong = bus.register(RpcType::new("PONG"), forwarding_handler(pong_tx));

    bus.publish(&Request::new(RpcType::new("PONG"), &"second").expect("request"))
        .await
        .expect("publish");
    bus.publish(&Request::new(RpcType::new("PING"), &"first").expect("request"))
        .await
        .expect("publish");

    assert_eq!(recv(&mut pong_rx).await, "\"second\"");
    assert_eq!(recv(&mut ping_rx).await, "\"first\"");
    let controls = wait_for_controls(&messenger, 2).await;
    assert!(controls.iter().all(|(control, _)| control == "ack"));
}

#[tokio::test]
async fn unknown_type_is_nakked() {
    let messenger = RecordingMessenger::default();
    let bus = EventBus::new(Arc::new(messenger.clone()), SUBJECT)
        .await
        .expect("bus");

    bus.publish(&Request::new(RpcType::new("UNKNOWN"), &1).expect("request"))
        .await
        .expect("publish");

    let controls = wait_for_controls(&messenger, 1).await;
    assert_eq!(controls.len(), 1);
    assert_eq!(controls[0].0, "nak");
    assert!(controls[0].1.contains("UNKNOWN"));
}

#[tokio::test]
async fn failing_handler_is_nakked() {
    let messenger = RecordingMessenger::default();
    let bus = EventBus::new(Arc::new(messenger.clone()), SUBJECT)
        .await
        .expect("bus");
    let _failing = bus.register(
        RpcType::new("FAIL"),
        rpc_handler_fn(|_message, _request| async {
            Err(Error::new(ErrorKind::Internal).with_message("boom"))
        }),
    );

    bus.publish(&Request::new(RpcType::new("FAIL"), &()).expect("request"))
        .await
        .expect("publish");

    let controls = wait_for_controls(&messenger, 1).await;
    assert_eq!(controls.len(), 1);
    assert_eq!(controls[0].0, "nak");
}

#[tokio::test]
async fn malformed_envelope_is_dropped_without_controls() {
    let messenger = RecordingMessenger::default();
    let _bus = EventBus::new(Arc::new(messenger.clone()), SUBJECT)
        .await
        .expect("bus");

    messenger
        .publish(SUBJECT, Bytes::from_static(b"not json"))
        .await
        .expect("publish");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(messenger.controls().is_empty());
}

#[tokio::test]
async fn unregister_only_removes_its_own_handler() {
    let messenger = RecordingMessenger::default();
    let bus = EventBus::new(Arc::new(messenger.clone()), SUBJECT)
        .await
        .expect("bus");
    let (old_tx, _old_rx) = mpsc::unbounded_channel();
    let (new_tx, mut new_rx) = mpsc::unbounded_channel();
    let kind = RpcType::new("PING");

    let old = bus.register(kind.clone(), forwarding_handler(old_tx));
    assert_eq!(old.rpc_type(), &kind);
    let _replacement = bus.register(kind.clone(), forwarding_handler(new_tx));
    old.unregister();

    bus.publish(&Request::new(kind.clone(), &"still routed").expect("request"))
        .await
        .expect("publish");
    assert_eq!(recv(&mut new_rx).await, "\"still routed\"");
}

#[tokio::test]
async fn unregister_then_message_is_nakked() {
    let messenger = RecordingMessenger::default();
    let bus = EventBus::new(Arc::new(messenger.clone()), SUBJECT)
        .await
        .expect("bus");
    let (tx, _rx) = mpsc::unbounded_channel();
    let kind = RpcType::new("PING");
    bus.register(kind.clone(), forwarding_handler(tx)).unregister();

    bus.publish(&Request::new(kind, &()).expect("request"))
        .await
        .expect("publish");
    let controls = wait_for_controls(&messenger, 1).await;
    assert_eq!(controls[0].0, "nak");
}

#[tokio::test]
async fn transfer_request_gets_typed_response() {
    let messenger: Arc<dyn Messenger> = Arc::new(MemoryMessenger::new());
    let proxy = EventBus::new(messenger.clone(), SUBJECT).await.expect("proxy");
    let _transfer = proxy.register(
        RpcType::TRANSFER_PLAYER,
        rpc_handler_fn(|message, request| async move {
            let transfer: TransferPlayerRequest = request.decode()?;
            let status = if transfer.destination == "lobby" {
                Status::Ok
            } else {
                Status::Error
            };
            let response = Response::new(
                RpcType::TRANSFER_PLAYER,
                &TransferPlayerResponse { status },
            )?;
            message.respond(response.to_bytes()?).await?;
            message.ack().await
        }),
    );

    let client = EventBus::new(messenger, SUBJECT).await.expect("client");
    let request = Request::new(
        RpcType::TRANSFER_PLAYER,
        &TransferPlayerRequest {
            uuid: uuid::Uuid::new_v4(),
            source: "proxy-0".to_string(),
            destination: "lobby".to_string(),
        },
    )
    .expect("request");

    let response = client
        .request(&request, Duration::from_secs(1))
        .await
        .expect("response");
    assert_eq!(response.rpc_type, RpcType::TRANSFER_PLAYER);
    let decoded: TransferPlayerResponse = response.decode().expect("decode");
    assert_eq!(decoded.status, Status::Ok);
}

#[tokio::test]
async fn request_without_responder_times_out() {
    let messenger: Arc<dyn Messenger> = Arc::new(MemoryMessenger::new());
    let bus = EventBus::new(messenger, SUBJECT).await.expect("bus");
    let request = Request::new(RpcType::new("NOBODY"), &()).expect("request");

    let err = bus
        .request(&request, Duration::from_millis(50))
        .await
        .expect_err("timeout");
    assert_eq!(err.kind(), ErrorKind::Timeout);
}
