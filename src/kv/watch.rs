//! Purpose: Bounded per-watcher event queue shared by every kv backend.
//! Exports: `ChannelWatcher`, `DEFAULT_WATCH_CAPACITY`; crate-internal `WatchSender`, `channel`.
//! Role: Carries replay + live events from a bucket (or broker task) to one consumer.
//! Invariants: `WatchSender::offer` never blocks; a full queue flags overflow instead.
//! Invariants: An overflowed watcher yields its queued events, then `ErrorKind::Lagged`.
//! Invariants: Unwatch runs the detach hook at most once, including on drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{WatchEvent, Watcher};
use crate::core::error::{Error, ErrorKind};

/// Live slots reserved per watcher on top of the replayed entries.
pub const DEFAULT_WATCH_CAPACITY: usize = 256;

type Slot = Result<WatchEvent, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Offer {
    Delivered,
    Overflowed,
    Closed,
}

pub(crate) struct WatchSender {
    tx: mpsc::Sender<Slot>,
    overflowed: Arc<AtomicBool>,
}

impl WatchSender {
    pub(crate) fn offer(&self, event: WatchEvent) -> Offer {
        match self.tx.try_send(Ok(event)) {
            Ok(()) => Offer::Delivered,
            Err(TrySendError::Full(_)) => {
                self.overflowed.store(true, Ordering::SeqCst);
                Offer::Overflowed
            }
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    /// Waits for queue space; used by broker-driven tasks that may apply backpressure upstream.
    pub(crate) async fn send(&self, event: WatchEvent) -> bool {
        self.tx.send(Ok(event)).await.is_ok()
    }

    pub(crate) async fn fail(&self, err: Error) {
        let _ = self.tx.send(Err(err)).await;
    }
}

pub(crate) fn channel(bucket: &str, capacity: usize) -> (WatchSender, ChannelWatcher) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let overflowed = Arc::new(AtomicBool::new(false));
    let sender = WatchSender {
        tx,
        overflowed: overflowed.clone(),
    };
    let watcher = ChannelWatcher {
        bucket: bucket.to_string(),
        rx,
        overflowed,
        detach: None,
        unwatched: false,
        finished: false,
    };
    (sender, watcher)
}

pub struct ChannelWatcher {
    bucket: String,
    rx: mpsc::Receiver<Slot>,
    overflowed: Arc<AtomicBool>,
    detach: Option<Box<dyn FnOnce() + Send>>,
    unwatched: bool,
    finished: bool,
}

impl ChannelWatcher {
    pub(crate) fn on_unwatch(mut self, detach: impl FnOnce() + Send + 'static) -> Self {
        self.detach = Some(Box::new(detach));
        self
    }
}

#[async_trait]
impl Watcher for ChannelWatcher {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn next(&mut self) -> Result<Option<WatchEvent>, Error> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(err)) => {
                self.finished = true;
                self.unwatch();
                Err(err)
            }
            None => {
                self.finished = true;
                if !self.unwatched && self.overflowed.load(Ordering::SeqCst) {
                    self.unwatch();
                    return Err(Error::new(ErrorKind::Lagged)
                        .with_message(format!("watcher on bucket {} overflowed", self.bucket))
                        .with_hint("Call watch_all again to replay the current state."));
                }
                Ok(None)
            }
        }
    }

    fn unwatch(&mut self) {
        if self.unwatched {
            return;
        }
        self.unwatched = true;
        self.rx.close();
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for ChannelWatcher {
    fn drop(&mut self) {
        self.unwatch();
    }
}
