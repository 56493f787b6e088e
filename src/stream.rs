//! Bounded streaming channel between a producer task and its consumer.
//!
//! The scheduler owns channel creation and wires the sender into the
//! producer's context and the receiver into the consumer's. A full channel
//! blocks the producer (back-pressure); dropping the sender signals
//! end-of-stream; a producer failure surfaces as an error frame before the
//! channel closes.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{EngineError, ErrorKind};

pub const DEFAULT_STREAM_CAPACITY: usize = 64;

#[derive(Debug)]
enum Frame {
    Item(Value),
    Abort(String),
}

/// Publish side, handed to producer tasks through their context.
#[derive(Debug, Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<Frame>,
}

impl StreamSender {
    /// Publish one item. Suspends while the channel is full. Fails only when
    /// the consumer is gone, which a producer may treat as a stop signal.
    pub async fn publish(&self, item: Value) -> Result<(), EngineError> {
        self.tx.send(Frame::Item(item)).await.map_err(|_| {
            EngineError::new(ErrorKind::Task, "stream consumer dropped before end of stream")
        })
    }

    /// Signal that the producer failed mid-stream. Consumers observe the
    /// message on their next read.
    pub(crate) async fn abort(&self, message: String) {
        let _ = self.tx.send(Frame::Abort(message)).await;
    }
}

/// Consume side, handed to consumer tasks through their context.
#[derive(Debug)]
pub struct StreamReceiver {
    rx: mpsc::Receiver<Frame>,
}

impl StreamReceiver {
    /// Receive the next item. `None` means the stream ended cleanly;
    /// `Some(Err(_))` means the producer failed mid-stream.
    pub async fn recv(&mut self) -> Option<Result<Value, EngineError>> {
        match self.rx.recv().await? {
            Frame::Item(item) => Some(Ok(item)),
            Frame::Abort(message) => Some(Err(EngineError::new(
                ErrorKind::Upstream,
                format!("stream producer failed: {}", message),
            ))),
        }
    }
}

pub(crate) fn stream_channel(capacity: usize) -> (StreamSender, StreamReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (StreamSender { tx }, StreamReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn items_then_clean_close() {
        let (tx, mut rx) = stream_channel(4);
        tx.publish(json!(1)).await.unwrap();
        tx.publish(json!(2)).await.unwrap();
        drop(tx);
        assert_eq!(rx.recv().await.unwrap().unwrap(), json!(1));
        assert_eq!(rx.recv().await.unwrap().unwrap(), json!(2));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn abort_surfaces_as_error_frame() {
        let (tx, mut rx) = stream_channel(4);
        tx.publish(json!("partial")).await.unwrap();
        tx.abort("boom".to_string()).await;
        drop(tx);
        assert!(rx.recv().await.unwrap().is_ok());
        let err = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Upstream);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_channel_applies_backpressure() {
        let (tx, mut rx) = stream_channel(1);
        tx.publish(json!(1)).await.unwrap();
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            tx.publish(json!(2)),
        )
        .await;
        assert!(pending.is_err(), "second publish should block");
        assert_eq!(rx.recv().await.unwrap().unwrap(), json!(1));
        tx.publish(json!(2)).await.unwrap();
    }
}
