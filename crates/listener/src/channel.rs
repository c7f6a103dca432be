//! In-process delivery channel.

use async_trait::async_trait;
use pipeline::{Delivery, EventSource, MalformedEvent};
use tokio::sync::mpsc;

/// Creates a bounded delivery channel.
pub fn channel(capacity: usize) -> (DeliverySender, ChannelEventSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (DeliverySender { tx }, ChannelEventSource { rx })
}

/// Producer half. Cloneable; the source ends when every sender is dropped.
#[derive(Debug, Clone)]
pub struct DeliverySender {
    tx: mpsc::Sender<Delivery>,
}

impl DeliverySender {
    /// Sends a delivery, waiting for capacity. Returns the delivery back if
    /// the source has been dropped.
    pub async fn send(&self, delivery: Delivery) -> Result<(), Delivery> {
        self.tx.send(delivery).await.map_err(|e| e.0)
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct ChannelEventSource {
    rx: mpsc::Receiver<Delivery>,
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, MalformedEvent>> {
        self.rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::DeliveryId;

    #[tokio::test]
    async fn ends_when_all_senders_drop() {
        let (tx, mut source) = channel(4);
        let tx2 = tx.clone();
        tx.send(Delivery::new(
            DeliveryId::new("abc-1").unwrap(),
            "push",
            serde_json::json!({}),
        ))
        .await
        .unwrap();
        drop(tx);
        drop(tx2);

        let got = source.next_delivery().await.unwrap().unwrap();
        assert_eq!(got.delivery_id.as_str(), "abc-1");
        assert!(source.next_delivery().await.is_none());
    }
}
