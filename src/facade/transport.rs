//! Transport-interface facade over the peripheral session.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::facade::TransportInterface;
use crate::session::{InboundData, PeripheralSession};

/// [`TransportInterface`] backed by the shared peripheral session.
#[derive(Clone)]
pub struct PeripheralTransport {
    session: Arc<dyn PeripheralSession>,
}

impl PeripheralTransport {
    /// Wrap a peripheral session.
    pub fn new(session: Arc<dyn PeripheralSession>) -> Self {
        Self { session }
    }

    /// The backing session.
    pub fn session(&self) -> &Arc<dyn PeripheralSession> {
        &self.session
    }
}

impl std::fmt::Debug for PeripheralTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl TransportInterface for PeripheralTransport {
    async fn send(&self, data: &[u8]) -> Result<()> {
        self.session.send(data).await
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundData> {
        self.session.subscribe_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::session::{MockPeripheralSession, PeerAddress};
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_forwards_to_session() {
        let mut session = MockPeripheralSession::new();
        session
            .expect_send()
            .withf(|data| data.to_vec() == vec![0xAA, 0xBB])
            .times(1)
            .returning(|_| Ok(()));

        let transport = PeripheralTransport::new(Arc::new(session));
        transport.send(&[0xAA, 0xBB]).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_propagates_session_error() {
        let mut session = MockPeripheralSession::new();
        session
            .expect_send()
            .returning(|_| Err(Error::session_failed("send", "link dropped")));

        let transport = PeripheralTransport::new(Arc::new(session));
        match transport.send(&[1]).await {
            Err(Error::SessionOperationFailed { operation, reason }) => {
                assert_eq!(operation, "send");
                assert_eq!(reason, "link dropped");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_on_data_invokes_callback_until_dropped() {
        let (tx, _) = broadcast::channel(8);
        let subscribe_tx = tx.clone();

        let mut session = MockPeripheralSession::new();
        session
            .expect_subscribe_data()
            .returning(move || subscribe_tx.subscribe());

        let transport = PeripheralTransport::new(Arc::new(session));
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = transport.on_data(move |data| {
            let _ = seen_tx.send(data);
        });

        let message = InboundData {
            address: PeerAddress::from("central"),
            data: Bytes::from_static(&[7]),
        };
        tx.send(message.clone()).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(message));

        drop(handle);
        // The forwarding task is aborted, so the callback's sender is dropped.
        let closed = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap();
        assert_eq!(closed, None);
    }
}
