//! Network-interface facade over the central session.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::Result;
use crate::facade::NetworkInterface;
use crate::session::{CentralSession, InboundData, PeerAddress};

/// [`NetworkInterface`] backed by the shared central session.
#[derive(Clone)]
pub struct CentralNetworkInterface {
    session: Arc<dyn CentralSession>,
}

impl CentralNetworkInterface {
    /// Wrap a central session.
    pub fn new(session: Arc<dyn CentralSession>) -> Self {
        Self { session }
    }

    /// The backing session.
    pub fn session(&self) -> &Arc<dyn CentralSession> {
        &self.session
    }
}

impl std::fmt::Debug for CentralNetworkInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralNetworkInterface").finish_non_exhaustive()
    }
}

#[async_trait]
impl NetworkInterface for CentralNetworkInterface {
    async fn open_channel(&self, address: &PeerAddress) -> Result<BleChannel> {
        self.session.connect(address).await?;
        debug!("Opened channel to {}", address);

        Ok(BleChannel {
            session: self.session.clone(),
            address: address.clone(),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundData> {
        self.session.subscribe_data()
    }
}

/// A GATT link to one peer, opened through a [`NetworkInterface`].
///
/// Closing the channel disconnects the peer only; the session stays up.
pub struct BleChannel {
    session: Arc<dyn CentralSession>,
    address: PeerAddress,
}

impl BleChannel {
    /// The peer this channel talks to.
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Write data to the peer.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.session.write(&self.address, data).await
    }

    /// Whether `data` was sent by this channel's peer.
    pub fn is_from_peer(&self, data: &InboundData) -> bool {
        data.address == self.address
    }

    /// Disconnect from the peer.
    pub async fn close(self) -> Result<()> {
        debug!("Closing channel to {}", self.address);
        self.session.disconnect(&self.address).await
    }
}

impl std::fmt::Debug for BleChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleChannel")
            .field("address", &self.address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::session::MockCentralSession;
    use bytes::Bytes;
    use mockall::predicate::eq;
    use mockall::Sequence;

    #[tokio::test]
    async fn test_channel_forwards_connect_write_disconnect() {
        let address = PeerAddress::from("peer-1");
        let mut seq = Sequence::new();
        let mut session = MockCentralSession::new();

        session
            .expect_connect()
            .with(eq(address.clone()))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        session
            .expect_write()
            .withf(|peer, data| peer.as_str() == "peer-1" && data.to_vec() == vec![0x05])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        session
            .expect_disconnect()
            .with(eq(address.clone()))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let network = CentralNetworkInterface::new(Arc::new(session));
        let channel = network.open_channel(&address).await.unwrap();
        assert_eq!(channel.address(), &address);

        channel.send(&[0x05]).await.unwrap();
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_channel_propagates_connect_error() {
        let mut session = MockCentralSession::new();
        session.expect_connect().returning(|address| {
            Err(Error::PeerNotFound {
                address: address.to_string(),
            })
        });

        let network = CentralNetworkInterface::new(Arc::new(session));
        let result = network.open_channel(&PeerAddress::from("missing")).await;
        assert!(matches!(result, Err(Error::PeerNotFound { address }) if address == "missing"));
    }

    #[test]
    fn test_is_from_peer() {
        let session = MockCentralSession::new();
        let channel = BleChannel {
            session: Arc::new(session),
            address: PeerAddress::from("a"),
        };

        let from_a = InboundData {
            address: PeerAddress::from("a"),
            data: Bytes::new(),
        };
        let from_b = InboundData {
            address: PeerAddress::from("b"),
            data: Bytes::new(),
        };
        assert!(channel.is_from_peer(&from_a));
        assert!(!channel.is_from_peer(&from_b));
    }
}
