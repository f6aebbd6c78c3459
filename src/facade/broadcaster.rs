//! Broadcaster facade over the peripheral session.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ProvisionerConfig;
use crate::error::Result;
use crate::facade::Broadcaster;
use crate::session::{AdvertisementRequest, PeripheralSession};

/// [`Broadcaster`] backed by the shared peripheral session.
///
/// Every announcement carries the additional advertisement data and
/// interval the broadcaster was created with.
#[derive(Clone)]
pub struct BleBroadcaster {
    session: Arc<dyn PeripheralSession>,
    additional_advertisement_data: Option<Bytes>,
    interval: Duration,
    local_name: Option<String>,
}

impl BleBroadcaster {
    /// Wrap a peripheral session, taking interval and local name from `config`.
    pub fn new(
        session: Arc<dyn PeripheralSession>,
        additional_advertisement_data: Option<Bytes>,
        config: &ProvisionerConfig,
    ) -> Self {
        Self {
            session,
            additional_advertisement_data,
            interval: config.advertising_interval,
            local_name: config.local_name.clone(),
        }
    }

    /// The backing session.
    pub fn session(&self) -> &Arc<dyn PeripheralSession> {
        &self.session
    }

    /// The advertising interval used for announcements.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Build the request `announce` hands to the session.
    pub fn advertisement_request(&self, advertisement: &[u8]) -> AdvertisementRequest {
        AdvertisementRequest::new(Bytes::copy_from_slice(advertisement), self.interval)
            .with_additional_data(self.additional_advertisement_data.clone())
            .with_local_name(self.local_name.clone())
    }
}

impl std::fmt::Debug for BleBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleBroadcaster")
            .field("additional_advertisement_data", &self.additional_advertisement_data)
            .field("interval", &self.interval)
            .field("local_name", &self.local_name)
            .finish()
    }
}

#[async_trait]
impl Broadcaster for BleBroadcaster {
    async fn announce(&self, advertisement: &[u8]) -> Result<()> {
        let request = self.advertisement_request(advertisement);
        debug!(
            "Announcing {} bytes, {} bytes of additional data",
            request.payload.len(),
            request.additional_data.as_ref().map_or(0, Bytes::len)
        );
        self.session.start_advertising(&request).await
    }

    async fn stop(&self) -> Result<()> {
        self.session.stop_advertising().await
    }

    fn is_announcing(&self) -> bool {
        self.session.is_advertising()
    }

    fn additional_advertisement_data(&self) -> Option<&[u8]> {
        self.additional_advertisement_data.as_deref()
    }
}
