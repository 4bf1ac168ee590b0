//! Notification Adapters
//!
//! Push delivery is owned by another service; this process only logs
//! what it would send.

use async_trait::async_trait;

use crate::application::ports::{NotificationError, NotificationGateway};
use crate::domain::notification::PriceUpdateNotification;

/// `NotificationGateway` that writes each notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotificationGateway;

impl LoggingNotificationGateway {
    /// Create a logging gateway.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationGateway for LoggingNotificationGateway {
    async fn send_price_update(
        &self,
        notification: PriceUpdateNotification,
    ) -> Result<(), NotificationError> {
        tracing::info!(
            ticker = %notification.ticker,
            title = %notification.title(),
            data = ?notification.data(),
            "Price notification"
        );
        Ok(())
    }
}
