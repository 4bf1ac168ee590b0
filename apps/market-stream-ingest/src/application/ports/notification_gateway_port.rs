//! Notification Gateway Port (Driven Port)
//!
//! Delivers push notifications to registered devices. Retries, timeouts
//! and provider-side rate limits belong to the adapter.

use async_trait::async_trait;

use crate::domain::notification::PriceUpdateNotification;

/// Notification delivery failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NotificationError {
    /// Provider rejected or failed the request.
    #[error("notification delivery failed: {message}")]
    DeliveryFailed {
        /// Error details.
        message: String,
    },
}

/// Port for sending notifications.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// Send a price-update notification to everyone watching the ticker.
    async fn send_price_update(
        &self,
        notification: PriceUpdateNotification,
    ) -> Result<(), NotificationError>;
}
