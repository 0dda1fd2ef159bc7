use async_trait::async_trait;

use courier_common::types::{Channel, Notification, Recipient};

use super::DeliveryChannel;
use crate::error::DeliveryError;

/// In-app inbox. The persisted notification is what the recipient reads.
pub struct InAppChannel;

#[async_trait]
impl DeliveryChannel for InAppChannel {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    fn can_handle(&self, notification: &Notification, _recipient: &Recipient) -> bool {
        notification.channel == Channel::InApp
    }

    async fn send(
        &self,
        notification: &Notification,
        _recipient: &Recipient,
    ) -> Result<(), DeliveryError> {
        tracing::debug!(notification_id = %notification.id, "Stored in inbox");
        Ok(())
    }
}
