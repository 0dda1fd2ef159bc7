use async_trait::async_trait;
use serde_json::json;

use courier_common::types::{Channel, Notification, Recipient};

use super::{DeliveryChannel, GatewayClient, address};
use crate::error::DeliveryError;

/// Push through the configured push gateway.
///
/// A real push gateway reports device receipt back through the delivery
/// confirmation endpoint, so SENT only becomes DELIVERED on that callback.
pub struct PushChannel {
    gateway: GatewayClient,
}

impl PushChannel {
    pub fn new(gateway: GatewayClient) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl DeliveryChannel for PushChannel {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    fn can_handle(&self, notification: &Notification, recipient: &Recipient) -> bool {
        notification.channel == Channel::Push && address(&recipient.push_token).is_some()
    }

    async fn send(
        &self,
        notification: &Notification,
        recipient: &Recipient,
    ) -> Result<(), DeliveryError> {
        let token = address(&recipient.push_token)
            .ok_or_else(|| DeliveryError::Rejected("recipient has no push token".to_string()))?;

        self.gateway
            .post(&json!({
                "notification_id": notification.id,
                "token": token,
                "title": notification.subject,
                "body": notification.body,
                "priority": notification.priority,
                "data": notification.metadata,
            }))
            .await
    }

    fn confirms_delivery(&self) -> bool {
        self.gateway.is_configured()
    }
}
