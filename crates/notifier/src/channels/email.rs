use async_trait::async_trait;
use serde_json::json;

use courier_common::types::{Channel, Notification, Recipient};

use super::{DeliveryChannel, GatewayClient, address};
use crate::error::DeliveryError;

/// Email through the configured mail gateway.
pub struct EmailChannel {
    gateway: GatewayClient,
}

impl EmailChannel {
    pub fn new(gateway: GatewayClient) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl DeliveryChannel for EmailChannel {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn can_handle(&self, notification: &Notification, recipient: &Recipient) -> bool {
        notification.channel == Channel::Email && address(&recipient.email).is_some()
    }

    async fn send(
        &self,
        notification: &Notification,
        recipient: &Recipient,
    ) -> Result<(), DeliveryError> {
        let to = address(&recipient.email)
            .ok_or_else(|| DeliveryError::Rejected("recipient has no email address".to_string()))?;

        self.gateway
            .post(&json!({
                "notification_id": notification.id,
                "to": to,
                "name": recipient.display_name,
                "subject": notification.subject.as_deref().unwrap_or_default(),
                "body": notification.body,
                "metadata": notification.metadata,
            }))
            .await
    }
}
