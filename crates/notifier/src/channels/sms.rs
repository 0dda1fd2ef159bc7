use async_trait::async_trait;
use serde_json::json;

use courier_common::types::{Channel, Notification, Recipient};

use super::{DeliveryChannel, GatewayClient, address};
use crate::error::DeliveryError;

/// SMS through the configured SMS gateway. The subject is not sent.
pub struct SmsChannel {
    gateway: GatewayClient,
}

impl SmsChannel {
    pub fn new(gateway: GatewayClient) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl DeliveryChannel for SmsChannel {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn can_handle(&self, notification: &Notification, recipient: &Recipient) -> bool {
        notification.channel == Channel::Sms && address(&recipient.phone).is_some()
    }

    async fn send(
        &self,
        notification: &Notification,
        recipient: &Recipient,
    ) -> Result<(), DeliveryError> {
        let to = address(&recipient.phone)
            .ok_or_else(|| DeliveryError::Rejected("recipient has no phone number".to_string()))?;

        self.gateway
            .post(&json!({
                "notification_id": notification.id,
                "to": to,
                "body": notification.body,
            }))
            .await
    }
}
