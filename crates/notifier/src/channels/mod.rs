//! Channel capabilities.
//!
//! Each capability delivers exactly one [`Channel`]. Email, SMS and push POST
//! to a provider gateway over HTTP; in-app delivery is the stored row itself.

mod email;
mod gateway;
mod in_app;
mod push;
mod sms;

pub use email::EmailChannel;
pub use gateway::GatewayClient;
pub use in_app::InAppChannel;
pub use push::PushChannel;
pub use sms::SmsChannel;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use courier_common::config::AppConfig;
use courier_common::types::{Channel, Notification, Recipient};

use crate::error::DeliveryError;

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn channel(&self) -> Channel;

    /// Whether this capability can deliver `notification` to `recipient`:
    /// the channel matches and the recipient has an address for it.
    fn can_handle(&self, notification: &Notification, recipient: &Recipient) -> bool;

    async fn send(
        &self,
        notification: &Notification,
        recipient: &Recipient,
    ) -> Result<(), DeliveryError>;

    /// `true` when SENT waits for an external delivery confirmation instead
    /// of moving straight to DELIVERED.
    fn confirms_delivery(&self) -> bool {
        false
    }
}

/// One capability per channel, wired to the configured gateways.
pub fn from_config(config: &AppConfig) -> Result<Vec<Arc<dyn DeliveryChannel>>, DeliveryError> {
    let timeout = Duration::from_secs(config.gateway_timeout_seconds);
    let key = config.gateway_api_key.clone();
    let gateway = |url: &Option<String>| GatewayClient::new(url.clone(), key.clone(), timeout);

    Ok(vec![
        Arc::new(EmailChannel::new(gateway(&config.email_gateway_url)?)),
        Arc::new(SmsChannel::new(gateway(&config.sms_gateway_url)?)),
        Arc::new(PushChannel::new(gateway(&config.push_gateway_url)?)),
        Arc::new(InAppChannel),
    ])
}

/// `Some(value)` when the field is present and not blank.
fn address(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use courier_common::types::{NotificationStatus, Priority};

    use super::*;

    fn recipient(email: Option<&str>, phone: Option<&str>, token: Option<&str>) -> Recipient {
        Recipient {
            id: Uuid::new_v4(),
            display_name: None,
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            push_token: token.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    fn notification(channel: Channel, recipient_id: Uuid) -> Notification {
        let now = Utc::now();
        Notification {
            id: Uuid::new_v4(),
            recipient_id,
            channel,
            priority: Priority::Normal,
            subject: None,
            body: "hi".to_string(),
            metadata: serde_json::json!({}),
            event_id: None,
            status: NotificationStatus::Processing,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            error_message: None,
            claimed_at: Some(now),
            created_at: now,
            updated_at: now,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            published_at: None,
        }
    }

    #[test]
    fn test_can_handle_requires_address() {
        let full = recipient(Some("a@example.com"), Some("+1555"), Some("tok"));
        let blank = recipient(Some("  "), None, Some(""));

        let email = EmailChannel::new(GatewayClient::log_only());
        assert!(email.can_handle(&notification(Channel::Email, full.id), &full));
        assert!(!email.can_handle(&notification(Channel::Email, blank.id), &blank));
        assert!(!email.can_handle(&notification(Channel::Sms, full.id), &full));

        let sms = SmsChannel::new(GatewayClient::log_only());
        assert!(sms.can_handle(&notification(Channel::Sms, full.id), &full));
        assert!(!sms.can_handle(&notification(Channel::Sms, blank.id), &blank));

        let push = PushChannel::new(GatewayClient::log_only());
        assert!(push.can_handle(&notification(Channel::Push, full.id), &full));
        assert!(!push.can_handle(&notification(Channel::Push, blank.id), &blank));

        assert!(InAppChannel.can_handle(&notification(Channel::InApp, blank.id), &blank));
        assert!(!InAppChannel.can_handle(&notification(Channel::Email, blank.id), &blank));
    }

    #[tokio::test]
    async fn test_send_without_address_is_rejected() {
        let blank = recipient(None, None, None);
        let email = EmailChannel::new(GatewayClient::log_only());

        let err = email
            .send(&notification(Channel::Email, blank.id), &blank)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected(_)));
    }

    #[test]
    fn test_push_confirms_only_with_gateway() {
        assert!(!PushChannel::new(GatewayClient::log_only()).confirms_delivery());

        let gateway = GatewayClient::new(
            Some("http://push.gateway.local/send".to_string()),
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(PushChannel::new(gateway).confirms_delivery());
        assert!(!InAppChannel.confirms_delivery());
    }

    #[test]
    fn test_from_config_covers_every_channel() {
        let channels = from_config(&AppConfig::default()).unwrap();
        let covered: Vec<Channel> = channels.iter().map(|c| c.channel()).collect();
        assert_eq!(covered.len(), 4);
        for channel in [Channel::Email, Channel::Sms, Channel::Push, Channel::InApp] {
            assert!(covered.contains(&channel));
        }
    }
}
