//! Routes a claimed notification to the capability registered for its
//! channel.

use std::collections::HashMap;
use std::sync::Arc;

use courier_common::error::AppError;
use courier_common::types::{Channel, Notification};
use courier_engine::recipient::RecipientDirectory;

use crate::channels::DeliveryChannel;
use crate::error::DeliveryError;

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The capability accepted the notification.
    Delivered,
    /// The attempt failed; the reason ends up in `error_message`.
    Failed(String),
}

pub struct DeliveryDispatcher {
    channels: HashMap<Channel, Arc<dyn DeliveryChannel>>,
    directory: Arc<dyn RecipientDirectory>,
}

impl DeliveryDispatcher {
    /// Build the registry. Every channel needs exactly one capability.
    pub fn new(
        channels: Vec<Arc<dyn DeliveryChannel>>,
        directory: Arc<dyn RecipientDirectory>,
    ) -> Result<Self, AppError> {
        let mut registry: HashMap<Channel, Arc<dyn DeliveryChannel>> = HashMap::new();
        for capability in channels {
            let channel = capability.channel();
            if registry.insert(channel, capability).is_some() {
                return Err(AppError::Config(format!(
                    "More than one delivery capability registered for {}",
                    channel
                )));
            }
        }

        let missing: Vec<String> = Channel::ALL
            .iter()
            .filter(|c| !registry.contains_key(*c))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(AppError::Config(format!(
                "No delivery capability registered for {}",
                missing.join(", ")
            )));
        }

        Ok(Self {
            channels: registry,
            directory,
        })
    }

    /// Whether SENT on `channel` waits for an external confirmation.
    pub fn confirms_delivery(&self, channel: Channel) -> bool {
        self.channels
            .get(&channel)
            .is_some_and(|capability| capability.confirms_delivery())
    }

    /// Attempt delivery. Only directory failures surface as errors; every
    /// delivery problem is a `Failed` outcome.
    pub async fn dispatch(&self, notification: &Notification) -> Result<DispatchOutcome, AppError> {
        let Some(capability) = self.channels.get(&notification.channel) else {
            return Ok(DispatchOutcome::Failed(format!(
                "no capability for channel {}",
                notification.channel
            )));
        };

        let Some(recipient) = self.directory.find_by_id(notification.recipient_id).await? else {
            return Ok(DispatchOutcome::Failed(
                DeliveryError::RecipientNotFound(notification.recipient_id).to_string(),
            ));
        };

        if !capability.can_handle(notification, &recipient) {
            return Ok(DispatchOutcome::Failed(
                DeliveryError::Rejected(format!(
                    "recipient {} cannot receive {} notifications",
                    recipient.id, notification.channel
                ))
                .to_string(),
            ));
        }

        match capability.send(notification, &recipient).await {
            Ok(()) => Ok(DispatchOutcome::Delivered),
            Err(e) => {
                tracing::debug!(
                    notification_id = %notification.id,
                    channel = %notification.channel,
                    error = %e,
                    "Delivery attempt failed"
                );
                Ok(DispatchOutcome::Failed(e.to_string()))
            }
        }
    }
}
