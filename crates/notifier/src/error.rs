use thiserror::Error;

/// Why a channel capability could not deliver a notification.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The capability refused the notification (missing address, wrong channel).
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The provider gateway answered with a non-2xx status.
    #[error("Gateway returned HTTP {status}")]
    Gateway { status: u16 },

    /// The request to the provider gateway failed (network, DNS, timeout).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Recipient {0} not found")]
    RecipientNotFound(uuid::Uuid),
}
