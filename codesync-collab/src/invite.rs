//! Invitations: issue a collaboration token and deliver it out of band.

use async_trait::async_trait;
use thiserror::Error;

use crate::session::SessionRegistry;

/// What gets delivered to invitees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub token: String,
    pub resource_id: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, Error)]
pub enum InviteError {
    #[error("Invitation has no recipients")]
    NoRecipients,

    #[error("Invitation delivery failed: {0}")]
    Delivery(String),
}

/// Out-of-band delivery (e-mail, chat, ...).
#[async_trait]
pub trait InviteNotifier: Send + Sync {
    async fn notify(&self, invitation: &Invitation) -> Result<(), InviteError>;
}

/// Writes invitations to the log instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl InviteNotifier for LogNotifier {
    async fn notify(&self, invitation: &Invitation) -> Result<(), InviteError> {
        log::info!(
            "Invitation to {} for {}: token {}",
            invitation.resource_id,
            invitation.recipients.join(", "),
            invitation.token
        );
        Ok(())
    }
}

/// Issue a token for `resource_id` and hand it to `notifier`.
///
/// The token is revoked again if delivery fails, so an undelivered
/// invitation never leaves a joinable room behind.
pub async fn invite(
    registry: &SessionRegistry,
    notifier: &dyn InviteNotifier,
    resource_id: &str,
    recipients: Vec<String>,
) -> Result<Invitation, InviteError> {
    if recipients.is_empty() {
        return Err(InviteError::NoRecipients);
    }

    let invitation = Invitation {
        token: registry.generate_token(resource_id),
        resource_id: resource_id.to_string(),
        recipients,
    };

    if let Err(e) = notifier.notify(&invitation).await {
        registry.revoke_token(&invitation.token);
        log::warn!("Revoked token for {resource_id}: {e}");
        return Err(e);
    }
    Ok(invitation)
}
