use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{dpop::DpopProof, IssuanceState, Issuer};
use crate::{
    error::{Error, ErrorCode, Result},
    utils::now,
};

/// What the wallet did with the credentials of a credential response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    CredentialAccepted,
    CredentialFailure,
    CredentialDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub notification_id: String,
    pub event: NotificationEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_description: Option<String>,
}

impl Issuer {
    /// Record the wallet's notification about credentials it received.
    ///
    /// The access token stays usable for this once the session completed.
    #[instrument(skip_all, fields(event = ?request.event))]
    pub async fn handle_notification(
        &self,
        access_token: &str,
        dpop: Option<&DpopProof>,
        request: NotificationRequest,
    ) -> Result<()> {
        let mut versioned = self.access_token_session(access_token, dpop).await?;
        let session = &mut versioned.session;
        if session.is_expired(now())
            || matches!(session.state, IssuanceState::Error | IssuanceState::Expired)
        {
            return Err(Error::invalid_request(format!(
                "issuance session '{}' is {:?}",
                session.id, session.state
            )));
        }
        let Some(event) = session.notifications.get_mut(&request.notification_id) else {
            return Err(Error::client(
                ErrorCode::InvalidNotificationId,
                format!("unknown notification id '{}'", request.notification_id),
            ));
        };
        *event = Some(request.event);
        if request.event == NotificationEvent::CredentialFailure {
            warn!(
                session = session.id,
                description = request.event_description,
                "wallet reported a credential failure"
            );
        }
        let versioned = self.save(versioned).await?;
        info!(session = versioned.session.id, "recorded notification");
        Ok(())
    }
}
