use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::{info, instrument};
use url::Url;

use super::{
    session::{IssuanceSession, IssuanceState, SessionAuthorization},
    IssuanceEvent, Issuer,
};
use crate::{
    error::{Error, Result},
    utils::{later, now, random_id},
};

pub const PRE_AUTHORIZED_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:pre-authorized_code";
pub const AUTHORIZATION_CODE_GRANT: &str = "authorization_code";
const OFFER_SCHEME: &str = "openid-credential-offer://";

/// The credential offer as sent to (or fetched by) the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialOfferPayload {
    pub credential_issuer: String,
    pub credential_configuration_ids: Vec<String>,
    #[serde(default)]
    pub grants: Grants,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grants {
    #[serde(
        rename = "urn:ietf:params:oauth:grant-type:pre-authorized_code",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub pre_authorized_code: Option<PreAuthorizedCodeGrant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_code: Option<AuthorizationCodeGrant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreAuthorizedCodeGrant {
    #[serde(rename = "pre-authorized_code")]
    pub pre_authorized_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_code: Option<TxCode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationCodeGrant {
    pub issuer_state: String,
}

/// Describes the transaction code the wallet must ask the user for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxCode {
    #[serde(default = "default_input_mode")]
    pub input_mode: String,
    #[serde(default = "default_tx_code_length")]
    pub length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for TxCode {
    fn default() -> Self {
        Self {
            input_mode: default_input_mode(),
            length: default_tx_code_length(),
            description: None,
        }
    }
}

fn default_input_mode() -> String {
    "numeric".into()
}

fn default_tx_code_length() -> usize {
    6
}

impl TxCode {
    fn generate(&self) -> String {
        if self.input_mode == "numeric" {
            let mut rng = rand::thread_rng();
            (0..self.length)
                .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
                .collect()
        } else {
            random_id(self.length)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOfferOptions {
    pub credential_configuration_ids: Vec<String>,
    /// Offer a pre-authorized code, with a transaction code if `Some(Some(_))`.
    pub pre_authorized_code: Option<Option<TxCode>>,
    /// Offer the authorization code grant.
    pub authorization_code: bool,
    /// Ask for a presentation before releasing an authorization code. Defaults to
    /// whether the issuer is configured for presentation during issuance.
    pub require_presentation: Option<bool>,
    pub require_dpop: Option<bool>,
    pub require_wallet_attestation: Option<bool>,
    pub issuance_metadata: Map<String, Json>,
    pub context_correlation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedOffer {
    pub session: IssuanceSession,
    /// `openid-credential-offer://?credential_offer_uri=...`
    pub credential_offer: String,
    pub credential_offer_payload: CredentialOfferPayload,
}

impl Issuer {
    /// Create an issuance session in `OfferCreated` and the offer to send to the wallet.
    ///
    /// Without any grant option, a pre-authorized code without transaction code is offered.
    #[instrument(skip_all)]
    pub async fn create_credential_offer(&self, options: CreateOfferOptions) -> Result<CreatedOffer> {
        if options.credential_configuration_ids.is_empty() {
            return Err(Error::invalid_request("no credential configurations to offer"));
        }
        for id in &options.credential_configuration_ids {
            self.record.configuration(id)?;
        }

        let policy = &self.record.authorization;
        let require_presentation = options
            .require_presentation
            .unwrap_or(policy.presentation_during_issuance.is_some());
        if require_presentation && policy.presentation_during_issuance.is_none() {
            return Err(Error::server(
                "presentation during issuance is not configured for this issuer",
            ));
        }
        if require_presentation && !options.authorization_code {
            return Err(Error::invalid_request(
                "presentation during issuance requires the authorization code grant",
            ));
        }

        let pre_authorized_code = match (&options.pre_authorized_code, options.authorization_code) {
            (None, true) => None,
            (None, false) => Some(None),
            (Some(tx_code), _) => Some(tx_code.clone()),
        };

        let mut grants = Grants::default();
        let mut tx_code_value = None;
        if let Some(tx_code) = pre_authorized_code {
            tx_code_value = tx_code.as_ref().map(TxCode::generate);
            grants.pre_authorized_code = Some(PreAuthorizedCodeGrant {
                pre_authorized_code: random_id(32),
                tx_code,
            });
        }
        let issuer_state = options.authorization_code.then(|| random_id(32));
        if let Some(issuer_state) = &issuer_state {
            grants.authorization_code = Some(AuthorizationCodeGrant {
                issuer_state: issuer_state.clone(),
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let credential_offer_uri = self.endpoint(&format!("offers/{id}"))?;
        let payload = CredentialOfferPayload {
            credential_issuer: self.record.issuer_id.clone(),
            credential_configuration_ids: options.credential_configuration_ids,
            grants,
        };
        let created_at = now();
        let session = IssuanceSession {
            id: id.clone(),
            issuer_id: self.record.issuer_id.clone(),
            context_correlation_id: options.context_correlation_id,
            state: IssuanceState::OfferCreated,
            pre_authorized_code: payload
                .grants
                .pre_authorized_code
                .as_ref()
                .map(|g| g.pre_authorized_code.clone()),
            tx_code: tx_code_value,
            credential_offer: payload.clone(),
            credential_offer_uri: credential_offer_uri.clone(),
            authorization: SessionAuthorization {
                require_dpop: options.require_dpop.unwrap_or(policy.require_dpop),
                require_wallet_attestation: options
                    .require_wallet_attestation
                    .unwrap_or(policy.require_wallet_attestation),
                require_presentation,
                issuer_state,
                ..Default::default()
            },
            chained_identity: None,
            presentation: None,
            access_token: None,
            issuance_metadata: options.issuance_metadata,
            deferred_transactions: Default::default(),
            issued_configurations: vec![],
            issued_credentials: vec![],
            notifications: Default::default(),
            errors: vec![],
            created_at,
            expires_at: later(created_at, self.config.offer_lifetime()),
        };
        self.sessions.insert(&id, session.clone()).await?;
        info!(session = id, "created credential offer");

        let mut offer = Url::parse(OFFER_SCHEME).map_err(anyhow::Error::from)?;
        offer
            .query_pairs_mut()
            .append_pair("credential_offer_uri", &credential_offer_uri);
        Ok(CreatedOffer {
            session,
            credential_offer: offer.to_string(),
            credential_offer_payload: payload,
        })
    }

    /// The offer behind a `credential_offer_uri`, moving the session to `OfferUriRetrieved`.
    #[instrument(skip_all)]
    pub async fn get_credential_offer_from_uri(&self, uri: &str) -> Result<CredentialOfferPayload> {
        let found = crate::session::find_one(self.sessions.as_ref(), &|s: &IssuanceSession| {
            s.credential_offer_uri == uri
        })
        .await?
        .ok_or_else(|| Error::NotFound(format!("credential offer '{uri}'")))?;
        let mut versioned = self.ensure_active(found.1).await?;
        if !matches!(
            versioned.session.state,
            IssuanceState::OfferCreated | IssuanceState::OfferUriRetrieved
        ) {
            return Err(Error::invalid_request("credential offer was already used"));
        }
        if versioned.session.state == IssuanceState::OfferCreated {
            versioned.session.apply(IssuanceEvent::OfferUriRetrieved)?;
            versioned = self.save(versioned).await?;
        }
        Ok(versioned.session.credential_offer)
    }
}
