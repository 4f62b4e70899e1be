//! OpenID Federation trust chains for signed authorization requests.
//!
//! A chain is `[leaf entity configuration, subordinate statement, ..., anchor entity
//! configuration]`. The first chain found that ends in a trusted anchor is validated; if
//! that chain does not validate, resolution fails without trying alternatives.

use std::collections::HashSet;

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::{Map, Value as Json};
use tracing::debug;
use url::Url;

use super::{jwk::PublicJwk, jwt::DecodedJwt, TrustCallbacks, TrustContext};
use crate::{
    core::util::fetch_text,
    error::{Error, OrTrustError, Result},
    utils::unix_now,
};

const WELL_KNOWN: &str = ".well-known/openid-federation";

#[derive(Debug, Clone, Deserialize)]
struct Jwks {
    keys: Vec<PublicJwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct StatementClaims {
    iss: String,
    sub: String,
    exp: i64,
    jwks: Jwks,
    #[serde(default)]
    authority_hints: Vec<String>,
    #[serde(default)]
    metadata: Map<String, Json>,
}

/// An entity configuration or subordinate statement. The signature is checked as part of
/// the chain it belongs to.
#[derive(Debug, Clone)]
pub struct EntityStatement {
    claims: StatementClaims,
    jwt: DecodedJwt,
}

impl EntityStatement {
    pub fn parse(compact: &str) -> anyhow::Result<Self> {
        let jwt = DecodedJwt::decode(compact)?;
        let claims = serde_json::from_value(Json::Object(jwt.payload.clone()))
            .context("invalid entity statement")?;
        Ok(Self { claims, jwt })
    }

    pub fn issuer(&self) -> &str {
        &self.claims.iss
    }

    pub fn subject(&self) -> &str {
        &self.claims.sub
    }

    pub fn authority_hints(&self) -> &[String] {
        &self.claims.authority_hints
    }

    pub fn metadata(&self, entity_type: &str) -> Option<&Map<String, Json>> {
        self.claims.metadata.get(entity_type).and_then(Json::as_object)
    }

    fn is_entity_configuration(&self) -> bool {
        self.claims.iss == self.claims.sub
    }

    fn fetch_endpoint(&self) -> Option<&str> {
        self.metadata("federation_entity")?
            .get("federation_fetch_endpoint")
            .and_then(Json::as_str)
    }

    /// Verify this statement with a key from `jwks`, matched by `kid`.
    fn verify_with(&self, jwks: &[PublicJwk]) -> anyhow::Result<()> {
        let key = match self.jwt.kid() {
            Some(kid) => jwks.iter().find(|k| k.kid() == Some(kid)),
            None if jwks.len() == 1 => jwks.first(),
            None => None,
        }
        .with_context(|| {
            format!(
                "no key found to verify the statement issued by '{}'",
                self.claims.iss
            )
        })?;
        self.jwt.verify(key)
    }
}

/// A validated trust chain.
#[derive(Debug, Clone)]
pub struct TrustChain {
    statements: Vec<EntityStatement>,
}

impl TrustChain {
    pub fn leaf(&self) -> &EntityStatement {
        &self.statements[0]
    }

    pub fn trust_anchor(&self) -> &str {
        self.statements
            .last()
            .map(EntityStatement::subject)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// The relying party signing key with the given `kid`, from the leaf's metadata.
    pub fn relying_party_key(&self, kid: &str) -> Result<PublicJwk> {
        let keys = self
            .leaf()
            .metadata("openid_relying_party")
            .and_then(|rp| rp.get("jwks"))
            .cloned()
            .ok_or_else(|| Error::trust("leaf entity declares no relying party jwks"))?;
        let keys: Jwks = serde_json::from_value(keys).or_trust("invalid relying party jwks")?;
        keys.keys
            .into_iter()
            .find(|k| k.kid() == Some(kid))
            .ok_or_else(|| Error::trust(format!("no relying party key with kid '{kid}'")))
    }

    fn validate(&self, now: i64) -> anyhow::Result<()> {
        let (Some(leaf), Some(anchor)) = (self.statements.first(), self.statements.last()) else {
            bail!("empty trust chain")
        };
        if !leaf.is_entity_configuration() || !anchor.is_entity_configuration() {
            bail!("trust chain must start and end with an entity configuration")
        }
        for statement in &self.statements {
            if statement.claims.exp <= now {
                bail!("statement issued by '{}' has expired", statement.claims.iss)
            }
        }
        leaf.verify_with(&leaf.claims.jwks.keys)
            .context("leaf entity configuration is not self-signed")?;
        anchor
            .verify_with(&anchor.claims.jwks.keys)
            .context("trust anchor entity configuration is not self-signed")?;

        for pair in self.statements.windows(2) {
            let (statement, superior) = (&pair[0], &pair[1]);
            if superior.claims.sub != statement.claims.iss {
                bail!(
                    "statement about '{}' does not follow '{}'",
                    superior.claims.sub,
                    statement.claims.iss
                )
            }
            statement
                .verify_with(&superior.claims.jwks.keys)
                .with_context(|| format!("invalid link from '{}'", statement.claims.iss))?;
        }
        Ok(())
    }
}

impl TrustCallbacks {
    fn check_entity_id(&self, entity_id: &str) -> Result<Url> {
        let url = Url::parse(entity_id)
            .map_err(|e| Error::trust(format!("entity id '{entity_id}' is not a url: {e}")))?;
        match url.scheme() {
            "https" => Ok(url),
            "http" if self.allow_insecure_federation_entity_ids => Ok(url),
            _ => Err(Error::trust(format!(
                "entity id '{entity_id}' must be an https url"
            ))),
        }
    }

    async fn fetch_entity_configuration(&self, entity_id: &str) -> anyhow::Result<EntityStatement> {
        let url = format!("{}/{WELL_KNOWN}", entity_id.trim_end_matches('/'));
        let statement = EntityStatement::parse(&fetch_text(self.http_client(), &url).await?)?;
        if !statement.is_entity_configuration() || statement.claims.sub != entity_id {
            bail!("'{url}' is not the entity configuration of '{entity_id}'")
        }
        Ok(statement)
    }

    async fn fetch_subordinate_statement(
        &self,
        superior: &EntityStatement,
        subject: &str,
    ) -> anyhow::Result<EntityStatement> {
        let endpoint = superior
            .fetch_endpoint()
            .with_context(|| format!("'{}' has no fetch endpoint", superior.claims.sub))?;
        let mut url = Url::parse(endpoint).context("invalid fetch endpoint")?;
        url.query_pairs_mut().append_pair("sub", subject);
        let statement = EntityStatement::parse(&fetch_text(self.http_client(), url.as_str()).await?)?;
        if statement.claims.iss != superior.claims.sub || statement.claims.sub != subject {
            bail!("fetched statement is not issued by '{}' about '{subject}'", superior.claims.sub)
        }
        Ok(statement)
    }

    /// Walk `authority_hints` depth first until an entity in `trusted` is reached.
    async fn find_chain(
        &self,
        leaf: EntityStatement,
        trusted: &HashSet<&str>,
    ) -> Option<Vec<EntityStatement>> {
        if trusted.contains(leaf.subject()) {
            return Some(vec![leaf]);
        }
        let mut visited = HashSet::from([leaf.claims.sub.clone()]);
        let mut stack = vec![(leaf.clone(), Vec::<EntityStatement>::new())];

        while let Some((entity, path)) = stack.pop() {
            if path.len() >= self.max_federation_chain_depth {
                debug!("maximum federation chain depth reached at '{}'", entity.claims.sub);
                continue;
            }
            let mut next = Vec::new();
            for hint in entity.authority_hints() {
                if !visited.insert(hint.clone()) || self.check_entity_id(hint).is_err() {
                    continue;
                }
                let superior = match self.fetch_entity_configuration(hint).await {
                    Ok(superior) => superior,
                    Err(e) => {
                        debug!("skipping authority '{hint}': {e:#}");
                        continue;
                    }
                };
                let statement = match self
                    .fetch_subordinate_statement(&superior, entity.subject())
                    .await
                {
                    Ok(statement) => statement,
                    Err(e) => {
                        debug!("skipping authority '{hint}': {e:#}");
                        continue;
                    }
                };
                let mut path = path.clone();
                path.push(statement);
                if trusted.contains(hint.as_str()) {
                    let mut chain = vec![leaf];
                    chain.extend(path);
                    chain.push(superior);
                    return Some(chain);
                }
                next.push((superior, path));
            }
            // Keep the declared order of authority hints when popping.
            stack.extend(next.into_iter().rev());
        }
        None
    }

    /// Resolve and validate the trust chain of `entity_id` up to one of the trusted
    /// federation entity ids of `context`.
    #[tracing::instrument(skip_all, fields(entity_id = entity_id))]
    pub async fn resolve_federation_chain(
        &self,
        entity_id: &str,
        context: &TrustContext,
    ) -> Result<TrustChain> {
        self.check_entity_id(entity_id)?;
        if context.federation_entity_ids.is_empty() {
            return Err(Error::trust("no trusted federation entity ids configured"));
        }
        let trusted: HashSet<&str> = context
            .federation_entity_ids
            .iter()
            .map(String::as_str)
            .collect();

        let leaf = self
            .fetch_entity_configuration(entity_id)
            .await
            .or_trust("unable to fetch entity configuration")?;
        let statements = self
            .find_chain(leaf, &trusted)
            .await
            .ok_or_else(|| {
                Error::trust(format!(
                    "no trust chain from '{entity_id}' to a trusted federation entity"
                ))
            })?;

        let chain = TrustChain { statements };
        chain
            .validate(unix_now())
            .or_trust("federation trust chain")?;
        debug!(anchor = chain.trust_anchor(), "resolved federation trust chain");
        Ok(chain)
    }
}
