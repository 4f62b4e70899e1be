use anyhow::{bail, Context, Error};
use base64::prelude::*;
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ops::Deref;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "Vec<T>", into = "Vec<T>")]
pub struct NonEmptyVec<T: Clone>(Vec<T>);

impl<T: Clone> NonEmptyVec<T> {
    pub fn new(t: T) -> Self {
        Self(vec![t])
    }

    pub fn maybe_new(v: Vec<T>) -> Option<Self> {
        Self::try_from(v).ok()
    }

    pub fn push(&mut self, t: T) {
        self.0.push(t)
    }

    pub fn first(&self) -> &T {
        &self.0[0]
    }

    pub fn into_inner(self) -> Vec<T> {
        self.0
    }
}

impl<T: Clone> TryFrom<Vec<T>> for NonEmptyVec<T> {
    type Error = Error;

    fn try_from(v: Vec<T>) -> Result<NonEmptyVec<T>, Error> {
        if v.is_empty() {
            bail!("cannot create a NonEmptyVec from an empty Vec")
        }
        Ok(NonEmptyVec(v))
    }
}

impl<T: Clone> From<NonEmptyVec<T>> for Vec<T> {
    fn from(NonEmptyVec(v): NonEmptyVec<T>) -> Vec<T> {
        v
    }
}

impl<T: Clone> Deref for NonEmptyVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

/// Current time, seconds precision is all the protocol needs.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn unix_now() -> i64 {
    now().timestamp()
}

/// `start` moved forward by `lifetime`, at seconds precision.
pub fn later(start: DateTime<Utc>, lifetime: std::time::Duration) -> DateTime<Utc> {
    start + chrono::Duration::seconds(i64::try_from(lifetime.as_secs()).unwrap_or(i64::MAX / 1_000))
}

/// Random url-safe identifier, used for codes, nonces and transaction ids.
pub fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn b64url_encode(bytes: impl AsRef<[u8]>) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64url_decode(s: &str) -> anyhow::Result<Vec<u8>> {
    BASE64_URL_SAFE_NO_PAD
        .decode(s.trim_end_matches('='))
        .context("value was not valid base64url")
}

pub fn b64url_json<T: DeserializeOwned>(s: &str) -> anyhow::Result<T> {
    let bytes = b64url_decode(s)?;
    serde_json::from_slice(&bytes).context("value was not valid json")
}

/// SHA-256 digest, base64url encoded.
pub fn sha256_b64url(input: impl AsRef<[u8]>) -> String {
    b64url_encode(Sha256::digest(input.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_empty_vec_rejects_empty() {
        assert!(NonEmptyVec::<u8>::try_from(vec![]).is_err());
        let v: NonEmptyVec<u8> = serde_json::from_str("[1,2]").unwrap();
        assert_eq!(*v.first(), 1);
        assert!(serde_json::from_str::<NonEmptyVec<u8>>("[]").is_err());
    }

    #[test]
    fn random_ids_are_distinct() {
        let a = random_id(32);
        assert_eq!(a.len(), 32);
        assert_ne!(a, random_id(32));
    }

    #[test]
    fn sha256_b64url_has_no_padding() {
        assert_eq!(
            sha256_b64url("holder-generated-code-verifier"),
            "I-7elX8_oZVQ9MUI_2etRTkoT30tujRlfvQWL9c7GUY"
        );
    }
}
