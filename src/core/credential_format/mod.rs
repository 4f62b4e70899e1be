use core::fmt;
use std::{borrow::Cow, str::FromStr};

use serde::{Deserialize, Serialize};

const FORMAT_DC_SD_JWT: &str = "dc+sd-jwt";
const FORMAT_VC_SD_JWT: &str = "vc+sd-jwt";
const FORMAT_MSO_MDOC: &str = "mso_mdoc";
const FORMAT_JWT_VC_JSON: &str = "jwt_vc_json";
const FORMAT_JWT_VC_JSON_LD: &str = "jwt_vc_json-ld";
const FORMAT_LDP_VC: &str = "ldp_vc";

/// The format a credential (or presentation of it) is encoded in.
///
/// Registry of claim format types: <https://identity.foundation/claim-format-registry/#registry>
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClaimFormatDesignation {
    /// SD-JWT based verifiable credential, current media type.
    DcSdJwt,
    /// SD-JWT based verifiable credential, the media type used up to draft 24.
    VcSdJwt,
    /// ISO/IEC 18013-5 mobile document.
    MsoMDoc,
    /// W3C verifiable credential secured as a JWT, not using JSON-LD.
    JwtVcJson,
    /// W3C verifiable credential secured as a JWT, using JSON-LD.
    JwtVcJsonLd,
    /// W3C verifiable credential secured with a Data Integrity proof.
    LdpVc,
    /// Other claim format designations not covered by the above.
    Other(String),
}

impl ClaimFormatDesignation {
    pub fn from_name(name: Cow<str>) -> Self {
        match name.as_ref() {
            FORMAT_DC_SD_JWT => Self::DcSdJwt,
            FORMAT_VC_SD_JWT => Self::VcSdJwt,
            FORMAT_MSO_MDOC => Self::MsoMDoc,
            FORMAT_JWT_VC_JSON => Self::JwtVcJson,
            FORMAT_JWT_VC_JSON_LD => Self::JwtVcJsonLd,
            FORMAT_LDP_VC => Self::LdpVc,
            _ => Self::Other(name.into_owned()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::DcSdJwt => FORMAT_DC_SD_JWT,
            Self::VcSdJwt => FORMAT_VC_SD_JWT,
            Self::MsoMDoc => FORMAT_MSO_MDOC,
            Self::JwtVcJson => FORMAT_JWT_VC_JSON,
            Self::JwtVcJsonLd => FORMAT_JWT_VC_JSON_LD,
            Self::LdpVc => FORMAT_LDP_VC,
            Self::Other(other) => other,
        }
    }

    /// Both SD-JWT media types are handled by the same codec.
    pub fn is_sd_jwt(&self) -> bool {
        matches!(self, Self::DcSdJwt | Self::VcSdJwt)
    }

    /// Whether `other` may be presented where `self` was requested.
    pub fn accepts(&self, other: &ClaimFormatDesignation) -> bool {
        self == other || (self.is_sd_jwt() && other.is_sd_jwt())
    }

    /// The metadata key a DCQL credential query uses to constrain the credential type.
    pub fn type_meta_key(&self) -> Option<&'static str> {
        match self {
            Self::DcSdJwt | Self::VcSdJwt => Some("vct_values"),
            Self::MsoMDoc => Some("doctype_value"),
            Self::JwtVcJson | Self::JwtVcJsonLd | Self::LdpVc => Some("type_values"),
            Self::Other(_) => None,
        }
    }
}

impl From<&str> for ClaimFormatDesignation {
    fn from(s: &str) -> Self {
        Self::from_name(Cow::Borrowed(s))
    }
}

impl From<String> for ClaimFormatDesignation {
    fn from(value: String) -> Self {
        Self::from_name(Cow::Owned(value))
    }
}

impl FromStr for ClaimFormatDesignation {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.into())
    }
}

impl fmt::Display for ClaimFormatDesignation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

impl Serialize for ClaimFormatDesignation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.name().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClaimFormatDesignation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn known_and_custom_designations() {
        let formats: Vec<ClaimFormatDesignation> =
            serde_json::from_value(json!(["dc+sd-jwt", "mso_mdoc", "com.example.custom_vc"]))
                .unwrap();
        assert_eq!(formats[0], ClaimFormatDesignation::DcSdJwt);
        assert_eq!(formats[1], ClaimFormatDesignation::MsoMDoc);
        assert_eq!(
            formats[2],
            ClaimFormatDesignation::Other("com.example.custom_vc".into())
        );
        assert_eq!(
            serde_json::to_value(&formats).unwrap(),
            json!(["dc+sd-jwt", "mso_mdoc", "com.example.custom_vc"])
        );
    }

    #[test]
    fn sd_jwt_media_types_are_interchangeable() {
        assert!(ClaimFormatDesignation::DcSdJwt.accepts(&ClaimFormatDesignation::VcSdJwt));
        assert!(!ClaimFormatDesignation::DcSdJwt.accepts(&ClaimFormatDesignation::MsoMDoc));
        assert_eq!(
            ClaimFormatDesignation::MsoMDoc.type_meta_key(),
            Some("doctype_value")
        );
    }
}
