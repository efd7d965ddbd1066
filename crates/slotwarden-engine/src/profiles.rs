//! Embedded-profile data model and the secure-element boundary.
//!
//! The secure element is the remote service that owns embedded-profile
//! provisioning for a card.  This module defines the transient profile
//! snapshot it reports, the blocking client trait the background worker
//! drives, and the access-rule codec shared with the carrier-config path.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

// ---------------------------------------------------------------------------
// CardId
// ---------------------------------------------------------------------------

/// Public identifier of a physical or embedded card, as assigned by the
/// modem layer.  Negative values are sentinels for cards that have not been
/// enumerated yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CardId(pub i32);

impl CardId {
    /// The card backing a slot has not been enumerated.
    pub const UNINITIALIZED: CardId = CardId(-2);

    /// Whether this id refers to a real, enumerated card.
    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Profile class
// ---------------------------------------------------------------------------

/// Provisioning class of an embedded profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProfileClass {
    Unset,
    Testing,
    Provisioning,
    Operational,
}

impl ProfileClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Testing => "testing",
            Self::Provisioning => "provisioning",
            Self::Operational => "operational",
        }
    }
}

impl fmt::Display for ProfileClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Access rules
// ---------------------------------------------------------------------------

/// Errors from the access-rule codec.
#[derive(Debug, Error)]
pub enum AccessRuleError {
    #[error("malformed certificate hex: {0}")]
    MalformedCertificate(#[from] hex::FromHexError),
    #[error("rule encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// One carrier-privilege access rule: a certificate digest plus an optional
/// package restriction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccessRule {
    #[serde(with = "hex_bytes")]
    pub certificate_hash: Vec<u8>,
    pub package_name: Option<String>,
    pub access_type: i64,
}

impl AccessRule {
    /// Rule derived from a DER-encoded certificate: the stored hash is the
    /// SHA-256 digest of the certificate bytes.
    pub fn from_certificate_der(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        Self {
            certificate_hash: digest.to_vec(),
            package_name: None,
            access_type: 0,
        }
    }

    /// Rule built from a certificate-hash hex string, the form carrier
    /// configurations deliver.
    pub fn from_certificate_hex(hex_hash: &str) -> Result<Self, AccessRuleError> {
        Ok(Self {
            certificate_hash: hex::decode(hex_hash)?,
            package_name: None,
            access_type: 0,
        })
    }
}

/// Encode a rule list into the persisted column form.
pub fn encode_rules(rules: &[AccessRule]) -> Result<String, AccessRuleError> {
    Ok(serde_json::to_string(rules)?)
}

/// Decode a persisted rule column back into rules.
pub fn decode_rules(encoded: &str) -> Result<Vec<AccessRule>, AccessRuleError> {
    Ok(serde_json::from_str(encoded)?)
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Embedded profiles
// ---------------------------------------------------------------------------

/// Operator identity attached to an embedded profile.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CarrierIdentifier {
    pub mcc: String,
    pub mnc: String,
}

/// One embedded profile as reported by the secure element.  Transient:
/// nothing here is persisted except through reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedProfile {
    pub iccid: String,
    pub nickname: String,
    pub profile_class: ProfileClass,
    pub carrier_identifier: Option<CarrierIdentifier>,
    pub access_rules: Vec<AccessRule>,
}

/// Result code of a profile-list fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchResultCode {
    Ok,
    MustDeactivateCard,
    Failure { code: i32 },
}

impl FetchResultCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Outcome of one blocking profile-list fetch for one card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFetchResult {
    pub code: FetchResultCode,
    /// `None` when the secure element could not produce a list at all.
    pub profiles: Option<Vec<EmbeddedProfile>>,
    /// Whether the owning card is removable.  Non-removable cards keep their
    /// unreported profiles presumed-present during reconciliation.
    pub removable: bool,
}

// ---------------------------------------------------------------------------
// Secure-element client
// ---------------------------------------------------------------------------

/// Blocking client for the secure element.  `fetch_profiles` may stall for
/// seconds; it runs only on the background worker, never on the control
/// loop.  Shared with the worker thread, hence `Send + Sync`.
pub trait SecureElementClient: Send + Sync {
    /// Whether the embedded-subscription subsystem is enabled at all.
    fn is_enabled(&self) -> bool;

    /// Blocking fetch of the profile list for `card_id`.  `None` means the
    /// transport to the secure element failed outright.
    fn fetch_profiles(&self, card_id: CardId) -> Option<ProfileFetchResult>;

    /// Whether the platform supports exposing card identifiers for the
    /// default embedded card.
    fn card_id_supported(&self) -> bool;

    /// External identifier of the card, when the platform exposes one.
    fn eid_for_card(&self, card_id: CardId) -> Option<String>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_id_sentinels() {
        assert!(!CardId::UNINITIALIZED.is_valid());
        assert!(!CardId(-1).is_valid());
        assert!(CardId(0).is_valid());
        assert!(CardId(3).is_valid());
    }

    #[test]
    fn rule_from_der_is_sha256() {
        let rule = AccessRule::from_certificate_der(b"cert-bytes");
        assert_eq!(rule.certificate_hash.len(), 32);
        assert_eq!(rule.package_name, None);
        // Same input, same digest.
        assert_eq!(rule, AccessRule::from_certificate_der(b"cert-bytes"));
    }

    #[test]
    fn rule_from_hex_round_trips() {
        let rule = AccessRule::from_certificate_hex("a1b2c3d4").unwrap();
        assert_eq!(rule.certificate_hash, vec![0xa1, 0xb2, 0xc3, 0xd4]);
        assert!(AccessRule::from_certificate_hex("not-hex").is_err());
    }

    #[test]
    fn encode_decode_rules_round_trip() {
        let rules = vec![
            AccessRule::from_certificate_der(b"one"),
            AccessRule {
                certificate_hash: vec![0x00, 0xff],
                package_name: Some("com.example.carrier".to_string()),
                access_type: 1,
            },
        ];
        let encoded = encode_rules(&rules).unwrap();
        assert_eq!(decode_rules(&encoded).unwrap(), rules);
    }

    #[test]
    fn fetch_result_code_ok() {
        assert!(FetchResultCode::Ok.is_ok());
        assert!(!FetchResultCode::MustDeactivateCard.is_ok());
        assert!(!FetchResultCode::Failure { code: 7 }.is_ok());
    }
}
