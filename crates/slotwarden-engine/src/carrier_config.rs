//! Carrier-configuration application onto the active subscription.
//!
//! Carrier certificates are package-independent and always applied; the
//! opportunistic flag and group membership are authorization-gated.  An
//! unauthorized package keeps its certificate write and loses the rest,
//! logged, never erred.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::collaborators::AuthorizationOracle;
use crate::profiles::{encode_rules, AccessRule, AccessRuleError};
use crate::record::{RecordUpdate, SubscriptionRecord};
use crate::slot_table::SlotIndex;

const COMPONENT: &str = "carrier_config";

/// Well-known sentinel: a group directive carrying this UUID means "remove
/// the subscription from its group".
pub const REMOVE_GROUP_UUID: Uuid = Uuid::nil();

// ---------------------------------------------------------------------------
// CarrierConfig
// ---------------------------------------------------------------------------

/// The slice of a carrier configuration this core consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierConfig {
    /// Carrier certificate hashes, hex-encoded.  `None` = the configuration
    /// carries no certificate entry at all.
    pub certificates: Option<Vec<String>>,
    /// Whether the subscription is opportunistic.  Absent keys default to
    /// `false` upstream, so this is plain.
    pub opportunistic: bool,
    /// Raw group-UUID directive; empty or absent means no group change.
    pub group_uuid: Option<String>,
}

/// Errors from translating certificate strings into access rules.
#[derive(Debug, Error)]
pub enum CarrierConfigError {
    #[error("certificate entry rejected: {0}")]
    Certificate(#[from] AccessRuleError),
}

/// What one carrier-config application wants to write, plus the group value
/// for the change notification.
#[derive(Debug, Default)]
pub struct CarrierConfigOutcome {
    pub update: RecordUpdate,
    /// `Some` only when a group was assigned in this batch.
    pub group_for_notify: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Encode carrier certificate hex strings into the persisted rule column.
pub fn encode_certificates(certificates: &[String]) -> Result<String, CarrierConfigError> {
    let rules = certificates
        .iter()
        .map(|hex_hash| AccessRule::from_certificate_hex(hex_hash))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(encode_rules(&rules)?)
}

/// Build the write batch for one carrier-config application against the
/// currently active record.  Pure: the caller owns the store write and the
/// notifications.
pub fn build_update(
    slot: SlotIndex,
    package: &str,
    config: &CarrierConfig,
    current: &SubscriptionRecord,
    auth: &dyn AuthorizationOracle,
) -> CarrierConfigOutcome {
    let mut outcome = CarrierConfigOutcome::default();

    // Certificates are not subscription-specific; they apply regardless of
    // which package delivered the configuration.
    if let Some(certificates) = &config.certificates {
        match encode_certificates(certificates) {
            Ok(encoded) => {
                outcome.update.carrier_config_access_rules = Some(Some(encoded));
            }
            Err(err) => {
                log::warn!("{COMPONENT}: skipping certificates for slot {slot}: {err}");
            }
        }
    }

    let authorized = package == auth.default_carrier_service_package()
        || auth.package_has_carrier_privilege(slot, package);
    if !authorized {
        log::error!(
            "{COMPONENT}: package {package} cannot manage subscription {} on slot {slot}",
            current.id
        );
        return outcome;
    }

    if current.opportunistic != config.opportunistic {
        outcome.update.opportunistic = Some(config.opportunistic);
    }

    if let Some(raw) = config.group_uuid.as_deref().filter(|s| !s.is_empty()) {
        match Uuid::parse_str(raw) {
            Ok(group) if group == REMOVE_GROUP_UUID => {
                // Remove only when actually grouped.
                if current.group_uuid.is_some() {
                    outcome.update.group_uuid = Some(None);
                    log::debug!("{COMPONENT}: group removed for {}", current.id);
                }
            }
            Ok(group) => {
                if auth.package_owns_group(&group, package) {
                    outcome.update.group_uuid = Some(Some(group));
                    outcome.update.group_owner = Some(Some(package.to_string()));
                    outcome.group_for_notify = Some(group);
                    log::debug!("{COMPONENT}: group {group} added for {}", current.id);
                } else {
                    log::error!("{COMPONENT}: package {package} does not own group {group}");
                }
            }
            Err(err) => {
                log::error!("{COMPONENT}: invalid group UUID {raw:?}: {err}");
            }
        }
    }

    outcome
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{SubscriptionId, SubscriptionRecord};

    // -- helpers ------------------------------------------------------------

    struct FakeOracle {
        privileged: bool,
        owns_group: bool,
    }

    impl AuthorizationOracle for FakeOracle {
        fn package_owns_group(&self, _: &Uuid, _: &str) -> bool {
            self.owns_group
        }

        fn package_has_carrier_privilege(&self, _: SlotIndex, _: &str) -> bool {
            self.privileged
        }

        fn default_carrier_service_package(&self) -> String {
            "com.platform.carrier".to_string()
        }
    }

    fn active_record() -> SubscriptionRecord {
        let mut record = SubscriptionRecord::new(SubscriptionId(1), "icc-1");
        record.slot_index = Some(0);
        record
    }

    fn config_with_group(group: &str) -> CarrierConfig {
        CarrierConfig {
            certificates: Some(vec!["a1b2c3".to_string()]),
            opportunistic: true,
            group_uuid: Some(group.to_string()),
        }
    }

    const GROUP: &str = "f47ac10b-58cc-4372-a567-0e02b2c3d479";

    // -- authorization gate -------------------------------------------------

    #[test]
    fn unprivileged_package_keeps_certificates_loses_gated_fields() {
        let oracle = FakeOracle {
            privileged: false,
            owns_group: true,
        };
        let outcome = build_update(
            0,
            "com.rogue.app",
            &config_with_group(GROUP),
            &active_record(),
            &oracle,
        );
        assert!(outcome.update.carrier_config_access_rules.is_some());
        assert_eq!(outcome.update.opportunistic, None);
        assert_eq!(outcome.update.group_uuid, None);
        assert_eq!(outcome.group_for_notify, None);
    }

    #[test]
    fn default_carrier_service_package_is_authorized() {
        let oracle = FakeOracle {
            privileged: false,
            owns_group: true,
        };
        let outcome = build_update(
            0,
            "com.platform.carrier",
            &config_with_group(GROUP),
            &active_record(),
            &oracle,
        );
        assert_eq!(outcome.update.opportunistic, Some(true));
        assert!(outcome.update.group_uuid.is_some());
    }

    // -- opportunistic flag -------------------------------------------------

    #[test]
    fn opportunistic_written_only_on_change() {
        let oracle = FakeOracle {
            privileged: true,
            owns_group: false,
        };
        let mut record = active_record();
        record.opportunistic = true;
        let config = CarrierConfig {
            opportunistic: true,
            ..Default::default()
        };
        let outcome = build_update(0, "com.carrier.app", &config, &record, &oracle);
        assert_eq!(outcome.update.opportunistic, None);
        assert!(outcome.update.is_empty());
    }

    // -- group directives ---------------------------------------------------

    #[test]
    fn remove_sentinel_clears_only_when_grouped() {
        let oracle = FakeOracle {
            privileged: true,
            owns_group: false,
        };
        let remove = CarrierConfig {
            group_uuid: Some(REMOVE_GROUP_UUID.to_string()),
            ..Default::default()
        };

        let ungrouped = active_record();
        let outcome = build_update(0, "com.carrier.app", &remove, &ungrouped, &oracle);
        assert_eq!(outcome.update.group_uuid, None);

        let mut grouped = active_record();
        grouped.group_uuid = Some(Uuid::parse_str(GROUP).unwrap());
        let outcome = build_update(0, "com.carrier.app", &remove, &grouped, &oracle);
        assert_eq!(outcome.update.group_uuid, Some(None));
        assert_eq!(outcome.group_for_notify, None);
    }

    #[test]
    fn group_applied_only_when_package_owns_it() {
        let config = config_with_group(GROUP);
        let record = active_record();

        let denied = FakeOracle {
            privileged: true,
            owns_group: false,
        };
        let outcome = build_update(0, "com.carrier.app", &config, &record, &denied);
        assert_eq!(outcome.update.group_uuid, None);

        let allowed = FakeOracle {
            privileged: true,
            owns_group: true,
        };
        let outcome = build_update(0, "com.carrier.app", &config, &record, &allowed);
        let group = Uuid::parse_str(GROUP).unwrap();
        assert_eq!(outcome.update.group_uuid, Some(Some(group)));
        assert_eq!(
            outcome.update.group_owner,
            Some(Some("com.carrier.app".to_string()))
        );
        assert_eq!(outcome.group_for_notify, Some(group));
    }

    #[test]
    fn malformed_group_uuid_is_logged_and_skipped() {
        let oracle = FakeOracle {
            privileged: true,
            owns_group: true,
        };
        let config = CarrierConfig {
            group_uuid: Some("not-a-uuid".to_string()),
            ..Default::default()
        };
        let outcome = build_update(0, "com.carrier.app", &config, &active_record(), &oracle);
        assert_eq!(outcome.update.group_uuid, None);
        assert!(outcome.update.is_empty());
    }

    // -- certificates -------------------------------------------------------

    #[test]
    fn malformed_certificate_skips_the_column_only() {
        let oracle = FakeOracle {
            privileged: true,
            owns_group: false,
        };
        let config = CarrierConfig {
            certificates: Some(vec!["zz-not-hex".to_string()]),
            opportunistic: true,
            ..Default::default()
        };
        let outcome = build_update(0, "com.carrier.app", &config, &active_record(), &oracle);
        assert_eq!(outcome.update.carrier_config_access_rules, None);
        // Gated fields still proceed for an authorized package.
        assert_eq!(outcome.update.opportunistic, Some(true));
    }

    #[test]
    fn empty_certificate_list_encodes_empty_rules() {
        let oracle = FakeOracle {
            privileged: false,
            owns_group: false,
        };
        let config = CarrierConfig {
            certificates: Some(Vec::new()),
            ..Default::default()
        };
        let outcome = build_update(0, "com.rogue.app", &config, &active_record(), &oracle);
        let encoded = outcome
            .update
            .carrier_config_access_rules
            .expect("column written")
            .expect("non-null");
        assert_eq!(crate::profiles::decode_rules(&encoded).unwrap(), Vec::new());
    }
}
