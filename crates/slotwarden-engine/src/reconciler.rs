//! Embedded-profile set reconciliation.
//!
//! Merges one freshly fetched profile list per card into the persisted
//! records: reported profiles are inserted or updated in place, and
//! previously-embedded rows that are no longer reported get their embedded
//! flag cleared — the row itself is kept, so the profile coming back later
//! looks like a card being reinserted.
//!
//! The returned `changed` flag is an over-approximation: it is set whenever
//! a reported profile is processed, without comparing the row's before and
//! after contents.  Consumers treat it as an optimization hint only.
//!
//! Runs entirely on the control loop; the blocking fetches that produce the
//! batch happen on the background worker.

use crate::collaborators::CarrierServices;
use crate::profiles::{
    encode_rules, CardId, EmbeddedProfile, ProfileFetchResult, SecureElementClient,
};
use crate::record::{CarrierId, NameSource, RecordUpdate, SubscriptionStore};

const COMPONENT: &str = "profile_reconciler";

/// Apply a batch of per-card fetch results.  Returns the OR of the per-card
/// change flags; the caller decides whether to fan out a change
/// notification.
pub fn apply_fetch_batch(
    store: &mut dyn SubscriptionStore,
    secure_element: &dyn SecureElementClient,
    carrier: &dyn CarrierServices,
    batch: &[(CardId, Option<ProfileFetchResult>)],
) -> bool {
    let mut changed = false;
    for (card_id, result) in batch {
        match result {
            Some(result) => {
                if apply_fetch_result(store, secure_element, carrier, *card_id, result) {
                    changed = true;
                }
            }
            None => {
                // Transport to the secure element failed; leave records as
                // they are.
                log::debug!("{COMPONENT}: no result for card {card_id}");
            }
        }
    }
    changed
}

/// Reconcile one card's fetch result against the store.
fn apply_fetch_result(
    store: &mut dyn SubscriptionStore,
    secure_element: &dyn SecureElementClient,
    carrier: &dyn CarrierServices,
    card_id: CardId,
    result: &ProfileFetchResult,
) -> bool {
    let profiles = match (&result.code, &result.profiles) {
        (code, Some(profiles)) if code.is_ok() => profiles,
        _ => {
            log::debug!(
                "{COMPONENT}: fetch for card {card_id} returned {:?}, profile list present: {}",
                result.code,
                result.profiles.is_some()
            );
            return false;
        }
    };

    let card_removable = result.removable;
    let reported: Vec<String> = profiles.iter().map(|p| p.iccid.clone()).collect();
    log::debug!(
        "{COMPONENT}: card {card_id} reported {} profile(s)",
        reported.len()
    );

    // Working set of rows to account for.  Rows still here after every
    // reported profile is processed were embedded but are gone now.
    let mut existing = store.records_for_embedded_update(&reported, card_removable);

    let mut changed = false;
    for profile in profiles {
        let mut prev_name_source = NameSource::Default;
        let mut prev_carrier_id = CarrierId::UNKNOWN;
        match existing.iter().position(|r| r.iccid == profile.iccid) {
            Some(index) => {
                let matched = existing.remove(index);
                prev_name_source = matched.name_source;
                prev_carrier_id = matched.carrier_id;
            }
            None => {
                store.insert_placeholder(&profile.iccid);
            }
        }

        let update = profile_update(
            secure_element,
            carrier,
            card_id,
            card_removable,
            profile,
            prev_name_source,
            prev_carrier_id,
        );
        store.update_by_iccid(&profile.iccid, &update);
        store.refresh_cache();
        changed = true;
    }

    // Soft-delete: clear the embedded flag on rows no longer reported, keep
    // the rows.
    let vanished: Vec<String> = existing
        .iter()
        .filter(|r| r.embedded)
        .map(|r| r.iccid.clone())
        .collect();
    if !vanished.is_empty() {
        log::debug!(
            "{COMPONENT}: clearing embedded flag on {} vanished profile(s)",
            vanished.len()
        );
        let update = RecordUpdate {
            embedded: Some(false),
            ..Default::default()
        };
        store.update_by_iccids(&vanished, &update);
        store.refresh_cache();
        changed = true;
    }

    changed
}

/// Build the field patch for one reported profile.
fn profile_update(
    secure_element: &dyn SecureElementClient,
    carrier: &dyn CarrierServices,
    card_id: CardId,
    card_removable: bool,
    profile: &EmbeddedProfile,
    prev_name_source: NameSource,
    prev_carrier_id: CarrierId,
) -> RecordUpdate {
    let mut update = RecordUpdate {
        embedded: Some(true),
        removable: Some(card_removable),
        profile_class: Some(profile.profile_class),
        ..Default::default()
    };

    if profile.access_rules.is_empty() {
        update.access_rules = Some(None);
    } else {
        match encode_rules(&profile.access_rules) {
            Ok(encoded) => update.access_rules = Some(Some(encoded)),
            Err(err) => {
                log::warn!(
                    "{COMPONENT}: dropping unencodable access rules for {}: {err}",
                    profile.iccid
                );
            }
        }
    }

    // A carrier-sourced name must not downgrade a higher-priority one.
    if prev_name_source.priority() <= NameSource::Carrier.priority() {
        update.display_name = Some(Some(profile.nickname.clone()));
        update.name_source = Some(NameSource::Carrier);
    }

    if let Some(identifier) = &profile.carrier_identifier {
        // The identifier-derived carrier id is approximate; never overwrite
        // a resolved one.
        if !prev_carrier_id.is_known() {
            update.carrier_id = Some(carrier.carrier_id_from_identifier(identifier));
        }
        update.mcc = Some(Some(identifier.mcc.clone()));
        update.mnc = Some(Some(identifier.mnc.clone()));
    }

    if card_id.is_valid() && secure_element.card_id_supported() {
        if let Some(eid) = secure_element.eid_for_card(card_id) {
            update.card_eid = Some(Some(eid));
        }
    }

    update
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CarrierServices;
    use crate::profiles::{
        AccessRule, CarrierIdentifier, FetchResultCode, ProfileClass, ProfileFetchResult,
    };
    use crate::record::{CarrierId, MemorySubscriptionStore, SubscriptionStore};
    use crate::slot_table::{SimLifecycleState, SlotIndex};

    // -- helpers ------------------------------------------------------------

    struct FakeSecureElement {
        enabled: bool,
        card_id_supported: bool,
        eid: Option<String>,
    }

    impl Default for FakeSecureElement {
        fn default() -> Self {
            Self {
                enabled: true,
                card_id_supported: true,
                eid: Some("89049032000000000000000000001234".to_string()),
            }
        }
    }

    impl SecureElementClient for FakeSecureElement {
        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn fetch_profiles(&self, _card_id: CardId) -> Option<ProfileFetchResult> {
            None
        }

        fn card_id_supported(&self) -> bool {
            self.card_id_supported
        }

        fn eid_for_card(&self, _card_id: CardId) -> Option<String> {
            self.eid.clone()
        }
    }

    struct FakeCarrierServices;

    impl CarrierServices for FakeCarrierServices {
        fn refresh_for_slot(&mut self, _: SlotIndex, _: SimLifecycleState) {}
        fn resolve_carrier_id(&mut self, _: SlotIndex, _: SimLifecycleState) {}
        fn refresh_carrier_app_enablement(&mut self) {}

        fn carrier_id_from_identifier(&self, identifier: &CarrierIdentifier) -> CarrierId {
            // Deterministic fake: mcc*100 + mnc.
            let mcc: i32 = identifier.mcc.parse().unwrap_or(0);
            let mnc: i32 = identifier.mnc.parse().unwrap_or(0);
            CarrierId(mcc * 100 + mnc)
        }
    }

    fn profile(iccid: &str, nickname: &str) -> EmbeddedProfile {
        EmbeddedProfile {
            iccid: iccid.to_string(),
            nickname: nickname.to_string(),
            profile_class: ProfileClass::Operational,
            carrier_identifier: Some(CarrierIdentifier {
                mcc: "310".to_string(),
                mnc: "260".to_string(),
            }),
            access_rules: vec![AccessRule::from_certificate_der(b"carrier-cert")],
        }
    }

    fn ok_result(profiles: Vec<EmbeddedProfile>, removable: bool) -> ProfileFetchResult {
        ProfileFetchResult {
            code: FetchResultCode::Ok,
            profiles: Some(profiles),
            removable,
        }
    }

    fn reconcile(
        store: &mut MemorySubscriptionStore,
        card_id: CardId,
        result: Option<ProfileFetchResult>,
    ) -> bool {
        apply_fetch_batch(
            store,
            &FakeSecureElement::default(),
            &FakeCarrierServices,
            &[(card_id, result)],
        )
    }

    // -- insert / update ----------------------------------------------------

    #[test]
    fn new_profile_inserts_placeholder_and_fills_fields() {
        let mut store = MemorySubscriptionStore::new();
        let changed = reconcile(
            &mut store,
            CardId(1),
            Some(ok_result(vec![profile("icc-1", "Blue Plan")], true)),
        );
        assert!(changed);

        let record = store.record_for_iccid("icc-1").unwrap();
        assert!(record.embedded);
        assert!(record.removable);
        assert_eq!(record.display_name.as_deref(), Some("Blue Plan"));
        assert_eq!(record.name_source, NameSource::Carrier);
        assert_eq!(record.profile_class, ProfileClass::Operational);
        assert_eq!(record.carrier_id, CarrierId(31260));
        assert_eq!(record.mcc.as_deref(), Some("310"));
        assert_eq!(record.mnc.as_deref(), Some("260"));
        assert!(record.access_rules.is_some());
        assert!(record.card_eid.is_some());
        // Reported but not inserted in any slot.
        assert_eq!(record.slot_index, None);
    }

    #[test]
    fn second_identical_refresh_leaves_fields_stable_but_still_reports_change() {
        let mut store = MemorySubscriptionStore::new();
        let result = ok_result(vec![profile("icc-1", "Blue Plan")], true);

        assert!(reconcile(&mut store, CardId(1), Some(result.clone())));
        let first = store.record_for_iccid("icc-1").unwrap();

        // Unchanged list: `changed` still true (over-approximation), fields
        // byte-identical.
        assert!(reconcile(&mut store, CardId(1), Some(result)));
        let second = store.record_for_iccid("icc-1").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn user_set_name_is_not_downgraded() {
        let mut store = MemorySubscriptionStore::new();
        store.insert_placeholder("icc-1");
        store.update_by_iccid(
            "icc-1",
            &RecordUpdate {
                display_name: Some(Some("My SIM".to_string())),
                name_source: Some(NameSource::User),
                ..Default::default()
            },
        );

        reconcile(
            &mut store,
            CardId(1),
            Some(ok_result(vec![profile("icc-1", "Carrier Name")], true)),
        );

        let record = store.record_for_iccid("icc-1").unwrap();
        assert_eq!(record.display_name.as_deref(), Some("My SIM"));
        assert_eq!(record.name_source, NameSource::User);
    }

    #[test]
    fn resolved_carrier_id_is_never_overwritten() {
        let mut store = MemorySubscriptionStore::new();
        store.insert_placeholder("icc-1");
        store.update_by_iccid(
            "icc-1",
            &RecordUpdate {
                carrier_id: Some(CarrierId(42)),
                ..Default::default()
            },
        );

        reconcile(
            &mut store,
            CardId(1),
            Some(ok_result(vec![profile("icc-1", "n")], true)),
        );
        assert_eq!(store.record_for_iccid("icc-1").unwrap().carrier_id, CarrierId(42));
    }

    #[test]
    fn empty_rule_list_clears_the_column() {
        let mut store = MemorySubscriptionStore::new();
        let mut p = profile("icc-1", "n");
        p.access_rules.clear();
        reconcile(&mut store, CardId(1), Some(ok_result(vec![p], true)));
        assert_eq!(store.record_for_iccid("icc-1").unwrap().access_rules, None);
    }

    // -- soft delete / reinsert ---------------------------------------------

    #[test]
    fn vanished_profile_is_soft_deleted_and_row_reused() {
        let mut store = MemorySubscriptionStore::new();
        reconcile(
            &mut store,
            CardId(1),
            Some(ok_result(
                vec![profile("icc-1", "a"), profile("icc-2", "b")],
                true,
            )),
        );
        assert_eq!(store.record_count(), 2);

        // icc-2 no longer reported.
        assert!(reconcile(
            &mut store,
            CardId(1),
            Some(ok_result(vec![profile("icc-1", "a")], true)),
        ));
        let gone = store.record_for_iccid("icc-2").unwrap();
        assert!(!gone.embedded);
        assert_eq!(store.record_count(), 2);

        // Reinsertion reuses the row instead of duplicating it.
        reconcile(
            &mut store,
            CardId(1),
            Some(ok_result(
                vec![profile("icc-1", "a"), profile("icc-2", "b")],
                true,
            )),
        );
        assert!(store.record_for_iccid("icc-2").unwrap().embedded);
        assert_eq!(store.record_count(), 2);
    }

    #[test]
    fn pinned_profiles_survive_on_non_removable_card() {
        let mut store = MemorySubscriptionStore::new();
        // Two profiles on a non-removable card.
        reconcile(
            &mut store,
            CardId(1),
            Some(ok_result(
                vec![profile("icc-1", "a"), profile("icc-2", "b")],
                false,
            )),
        );
        // icc-2 not reported this time; on a non-removable card it is
        // presumed present and keeps its embedded flag.
        reconcile(
            &mut store,
            CardId(1),
            Some(ok_result(vec![profile("icc-1", "a")], false)),
        );
        assert!(store.record_for_iccid("icc-2").unwrap().embedded);
    }

    // -- failure paths ------------------------------------------------------

    #[test]
    fn error_result_touches_nothing() {
        let mut store = MemorySubscriptionStore::new();
        reconcile(
            &mut store,
            CardId(1),
            Some(ok_result(vec![profile("icc-1", "a")], true)),
        );
        let before = store.all_records();

        assert!(!reconcile(
            &mut store,
            CardId(1),
            Some(ProfileFetchResult {
                code: FetchResultCode::Failure { code: 3 },
                profiles: Some(Vec::new()),
                removable: true,
            }),
        ));
        assert!(!reconcile(
            &mut store,
            CardId(1),
            Some(ProfileFetchResult {
                code: FetchResultCode::Ok,
                profiles: None,
                removable: true,
            }),
        ));
        assert!(!reconcile(&mut store, CardId(1), None));
        assert_eq!(store.all_records(), before);
    }

    #[test]
    fn batch_ors_per_card_changes() {
        let mut store = MemorySubscriptionStore::new();
        let batch = vec![
            (CardId(1), None),
            (CardId(2), Some(ok_result(vec![profile("icc-9", "x")], true))),
        ];
        assert!(apply_fetch_batch(
            &mut store,
            &FakeSecureElement::default(),
            &FakeCarrierServices,
            &batch,
        ));
    }

    #[test]
    fn eid_written_only_when_supported_and_card_valid() {
        let mut store = MemorySubscriptionStore::new();
        let se = FakeSecureElement {
            card_id_supported: false,
            ..Default::default()
        };
        apply_fetch_batch(
            &mut store,
            &se,
            &FakeCarrierServices,
            &[(CardId(1), Some(ok_result(vec![profile("icc-1", "a")], true)))],
        );
        assert_eq!(store.record_for_iccid("icc-1").unwrap().card_eid, None);

        let mut store = MemorySubscriptionStore::new();
        apply_fetch_batch(
            &mut store,
            &FakeSecureElement::default(),
            &FakeCarrierServices,
            &[(
                CardId::UNINITIALIZED,
                Some(ok_result(vec![profile("icc-1", "a")], true)),
            )],
        );
        assert_eq!(store.record_for_iccid("icc-1").unwrap().card_eid, None);
    }
}
