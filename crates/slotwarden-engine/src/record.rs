//! Persisted subscription-record model and the store boundary.
//!
//! A subscription record is one addressable subscription's row: card
//! identifier, slot assignment, embedded/removable flags, display name,
//! carrier identity, access rules, group membership, and the operator fields
//! written when a card finishes loading.  This core never deletes rows; a
//! slot losing its card unassigns the row, and a profile vanishing from the
//! secure element clears its embedded flag so a later reinsertion looks like
//! a card coming back.
//!
//! [`RecordUpdate`] is the typed batch patch applied through the store:
//! every field is optional, `Some(None)` clears a nullable column.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::profiles::ProfileClass;
use crate::slot_table::SlotIndex;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Persisted subscription id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub i32);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolved carrier id.  `UNKNOWN` until a resolver assigns one; a resolved
/// id is never overwritten by profile reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CarrierId(pub i32);

impl CarrierId {
    pub const UNKNOWN: CarrierId = CarrierId(-1);

    pub fn is_known(&self) -> bool {
        *self != Self::UNKNOWN
    }
}

impl fmt::Display for CarrierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Display-name source
// ---------------------------------------------------------------------------

/// Origin of a record's display name.  Higher-priority sources are never
/// overwritten by lower-priority ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NameSource {
    Default,
    Sim,
    Carrier,
    User,
}

impl NameSource {
    pub fn priority(&self) -> u8 {
        match self {
            Self::Default => 0,
            Self::Sim => 1,
            Self::Carrier => 2,
            Self::User => 3,
        }
    }
}

// ---------------------------------------------------------------------------
// SubscriptionRecord
// ---------------------------------------------------------------------------

/// One persisted subscription row, restricted to the columns this core
/// reads or writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: SubscriptionId,
    pub iccid: String,
    /// `None` = not inserted in any slot.
    pub slot_index: Option<SlotIndex>,
    pub embedded: bool,
    pub removable: bool,
    pub display_name: Option<String>,
    pub name_source: NameSource,
    pub profile_class: ProfileClass,
    pub carrier_id: CarrierId,
    pub mcc: Option<String>,
    pub mnc: Option<String>,
    /// External identifier of the owning card, when the platform exposes it.
    pub card_eid: Option<String>,
    /// Profile-derived access rules, encoded.
    pub access_rules: Option<String>,
    /// Carrier-certificate-derived access rules, encoded.  Kept separate
    /// from the profile-derived column.
    pub carrier_config_access_rules: Option<String>,
    pub group_uuid: Option<Uuid>,
    pub group_owner: Option<String>,
    pub opportunistic: bool,
    pub operator_numeric: Option<String>,
    pub country_iso: Option<String>,
    pub line_number: Option<String>,
    pub subscriber_id: Option<String>,
    pub ehplmns: Vec<String>,
    pub hplmns: Vec<String>,
    /// Stored allowed-network bitmask, kept as the raw numeric string and
    /// parsed at use so a corrupt value degrades instead of poisoning the
    /// row.
    pub allowed_network_types: Option<String>,
    pub applications_enabled: bool,
}

impl SubscriptionRecord {
    /// A fresh row for `iccid` with every other column at its default.
    pub fn new(id: SubscriptionId, iccid: &str) -> Self {
        Self {
            id,
            iccid: iccid.to_string(),
            slot_index: None,
            embedded: false,
            removable: false,
            display_name: None,
            name_source: NameSource::Default,
            profile_class: ProfileClass::Unset,
            carrier_id: CarrierId::UNKNOWN,
            mcc: None,
            mnc: None,
            card_eid: None,
            access_rules: None,
            carrier_config_access_rules: None,
            group_uuid: None,
            group_owner: None,
            opportunistic: false,
            operator_numeric: None,
            country_iso: None,
            line_number: None,
            subscriber_id: None,
            ehplmns: Vec::new(),
            hplmns: Vec::new(),
            allowed_network_types: None,
            applications_enabled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// RecordUpdate
// ---------------------------------------------------------------------------

/// Typed batch patch for subscription rows.  `None` leaves a column alone;
/// for nullable columns, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub slot_index: Option<Option<SlotIndex>>,
    pub embedded: Option<bool>,
    pub removable: Option<bool>,
    pub display_name: Option<Option<String>>,
    pub name_source: Option<NameSource>,
    pub profile_class: Option<ProfileClass>,
    pub carrier_id: Option<CarrierId>,
    pub mcc: Option<Option<String>>,
    pub mnc: Option<Option<String>>,
    pub card_eid: Option<Option<String>>,
    pub access_rules: Option<Option<String>>,
    pub carrier_config_access_rules: Option<Option<String>>,
    pub group_uuid: Option<Option<Uuid>>,
    pub group_owner: Option<Option<String>>,
    pub opportunistic: Option<bool>,
    pub operator_numeric: Option<Option<String>>,
    pub country_iso: Option<Option<String>>,
    pub line_number: Option<Option<String>>,
    pub subscriber_id: Option<Option<String>>,
    pub associated_plmns: Option<(Vec<String>, Vec<String>)>,
    pub allowed_network_types: Option<Option<String>>,
    pub applications_enabled: Option<bool>,
}

impl RecordUpdate {
    /// Whether the patch writes anything at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the patch to one row.
    pub fn apply(&self, record: &mut SubscriptionRecord) {
        if let Some(v) = &self.slot_index {
            record.slot_index = *v;
        }
        if let Some(v) = self.embedded {
            record.embedded = v;
        }
        if let Some(v) = self.removable {
            record.removable = v;
        }
        if let Some(v) = &self.display_name {
            record.display_name = v.clone();
        }
        if let Some(v) = self.name_source {
            record.name_source = v;
        }
        if let Some(v) = self.profile_class {
            record.profile_class = v;
        }
        if let Some(v) = self.carrier_id {
            record.carrier_id = v;
        }
        if let Some(v) = &self.mcc {
            record.mcc = v.clone();
        }
        if let Some(v) = &self.mnc {
            record.mnc = v.clone();
        }
        if let Some(v) = &self.card_eid {
            record.card_eid = v.clone();
        }
        if let Some(v) = &self.access_rules {
            record.access_rules = v.clone();
        }
        if let Some(v) = &self.carrier_config_access_rules {
            record.carrier_config_access_rules = v.clone();
        }
        if let Some(v) = &self.group_uuid {
            record.group_uuid = *v;
        }
        if let Some(v) = &self.group_owner {
            record.group_owner = v.clone();
        }
        if let Some(v) = self.opportunistic {
            record.opportunistic = v;
        }
        if let Some(v) = &self.operator_numeric {
            record.operator_numeric = v.clone();
        }
        if let Some(v) = &self.country_iso {
            record.country_iso = v.clone();
        }
        if let Some(v) = &self.line_number {
            record.line_number = v.clone();
        }
        if let Some(v) = &self.subscriber_id {
            record.subscriber_id = v.clone();
        }
        if let Some((ehplmns, hplmns)) = &self.associated_plmns {
            record.ehplmns = ehplmns.clone();
            record.hplmns = hplmns.clone();
        }
        if let Some(v) = &self.allowed_network_types {
            record.allowed_network_types = v.clone();
        }
        if let Some(v) = self.applications_enabled {
            record.applications_enabled = v;
        }
    }
}

// ---------------------------------------------------------------------------
// SubscriptionStore
// ---------------------------------------------------------------------------

/// The persisted-record store boundary.  Implementations wrap whatever the
/// platform persists rows in; [`MemorySubscriptionStore`] is the in-process
/// reference implementation.
pub trait SubscriptionStore: Send {
    /// Rows currently assigned to `slot`.
    fn records_for_slot(&self, slot: SlotIndex) -> Vec<SubscriptionRecord>;

    /// The row for `iccid`, assigned or not.
    fn record_for_iccid(&self, iccid: &str) -> Option<SubscriptionRecord>;

    /// Candidate rows for one embedded reconciliation: rows whose identifier
    /// is in `iccids`, plus rows still flagged embedded — except that on a
    /// non-removable card, unreported non-removable rows are presumed
    /// present and excluded.
    fn records_for_embedded_update(
        &self,
        iccids: &[String],
        card_removable: bool,
    ) -> Vec<SubscriptionRecord>;

    /// The active subscription for `slot`, if any.
    fn active_subscription_for_slot(&self, slot: SlotIndex) -> Option<SubscriptionRecord>;

    /// Insert an empty, unassigned placeholder row for `iccid`.  Returns the
    /// existing row's id when one is already present.
    fn insert_placeholder(&mut self, iccid: &str) -> SubscriptionId;

    /// Assign the row for `iccid` to `slot`, creating the row if needed.
    fn attach_to_slot(&mut self, iccid: &str, slot: SlotIndex) -> SubscriptionId;

    /// Unassign every row on `slot`.  Rows are kept, never deleted.
    fn clear_slot(&mut self, slot: SlotIndex);

    /// Apply `update` to the row with `id`.  Returns the number of rows
    /// written.
    fn update_by_subscription(&mut self, id: SubscriptionId, update: &RecordUpdate) -> usize;

    /// Apply `update` to the row for `iccid`.
    fn update_by_iccid(&mut self, iccid: &str, update: &RecordUpdate) -> usize;

    /// Apply `update` to every row whose identifier is in `iccids`.
    fn update_by_iccids(&mut self, iccids: &[String], update: &RecordUpdate) -> usize;

    /// Last subscription observed active on `slot`, used to detect card
    /// changes across loads.
    fn current_subscription_marker(&self, slot: SlotIndex) -> Option<SubscriptionId>;

    fn set_current_subscription_marker(&mut self, slot: SlotIndex, id: Option<SubscriptionId>);

    /// Invalidate any cached active-subscription listing.
    fn refresh_cache(&mut self);
}

// ---------------------------------------------------------------------------
// MemorySubscriptionStore
// ---------------------------------------------------------------------------

/// In-memory reference store over a `BTreeMap`, with deterministic ids.
#[derive(Debug, Default)]
pub struct MemorySubscriptionStore {
    records: BTreeMap<SubscriptionId, SubscriptionRecord>,
    markers: BTreeMap<SlotIndex, SubscriptionId>,
    next_id: i32,
    cache_refreshes: u64,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `refresh_cache` calls, for observability.
    pub fn cache_refreshes(&self) -> u64 {
        self.cache_refreshes
    }

    /// Every row, in id order.
    pub fn all_records(&self) -> Vec<SubscriptionRecord> {
        self.records.values().cloned().collect()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    fn allocate_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }

    fn id_for_iccid(&self, iccid: &str) -> Option<SubscriptionId> {
        self.records
            .values()
            .find(|r| r.iccid == iccid)
            .map(|r| r.id)
    }
}

impl SubscriptionStore for MemorySubscriptionStore {
    fn records_for_slot(&self, slot: SlotIndex) -> Vec<SubscriptionRecord> {
        self.records
            .values()
            .filter(|r| r.slot_index == Some(slot))
            .cloned()
            .collect()
    }

    fn record_for_iccid(&self, iccid: &str) -> Option<SubscriptionRecord> {
        self.records.values().find(|r| r.iccid == iccid).cloned()
    }

    fn records_for_embedded_update(
        &self,
        iccids: &[String],
        card_removable: bool,
    ) -> Vec<SubscriptionRecord> {
        self.records
            .values()
            .filter(|r| {
                iccids.iter().any(|i| *i == r.iccid)
                    || (r.embedded && (card_removable || r.removable))
            })
            .cloned()
            .collect()
    }

    fn active_subscription_for_slot(&self, slot: SlotIndex) -> Option<SubscriptionRecord> {
        self.records
            .values()
            .find(|r| r.slot_index == Some(slot))
            .cloned()
    }

    fn insert_placeholder(&mut self, iccid: &str) -> SubscriptionId {
        if let Some(id) = self.id_for_iccid(iccid) {
            return id;
        }
        let id = self.allocate_id();
        self.records.insert(id, SubscriptionRecord::new(id, iccid));
        id
    }

    fn attach_to_slot(&mut self, iccid: &str, slot: SlotIndex) -> SubscriptionId {
        let id = self.insert_placeholder(iccid);
        if let Some(record) = self.records.get_mut(&id) {
            record.slot_index = Some(slot);
        }
        id
    }

    fn clear_slot(&mut self, slot: SlotIndex) {
        for record in self.records.values_mut() {
            if record.slot_index == Some(slot) {
                record.slot_index = None;
            }
        }
    }

    fn update_by_subscription(&mut self, id: SubscriptionId, update: &RecordUpdate) -> usize {
        match self.records.get_mut(&id) {
            Some(record) => {
                update.apply(record);
                1
            }
            None => 0,
        }
    }

    fn update_by_iccid(&mut self, iccid: &str, update: &RecordUpdate) -> usize {
        match self.id_for_iccid(iccid) {
            Some(id) => self.update_by_subscription(id, update),
            None => 0,
        }
    }

    fn update_by_iccids(&mut self, iccids: &[String], update: &RecordUpdate) -> usize {
        let mut written = 0;
        let ids: Vec<SubscriptionId> = self
            .records
            .values()
            .filter(|r| iccids.iter().any(|i| *i == r.iccid))
            .map(|r| r.id)
            .collect();
        for id in ids {
            written += self.update_by_subscription(id, update);
        }
        written
    }

    fn current_subscription_marker(&self, slot: SlotIndex) -> Option<SubscriptionId> {
        self.markers.get(&slot).copied()
    }

    fn set_current_subscription_marker(&mut self, slot: SlotIndex, id: Option<SubscriptionId>) {
        match id {
            Some(id) => {
                self.markers.insert(slot, id);
            }
            None => {
                self.markers.remove(&slot);
            }
        }
    }

    fn refresh_cache(&mut self) {
        self.cache_refreshes += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
