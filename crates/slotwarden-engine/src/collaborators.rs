//! External collaborator boundaries.
//!
//! Everything the coordinator talks to outside its own state lives behind a
//! trait here and is injected at construction.  The platform glue implements
//! these over the real modem, settings, and broadcast plumbing; tests
//! implement them as fakes.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::profiles::{CardId, CarrierIdentifier};
use crate::record::{CarrierId, SubscriptionId};
use crate::slot_table::{ApplicationState, CardPresence, SimLifecycleState, SlotIndex};

// ---------------------------------------------------------------------------
// Card records
// ---------------------------------------------------------------------------

/// Snapshot of one slot's card records, read on demand.  Any field may be
/// unavailable mid-removal; callers abort silently on the pieces they need.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardRecords {
    /// Raw card identifier, still carrying trailing filler nibbles.
    pub iccid: Option<String>,
    /// Whether the card carries no provisioned applications (boot profile).
    pub empty_profile: bool,
    /// Whether the card's applications are administratively disabled.
    pub applications_disabled: bool,
    pub ehplmns: Vec<String>,
    pub hplmns: Vec<String>,
}

/// Access to per-slot card state owned by the modem layer.  The records read
/// is the expensive one; the scalar queries below are served from the
/// telephony layer's own caches and stay cheap.
pub trait CardAccessor: Send {
    /// Records for the card in `slot`; `None` while the card or its records
    /// are unavailable (removal race, refresh reset).
    fn card_records(&self, slot: SlotIndex) -> Option<CardRecords>;

    /// Public card id backing `slot`, when enumerated.
    fn card_id_for_slot(&self, slot: SlotIndex) -> Option<CardId>;

    /// Every enumerated card id, across all slots.
    fn all_card_ids(&self) -> Vec<CardId>;

    /// Whether the physical slot behind this logical slot is active.
    fn is_slot_active(&self, slot: SlotIndex) -> bool;

    /// Numeric operator id (MCC+MNC) currently served on `slot`.
    fn operator_numeric(&self, slot: SlotIndex) -> Option<String>;

    /// ISO country code currently served on `slot`.
    fn country_iso(&self, slot: SlotIndex) -> Option<String>;

    /// Line number for the subscription on `slot`.
    fn line_number(&self, slot: SlotIndex) -> Option<String>;

    /// Subscriber id (IMSI) for the subscription on `slot`.
    fn subscriber_id(&self, slot: SlotIndex) -> Option<String>;
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// Privilege checks delegated to the platform.
pub trait AuthorizationOracle: Send {
    /// Whether `package` may manage the subscription group `group`.
    fn package_owns_group(&self, group: &Uuid, package: &str) -> bool;

    /// Whether `package` holds carrier privileges on `slot`.
    fn package_has_carrier_privilege(&self, slot: SlotIndex, package: &str) -> bool;

    /// The platform's default carrier-service package, which is never
    /// granted the authorization-gated carrier-config fields.
    fn default_carrier_service_package(&self) -> String;
}

// ---------------------------------------------------------------------------
// Carrier services
// ---------------------------------------------------------------------------

/// Carrier-side reactions to slot state changes: configuration reload,
/// carrier-id resolution, and carrier-app enablement policy.
pub trait CarrierServices: Send {
    /// Re-bind carrier services and reload carrier configuration for `slot`.
    fn refresh_for_slot(&mut self, slot: SlotIndex, state: SimLifecycleState);

    /// Re-resolve the carrier-derived id for `slot`.
    fn resolve_carrier_id(&mut self, slot: SlotIndex, state: SimLifecycleState);

    /// Re-evaluate carrier-app enablement after privilege rules may have
    /// changed.
    fn refresh_carrier_app_enablement(&mut self);

    /// Best-effort carrier-id lookup from an embedded profile's operator
    /// identity.  May be less accurate than the full resolver; reconciliation
    /// only uses it for rows with no resolved id yet.
    fn carrier_id_from_identifier(&self, identifier: &CarrierIdentifier) -> CarrierId;
}

// ---------------------------------------------------------------------------
// Network selection
// ---------------------------------------------------------------------------

/// Preferred-network mode as a radio-access bitmask.  Stored values and the
/// record's allowed set intersect directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkModeMask(pub u64);

impl NetworkModeMask {
    pub const ALL: NetworkModeMask = NetworkModeMask(u64::MAX);

    pub fn intersect(&self, other: NetworkModeMask) -> NetworkModeMask {
        NetworkModeMask(self.0 & other.0)
    }
}

impl fmt::Display for NetworkModeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Network-mode persistence and selection policy, owned by the platform.
pub trait NetworkSelectionPolicy: Send {
    /// Stored preferred mode for a subscription, if one was ever persisted.
    fn stored_network_mode(&self, subscription: SubscriptionId) -> Option<NetworkModeMask>;

    fn store_network_mode(&mut self, subscription: SubscriptionId, mode: NetworkModeMask);

    /// Platform default mode for `slot`, used when nothing is stored.
    fn default_network_mode(&self, slot: SlotIndex) -> NetworkModeMask;

    /// Push the effective mode down to the modem.
    fn set_preferred_network_mode(&mut self, slot: SlotIndex, mode: NetworkModeMask);

    /// Ask the modem to use automatic network selection.
    fn request_automatic_selection(&mut self, slot: SlotIndex);
}

// ---------------------------------------------------------------------------
// Notifications and metrics
// ---------------------------------------------------------------------------

/// Which deduplicated channel a state change went out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StateChangeKind {
    CardState,
    ApplicationState,
}

impl StateChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CardState => "card_state",
            Self::ApplicationState => "application_state",
        }
    }
}

impl fmt::Display for StateChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound notification transport.  The generic lifecycle-state channel is
/// emitted on every handled event; the card-state and application-state
/// channels are change-gated by the notifier.
pub trait NotificationSink: Send {
    /// Generic, always-emitted lifecycle-state notification, with the lock
    /// reason label when one applies.
    fn sim_state_changed(&mut self, slot: SlotIndex, state: SimLifecycleState, reason: Option<&str>);

    fn card_state_changed(&mut self, slot: SlotIndex, state: CardPresence);

    fn application_state_changed(&mut self, slot: SlotIndex, state: ApplicationState);

    /// Fan-out with no payload; listeners re-query the store.
    fn subscription_info_changed(&mut self);

    /// Group membership of the active subscription changed; `None` when the
    /// write batch carried no group assignment.
    fn subscription_group_changed(&mut self, group: Option<Uuid>);

    /// One-time signal: every slot's identifier is known and accounted for.
    fn subscriptions_initialized(&mut self);
}

/// Per-transition metrics hook.
pub trait MetricsRecorder: Send {
    fn state_transition(&mut self, slot: SlotIndex, kind: StateChangeKind, value: &'static str);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
