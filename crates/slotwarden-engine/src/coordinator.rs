//! Per-slot card lifecycle state machine.
//!
//! `SlotCoordinator` owns the slot table, the change notifier, the
//! initialization latch, and every injected collaborator.  One handler per
//! card-status event implements the transition logic; all of it runs on the
//! control-loop thread, one event at a time, so no field here needs a lock.
//!
//! States per slot:
//! `Unknown -> {Absent, IoError, Restricted, NotReady, Locked, Ready,
//!  Loaded, ImsiUpdated}`.
//! None are terminal; any event can re-fire after `Absent`.
//!
//! A card, its records, or its identifier can vanish mid-handler during
//! removal or refresh.  Those are expected races: the handler aborts early,
//! silently, with no mutation and no notification.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::carrier_config::{self, CarrierConfig};
use crate::collaborators::{
    CardAccessor, CarrierServices, MetricsRecorder, NetworkSelectionPolicy, NetworkModeMask,
    NotificationSink,
};
use crate::notifier::ChangeNotifier;
use crate::profiles::{CardId, ProfileFetchResult, SecureElementClient};
use crate::reconciler;
use crate::record::{RecordUpdate, SubscriptionRecord, SubscriptionStore};
use crate::slot_table::{
    strip_trailing_filler, ApplicationState, CardPresence, LockReason, SimLifecycleState,
    SlotIndex, SlotSnapshot, SlotTable, NO_CARD_ICCID,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const COMPONENT: &str = "slot_coordinator";

/// Default number of slots the platform can ever host.
const DEFAULT_SUPPORTED_SLOT_COUNT: usize = 2;

/// Default number of slots active at startup.
const DEFAULT_ACTIVE_SLOT_COUNT: usize = 2;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Static coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Table size; fixed for the process lifetime.
    pub supported_slot_count: usize,
    /// Active window at startup; adjusted by modem-config changes.
    pub active_slot_count: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            supported_slot_count: DEFAULT_SUPPORTED_SLOT_COUNT,
            active_slot_count: DEFAULT_ACTIVE_SLOT_COUNT,
        }
    }
}

/// Construction-time configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigError {
    /// The table must host at least one slot.
    NoSlots,
    /// The active window cannot exceed the table size.
    ActiveExceedsSupported { active: usize, supported: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSlots => write!(f, "at least one slot is required"),
            Self::ActiveExceedsSupported { active, supported } => {
                write!(
                    f,
                    "active slot count {active} exceeds supported slot count {supported}"
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Stable error codes.
pub fn error_code(err: &ConfigError) -> &'static str {
    match err {
        ConfigError::NoSlots => "SW_NO_SLOTS",
        ConfigError::ActiveExceedsSupported { .. } => "SW_ACTIVE_EXCEEDS_SUPPORTED",
    }
}

// ---------------------------------------------------------------------------
// Input events
// ---------------------------------------------------------------------------

/// One card-status event from the modem layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CardStatusEvent {
    Absent {
        slot: SlotIndex,
        /// The slot is both empty and deactivated; its logical index is no
        /// longer meaningful, so notifications are skipped.
        absent_and_inactive: bool,
    },
    Unknown {
        slot: SlotIndex,
    },
    IoError {
        slot: SlotIndex,
    },
    Restricted {
        slot: SlotIndex,
    },
    NotReady {
        slot: SlotIndex,
    },
    Locked {
        slot: SlotIndex,
        reason: String,
    },
    Ready {
        slot: SlotIndex,
    },
    Loaded {
        slot: SlotIndex,
    },
    ImsiUpdated {
        slot: SlotIndex,
    },
}

impl CardStatusEvent {
    /// Map a raw status label from the card-status channel to an event.
    /// Unrecognized labels yield `None`; the platform glue logs and drops
    /// them.
    pub fn from_status_label(
        label: &str,
        reason: Option<&str>,
        slot: SlotIndex,
        absent_and_inactive: bool,
    ) -> Option<Self> {
        match label {
            "ABSENT" => Some(Self::Absent {
                slot,
                absent_and_inactive,
            }),
            "UNKNOWN" => Some(Self::Unknown { slot }),
            "CARD_IO_ERROR" => Some(Self::IoError { slot }),
            "CARD_RESTRICTED" => Some(Self::Restricted { slot }),
            "NOT_READY" => Some(Self::NotReady { slot }),
            "LOCKED" => Some(Self::Locked {
                slot,
                reason: reason.unwrap_or_default().to_string(),
            }),
            "READY" => Some(Self::Ready { slot }),
            "LOADED" => Some(Self::Loaded { slot }),
            "IMSI" => Some(Self::ImsiUpdated { slot }),
            _ => None,
        }
    }

    pub fn slot(&self) -> SlotIndex {
        match self {
            Self::Absent { slot, .. }
            | Self::Unknown { slot }
            | Self::IoError { slot }
            | Self::Restricted { slot }
            | Self::NotReady { slot }
            | Self::Locked { slot, .. }
            | Self::Ready { slot }
            | Self::Loaded { slot }
            | Self::ImsiUpdated { slot } => *slot,
        }
    }
}

// ---------------------------------------------------------------------------
// Structured journal
// ---------------------------------------------------------------------------

/// Logical event time: a per-coordinator tick, bumped once per processed
/// command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalTick(pub u64);

impl fmt::Display for LogicalTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One structured journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorEvent {
    pub component: String,
    pub event: String,
    pub slot: Option<SlotIndex>,
    pub outcome: String,
    pub detail: Option<String>,
    pub tick: LogicalTick,
}

// ---------------------------------------------------------------------------
// Refresh plumbing
// ---------------------------------------------------------------------------

/// One-shot continuation resolved with the aggregate `changed` flag after a
/// refresh reconciles.  Runs on the control-loop thread, exactly once.
pub type RefreshCallback = Box<dyn FnOnce(bool) + Send>;

/// A fetch the control loop wants the background worker to perform.
pub struct FetchRequest {
    pub card_ids: Vec<CardId>,
    pub callback: Option<RefreshCallback>,
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("card_ids", &self.card_ids)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// Injected collaborators.  The secure-element client is shared with the
/// background worker and therefore arrives as an `Arc`.
pub struct CoordinatorDeps {
    pub store: Box<dyn SubscriptionStore>,
    pub cards: Box<dyn CardAccessor>,
    pub secure_element: Arc<dyn SecureElementClient>,
    pub auth: Box<dyn crate::collaborators::AuthorizationOracle>,
    pub carrier: Box<dyn CarrierServices>,
    pub network: Box<dyn NetworkSelectionPolicy>,
    pub sink: Box<dyn NotificationSink>,
    pub metrics: Box<dyn MetricsRecorder>,
}

// ---------------------------------------------------------------------------
// SlotCoordinator
// ---------------------------------------------------------------------------

/// The per-slot lifecycle state machine.
pub struct SlotCoordinator {
    slots: SlotTable,
    notifier: ChangeNotifier,
    store: Box<dyn SubscriptionStore>,
    cards: Box<dyn CardAccessor>,
    secure_element: Arc<dyn SecureElementClient>,
    auth: Box<dyn crate::collaborators::AuthorizationOracle>,
    carrier: Box<dyn CarrierServices>,
    network: Box<dyn NetworkSelectionPolicy>,
    sink: Box<dyn NotificationSink>,
    metrics: Box<dyn MetricsRecorder>,
    store_initialized: bool,
    pending_fetches: Vec<FetchRequest>,
    events: Vec<CoordinatorEvent>,
    tick: u64,
}

impl SlotCoordinator {
    pub fn new(config: CoordinatorConfig, deps: CoordinatorDeps) -> Result<Self, ConfigError> {
        if config.supported_slot_count == 0 || config.active_slot_count == 0 {
            return Err(ConfigError::NoSlots);
        }
        if config.active_slot_count > config.supported_slot_count {
            return Err(ConfigError::ActiveExceedsSupported {
                active: config.active_slot_count,
                supported: config.supported_slot_count,
            });
        }
        Ok(Self {
            slots: SlotTable::new(config.supported_slot_count, config.active_slot_count),
            notifier: ChangeNotifier::new(config.supported_slot_count),
            store: deps.store,
            cards: deps.cards,
            secure_element: deps.secure_element,
            auth: deps.auth,
            carrier: deps.carrier,
            network: deps.network,
            sink: deps.sink,
            metrics: deps.metrics,
            store_initialized: false,
            pending_fetches: Vec::new(),
            events: Vec::new(),
            tick: 0,
        })
    }

    // -- observers ----------------------------------------------------------

    pub fn active_slot_count(&self) -> usize {
        self.slots.active_slot_count()
    }

    pub fn snapshot(&self, slot: SlotIndex) -> Option<SlotSnapshot> {
        self.slots.snapshot(slot)
    }

    pub fn snapshots(&self) -> Vec<SlotSnapshot> {
        self.slots.snapshots()
    }

    /// Whether every slot's identifier is known and accounted for.
    pub fn is_initialized(&self) -> bool {
        self.store_initialized
    }

    /// Structured journal, oldest first.
    pub fn events(&self) -> &[CoordinatorEvent] {
        &self.events
    }

    pub fn store(&self) -> &dyn SubscriptionStore {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn SubscriptionStore {
        self.store.as_mut()
    }

    /// Clone of the secure-element handle, for the background worker.
    pub fn secure_element_handle(&self) -> Arc<dyn SecureElementClient> {
        Arc::clone(&self.secure_element)
    }

    /// Drain fetch requests queued by the handlers since the last call.
    pub fn take_pending_fetches(&mut self) -> Vec<FetchRequest> {
        std::mem::take(&mut self.pending_fetches)
    }

    // -- event entry points -------------------------------------------------

    /// Process one card-status event.  Runs synchronously; any embedded
    /// refresh it needs is queued for the background worker.
    pub fn handle_card_status(&mut self, event: CardStatusEvent) {
        self.tick += 1;
        let slot = event.slot();
        if !self.slots.is_valid(slot) {
            log::error!("{COMPONENT}: event {event:?} for invalid slot {slot}");
            self.push_event("card_status", Some(slot), "error", Some("invalid slot".into()));
            return;
        }
        log::debug!("{COMPONENT}: handling {event:?}");
        match event {
            CardStatusEvent::Absent {
                slot,
                absent_and_inactive,
            } => self.handle_absent(slot, absent_and_inactive),
            CardStatusEvent::Unknown { slot } => self.handle_unknown(slot),
            CardStatusEvent::IoError { slot } => self.handle_io_error(slot),
            CardStatusEvent::Restricted { slot } => self.handle_restricted(slot),
            CardStatusEvent::NotReady { slot } => self.handle_not_ready(slot),
            CardStatusEvent::Locked { slot, reason } => self.handle_locked(slot, &reason),
            CardStatusEvent::Ready { slot } => self.handle_ready(slot),
            CardStatusEvent::Loaded { slot } => self.handle_loaded(slot),
            CardStatusEvent::ImsiUpdated { slot } => self.handle_imsi_updated(slot),
        }
    }

    /// Shrink (or grow) the active window.  Slots beyond the new window lose
    /// their record assignments and cached state.
    pub fn handle_modem_config_changed(&mut self, active_slot_count: usize) {
        self.tick += 1;
        let supported = self.slots.supported_slot_count();
        for slot in active_slot_count.min(supported)..supported {
            self.store.clear_slot(slot);
            self.slots.reset(slot);
            self.notifier.reset(slot);
        }
        self.slots.set_active_slot_count(active_slot_count);
        self.push_event(
            "modem_config_changed",
            None,
            "ok",
            Some(format!("active={}", self.slots.active_slot_count())),
        );
    }

    /// Queue an embedded-profile refresh for `card_ids`.  With the embedded
    /// subsystem disabled this resolves the callback immediately with
    /// `false` and touches nothing.
    pub fn request_embedded_refresh(
        &mut self,
        card_ids: Vec<CardId>,
        callback: Option<RefreshCallback>,
    ) {
        if !self.secure_element.is_enabled() {
            log::debug!("{COMPONENT}: embedded subsystem disabled, skipping refresh");
            self.push_event("embedded_refresh", None, "skipped", Some("disabled".into()));
            if let Some(callback) = callback {
                callback(false);
            }
            return;
        }
        self.pending_fetches.push(FetchRequest { card_ids, callback });
    }

    /// Fold one completed fetch batch back into the store.  Runs on the
    /// control loop; fires the optional callback exactly once.
    pub fn complete_embedded_refresh(
        &mut self,
        results: Vec<(CardId, Option<ProfileFetchResult>)>,
        callback: Option<RefreshCallback>,
    ) {
        self.tick += 1;
        let changed = reconciler::apply_fetch_batch(
            self.store.as_mut(),
            self.secure_element.as_ref(),
            self.carrier.as_ref(),
            &results,
        );
        self.push_event(
            "embedded_refresh",
            None,
            "ok",
            Some(format!("cards={} changed={changed}", results.len())),
        );
        if changed {
            self.sink.subscription_info_changed();
        }
        if let Some(callback) = callback {
            callback(changed);
        }
    }

    /// Apply carrier-driven fields onto the slot's active subscription.
    pub fn apply_carrier_config(&mut self, slot: SlotIndex, package: &str, config: &CarrierConfig) {
        self.tick += 1;
        if !self.slots.is_valid(slot) || package.is_empty() {
            log::debug!(
                "{COMPONENT}: carrier config rejected: slot {slot}, package {package:?}"
            );
            self.push_event(
                "carrier_config",
                Some(slot),
                "skipped",
                Some("precondition".into()),
            );
            return;
        }
        let Some(current) = self.store.active_subscription_for_slot(slot) else {
            log::debug!("{COMPONENT}: no active subscription on slot {slot}");
            self.push_event(
                "carrier_config",
                Some(slot),
                "skipped",
                Some("no active subscription".into()),
            );
            return;
        };

        let outcome =
            carrier_config::build_update(slot, package, config, &current, self.auth.as_ref());
        if outcome.update.is_empty() {
            self.push_event("carrier_config", Some(slot), "ok", Some("no-op".into()));
            return;
        }
        if self.store.update_by_subscription(current.id, &outcome.update) > 0 {
            self.store.refresh_cache();
            self.sink.subscription_info_changed();
            self.sink.subscription_group_changed(outcome.group_for_notify);
            self.push_event("carrier_config", Some(slot), "ok", None);
        }
    }

    // -- per-event handlers -------------------------------------------------

    fn handle_absent(&mut self, slot: SlotIndex, absent_and_inactive: bool) {
        if self
            .slots
            .card_identifier(slot)
            .is_some_and(|iccid| iccid != NO_CARD_ICCID)
        {
            log::debug!(
                "{COMPONENT}: slot {slot} hot plug out, absent_and_inactive={absent_and_inactive}"
            );
        }
        self.slots
            .set_card_identifier(slot, Some(NO_CARD_ICCID.to_string()));
        self.reconcile_slot(slot, true);
        // An absent-and-inactive slot no longer maps to a meaningful logical
        // index; stay quiet.
        if !absent_and_inactive {
            self.sink
                .sim_state_changed(slot, SimLifecycleState::Absent, None);
            self.notify_card_state(slot, CardPresence::Absent);
            self.notify_application_state(slot, ApplicationState::Unknown);
            self.refresh_carrier(slot, SimLifecycleState::Absent);
        }
        self.push_event("sim_absent", Some(slot), "ok", None);
    }

    fn handle_unknown(&mut self, slot: SlotIndex) {
        self.sink
            .sim_state_changed(slot, SimLifecycleState::Unknown, None);
        self.notify_card_state(slot, CardPresence::Unknown);
        self.notify_application_state(slot, ApplicationState::Unknown);
        self.refresh_carrier(slot, SimLifecycleState::Unknown);
        self.push_event("sim_unknown", Some(slot), "ok", None);
    }

    fn handle_io_error(&mut self, slot: SlotIndex) {
        if self
            .slots
            .card_identifier(slot)
            .is_some_and(|iccid| iccid != NO_CARD_ICCID)
        {
            log::debug!("{COMPONENT}: slot {slot} card error");
        }
        self.slots
            .set_card_identifier(slot, Some(NO_CARD_ICCID.to_string()));
        self.reconcile_slot(slot, true);
        self.sink.sim_state_changed(
            slot,
            SimLifecycleState::IoError,
            Some(SimLifecycleState::IoError.as_str()),
        );
        self.notify_card_state(slot, CardPresence::IoError);
        self.notify_application_state(slot, ApplicationState::NotReady);
        self.refresh_carrier(slot, SimLifecycleState::IoError);
        self.push_event("sim_io_error", Some(slot), "ok", None);
    }

    fn handle_restricted(&mut self, slot: SlotIndex) {
        self.sink.sim_state_changed(
            slot,
            SimLifecycleState::Restricted,
            Some(SimLifecycleState::Restricted.as_str()),
        );
        self.notify_card_state(slot, CardPresence::Restricted);
        self.notify_application_state(slot, ApplicationState::NotReady);
        self.refresh_carrier(slot, SimLifecycleState::Restricted);
        self.push_event("sim_restricted", Some(slot), "ok", None);
    }

    fn handle_not_ready(&mut self, slot: SlotIndex) {
        // An embedded card with no active profile never becomes ready, so
        // the profile cache refresh has to happen from here.
        let card_id = self
            .cards
            .card_id_for_slot(slot)
            .unwrap_or(CardId::UNINITIALIZED);
        self.request_embedded_refresh(vec![card_id], None);

        let records = self.cards.card_records(slot);
        let terminal = records
            .as_ref()
            .is_some_and(|r| r.empty_profile || r.applications_disabled);
        if terminal {
            // No provisioned applications, or applications administratively
            // disabled: the subscription list is already accessible, so
            // treat this like an absent card.
            self.slots
                .set_card_identifier(slot, Some(NO_CARD_ICCID.to_string()));
            self.reconcile_slot(slot, false);
        }

        self.sink
            .sim_state_changed(slot, SimLifecycleState::NotReady, None);
        self.notify_card_state(slot, CardPresence::Present);
        self.notify_application_state(slot, ApplicationState::NotReady);
        if terminal {
            self.refresh_carrier(slot, SimLifecycleState::NotReady);
        }
        self.push_event(
            "sim_not_ready",
            Some(slot),
            "ok",
            Some(format!("terminal={terminal}")),
        );
    }

    fn handle_locked(&mut self, slot: SlotIndex, reason: &str) {
        if self.slots.card_identifier(slot) == Some(NO_CARD_ICCID) {
            // A locked event on a slot we thought empty is a hot plug-in;
            // forget the sentinel so the identifier gets re-read.
            log::debug!("{COMPONENT}: slot {slot} hot plug in");
            self.slots.set_card_identifier(slot, None);
        }

        if self.slots.card_identifier(slot).is_none() {
            let Some(records) = self.cards.card_records(slot) else {
                log::debug!("{COMPONENT}: locked: no card records for slot {slot}");
                self.push_event("sim_locked", Some(slot), "skipped", Some("no records".into()));
                return;
            };
            let Some(raw) = records.iccid else {
                log::debug!("{COMPONENT}: locked: no identifier for slot {slot}");
                self.push_event(
                    "sim_locked",
                    Some(slot),
                    "skipped",
                    Some("no identifier".into()),
                );
                return;
            };
            let Some(iccid) = strip_trailing_filler(&raw) else {
                log::debug!("{COMPONENT}: locked: blank identifier for slot {slot}");
                self.push_event(
                    "sim_locked",
                    Some(slot),
                    "skipped",
                    Some("blank identifier".into()),
                );
                return;
            };
            self.slots.set_card_identifier(slot, Some(iccid));
        } else {
            log::debug!("{COMPONENT}: locked: identifier already known for slot {slot}");
        }

        self.reconcile_slot(slot, true);

        self.sink
            .sim_state_changed(slot, SimLifecycleState::Locked, Some(reason));
        self.notify_card_state(slot, CardPresence::Present);
        let application_state = match LockReason::from_label(reason) {
            Some(lock) => lock.application_state(),
            None => {
                log::error!("{COMPONENT}: unrecognized lock reason {reason:?}");
                ApplicationState::Unknown
            }
        };
        self.notify_application_state(slot, application_state);
        self.refresh_carrier(slot, SimLifecycleState::Locked);
        self.push_event("sim_locked", Some(slot), "ok", Some(reason.to_string()));
    }

    fn handle_ready(&mut self, slot: SlotIndex) {
        let card_id = self
            .cards
            .card_id_for_slot(slot)
            .unwrap_or(CardId::UNINITIALIZED);
        self.request_embedded_refresh(vec![card_id], None);
        self.sink
            .sim_state_changed(slot, SimLifecycleState::Ready, None);
        self.notify_card_state(slot, CardPresence::Present);
        self.notify_application_state(slot, ApplicationState::NotReady);
        self.push_event("sim_ready", Some(slot), "ok", None);
    }

    fn handle_loaded(&mut self, slot: SlotIndex) {
        // The card should be loaded here, but a removal or refresh reset can
        // still race us; bail without side effects.
        let Some(records) = self.cards.card_records(slot) else {
            log::debug!("{COMPONENT}: loaded: no card records for slot {slot}");
            self.push_event("sim_loaded", Some(slot), "skipped", Some("no records".into()));
            return;
        };
        let Some(raw) = records.iccid.clone() else {
            log::debug!("{COMPONENT}: loaded: no identifier for slot {slot}");
            self.push_event(
                "sim_loaded",
                Some(slot),
                "skipped",
                Some("no identifier".into()),
            );
            return;
        };
        let Some(iccid) = strip_trailing_filler(&raw) else {
            log::debug!("{COMPONENT}: loaded: blank identifier for slot {slot}");
            self.push_event(
                "sim_loaded",
                Some(slot),
                "skipped",
                Some("blank identifier".into()),
            );
            return;
        };
        self.slots.set_card_identifier(slot, Some(iccid));

        self.reconcile_slot(slot, true);

        let subscriptions = self.store.records_for_slot(slot);
        if subscriptions.is_empty() {
            log::error!("{COMPONENT}: loaded: no subscription records on slot {slot}");
        }
        for subscription in &subscriptions {
            self.write_loaded_fields(slot, subscription, &records);
            self.resolve_network_mode_on_first_observation(slot, subscription);
        }

        // Privilege rules may have changed with the new card.
        self.carrier.refresh_carrier_app_enablement();

        self.sink
            .sim_state_changed(slot, SimLifecycleState::Loaded, None);
        self.notify_card_state(slot, CardPresence::Present);
        self.notify_application_state(slot, ApplicationState::Loaded);
        self.refresh_carrier(slot, SimLifecycleState::Loaded);
        self.push_event("sim_loaded", Some(slot), "ok", None);
    }

    fn handle_imsi_updated(&mut self, slot: SlotIndex) {
        self.sink
            .sim_state_changed(slot, SimLifecycleState::ImsiUpdated, None);
        self.push_event("sim_imsi", Some(slot), "ok", None);
    }

    // -- loaded-state helpers -----------------------------------------------

    /// Copy operator identity and line fields onto one subscription row.
    /// Scalar fields come from the telephony queries; the PLMN lists come
    /// from the card records read during the load.
    fn write_loaded_fields(
        &mut self,
        slot: SlotIndex,
        subscription: &SubscriptionRecord,
        records: &crate::collaborators::CardRecords,
    ) {
        let mut update = RecordUpdate::default();

        match self.cards.operator_numeric(slot).as_deref() {
            Some(operator) if !operator.is_empty() => {
                update.operator_numeric = Some(Some(operator.to_string()));
                if operator.len() >= 3 {
                    update.mcc = Some(Some(operator[..3].to_string()));
                    update.mnc = Some(Some(operator[3..].to_string()));
                }
            }
            _ => log::debug!("{COMPONENT}: loaded: operator numeric unavailable on slot {slot}"),
        }

        match self.cards.country_iso(slot).as_deref() {
            Some(iso) if !iso.is_empty() => {
                update.country_iso = Some(Some(iso.to_string()));
            }
            _ => log::debug!("{COMPONENT}: loaded: country iso unavailable on slot {slot}"),
        }

        if let Some(line_number) = self.cards.line_number(slot) {
            update.line_number = Some(Some(line_number));
        }
        if let Some(subscriber_id) = self.cards.subscriber_id(slot) {
            update.subscriber_id = Some(Some(subscriber_id));
        }
        if !records.ehplmns.is_empty() || !records.hplmns.is_empty() {
            update.associated_plmns =
                Some((records.ehplmns.clone(), records.hplmns.clone()));
        }

        self.store.update_by_subscription(subscription.id, &update);
    }

    /// On the first observation of a new active subscription on this slot,
    /// resolve and push the preferred network mode and switch selection to
    /// automatic.
    fn resolve_network_mode_on_first_observation(
        &mut self,
        slot: SlotIndex,
        subscription: &SubscriptionRecord,
    ) {
        if self.store.current_subscription_marker(slot) == Some(subscription.id) {
            return;
        }

        let resolved = match self.network.stored_network_mode(subscription.id) {
            Some(stored) => stored,
            None => {
                let default = self.network.default_network_mode(slot);
                self.network.store_network_mode(subscription.id, default);
                default
            }
        };
        let allowed = allowed_network_mask(subscription);
        self.network
            .set_preferred_network_mode(slot, resolved.intersect(allowed));
        self.network.request_automatic_selection(slot);
        self.store
            .set_current_subscription_marker(slot, Some(subscription.id));
    }

    // -- slot-record reconciliation -----------------------------------------

    /// Re-derive the slot's record assignment from its cached identifier:
    /// unassign everything, re-attach when a real card is present, repair
    /// line-number drift, check the initialization latch, and optionally
    /// kick an embedded refresh across every known card.
    fn reconcile_slot(&mut self, slot: SlotIndex, update_embedded: bool) {
        if !self.slots.is_valid(slot) {
            log::error!("{COMPONENT}: reconcile for invalid slot {slot}");
            self.push_event("reconcile_slot", Some(slot), "error", Some("invalid slot".into()));
            return;
        }
        // A profile can switch within the same slot; always unassign the
        // previous record first.
        self.store.clear_slot(slot);

        if let Some(iccid) = self.slots.card_identifier(slot) {
            if iccid != NO_CARD_ICCID {
                let iccid = iccid.to_string();
                self.store.attach_to_slot(&iccid, slot);
            }
        }

        let line_number = self.cards.line_number(slot);
        let mut changed = false;
        for subscription in self.store.records_for_slot(slot) {
            if subscription.line_number != line_number {
                let update = RecordUpdate {
                    line_number: Some(line_number.clone()),
                    ..Default::default()
                };
                self.store.update_by_subscription(subscription.id, &update);
                changed = true;
            }
        }
        if changed {
            self.store.refresh_cache();
        }

        if self.all_slots_accounted() {
            self.mark_initialized();
        }

        if update_embedded {
            let card_ids = self.cards.all_card_ids();
            if !card_ids.is_empty() {
                self.request_embedded_refresh(card_ids, None);
            }
        }

        self.sink.subscription_info_changed();
    }

    fn all_slots_accounted(&self) -> bool {
        for slot in 0..self.slots.active_slot_count() {
            if self.slots.card_identifier(slot).is_none() {
                log::debug!("{COMPONENT}: waiting for slot {slot} identifier");
                return false;
            }
            if !self.cards.is_slot_active(slot) {
                log::debug!("{COMPONENT}: waiting for slot {slot} to become active");
                return false;
            }
        }
        true
    }

    /// Flip the one-time initialization latch.
    fn mark_initialized(&mut self) {
        if self.store_initialized {
            return;
        }
        self.store_initialized = true;
        log::debug!("{COMPONENT}: all slot identifiers accounted for");
        self.push_event("store_initialized", None, "ok", None);
        self.sink.subscriptions_initialized();
    }

    // -- notification helpers -----------------------------------------------

    fn notify_card_state(&mut self, slot: SlotIndex, state: CardPresence) {
        self.slots.set_card_state(slot, state);
        self.notifier
            .notify_card_state(slot, state, self.sink.as_mut(), self.metrics.as_mut());
    }

    fn notify_application_state(&mut self, slot: SlotIndex, state: ApplicationState) {
        self.slots.set_application_state(slot, state);
        // The empty-profile flag only matters for the boot-default
        // suppression rule; skip the card read otherwise.
        let suppressible = self.notifier.last_application_state(slot) == ApplicationState::Unknown
            && state == ApplicationState::NotReady;
        let empty_profile = suppressible
            && self
                .cards
                .card_records(slot)
                .is_some_and(|r| r.empty_profile);
        self.notifier.notify_application_state(
            slot,
            state,
            empty_profile,
            self.sink.as_mut(),
            self.metrics.as_mut(),
        );
    }

    fn refresh_carrier(&mut self, slot: SlotIndex, state: SimLifecycleState) {
        self.carrier.resolve_carrier_id(slot, state);
        self.carrier.refresh_for_slot(slot, state);
    }

    fn push_event(
        &mut self,
        event: &str,
        slot: Option<SlotIndex>,
        outcome: &str,
        detail: Option<String>,
    ) {
        self.events.push(CoordinatorEvent {
            component: COMPONENT.to_string(),
            event: event.to_string(),
            slot,
            outcome: outcome.to_string(),
            detail,
            tick: LogicalTick(self.tick),
        });
    }
}

/// Parse the record's stored allowed-network bitmask; malformed values are
/// logged and widen to "everything allowed".
fn allowed_network_mask(subscription: &SubscriptionRecord) -> NetworkModeMask {
    match &subscription.allowed_network_types {
        Some(raw) => match raw.parse::<u64>() {
            Ok(bits) => NetworkModeMask(bits),
            Err(err) => {
                log::warn!(
                    "{COMPONENT}: malformed allowed-network-types {raw:?} on {}: {err}",
                    subscription.id
                );
                NetworkModeMask::ALL
            }
        },
        None => NetworkModeMask::ALL,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
