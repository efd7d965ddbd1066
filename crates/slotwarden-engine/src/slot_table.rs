//! Per-slot state store: the owned, explicitly-sized table of card slots.
//!
//! One entry per logical modem slot, holding the last-known card identifier,
//! the card-presence state, and the application state.  The table is sized at
//! construction from the supported slot count and exposes an active window
//! that shrinks or grows when the modem configuration changes.
//!
//! Only the control-loop thread writes entries; everyone else reads
//! [`SlotSnapshot`]s.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Sentinel card identifier meaning "no card in this slot".
///
/// Distinct from an unqueried slot, which carries `None`.
pub const NO_CARD_ICCID: &str = "";

// ---------------------------------------------------------------------------
// Slot index
// ---------------------------------------------------------------------------

/// Index of a logical modem slot, `0..active_slot_count`.
pub type SlotIndex = usize;

// ---------------------------------------------------------------------------
// Lifecycle state labels
// ---------------------------------------------------------------------------

/// Generic per-slot lifecycle state, carried verbatim in the always-emitted
/// state notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SimLifecycleState {
    Unknown,
    Absent,
    IoError,
    Restricted,
    NotReady,
    Locked,
    Ready,
    Loaded,
    ImsiUpdated,
}

impl SimLifecycleState {
    /// Stable label for notifications and structured logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Absent => "ABSENT",
            Self::IoError => "CARD_IO_ERROR",
            Self::Restricted => "CARD_RESTRICTED",
            Self::NotReady => "NOT_READY",
            Self::Locked => "LOCKED",
            Self::Ready => "READY",
            Self::Loaded => "LOADED",
            Self::ImsiUpdated => "IMSI",
        }
    }
}

impl fmt::Display for SimLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical card presence, as seen by observers of the card-state channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CardPresence {
    Unknown,
    Absent,
    Present,
    IoError,
    Restricted,
}

impl CardPresence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Absent => "ABSENT",
            Self::Present => "PRESENT",
            Self::IoError => "CARD_IO_ERROR",
            Self::Restricted => "CARD_RESTRICTED",
        }
    }
}

impl fmt::Display for CardPresence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the card's application stack, as seen by observers of the
/// application-state channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ApplicationState {
    Unknown,
    NotReady,
    PinRequired,
    PukRequired,
    NetworkLocked,
    PermDisabled,
    Loaded,
}

impl ApplicationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::NotReady => "NOT_READY",
            Self::PinRequired => "PIN_REQUIRED",
            Self::PukRequired => "PUK_REQUIRED",
            Self::NetworkLocked => "NETWORK_LOCKED",
            Self::PermDisabled => "PERM_DISABLED",
            Self::Loaded => "LOADED",
        }
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason a card reported itself locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LockReason {
    Pin,
    Puk,
    Network,
    PermDisabled,
}

impl LockReason {
    /// Parse a lock-reason label from the card-status channel.  Unrecognized
    /// labels yield `None`; the caller logs and falls back to
    /// [`ApplicationState::Unknown`].
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "PIN" => Some(Self::Pin),
            "PUK" => Some(Self::Puk),
            "NETWORK" => Some(Self::Network),
            "PERM_DISABLED" => Some(Self::PermDisabled),
            _ => None,
        }
    }

    /// Application state observers should see for this lock reason.
    pub fn application_state(&self) -> ApplicationState {
        match self {
            Self::Pin => ApplicationState::PinRequired,
            Self::Puk => ApplicationState::PukRequired,
            Self::Network => ApplicationState::NetworkLocked,
            Self::PermDisabled => ApplicationState::PermDisabled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pin => "PIN",
            Self::Puk => "PUK",
            Self::Network => "NETWORK",
            Self::PermDisabled => "PERM_DISABLED",
        }
    }
}

impl fmt::Display for LockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Identifier helpers
// ---------------------------------------------------------------------------

/// Strip trailing filler nibbles (`F`/`f`) from a raw card identifier.
///
/// Returns `None` for identifiers that are empty after stripping, which the
/// callers treat the same as an unreadable identifier.
pub fn strip_trailing_filler(raw: &str) -> Option<String> {
    let stripped = raw.trim_end_matches(['F', 'f']);
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

// ---------------------------------------------------------------------------
// SlotTable
// ---------------------------------------------------------------------------

/// One slot's cached state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SlotEntry {
    /// `None` until the first identifier query completes; [`NO_CARD_ICCID`]
    /// once the slot is known to be empty.
    card_identifier: Option<String>,
    card_state: CardPresence,
    application_state: ApplicationState,
}

impl SlotEntry {
    fn unknown() -> Self {
        Self {
            card_identifier: None,
            card_state: CardPresence::Unknown,
            application_state: ApplicationState::Unknown,
        }
    }
}

/// Read-only snapshot of one slot, for observers off the control loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub slot: SlotIndex,
    pub card_identifier: Option<String>,
    pub card_state: CardPresence,
    pub application_state: ApplicationState,
}

/// Owned table of per-slot state, indexed by [`SlotIndex`].
///
/// Sized once at construction from the supported slot count; the active
/// window is adjusted on modem-config changes without reallocating.
#[derive(Debug, Clone)]
pub struct SlotTable {
    entries: Vec<SlotEntry>,
    active_slot_count: usize,
}

impl SlotTable {
    /// A table with `supported` entries, of which the first `active` are in
    /// the active window.  `active` is clamped to `supported`.
    pub fn new(supported: usize, active: usize) -> Self {
        Self {
            entries: vec![SlotEntry::unknown(); supported],
            active_slot_count: active.min(supported),
        }
    }

    pub fn supported_slot_count(&self) -> usize {
        self.entries.len()
    }

    pub fn active_slot_count(&self) -> usize {
        self.active_slot_count
    }

    /// Whether `slot` falls inside the active window.
    pub fn is_valid(&self, slot: SlotIndex) -> bool {
        slot < self.active_slot_count
    }

    pub fn card_identifier(&self, slot: SlotIndex) -> Option<&str> {
        self.entries.get(slot)?.card_identifier.as_deref()
    }

    pub fn set_card_identifier(&mut self, slot: SlotIndex, iccid: Option<String>) {
        if let Some(entry) = self.entries.get_mut(slot) {
            entry.card_identifier = iccid;
        }
    }

    pub fn card_state(&self, slot: SlotIndex) -> CardPresence {
        self.entries
            .get(slot)
            .map_or(CardPresence::Unknown, |e| e.card_state)
    }

    pub fn set_card_state(&mut self, slot: SlotIndex, state: CardPresence) {
        if let Some(entry) = self.entries.get_mut(slot) {
            entry.card_state = state;
        }
    }

    pub fn application_state(&self, slot: SlotIndex) -> ApplicationState {
        self.entries
            .get(slot)
            .map_or(ApplicationState::Unknown, |e| e.application_state)
    }

    pub fn set_application_state(&mut self, slot: SlotIndex, state: ApplicationState) {
        if let Some(entry) = self.entries.get_mut(slot) {
            entry.application_state = state;
        }
    }

    /// Reset one slot back to the unqueried state.
    pub fn reset(&mut self, slot: SlotIndex) {
        if let Some(entry) = self.entries.get_mut(slot) {
            *entry = SlotEntry::unknown();
        }
    }

    /// Shrink or grow the active window.  Entries beyond the window keep
    /// their storage but are reset by the caller as part of the modem-config
    /// transition.
    pub fn set_active_slot_count(&mut self, active: usize) {
        self.active_slot_count = active.min(self.entries.len());
    }

    pub fn snapshot(&self, slot: SlotIndex) -> Option<SlotSnapshot> {
        self.entries.get(slot).map(|e| SlotSnapshot {
            slot,
            card_identifier: e.card_identifier.clone(),
            card_state: e.card_state,
            application_state: e.application_state,
        })
    }

    /// Snapshots for every slot in the active window.
    pub fn snapshots(&self) -> Vec<SlotSnapshot> {
        (0..self.active_slot_count)
            .filter_map(|slot| self.snapshot(slot))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_table_starts_unknown() {
        let table = SlotTable::new(3, 2);
        assert_eq!(table.supported_slot_count(), 3);
        assert_eq!(table.active_slot_count(), 2);
        for slot in 0..3 {
            assert_eq!(table.card_identifier(slot), None);
            assert_eq!(table.card_state(slot), CardPresence::Unknown);
            assert_eq!(table.application_state(slot), ApplicationState::Unknown);
        }
    }

    #[test]
    fn active_count_clamped_to_supported() {
        let table = SlotTable::new(2, 5);
        assert_eq!(table.active_slot_count(), 2);
    }

    #[test]
    fn identifier_round_trip_and_sentinel() {
        let mut table = SlotTable::new(2, 2);
        table.set_card_identifier(0, Some("8944".to_string()));
        assert_eq!(table.card_identifier(0), Some("8944"));
        table.set_card_identifier(0, Some(NO_CARD_ICCID.to_string()));
        assert_eq!(table.card_identifier(0), Some(NO_CARD_ICCID));
        table.set_card_identifier(0, None);
        assert_eq!(table.card_identifier(0), None);
    }

    #[test]
    fn out_of_range_writes_are_ignored() {
        let mut table = SlotTable::new(1, 1);
        table.set_card_identifier(7, Some("8944".to_string()));
        table.set_card_state(7, CardPresence::Present);
        assert_eq!(table.snapshot(7), None);
    }

    #[test]
    fn reset_clears_one_slot_only() {
        let mut table = SlotTable::new(2, 2);
        table.set_card_identifier(0, Some("a".to_string()));
        table.set_card_identifier(1, Some("b".to_string()));
        table.set_card_state(1, CardPresence::Present);
        table.reset(1);
        assert_eq!(table.card_identifier(0), Some("a"));
        assert_eq!(table.card_identifier(1), None);
        assert_eq!(table.card_state(1), CardPresence::Unknown);
    }

    #[test]
    fn snapshots_cover_active_window_only() {
        let mut table = SlotTable::new(3, 2);
        table.set_card_identifier(2, Some("c".to_string()));
        let snaps = table.snapshots();
        assert_eq!(snaps.len(), 2);
        assert!(snaps.iter().all(|s| s.slot < 2));
    }

    #[test]
    fn strip_trailing_filler_variants() {
        assert_eq!(
            strip_trailing_filler("89440000FF"),
            Some("89440000".to_string())
        );
        assert_eq!(strip_trailing_filler("8944"), Some("8944".to_string()));
        assert_eq!(strip_trailing_filler("ffff"), None);
        assert_eq!(strip_trailing_filler(""), None);
    }

    #[test]
    fn lock_reason_labels() {
        assert_eq!(LockReason::from_label("PIN"), Some(LockReason::Pin));
        assert_eq!(LockReason::from_label("PUK"), Some(LockReason::Puk));
        assert_eq!(LockReason::from_label("NETWORK"), Some(LockReason::Network));
        assert_eq!(
            LockReason::from_label("PERM_DISABLED"),
            Some(LockReason::PermDisabled)
        );
        assert_eq!(LockReason::from_label("FINGERPRINT"), None);
        assert_eq!(
            LockReason::Puk.application_state(),
            ApplicationState::PukRequired
        );
    }
}
