//! Change-detecting notification emission.
//!
//! Keeps the last successfully-notified card-presence and application state
//! per slot and swallows repeats, so observers only see actual transitions.
//! The one wrinkle: the initial `Unknown -> NotReady` application transition
//! is the uninteresting boot default and is suppressed — unless the card
//! reports an empty profile, where `NotReady` is itself the terminal,
//! meaningful state and must go out.

use crate::collaborators::{MetricsRecorder, NotificationSink, StateChangeKind};
use crate::slot_table::{ApplicationState, CardPresence, SlotIndex};

/// Previous-value store feeding the deduplicated notification channels.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    card_state: Vec<CardPresence>,
    application_state: Vec<ApplicationState>,
}

impl ChangeNotifier {
    pub fn new(slot_count: usize) -> Self {
        Self {
            card_state: vec![CardPresence::Unknown; slot_count],
            application_state: vec![ApplicationState::Unknown; slot_count],
        }
    }

    /// Last value observers saw on the card-state channel.
    pub fn last_card_state(&self, slot: SlotIndex) -> CardPresence {
        self.card_state
            .get(slot)
            .copied()
            .unwrap_or(CardPresence::Unknown)
    }

    /// Last value observers saw on the application-state channel.
    pub fn last_application_state(&self, slot: SlotIndex) -> ApplicationState {
        self.application_state
            .get(slot)
            .copied()
            .unwrap_or(ApplicationState::Unknown)
    }

    /// Reset one slot's previous values back to `Unknown` (modem window
    /// shrink).
    pub fn reset(&mut self, slot: SlotIndex) {
        if let Some(state) = self.card_state.get_mut(slot) {
            *state = CardPresence::Unknown;
        }
        if let Some(state) = self.application_state.get_mut(slot) {
            *state = ApplicationState::Unknown;
        }
    }

    /// Emit a card-state change if `new` differs from the last notified
    /// value.  Returns whether a notification went out.
    pub fn notify_card_state(
        &mut self,
        slot: SlotIndex,
        new: CardPresence,
        sink: &mut dyn NotificationSink,
        metrics: &mut dyn MetricsRecorder,
    ) -> bool {
        let Some(previous) = self.card_state.get_mut(slot) else {
            return false;
        };
        if *previous == new {
            return false;
        }
        *previous = new;
        sink.card_state_changed(slot, new);
        metrics.state_transition(slot, StateChangeKind::CardState, new.as_str());
        true
    }

    /// Emit an application-state change if `new` differs from the last
    /// notified value, applying the boot-default suppression rule.
    /// `empty_profile` is the card's empty-profile flag at notification
    /// time.
    pub fn notify_application_state(
        &mut self,
        slot: SlotIndex,
        new: ApplicationState,
        empty_profile: bool,
        sink: &mut dyn NotificationSink,
        metrics: &mut dyn MetricsRecorder,
    ) -> bool {
        let Some(previous) = self.application_state.get_mut(slot) else {
            return false;
        };
        if *previous == new {
            return false;
        }
        let unknown_to_not_ready =
            *previous == ApplicationState::Unknown && new == ApplicationState::NotReady;
        if unknown_to_not_ready && !empty_profile {
            return false;
        }
        *previous = new;
        sink.application_state_changed(slot, new);
        metrics.state_transition(slot, StateChangeKind::ApplicationState, new.as_str());
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{NotificationSink, StateChangeKind};
    use crate::slot_table::SimLifecycleState;
    use uuid::Uuid;

    // -- helpers ------------------------------------------------------------

    #[derive(Default)]
    struct RecordingSink {
        card_states: Vec<(SlotIndex, CardPresence)>,
        application_states: Vec<(SlotIndex, ApplicationState)>,
    }

    impl NotificationSink for RecordingSink {
        fn sim_state_changed(&mut self, _: SlotIndex, _: SimLifecycleState, _: Option<&str>) {}

        fn card_state_changed(&mut self, slot: SlotIndex, state: CardPresence) {
            self.card_states.push((slot, state));
        }

        fn application_state_changed(&mut self, slot: SlotIndex, state: ApplicationState) {
            self.application_states.push((slot, state));
        }

        fn subscription_info_changed(&mut self) {}
        fn subscription_group_changed(&mut self, _: Option<Uuid>) {}
        fn subscriptions_initialized(&mut self) {}
    }

    #[derive(Default)]
    struct RecordingMetrics {
        transitions: Vec<(SlotIndex, StateChangeKind, &'static str)>,
    }

    impl MetricsRecorder for RecordingMetrics {
        fn state_transition(
            &mut self,
            slot: SlotIndex,
            kind: StateChangeKind,
            value: &'static str,
        ) {
            self.transitions.push((slot, kind, value));
        }
    }

    // -- card state ---------------------------------------------------------

    #[test]
    fn card_state_repeat_is_swallowed() {
        let mut notifier = ChangeNotifier::new(2);
        let mut sink = RecordingSink::default();
        let mut metrics = RecordingMetrics::default();

        assert!(notifier.notify_card_state(0, CardPresence::Absent, &mut sink, &mut metrics));
        assert!(!notifier.notify_card_state(0, CardPresence::Absent, &mut sink, &mut metrics));
        assert!(notifier.notify_card_state(0, CardPresence::Present, &mut sink, &mut metrics));

        assert_eq!(
            sink.card_states,
            vec![(0, CardPresence::Absent), (0, CardPresence::Present)]
        );
        assert_eq!(metrics.transitions.len(), 2);
    }

    #[test]
    fn slots_are_independent() {
        let mut notifier = ChangeNotifier::new(2);
        let mut sink = RecordingSink::default();
        let mut metrics = RecordingMetrics::default();

        assert!(notifier.notify_card_state(0, CardPresence::Present, &mut sink, &mut metrics));
        assert!(notifier.notify_card_state(1, CardPresence::Present, &mut sink, &mut metrics));
        assert_eq!(sink.card_states.len(), 2);
    }

    // -- application state --------------------------------------------------

    #[test]
    fn unknown_to_not_ready_is_suppressed_by_default() {
        let mut notifier = ChangeNotifier::new(1);
        let mut sink = RecordingSink::default();
        let mut metrics = RecordingMetrics::default();

        assert!(!notifier.notify_application_state(
            0,
            ApplicationState::NotReady,
            false,
            &mut sink,
            &mut metrics,
        ));
        assert!(sink.application_states.is_empty());
        // The suppressed transition must not update the previous value:
        // a later real NotReady (after Loaded) still notifies.
        assert!(notifier.notify_application_state(
            0,
            ApplicationState::Loaded,
            false,
            &mut sink,
            &mut metrics,
        ));
        assert!(notifier.notify_application_state(
            0,
            ApplicationState::NotReady,
            false,
            &mut sink,
            &mut metrics,
        ));
        assert_eq!(
            sink.application_states,
            vec![
                (0, ApplicationState::Loaded),
                (0, ApplicationState::NotReady)
            ]
        );
    }

    #[test]
    fn empty_profile_lets_not_ready_through() {
        let mut notifier = ChangeNotifier::new(1);
        let mut sink = RecordingSink::default();
        let mut metrics = RecordingMetrics::default();

        assert!(notifier.notify_application_state(
            0,
            ApplicationState::NotReady,
            true,
            &mut sink,
            &mut metrics,
        ));
        assert_eq!(
            sink.application_states,
            vec![(0, ApplicationState::NotReady)]
        );
        assert_eq!(
            metrics.transitions,
            vec![(0, StateChangeKind::ApplicationState, "NOT_READY")]
        );
    }

    #[test]
    fn reset_restores_unknown_baseline() {
        let mut notifier = ChangeNotifier::new(1);
        let mut sink = RecordingSink::default();
        let mut metrics = RecordingMetrics::default();

        notifier.notify_application_state(
            0,
            ApplicationState::Loaded,
            false,
            &mut sink,
            &mut metrics,
        );
        notifier.notify_card_state(0, CardPresence::Present, &mut sink, &mut metrics);
        notifier.reset(0);
        assert_eq!(notifier.last_card_state(0), CardPresence::Unknown);
        assert_eq!(notifier.last_application_state(0), ApplicationState::Unknown);
        // After reset the boot-default suppression applies again.
        assert!(!notifier.notify_application_state(
            0,
            ApplicationState::NotReady,
            false,
            &mut sink,
            &mut metrics,
        ));
    }

    #[test]
    fn out_of_range_slot_is_ignored() {
        let mut notifier = ChangeNotifier::new(1);
        let mut sink = RecordingSink::default();
        let mut metrics = RecordingMetrics::default();
        assert!(!notifier.notify_card_state(9, CardPresence::Present, &mut sink, &mut metrics));
        assert!(sink.card_states.is_empty());
    }
}
