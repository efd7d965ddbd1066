//! Serialized control loop and the blocking-fetch background worker.
//!
//! Architecture:
//!
//! ```text
//! producers ──Command──> control loop (owns SlotCoordinator)
//!                          │   ▲
//!                 FetchJob │   │ Command::FetchCompleted
//!                          ▼   │
//!                        fetch worker (blocking secure-element calls)
//! ```
//!
//! The control loop processes commands one at a time in arrival order; every
//! coordinator mutation happens on that thread.  The worker performs the
//! blocking profile fetches and feeds results back through the same command
//! channel, so completions serialize with everything else.  Nothing crosses
//! the thread boundary except the two channels and the shared
//! secure-element handle.

use std::fmt;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use thiserror::Error;

use crate::carrier_config::CarrierConfig;
use crate::coordinator::{CardStatusEvent, RefreshCallback, SlotCoordinator};
use crate::profiles::{CardId, ProfileFetchResult};
use crate::slot_table::SlotIndex;

const COMPONENT: &str = "event_loop";

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// One unit of work for the control loop.
pub enum Command {
    /// A card-status event from the modem layer.
    CardStatus(CardStatusEvent),
    /// Re-synchronize the embedded-profile cache for one card.
    RefreshEmbedded {
        card_id: CardId,
        callback: Option<RefreshCallback>,
    },
    /// Apply carrier-driven fields for a slot.
    ApplyCarrierConfig {
        slot: SlotIndex,
        package: String,
        config: CarrierConfig,
    },
    /// The active-modem count changed.
    ModemConfigChanged { active_slot_count: usize },
    /// A worker fetch batch finished (internal).
    FetchCompleted {
        results: Vec<(CardId, Option<ProfileFetchResult>)>,
        callback: Option<RefreshCallback>,
    },
    /// Drain and stop the loop.
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CardStatus(event) => f.debug_tuple("CardStatus").field(event).finish(),
            Self::RefreshEmbedded { card_id, callback } => f
                .debug_struct("RefreshEmbedded")
                .field("card_id", card_id)
                .field("callback", &callback.is_some())
                .finish(),
            Self::ApplyCarrierConfig { slot, package, .. } => f
                .debug_struct("ApplyCarrierConfig")
                .field("slot", slot)
                .field("package", package)
                .finish(),
            Self::ModemConfigChanged { active_slot_count } => f
                .debug_struct("ModemConfigChanged")
                .field("active_slot_count", active_slot_count)
                .finish(),
            Self::FetchCompleted { results, callback } => f
                .debug_struct("FetchCompleted")
                .field("cards", &results.len())
                .field("callback", &callback.is_some())
                .finish(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// The loop has shut down; the command was not delivered.
#[derive(Debug, Error)]
#[error("coordinator loop is no longer running")]
pub struct LoopClosed;

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Clonable enqueue surface for the control loop.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: Sender<Command>,
}

impl CoordinatorHandle {
    pub fn send(&self, command: Command) -> Result<(), LoopClosed> {
        self.tx.send(command).map_err(|_| LoopClosed)
    }

    pub fn card_status(&self, event: CardStatusEvent) -> Result<(), LoopClosed> {
        self.send(Command::CardStatus(event))
    }

    pub fn refresh_embedded(
        &self,
        card_id: CardId,
        callback: Option<RefreshCallback>,
    ) -> Result<(), LoopClosed> {
        self.send(Command::RefreshEmbedded { card_id, callback })
    }

    pub fn apply_carrier_config(
        &self,
        slot: SlotIndex,
        package: String,
        config: CarrierConfig,
    ) -> Result<(), LoopClosed> {
        self.send(Command::ApplyCarrierConfig {
            slot,
            package,
            config,
        })
    }

    pub fn modem_config_changed(&self, active_slot_count: usize) -> Result<(), LoopClosed> {
        self.send(Command::ModemConfigChanged { active_slot_count })
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

struct FetchJob {
    card_ids: Vec<CardId>,
    callback: Option<RefreshCallback>,
}

/// The two threads: the control loop owning the coordinator, and the fetch
/// worker.
pub struct CoordinatorRuntime {
    handle: CoordinatorHandle,
    loop_thread: JoinHandle<SlotCoordinator>,
    worker_thread: JoinHandle<()>,
}

impl CoordinatorRuntime {
    /// Start the control loop and worker.  The coordinator moves onto the
    /// loop thread and comes back from [`CoordinatorRuntime::shutdown`].
    pub fn spawn(mut coordinator: SlotCoordinator) -> Self {
        let (command_tx, command_rx) = unbounded::<Command>();
        let (job_tx, job_rx) = unbounded::<FetchJob>();

        let secure_element = coordinator.secure_element_handle();
        let completion_tx = command_tx.clone();
        let worker_thread = thread::Builder::new()
            .name("slotwarden-fetch".to_string())
            .spawn(move || {
                for job in job_rx.iter() {
                    let results = job
                        .card_ids
                        .iter()
                        .map(|card_id| (*card_id, secure_element.fetch_profiles(*card_id)))
                        .collect();
                    // Loop gone means shutdown; nothing left to deliver to.
                    if completion_tx
                        .send(Command::FetchCompleted {
                            results,
                            callback: job.callback,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            })
            .expect("failed to spawn fetch worker thread");

        let loop_thread = thread::Builder::new()
            .name("slotwarden-loop".to_string())
            .spawn(move || {
                while let Ok(command) = command_rx.recv() {
                    log::debug!("{COMPONENT}: processing {command:?}");
                    match command {
                        Command::Shutdown => break,
                        Command::CardStatus(event) => coordinator.handle_card_status(event),
                        Command::RefreshEmbedded { card_id, callback } => {
                            coordinator.request_embedded_refresh(vec![card_id], callback);
                        }
                        Command::ApplyCarrierConfig {
                            slot,
                            package,
                            config,
                        } => coordinator.apply_carrier_config(slot, &package, &config),
                        Command::ModemConfigChanged { active_slot_count } => {
                            coordinator.handle_modem_config_changed(active_slot_count);
                        }
                        Command::FetchCompleted { results, callback } => {
                            coordinator.complete_embedded_refresh(results, callback);
                        }
                    }
                    for request in coordinator.take_pending_fetches() {
                        if job_tx
                            .send(FetchJob {
                                card_ids: request.card_ids,
                                callback: request.callback,
                            })
                            .is_err()
                        {
                            log::error!("{COMPONENT}: fetch worker unavailable");
                        }
                    }
                }
                coordinator
            })
            .expect("failed to spawn control loop thread");

        Self {
            handle: CoordinatorHandle { tx: command_tx },
            loop_thread,
            worker_thread,
        }
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Stop both threads after the already-queued commands drain, and hand
    /// the coordinator's final state back.
    pub fn shutdown(self) -> SlotCoordinator {
        let _ = self.handle.send(Command::Shutdown);
        let coordinator = self
            .loop_thread
            .join()
            .expect("control loop thread panicked");
        // The loop dropped its job sender; the worker unblocks and exits.
        let _ = self.worker_thread.join();
        coordinator
    }
}
