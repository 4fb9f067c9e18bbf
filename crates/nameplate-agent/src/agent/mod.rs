pub mod backend;
pub mod command;
pub mod config;
pub mod health;
pub mod signal;
pub mod telemetry;

use nameplate::{ClaimError, ClaimState};
use tokio::sync::watch;

/// Process exit status for a clean shutdown.
pub const EXIT_OK: u8 = 0;
/// Exit status for any error without a dedicated code.
pub const EXIT_FAILURE: u8 = 1;
/// Exit status after the coordination session was lost.
pub const EXIT_SESSION_LOST: u8 = 10;
/// Exit status after the slot set changed.
pub const EXIT_TOPOLOGY_CHANGED: u8 = 11;
/// Exit status after a bounded scan found no free slot.
pub const EXIT_NO_SLOT: u8 = 12;

pub fn exit_code(outcome: &Result<(), ClaimError>) -> u8 {
    match outcome {
        Ok(()) => EXIT_OK,
        Err(ClaimError::SessionLost) => EXIT_SESSION_LOST,
        Err(ClaimError::TopologyChanged { .. }) => EXIT_TOPOLOGY_CHANGED,
        Err(ClaimError::NoSlotAvailable { .. }) => EXIT_NO_SLOT,
        Err(ClaimError::Coordination(_)) => EXIT_FAILURE,
    }
}

pub fn state_label(state: &ClaimState) -> &'static str {
    match state {
        ClaimState::Waiting => "waiting",
        ClaimState::Admitted => "admitted",
        ClaimState::Scanning { .. } => "scanning",
        ClaimState::Holding { .. } => "holding",
        ClaimState::Terminated => "terminated",
    }
}

/// Feeds claim state changes into the metrics until the claimant
/// terminates.
pub async fn observe_claim(mut states: watch::Receiver<ClaimState>) {
    let mut holding = false;
    loop {
        let state = states.borrow_and_update().clone();
        telemetry::record_claim_transition(state_label(&state));
        if matches!(state, ClaimState::Scanning { .. }) {
            telemetry::increment_scan_passes();
        }

        let now_holding = state.holding().is_some();
        if now_holding && !holding {
            telemetry::increment_holding();
        } else if holding && !now_holding {
            telemetry::decrement_holding();
        }
        holding = now_holding;

        if state == ClaimState::Terminated || states.changed().await.is_err() {
            return;
        }
    }
}
