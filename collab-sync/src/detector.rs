//! Primary-transport failure detection.
//!
//! A two-state machine over [`TransportMode`]:
//!
//! ```text
//!              Close × (threshold + 1)
//!   ┌─────────┐ ─────────────────────► ┌──────────┐
//!   │ PRIMARY │                        │ FALLBACK │ ◄─┐ Close (absorbed)
//!   └─────────┘ ◄───────────────────── └──────────┘ ──┘
//!        ▲  │           Connect
//!        └──┘ Connect (failure count := 0)
//! ```
//!
//! [`transition`] is a pure function returning the next state and the list
//! of effects the session must carry out. The detector never reconnects the
//! primary transport; the socket's own retry loop does, and its eventual
//! `Connect` restores PRIMARY.

use serde::{Deserialize, Serialize};

use crate::primary::ConnectionStatus;

/// Which transport currently carries document traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportMode {
    Primary,
    Fallback,
}

/// Lifecycle events observed on the primary transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Connect,
    Disconnect,
    Close,
    Status(ConnectionStatus),
}

/// Side effects requested by a transition, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorEffect {
    /// Switch the reconciliation engine into fallback mode.
    EnterFallback,
    /// Run one reconciliation regardless of the staleness counter.
    ForceReconcile,
    OpenPushChannel,
    /// Switch the reconciliation engine back to primary mode.
    RestorePrimary,
    ClosePushChannel,
    ResetStaleness,
}

/// Detector state: the active mode and the rolling close counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorState {
    pub mode: TransportMode,
    pub failure_count: u32,
}

impl Default for DetectorState {
    fn default() -> Self {
        Self {
            mode: TransportMode::Primary,
            failure_count: 0,
        }
    }
}

/// Compute the next detector state for `event`.
///
/// Fallback is entered when the failure count *exceeds* `threshold`.
pub fn transition(
    state: DetectorState,
    event: TransportEvent,
    threshold: u32,
) -> (DetectorState, Vec<DetectorEffect>) {
    match event {
        TransportEvent::Connect => {
            let next = DetectorState {
                mode: TransportMode::Primary,
                failure_count: 0,
            };
            let effects = match state.mode {
                TransportMode::Fallback => vec![
                    DetectorEffect::RestorePrimary,
                    DetectorEffect::ClosePushChannel,
                    DetectorEffect::ResetStaleness,
                ],
                TransportMode::Primary => Vec::new(),
            };
            (next, effects)
        }

        TransportEvent::Close => {
            let failure_count = state.failure_count.saturating_add(1);
            match state.mode {
                TransportMode::Primary if failure_count > threshold => (
                    DetectorState {
                        mode: TransportMode::Fallback,
                        failure_count,
                    },
                    vec![
                        DetectorEffect::EnterFallback,
                        DetectorEffect::ForceReconcile,
                        DetectorEffect::OpenPushChannel,
                    ],
                ),
                _ => (
                    DetectorState {
                        mode: state.mode,
                        failure_count,
                    },
                    Vec::new(),
                ),
            }
        }

        TransportEvent::Disconnect | TransportEvent::Status(_) => (state, Vec::new()),
    }
}

/// Owner of one [`DetectorState`], used by the session loop.
#[derive(Debug)]
pub struct FailureDetector {
    state: DetectorState,
    threshold: u32,
}

impl FailureDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            state: DetectorState::default(),
            threshold,
        }
    }

    /// Feed one lifecycle event and return the effects to execute.
    pub fn handle(&mut self, event: TransportEvent) -> Vec<DetectorEffect> {
        let (next, effects) = transition(self.state, event, self.threshold);

        match event {
            TransportEvent::Close if next.mode == TransportMode::Fallback && effects.is_empty() => {
                log::debug!("Primary transport closed while in fallback; absorbed");
            }
            TransportEvent::Close => {
                log::info!(
                    "Primary transport closed ({}/{} failures)",
                    next.failure_count,
                    self.threshold
                );
            }
            TransportEvent::Disconnect => log::debug!("Primary transport disconnected"),
            TransportEvent::Status(status) => log::debug!("Primary transport status: {status:?}"),
            TransportEvent::Connect => {}
        }
        if next.mode != self.state.mode {
            log::warn!("Transport mode {:?} -> {:?}", self.state.mode, next.mode);
        }

        self.state = next;
        effects
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn mode(&self) -> TransportMode {
        self.state.mode
    }

    pub fn failure_count(&self) -> u32 {
        self.state.failure_count
    }
}
