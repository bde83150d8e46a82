//! Playback state machine: Uninitialized → Idle → Loaded → Playing ⇄ Stopped,
//! with Error reachable from any connected state.
//! Owned by the controller; a watch channel lets observers follow transitions.

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// All controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PlaybackState {
    Uninitialized,
    Idle,
    Loaded,
    Playing,
    Stopped,
    Error,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Uninitialized => write!(f, "Uninitialized"),
            PlaybackState::Idle => write!(f, "Idle"),
            PlaybackState::Loaded => write!(f, "Loaded"),
            PlaybackState::Playing => write!(f, "Playing"),
            PlaybackState::Stopped => write!(f, "Stopped"),
            PlaybackState::Error => write!(f, "Error"),
        }
    }
}

impl PlaybackState {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: PlaybackState) -> bool {
        use PlaybackState::*;
        matches!(
            (self, next),
            (Uninitialized, Idle) // connect
                | (Idle | Loaded | Stopped | Error, Loaded) // load / rewind
                | (Loaded | Stopped | Playing, Playing) // play (re-arm while playing)
                | (Playing, Stopped) // pause / reached stop point
                | (Playing, Loaded) // rewind mid-flight
                | (Idle | Loaded | Playing | Stopped | Error, Idle) // reset
                | (Idle | Loaded | Playing | Stopped | Error, Error) // device fault
                | (_, Uninitialized) // close
        )
    }

    /// Connected states accept device operations.
    pub fn is_connected(self) -> bool {
        self != PlaybackState::Uninitialized
    }
}

/// Single-owner state holder. Mutated only through controller operations.
pub struct PlaybackStateMachine {
    state: PlaybackState,
    state_tx: watch::Sender<PlaybackState>,
}

impl PlaybackStateMachine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(PlaybackState::Uninitialized);
        Self {
            state: PlaybackState::Uninitialized,
            state_tx,
        }
    }

    pub fn current(&self) -> PlaybackState {
        self.state
    }

    /// Check a transition without performing it.
    pub fn ensure(&self, next: PlaybackState) -> Result<()> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            warn!(from = %self.state, to = %next, "invalid_transition");
            Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            })
        }
    }

    /// Attempt a state transition. Returns Ok(new_state) or the rejected pair.
    pub fn transition(&mut self, next: PlaybackState) -> Result<PlaybackState> {
        self.ensure(next)?;
        let prev = self.state;
        self.state = next;
        self.state_tx.send_replace(next);
        if prev != next {
            info!(from = %prev, to = %next, "playback_transition");
        }
        Ok(next)
    }

    /// Force a state regardless of the table (close, fault handling).
    pub fn force(&mut self, next: PlaybackState) {
        let prev = self.state;
        self.state = next;
        self.state_tx.send_replace(next);
        info!(from = %prev, to = %next, "playback_forced");
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state_tx.subscribe()
    }
}

impl Default for PlaybackStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
