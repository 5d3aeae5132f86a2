//! Completion object state

use core::fmt;

/// State of a completion object.
///
/// ```text
/// Pending --(resolve)--> Ready --(release)--> Released
/// ```
///
/// Releasing a pending object that is in flight does not change its state;
/// the engine reclaims it once the operation resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionState {
    /// Created, possibly attached to a request, not yet resolved
    Pending = 0,

    /// Resolved; result and argument are readable
    Ready = 1,

    /// Caller gave up its reference; no transition out of here
    Released = 2,
}

impl CompletionState {
    /// Check if a result is available
    #[inline]
    pub const fn is_ready(&self) -> bool {
        matches!(self, CompletionState::Ready)
    }

    /// Check if the object is still waiting on its operation
    #[inline]
    pub const fn is_pending(&self) -> bool {
        matches!(self, CompletionState::Pending)
    }

    /// Check if the object has reached its final state
    #[inline]
    pub const fn is_released(&self) -> bool {
        matches!(self, CompletionState::Released)
    }
}

impl From<CompletionState> for u8 {
    fn from(state: CompletionState) -> u8 {
        state as u8
    }
}

impl fmt::Display for CompletionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionState::Pending => write!(f, "PENDING"),
            CompletionState::Ready => write!(f, "READY"),
            CompletionState::Released => write!(f, "RELEASED"),
        }
    }
}
