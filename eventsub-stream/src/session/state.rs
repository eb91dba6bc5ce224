//! Lifecycle transitions
//!
//! The session lifecycle is a plain value moved by discrete [`Transition`]s.
//! Anything not listed in [`next`] is illegal and leaves the state unchanged.

use crate::status::LifecycleState;

/// Discrete events that move a session between lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A listener is attached and the session should connect
    Activate,
    /// Every subscription of the current activation has settled
    Activated,
    /// The connection closed abnormally or activation failed
    ConnectionLost,
    /// The upstream side closed the connection normally
    Disconnected,
    /// Credentials failed or every reconnect attempt was used
    Fatal,
    /// The last listener detached or the session is shutting down
    Stop,
    /// Teardown finished
    Stopped,
}

/// A transition that is not valid from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Illegal transition {transition:?} from {from}")]
pub struct IllegalTransition {
    pub from: LifecycleState,
    pub transition: Transition,
}

/// The state reached by applying `transition` in `from`.
pub fn next(
    from: LifecycleState,
    transition: Transition,
) -> Result<LifecycleState, IllegalTransition> {
    use LifecycleState::*;
    use Transition::*;

    let to = match (from, transition) {
        (Idle, Activate) => Activating,
        (Activating | Reconnecting, Activated) => Active,
        (Activating | Active | Reconnecting, ConnectionLost) => Reconnecting,
        (Activating | Active | Reconnecting, Disconnected | Fatal) => Idle,
        (Idle | Activating | Active | Reconnecting, Stop) => Stopping,
        (Stopping, Stopped) => Idle,
        _ => return Err(IllegalTransition { from, transition }),
    };
    Ok(to)
}
