//! Session status reported to listeners and observers.

/// Severity shown next to the status text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusLevel {
    /// Idle or disconnected
    Grey,
    /// Working on it: waiting for login, connecting, reconnecting
    Yellow,
    /// Connected and serving events
    Green,
    /// Fatal for the session until something changes
    Red,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// No live connection
    Idle,
    /// Connect and subscribe in progress
    Activating,
    /// Steady state, delivering events
    Active,
    /// Waiting out a backoff delay or re-running activation after a loss
    Reconnecting,
    /// Teardown in progress
    Stopping,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "idle"),
            LifecycleState::Activating => write!(f, "activating"),
            LifecycleState::Active => write!(f, "active"),
            LifecycleState::Reconnecting => write!(f, "reconnecting"),
            LifecycleState::Stopping => write!(f, "stopping"),
        }
    }
}

/// A status update: lifecycle state, severity and a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: LifecycleState,
    pub level: StatusLevel,
    pub text: String,
}

impl SessionStatus {
    pub fn new(state: LifecycleState, level: StatusLevel, text: impl Into<String>) -> Self {
        Self {
            state,
            level,
            text: text.into(),
        }
    }

    /// Status of a session that has not started yet.
    pub fn idle() -> Self {
        Self::new(LifecycleState::Idle, StatusLevel::Grey, "Connecting...")
    }

    /// Status after a clean teardown.
    pub fn disconnected() -> Self {
        Self::new(LifecycleState::Idle, StatusLevel::Grey, "Disconnected")
    }

    /// Whether this status reports a fatal error.
    pub fn is_fatal(&self) -> bool {
        self.level == StatusLevel::Red
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::idle()
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {} ({})", self.level, self.text, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        let status = SessionStatus::new(
            LifecycleState::Active,
            StatusLevel::Green,
            "Logged in as ada",
        );
        assert_eq!(status.to_string(), "[Green] Logged in as ada (active)");
        assert!(!status.is_fatal());
    }

    #[test]
    fn test_defaults() {
        assert_eq!(SessionStatus::default().state, LifecycleState::Idle);
        assert_eq!(SessionStatus::disconnected().level, StatusLevel::Grey);
    }
}
