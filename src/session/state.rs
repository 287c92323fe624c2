use std::fmt;

/// Lifecycle of a connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Draining,
    Closed,
}

impl SessionState {
    /// Whether `self -> next` is a legal move. `Connecting -> Closed` covers
    /// rejected handshakes.
    pub fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Active) | (Connecting, Closed) | (Active, Draining) | (Draining, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}
