use std::fmt;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Transport accepted, no address registered yet
    Created,
    /// First registration in progress
    Registering,
    /// Registered and exchanging messages
    Active,
    /// Explicit unregister in progress
    Unregistering,
    /// Terminal
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "CREATED"),
            SessionState::Registering => write!(f, "REGISTERING"),
            SessionState::Active => write!(f, "ACTIVE"),
            SessionState::Unregistering => write!(f, "UNREGISTERING"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

impl SessionState {
    /// Whether `self -> to` is a legal transition.
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, to),
            (Created, Registering)
                | (Registering, Active)
                | (Active, Unregistering)
                // unregister vetoed
                | (Unregistering, Active)
                | (Created | Registering | Active | Unregistering, Closed)
        )
    }

    /// Whether the session may send and publish.
    pub fn can_send(self) -> bool {
        matches!(self, Self::Created | Self::Active)
    }

    /// Whether outbound deliveries are still accepted.
    pub fn can_receive(self) -> bool {
        matches!(self, Self::Active | Self::Unregistering)
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}
